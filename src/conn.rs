//! Connection contract

use std::io;
use std::net::Shutdown;

/// Anything the pool can hold
///
/// The pool treats connections opaquely: the only thing it ever does with
/// one besides handing it out is close it.
pub trait Connection: Send + 'static {
    /// Close the connection for good
    fn close(self) -> io::Result<()>;
}

/// Shutdown of a socket whose peer already hung up is not a failure
fn ignore_not_connected(result: io::Result<()>) -> io::Result<()> {
    match result {
        Err(e) if e.kind() == io::ErrorKind::NotConnected => Ok(()),
        other => other,
    }
}

impl Connection for std::net::TcpStream {
    fn close(self) -> io::Result<()> {
        ignore_not_connected(self.shutdown(Shutdown::Both))
    }
}

#[cfg(unix)]
impl Connection for std::os::unix::net::UnixStream {
    fn close(self) -> io::Result<()> {
        ignore_not_connected(self.shutdown(Shutdown::Both))
    }
}

impl Connection for tokio::net::TcpStream {
    fn close(self) -> io::Result<()> {
        // dropping deregisters and closes the socket
        drop(self);
        Ok(())
    }
}
