//! Borrowed connection wrapper

use std::fmt;
use std::io;
use std::mem::ManuallyDrop;
use std::ops::{Deref, DerefMut};
use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tracing::warn;

use crate::conn::Connection;
use crate::error::{Error, Result};
use crate::pool::{Pool, discard};

/// Connection on loan from a [`Pool`]
///
/// Reads and writes go straight to the underlying connection. Closing (or
/// dropping) the wrapper hands the connection back to the pool rather than
/// closing it.
pub struct PooledConn<C: Connection> {
    /// taken exactly once, by release or detach
    conn: ManuallyDrop<C>,
    pool: Pool<C>,
    /// set once `conn` has been taken
    released: bool,
    /// close for real on release
    unusable: bool,
}

impl<C: Connection> PooledConn<C> {
    pub(crate) fn new(pool: Pool<C>, conn: C) -> Self {
        Self {
            conn: ManuallyDrop::new(conn),
            pool,
            released: false,
            unusable: false,
        }
    }

    fn take_conn(&mut self) -> Option<C> {
        if self.released {
            return None;
        }
        self.released = true;
        // safety: `released` guards against a second take, and it is only
        // set from paths that consume the wrapper, so `conn` is never read
        // afterwards
        Some(unsafe { ManuallyDrop::take(&mut self.conn) })
    }

    /// Return the connection to its pool
    ///
    /// # Errors
    ///
    /// Returns [`Error::Close`] if the connection had to be closed (pool full,
    /// pool shut down, or marked unusable) and closing it failed.
    pub fn close(mut self) -> Result<()> {
        self.release()
    }

    /// Close the underlying connection on release instead of pooling it
    ///
    /// Use this after an I/O error leaves the connection in an unknown state.
    pub fn mark_unusable(&mut self) {
        self.unusable = true;
    }

    pub fn is_unusable(&self) -> bool {
        self.unusable
    }

    /// Take the connection out of the pool's hands for good
    ///
    /// It still counts against the pool's creation cap.
    pub fn detach(mut this: Self) -> C {
        this.released = true;
        // safety: a live wrapper always holds its connection, and `released`
        // keeps Drop from touching it again
        unsafe { ManuallyDrop::take(&mut this.conn) }
    }

    /// Pool this connection was borrowed from
    pub fn pool(this: &Self) -> &Pool<C> {
        &this.pool
    }

    fn release(&mut self) -> Result<()> {
        let conn = self.take_conn();
        if self.unusable {
            return match conn {
                Some(conn) => discard(conn),
                None => Err(Error::NilConnection),
            };
        }
        self.pool.put(conn)
    }
}

impl<C: Connection> Drop for PooledConn<C> {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        if let Err(e) = self.release() {
            warn!(error = %e, "failed to release pooled connection");
        }
    }
}

impl<C: Connection> Deref for PooledConn<C> {
    type Target = C;

    fn deref(&self) -> &C {
        &self.conn
    }
}

impl<C: Connection> DerefMut for PooledConn<C> {
    fn deref_mut(&mut self) -> &mut C {
        &mut self.conn
    }
}

impl<C: Connection> AsRef<C> for PooledConn<C> {
    fn as_ref(&self) -> &C {
        &self.conn
    }
}

impl<C: Connection> AsMut<C> for PooledConn<C> {
    fn as_mut(&mut self) -> &mut C {
        &mut self.conn
    }
}

impl<C: Connection + fmt::Debug> fmt::Debug for PooledConn<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PooledConn")
            .field("conn", &*self.conn)
            .field("unusable", &self.unusable)
            .finish_non_exhaustive()
    }
}

impl<C: Connection + io::Read> io::Read for PooledConn<C> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.conn.read(buf)
    }
}

impl<C: Connection + io::Write> io::Write for PooledConn<C> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.conn.write(buf)
    }

    fn write_vectored(&mut self, bufs: &[io::IoSlice<'_>]) -> io::Result<usize> {
        self.conn.write_vectored(bufs)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.conn.flush()
    }
}

impl<C: Connection + AsyncRead + Unpin> AsyncRead for PooledConn<C> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut *self.get_mut().conn).poll_read(cx, buf)
    }
}

impl<C: Connection + AsyncWrite + Unpin> AsyncWrite for PooledConn<C> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut *self.get_mut().conn).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut *self.get_mut().conn).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut *self.get_mut().conn).poll_shutdown(cx)
    }
}

#[cfg(test)]
mod test {
    use std::io::{Read, Write};
    use std::net::{TcpListener, TcpStream};
    use std::sync::atomic::Ordering;
    use std::thread;

    use super::PooledConn;
    use crate::pool::Pool;
    use crate::pool::test::Harness;

    /// Loopback echo server answering `count` connections
    fn echo_server(count: usize) -> std::net::SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        thread::spawn(move || {
            for stream in listener.incoming().take(count) {
                let mut stream = stream.unwrap();
                thread::spawn(move || {
                    let mut buf = [0u8; 1024];
                    loop {
                        match stream.read(&mut buf) {
                            Ok(0) | Err(_) => break,
                            Ok(n) => {
                                if stream.write_all(&buf[..n]).is_err() {
                                    break;
                                }
                            }
                        }
                    }
                });
            }
        });
        addr
    }

    #[test]
    fn drop_returns_connection() {
        let harness = Harness::default();
        let pool = harness.pool(0, 2);

        {
            let _conn = pool.get().unwrap();
            assert!(pool.is_empty());
        }
        assert_eq!(pool.len(), 1);
        assert_eq!(harness.closed(), 0);
    }

    #[test]
    fn unusable_connection_is_closed() {
        let harness = Harness::default();
        let pool = harness.pool(1, 1);

        let mut conn = pool.get().unwrap();
        conn.mark_unusable();
        assert!(conn.is_unusable());
        drop(conn);

        assert_eq!(harness.closed(), 1);
        assert!(pool.is_empty());
    }

    #[test]
    fn drop_after_shutdown_tolerates_close_failure() {
        let harness = Harness::default();
        harness.fail_close.store(true, Ordering::SeqCst);
        let pool = harness.pool(0, 1);
        let conn = pool.get().unwrap();

        pool.close();
        drop(conn);

        assert_eq!(harness.closed(), 1);
        assert!(pool.is_empty());
    }

    #[test]
    fn detached_connection_leaves_pool() {
        let harness = Harness::default();
        let pool = harness.pool(1, 2);

        let conn = pool.get().unwrap();
        let raw = PooledConn::detach(conn);
        assert_eq!(raw.id, 0);
        assert!(pool.is_empty());
        assert_eq!(pool.created(), 1);
        drop(raw);
        assert_eq!(harness.closed(), 0);
    }

    #[test]
    fn pool_back_reference() {
        let harness = Harness::default();
        let pool = harness.pool(1, 1);
        let conn = pool.get().unwrap();
        assert_eq!(PooledConn::pool(&conn).max_size(), 1);
    }

    #[test]
    fn tcp_io_passes_through() {
        let addr = echo_server(1);
        let pool = Pool::new(0, 1, move || TcpStream::connect(addr)).unwrap();

        let mut conn = pool.get().unwrap();
        conn.write_all(b"ping").unwrap();
        let mut buf = [0u8; 4];
        conn.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"ping");
        let local = conn.local_addr().unwrap();
        conn.close().unwrap();

        // same socket comes back and still works
        let mut conn = pool.get().unwrap();
        assert_eq!(conn.local_addr().unwrap(), local);
        conn.write_all(b"pong").unwrap();
        conn.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"pong");
    }

    mod async_io {
        use std::net::TcpStream;

        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        use super::echo_server;
        use crate::pool::Pool;

        #[tokio::test]
        async fn async_io_passes_through() {
            let addr = echo_server(1);
            let pool = Pool::new(0, 1, move || {
                let stream = TcpStream::connect(addr)?;
                stream.set_nonblocking(true)?;
                tokio::net::TcpStream::from_std(stream)
            })
            .unwrap();

            let mut conn = pool.get().unwrap();
            conn.write_all(b"hello").await.unwrap();
            let mut buf = [0u8; 5];
            conn.read_exact(&mut buf).await.unwrap();
            assert_eq!(&buf, b"hello");
            conn.close().unwrap();
            assert_eq!(pool.len(), 1);

            pool.close();
            assert!(pool.get().unwrap_err().is_closed());
        }
    }
}
