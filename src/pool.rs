//! Connection pools

use std::fmt;
use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_channel::{Receiver, Sender, TryRecvError, TrySendError};
use parking_lot::Mutex;
use tracing::{debug, trace, warn};

use crate::conn::Connection;
use crate::error::{Error, Result};
use crate::pooled::PooledConn;

/// Creates new raw connections on demand
pub type Factory<C> = Arc<dyn Fn() -> io::Result<C> + Send + Sync>;

/// Capacity settings for a pool
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolConfig {
    /// Connections created eagerly when the pool is built
    pub initial: usize,
    /// Maximum number of connections the pool will ever create
    pub max: usize,
}

impl PoolConfig {
    pub fn new(initial: usize, max: usize) -> Self {
        Self { initial, max }
    }

    /// # Errors
    ///
    /// Returns [`Error::InvalidCapacity`] if `max` is zero or `initial` exceeds `max`.
    pub fn validate(&self) -> Result<()> {
        if self.max == 0 || self.initial > self.max {
            return Err(Error::InvalidCapacity {
                initial: self.initial,
                max: self.max,
            });
        }
        Ok(())
    }
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self { initial: 0, max: 8 }
    }
}

/// Point-in-time view of pool counters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStatus {
    /// Connections sitting in the idle buffer
    pub idle: usize,
    /// Connections created over the lifetime of the pool
    pub created: usize,
    /// Creation cap
    pub max_size: usize,
    pub closed: bool,
}

/// References cleared on shutdown
struct PoolInner<C> {
    send: Sender<C>,
    recv: Receiver<C>,
    factory: Factory<C>,
}

impl<C> Clone for PoolInner<C> {
    fn clone(&self) -> Self {
        Self {
            send: self.send.clone(),
            recv: self.recv.clone(),
            factory: Arc::clone(&self.factory),
        }
    }
}

struct PoolShared<C> {
    /// `None` once the pool has been shut down
    inner: Mutex<Option<PoolInner<C>>>,
    /// creation ceiling, never decremented on return
    created: AtomicUsize,
    max: usize,
}

/// Bounded pool of reusable connections
///
/// Idle connections live in a bounded channel with room for `max` entries.
/// Borrowing never blocks: it either takes an idle connection, creates a new
/// one while fewer than `max` have been created, or fails with
/// [`Error::Exhausted`].
///
/// Handles are cheap to clone and all refer to the same pool.
pub struct Pool<C> {
    shared: Arc<PoolShared<C>>,
}

impl<C> Clone for Pool<C> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

/// Close a connection that will not go back into the pool
pub(crate) fn discard<C: Connection>(conn: C) -> Result<()> {
    conn.close().map_err(Error::Close)
}

impl<C: Connection> Pool<C> {
    /// Build a pool, eagerly creating `initial` connections
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidCapacity`] for bad capacity settings, or
    /// [`Error::Fill`] if the factory fails while filling. In the latter case
    /// every connection created so far is closed.
    pub fn new<F>(initial: usize, max: usize, factory: F) -> Result<Self>
    where
        F: Fn() -> io::Result<C> + Send + Sync + 'static,
    {
        Self::with_config(PoolConfig::new(initial, max), factory)
    }

    /// Same as [`Pool::new`], taking a [`PoolConfig`]
    ///
    /// # Errors
    ///
    /// See [`Pool::new`].
    pub fn with_config<F>(config: PoolConfig, factory: F) -> Result<Self>
    where
        F: Fn() -> io::Result<C> + Send + Sync + 'static,
    {
        config.validate()?;

        let factory: Factory<C> = Arc::new(factory);
        let (send, recv) = async_channel::bounded(config.max);
        let pool = Pool {
            shared: Arc::new(PoolShared {
                inner: Mutex::new(Some(PoolInner {
                    send,
                    recv,
                    factory: Arc::clone(&factory),
                })),
                created: AtomicUsize::new(config.initial),
                max: config.max,
            }),
        };
        pool.fill(&factory, config.initial)?;

        debug!(
            initial = config.initial,
            max = config.max,
            "connection pool created"
        );
        Ok(pool)
    }

    /// Eagerly create `count` idle connections
    ///
    /// Any failure shuts the pool down, closing everything created so far.
    fn fill(&self, factory: &Factory<C>, count: usize) -> Result<()> {
        for _ in 0..count {
            let filled = factory()
                .map_err(Error::Fill)
                .and_then(|conn| self.put(Some(conn)));
            if let Err(e) = filled {
                self.close();
                return Err(match e {
                    Error::Close(e) => Error::Fill(e),
                    other => other,
                });
            }
        }
        Ok(())
    }

    fn inner(&self) -> Option<PoolInner<C>> {
        self.shared.inner.lock().clone()
    }

    /// Reserve one creation slot, failing once `max` connections exist
    fn reserve_slot(&self) -> Result<usize> {
        let max = self.shared.max;
        self.shared
            .created
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (n < max).then_some(n + 1)
            })
            .map(|prev| prev + 1)
            .map_err(|_| Error::Exhausted)
    }

    /// Borrow a connection
    ///
    /// Returns an idle connection if there is one, otherwise creates a new
    /// one. Dropping or closing the returned wrapper gives the connection
    /// back to the pool.
    ///
    /// # Errors
    ///
    /// - [`Error::Closed`] if the pool has been shut down
    /// - [`Error::Exhausted`] if no connection is idle and the creation cap
    ///   has been reached
    /// - [`Error::Factory`] if creating a new connection failed
    pub fn get(&self) -> Result<PooledConn<C>> {
        let Some(inner) = self.inner() else {
            return Err(Error::Closed);
        };

        match inner.recv.try_recv() {
            Ok(conn) => {
                trace!("reusing idle connection");
                Ok(PooledConn::new(self.clone(), conn))
            }
            // shut down between the reference check and the receive
            Err(TryRecvError::Closed) => Err(Error::Closed),
            Err(TryRecvError::Empty) => {
                let created = self.reserve_slot()?;
                match (inner.factory)() {
                    Ok(conn) => {
                        debug!(created, max = self.shared.max, "created new connection");
                        Ok(PooledConn::new(self.clone(), conn))
                    }
                    Err(e) => {
                        self.shared.created.fetch_sub(1, Ordering::AcqRel);
                        Err(Error::Factory(e))
                    }
                }
            }
        }
    }

    /// Give a connection back to the pool
    ///
    /// The connection is closed instead if the pool is shut down or the idle
    /// buffer is full.
    pub(crate) fn put(&self, conn: Option<C>) -> Result<()> {
        let Some(conn) = conn else {
            return Err(Error::NilConnection);
        };

        let rejected = {
            let guard = self.shared.inner.lock();
            match guard.as_ref() {
                None => {
                    trace!("pool is closed, closing returned connection");
                    Some(conn)
                }
                Some(inner) => match inner.send.try_send(conn) {
                    Ok(()) => None,
                    Err(TrySendError::Full(conn)) => {
                        debug!("idle buffer is full, closing returned connection");
                        Some(conn)
                    }
                    Err(TrySendError::Closed(conn)) => Some(conn),
                },
            }
        };

        match rejected {
            None => Ok(()),
            Some(conn) => discard(conn),
        }
    }

    /// Shut the pool down, closing every idle connection
    ///
    /// Afterwards [`Pool::get`] fails with [`Error::Closed`] and returned
    /// connections are closed instead of pooled. Calling this again is a
    /// no-op.
    ///
    /// Failures to close idle connections are not reported to the caller;
    /// each one is logged at `warn` level.
    pub fn close(&self) {
        let Some(PoolInner {
            send,
            recv,
            factory,
        }) = self.shared.inner.lock().take()
        else {
            return;
        };
        drop(factory);
        send.close();

        let mut closed = 0usize;
        let mut failed = 0usize;
        while let Ok(conn) = recv.try_recv() {
            closed += 1;
            if let Err(e) = conn.close() {
                failed += 1;
                warn!(error = %e, "failed to close idle connection during shutdown");
            }
        }
        debug!(closed, failed, "connection pool shut down");
    }
}

impl<C> Pool<C> {
    /// Number of idle connections, 0 once closed
    pub fn len(&self) -> usize {
        self.shared
            .inner
            .lock()
            .as_ref()
            .map_or(0, |inner| inner.recv.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_closed(&self) -> bool {
        self.shared.inner.lock().is_none()
    }

    pub fn max_size(&self) -> usize {
        self.shared.max
    }

    /// Number of connections created so far, including ones since closed
    pub fn created(&self) -> usize {
        self.shared.created.load(Ordering::Acquire)
    }

    pub fn status(&self) -> PoolStatus {
        let guard = self.shared.inner.lock();
        PoolStatus {
            idle: guard.as_ref().map_or(0, |inner| inner.recv.len()),
            created: self.created(),
            max_size: self.shared.max,
            closed: guard.is_none(),
        }
    }
}

impl<C> fmt::Debug for Pool<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pool").field("status", &self.status()).finish()
    }
}
