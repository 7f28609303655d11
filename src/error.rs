//! Pool errors

use std::io;

/// Errors reported by the pool and by pooled connections
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Capacity settings rejected at construction
    #[error("invalid capacity settings (initial = {initial}, max = {max})")]
    InvalidCapacity { initial: usize, max: usize },
    /// Factory failed while eagerly filling a new pool
    #[error("conn is not able to fill the pool: {0}")]
    Fill(#[source] io::Error),
    /// Pool has been shut down
    #[error("pool is closed")]
    Closed,
    /// Creation cap reached and no idle connection is available
    #[error("pool is exhausted")]
    Exhausted,
    /// Factory failed while creating a connection on demand
    #[error("failed to create connection: {0}")]
    Factory(#[source] io::Error),
    /// Tried to return a connection that is not there
    #[error("connection is nil, rejecting")]
    NilConnection,
    /// Closing a connection failed
    #[error("failed to close connection: {0}")]
    Close(#[source] io::Error),
}

impl Error {
    /// true if this is the "pool closed" sentinel
    pub fn is_closed(&self) -> bool {
        matches!(self, Error::Closed)
    }

    /// true if this is the "pool exhausted" sentinel
    pub fn is_exhausted(&self) -> bool {
        matches!(self, Error::Exhausted)
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
