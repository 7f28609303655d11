//! Bounded pool of reusable network connections
//!
//! A [`Pool`] lends out idle connections, creates new ones through a
//! caller-supplied factory up to a fixed creation cap, and takes them back
//! when the borrowed [`PooledConn`] is closed or dropped.

pub mod common;
pub mod conn;
pub mod error;
pub mod pool;
pub mod pooled;

pub use crate::conn::Connection;
pub use crate::error::{Error, Result};
pub use crate::pool::{Factory, Pool, PoolConfig, PoolStatus};
pub use crate::pooled::PooledConn;
