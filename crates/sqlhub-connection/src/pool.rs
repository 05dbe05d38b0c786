//! Bounded connection pooling

mod config;
mod inner;
mod stats;

pub use config::PoolConfig;
pub use inner::{ConnectionFactory, ConnectionPool, PooledConnection};
pub use stats::PoolStats;
