//! SQLHub Connection - connection registry, pooling and health
//!
//! The `ConnectionManager` owns the `id -> Connection` map; every
//! registered connection exclusively owns one bounded pool, and executors
//! borrow pooled handles through the manager.

mod manager;
pub mod health;
pub mod pool;

pub use health::{HealthReport, HealthStatus, HealthThresholds};
pub use manager::{ConnectionInfo, ConnectionManager};
pub use pool::{ConnectionFactory, ConnectionPool, PoolConfig, PoolStats, PooledConnection};
