//! SQLHub Drivers - registry of database adapters
//!
//! Maps `DatabaseKind` to driver factories. New engines plug in by
//! implementing the `DatabaseDriver` capability set from `sqlhub-core`
//! and registering here.

mod registry;

pub use registry::DriverRegistry;

#[cfg(feature = "postgres")]
pub use sqlhub_driver_postgres as postgres;

#[cfg(feature = "mysql")]
pub use sqlhub_driver_mysql as mysql;

#[cfg(feature = "sqlite")]
pub use sqlhub_driver_sqlite as sqlite;
