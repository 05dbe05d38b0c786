//! SQLHub Core - Core abstractions for the multi-database federation engine
//!
//! This crate provides the fundamental traits and types that all other
//! SQLHub crates depend on. It defines:
//!
//! - `DatabaseDriver` - Trait for database adapter implementations
//! - `Connection` - Trait for live database connections
//! - `SchemaIntrospection` - Trait for schema metadata inspection
//! - `SqlDialect` - Engine-specific quoting, placeholders and defaults
//! - `EventBus` - Typed lifecycle event fan-out
//! - Common types like `Value`, `Row`, `QueryResult`, `EngineError`

mod config;
mod connection;
mod dialect;
mod driver;
mod error;
mod events;
mod schema;
mod types;

pub use config::*;
pub use connection::*;
pub use dialect::*;
pub use driver::*;
pub use error::*;
pub use events::*;
pub use schema::*;
pub use types::*;
