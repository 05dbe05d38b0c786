//! SQLHub Schema - TTL metadata cache
//!
//! Read-through cache of schema, table and column metadata per
//! connection. Concurrent misses for the same key collapse onto one
//! adapter call (singleflight); a failed refresh keeps the previous data
//! marked stale instead of dropping it.

mod cache;

pub use cache::{SchemaCache, SchemaCacheStats};
