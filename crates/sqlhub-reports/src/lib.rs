//! SQLHub Reports - parallel component execution with result caching
//!
//! A report is a batch of components executed under one request by a
//! fixed worker pool. Results are cached under SHA-256 keys with TTL and
//! byte-budgeted LRU eviction; a pre-query COUNT(*) fails oversized
//! components before any row is fetched.

mod cache;
mod executor;
mod types;

pub use cache::{CachedComponent, ReportCache, ReportCacheStats, cache_key};
pub use executor::ReportExecutor;
pub use types::{ComponentStatus, ReportComponent, ReportComponentResult, ReportRequest};
