//! Engine configuration sections

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Query executor limits and timeouts
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutorConfig {
    /// Applied when the caller supplies no timeout
    pub default_timeout_ms: u64,
    /// Hard ceiling on rows any single result may carry
    pub max_result_limit: u64,
    /// Applied when the caller supplies no limit
    pub default_limit: u64,
}

impl ExecutorConfig {
    pub fn default_timeout(&self) -> Duration {
        Duration::from_millis(self.default_timeout_ms)
    }

    pub fn with_max_result_limit(mut self, limit: u64) -> Self {
        self.max_result_limit = limit;
        self
    }

    pub fn with_default_limit(mut self, limit: u64) -> Self {
        self.default_limit = limit;
        self
    }
}

impl Default for ExecutorConfig {
    /// Defaults: 30s timeout, 50_000 row ceiling, 1_000 row default limit
    fn default() -> Self {
        Self {
            default_timeout_ms: 30_000,
            max_result_limit: 50_000,
            default_limit: 1_000,
        }
    }
}

/// Report executor sizing and caching
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReportConfig {
    /// Fixed worker pool size
    pub worker_limit: usize,
    /// Byte budget for the result cache
    pub cache_max_bytes: u64,
    /// Per-component execution deadline
    pub component_timeout_ms: u64,
    /// Cache TTL applied when a component does not specify one
    pub default_cache_seconds: u64,
}

impl ReportConfig {
    pub fn component_timeout(&self) -> Duration {
        Duration::from_millis(self.component_timeout_ms)
    }

    pub fn with_worker_limit(mut self, workers: usize) -> Self {
        self.worker_limit = workers.max(1);
        self
    }

    pub fn with_cache_max_bytes(mut self, bytes: u64) -> Self {
        self.cache_max_bytes = bytes;
        self
    }
}

impl Default for ReportConfig {
    /// Defaults: 5 workers, 64 MiB cache, 5 minute component timeout
    fn default() -> Self {
        Self {
            worker_limit: 5,
            cache_max_bytes: 64 * 1024 * 1024,
            component_timeout_ms: 300_000,
            default_cache_seconds: 60,
        }
    }
}

/// Schema metadata cache TTLs
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchemaCacheConfig {
    /// TTL for schema and table lists
    pub schema_ttl_ms: u64,
    /// TTL for per-table column details
    pub column_ttl_ms: u64,
}

impl SchemaCacheConfig {
    pub fn schema_ttl(&self) -> Duration {
        Duration::from_millis(self.schema_ttl_ms)
    }

    pub fn column_ttl(&self) -> Duration {
        Duration::from_millis(self.column_ttl_ms)
    }

    /// Config with both TTLs set to the same value
    pub fn uniform(ttl: Duration) -> Self {
        let ms = ttl.as_millis() as u64;
        Self {
            schema_ttl_ms: ms,
            column_ttl_ms: ms,
        }
    }
}

impl Default for SchemaCacheConfig {
    /// Defaults: 5 minutes for lists, 3 minutes for columns
    fn default() -> Self {
        Self {
            schema_ttl_ms: 300_000,
            column_ttl_ms: 180_000,
        }
    }
}

/// Federated execution limits
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FederationConfig {
    /// Maximum concurrent per-connection fetches in one multi-query
    pub fanout_limit: usize,
    /// Row cap applied to each per-connection fetch
    pub fetch_row_cap: u64,
    /// Deadline for a whole multi-query when the caller supplies none
    pub default_timeout_ms: u64,
}

impl FederationConfig {
    pub fn default_timeout(&self) -> Duration {
        Duration::from_millis(self.default_timeout_ms)
    }

    pub fn with_fanout_limit(mut self, limit: usize) -> Self {
        self.fanout_limit = limit.max(1);
        self
    }
}

impl Default for FederationConfig {
    /// Defaults: 8 parallel fetches, 50_000 row fetch cap, 60s deadline
    fn default() -> Self {
        Self {
            fanout_limit: 8,
            fetch_row_cap: 50_000,
            default_timeout_ms: 60_000,
        }
    }
}

/// Editable-metadata job retention
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobConfig {
    /// How long completed/failed jobs stay visible before garbage collection
    pub retention_ms: u64,
}

impl JobConfig {
    pub fn retention(&self) -> Duration {
        Duration::from_millis(self.retention_ms)
    }
}

impl Default for JobConfig {
    /// Default: completed jobs retained for 10 minutes
    fn default() -> Self {
        Self {
            retention_ms: 600_000,
        }
    }
}

/// Top-level engine configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EngineConfig {
    pub executor: ExecutorConfig,
    pub report: ReportConfig,
    pub schema_cache: SchemaCacheConfig,
    pub federation: FederationConfig,
    pub jobs: JobConfig,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_documented_values() {
        let config = EngineConfig::default();
        assert_eq!(config.executor.max_result_limit, 50_000);
        assert_eq!(config.report.worker_limit, 5);
        assert_eq!(config.report.component_timeout(), Duration::from_secs(300));
        assert_eq!(config.schema_cache.schema_ttl(), Duration::from_secs(300));
        assert_eq!(config.federation.fanout_limit, 8);
    }

    #[test]
    fn test_worker_limit_floor() {
        let config = ReportConfig::default().with_worker_limit(0);
        assert_eq!(config.worker_limit, 1);
    }
}
