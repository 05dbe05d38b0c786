//! Pool configuration

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Configuration for a connection pool.
///
/// Controls sizing, acquire timeout and connection lifecycle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolConfig {
    /// Maximum number of open connections
    max_open: usize,
    /// Maximum number of idle connections kept for reuse
    max_idle: usize,
    /// Timeout in milliseconds when acquiring a connection
    acquire_timeout_ms: u64,
    /// Idle connections older than this are closed on reuse
    idle_timeout_ms: u64,
    /// Connections older than this are recycled regardless of use
    max_lifetime_ms: Option<u64>,
}

impl PoolConfig {
    /// Create a pool configuration with the given open/idle bounds.
    ///
    /// # Panics
    ///
    /// Panics if `max_open` is 0 or `max_idle > max_open`.
    pub fn new(max_open: usize, max_idle: usize) -> Self {
        assert!(max_open > 0, "max_open must be greater than 0");
        assert!(
            max_idle <= max_open,
            "max_idle ({}) cannot exceed max_open ({})",
            max_idle,
            max_open
        );
        Self {
            max_open,
            max_idle,
            acquire_timeout_ms: 30_000,
            idle_timeout_ms: 600_000,
            max_lifetime_ms: None,
        }
    }

    /// Set the acquire timeout in milliseconds
    pub fn with_acquire_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.acquire_timeout_ms = timeout_ms;
        self
    }

    /// Set the idle timeout in milliseconds
    pub fn with_idle_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.idle_timeout_ms = timeout_ms;
        self
    }

    /// Set the maximum connection lifetime in milliseconds
    pub fn with_max_lifetime_ms(mut self, lifetime_ms: u64) -> Self {
        self.max_lifetime_ms = Some(lifetime_ms);
        self
    }

    pub fn max_open(&self) -> usize {
        self.max_open
    }

    pub fn max_idle(&self) -> usize {
        self.max_idle
    }

    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_millis(self.acquire_timeout_ms)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }

    pub fn max_lifetime(&self) -> Option<Duration> {
        self.max_lifetime_ms.map(Duration::from_millis)
    }
}

impl Default for PoolConfig {
    /// Defaults: 10 open, 4 idle, 30s acquire timeout, 10 minute idle timeout
    fn default() -> Self {
        Self::new(10, 4)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_chain() {
        let config = PoolConfig::new(5, 2)
            .with_acquire_timeout_ms(1_000)
            .with_max_lifetime_ms(60_000);
        assert_eq!(config.max_open(), 5);
        assert_eq!(config.acquire_timeout(), Duration::from_secs(1));
        assert_eq!(config.max_lifetime(), Some(Duration::from_secs(60)));
    }

    #[test]
    #[should_panic(expected = "max_idle")]
    fn test_idle_cannot_exceed_open() {
        let _ = PoolConfig::new(2, 3);
    }
}
