//! Health status classification from ping latency

use serde::{Deserialize, Serialize};
use std::time::Duration;
use uuid::Uuid;

/// Health state of a connection pool
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    /// Ping succeeded with good latency
    Healthy,
    /// Ping succeeded but latency is elevated
    Degraded,
    /// Ping failed
    Down,
}

impl HealthStatus {
    /// Classify from latency using default thresholds
    pub fn from_latency(latency: Duration) -> Self {
        Self::from_latency_with_thresholds(latency, &HealthThresholds::default())
    }

    /// Classify from latency using custom thresholds
    pub fn from_latency_with_thresholds(latency: Duration, thresholds: &HealthThresholds) -> Self {
        if latency <= thresholds.healthy_threshold {
            HealthStatus::Healthy
        } else {
            HealthStatus::Degraded
        }
    }

    /// Whether the connection is usable at all
    pub fn is_usable(&self) -> bool {
        !matches!(self, HealthStatus::Down)
    }
}

/// Latency thresholds for classification
#[derive(Debug, Clone)]
pub struct HealthThresholds {
    /// Latency at or under this is healthy
    pub healthy_threshold: Duration,
}

impl Default for HealthThresholds {
    /// Default: healthy under 250ms, degraded above
    fn default() -> Self {
        Self {
            healthy_threshold: Duration::from_millis(250),
        }
    }
}

/// Outcome of one health check
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthReport {
    pub connection_id: Uuid,
    pub status: HealthStatus,
    /// Last ping round trip, absent when the ping failed before timing
    pub latency_ms: Option<u64>,
    /// Last ping error, present only when down
    pub error: Option<String>,
    pub checked_at: chrono::DateTime<chrono::Utc>,
}

impl HealthReport {
    pub fn up(connection_id: Uuid, latency: Duration, thresholds: &HealthThresholds) -> Self {
        Self {
            connection_id,
            status: HealthStatus::from_latency_with_thresholds(latency, thresholds),
            latency_ms: Some(latency.as_millis() as u64),
            error: None,
            checked_at: chrono::Utc::now(),
        }
    }

    pub fn down(connection_id: Uuid, error: impl Into<String>) -> Self {
        Self {
            connection_id,
            status: HealthStatus::Down,
            latency_ms: None,
            error: Some(error.into()),
            checked_at: chrono::Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_latency_classification() {
        assert_eq!(
            HealthStatus::from_latency(Duration::from_millis(50)),
            HealthStatus::Healthy
        );
        assert_eq!(
            HealthStatus::from_latency(Duration::from_millis(800)),
            HealthStatus::Degraded
        );
    }

    #[test]
    fn test_down_is_not_usable() {
        assert!(!HealthStatus::Down.is_usable());
        assert!(HealthStatus::Degraded.is_usable());
    }
}
