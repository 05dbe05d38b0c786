//! Pool statistics

use serde::{Deserialize, Serialize};

/// Snapshot of a connection pool's current state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct PoolStats {
    /// Total connections (idle + active)
    pub total: usize,
    /// Idle connections available for reuse
    pub idle: usize,
    /// Connections currently borrowed
    pub active: usize,
    /// Requests waiting for a connection
    pub waiting: usize,
}

impl PoolStats {
    pub fn new(total: usize, idle: usize, active: usize, waiting: usize) -> Self {
        Self {
            total,
            idle,
            active,
            waiting,
        }
    }

    /// Pool utilization in the range 0.0 to 1.0
    pub fn utilization(&self) -> f64 {
        if self.total == 0 {
            0.0
        } else {
            self.active as f64 / self.total as f64
        }
    }
}
