use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One sample of control-plane demand, keyed by unix second in the
/// history store.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct UsageRecord {
    pub timestamp: DateTime<Utc>,
    pub active_sandboxes: u64,
    pub queue_depth: u64,
    pub cpu_utilization: f64,
    pub memory_utilization: f64,
    pub launches: u64,
    pub errors: u64,
}

impl UsageRecord {
    pub fn at(timestamp: DateTime<Utc>, active_sandboxes: u64) -> Self {
        Self {
            timestamp,
            active_sandboxes,
            queue_depth: 0,
            cpu_utilization: 0.0,
            memory_utilization: 0.0,
            launches: 0,
            errors: 0,
        }
    }

    pub fn unix_second(&self) -> i64 {
        self.timestamp.timestamp()
    }

    /// The demand signal the forecaster trains on.
    pub fn demand(&self) -> f64 {
        self.active_sandboxes as f64
    }
}
