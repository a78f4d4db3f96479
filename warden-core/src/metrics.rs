//! Minimal metrics seam. Components emit named counters and gauges
//! through a shared sink; production wiring decides where they land.

use std::collections::HashMap;
use std::sync::Mutex;

use tracing::debug;

pub trait MetricsSink: Send + Sync {
    fn incr(&self, name: &str, by: u64);
    fn gauge(&self, name: &str, value: f64);
}

/// Default sink: counters land in the structured log stream at debug.
#[derive(Debug, Default)]
pub struct LogMetrics;

impl MetricsSink for LogMetrics {
    fn incr(&self, name: &str, by: u64) {
        debug!(metric = name, by, "counter");
    }

    fn gauge(&self, name: &str, value: f64) {
        debug!(metric = name, value, "gauge");
    }
}

/// In-memory sink for tests and snapshots.
#[derive(Debug, Default)]
pub struct MemoryMetrics {
    counters: Mutex<HashMap<String, u64>>,
    gauges: Mutex<HashMap<String, f64>>,
}

impl MemoryMetrics {
    pub fn counter(&self, name: &str) -> u64 {
        self.lock_counters().get(name).copied().unwrap_or(0)
    }

    pub fn gauge_value(&self, name: &str) -> Option<f64> {
        self.gauges
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(name)
            .copied()
    }

    fn lock_counters(&self) -> std::sync::MutexGuard<'_, HashMap<String, u64>> {
        self.counters.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl MetricsSink for MemoryMetrics {
    fn incr(&self, name: &str, by: u64) {
        let mut counters = self.lock_counters();
        *counters.entry(name.to_string()).or_default() += by;
    }

    fn gauge(&self, name: &str, value: f64) {
        let mut gauges = self.gauges.lock().unwrap_or_else(|e| e.into_inner());
        gauges.insert(name.to_string(), value);
    }
}
