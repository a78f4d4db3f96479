//! Workload-weight classification. The label feeds scheduling weights
//! and pre-warm pool selection; it never rejects a request.

use std::time::Duration;

use tracing::trace;

use warden_model::{HeatLevel, SandboxRequest, metadata_keys};

pub trait HeatClassifier: Send + Sync {
    fn classify(&self, request: &SandboxRequest) -> HeatLevel;
}

/// Per-band ceilings; a request crossing any dimension of a band is
/// pushed into the next one up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeatBand {
    pub cpu_millis: u64,
    pub memory_mb: u64,
    pub ttl: Duration,
}

impl HeatBand {
    fn holds(&self, request: &SandboxRequest) -> bool {
        request.resources.cpu_millis <= self.cpu_millis
            && request.resources.memory_mb <= self.memory_mb
            && request.resources.ttl <= self.ttl
    }
}

/// Threshold table per band. Everything above Hot is Inferno.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeatThresholds {
    pub cold: HeatBand,
    pub warm: HeatBand,
    pub hot: HeatBand,
}

impl Default for HeatThresholds {
    fn default() -> Self {
        Self {
            cold: HeatBand {
                cpu_millis: 500,
                memory_mb: 512,
                ttl: Duration::from_secs(30),
            },
            warm: HeatBand {
                cpu_millis: 1500,
                memory_mb: 1024,
                ttl: Duration::from_secs(180),
            },
            hot: HeatBand {
                cpu_millis: 3000,
                memory_mb: 4096,
                ttl: Duration::from_secs(600),
            },
        }
    }
}

/// Default classifier: explicit `heat_hint` metadata wins, then the
/// threshold table, then Cold.
#[derive(Debug, Default)]
pub struct ThresholdClassifier {
    thresholds: HeatThresholds,
}

impl ThresholdClassifier {
    pub fn new(thresholds: HeatThresholds) -> Self {
        Self { thresholds }
    }
}

impl HeatClassifier for ThresholdClassifier {
    fn classify(&self, request: &SandboxRequest) -> HeatLevel {
        if let Some(hint) = request.metadata.get(metadata_keys::HEAT_HINT) {
            match hint.parse::<HeatLevel>() {
                Ok(level) => return level,
                Err(_) => {
                    trace!(hint, request = %request.id, "unparseable heat hint, using thresholds");
                }
            }
        }

        if self.thresholds.cold.holds(request) {
            HeatLevel::Cold
        } else if self.thresholds.warm.holds(request) {
            HeatLevel::Warm
        } else if self.thresholds.hot.holds(request) {
            HeatLevel::Hot
        } else {
            HeatLevel::Inferno
        }
    }
}
