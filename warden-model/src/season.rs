use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::{SeasonId, TemplateId};
use crate::request::duration_secs;

/// Explicit activation window. Takes priority over cron patterns when
/// both are configured.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeRange {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl TimeRange {
    pub fn contains(&self, instant: DateTime<Utc>) -> bool {
        instant >= self.start && instant < self.end
    }
}

/// When a season applies. Cron gates follow the reduced `"m h dom mon dow"`
/// form: activation is matched on hour-of-day and day-of-week, after
/// converting the instant into `timezone` (a fixed offset such as
/// `"+02:00"`, or `"UTC"`).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeasonSchedule {
    #[serde(default)]
    pub start_cron: Option<String>,
    #[serde(default)]
    pub end_cron: Option<String>,
    #[serde(default)]
    pub time_ranges: Vec<TimeRange>,
    #[serde(default)]
    pub timezone: Option<String>,
}

/// Pool kept warm ahead of predicted demand.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrewarmConfig {
    #[serde(default)]
    pub templates: Vec<TemplateId>,
    #[serde(default)]
    pub pool_size: u32,
    /// How far ahead of predicted demand capacity should be ready.
    #[serde(with = "duration_secs", default = "Duration::default")]
    pub lead_time: Duration,
}

/// Conditions under which sleeping sandboxes are woken.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WakeTrigger {
    DemandSpike,
    Scheduled,
    QueueDepth,
    /// API-driven only; the hibernation controller never acts on it.
    Manual,
}

/// Idle-hibernation behaviour inside and outside scheduled windows.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HibernationConfig {
    pub enabled: bool,
    /// Idle threshold applied outside scheduled windows.
    #[serde(with = "duration_secs")]
    pub idle_timeout: Duration,
    /// Whether the start/end cron window applies.
    pub scheduled: bool,
    #[serde(default)]
    pub start_cron: Option<String>,
    #[serde(default)]
    pub end_cron: Option<String>,
    /// Sandboxes kept warm while a scheduled window is active.
    pub min_warm_pool: u32,
    #[serde(default)]
    pub wake_triggers: Vec<WakeTrigger>,
    /// Sleepers are pre-woken this far before a window closes.
    #[serde(with = "duration_secs", default = "Duration::default")]
    pub wake_lead_time: Duration,
}

impl Default for HibernationConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            idle_timeout: Duration::from_secs(300),
            scheduled: false,
            start_cron: None,
            end_cron: None,
            min_warm_pool: 0,
            wake_triggers: Vec::new(),
            wake_lead_time: Duration::default(),
        }
    }
}

/// A time-scoped capacity configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Season {
    pub id: SeasonId,
    pub schedule: SeasonSchedule,
    pub min_nodes: u32,
    pub max_nodes: u32,
    pub target_utilization: f64,
    #[serde(default)]
    pub prewarm: PrewarmConfig,
    #[serde(default)]
    pub hibernation: Option<HibernationConfig>,
}

impl Season {
    /// Sanity bounds checked at registration; violations are fatal
    /// configuration errors.
    pub fn validate(&self) -> crate::error::Result<()> {
        if self.min_nodes > self.max_nodes {
            return Err(crate::error::ModelError::InvalidField(format!(
                "season {}: min_nodes {} exceeds max_nodes {}",
                self.id, self.min_nodes, self.max_nodes
            )));
        }
        if !(self.target_utilization > 0.0 && self.target_utilization <= 1.0) {
            return Err(crate::error::ModelError::InvalidField(format!(
                "season {}: target_utilization must be in (0, 1], got {}",
                self.id, self.target_utilization
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn season(min: u32, max: u32, util: f64) -> Season {
        Season {
            id: SeasonId::from("weekday-peak"),
            schedule: SeasonSchedule::default(),
            min_nodes: min,
            max_nodes: max,
            target_utilization: util,
            prewarm: PrewarmConfig::default(),
            hibernation: None,
        }
    }

    #[test]
    fn validate_rejects_inverted_bounds() {
        assert!(season(5, 2, 0.8).validate().is_err());
        assert!(season(2, 5, 0.8).validate().is_ok());
    }

    #[test]
    fn validate_rejects_bad_utilization() {
        assert!(season(0, 10, 0.0).validate().is_err());
        assert!(season(0, 10, 1.5).validate().is_err());
        assert!(season(0, 10, 1.0).validate().is_ok());
    }

    #[test]
    fn time_range_is_half_open() {
        let start = Utc::now();
        let end = start + chrono::Duration::hours(1);
        let range = TimeRange { start, end };
        assert!(range.contains(start));
        assert!(!range.contains(end));
    }
}
