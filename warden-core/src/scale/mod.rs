//! Seasonal capacity planning: season activation, reactive + predictive
//! recommendations, budget enforcement, and the periodic scaler loop.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use warden_model::{Season, UsageRecord};

use crate::error::{Result, WardenError};
use crate::forecast::{DemandForecaster, HybridForecaster, UsageHistory};
use crate::queue::SharedQueue;
use crate::registry::Registry;

pub mod cron;
mod hibernate;
mod spend;

pub use cron::{CronGate, CronWindow};
pub use hibernate::{
    HibernationController, HibernationLoop, HibernationPlan, Hypnos, IdleSource,
    SandboxIdleState, SleepingRecord,
};
pub use spend::{InMemorySpendLog, RedisSpendLog, SpendLog};

/// Capacity recommendation handed to provisioning.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Recommendation {
    /// Live node count at evaluation time.
    pub current: u32,
    pub recommended: u32,
    pub reason: String,
    /// `(recommended - current) * cost_per_node_hour`; negative when
    /// scaling in.
    pub cost_delta: f64,
    pub confidence: f64,
    /// Set when spending crossed the alert threshold (or a hard cap bit).
    #[serde(default)]
    pub alert: bool,
}

/// A season with its schedule gates parsed up front; bad cron or timezone
/// strings are fatal at registration.
#[derive(Debug, Clone)]
struct ArmedSeason {
    season: Season,
    window: Option<CronWindow>,
}

/// Resolves which season applies at an instant. Explicit time ranges take
/// priority over cron windows, across all registered seasons.
#[derive(Debug, Clone, Default)]
pub struct SeasonActivator {
    seasons: Vec<ArmedSeason>,
}

impl SeasonActivator {
    pub fn new(seasons: Vec<Season>) -> Result<Self> {
        let mut armed = Vec::with_capacity(seasons.len());
        for season in seasons {
            season.validate()?;
            let window = match (&season.schedule.start_cron, &season.schedule.end_cron) {
                (Some(start), Some(end)) => Some(CronWindow::new(
                    start,
                    end,
                    season.schedule.timezone.as_deref(),
                )?),
                (None, None) => None,
                _ => {
                    return Err(WardenError::InvalidConfig(format!(
                        "season {}: start_cron and end_cron must be set together",
                        season.id
                    )));
                }
            };
            armed.push(ArmedSeason { season, window });
        }
        Ok(Self { seasons: armed })
    }

    pub fn active(&self, now: DateTime<Utc>) -> Option<&Season> {
        // Pass one: explicit ranges.
        for armed in &self.seasons {
            if armed
                .season
                .schedule
                .time_ranges
                .iter()
                .any(|range| range.contains(now))
            {
                return Some(&armed.season);
            }
        }
        // Pass two: cron windows.
        for armed in &self.seasons {
            if armed.window.is_some_and(|window| window.contains(now)) {
                return Some(&armed.season);
            }
        }
        None
    }
}

/// Turns demand into a node-count recommendation for the active season.
#[derive(Debug, Clone, Copy)]
pub struct CapacityPlanner {
    cost_per_node_hour: f64,
}

impl CapacityPlanner {
    pub fn new(cost_per_node_hour: f64) -> Self {
        Self { cost_per_node_hour }
    }

    /// Reactive `ceil(active/u)`, upgraded to the predictive value when a
    /// pre-warm lead time is configured and the forecast at `now + lead`
    /// asks for more. Clamped to the season bounds, floor 1.
    pub fn recommend(
        &self,
        now: DateTime<Utc>,
        current_nodes: u32,
        active_sandboxes: u32,
        season: &Season,
        forecaster: &dyn DemandForecaster,
    ) -> Recommendation {
        let utilization = season.target_utilization;
        let reactive = (active_sandboxes as f64 / utilization).ceil() as u32;

        let mut recommended = reactive;
        let mut reason = format!("reactive: ceil({active_sandboxes}/{utilization})");
        let mut confidence = 1.0;

        let lead = season.prewarm.lead_time;
        if lead > Duration::ZERO {
            let predictions = forecaster.forecast(now, lead, 2);
            let lead_chrono =
                chrono::Duration::from_std(lead).unwrap_or_else(|_| chrono::Duration::zero());
            if let Some(prediction) = predictions
                .iter()
                .find(|p| p.at >= now + lead_chrono)
            {
                let predictive = (prediction.demand / utilization).ceil() as u32;
                if predictive > recommended {
                    recommended = predictive;
                    reason = format!(
                        "predictive: demand {:.1} expected at {}",
                        prediction.demand, prediction.at
                    );
                    confidence = prediction.confidence;
                }
            }
        }

        let clamped = recommended
            .clamp(season.min_nodes, season.max_nodes)
            .max(1);
        if clamped != recommended {
            reason = format!("{reason}; clamped to [{}, {}]", season.min_nodes, season.max_nodes);
        }

        Recommendation {
            current: current_nodes,
            recommended: clamped,
            reason,
            cost_delta: (clamped as f64 - current_nodes as f64) * self.cost_per_node_hour,
            confidence,
            alert: false,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct BudgetConfig {
    pub daily_limit: f64,
    pub monthly_limit: f64,
    /// Fraction of a limit at which the alert flag is raised.
    pub alert_threshold: f64,
    /// When on, recommendations are capped to the remaining budget.
    pub hard_cap: bool,
    pub cost_per_node_hour: f64,
}

impl BudgetConfig {
    pub fn validate(&self) -> Result<()> {
        if self.cost_per_node_hour <= 0.0 {
            return Err(WardenError::InvalidConfig(
                "cost_per_node_hour must be positive".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&self.alert_threshold) {
            return Err(WardenError::InvalidConfig(
                "alert_threshold must be in [0, 1]".to_string(),
            ));
        }
        Ok(())
    }
}

/// Wraps recommendations with budget awareness.
pub struct BudgetEnforcer {
    config: BudgetConfig,
    log: Arc<dyn SpendLog>,
}

impl std::fmt::Debug for BudgetEnforcer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BudgetEnforcer")
            .field("config", &self.config)
            .finish()
    }
}

impl BudgetEnforcer {
    pub fn new(config: BudgetConfig, log: Arc<dyn SpendLog>) -> Result<Self> {
        config.validate()?;
        Ok(Self { config, log })
    }

    pub async fn enforce(
        &self,
        now: DateTime<Utc>,
        mut recommendation: Recommendation,
    ) -> Result<Recommendation> {
        let daily_spend = self
            .log
            .spend_since(now - chrono::Duration::hours(24))
            .await?;
        let monthly_spend = self
            .log
            .spend_since(now - chrono::Duration::days(30))
            .await?;

        let remaining = (self.config.daily_limit - daily_spend)
            .min(self.config.monthly_limit - monthly_spend)
            .max(0.0);

        if self.config.hard_cap {
            let cap = (remaining / self.config.cost_per_node_hour).floor() as u32;
            if recommendation.recommended > cap {
                info!(
                    recommended = recommendation.recommended,
                    cap, "capacity recommendation capped by budget"
                );
                recommendation.recommended = cap;
                recommendation.reason =
                    format!("{}; budget-capped to {cap}", recommendation.reason);
                recommendation.alert = true;
                recommendation.cost_delta = (cap as f64 - recommendation.current as f64)
                    * self.config.cost_per_node_hour;
            }
        }

        if daily_spend >= self.config.alert_threshold * self.config.daily_limit
            || monthly_spend >= self.config.alert_threshold * self.config.monthly_limit
        {
            recommendation.alert = true;
        }

        Ok(recommendation)
    }
}

/// Periodic evaluation loop: samples the registry, trains the forecaster
/// on history, publishes the latest recommendation on a watch channel.
/// The manager only ever reads that channel; there is no back-edge.
pub struct ScalerLoop {
    registry: Arc<dyn Registry>,
    history: Arc<dyn UsageHistory>,
    activator: SeasonActivator,
    planner: CapacityPlanner,
    budget: Option<BudgetEnforcer>,
    queue: Option<SharedQueue>,
    interval: Duration,
    tx: watch::Sender<Option<Recommendation>>,
}

impl std::fmt::Debug for ScalerLoop {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScalerLoop")
            .field("interval", &self.interval)
            .field("budgeted", &self.budget.is_some())
            .finish()
    }
}

impl ScalerLoop {
    pub fn new(
        registry: Arc<dyn Registry>,
        history: Arc<dyn UsageHistory>,
        activator: SeasonActivator,
        planner: CapacityPlanner,
        interval: Duration,
    ) -> (Self, watch::Receiver<Option<Recommendation>>) {
        let (tx, rx) = watch::channel(None);
        (
            Self {
                registry,
                history,
                activator,
                planner,
                budget: None,
                queue: None,
                interval,
                tx,
            },
            rx,
        )
    }

    pub fn with_budget(mut self, budget: BudgetEnforcer) -> Self {
        self.budget = Some(budget);
        self
    }

    pub fn with_queue(mut self, queue: SharedQueue) -> Self {
        self.queue = Some(queue);
        self
    }

    pub fn spawn(self, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.interval);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                // Individual evaluation failures are skipped, not fatal.
                if let Err(error) = self.evaluate_once(Utc::now()).await {
                    warn!(%error, "scaler evaluation failed");
                }
            }
            debug!("scaler loop stopped");
        })
    }

    /// One evaluation pass; public so tests and operators can drive it
    /// directly.
    pub async fn evaluate_once(&self, now: DateTime<Utc>) -> Result<()> {
        let nodes = self.registry.list_nodes().await?;
        let current_nodes = nodes.len() as u32;
        let active_sandboxes: u32 = nodes.iter().map(|n| n.sandbox_count() as u32).sum();

        let queue_depth = match &self.queue {
            Some(queue) => queue.depth().await.unwrap_or(0),
            None => 0,
        };

        let mut sample = UsageRecord::at(now, active_sandboxes as u64);
        sample.queue_depth = queue_depth;
        self.history.record(sample).await?;

        let Some(season) = self.activator.active(now) else {
            debug!("no active season; nothing to recommend");
            self.tx.send_replace(None);
            return Ok(());
        };

        let records = self.history.all().await?;
        let forecaster = HybridForecaster::train(&records);
        let mut recommendation =
            self.planner
                .recommend(now, current_nodes, active_sandboxes, season, &forecaster);
        if let Some(budget) = &self.budget {
            recommendation = budget.enforce(now, recommendation).await?;
        }

        debug!(
            current = recommendation.current,
            recommended = recommendation.recommended,
            reason = %recommendation.reason,
            "capacity recommendation"
        );
        self.tx.send_replace(Some(recommendation));
        Ok(())
    }
}
