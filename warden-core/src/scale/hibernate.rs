//! Idle hibernation: decides which sandboxes to put to sleep and which
//! sleepers to wake, inside and outside scheduled windows. The "idle"
//! signal is externally supplied; executing the transitions goes through
//! the [`Hypnos`] capability.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use warden_model::{HibernationConfig, RunId, WakeTrigger};

use crate::error::Result;
use crate::queue::SharedQueue;

use super::Recommendation;
use super::cron::CronWindow;

/// Idle threshold applied while a scheduled window is open.
pub const WINDOW_IDLE_THRESHOLD: Duration = Duration::from_secs(10);

/// One active sandbox with its externally supplied idle signal.
#[derive(Debug, Clone, Copy)]
pub struct SandboxIdleState {
    pub run_id: RunId,
    /// None while the sandbox is doing work.
    pub idle_for: Option<Duration>,
}

/// One hibernated sandbox.
#[derive(Debug, Clone, Copy)]
pub struct SleepingRecord {
    pub run_id: RunId,
    pub since: DateTime<Utc>,
}

/// Executes hibernate/wake transitions against the data plane.
#[async_trait]
pub trait Hypnos: Send + Sync {
    async fn hibernate(&self, run_id: &RunId) -> Result<()>;

    async fn wake(&self, run_id: &RunId) -> Result<()>;
}

/// Supplies the controller's view of the world on each tick.
#[async_trait]
pub trait IdleSource: Send + Sync {
    async fn active_sandboxes(&self) -> Result<Vec<SandboxIdleState>>;

    async fn sleeping(&self) -> Result<Vec<SleepingRecord>>;
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HibernationPlan {
    pub hibernate: Vec<RunId>,
    pub wake: Vec<RunId>,
}

impl HibernationPlan {
    pub fn is_empty(&self) -> bool {
        self.hibernate.is_empty() && self.wake.is_empty()
    }
}

/// Pure decision logic; one instance per season hibernation config.
#[derive(Debug, Clone)]
pub struct HibernationController {
    config: HibernationConfig,
    window: Option<CronWindow>,
}

impl HibernationController {
    pub fn new(config: HibernationConfig) -> Result<Self> {
        let window = match (&config.start_cron, &config.end_cron) {
            (Some(start), Some(end)) => Some(CronWindow::new(start, end, None)?),
            _ => None,
        };
        Ok(Self { config, window })
    }

    fn in_window(&self, now: DateTime<Utc>) -> bool {
        self.config.scheduled
            && self
                .window
                .is_some_and(|window| window.contains(now))
    }

    /// Compute one tick's plan from the current config, instant, active
    /// set, sleeper set, demand recommendation, and queue depth.
    pub fn plan(
        &self,
        now: DateTime<Utc>,
        active: &[SandboxIdleState],
        sleeping: &[SleepingRecord],
        demand: Option<&Recommendation>,
        queue_depth: u64,
    ) -> HibernationPlan {
        if !self.config.enabled {
            return HibernationPlan::default();
        }

        let in_window = self.in_window(now);
        let hibernate = if in_window {
            // Inside the window: aggressive hibernation, but keep the warm
            // pool populated.
            let allowed = active
                .len()
                .saturating_sub(self.config.min_warm_pool as usize);
            let mut idle: Vec<&SandboxIdleState> = active
                .iter()
                .filter(|s| s.idle_for.is_some_and(|d| d > WINDOW_IDLE_THRESHOLD))
                .collect();
            // Longest-idle first when the warm pool forces a choice.
            idle.sort_by_key(|s| std::cmp::Reverse(s.idle_for));
            idle.into_iter()
                .take(allowed)
                .map(|s| s.run_id)
                .collect()
        } else {
            active
                .iter()
                .filter(|s| s.idle_for.is_some_and(|d| d > self.config.idle_timeout))
                .map(|s| s.run_id)
                .collect()
        };

        // Oldest sleepers wake first.
        let mut sleepers: Vec<&SleepingRecord> = sleeping.iter().collect();
        sleepers.sort_by_key(|s| s.since);

        let mut wake: Vec<RunId> = Vec::new();
        let mut woken: HashSet<RunId> = HashSet::new();
        let wake_n = |n: usize, wake: &mut Vec<RunId>, woken: &mut HashSet<RunId>| {
            for sleeper in sleepers.iter().take(n) {
                if woken.insert(sleeper.run_id) {
                    wake.push(sleeper.run_id);
                }
            }
        };

        for trigger in &self.config.wake_triggers {
            match trigger {
                WakeTrigger::DemandSpike => {
                    if let Some(rec) = demand
                        && rec.recommended > rec.current
                    {
                        let deficit = (rec.recommended - rec.current) as usize;
                        wake_n(deficit, &mut wake, &mut woken);
                    }
                }
                WakeTrigger::Scheduled => {
                    // Pre-wake everything shortly before the window closes.
                    if in_window
                        && let Some(window) = self.window
                    {
                        let lead = chrono::Duration::from_std(self.config.wake_lead_time)
                            .unwrap_or_else(|_| chrono::Duration::zero());
                        if !window.contains(now + lead) {
                            wake_n(sleepers.len(), &mut wake, &mut woken);
                        }
                    }
                }
                WakeTrigger::QueueDepth => {
                    if queue_depth > 0 {
                        wake_n(queue_depth as usize, &mut wake, &mut woken);
                    }
                }
                // Manual wake-ups are API-driven; nothing to do on a tick.
                WakeTrigger::Manual => {}
            }
        }

        HibernationPlan { hibernate, wake }
    }
}

/// Periodic tick executing the controller's plans through [`Hypnos`].
/// Per-sandbox failures are logged and skipped.
pub struct HibernationLoop {
    controller: HibernationController,
    source: Arc<dyn IdleSource>,
    hypnos: Arc<dyn Hypnos>,
    recommendations: watch::Receiver<Option<Recommendation>>,
    queue: Option<SharedQueue>,
    interval: Duration,
}

impl std::fmt::Debug for HibernationLoop {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HibernationLoop")
            .field("interval", &self.interval)
            .finish()
    }
}

impl HibernationLoop {
    pub fn new(
        controller: HibernationController,
        source: Arc<dyn IdleSource>,
        hypnos: Arc<dyn Hypnos>,
        recommendations: watch::Receiver<Option<Recommendation>>,
        interval: Duration,
    ) -> Self {
        Self {
            controller,
            source,
            hypnos,
            recommendations,
            queue: None,
            interval,
        }
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
                if let Err(error) = self.tick(Utc::now()).await {
                    warn!(%error, "hibernation tick failed");
                }
            }
            debug!("hibernation loop stopped");
        })
    }

    pub async fn tick(&self, now: DateTime<Utc>) -> Result<()> {
        let active = self.source.active_sandboxes().await?;
        let sleeping = self.source.sleeping().await?;
        let queue_depth = match &self.queue {
            Some(queue) => queue.depth().await.unwrap_or(0),
            None => 0,
        };
        let demand = self.recommendations.borrow().clone();

        let plan = self
            .controller
            .plan(now, &active, &sleeping, demand.as_ref(), queue_depth);
        if plan.is_empty() {
            return Ok(());
        }
        debug!(
            hibernating = plan.hibernate.len(),
            waking = plan.wake.len(),
            "executing hibernation plan"
        );

        for run_id in &plan.hibernate {
            if let Err(error) = self.hypnos.hibernate(run_id).await {
                warn!(%error, run = %run_id, "hibernate failed");
            }
        }
        for run_id in &plan.wake {
            if let Err(error) = self.hypnos.wake(run_id).await {
                warn!(%error, run = %run_id, "wake failed");
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    fn config(enabled: bool, scheduled: bool) -> HibernationConfig {
        HibernationConfig {
            enabled,
            idle_timeout: Duration::from_secs(300),
            scheduled,
            start_cron: scheduled.then(|| "0 22 * * *".to_string()),
            end_cron: scheduled.then(|| "0 6 * * *".to_string()),
            min_warm_pool: 1,
            wake_triggers: vec![WakeTrigger::DemandSpike, WakeTrigger::Scheduled],
            wake_lead_time: Duration::from_secs(1800),
        }
    }

    fn active(idle_secs: &[Option<u64>]) -> Vec<SandboxIdleState> {
        idle_secs
            .iter()
            .map(|idle| SandboxIdleState {
                run_id: RunId::new(),
                idle_for: idle.map(Duration::from_secs),
            })
            .collect()
    }

    fn sleepers(n: usize) -> Vec<SleepingRecord> {
        (0..n)
            .map(|i| SleepingRecord {
                run_id: RunId::new(),
                since: Utc.with_ymd_and_hms(2026, 3, 2, 20, 0, 0).unwrap()
                    + chrono::Duration::seconds(i as i64),
            })
            .collect()
    }

    fn night() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 2, 23, 0, 0).unwrap()
    }

    fn day() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 2, 12, 0, 0).unwrap()
    }

    #[test]
    fn disabled_config_plans_nothing() {
        let controller = HibernationController::new(config(false, false)).unwrap();
        let plan = controller.plan(night(), &active(&[Some(999)]), &[], None, 0);
        assert!(plan.is_empty());
    }

    #[test]
    fn inside_window_keeps_the_warm_pool() {
        let controller = HibernationController::new(config(true, true)).unwrap();
        // Three sandboxes, all idle past the 10s window threshold.
        let plan = controller.plan(
            night(),
            &active(&[Some(60), Some(30), Some(20)]),
            &[],
            None,
            0,
        );
        // min_warm_pool = 1, so only two may sleep.
        assert_eq!(plan.hibernate.len(), 2);
    }

    #[test]
    fn outside_window_uses_idle_timeout() {
        let controller = HibernationController::new(config(true, true)).unwrap();
        // 60s idle is under the 300s timeout; 400s is over.
        let plan = controller.plan(
            day(),
            &active(&[Some(60), Some(400), None]),
            &[],
            None,
            0,
        );
        assert_eq!(plan.hibernate.len(), 1);
    }

    #[test]
    fn demand_spike_wakes_the_deficit() {
        let controller = HibernationController::new(config(true, false)).unwrap();
        let rec = Recommendation {
            current: 2,
            recommended: 5,
            reason: String::new(),
            cost_delta: 0.0,
            confidence: 1.0,
            alert: false,
        };
        let plan = controller.plan(day(), &[], &sleepers(10), Some(&rec), 0);
        assert_eq!(plan.wake.len(), 3);
    }

    #[test]
    fn scheduled_trigger_prewakes_before_window_close() {
        let controller = HibernationController::new(config(true, true)).unwrap();
        // 05:45 + 30min lead = 06:15, outside the 22:00-06:00 window.
        let almost_morning = Utc.with_ymd_and_hms(2026, 3, 3, 5, 45, 0).unwrap();
        let plan = controller.plan(almost_morning, &[], &sleepers(4), None, 0);
        assert_eq!(plan.wake.len(), 4);

        // Deep in the night nothing pre-wakes.
        let plan = controller.plan(night(), &[], &sleepers(4), None, 0);
        assert!(plan.wake.is_empty());
    }

    #[test]
    fn queue_depth_trigger_wakes_up_to_depth() {
        let mut cfg = config(true, false);
        cfg.wake_triggers = vec![WakeTrigger::QueueDepth];
        let controller = HibernationController::new(cfg).unwrap();
        let plan = controller.plan(day(), &[], &sleepers(2), None, 5);
        assert_eq!(plan.wake.len(), 2);
    }

    #[test]
    fn triggers_do_not_wake_the_same_sleeper_twice() {
        let mut cfg = config(true, false);
        cfg.wake_triggers = vec![WakeTrigger::DemandSpike, WakeTrigger::QueueDepth];
        let controller = HibernationController::new(cfg).unwrap();
        let rec = Recommendation {
            current: 0,
            recommended: 2,
            reason: String::new(),
            cost_delta: 0.0,
            confidence: 1.0,
            alert: false,
        };
        let plan = controller.plan(day(), &[], &sleepers(3), Some(&rec), 2);
        assert_eq!(plan.wake.len(), 2);
    }
}
