//! Active health checking: one probe loop per shore, staggered starts,
//! consecutive-run thresholds before a shore's observable status flips.

use std::collections::HashMap;
use std::sync::Arc;

use rand::Rng;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::shore::{Shore, ShoreId};
use crate::telemetry::FerryTelemetry;
use crate::transport::ShoreTransport;

/// Per-shore probe state, individually locked.
#[derive(Debug)]
struct ShoreHealthState {
    healthy: bool,
    consecutive_successes: u32,
    consecutive_failures: u32,
}

impl ShoreHealthState {
    /// Shores start healthy; the checker demotes them on evidence.
    fn fresh() -> Self {
        Self {
            healthy: true,
            consecutive_successes: 0,
            consecutive_failures: 0,
        }
    }
}

pub struct HealthChecker {
    transport: Arc<dyn ShoreTransport>,
    telemetry: Arc<dyn FerryTelemetry>,
    states: RwLock<HashMap<ShoreId, Arc<Mutex<ShoreHealthState>>>>,
}

impl std::fmt::Debug for HealthChecker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HealthChecker").finish()
    }
}

impl HealthChecker {
    pub fn new(transport: Arc<dyn ShoreTransport>, telemetry: Arc<dyn FerryTelemetry>) -> Self {
        Self {
            transport,
            telemetry,
            states: RwLock::new(HashMap::new()),
        }
    }

    pub async fn is_healthy(&self, shore: &ShoreId) -> bool {
        let states = self.states.read().await;
        match states.get(shore) {
            Some(state) => state.lock().await.healthy,
            // Unknown shores have not been registered yet; treat as
            // healthy until the first probe says otherwise.
            None => true,
        }
    }

    pub async fn forget(&self, shore: &ShoreId) {
        let mut states = self.states.write().await;
        states.remove(shore);
    }

    /// Register the shore and start its probe loop. Probes are staggered
    /// by a random fraction of the interval so a fleet of shores does
    /// not get probed in lockstep.
    pub async fn watch(self: &Arc<Self>, shore: Shore, cancel: CancellationToken) -> JoinHandle<()> {
        let state = Arc::new(Mutex::new(ShoreHealthState::fresh()));
        {
            let mut states = self.states.write().await;
            states.insert(shore.id.clone(), Arc::clone(&state));
        }

        let checker = Arc::clone(self);
        tokio::spawn(async move {
            let interval = shore.health.interval;
            let stagger = interval.mul_f64(rand::rng().random_range(0.0..1.0));
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(stagger) => {}
            }

            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                checker.probe_once(&shore, &state).await;
            }
            debug!(shore = %shore.id, "health loop stopped");
        })
    }

    async fn probe_once(&self, shore: &Shore, state: &Arc<Mutex<ShoreHealthState>>) {
        let outcome = self
            .transport
            .probe(shore, &shore.health.path, shore.health.timeout)
            .await;
        let succeeded = matches!(outcome, Ok(status) if (200..400).contains(&status));

        let mut state = state.lock().await;
        if succeeded {
            state.consecutive_successes += 1;
            state.consecutive_failures = 0;
            if !state.healthy && state.consecutive_successes >= shore.health.healthy_threshold {
                state.healthy = true;
                info!(shore = %shore.id, "shore back in rotation");
                self.telemetry.shore_health_changed(&shore.id, true);
            }
        } else {
            state.consecutive_failures += 1;
            state.consecutive_successes = 0;
            if state.healthy && state.consecutive_failures >= shore.health.unhealthy_threshold {
                state.healthy = false;
                warn!(shore = %shore.id, "shore out of rotation");
                self.telemetry.shore_health_changed(&shore.id, false);
            }
        }
    }

    /// Test hook: drive one probe for a shore without its loop.
    #[cfg(test)]
    async fn probe_for_test(&self, shore: &Shore) {
        let state = {
            let states = self.states.read().await;
            states.get(&shore.id).cloned()
        };
        if let Some(state) = state {
            self.probe_once(shore, &state).await;
        }
    }

    #[cfg(test)]
    async fn register_for_test(&self, shore: &Shore) {
        let mut states = self.states.write().await;
        states.insert(
            shore.id.clone(),
            Arc::new(Mutex::new(ShoreHealthState::fresh())),
        );
    }
}

#[cfg(test)]
mod tests {
    use crate::error::FerryError;
    use crate::telemetry::NoopTelemetry;
    use crate::transport::MockShoreTransport;

    use super::*;

    fn shore() -> Shore {
        let mut shore = Shore::new("s1", "127.0.0.1:9000");
        shore.health.unhealthy_threshold = 2;
        shore.health.healthy_threshold = 2;
        shore
    }

    async fn checker_with(
        results: Vec<Result<u16, FerryError>>,
    ) -> (Arc<HealthChecker>, Shore) {
        let mut transport = MockShoreTransport::new();
        let mut sequence = results.into_iter();
        transport
            .expect_probe()
            .returning(move |_, _, _| sequence.next().unwrap_or(Ok(200)));

        let checker = Arc::new(HealthChecker::new(
            Arc::new(transport),
            Arc::new(NoopTelemetry),
        ));
        let shore = shore();
        checker.register_for_test(&shore).await;
        (checker, shore)
    }

    #[tokio::test]
    async fn flips_unhealthy_after_threshold_failures() {
        let (checker, shore) = checker_with(vec![
            Err(FerryError::Timeout),
            Err(FerryError::Transport("refused".to_string())),
        ])
        .await;

        checker.probe_for_test(&shore).await;
        assert!(checker.is_healthy(&shore.id).await);
        checker.probe_for_test(&shore).await;
        assert!(!checker.is_healthy(&shore.id).await);
    }

    #[tokio::test]
    async fn recovers_after_threshold_successes() {
        let (checker, shore) = checker_with(vec![
            Err(FerryError::Timeout),
            Err(FerryError::Timeout),
            Ok(200),
            Ok(204),
        ])
        .await;

        checker.probe_for_test(&shore).await;
        checker.probe_for_test(&shore).await;
        assert!(!checker.is_healthy(&shore.id).await);

        checker.probe_for_test(&shore).await;
        assert!(!checker.is_healthy(&shore.id).await);
        checker.probe_for_test(&shore).await;
        assert!(checker.is_healthy(&shore.id).await);
    }

    #[tokio::test]
    async fn a_5xx_probe_counts_as_failure() {
        let (checker, shore) = checker_with(vec![Ok(500), Ok(503)]).await;
        checker.probe_for_test(&shore).await;
        checker.probe_for_test(&shore).await;
        assert!(!checker.is_healthy(&shore.id).await);
    }

    #[tokio::test]
    async fn unknown_shores_default_to_healthy() {
        let transport = MockShoreTransport::new();
        let checker = HealthChecker::new(Arc::new(transport), Arc::new(NoopTelemetry));
        assert!(checker.is_healthy(&ShoreId::from("nobody")).await);
    }
}
