//! Per-shore circuit breaker: Closed -> Open on consecutive failures,
//! Open -> HalfOpen once the timeout elapses and the next permit is
//! requested (that request is probe number one), HalfOpen -> Closed
//! after enough probe successes, any probe failure reopens.

use std::sync::Mutex;

use tokio::time::Instant;

use crate::config::BreakerConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

impl std::fmt::Display for BreakerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Closed => "closed",
            Self::Open => "open",
            Self::HalfOpen => "half-open",
        };
        write!(f, "{name}")
    }
}

/// Observable state change, for telemetry.
pub type Transition = (BreakerState, BreakerState);

#[derive(Debug)]
struct Inner {
    state: BreakerState,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
    half_open_issued: u32,
    half_open_successes: u32,
}

#[derive(Debug)]
pub struct CircuitBreaker {
    config: BreakerConfig,
    inner: Mutex<Inner>,
}

impl CircuitBreaker {
    pub fn new(config: BreakerConfig) -> Self {
        Self {
            config,
            inner: Mutex::new(Inner {
                state: BreakerState::Closed,
                consecutive_failures: 0,
                opened_at: None,
                half_open_issued: 0,
                half_open_successes: 0,
            }),
        }
    }

    pub fn state(&self) -> BreakerState {
        self.lock().state
    }

    /// Whether a call may proceed. The Open -> HalfOpen transition
    /// happens here, and the permitting call counts as the first probe.
    pub fn allow(&self) -> (bool, Option<Transition>) {
        let mut inner = self.lock();
        match inner.state {
            BreakerState::Closed => (true, None),
            BreakerState::Open => {
                let elapsed = inner
                    .opened_at
                    .map(|at| at.elapsed() >= self.config.timeout)
                    .unwrap_or(true);
                if elapsed {
                    inner.state = BreakerState::HalfOpen;
                    inner.half_open_issued = 1;
                    inner.half_open_successes = 0;
                    (true, Some((BreakerState::Open, BreakerState::HalfOpen)))
                } else {
                    (false, None)
                }
            }
            BreakerState::HalfOpen => {
                if inner.half_open_issued < self.config.half_open_requests {
                    inner.half_open_issued += 1;
                    (true, None)
                } else {
                    (false, None)
                }
            }
        }
    }

    pub fn on_success(&self) -> Option<Transition> {
        let mut inner = self.lock();
        match inner.state {
            BreakerState::Closed => {
                inner.consecutive_failures = 0;
                None
            }
            BreakerState::HalfOpen => {
                inner.half_open_successes += 1;
                if inner.half_open_successes >= self.config.half_open_requests {
                    inner.state = BreakerState::Closed;
                    inner.consecutive_failures = 0;
                    inner.opened_at = None;
                    Some((BreakerState::HalfOpen, BreakerState::Closed))
                } else {
                    None
                }
            }
            // A success observed while Open can only come from a call
            // permitted before the transition; it does not close anything.
            BreakerState::Open => None,
        }
    }

    pub fn on_failure(&self) -> Option<Transition> {
        let mut inner = self.lock();
        match inner.state {
            BreakerState::Closed => {
                inner.consecutive_failures += 1;
                if inner.consecutive_failures >= self.config.threshold {
                    inner.state = BreakerState::Open;
                    inner.opened_at = Some(Instant::now());
                    Some((BreakerState::Closed, BreakerState::Open))
                } else {
                    None
                }
            }
            BreakerState::HalfOpen => {
                inner.state = BreakerState::Open;
                inner.opened_at = Some(Instant::now());
                inner.half_open_issued = 0;
                inner.half_open_successes = 0;
                Some((BreakerState::HalfOpen, BreakerState::Open))
            }
            BreakerState::Open => None,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    fn breaker(threshold: u32, timeout: Duration, half_open: u32) -> CircuitBreaker {
        CircuitBreaker::new(BreakerConfig {
            threshold,
            timeout,
            half_open_requests: half_open,
        })
    }

    #[tokio::test(start_paused = true)]
    async fn opens_after_threshold_consecutive_failures() {
        let breaker = breaker(3, Duration::from_secs(30), 1);
        assert!(breaker.allow().0);
        breaker.on_failure();
        breaker.on_failure();
        assert_eq!(breaker.state(), BreakerState::Closed);
        let transition = breaker.on_failure();
        assert_eq!(
            transition,
            Some((BreakerState::Closed, BreakerState::Open))
        );
        assert!(!breaker.allow().0);
    }

    #[tokio::test(start_paused = true)]
    async fn a_success_resets_the_failure_run() {
        let breaker = breaker(3, Duration::from_secs(30), 1);
        breaker.on_failure();
        breaker.on_failure();
        breaker.on_success();
        breaker.on_failure();
        breaker.on_failure();
        assert_eq!(breaker.state(), BreakerState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn half_open_probe_cycle_closes_on_success() {
        let breaker = breaker(1, Duration::from_secs(10), 2);
        breaker.on_failure();
        assert_eq!(breaker.state(), BreakerState::Open);
        assert!(!breaker.allow().0);

        tokio::time::advance(Duration::from_secs(10)).await;

        // First permit after the timeout transitions and counts as probe 1.
        let (allowed, transition) = breaker.allow();
        assert!(allowed);
        assert_eq!(transition, Some((BreakerState::Open, BreakerState::HalfOpen)));
        // Probe 2 permitted, probe 3 refused.
        assert!(breaker.allow().0);
        assert!(!breaker.allow().0);

        assert_eq!(breaker.on_success(), None);
        assert_eq!(
            breaker.on_success(),
            Some((BreakerState::HalfOpen, BreakerState::Closed))
        );
        assert!(breaker.allow().0);
    }

    #[tokio::test(start_paused = true)]
    async fn one_half_open_failure_reopens() {
        let breaker = breaker(1, Duration::from_secs(10), 2);
        breaker.on_failure();
        tokio::time::advance(Duration::from_secs(10)).await;
        assert!(breaker.allow().0);

        assert_eq!(
            breaker.on_failure(),
            Some((BreakerState::HalfOpen, BreakerState::Open))
        );
        assert!(!breaker.allow().0);

        // And the timeout starts over.
        tokio::time::advance(Duration::from_secs(10)).await;
        assert!(breaker.allow().0);
        assert_eq!(breaker.state(), BreakerState::HalfOpen);
    }
}
