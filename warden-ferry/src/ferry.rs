//! Request entry for the control plane: rate-limit, pick a shore,
//! enforce its breaker, forward, and retry across alternates with
//! exponential backoff, all under one end-to-end crossing deadline.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use rand::Rng;
use tokio::sync::{RwLock, Semaphore};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::breaker::CircuitBreaker;
use crate::config::{
    AffinityKeySource, BalanceStrategy, FerryConfig, RateLimitKeyFunc,
};
use crate::error::{FerryError, Result};
use crate::health::HealthChecker;
use crate::limiter::TokenBucketLimiter;
use crate::ring::HashRing;
use crate::shore::{Shore, ShoreId};
use crate::telemetry::{FerryTelemetry, NoopTelemetry};
use crate::transport::{CrossingRequest, CrossingResponse, ShoreTransport};

struct ShoreRuntime {
    shore: Shore,
    breaker: Arc<CircuitBreaker>,
    active: Arc<AtomicU64>,
    health_cancel: CancellationToken,
}

#[derive(Default)]
struct ShoreSet {
    shores: HashMap<ShoreId, ShoreRuntime>,
    ring: HashRing,
}

/// One selectable candidate, snapshotted out of the shore set so no lock
/// is held across the forward.
#[derive(Clone)]
struct Candidate {
    shore: Shore,
    breaker: Arc<CircuitBreaker>,
    active: Arc<AtomicU64>,
}

pub struct Ferry {
    config: FerryConfig,
    transport: Arc<dyn ShoreTransport>,
    telemetry: Arc<dyn FerryTelemetry>,
    shore_set: RwLock<ShoreSet>,
    health: Arc<HealthChecker>,
    limiter: Option<Arc<TokenBucketLimiter>>,
    semaphore: Option<Arc<Semaphore>>,
    rr_cursor: AtomicUsize,
    shutdown: CancellationToken,
}

impl std::fmt::Debug for Ferry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Ferry")
            .field("strategy", &self.config.strategy)
            .field("rate_limited", &self.limiter.is_some())
            .finish()
    }
}

impl Ferry {
    pub fn new(config: FerryConfig, transport: Arc<dyn ShoreTransport>) -> Result<Self> {
        Self::with_telemetry(config, transport, Arc::new(NoopTelemetry))
    }

    pub fn with_telemetry(
        config: FerryConfig,
        transport: Arc<dyn ShoreTransport>,
        telemetry: Arc<dyn FerryTelemetry>,
    ) -> Result<Self> {
        config.validate()?;

        let shutdown = CancellationToken::new();
        let limiter = config.rate_limit.enabled.then(|| {
            let limiter = Arc::new(TokenBucketLimiter::new(config.rate_limit));
            Arc::clone(&limiter).spawn_cleanup(shutdown.child_token());
            limiter
        });
        let semaphore = config
            .max_concurrent
            .map(|permits| Arc::new(Semaphore::new(permits)));
        let health = Arc::new(HealthChecker::new(
            Arc::clone(&transport),
            Arc::clone(&telemetry),
        ));

        Ok(Self {
            config,
            transport,
            telemetry,
            shore_set: RwLock::new(ShoreSet::default()),
            health,
            limiter,
            semaphore,
            rr_cursor: AtomicUsize::new(0),
            shutdown,
        })
    }

    /// Register a backend and start health-checking it.
    pub async fn register_shore(&self, shore: Shore) -> Result<()> {
        let mut set = self.shore_set.write().await;
        if set.shores.contains_key(&shore.id) {
            return Err(FerryError::ShoreAlreadyExists(shore.id));
        }

        let health_cancel = self.shutdown.child_token();
        self.health
            .watch(shore.clone(), health_cancel.clone())
            .await;
        set.ring.add(&shore.id);
        info!(shore = %shore.id, address = %shore.address, "shore registered");
        set.shores.insert(
            shore.id.clone(),
            ShoreRuntime {
                breaker: Arc::new(CircuitBreaker::new(self.config.breaker)),
                active: Arc::new(AtomicU64::new(0)),
                health_cancel,
                shore,
            },
        );
        Ok(())
    }

    pub async fn remove_shore(&self, id: &ShoreId) -> Result<Shore> {
        let mut set = self.shore_set.write().await;
        let runtime = set
            .shores
            .remove(id)
            .ok_or_else(|| FerryError::ShoreNotFound(id.clone()))?;
        set.ring.remove(id);
        runtime.health_cancel.cancel();
        self.health.forget(id).await;
        info!(shore = %id, "shore removed");
        Ok(runtime.shore)
    }

    pub async fn shores(&self) -> Vec<Shore> {
        let set = self.shore_set.read().await;
        let mut shores: Vec<Shore> = set.shores.values().map(|rt| rt.shore.clone()).collect();
        shores.sort_by(|a, b| a.id.cmp(&b.id));
        shores
    }

    pub async fn active_connections(&self, id: &ShoreId) -> u64 {
        let set = self.shore_set.read().await;
        set.shores
            .get(id)
            .map(|rt| rt.active.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    /// Stops health loops and the limiter cleanup task.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    /// Carry one request across to a shore.
    pub async fn cross(&self, request: CrossingRequest) -> Result<CrossingResponse> {
        match tokio::time::timeout(self.config.crossing_timeout, self.cross_inner(&request)).await
        {
            Ok(outcome) => outcome,
            Err(_) => Err(FerryError::Timeout),
        }
    }

    async fn cross_inner(&self, request: &CrossingRequest) -> Result<CrossingResponse> {
        // Concurrency gate first: a saturated ferry applies backpressure
        // within the crossing deadline.
        let _permit = match &self.semaphore {
            Some(semaphore) => Some(
                Arc::clone(semaphore)
                    .acquire_owned()
                    .await
                    .map_err(|_| FerryError::Cancelled)?,
            ),
            None => None,
        };

        if let Some(limiter) = &self.limiter {
            let key = self.rate_limit_key(request);
            if let Err(retry_after) = limiter.check(&key).await {
                self.telemetry.rate_limited(&key);
                debug!(key, ?retry_after, "crossing rate limited");
                return Err(FerryError::RateLimitExceeded { retry_after });
            }
        }

        let mut tried: HashSet<ShoreId> = HashSet::new();
        let mut last_error: Option<FerryError> = None;
        let max_attempts = self.config.retry.max_retries + 1;

        for attempt in 1..=max_attempts {
            // Skip over shores whose breaker refuses until one permits;
            // breaker refusals do not consume a retry attempt.
            let candidate = loop {
                match self.select(request, &tried).await {
                    None => break None,
                    Some(candidate) => {
                        let (allowed, transition) = candidate.breaker.allow();
                        if let Some((from, to)) = transition {
                            self.telemetry
                                .breaker_transition(&candidate.shore.id, from, to);
                        }
                        if allowed {
                            break Some(candidate);
                        }
                        debug!(shore = %candidate.shore.id, "breaker open, excluding shore");
                        last_error = Some(FerryError::CircuitOpen {
                            shore: candidate.shore.id.clone(),
                        });
                        tried.insert(candidate.shore.id);
                    }
                }
            };

            let Some(candidate) = candidate else {
                break;
            };

            match self.forward_once(&candidate, request).await {
                Ok(response) => return Ok(response),
                Err(err) => {
                    warn!(shore = %candidate.shore.id, error = %err, attempt, "crossing attempt failed");
                    tried.insert(candidate.shore.id);
                    last_error = Some(err);
                    if attempt < max_attempts {
                        let delay = self.config.retry.backoff(attempt);
                        self.telemetry.retry_scheduled(attempt, delay);
                        tokio::time::sleep(delay).await;
                    }
                }
            }
        }

        Err(last_error.unwrap_or(FerryError::NoHealthyShores))
    }

    async fn forward_once(
        &self,
        candidate: &Candidate,
        request: &CrossingRequest,
    ) -> Result<CrossingResponse> {
        candidate.active.fetch_add(1, Ordering::Relaxed);
        let started = Instant::now();
        let outcome = self
            .transport
            .forward(&candidate.shore, request, self.config.crossing_timeout)
            .await;
        candidate.active.fetch_sub(1, Ordering::Relaxed);
        let duration = started.elapsed();

        match outcome {
            Ok(response)
                if self
                    .config
                    .retry
                    .retry_on_statuses
                    .contains(&response.status) =>
            {
                if let Some((from, to)) = candidate.breaker.on_failure() {
                    self.telemetry
                        .breaker_transition(&candidate.shore.id, from, to);
                }
                self.telemetry
                    .crossing_failed(&candidate.shore.id, &format!("status {}", response.status));
                Err(FerryError::UpstreamStatus {
                    status: response.status,
                })
            }
            Ok(response) => {
                if let Some((from, to)) = candidate.breaker.on_success() {
                    self.telemetry
                        .breaker_transition(&candidate.shore.id, from, to);
                }
                self.telemetry
                    .crossing_succeeded(&candidate.shore.id, response.status, duration);
                Ok(response)
            }
            Err(err) => {
                if let Some((from, to)) = candidate.breaker.on_failure() {
                    self.telemetry
                        .breaker_transition(&candidate.shore.id, from, to);
                }
                self.telemetry
                    .crossing_failed(&candidate.shore.id, &err.to_string());
                Err(err)
            }
        }
    }

    fn rate_limit_key(&self, request: &CrossingRequest) -> String {
        match self.config.rate_limit.key_func {
            RateLimitKeyFunc::Tenant => request
                .tenant
                .clone()
                .unwrap_or_else(|| "anonymous".to_string()),
            RateLimitKeyFunc::SourceIp => request
                .source_ip
                .clone()
                .unwrap_or_else(|| "unknown".to_string()),
            RateLimitKeyFunc::Identity => request
                .headers
                .get("x-identity")
                .cloned()
                .or_else(|| request.tenant.clone())
                .unwrap_or_else(|| "anonymous".to_string()),
        }
    }

    fn affinity_key(&self, request: &CrossingRequest) -> String {
        let key = match &self.config.session_affinity {
            AffinityKeySource::Tenant => request.tenant.clone(),
            AffinityKeySource::SessionCookie => request.session.clone(),
            AffinityKeySource::Header(name) => request.headers.get(name).cloned(),
            AffinityKeySource::SourceIp => request.source_ip.clone(),
        };
        key.unwrap_or_else(|| "default".to_string())
    }

    /// Snapshot the healthy, untried shores and apply the configured
    /// strategy.
    async fn select(
        &self,
        request: &CrossingRequest,
        tried: &HashSet<ShoreId>,
    ) -> Option<Candidate> {
        let (mut candidates, ring_order) = {
            let set = self.shore_set.read().await;
            let mut candidates = Vec::with_capacity(set.shores.len());
            for (id, runtime) in &set.shores {
                if tried.contains(id) {
                    continue;
                }
                if !self.health.is_healthy(id).await {
                    continue;
                }
                candidates.push(Candidate {
                    shore: runtime.shore.clone(),
                    breaker: Arc::clone(&runtime.breaker),
                    active: Arc::clone(&runtime.active),
                });
            }
            let ring_order = match self.config.strategy {
                BalanceStrategy::ConsistentHash => set
                    .ring
                    .get_n(&self.affinity_key(request), set.shores.len()),
                _ => Vec::new(),
            };
            (candidates, ring_order)
        };

        if candidates.is_empty() {
            return None;
        }
        candidates.sort_by(|a, b| a.shore.id.cmp(&b.shore.id));

        let index = match self.config.strategy {
            BalanceStrategy::RoundRobin => {
                self.rr_cursor.fetch_add(1, Ordering::Relaxed) % candidates.len()
            }
            BalanceStrategy::LeastConnections => candidates
                .iter()
                .enumerate()
                .min_by_key(|(_, c)| c.active.load(Ordering::Relaxed))
                .map(|(i, _)| i)
                .unwrap_or(0),
            BalanceStrategy::WeightedRandom => {
                let total: u64 = candidates.iter().map(|c| c.shore.weight.max(1) as u64).sum();
                let mut pick = rand::rng().random_range(0..total);
                let mut chosen = 0;
                for (i, candidate) in candidates.iter().enumerate() {
                    let weight = candidate.shore.weight.max(1) as u64;
                    if pick < weight {
                        chosen = i;
                        break;
                    }
                    pick -= weight;
                }
                chosen
            }
            BalanceStrategy::IpHash => {
                let ip = request.source_ip.as_deref().unwrap_or("unknown");
                (crate::ring::hash64(ip) as usize) % candidates.len()
            }
            BalanceStrategy::ConsistentHash => ring_order
                .iter()
                .find_map(|preferred| {
                    candidates
                        .iter()
                        .position(|c| &c.shore.id == preferred)
                })
                .unwrap_or(0),
        };

        candidates.into_iter().nth(index)
    }
}
