//! Per-key token-bucket rate limiting. The key map is read-mostly; each
//! bucket carries its own lock and last-access stamp, and a cleanup task
//! evicts keys idle for twice the cleanup interval.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::config::RateLimitConfig;

#[derive(Debug)]
struct Bucket {
    tokens: f64,
    last_refill: Instant,
    last_access: Instant,
}

impl Bucket {
    fn fresh(burst: u32) -> Self {
        let now = Instant::now();
        Self {
            tokens: burst as f64,
            last_refill: now,
            last_access: now,
        }
    }

    /// Refill then try to take one token; on refusal returns the wait
    /// until a token is available.
    fn take(&mut self, rps: f64, burst: u32) -> Result<(), Duration> {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * rps).min(burst as f64);
        self.last_refill = now;
        self.last_access = now;

        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            Ok(())
        } else {
            Err(Duration::from_secs_f64((1.0 - self.tokens) / rps))
        }
    }
}

pub struct TokenBucketLimiter {
    config: RateLimitConfig,
    buckets: RwLock<HashMap<String, Arc<Mutex<Bucket>>>>,
}

impl std::fmt::Debug for TokenBucketLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenBucketLimiter")
            .field("rps", &self.config.rps)
            .field("burst", &self.config.burst)
            .finish()
    }
}

impl TokenBucketLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            config,
            buckets: RwLock::new(HashMap::new()),
        }
    }

    /// Non-blocking admission decision for one key. Decisions are
    /// monotonic; a granted token is never retracted.
    pub async fn check(&self, key: &str) -> Result<(), Duration> {
        let bucket = self.bucket_for(key).await;
        let mut bucket = bucket.lock().await;
        bucket.take(self.config.rps, self.config.burst)
    }

    async fn bucket_for(&self, key: &str) -> Arc<Mutex<Bucket>> {
        {
            let buckets = self.buckets.read().await;
            if let Some(bucket) = buckets.get(key) {
                return Arc::clone(bucket);
            }
        }
        let mut buckets = self.buckets.write().await;
        Arc::clone(
            buckets
                .entry(key.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(Bucket::fresh(self.config.burst)))),
        )
    }

    pub async fn tracked_keys(&self) -> usize {
        self.buckets.read().await.len()
    }

    /// Evict per-key state idle longer than twice the cleanup interval.
    pub async fn evict_idle(&self) -> usize {
        let idle_cutoff = self.config.cleanup_interval * 2;
        let mut buckets = self.buckets.write().await;
        let before = buckets.len();

        let mut keep = HashMap::with_capacity(before);
        for (key, bucket) in buckets.drain() {
            let last_access = bucket.lock().await.last_access;
            if last_access.elapsed() < idle_cutoff {
                keep.insert(key, bucket);
            }
        }
        *buckets = keep;

        let evicted = before - buckets.len();
        if evicted > 0 {
            debug!(evicted, "rate limiter evicted idle keys");
        }
        evicted
    }

    pub fn spawn_cleanup(self: Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.config.cleanup_interval);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                self.evict_idle().await;
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limiter(rps: f64, burst: u32) -> TokenBucketLimiter {
        TokenBucketLimiter::new(RateLimitConfig {
            enabled: true,
            rps,
            burst,
            key_func: Default::default(),
            cleanup_interval: Duration::from_secs(60),
        })
    }

    #[tokio::test(start_paused = true)]
    async fn burst_then_refusal_then_refill() {
        let limiter = limiter(10.0, 5);

        // The first `burst` requests on a fresh key pass.
        for _ in 0..5 {
            assert!(limiter.check("tenant-a").await.is_ok());
        }
        // The (burst+1)-th is refused.
        let wait = limiter.check("tenant-a").await.unwrap_err();
        assert!(wait > Duration::ZERO);

        // Tokens replenish at `rps`.
        tokio::time::advance(Duration::from_millis(150)).await;
        assert!(limiter.check("tenant-a").await.is_ok());
        assert!(limiter.check("tenant-a").await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn keys_are_limited_independently() {
        let limiter = limiter(1.0, 1);
        assert!(limiter.check("a").await.is_ok());
        assert!(limiter.check("a").await.is_err());
        assert!(limiter.check("b").await.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn idle_keys_are_evicted_after_twice_the_interval() {
        let limiter = limiter(10.0, 5);
        limiter.check("a").await.ok();
        limiter.check("b").await.ok();
        assert_eq!(limiter.tracked_keys().await, 2);

        tokio::time::advance(Duration::from_secs(90)).await;
        limiter.check("a").await.ok();
        tokio::time::advance(Duration::from_secs(40)).await;

        // "b" is now idle for 130s > 120s; "a" only 40s.
        limiter.evict_idle().await;
        assert_eq!(limiter.tracked_keys().await, 1);
        assert!(limiter.check("a").await.is_ok());
    }
}
