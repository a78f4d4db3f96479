use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{FerryError, Result};

/// Backend selection strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BalanceStrategy {
    #[default]
    RoundRobin,
    LeastConnections,
    WeightedRandom,
    IpHash,
    ConsistentHash,
}

/// Where the session-affinity key for consistent hashing comes from.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AffinityKeySource {
    #[default]
    Tenant,
    SessionCookie,
    Header(String),
    SourceIp,
}

/// What identifies a caller for rate limiting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RateLimitKeyFunc {
    #[default]
    Tenant,
    SourceIp,
    Identity,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RateLimitConfig {
    pub enabled: bool,
    /// Token refill rate per second.
    pub rps: f64,
    /// Bucket capacity.
    pub burst: u32,
    pub key_func: RateLimitKeyFunc,
    /// Idle per-key limiters are evicted after twice this interval.
    #[serde(with = "duration_millis")]
    pub cleanup_interval: Duration,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            rps: 50.0,
            burst: 100,
            key_func: RateLimitKeyFunc::default(),
            cleanup_interval: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BreakerConfig {
    /// Consecutive failures that open the breaker.
    pub threshold: u32,
    /// How long the breaker stays open before probing.
    #[serde(with = "duration_millis")]
    pub timeout: Duration,
    /// Probes permitted in the half-open state.
    pub half_open_requests: u32,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            threshold: 5,
            timeout: Duration::from_secs(30),
            half_open_requests: 1,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryConfig {
    pub max_retries: u32,
    #[serde(with = "duration_millis")]
    pub initial_delay: Duration,
    #[serde(with = "duration_millis")]
    pub max_delay: Duration,
    /// Upstream statuses treated like transport failures.
    pub retry_on_statuses: Vec<u16>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 2,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(5),
            retry_on_statuses: vec![502, 503, 504],
        }
    }
}

impl RetryConfig {
    /// Exponential backoff before retry `attempt` (1-based):
    /// `initial * 2^(attempt-1)`, capped at `max_delay`.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.initial_delay
            .saturating_mul(factor)
            .min(self.max_delay)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FerryConfig {
    pub strategy: BalanceStrategy,
    pub breaker: BreakerConfig,
    pub rate_limit: RateLimitConfig,
    pub retry: RetryConfig,
    /// End-to-end deadline covering every retry of one crossing.
    #[serde(with = "duration_millis")]
    pub crossing_timeout: Duration,
    /// Cap on concurrent crossings; None means unbounded.
    #[serde(default)]
    pub max_concurrent: Option<usize>,
    pub session_affinity: AffinityKeySource,
}

impl Default for FerryConfig {
    fn default() -> Self {
        Self {
            strategy: BalanceStrategy::default(),
            breaker: BreakerConfig::default(),
            rate_limit: RateLimitConfig::default(),
            retry: RetryConfig::default(),
            crossing_timeout: Duration::from_secs(30),
            max_concurrent: None,
            session_affinity: AffinityKeySource::default(),
        }
    }
}

impl FerryConfig {
    /// Construction-time validation; violations are fatal.
    pub fn validate(&self) -> Result<()> {
        if self.breaker.threshold == 0 {
            return Err(FerryError::InvalidConfig(
                "breaker threshold must be at least 1".to_string(),
            ));
        }
        if self.breaker.half_open_requests == 0 {
            return Err(FerryError::InvalidConfig(
                "half_open_requests must be at least 1".to_string(),
            ));
        }
        if self.rate_limit.enabled {
            if self.rate_limit.rps <= 0.0 {
                return Err(FerryError::InvalidConfig(
                    "rate limit rps must be positive".to_string(),
                ));
            }
            if self.rate_limit.burst == 0 {
                return Err(FerryError::InvalidConfig(
                    "rate limit burst must be at least 1".to_string(),
                ));
            }
        }
        if self.retry.max_delay < self.retry.initial_delay {
            return Err(FerryError::InvalidConfig(
                "retry max_delay must be >= initial_delay".to_string(),
            ));
        }
        if self.crossing_timeout.is_zero() {
            return Err(FerryError::InvalidConfig(
                "crossing_timeout must be positive".to_string(),
            ));
        }
        if self.max_concurrent == Some(0) {
            return Err(FerryError::InvalidConfig(
                "max_concurrent must be at least 1 when set".to_string(),
            ));
        }
        Ok(())
    }
}

pub(crate) mod duration_millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, ser: S) -> Result<S::Ok, S::Error> {
        ser.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(de: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(de)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_and_caps() {
        let retry = RetryConfig {
            max_retries: 5,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(500),
            retry_on_statuses: vec![503],
        };
        assert_eq!(retry.backoff(1), Duration::from_millis(100));
        assert_eq!(retry.backoff(2), Duration::from_millis(200));
        assert_eq!(retry.backoff(3), Duration::from_millis(400));
        assert_eq!(retry.backoff(4), Duration::from_millis(500));
        assert_eq!(retry.backoff(10), Duration::from_millis(500));
    }

    #[test]
    fn validation_catches_degenerate_configs() {
        let mut config = FerryConfig::default();
        assert!(config.validate().is_ok());

        config.breaker.threshold = 0;
        assert!(config.validate().is_err());
        config.breaker.threshold = 5;

        config.rate_limit.enabled = true;
        config.rate_limit.rps = 0.0;
        assert!(config.validate().is_err());
        config.rate_limit.rps = 10.0;
        assert!(config.validate().is_ok());

        config.max_concurrent = Some(0);
        assert!(config.validate().is_err());
    }
}
