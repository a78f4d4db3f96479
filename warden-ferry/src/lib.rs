//! Edge load balancer ("ferry") fronting the Warden control plane:
//! token-bucket rate limiting, a health-checked shore pool, per-shore
//! circuit breakers, consistent-hash session affinity, and
//! retry-with-fallback under an end-to-end crossing deadline.

pub mod breaker;
pub mod config;
pub mod error;
pub mod ferry;
pub mod health;
pub mod limiter;
pub mod ring;
pub mod shore;
pub mod telemetry;
pub mod transport;

pub use breaker::{BreakerState, CircuitBreaker, Transition};
pub use config::{
    AffinityKeySource, BalanceStrategy, BreakerConfig, FerryConfig, RateLimitConfig,
    RateLimitKeyFunc, RetryConfig,
};
pub use error::{FerryError, Result};
pub use ferry::Ferry;
pub use health::HealthChecker;
pub use limiter::TokenBucketLimiter;
pub use ring::HashRing;
pub use shore::{HealthCheckConfig, Shore, ShoreId};
pub use telemetry::{FerryTelemetry, NoopTelemetry};
pub use transport::{CrossingRequest, CrossingResponse, HttpTransport, ShoreTransport};
