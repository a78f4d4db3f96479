use std::time::Duration;

use thiserror::Error;

use crate::shore::ShoreId;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum FerryError {
    #[error("rate limit exceeded; retry after {retry_after:?}")]
    RateLimitExceeded { retry_after: Duration },

    #[error("circuit open for shore {shore}")]
    CircuitOpen { shore: ShoreId },

    #[error("no healthy shores available")]
    NoHealthyShores,

    #[error("shore already registered: {0}")]
    ShoreAlreadyExists(ShoreId),

    #[error("shore not found: {0}")]
    ShoreNotFound(ShoreId),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("upstream returned status {status}")]
    UpstreamStatus { status: u16 },

    #[error("transport error: {0}")]
    Transport(String),

    #[error("crossing timed out")]
    Timeout,

    #[error("crossing cancelled")]
    Cancelled,
}

impl FerryError {
    /// Errors that justify trying another shore.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Transport(_) | Self::Timeout | Self::UpstreamStatus { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, FerryError>;
