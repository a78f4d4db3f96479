use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Identifier of a registered backend.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ShoreId(pub String);

impl ShoreId {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for ShoreId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl std::fmt::Display for ShoreId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Per-shore health probe settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthCheckConfig {
    pub path: String,
    #[serde(with = "crate::config::duration_millis")]
    pub interval: Duration,
    #[serde(with = "crate::config::duration_millis")]
    pub timeout: Duration,
    /// Consecutive successes needed to flip an unhealthy shore back.
    pub healthy_threshold: u32,
    /// Consecutive failures needed to take a shore out of rotation.
    pub unhealthy_threshold: u32,
}

impl Default for HealthCheckConfig {
    fn default() -> Self {
        Self {
            path: "/healthz".to_string(),
            interval: Duration::from_secs(10),
            timeout: Duration::from_secs(2),
            healthy_threshold: 2,
            unhealthy_threshold: 3,
        }
    }
}

/// A registered backend endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Shore {
    pub id: ShoreId,
    /// Host:port the transport dials.
    pub address: String,
    /// Relative share for weighted selection.
    pub weight: u32,
    #[serde(default)]
    pub zone: Option<String>,
    #[serde(default)]
    pub priority: u32,
    #[serde(default)]
    pub health: HealthCheckConfig,
}

impl Shore {
    pub fn new(id: impl Into<ShoreId>, address: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            address: address.into(),
            weight: 1,
            zone: None,
            priority: 0,
            health: HealthCheckConfig::default(),
        }
    }

    pub fn with_weight(mut self, weight: u32) -> Self {
        self.weight = weight;
        self
    }
}

impl From<String> for ShoreId {
    fn from(value: String) -> Self {
        Self(value)
    }
}
