use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::ModelError;

/// Workload weight label. Influences downstream scheduling weights and
/// pre-warm pool selection; it never rejects a request.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum HeatLevel {
    Cold,
    Warm,
    Hot,
    Inferno,
}

impl std::fmt::Display for HeatLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Cold => "cold",
            Self::Warm => "warm",
            Self::Hot => "hot",
            Self::Inferno => "inferno",
        };
        write!(f, "{name}")
    }
}

impl FromStr for HeatLevel {
    type Err = ModelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "cold" => Ok(Self::Cold),
            "warm" => Ok(Self::Warm),
            "hot" => Ok(Self::Hot),
            "inferno" => Ok(Self::Inferno),
            other => Err(ModelError::Parse(format!("unknown heat level: {other}"))),
        }
    }
}
