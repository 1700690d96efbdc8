//! Historical calibration inputs for flood-risk scoring.
//!
//! Calibration comes from past daily rainfall joined with recorded flood
//! events for the same municipality and date. The scorer treats every lookup
//! here as optional: a failure or a thin history falls back to defaults.

use anyhow::Result;
use async_trait::async_trait;
use serde::Serialize;

/// Precipitation range used to bucket affected-population history.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PrecipitationBand {
    /// Below 30 mm.
    Low,
    /// 30 mm up to 50 mm.
    Medium,
    /// 50 mm and above.
    High,
}

impl PrecipitationBand {
    pub fn of(precipitation_mm: f64) -> Self {
        if precipitation_mm < 30.0 {
            Self::Low
        } else if precipitation_mm < 50.0 {
            Self::Medium
        } else {
            Self::High
        }
    }

    /// People affected when the city has no history for this band.
    pub fn default_affected(self) -> u32 {
        match self {
            Self::Low => 50,
            Self::Medium => 200,
            Self::High => 500,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
        }
    }
}

impl std::str::FromStr for PrecipitationBand {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "low" => Ok(Self::Low),
            "medium" => Ok(Self::Medium),
            "high" => Ok(Self::High),
            other => anyhow::bail!("unknown precipitation band: {other}"),
        }
    }
}

/// Average daily precipitation on days with a recorded flood.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FloodPrecipitationStats {
    pub mean_mm: Option<f64>,
    pub samples: u32,
}

/// Read-only source of per-city history.
#[async_trait]
pub trait CalibrationSource: Send + Sync {
    async fn flood_precipitation(&self, city: &str, state: &str)
        -> Result<FloodPrecipitationStats>;

    /// Mean people affected per precipitation band. Bands with no events are omitted.
    async fn affected_by_band(&self, city: &str, state: &str)
        -> Result<Vec<(PrecipitationBand, f64)>>;
}
