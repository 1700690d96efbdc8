//! Flood probability and risk tier from forecast precipitation.
//!
//! Two independent outputs are produced per day:
//!
//! - a probability of flooding, from a piecewise-linear curve over the
//!   precipitation relative to a city threshold (`limiar`);
//! - an estimate of people affected, from historical flood events in the same
//!   precipitation band, which also sets the risk tier.
//!
//! History is matched per band. A band with no recorded events uses its own
//! fixed default (50, 200 or 500) without jitter, even when the city has
//! history in other bands; there is no shared 200 fallback for such cities.
//!
//! The tier does not look at the probability. A dry day in a city with a
//! heavy low-rain flood history can come out as `alto` with a 5% probability.
//! That is the observed behaviour of the system and is kept as is.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument, warn};

use crate::config::RiskConfig;
use crate::forecast::aggregate::DailyForecast;
use crate::risk::calibration::{CalibrationSource, PrecipitationBand};

/// Probability for light rain (≤ 10 mm).
pub const FLOOR_PROBABILITY: f64 = 0.05;
/// Probability reached at 25 mm.
pub const RAMP_PROBABILITY: f64 = 0.30;
/// Probability reached at the threshold.
pub const THRESHOLD_PROBABILITY: f64 = 0.90;
/// Hard ceiling past the threshold.
pub const MAX_PROBABILITY: f64 = 0.99;

const LIGHT_RAIN_MM: f64 = 10.0;
const MODERATE_RAIN_MM: f64 = 25.0;
/// Probability added per mm above the threshold.
const EXCESS_SLOPE: f64 = 0.01;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RiskLevel {
    #[serde(rename = "baixo")]
    Baixo,
    #[serde(rename = "médio")]
    Medio,
    #[serde(rename = "alto")]
    Alto,
}

impl RiskLevel {
    /// Tier from the affected-population estimate.
    pub fn from_affected(affected: u32) -> Self {
        if affected < 100 {
            Self::Baixo
        } else if affected < 300 {
            Self::Medio
        } else {
            Self::Alto
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Baixo => "baixo",
            Self::Medio => "médio",
            Self::Alto => "alto",
        }
    }
}

impl fmt::Display for RiskLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RiskLevel {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        match s {
            "baixo" => Ok(Self::Baixo),
            "médio" | "medio" => Ok(Self::Medio),
            "alto" => Ok(Self::Alto),
            other => anyhow::bail!("unknown risk level: {other}"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RiskAssessment {
    /// Rounded to two decimals, in `[0, 0.99]`.
    pub probability: f64,
    pub risk_level: RiskLevel,
    pub affected_estimate: u32,
}

/// Where a city's threshold came from.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ThresholdSource {
    History { samples: u32 },
    StateDefault,
    GlobalDefault,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Threshold {
    pub mm: f64,
    pub source: ThresholdSource,
}

/// Everything needed to score any precipitation value for one city.
#[derive(Debug, Clone, PartialEq)]
pub struct CityCalibration {
    pub threshold: Threshold,
    pub affected_by_band: BTreeMap<PrecipitationBand, f64>,
}

/// Piecewise flood probability for `precipitation_mm` against `limiar`.
///
/// Continuous and non-decreasing in `precipitation_mm`:
/// flat 0.05 up to 10 mm, linear to 0.30 at 25 mm, linear to 0.90 at the
/// threshold, then +0.01 per mm capped at 0.99.
pub fn flood_probability(precipitation_mm: f64, limiar: f64) -> f64 {
    let p = precipitation_mm;
    if p <= LIGHT_RAIN_MM {
        FLOOR_PROBABILITY
    } else if p <= MODERATE_RAIN_MM {
        let slope = (RAMP_PROBABILITY - FLOOR_PROBABILITY) / (MODERATE_RAIN_MM - LIGHT_RAIN_MM);
        FLOOR_PROBABILITY + (p - LIGHT_RAIN_MM) * slope
    } else if p < limiar {
        let slope = (THRESHOLD_PROBABILITY - RAMP_PROBABILITY) / (limiar - MODERATE_RAIN_MM);
        RAMP_PROBABILITY + (p - MODERATE_RAIN_MM) * slope
    } else {
        (THRESHOLD_PROBABILITY + (p - limiar) * EXCESS_SLOPE).min(MAX_PROBABILITY)
    }
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

impl CityCalibration {
    /// Score one precipitation value. `jitter_pct` widens history-based
    /// estimates by a uniform factor in `[1 - jitter_pct, 1 + jitter_pct]`.
    pub fn assess(&self, precipitation_mm: f64, jitter_pct: f64) -> RiskAssessment {
        let precipitation_mm = precipitation_mm.max(0.0);
        let probability = round2(flood_probability(precipitation_mm, self.threshold.mm));

        let band = PrecipitationBand::of(precipitation_mm);
        let affected_estimate = match self.affected_by_band.get(&band) {
            Some(mean) => {
                let factor = if jitter_pct > 0.0 {
                    rand::thread_rng().gen_range((1.0 - jitter_pct)..=(1.0 + jitter_pct))
                } else {
                    1.0
                };
                (mean * factor).max(0.0) as u32
            }
            None => band.default_affected(),
        };

        RiskAssessment {
            probability,
            risk_level: RiskLevel::from_affected(affected_estimate),
            affected_estimate,
        }
    }
}

pub struct RiskScorer {
    calibration: Arc<dyn CalibrationSource>,
    config: RiskConfig,
}

impl RiskScorer {
    pub fn new(calibration: Arc<dyn CalibrationSource>, config: RiskConfig) -> Self {
        Self {
            calibration,
            config,
        }
    }

    /// Score a single precipitation value for a city.
    pub async fn score(&self, city: &str, state: &str, precipitation_mm: f64) -> RiskAssessment {
        self.calibrate(city, state)
            .await
            .assess(precipitation_mm, self.config.jitter_pct)
    }

    /// Attach a risk assessment to every day, loading calibration once.
    pub async fn score_days(&self, city: &str, state: &str, days: &mut [DailyForecast]) {
        if days.is_empty() {
            return;
        }
        let calibration = self.calibrate(city, state).await;
        for day in days.iter_mut() {
            day.risk = Some(calibration.assess(day.precipitation_total, self.config.jitter_pct));
        }
    }

    /// Load history for a city. Never fails; lookup errors fall back to defaults.
    #[instrument(skip(self))]
    pub async fn calibrate(&self, city: &str, state: &str) -> CityCalibration {
        let threshold = self.threshold_for(city, state).await;

        let affected_by_band = match self.calibration.affected_by_band(city, state).await {
            Ok(rows) => rows.into_iter().collect(),
            Err(e) => {
                warn!(city, state, error = %e, "Affected-population lookup failed, using band defaults");
                BTreeMap::new()
            }
        };

        CityCalibration {
            threshold,
            affected_by_band,
        }
    }

    async fn threshold_for(&self, city: &str, state: &str) -> Threshold {
        let state_default = Threshold {
            mm: self.config.fallback_threshold(state),
            source: ThresholdSource::StateDefault,
        };

        let stats = match self.calibration.flood_precipitation(city, state).await {
            Ok(stats) => stats,
            Err(e) => {
                warn!(city, state, error = %e, "Threshold lookup failed, using state default");
                return state_default;
            }
        };

        if stats.samples < self.config.min_calibration_samples {
            debug!(
                city,
                state,
                samples = stats.samples,
                "Not enough flood history, using state default"
            );
            return state_default;
        }

        match stats.mean_mm {
            Some(mm) if mm.is_finite() && mm > 0.0 => Threshold {
                mm,
                source: ThresholdSource::History {
                    samples: stats.samples,
                },
            },
            _ => {
                debug!(city, state, "Flood history has no usable precipitation, using global default");
                Threshold {
                    mm: self.config.default_threshold_mm,
                    source: ThresholdSource::GlobalDefault,
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use anyhow::{bail, Result};
    use async_trait::async_trait;

    use super::*;
    use crate::risk::calibration::FloodPrecipitationStats;

    struct StubCalibration {
        stats: Option<FloodPrecipitationStats>,
        bands: Vec<(PrecipitationBand, f64)>,
    }

    #[async_trait]
    impl CalibrationSource for StubCalibration {
        async fn flood_precipitation(&self, _: &str, _: &str) -> Result<FloodPrecipitationStats> {
            match self.stats {
                Some(stats) => Ok(stats),
                None => bail!("database unreachable"),
            }
        }

        async fn affected_by_band(&self, _: &str, _: &str) -> Result<Vec<(PrecipitationBand, f64)>> {
            if self.stats.is_none() {
                bail!("database unreachable");
            }
            Ok(self.bands.clone())
        }
    }

    fn config(jitter_pct: f64) -> RiskConfig {
        RiskConfig {
            min_calibration_samples: 3,
            default_threshold_mm: 40.0,
            jitter_pct,
            state_thresholds_mm: [("RJ".to_string(), 35.0), ("SP".to_string(), 45.0)]
                .into_iter()
                .collect(),
        }
    }

    fn scorer(stats: Option<FloodPrecipitationStats>, bands: Vec<(PrecipitationBand, f64)>) -> RiskScorer {
        RiskScorer::new(Arc::new(StubCalibration { stats, bands }), config(0.2))
    }

    fn no_history() -> Option<FloodPrecipitationStats> {
        Some(FloodPrecipitationStats {
            mean_mm: None,
            samples: 0,
        })
    }

    #[test]
    fn test_curve_breakpoints() {
        assert_eq!(flood_probability(0.0, 40.0), 0.05);
        assert_eq!(flood_probability(10.0, 40.0), 0.05);
        assert!((flood_probability(17.5, 40.0) - 0.175).abs() < 1e-9);
        assert!((flood_probability(25.0, 40.0) - 0.30).abs() < 1e-9);
        assert!((flood_probability(32.5, 40.0) - 0.60).abs() < 1e-9);
        assert!((flood_probability(40.0, 40.0) - 0.90).abs() < 1e-9);
        assert!((flood_probability(45.0, 40.0) - 0.95).abs() < 1e-9);
        assert_eq!(flood_probability(100.0, 40.0), 0.99);
    }

    #[test]
    fn test_curve_is_monotonic_for_any_threshold() {
        for limiar in [8.0, 20.0, 25.0, 30.0, 35.0, 45.0, 80.0] {
            let mut previous = 0.0;
            let mut p = 0.0;
            while p <= 150.0 {
                let prob = flood_probability(p, limiar);
                assert!(
                    prob >= previous,
                    "limiar {limiar}: p({p}) = {prob} < {previous}"
                );
                assert!((0.0..=1.0).contains(&prob));
                previous = prob;
                p += 0.25;
            }
        }
    }

    #[tokio::test]
    async fn test_light_rain_floor_regardless_of_calibration() {
        let calibrated = scorer(
            Some(FloodPrecipitationStats {
                mean_mm: Some(12.0),
                samples: 20,
            }),
            vec![],
        );
        let failing = scorer(None, vec![]);

        assert_eq!(calibrated.score("Santos", "SP", 5.0).await.probability, 0.05);
        assert_eq!(failing.score("Santos", "SP", 5.0).await.probability, 0.05);
    }

    #[tokio::test]
    async fn test_threshold_sources() {
        let history = scorer(
            Some(FloodPrecipitationStats {
                mean_mm: Some(28.0),
                samples: 3,
            }),
            vec![],
        );
        let t = history.calibrate("Niterói", "RJ").await.threshold;
        assert_eq!(t.mm, 28.0);
        assert_eq!(t.source, ThresholdSource::History { samples: 3 });

        let thin = scorer(
            Some(FloodPrecipitationStats {
                mean_mm: Some(28.0),
                samples: 2,
            }),
            vec![],
        );
        let t = thin.calibrate("Campinas", "SP").await.threshold;
        assert_eq!(t.mm, 45.0);
        assert_eq!(t.source, ThresholdSource::StateDefault);

        let zero_mean = scorer(
            Some(FloodPrecipitationStats {
                mean_mm: Some(0.0),
                samples: 9,
            }),
            vec![],
        );
        let t = zero_mean.calibrate("Campinas", "SP").await.threshold;
        assert_eq!(t.mm, 40.0);
        assert_eq!(t.source, ThresholdSource::GlobalDefault);

        let failing = scorer(None, vec![]);
        assert_eq!(failing.calibrate("Petrópolis", "RJ").await.threshold.mm, 35.0);
        assert_eq!(failing.calibrate("Recife", "PE").await.threshold.mm, 40.0);
    }

    #[tokio::test]
    async fn test_rio_light_rain_end_to_end() {
        let scorer = scorer(no_history(), vec![]);
        let risk = scorer.score("Rio de Janeiro", "RJ", 8.0).await;
        assert_eq!(risk.probability, 0.05);
        assert_eq!(risk.risk_level, RiskLevel::Baixo);
        assert_eq!(risk.affected_estimate, 50);
    }

    #[tokio::test]
    async fn test_default_affected_per_band() {
        let scorer = scorer(no_history(), vec![]);
        let medium = scorer.score("São Paulo", "SP", 40.0).await;
        assert_eq!(medium.affected_estimate, 200);
        assert_eq!(medium.risk_level, RiskLevel::Medio);

        let high = scorer.score("São Paulo", "SP", 60.0).await;
        assert_eq!(high.affected_estimate, 500);
        assert_eq!(high.risk_level, RiskLevel::Alto);
        assert_eq!(high.probability, 0.99);
    }

    #[tokio::test]
    async fn test_history_estimate_within_jitter() {
        let scorer = scorer(no_history(), vec![(PrecipitationBand::Medium, 250.0)]);
        for _ in 0..50 {
            let risk = scorer.score("Santos", "SP", 35.0).await;
            assert!((200..=300).contains(&risk.affected_estimate), "{risk:?}");
            assert_eq!(risk.risk_level, RiskLevel::from_affected(risk.affected_estimate));
        }
    }

    #[tokio::test]
    async fn test_band_without_history_uses_its_own_default() {
        let scorer = scorer(no_history(), vec![(PrecipitationBand::Medium, 250.0)]);
        for _ in 0..20 {
            let low = scorer.score("Santos", "SP", 5.0).await;
            assert_eq!(low.affected_estimate, 50);
            let high = scorer.score("Santos", "SP", 80.0).await;
            assert_eq!(high.affected_estimate, 500);
        }
    }

    #[tokio::test]
    async fn test_tier_ignores_probability() {
        let scorer = RiskScorer::new(
            Arc::new(StubCalibration {
                stats: no_history(),
                bands: vec![(PrecipitationBand::Low, 1000.0)],
            }),
            config(0.0),
        );
        let risk = scorer.score("Petrópolis", "RJ", 2.0).await;
        assert_eq!(risk.probability, 0.05);
        assert_eq!(risk.affected_estimate, 1000);
        assert_eq!(risk.risk_level, RiskLevel::Alto);
    }

    #[tokio::test]
    async fn test_score_days_fills_every_record() {
        use chrono::NaiveDate;

        let scorer = scorer(no_history(), vec![]);
        let mut days: Vec<DailyForecast> = [3.0, 30.0, 70.0]
            .iter()
            .enumerate()
            .map(|(i, mm)| DailyForecast {
                city: "Santos".to_string(),
                state: "SP".to_string(),
                date: NaiveDate::from_ymd_opt(2025, 2, 1 + i as u32).unwrap(),
                temp_min: 20.0,
                temp_max: 30.0,
                precipitation_total: *mm,
                humidity: 80.0,
                description: "chuva".to_string(),
                icon: "10d".to_string(),
                risk: None,
            })
            .collect();

        scorer.score_days("Santos", "SP", &mut days).await;

        let levels: Vec<RiskLevel> = days.iter().map(|d| d.risk.unwrap().risk_level).collect();
        assert_eq!(levels, vec![RiskLevel::Baixo, RiskLevel::Medio, RiskLevel::Alto]);
    }

    #[test]
    fn test_risk_level_strings() {
        assert_eq!(RiskLevel::Medio.to_string(), "médio");
        assert_eq!("alto".parse::<RiskLevel>().unwrap(), RiskLevel::Alto);
        assert_eq!(
            serde_json::to_string(&RiskLevel::Medio).unwrap(),
            "\"médio\""
        );
    }
}
