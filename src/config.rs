use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use secrecy::SecretString;
use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub service: ServiceConfig,
    pub weather: WeatherConfig,
    pub retry: RetryConfig,
    pub rate_limit: RateLimitConfig,
    pub risk: RiskConfig,
    pub ingestion: IngestionConfig,
    pub schedule: ScheduleConfig,
    pub cache: CacheConfig,
    pub monitoring: MonitoringConfig,
    pub database: DatabaseConfig,
    #[serde(default)]
    pub cities: Vec<CityEntry>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServiceConfig {
    pub bind: String,
    pub port: u16,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WeatherConfig {
    pub base_url: String,
    pub units: String,
    pub lang: String,
    pub country: String,
    pub timeout_seconds: u64,
}

impl WeatherConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RetryConfig {
    /// Total number of attempts per fetch, the first one included.
    pub max_retries: u32,
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
    pub rate_limit_cooldown_seconds: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RateLimitConfig {
    pub requests_per_second: u32,
    pub burst_size: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RiskConfig {
    pub min_calibration_samples: u32,
    pub default_threshold_mm: f64,
    pub jitter_pct: f64,
    #[serde(default)]
    pub state_thresholds_mm: BTreeMap<String, f64>,
}

impl RiskConfig {
    /// Threshold used when a city has no usable flood history.
    pub fn fallback_threshold(&self, state: &str) -> f64 {
        self.state_thresholds_mm
            .get(&state.to_uppercase())
            .copied()
            .unwrap_or(self.default_threshold_mm)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct IngestionConfig {
    pub tracked_states: Vec<String>,
    pub forecast_days: u32,
    pub alert_probability: f64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ScheduleConfig {
    pub enabled: bool,
    pub hour: u32,
    pub minute: u32,
    pub utc_offset_hours: i32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CacheConfig {
    pub enabled: bool,
    pub ttl_seconds: u64,
    pub max_items: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MonitoringConfig {
    pub log_level: String,
    #[serde(default)]
    pub log_format: LogFormat,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Json,
    Pretty,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    pub path: String,
}

/// One row of the provider city directory.
#[derive(Debug, Clone, Deserialize)]
pub struct CityEntry {
    pub name: String,
    pub state: String,
    pub provider_id: Option<u64>,
}

/// Secrets loaded exclusively from environment variables.
/// Not serializable, not stored in config files.
pub struct Secrets {
    pub openweather_api_key: Option<SecretString>,
}

impl Secrets {
    pub fn from_env() -> Self {
        Self {
            openweather_api_key: std::env::var("OPENWEATHER_API_KEY")
                .ok()
                .filter(|k| !k.trim().is_empty())
                .map(SecretString::from),
        }
    }
}

impl AppConfig {
    /// Load configuration from a TOML file, overlaying environment variables for secrets.
    pub fn load(config_path: &Path) -> Result<(Self, Secrets)> {
        dotenvy::dotenv().ok();

        let contents = std::fs::read_to_string(config_path)
            .with_context(|| format!("Failed to read config file: {}", config_path.display()))?;

        let config: AppConfig = toml::from_str(&contents)
            .with_context(|| format!("Failed to parse {}", config_path.display()))?;

        let secrets = Secrets::from_env();

        Ok((config, secrets))
    }
}
