//! OpenWeatherMap 5-day / 3-hour forecast client.
//!
//! Fetches sub-daily forecast samples for a municipality. Transient failures
//! are retried through [`RetryPolicy`]; once retries run out the client
//! reports "no data" with an empty list so the caller can move on to the
//! next city. A missing or rejected credential is the only error surfaced to
//! callers.

pub mod cities;
pub mod retry;

use std::num::NonZeroU32;
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, FixedOffset, Offset, Utc};
use governor::clock::DefaultClock;
use governor::state::{InMemoryState, NotKeyed};
use governor::{Quota, RateLimiter};
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use thiserror::Error;
use tracing::{error, info, instrument, warn};

use crate::config::{RateLimitConfig, WeatherConfig};
use crate::weather::cities::{CityDirectory, LocationQuery};
use crate::weather::retry::{AttemptError, RetryError, RetryPolicy};

/// Free-tier horizon of the 3-hour forecast endpoint.
pub const MAX_FORECAST_DAYS: u32 = 5;

/// Number of 3-hour samples per day.
pub const SAMPLES_PER_DAY: u32 = 8;

type Limiter = RateLimiter<NotKeyed, InMemoryState, DefaultClock>;

/// One 3-hour forecast sample for a location.
#[derive(Debug, Clone, PartialEq)]
pub struct ForecastSample {
    pub city: String,
    pub state: String,
    /// Sample time in the location's local offset.
    pub timestamp: DateTime<FixedOffset>,
    pub temp_min: f64,
    pub temp_max: f64,
    pub humidity: f64,
    /// Rain over this sample's interval, in mm. Zero when the provider omits it.
    pub precipitation_mm: f64,
    pub condition_code: Option<u32>,
    pub description: String,
    pub icon: String,
}

/// Failures that retrying cannot fix.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum WeatherError {
    #[error("OPENWEATHER_API_KEY is not set")]
    MissingCredential,
    #[error("provider rejected the API key (401)")]
    InvalidCredential,
}

/// Anything that can produce forecast samples for a city.
#[async_trait]
pub trait ForecastProvider: Send + Sync {
    /// Fetch up to `days` days of samples. An empty list means no data.
    async fn fetch(
        &self,
        city: &str,
        state: &str,
        days: u32,
    ) -> std::result::Result<Vec<ForecastSample>, WeatherError>;

    fn name(&self) -> &str;
}

pub struct WeatherClient {
    http: reqwest::Client,
    base_url: String,
    units: String,
    lang: String,
    country: String,
    api_key: Option<SecretString>,
    cities: Arc<CityDirectory>,
    retry: RetryPolicy,
    limiter: Arc<Limiter>,
}

impl WeatherClient {
    pub fn new(
        config: &WeatherConfig,
        retry: RetryPolicy,
        rate_limit: &RateLimitConfig,
        api_key: Option<SecretString>,
        cities: Arc<CityDirectory>,
    ) -> Result<Self> {
        let http = reqwest::Client::builder()
            .user_agent("flood-forecast/0.1")
            .timeout(config.timeout())
            .build()
            .context("Failed to build HTTP client")?;

        Ok(Self {
            http,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            units: config.units.clone(),
            lang: config.lang.clone(),
            country: config.country.clone(),
            api_key,
            cities,
            retry,
            limiter: create_rate_limiter(rate_limit),
        })
    }

    fn query_params(
        &self,
        api_key: &SecretString,
        location: LocationQuery,
        days: u32,
    ) -> Vec<(&'static str, String)> {
        let mut params = vec![
            ("appid", api_key.expose_secret().to_string()),
            ("units", self.units.clone()),
            ("lang", self.lang.clone()),
            ("cnt", (days * SAMPLES_PER_DAY).to_string()),
        ];
        match location {
            LocationQuery::Id(id) => params.push(("id", id.to_string())),
            LocationQuery::Name(q) => params.push(("q", q)),
        }
        params
    }
}

#[async_trait]
impl ForecastProvider for WeatherClient {
    #[instrument(skip(self))]
    async fn fetch(
        &self,
        city: &str,
        state: &str,
        days: u32,
    ) -> std::result::Result<Vec<ForecastSample>, WeatherError> {
        let days = days.min(MAX_FORECAST_DAYS);
        if days == 0 {
            return Ok(Vec::new());
        }

        let Some(ref api_key) = self.api_key else {
            error!(city, state, "Weather provider credential missing, not fetching");
            return Err(WeatherError::MissingCredential);
        };

        let location = self.cities.resolve(city, state, &self.country);
        let params = self.query_params(api_key, location, days);
        let url = format!("{}/forecast", self.base_url);
        let label = format!("{city}-{state}");

        let http = &self.http;
        let limiter = &self.limiter;
        let url = url.as_str();
        let params = &params;

        let outcome = self
            .retry
            .execute(&label, move || async move {
                limiter.until_ready().await;

                let response = http.get(url).query(params).send().await?;
                let status = response.status();
                if !status.is_success() {
                    let body = response.text().await.unwrap_or_default();
                    return Err(AttemptError::Status { status, body });
                }

                Ok(response.bytes().await?)
            })
            .await;

        let body = match outcome {
            Ok(body) => body,
            Err(RetryError::Fatal(e)) => {
                error!(city, state, error = %e, "Weather provider rejected credential, check OPENWEATHER_API_KEY");
                return Err(WeatherError::InvalidCredential);
            }
            Err(e @ RetryError::Exhausted { .. }) => {
                error!(city, state, error = %e, "Weather fetch failed, treating as no data");
                return Ok(Vec::new());
            }
        };

        let response: ForecastResponse = match serde_json::from_slice(&body) {
            Ok(r) => r,
            Err(e) => {
                warn!(city, state, error = %e, "Unusable forecast payload, treating as no data");
                return Ok(Vec::new());
            }
        };

        let samples = convert_response(city, state, response);
        if samples.is_empty() {
            warn!(city, state, "Provider returned no forecast samples");
        } else {
            info!(city, state, samples = samples.len(), "Forecast samples fetched");
        }

        Ok(samples)
    }

    fn name(&self) -> &str {
        "openweathermap"
    }
}

fn create_rate_limiter(config: &RateLimitConfig) -> Arc<Limiter> {
    let rps = NonZeroU32::new(config.requests_per_second).unwrap_or(NonZeroU32::MIN);
    let burst = NonZeroU32::new(config.burst_size).unwrap_or(rps);

    let quota = Quota::per_second(rps).allow_burst(burst);
    Arc::new(RateLimiter::direct(quota))
}

fn convert_response(city: &str, state: &str, response: ForecastResponse) -> Vec<ForecastSample> {
    let offset_secs = response.city.map(|c| c.timezone).unwrap_or(0);
    let offset = FixedOffset::east_opt(offset_secs).unwrap_or_else(|| Utc.fix());

    response
        .list
        .into_iter()
        .filter_map(|item| {
            let timestamp = DateTime::from_timestamp(item.dt, 0)?.with_timezone(&offset);
            let condition = item.weather.into_iter().next().unwrap_or_default();
            Some(ForecastSample {
                city: city.to_string(),
                state: state.to_string(),
                timestamp,
                temp_min: item.main.temp_min,
                temp_max: item.main.temp_max,
                humidity: item.main.humidity,
                precipitation_mm: item.rain.map(|r| r.three_hours).unwrap_or(0.0),
                condition_code: condition.id,
                description: condition.description,
                icon: condition.icon,
            })
        })
        .collect()
}

// --- OpenWeatherMap API Response Types ---

#[derive(Debug, Deserialize)]
struct ForecastResponse {
    #[serde(default)]
    list: Vec<ForecastItem>,
    city: Option<CityMeta>,
}

#[derive(Debug, Deserialize)]
struct CityMeta {
    /// Shift in seconds from UTC.
    #[serde(default)]
    timezone: i32,
}

#[derive(Debug, Deserialize)]
struct ForecastItem {
    dt: i64,
    main: MainBlock,
    #[serde(default)]
    weather: Vec<Condition>,
    rain: Option<RainBlock>,
}

#[derive(Debug, Deserialize)]
struct MainBlock {
    temp_min: f64,
    temp_max: f64,
    humidity: f64,
}

#[derive(Debug, Default, Deserialize)]
struct Condition {
    id: Option<u32>,
    #[serde(default)]
    description: String,
    #[serde(default)]
    icon: String,
}

#[derive(Debug, Deserialize)]
struct RainBlock {
    #[serde(rename = "3h", default)]
    three_hours: f64,
}
