//! One ingestion cycle: fetch, collapse, score and persist every tracked city.
//!
//! Cities are processed one after another. Whatever happens to one city is
//! recorded in the report and the cycle moves on; the report is always
//! produced.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Local, NaiveDate, Utc};
use serde::Serialize;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

use crate::config::IngestionConfig;
use crate::db::store::{AlertFilter, RunRecord, Store};
use crate::forecast::aggregate::{collapse, DailyForecast};
use crate::risk::scorer::RiskScorer;
use crate::weather::cities::CityInfo;
use crate::weather::ForecastProvider;

/// What happened to a single city during a cycle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum CityOutcome {
    Written { records: u64 },
    /// Provider gave nothing usable after retries.
    NoData,
    /// Missing or rejected credential. Retrying will not help.
    ConfigurationError { message: String },
    PersistenceError { message: String },
}

impl CityOutcome {
    pub fn records(&self) -> u64 {
        match self {
            Self::Written { records } => *records,
            _ => 0,
        }
    }

    pub fn is_failure(&self) -> bool {
        matches!(
            self,
            Self::ConfigurationError { .. } | Self::PersistenceError { .. }
        )
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct IngestionReport {
    pub run_id: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub cities: BTreeMap<String, CityOutcome>,
}

impl IngestionReport {
    /// `City-ST` to records written. Failed cities map to zero.
    pub fn records_written(&self) -> BTreeMap<String, u64> {
        self.cities
            .iter()
            .map(|(city, outcome)| (city.clone(), outcome.records()))
            .collect()
    }

    pub fn total_written(&self) -> u64 {
        self.cities.values().map(CityOutcome::records).sum()
    }

    pub fn failures(&self) -> usize {
        self.cities.values().filter(|o| o.is_failure()).count()
    }
}

pub struct Ingestor {
    provider: Arc<dyn ForecastProvider>,
    scorer: Arc<RiskScorer>,
    store: Store,
    config: IngestionConfig,
}

impl Ingestor {
    pub fn new(
        provider: Arc<dyn ForecastProvider>,
        scorer: Arc<RiskScorer>,
        store: Store,
        config: IngestionConfig,
    ) -> Self {
        Self {
            provider,
            scorer,
            store,
            config,
        }
    }

    /// Run one full cycle over `cities`.
    pub async fn run_cycle(&self, cities: &[CityInfo]) -> IngestionReport {
        let start = Instant::now();
        let run_id = Uuid::new_v4().to_string();
        let started_at = Utc::now();
        info!(
            run_id = %run_id,
            provider = self.provider.name(),
            cities = cities.len(),
            "Starting ingestion cycle"
        );

        let mut outcomes = BTreeMap::new();
        for city in cities {
            let outcome = self.ingest_city(city).await;
            outcomes.insert(city.label(), outcome);
        }

        let report = IngestionReport {
            run_id,
            started_at,
            finished_at: Utc::now(),
            cities: outcomes,
        };

        if report.failures() > 0 {
            warn!(
                run_id = %report.run_id,
                failures = report.failures(),
                records = report.total_written(),
                "Ingestion cycle finished with failures"
            );
        } else {
            info!(
                run_id = %report.run_id,
                records = report.total_written(),
                elapsed_ms = start.elapsed().as_millis() as u64,
                "Ingestion cycle complete"
            );
        }

        self.check_alerts(Local::now().date_naive()).await;
        self.record_run(&report, cities.len()).await;

        report
    }

    #[instrument(skip(self, city), fields(city = %city.name, state = %city.state))]
    async fn ingest_city(&self, city: &CityInfo) -> CityOutcome {
        let samples = match self
            .provider
            .fetch(&city.name, &city.state, self.config.forecast_days)
            .await
        {
            Ok(samples) => samples,
            Err(e) => {
                error!(error = %e, "Configuration error, skipping city");
                return CityOutcome::ConfigurationError {
                    message: e.to_string(),
                };
            }
        };

        if samples.is_empty() {
            warn!("No forecast data for city");
            return CityOutcome::NoData;
        }

        let mut days: Vec<DailyForecast> = collapse(samples)
            .take(self.config.forecast_days as usize)
            .collect();
        self.scorer.score_days(&city.name, &city.state, &mut days).await;

        match self.store.upsert_forecasts(&days).await {
            Ok(records) => {
                info!(records, "City forecasts stored");
                CityOutcome::Written { records }
            }
            Err(e) => {
                error!(error = %e, "Failed to store city forecasts");
                CityOutcome::PersistenceError {
                    message: format!("{e:#}"),
                }
            }
        }
    }

    /// Log every stored forecast at or above the alert probability.
    async fn check_alerts(&self, today: NaiveDate) {
        let filter = AlertFilter {
            city: None,
            state: None,
            min_probability: self.config.alert_probability,
            from: today,
        };

        match self.store.flood_alerts(&filter).await {
            Ok(alerts) if alerts.is_empty() => {}
            Ok(alerts) => {
                for alert in &alerts {
                    warn!(
                        city = %alert.city,
                        state = %alert.state,
                        date = %alert.date,
                        probability = alert.flood_probability.unwrap_or_default(),
                        risk_level = alert.risk_level.as_deref().unwrap_or("-"),
                        "Flood alert"
                    );
                }
                warn!(count = alerts.len(), "Flood alerts issued");
            }
            Err(e) => warn!(error = %e, "Flood alert check failed"),
        }
    }

    async fn record_run(&self, report: &IngestionReport, cities: usize) {
        let run = RunRecord {
            id: None,
            run_id: report.run_id.clone(),
            started_at: report.started_at.to_rfc3339(),
            finished_at: report.finished_at.to_rfc3339(),
            cities: cities as i64,
            records_written: report.total_written() as i64,
            failures: report.failures() as i64,
            summary: serde_json::to_string(&report.cities).ok(),
        };

        if let Err(e) = self.store.insert_run(&run).await {
            warn!(error = %e, run_id = %report.run_id, "Failed to record ingestion run");
        }
    }
}
