//! Service health snapshot served on `GET /health`.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::RwLock;

use crate::ingest::orchestrator::IngestionReport;

/// Shared health state updated after every ingestion cycle.
#[derive(Clone)]
pub struct HealthState {
    inner: Arc<RwLock<HealthData>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthData {
    pub status: String,
    pub started_at: DateTime<Utc>,
    pub uptime_seconds: i64,
    pub cycles_completed: u64,
    pub last_run_id: Option<String>,
    pub last_cycle_at: Option<DateTime<Utc>>,
    pub last_records_written: u64,
    pub last_failures: usize,
}

impl Default for HealthState {
    fn default() -> Self {
        Self::new()
    }
}

impl HealthState {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(RwLock::new(HealthData {
                status: "ok".to_string(),
                started_at: Utc::now(),
                uptime_seconds: 0,
                cycles_completed: 0,
                last_run_id: None,
                last_cycle_at: None,
                last_records_written: 0,
                last_failures: 0,
            })),
        }
    }

    pub async fn record_cycle(&self, report: &IngestionReport) {
        let mut data = self.inner.write().await;
        data.cycles_completed += 1;
        data.last_run_id = Some(report.run_id.clone());
        data.last_cycle_at = Some(report.finished_at);
        data.last_records_written = report.total_written();
        data.last_failures = report.failures();
        // Every city failing is degraded; some failures still leave fresh data.
        data.status = if !report.cities.is_empty() && report.failures() == report.cities.len() {
            "degraded".to_string()
        } else {
            "ok".to_string()
        };
    }

    pub async fn snapshot(&self) -> HealthData {
        let mut data = self.inner.read().await.clone();
        data.uptime_seconds = (Utc::now() - data.started_at).num_seconds();
        data
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;
    use crate::ingest::orchestrator::CityOutcome;

    fn report(outcomes: Vec<(&str, CityOutcome)>) -> IngestionReport {
        IngestionReport {
            run_id: "run-7".to_string(),
            started_at: Utc::now(),
            finished_at: Utc::now(),
            cities: outcomes
                .into_iter()
                .map(|(c, o)| (c.to_string(), o))
                .collect::<BTreeMap<_, _>>(),
        }
    }

    #[tokio::test]
    async fn test_health_state_starts_ok() {
        let state = HealthState::new();
        let data = state.snapshot().await;
        assert_eq!(data.status, "ok");
        assert_eq!(data.cycles_completed, 0);
        assert!(data.last_cycle_at.is_none());
    }

    #[tokio::test]
    async fn test_health_state_update() {
        let state = HealthState::new();
        state
            .record_cycle(&report(vec![
                ("Santos", CityOutcome::Written { records: 5 }),
                ("Recife", CityOutcome::NoData),
            ]))
            .await;

        let data = state.snapshot().await;
        assert_eq!(data.cycles_completed, 1);
        assert_eq!(data.last_run_id.as_deref(), Some("run-7"));
        assert_eq!(data.last_records_written, 5);
        assert_eq!(data.status, "ok");
    }

    #[tokio::test]
    async fn test_health_state_degraded_when_every_city_fails() {
        let state = HealthState::new();
        state
            .record_cycle(&report(vec![(
                "Santos",
                CityOutcome::ConfigurationError {
                    message: "OPENWEATHER_API_KEY is not set".to_string(),
                },
            )]))
            .await;

        let data = state.snapshot().await;
        assert_eq!(data.status, "degraded");
        assert_eq!(data.last_failures, 1);
    }
}
