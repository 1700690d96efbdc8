//! HTTP surface: admin trigger, cache introspection and cached reads.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post};
use axum::Router;
use chrono::Local;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tower_http::cors::{Any, CorsLayer};
use tracing::{debug, error, info, warn};

use crate::cache::{CacheKey, ResultCache};
use crate::db::store::{AlertFilter, Store};
use crate::ingest::orchestrator::{IngestionReport, Ingestor};
use crate::monitoring::health::HealthState;
use crate::weather::cities::CityInfo;

const ALERTS_TTL: Duration = Duration::from_secs(600);
const FORECASTS_TTL: Duration = Duration::from_secs(3600);

/// Shared state accessible by all route handlers.
#[derive(Clone)]
pub struct AppState {
    store: Store,
    ingestor: Arc<Ingestor>,
    cities: Arc<Vec<CityInfo>>,
    cache: Arc<ResultCache>,
    health: HealthState,
    alert_probability: f64,
    /// Held for the whole cycle so manual and scheduled runs never overlap.
    ingest_lock: Arc<Mutex<()>>,
}

impl AppState {
    pub fn new(
        store: Store,
        ingestor: Arc<Ingestor>,
        cities: Vec<CityInfo>,
        cache: Arc<ResultCache>,
        health: HealthState,
        alert_probability: f64,
    ) -> Self {
        Self {
            store,
            ingestor,
            cities: Arc::new(cities),
            cache,
            health,
            alert_probability,
            ingest_lock: Arc::new(Mutex::new(())),
        }
    }

    /// Run a cycle over the tracked cities, then drop cached reads.
    pub async fn ingest_now(&self) -> IngestionReport {
        let _running = self.ingest_lock.lock().await;
        let report = self.ingestor.run_cycle(&self.cities).await;

        let cleared = self.cache.clear();
        debug!(cleared, "Cache cleared after ingestion");

        self.health.record_cycle(&report).await;
        report
    }
}

pub fn router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(health_handler))
        .route("/admin/ingest", post(ingest_handler))
        .route("/cache/stats", get(cache_stats_handler))
        .route("/cache/clear", post(cache_clear_handler))
        .route("/alerts", get(alerts_handler))
        .route("/forecasts/{state}/{city}", get(forecasts_handler))
        .route("/critical-points/{state}/{city}", get(critical_points_handler))
        .layer(cors)
        .with_state(state)
}

/// Bind and serve the API. Returns the bound address and a handle that can be aborted.
pub async fn spawn_api(state: AppState, bind: &str, port: u16) -> Result<(SocketAddr, JoinHandle<()>)> {
    let addr = format!("{bind}:{port}");
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind API server on {addr}"))?;
    let local = listener.local_addr().context("Listener has no local address")?;
    info!(addr = %local, "API server listening");

    let app = router(state);
    let handle = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            warn!(error = %e, "API server error");
        }
    });

    Ok((local, handle))
}

struct ApiError(anyhow::Error);

impl From<anyhow::Error> for ApiError {
    fn from(e: anyhow::Error) -> Self {
        Self(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        error!(error = %self.0, "Request failed");
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({"status": "error", "message": format!("{:#}", self.0)})),
        )
            .into_response()
    }
}

// -- Route Handlers --

async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    let health = state.health.snapshot().await;
    Json(json!({
        "health": health,
        "cache": state.cache.stats(),
    }))
}

async fn ingest_handler(State(state): State<AppState>) -> impl IntoResponse {
    let report = state.ingest_now().await;
    let status = if report.failures() == 0 { "success" } else { "partial" };
    Json(json!({
        "status": status,
        "run_id": report.run_id,
        "records_written": report.records_written(),
        "cities": report.cities,
    }))
}

async fn cache_stats_handler(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.cache.stats())
}

async fn cache_clear_handler(State(state): State<AppState>) -> impl IntoResponse {
    let cleared = state.cache.clear();
    info!(cleared, "Cache cleared on request");
    Json(json!({"status": "success", "cleared": cleared}))
}

#[derive(Debug, Deserialize)]
struct AlertQuery {
    city: Option<String>,
    state: Option<String>,
    min_probability: Option<f64>,
}

async fn alerts_handler(
    State(state): State<AppState>,
    Query(query): Query<AlertQuery>,
) -> Result<Json<Value>, ApiError> {
    let filter = AlertFilter {
        city: query.city,
        state: query.state.map(|s| s.to_uppercase()),
        min_probability: query.min_probability.unwrap_or(state.alert_probability),
        from: Local::now().date_naive(),
    };

    let store = &state.store;
    let key = CacheKey::new("alerts", &filter).context("Unkeyable alert filter")?;
    let value = state
        .cache
        .get_or_compute(key, ALERTS_TTL, || async {
            let alerts = store.flood_alerts(&filter).await?;
            Ok::<_, anyhow::Error>(json!({"total": alerts.len(), "alerts": alerts}))
        })
        .await?;

    Ok(Json(value))
}

async fn forecasts_handler(
    State(state): State<AppState>,
    Path((uf, city)): Path<(String, String)>,
) -> Result<Json<Value>, ApiError> {
    let uf = uf.to_uppercase();
    let today = Local::now().date_naive();

    let store = &state.store;
    let key = CacheKey::new("forecasts", &(&city, &uf, today))
        .context("Unkeyable forecast query")?;
    let value = state
        .cache
        .get_or_compute(key, FORECASTS_TTL, || async {
            let forecasts = store.forecasts_for(&city, &uf, today).await?;
            Ok::<_, anyhow::Error>(json!({"city": city, "state": uf, "forecasts": forecasts}))
        })
        .await?;

    Ok(Json(value))
}

async fn critical_points_handler(
    State(state): State<AppState>,
    Path((uf, city)): Path<(String, String)>,
) -> Result<Json<Value>, ApiError> {
    let uf = uf.to_uppercase();

    let store = &state.store;
    let key = CacheKey::new("critical_points", &(&city, &uf))
        .context("Unkeyable critical-points query")?;
    let value = state
        .cache
        .get_or_compute(key, state.cache.default_ttl(), || async {
            let points = store.critical_locations(&city, &uf).await?;
            Ok::<_, anyhow::Error>(json!({"city": city, "state": uf, "critical_points": points}))
        })
        .await?;

    Ok(Json(value))
}
