use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::{info, warn};

use flood_forecast::cache::ResultCache;
use flood_forecast::config::{AppConfig, Secrets};
use flood_forecast::db::store::Store;
use flood_forecast::ingest::orchestrator::Ingestor;
use flood_forecast::ingest::scheduler;
use flood_forecast::monitoring::api::{self, AppState};
use flood_forecast::monitoring::health::HealthState;
use flood_forecast::monitoring::logger;
use flood_forecast::risk::scorer::RiskScorer;
use flood_forecast::weather::cities::CityDirectory;
use flood_forecast::weather::retry::RetryPolicy;
use flood_forecast::weather::WeatherClient;

#[derive(Parser)]
#[command(name = "flood-forecast", version, about = "Forecast ingestion and flood-risk scoring")]
struct Cli {
    /// Path to the TOML configuration file.
    #[arg(long, global = true, default_value = "config/default.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Serve the HTTP API and run ingestion on the daily schedule.
    Serve,
    /// Run one ingestion cycle and print the report as JSON.
    Ingest,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let (config, secrets) = AppConfig::load(&cli.config)?;

    logger::init_logging(&config.monitoring)?;

    info!(
        config = %cli.config.display(),
        cities = config.cities.len(),
        tracked_states = ?config.ingestion.tracked_states,
        "Flood forecast service starting"
    );

    let state = build_state(&config, secrets).await?;

    match cli.command {
        Command::Ingest => {
            let report = state.ingest_now().await;
            println!("{}", serde_json::to_string_pretty(&report)?);
            Ok(())
        }
        Command::Serve => serve(&config, state).await,
    }
}

async fn build_state(config: &AppConfig, secrets: Secrets) -> Result<AppState> {
    if let Some(parent) = Path::new(&config.database.path).parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
    }
    let store = Store::new(&config.database.path).await?;

    if secrets.openweather_api_key.is_none() {
        warn!("OPENWEATHER_API_KEY not set, every city will report a configuration error");
    }

    let directory = Arc::new(CityDirectory::from_config(&config.cities));
    let client = WeatherClient::new(
        &config.weather,
        RetryPolicy::from_config(&config.retry),
        &config.rate_limit,
        secrets.openweather_api_key,
        directory.clone(),
    )?;

    let scorer = Arc::new(RiskScorer::new(Arc::new(store.clone()), config.risk.clone()));
    let ingestor = Arc::new(Ingestor::new(
        Arc::new(client),
        scorer,
        store.clone(),
        config.ingestion.clone(),
    ));

    let cities = directory.tracked(&config.ingestion.tracked_states);
    if cities.is_empty() {
        warn!("No configured city belongs to a tracked state");
    }

    Ok(AppState::new(
        store,
        ingestor,
        cities,
        Arc::new(ResultCache::new(config.cache.clone())),
        HealthState::new(),
        config.ingestion.alert_probability,
    ))
}

async fn serve(config: &AppConfig, state: AppState) -> Result<()> {
    let (_, api_handle) = api::spawn_api(state.clone(), &config.service.bind, config.service.port).await?;

    let schedule_handle = if config.schedule.enabled {
        let state = state.clone();
        Some(scheduler::spawn_daily(config.schedule.clone(), move || {
            let state = state.clone();
            async move {
                state.ingest_now().await;
            }
        }))
    } else {
        info!("Daily ingestion schedule disabled");
        None
    };

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    info!("Shutting down");

    if let Some(handle) = schedule_handle {
        handle.abort();
    }
    api_handle.abort();

    Ok(())
}
