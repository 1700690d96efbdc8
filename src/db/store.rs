use std::str::FromStr;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::NaiveDate;
use serde::Serialize;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{FromRow, QueryBuilder, Sqlite, SqlitePool};
use tracing::{debug, warn};

use crate::forecast::aggregate::DailyForecast;
use crate::risk::calibration::{CalibrationSource, FloodPrecipitationStats, PrecipitationBand};

#[derive(Clone)]
pub struct Store {
    pool: SqlitePool,
}

/// A persisted forecast row.
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct ForecastRecord {
    pub city: String,
    pub state: String,
    pub date: NaiveDate,
    pub temp_min: f64,
    pub temp_max: f64,
    pub precipitation: f64,
    pub humidity: Option<f64>,
    pub description: Option<String>,
    pub icon: Option<String>,
    pub flood_probability: Option<f64>,
    pub risk_level: Option<String>,
    pub affected_estimate: Option<i64>,
    pub created_at: String,
    pub updated_at: String,
}

/// Recorded flood location ranked by how often it flooded.
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct CriticalLocation {
    pub location: String,
    pub occurrences: i64,
    pub last_occurrence: Option<String>,
}

#[derive(Debug, Clone, FromRow, Serialize)]
pub struct RunRecord {
    pub id: Option<i64>,
    pub run_id: String,
    pub started_at: String,
    pub finished_at: String,
    pub cities: i64,
    pub records_written: i64,
    pub failures: i64,
    pub summary: Option<String>,
}

/// Filter for [`Store::flood_alerts`].
#[derive(Debug, Clone, Serialize)]
pub struct AlertFilter {
    pub city: Option<String>,
    pub state: Option<String>,
    pub min_probability: f64,
    /// Earliest forecast date to consider, usually today.
    pub from: NaiveDate,
}

impl Store {
    /// Get a reference to the underlying connection pool.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn new(database_path: &str) -> Result<Self> {
        let in_memory = database_path == ":memory:";
        let options = SqliteConnectOptions::from_str(&format!("sqlite:{database_path}"))
            .context("Invalid database path")?
            .create_if_missing(true)
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal);

        // Every connection to ":memory:" is a separate database.
        let pool_options = if in_memory {
            SqlitePoolOptions::new()
                .max_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
        } else {
            SqlitePoolOptions::new().max_connections(5)
        };

        let pool = pool_options
            .connect_with(options)
            .await
            .context("Failed to connect to SQLite database")?;

        let store = Self { pool };
        store.migrate().await?;

        Ok(store)
    }

    async fn migrate(&self) -> Result<()> {
        let migration_sql = include_str!("../../migrations/001_init.sql");
        // Execute each statement separately (sqlx doesn't support multiple statements in one call)
        for statement in migration_sql.split(';') {
            let trimmed = statement.trim();
            if !trimmed.is_empty() {
                sqlx::query(trimmed)
                    .execute(&self.pool)
                    .await
                    .with_context(|| format!("Failed to execute migration: {trimmed}"))?;
            }
        }
        Ok(())
    }

    // --- Forecast operations ---

    /// Insert or refresh daily forecasts in one statement keyed on (city, state, date).
    ///
    /// Existing rows for dates absent from `records` are left alone.
    pub async fn upsert_forecasts(&self, records: &[DailyForecast]) -> Result<u64> {
        if records.is_empty() {
            return Ok(0);
        }

        let mut builder: QueryBuilder<Sqlite> = QueryBuilder::new(
            "INSERT INTO forecasts (city, state, date, temp_min, temp_max, precipitation, humidity, description, icon, flood_probability, risk_level, affected_estimate) ",
        );

        builder.push_values(records, |mut row, r| {
            row.push_bind(r.city.clone())
                .push_bind(r.state.clone())
                .push_bind(r.date)
                .push_bind(r.temp_min)
                .push_bind(r.temp_max)
                .push_bind(r.precipitation_total)
                .push_bind(r.humidity)
                .push_bind(r.description.clone())
                .push_bind(r.icon.clone())
                .push_bind(r.risk.map(|risk| risk.probability))
                .push_bind(r.risk.map(|risk| risk.risk_level.as_str().to_string()))
                .push_bind(r.risk.map(|risk| i64::from(risk.affected_estimate)));
        });

        builder.push(
            " ON CONFLICT (city, state, date) DO UPDATE SET
                temp_min = excluded.temp_min,
                temp_max = excluded.temp_max,
                precipitation = excluded.precipitation,
                humidity = excluded.humidity,
                description = excluded.description,
                icon = excluded.icon,
                flood_probability = excluded.flood_probability,
                risk_level = excluded.risk_level,
                affected_estimate = excluded.affected_estimate,
                updated_at = CURRENT_TIMESTAMP",
        );

        let result = builder
            .build()
            .execute(&self.pool)
            .await
            .context("Failed to upsert forecasts")?;

        debug!(rows = result.rows_affected(), "Forecast batch written");
        Ok(result.rows_affected())
    }

    pub async fn forecasts_for(
        &self,
        city: &str,
        state: &str,
        from: NaiveDate,
    ) -> Result<Vec<ForecastRecord>> {
        let rows = sqlx::query_as::<_, ForecastRecord>(
            "SELECT city, state, date, temp_min, temp_max, precipitation, humidity, description, icon,
                    flood_probability, risk_level, affected_estimate, created_at, updated_at
             FROM forecasts
             WHERE city = ? AND state = ? AND date >= ?
             ORDER BY date",
        )
        .bind(city)
        .bind(state)
        .bind(from)
        .fetch_all(&self.pool)
        .await
        .context("Failed to fetch forecasts")?;
        Ok(rows)
    }

    /// Forecasts at or above a flood probability, soonest first, most likely first within a day.
    pub async fn flood_alerts(&self, filter: &AlertFilter) -> Result<Vec<ForecastRecord>> {
        let mut builder: QueryBuilder<Sqlite> = QueryBuilder::new(
            "SELECT city, state, date, temp_min, temp_max, precipitation, humidity, description, icon,
                    flood_probability, risk_level, affected_estimate, created_at, updated_at
             FROM forecasts WHERE date >= ",
        );
        builder.push_bind(filter.from);
        builder.push(" AND flood_probability >= ");
        builder.push_bind(filter.min_probability);

        if let Some(ref city) = filter.city {
            builder.push(" AND city = ");
            builder.push_bind(city.clone());
        }
        if let Some(ref state) = filter.state {
            builder.push(" AND state = ");
            builder.push_bind(state.clone());
        }
        builder.push(" ORDER BY date, flood_probability DESC");

        let rows = builder
            .build_query_as::<ForecastRecord>()
            .fetch_all(&self.pool)
            .await
            .context("Failed to fetch flood alerts")?;
        Ok(rows)
    }

    pub async fn forecast_count(&self) -> Result<i64> {
        let row: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM forecasts")
            .fetch_one(&self.pool)
            .await
            .context("Failed to count forecasts")?;
        Ok(row.0)
    }

    // --- History operations ---

    pub async fn record_rainfall(
        &self,
        city: &str,
        state: &str,
        date: NaiveDate,
        precipitation_mm: f64,
    ) -> Result<()> {
        sqlx::query(
            "INSERT INTO daily_rainfall (city, state, date, precipitation_mm) VALUES (?, ?, ?, ?)
             ON CONFLICT (city, state, date) DO UPDATE SET precipitation_mm = excluded.precipitation_mm",
        )
        .bind(city)
        .bind(state)
        .bind(date)
        .bind(precipitation_mm)
        .execute(&self.pool)
        .await
        .context("Failed to record rainfall")?;
        Ok(())
    }

    pub async fn record_flood_event(
        &self,
        city: &str,
        state: &str,
        date: NaiveDate,
        location: &str,
        affected: i64,
    ) -> Result<i64> {
        let result = sqlx::query(
            "INSERT INTO flood_events (city, state, date, location, affected) VALUES (?, ?, ?, ?, ?)",
        )
        .bind(city)
        .bind(state)
        .bind(date)
        .bind(location)
        .bind(affected)
        .execute(&self.pool)
        .await
        .context("Failed to record flood event")?;
        Ok(result.last_insert_rowid())
    }

    pub async fn critical_locations(&self, city: &str, state: &str) -> Result<Vec<CriticalLocation>> {
        let rows = sqlx::query_as::<_, CriticalLocation>(
            "SELECT location, COUNT(*) AS occurrences, MAX(date) AS last_occurrence
             FROM flood_events
             WHERE city = ? AND state = ? AND location IS NOT NULL
             GROUP BY location
             ORDER BY occurrences DESC, location",
        )
        .bind(city)
        .bind(state)
        .fetch_all(&self.pool)
        .await
        .context("Failed to fetch critical locations")?;
        Ok(rows)
    }

    // --- Ingestion run operations ---

    pub async fn insert_run(&self, run: &RunRecord) -> Result<i64> {
        let result = sqlx::query(
            "INSERT INTO ingestion_runs (run_id, started_at, finished_at, cities, records_written, failures, summary)
             VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&run.run_id)
        .bind(&run.started_at)
        .bind(&run.finished_at)
        .bind(run.cities)
        .bind(run.records_written)
        .bind(run.failures)
        .bind(&run.summary)
        .execute(&self.pool)
        .await
        .context("Failed to insert ingestion run")?;

        Ok(result.last_insert_rowid())
    }

    pub async fn latest_run(&self) -> Result<Option<RunRecord>> {
        let run = sqlx::query_as::<_, RunRecord>(
            "SELECT * FROM ingestion_runs ORDER BY id DESC LIMIT 1",
        )
        .fetch_optional(&self.pool)
        .await
        .context("Failed to fetch latest ingestion run")?;
        Ok(run)
    }
}

#[async_trait]
impl CalibrationSource for Store {
    async fn flood_precipitation(&self, city: &str, state: &str) -> Result<FloodPrecipitationStats> {
        let row: (Option<f64>, i64) = sqlx::query_as(
            "SELECT AVG(r.precipitation_mm), COUNT(r.id)
             FROM daily_rainfall r
             INNER JOIN flood_events f
                ON f.city = r.city AND f.state = r.state AND f.date = r.date
             WHERE r.city = ? AND r.state = ?",
        )
        .bind(city)
        .bind(state)
        .fetch_one(&self.pool)
        .await
        .context("Failed to query flood precipitation history")?;

        Ok(FloodPrecipitationStats {
            mean_mm: row.0,
            samples: u32::try_from(row.1).unwrap_or(u32::MAX),
        })
    }

    async fn affected_by_band(&self, city: &str, state: &str) -> Result<Vec<(PrecipitationBand, f64)>> {
        let rows: Vec<(String, Option<f64>)> = sqlx::query_as(
            "SELECT CASE
                        WHEN r.precipitation_mm < 30 THEN 'low'
                        WHEN r.precipitation_mm < 50 THEN 'medium'
                        ELSE 'high'
                    END AS band,
                    AVG(f.affected)
             FROM daily_rainfall r
             INNER JOIN flood_events f
                ON f.city = r.city AND f.state = r.state AND f.date = r.date
             WHERE r.city = ? AND r.state = ?
             GROUP BY band",
        )
        .bind(city)
        .bind(state)
        .fetch_all(&self.pool)
        .await
        .context("Failed to query affected-population history")?;

        let mut bands = Vec::with_capacity(rows.len());
        for (band, mean) in rows {
            match (band.parse::<PrecipitationBand>(), mean) {
                (Ok(band), Some(mean)) => bands.push((band, mean)),
                (Err(e), _) => warn!(city, state, error = %e, "Skipping unknown band"),
                (Ok(_), None) => {}
            }
        }
        Ok(bands)
    }
}
