//! Daily ingestion trigger.

use std::future::Future;

use anyhow::{Context, Result};
use chrono::{DateTime, Duration, FixedOffset, NaiveTime, TimeZone, Utc};
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::config::ScheduleConfig;

/// First scheduled instant strictly after `now`.
pub fn next_run_after(now: DateTime<Utc>, schedule: &ScheduleConfig) -> Result<DateTime<Utc>> {
    let offset = FixedOffset::east_opt(schedule.utc_offset_hours * 3600)
        .with_context(|| format!("Invalid UTC offset: {}h", schedule.utc_offset_hours))?;
    let at = NaiveTime::from_hms_opt(schedule.hour, schedule.minute, 0).with_context(|| {
        format!("Invalid schedule time {:02}:{:02}", schedule.hour, schedule.minute)
    })?;

    let local_now = now.with_timezone(&offset).naive_local();
    let mut candidate = local_now.date().and_time(at);
    if candidate <= local_now {
        candidate += Duration::days(1);
    }

    let next = offset
        .from_local_datetime(&candidate)
        .single()
        .context("Scheduled time is ambiguous")?;
    Ok(next.with_timezone(&Utc))
}

/// Run `job` once a day at the configured local time until the handle is aborted.
pub fn spawn_daily<F, Fut>(schedule: ScheduleConfig, job: F) -> JoinHandle<()>
where
    F: Fn() -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    tokio::spawn(async move {
        let mut after = Utc::now();
        loop {
            let next = match next_run_after(after.max(Utc::now()), &schedule) {
                Ok(next) => next,
                Err(e) => {
                    error!(error = %e, "Daily schedule disabled");
                    return;
                }
            };

            let wait = (next - Utc::now()).to_std().unwrap_or_default();
            info!(next_run = %next, wait_s = wait.as_secs(), "Next scheduled ingestion");
            tokio::time::sleep(wait).await;

            job().await;
            after = next;
        }
    })
}
