//! Collapse 3-hour forecast samples into one record per calendar day.
//!
//! Samples are expected in ascending time order, which is how the provider
//! emits them; they are not re-sorted. A change of local calendar date (or of
//! location) starts a new day. The last day is emitted even when the forecast
//! horizon ends part way through it.

use std::iter::Peekable;

use chrono::NaiveDate;
use serde::Serialize;

use crate::risk::scorer::RiskAssessment;
use crate::weather::ForecastSample;

/// One forecast row per (city, state, date).
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DailyForecast {
    pub city: String,
    pub state: String,
    pub date: NaiveDate,
    pub temp_min: f64,
    pub temp_max: f64,
    /// Sum of every sample's precipitation for the day, in mm.
    pub precipitation_total: f64,
    /// Taken from the first sample of the day, not averaged.
    pub humidity: f64,
    pub description: String,
    pub icon: String,
    /// Filled in by the risk scorer before persisting.
    pub risk: Option<RiskAssessment>,
}

impl DailyForecast {
    fn opening(sample: ForecastSample) -> Self {
        Self {
            date: sample.timestamp.date_naive(),
            temp_min: sample.temp_min,
            temp_max: sample.temp_max,
            precipitation_total: sample.precipitation_mm,
            humidity: sample.humidity,
            city: sample.city,
            state: sample.state,
            description: sample.description,
            icon: sample.icon,
            risk: None,
        }
    }

    fn absorb(&mut self, sample: &ForecastSample) {
        self.temp_min = self.temp_min.min(sample.temp_min);
        self.temp_max = self.temp_max.max(sample.temp_max);
        self.precipitation_total += sample.precipitation_mm;
    }

    fn same_bucket(&self, sample: &ForecastSample) -> bool {
        sample.timestamp.date_naive() == self.date
            && sample.city == self.city
            && sample.state == self.state
    }
}

/// Lazily group samples into daily records.
pub fn collapse<I>(samples: I) -> DailyBuckets<I::IntoIter>
where
    I: IntoIterator<Item = ForecastSample>,
{
    DailyBuckets {
        samples: samples.into_iter().peekable(),
    }
}

/// Iterator returned by [`collapse`].
pub struct DailyBuckets<I: Iterator<Item = ForecastSample>> {
    samples: Peekable<I>,
}

impl<I: Iterator<Item = ForecastSample>> Iterator for DailyBuckets<I> {
    type Item = DailyForecast;

    fn next(&mut self) -> Option<DailyForecast> {
        let mut day = DailyForecast::opening(self.samples.next()?);
        while let Some(sample) = self.samples.next_if(|s| day.same_bucket(s)) {
            day.absorb(&sample);
        }
        Some(day)
    }
}
