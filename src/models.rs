use std::fmt;

use chrono::{Datelike, Duration, NaiveDate, NaiveDateTime};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub enum ActivityType {
    Planned,
    Unplanned,
}

impl ActivityType {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "planned" => Some(Self::Planned),
            "unplanned" => Some(Self::Unplanned),
            _ => None,
        }
    }
}

/// Composite selection key shared by every aggregation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct EntityKey {
    pub location: String,
    pub functional_area: String,
    pub equipment_id: String,
}

impl EntityKey {
    pub fn new(
        location: impl Into<String>,
        functional_area: impl Into<String>,
        equipment_id: impl Into<String>,
    ) -> Self {
        Self {
            location: location.into(),
            functional_area: functional_area.into(),
            equipment_id: equipment_id.into(),
        }
    }
}

impl fmt::Display for EntityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} / {} / {}",
            self.location, self.functional_area, self.equipment_id
        )
    }
}

#[derive(Debug, Clone)]
pub struct Event {
    pub key: EntityKey,
    pub activity_type: ActivityType,
    pub start: Option<NaiveDateTime>,
    pub duration_minutes: f64,
    /// Raw cells of the non-core columns, aligned with `EventTable::extra_columns`.
    pub extra: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Baseline {
    pub key: EntityKey,
    pub avg_minutes_planned: f64,
    pub avg_minutes_unplanned: f64,
    pub count_planned: usize,
    pub count_unplanned: usize,
    pub time_saved_pct: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum Granularity {
    Day,
    Week,
}

impl Granularity {
    pub fn unit_days(self) -> i64 {
        match self {
            Self::Day => 1,
            Self::Week => 7,
        }
    }

    /// Start of the bucket containing `at`: midnight for days, Monday for ISO weeks.
    pub fn bucket_start(self, at: NaiveDateTime) -> NaiveDate {
        let date = at.date();
        match self {
            Self::Day => date,
            Self::Week => date - Duration::days(i64::from(date.weekday().num_days_from_monday())),
        }
    }

    pub fn advance(self, bucket: NaiveDate, steps: i64) -> NaiveDate {
        bucket + Duration::days(steps * self.unit_days())
    }
}

impl fmt::Display for Granularity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Day => f.write_str("day"),
            Self::Week => f.write_str("week"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SeriesBucket {
    pub start: NaiveDate,
    pub count: usize,
}

/// Gap-free count series: one bucket per granularity unit between the first
/// and last observed bucket.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RegularSeries {
    pub granularity: Granularity,
    pub buckets: Vec<SeriesBucket>,
}

impl RegularSeries {
    pub fn len(&self) -> usize {
        self.buckets.len()
    }

    pub fn first_bucket(&self) -> Option<NaiveDate> {
        self.buckets.first().map(|bucket| bucket.start)
    }

    pub fn last_bucket(&self) -> Option<NaiveDate> {
        self.buckets.last().map(|bucket| bucket.start)
    }

    pub fn total_events(&self) -> usize {
        self.buckets.iter().map(|bucket| bucket.count).sum()
    }

    pub fn values(&self) -> Vec<f64> {
        self.buckets.iter().map(|bucket| bucket.count as f64).collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ForecastPoint {
    pub bucket_start: NaiveDate,
    pub expected_count: f64,
    pub lower: f64,
    pub upper: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Source {
    Real,
    Predicted,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UnifiedRecord {
    pub timestamp: NaiveDate,
    pub minutes_planned: Option<f64>,
    pub minutes_unplanned: Option<f64>,
    pub source: Source,
    /// Forecast event count and its interval; empty on real records.
    pub expected_count: Option<f64>,
    pub count_lower: Option<f64>,
    pub count_upper: Option<f64>,
}

/// Savings over the predicted horizon. `percent_saved` is `None` when the
/// predicted unplanned total is zero.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct SummaryMetrics {
    pub total_planned: f64,
    pub total_unplanned: f64,
    pub minutes_saved: f64,
    pub percent_saved: Option<f64>,
}
