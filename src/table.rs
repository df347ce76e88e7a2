use std::collections::BTreeSet;
use std::io::Read;
use std::path::Path;

use chrono::{DateTime, NaiveDate, NaiveDateTime};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::config::ColumnConfig;
use crate::models::{ActivityType, EntityKey, Event};

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("failed to read work orders: {0}")]
    Csv(#[from] csv::Error),

    #[error("required column '{0}' not found in header")]
    MissingColumn(String),
}

const DATETIME_FORMATS: &[&str] = &[
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%d %H:%M",
    "%m/%d/%Y %H:%M:%S",
    "%m/%d/%Y %H:%M",
];

const DATE_FORMATS: &[&str] = &["%Y-%m-%d", "%m/%d/%Y", "%d.%m.%Y"];

/// Lenient timestamp parse: anything unrecognised becomes `None`.
pub fn parse_timestamp(raw: &str) -> Option<NaiveDateTime> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }

    if let Ok(parsed) = DateTime::parse_from_rfc3339(raw) {
        return Some(parsed.naive_utc());
    }

    DATETIME_FORMATS
        .iter()
        .find_map(|format| NaiveDateTime::parse_from_str(raw, format).ok())
        .or_else(|| {
            DATE_FORMATS
                .iter()
                .find_map(|format| NaiveDate::parse_from_str(raw, format).ok())
                .and_then(|date| date.and_hms_opt(0, 0, 0))
        })
}

fn parse_duration(raw: &str) -> Option<f64> {
    raw.trim()
        .parse::<f64>()
        .ok()
        .filter(|minutes| minutes.is_finite() && *minutes >= 0.0)
}

fn decode(field: &[u8]) -> String {
    String::from_utf8_lossy(field).into_owned()
}

struct ColumnIndex {
    location: usize,
    functional_area: usize,
    equipment_id: usize,
    activity_type: usize,
    start_timestamp: usize,
    duration_minutes: usize,
    extra: Vec<usize>,
}

impl ColumnIndex {
    fn resolve(headers: &[String], columns: &ColumnConfig) -> Result<Self, LoadError> {
        let find = |name: &str| {
            headers
                .iter()
                .position(|header| header.trim() == name)
                .ok_or_else(|| LoadError::MissingColumn(name.to_string()))
        };

        let mut index = Self {
            location: find(&columns.location)?,
            functional_area: find(&columns.functional_area)?,
            equipment_id: find(&columns.equipment_id)?,
            activity_type: find(&columns.activity_type)?,
            start_timestamp: find(&columns.start_timestamp)?,
            duration_minutes: find(&columns.duration_minutes)?,
            extra: Vec::new(),
        };

        let core = [
            index.location,
            index.functional_area,
            index.equipment_id,
            index.activity_type,
            index.start_timestamp,
            index.duration_minutes,
        ];
        index.extra = (0..headers.len()).filter(|i| !core.contains(i)).collect();
        Ok(index)
    }
}

/// Validated, read-only table of maintenance events.
#[derive(Debug, Clone, Default)]
pub struct EventTable {
    extra_columns: Vec<String>,
    events: Vec<Event>,
    rejected: usize,
}

impl EventTable {
    pub fn new(extra_columns: Vec<String>, events: Vec<Event>) -> Self {
        Self {
            extra_columns,
            events,
            rejected: 0,
        }
    }

    pub fn from_path(path: &Path, columns: &ColumnConfig) -> Result<Self, LoadError> {
        let reader = csv::ReaderBuilder::new().flexible(true).from_path(path)?;
        let table = Self::from_csv(reader, columns)?;
        info!(
            path = %path.display(),
            events = table.len(),
            rejected = table.rejected(),
            "Loaded work orders"
        );
        Ok(table)
    }

    pub fn from_reader<R: Read>(reader: R, columns: &ColumnConfig) -> Result<Self, LoadError> {
        let reader = csv::ReaderBuilder::new().flexible(true).from_reader(reader);
        Self::from_csv(reader, columns)
    }

    fn from_csv<R: Read>(
        mut reader: csv::Reader<R>,
        columns: &ColumnConfig,
    ) -> Result<Self, LoadError> {
        let headers: Vec<String> = reader.byte_headers()?.iter().map(decode).collect();
        let index = ColumnIndex::resolve(&headers, columns)?;
        let extra_columns = index.extra.iter().map(|&i| headers[i].clone()).collect();

        let mut events = Vec::new();
        let mut rejected = 0usize;
        let mut undated = 0usize;
        let mut lossy = 0usize;

        // Byte records keep rows with invalid UTF-8 in free-text columns.
        for (line, result) in reader.byte_records().enumerate() {
            let record = result?;
            if std::str::from_utf8(record.as_slice()).is_err() {
                lossy += 1;
            }
            let cell = |i: usize| decode(record.get(i).unwrap_or_default());

            let activity = cell(index.activity_type);
            let Some(activity_type) = ActivityType::parse(&activity) else {
                debug!(line = line + 2, value = %activity, "Unknown activity type");
                rejected += 1;
                continue;
            };
            let duration = cell(index.duration_minutes);
            let Some(duration_minutes) = parse_duration(&duration) else {
                debug!(line = line + 2, value = %duration, "Invalid duration");
                rejected += 1;
                continue;
            };

            let start = parse_timestamp(&cell(index.start_timestamp));
            if start.is_none() {
                undated += 1;
            }

            events.push(Event {
                key: EntityKey::new(
                    cell(index.location).trim(),
                    cell(index.functional_area).trim(),
                    cell(index.equipment_id).trim(),
                ),
                activity_type,
                start,
                duration_minutes,
                extra: index.extra.iter().map(|&i| cell(i)).collect(),
            });
        }

        if lossy > 0 {
            warn!(lossy, "Work orders with invalid UTF-8 decoded with replacement characters");
        }
        if rejected > 0 {
            warn!(rejected, "Rejected work orders without a usable activity type or duration");
        }
        if undated > 0 {
            debug!(undated, "Work orders with unparseable start timestamps kept as undated");
        }

        Ok(Self {
            extra_columns,
            events,
            rejected,
        })
    }

    pub fn events(&self) -> &[Event] {
        &self.events
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// Rows dropped during load.
    pub fn rejected(&self) -> usize {
        self.rejected
    }

    pub fn extra_columns(&self) -> &[String] {
        &self.extra_columns
    }

    pub fn select<'a>(&'a self, key: &'a EntityKey) -> impl Iterator<Item = &'a Event> + 'a {
        self.events.iter().filter(move |event| &event.key == key)
    }

    pub fn locations(&self) -> BTreeSet<&str> {
        self.events
            .iter()
            .map(|event| event.key.location.as_str())
            .collect()
    }
}
