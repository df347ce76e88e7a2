use chrono::NaiveDate;
use serde::Serialize;

use crate::error::PipelineError;
use crate::models::{
    ActivityType, Baseline, EntityKey, ForecastPoint, Source, SummaryMetrics, UnifiedRecord,
};
use crate::table::EventTable;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Reconciliation {
    pub records: Vec<UnifiedRecord>,
    pub metrics: SummaryMetrics,
}

impl Reconciliation {
    pub fn predicted(&self) -> impl Iterator<Item = &UnifiedRecord> {
        self.records
            .iter()
            .filter(|record| record.source == Source::Predicted)
    }

    pub fn real(&self) -> impl Iterator<Item = &UnifiedRecord> {
        self.records
            .iter()
            .filter(|record| record.source == Source::Real)
    }
}

impl SummaryMetrics {
    pub fn from_predicted<'a>(records: impl IntoIterator<Item = &'a UnifiedRecord>) -> Self {
        let (total_planned, total_unplanned) =
            records
                .into_iter()
                .fold((0.0, 0.0), |(planned, unplanned), record| {
                    (
                        planned + record.minutes_planned.unwrap_or(0.0),
                        unplanned + record.minutes_unplanned.unwrap_or(0.0),
                    )
                });

        let minutes_saved = total_unplanned - total_planned;
        let percent_saved = (total_unplanned != 0.0).then(|| minutes_saved / total_unplanned * 100.0);

        Self {
            total_planned,
            total_unplanned,
            minutes_saved,
            percent_saved,
        }
    }

    pub fn percent_saved(&self) -> Result<f64, PipelineError> {
        self.percent_saved.ok_or(PipelineError::UndefinedSavings)
    }
}

/// Merge the entity's real event durations with baseline-scaled forecast
/// counts for buckets strictly after `last_historical_bucket`.
///
/// Output is ordered by timestamp; at equal timestamps real records come
/// first and real records keep their table order.
pub fn reconcile(
    events: &EventTable,
    key: &EntityKey,
    baseline: &Baseline,
    forecast: &[ForecastPoint],
    last_historical_bucket: NaiveDate,
) -> Reconciliation {
    let real = events.select(key).filter_map(|event| {
        let timestamp = event.start?.date();
        let (minutes_planned, minutes_unplanned) = match event.activity_type {
            ActivityType::Planned => (Some(event.duration_minutes), None),
            ActivityType::Unplanned => (None, Some(event.duration_minutes)),
        };
        Some(UnifiedRecord {
            timestamp,
            minutes_planned,
            minutes_unplanned,
            source: Source::Real,
            expected_count: None,
            count_lower: None,
            count_upper: None,
        })
    });

    let predicted = forecast
        .iter()
        .filter(|point| point.bucket_start > last_historical_bucket)
        .map(|point| UnifiedRecord {
            timestamp: point.bucket_start,
            minutes_planned: Some(point.expected_count * baseline.avg_minutes_planned),
            minutes_unplanned: Some(point.expected_count * baseline.avg_minutes_unplanned),
            source: Source::Predicted,
            expected_count: Some(point.expected_count),
            count_lower: Some(point.lower),
            count_upper: Some(point.upper),
        });

    let mut records: Vec<UnifiedRecord> = real.chain(predicted).collect();
    records.sort_by_key(|record| (record.timestamp, record.source));

    let metrics = SummaryMetrics::from_predicted(
        records
            .iter()
            .filter(|record| record.source == Source::Predicted),
    );

    Reconciliation { records, metrics }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::table::fixtures::{event, key, table};

    fn date(raw: &str) -> NaiveDate {
        NaiveDate::parse_from_str(raw, "%Y-%m-%d").unwrap()
    }

    fn baseline(key: &EntityKey) -> Baseline {
        Baseline {
            key: key.clone(),
            avg_minutes_planned: 30.0,
            avg_minutes_unplanned: 60.0,
            count_planned: 120,
            count_unplanned: 80,
            time_saved_pct: 50.0,
        }
    }

    fn point(raw: &str, expected_count: f64) -> ForecastPoint {
        ForecastPoint {
            bucket_start: date(raw),
            expected_count,
            lower: (expected_count - 0.5).max(0.0),
            upper: expected_count + 0.5,
        }
    }

    #[test]
    fn splices_real_history_with_future_predictions() {
        let key = key();
        let events = table(vec![
            event(&key, ActivityType::Unplanned, "2024-01-10 10:00:00", 75.0),
            event(&key, ActivityType::Planned, "2024-01-02 10:00:00", 25.0),
            event(&key, ActivityType::Planned, "", 99.0),
        ]);
        let forecast = vec![
            point("2024-01-01", 1.0),
            point("2024-01-08", 1.0),
            point("2024-01-15", 2.0),
            point("2024-01-22", 0.5),
        ];

        let result = reconcile(&events, &key, &baseline(&key), &forecast, date("2024-01-08"));

        assert_eq!(result.real().count(), 2);
        assert_eq!(result.predicted().count(), 2);
        assert_eq!(
            result.records[0],
            UnifiedRecord {
                timestamp: date("2024-01-02"),
                minutes_planned: Some(25.0),
                minutes_unplanned: None,
                source: Source::Real,
                expected_count: None,
                count_lower: None,
                count_upper: None,
            }
        );
        assert_eq!(result.records[1].minutes_unplanned, Some(75.0));
        assert_eq!(result.records[1].minutes_planned, None);
        assert_eq!(
            result.records[2],
            UnifiedRecord {
                timestamp: date("2024-01-15"),
                minutes_planned: Some(60.0),
                minutes_unplanned: Some(120.0),
                source: Source::Predicted,
                expected_count: Some(2.0),
                count_lower: Some(1.5),
                count_upper: Some(2.5),
            }
        );

        assert!(result.real().all(|record| record.expected_count.is_none()));

        for pair in result.records.windows(2) {
            assert!(pair[0].timestamp <= pair[1].timestamp);
        }
        for record in result.predicted() {
            assert!(record.timestamp > date("2024-01-08"));
        }
    }

    #[test]
    fn summary_covers_predicted_portion_only() {
        let key = key();
        let events = table(vec![event(&key, ActivityType::Unplanned, "2024-01-02", 1000.0)]);
        let forecast = vec![point("2024-01-08", 2.0), point("2024-01-15", 2.0)];

        let result = reconcile(&events, &key, &baseline(&key), &forecast, date("2024-01-01"));

        assert_eq!(result.metrics.total_planned, 120.0);
        assert_eq!(result.metrics.total_unplanned, 240.0);
        assert_eq!(result.metrics.minutes_saved, 120.0);
        assert_eq!(result.metrics.percent_saved(), Ok(50.0));
    }

    #[test]
    fn ties_keep_real_before_predicted() {
        let key = key();
        let events = table(vec![
            event(&key, ActivityType::Planned, "2024-01-15 08:00:00", 10.0),
            event(&key, ActivityType::Unplanned, "2024-01-15 09:00:00", 20.0),
        ]);
        let forecast = vec![point("2024-01-15", 1.0)];

        let result = reconcile(&events, &key, &baseline(&key), &forecast, date("2024-01-08"));
        let sources: Vec<_> = result.records.iter().map(|r| r.source).collect();
        assert_eq!(sources, vec![Source::Real, Source::Real, Source::Predicted]);
        assert_eq!(result.records[0].minutes_planned, Some(10.0));
        assert_eq!(result.records[1].minutes_unplanned, Some(20.0));
    }

    #[test]
    fn zero_predicted_unplanned_leaves_savings_undefined() {
        let key = key();
        let events = table(vec![event(&key, ActivityType::Planned, "2024-01-02", 10.0)]);
        let forecast = vec![point("2024-01-08", 0.0), point("2024-01-15", 0.0)];

        let result = reconcile(&events, &key, &baseline(&key), &forecast, date("2024-01-01"));

        assert_eq!(result.predicted().count(), 2);
        assert_eq!(result.metrics.percent_saved, None);
        assert_eq!(result.metrics.percent_saved(), Err(PipelineError::UndefinedSavings));
        assert_eq!(result.metrics.minutes_saved, 0.0);
    }

    #[test]
    fn other_entities_are_not_included() {
        let key = key();
        let other = EntityKey::new("FRES", "CAN LINE", "300025792");
        let events = table(vec![
            event(&key, ActivityType::Planned, "2024-01-02", 10.0),
            event(&other, ActivityType::Planned, "2024-01-03", 10.0),
        ]);

        let result = reconcile(&events, &key, &baseline(&key), &[], date("2024-01-01"));
        assert_eq!(result.records.len(), 1);
    }
}
