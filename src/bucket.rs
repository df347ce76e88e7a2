use std::collections::BTreeMap;

use chrono::NaiveDate;

use crate::error::PipelineError;
use crate::models::{EntityKey, Granularity, RegularSeries, SeriesBucket};
use crate::table::EventTable;

/// Count the entity's dated events per calendar bucket, zero-filling every
/// bucket between the first and last observed one.
pub fn build_series(
    events: &EventTable,
    key: &EntityKey,
    granularity: Granularity,
) -> Result<RegularSeries, PipelineError> {
    let mut counts: BTreeMap<NaiveDate, usize> = BTreeMap::new();
    for start in events.select(key).filter_map(|event| event.start) {
        *counts.entry(granularity.bucket_start(start)).or_insert(0) += 1;
    }

    let (Some(&first), Some(&last)) = (counts.keys().next(), counts.keys().next_back()) else {
        return Err(PipelineError::EmptySelection(key.clone()));
    };

    let mut buckets = Vec::new();
    let mut cursor = first;
    while cursor <= last {
        buckets.push(SeriesBucket {
            start: cursor,
            count: counts.get(&cursor).copied().unwrap_or(0),
        });
        cursor = granularity.advance(cursor, 1);
    }

    Ok(RegularSeries {
        granularity,
        buckets,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ActivityType;
    use crate::table::fixtures::{event, key, table};

    fn date(raw: &str) -> NaiveDate {
        NaiveDate::parse_from_str(raw, "%Y-%m-%d").unwrap()
    }

    #[test]
    fn weekly_series_is_gap_free_and_conserves_counts() {
        let key = key();
        let events = table(vec![
            event(&key, ActivityType::Planned, "2024-01-03 09:00:00", 10.0),
            event(&key, ActivityType::Unplanned, "2024-01-07 23:59:00", 10.0),
            event(&key, ActivityType::Planned, "2024-01-29", 10.0),
            event(&key, ActivityType::Planned, "garbage", 10.0),
        ]);

        let series = build_series(&events, &key, Granularity::Week).unwrap();
        let starts: Vec<_> = series.buckets.iter().map(|b| b.start).collect();
        let counts: Vec<_> = series.buckets.iter().map(|b| b.count).collect();

        assert_eq!(
            starts,
            vec![
                date("2024-01-01"),
                date("2024-01-08"),
                date("2024-01-15"),
                date("2024-01-22"),
                date("2024-01-29"),
            ]
        );
        assert_eq!(counts, vec![2, 0, 0, 0, 1]);
        assert_eq!(series.total_events(), 3);
        for pair in series.buckets.windows(2) {
            assert_eq!((pair[1].start - pair[0].start).num_days(), 7);
        }
    }

    #[test]
    fn daily_series_fills_missing_days() {
        let key = key();
        let events = table(vec![
            event(&key, ActivityType::Planned, "2024-02-27 06:00:00", 10.0),
            event(&key, ActivityType::Planned, "2024-03-01 18:00:00", 10.0),
            event(&key, ActivityType::Unplanned, "2024-03-01 19:00:00", 10.0),
        ]);

        let series = build_series(&events, &key, Granularity::Day).unwrap();
        assert_eq!(series.len(), 4);
        assert_eq!(series.first_bucket(), Some(date("2024-02-27")));
        assert_eq!(series.last_bucket(), Some(date("2024-03-01")));
        assert_eq!(
            series.buckets.iter().map(|b| b.count).collect::<Vec<_>>(),
            vec![1, 0, 0, 2]
        );
    }

    #[test]
    fn other_entities_do_not_leak_into_series() {
        let key = key();
        let other = EntityKey::new("COTA", "CAN LINE", "1");
        let events = table(vec![
            event(&key, ActivityType::Planned, "2024-01-01", 10.0),
            event(&other, ActivityType::Planned, "2024-06-01", 10.0),
        ]);

        let series = build_series(&events, &key, Granularity::Week).unwrap();
        assert_eq!(series.len(), 1);
    }

    #[test]
    fn undated_selection_is_an_empty_selection() {
        let key = key();
        let events = table(vec![
            event(&key, ActivityType::Planned, "", 10.0),
            event(&key, ActivityType::Unplanned, "n/a", 10.0),
        ]);

        let err = build_series(&events, &key, Granularity::Week).unwrap_err();
        assert_eq!(err, PipelineError::EmptySelection(key));
    }

    #[test]
    fn rebuilding_is_idempotent() {
        let key = key();
        let events = table(vec![
            event(&key, ActivityType::Planned, "2024-01-01", 10.0),
            event(&key, ActivityType::Planned, "2024-02-11", 10.0),
        ]);
        let first = build_series(&events, &key, Granularity::Week).unwrap();
        let second = build_series(&events, &key, Granularity::Week).unwrap();
        assert_eq!(first, second);
    }
}
