use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{info, warn};

use crate::baseline;
use crate::bucket;
use crate::config::PipelineConfig;
use crate::error::PipelineError;
use crate::forecast::{self, FitQuality, Forecaster};
use crate::models::{Baseline, EntityKey, ForecastPoint, Granularity, RegularSeries};
use crate::reconcile::{self, Reconciliation};
use crate::table::EventTable;

/// Everything that identifies one run. The same value feeds every stage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Selection {
    pub key: EntityKey,
    pub granularity: Granularity,
    pub horizon: usize,
    pub threshold: usize,
}

impl Selection {
    pub fn new(key: EntityKey, config: &PipelineConfig) -> Self {
        Self {
            key,
            granularity: config.granularity,
            horizon: config.horizon,
            threshold: config.threshold,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub selection: Selection,
    pub model: String,
    pub baseline: Baseline,
    pub series: RegularSeries,
    pub forecast: Vec<ForecastPoint>,
    pub fit: FitQuality,
    pub reconciliation: Reconciliation,
}

#[derive(Debug, Clone)]
pub enum RunOutcome {
    Success(RunReport),
    /// Complete report whose savings could not be expressed as a percentage.
    Partial {
        report: RunReport,
        warning: PipelineError,
    },
    Failure {
        selection: Selection,
        reason: PipelineError,
    },
}

impl RunOutcome {
    pub fn status(&self) -> &'static str {
        match self {
            Self::Success(_) => "success",
            Self::Partial { .. } => "partial",
            Self::Failure { .. } => "failure",
        }
    }

    pub fn selection(&self) -> &Selection {
        match self {
            Self::Success(report) | Self::Partial { report, .. } => &report.selection,
            Self::Failure { selection, .. } => selection,
        }
    }

    pub fn report(&self) -> Option<&RunReport> {
        match self {
            Self::Success(report) | Self::Partial { report, .. } => Some(report),
            Self::Failure { .. } => None,
        }
    }

    pub fn problem(&self) -> Option<&PipelineError> {
        match self {
            Self::Success(_) => None,
            Self::Partial { warning, .. } => Some(warning),
            Self::Failure { reason, .. } => Some(reason),
        }
    }
}

/// Shared, read-only inputs for any number of runs over one event table.
#[derive(Clone)]
pub struct Pipeline {
    table: Arc<EventTable>,
    baselines: Arc<BTreeMap<EntityKey, Baseline>>,
    forecaster: Arc<dyn Forecaster>,
    fit_timeout: Duration,
}

impl Pipeline {
    pub fn new(table: Arc<EventTable>, forecaster: Arc<dyn Forecaster>, fit_timeout: Duration) -> Self {
        let baselines = baseline::compute(&table);
        info!(
            events = table.len(),
            entities = baselines.len(),
            model = forecaster.name(),
            "Computed baselines"
        );
        Self {
            table,
            baselines: Arc::new(baselines),
            forecaster,
            fit_timeout,
        }
    }

    pub fn table(&self) -> &EventTable {
        &self.table
    }

    pub fn baselines(&self) -> &BTreeMap<EntityKey, Baseline> {
        &self.baselines
    }

    /// Eligible selections for every entity, using `template` for the
    /// non-key parameters.
    pub fn eligible_selections(&self, template: &PipelineConfig) -> Vec<Selection> {
        baseline::eligible(&self.baselines, template.threshold)
            .into_iter()
            .map(|baseline| Selection::new(baseline.key.clone(), template))
            .collect()
    }

    pub async fn run(&self, selection: Selection) -> RunOutcome {
        match self.execute(&selection).await {
            Ok(report) => match report.reconciliation.metrics.percent_saved() {
                Ok(percent) => {
                    info!(key = %selection.key, percent_saved = percent, "Run complete");
                    RunOutcome::Success(report)
                }
                Err(warning) => {
                    warn!(key = %selection.key, %warning, "Run complete with undefined savings");
                    RunOutcome::Partial { report, warning }
                }
            },
            Err(reason) => {
                warn!(key = %selection.key, %reason, "Run failed");
                RunOutcome::Failure { selection, reason }
            }
        }
    }

    async fn execute(&self, selection: &Selection) -> Result<RunReport, PipelineError> {
        let key = &selection.key;
        let baseline = self
            .baselines
            .get(key)
            .ok_or_else(|| {
                if self.table.select(key).next().is_none() {
                    PipelineError::EmptySelection(key.clone())
                } else {
                    PipelineError::IneligibleBaseline {
                        key: key.clone(),
                        reason: "needs at least one planned and one unplanned event with non-zero unplanned duration".to_string(),
                    }
                }
            })?
            .clone();
        baseline.check_eligible(selection.threshold)?;

        let series = bucket::build_series(&self.table, key, selection.granularity)?;
        let last_bucket = series
            .last_bucket()
            .ok_or_else(|| PipelineError::EmptySelection(key.clone()))?;

        let forecast = self.fit_predict(&series, selection.horizon).await?;
        let fit = forecast::fit_quality(&series, &forecast);
        let reconciliation =
            reconcile::reconcile(&self.table, key, &baseline, &forecast, last_bucket);

        Ok(RunReport {
            selection: selection.clone(),
            model: self.forecaster.name().to_string(),
            baseline,
            series,
            forecast,
            fit,
            reconciliation,
        })
    }

    /// Fit on a blocking thread, bounded by the configured timeout. A timed-out
    /// fit keeps its thread until it returns; its result is discarded.
    async fn fit_predict(
        &self,
        series: &RegularSeries,
        horizon: usize,
    ) -> Result<Vec<ForecastPoint>, PipelineError> {
        let forecaster = Arc::clone(&self.forecaster);
        let series = series.clone();
        let task = tokio::task::spawn_blocking(move || forecaster.fit_predict(&series, horizon));

        match tokio::time::timeout(self.fit_timeout, task).await {
            Ok(Ok(result)) => result,
            Ok(Err(join_error)) => Err(PipelineError::ForecastTask(join_error.to_string())),
            Err(_) => Err(PipelineError::ForecastTimeout(self.fit_timeout)),
        }
    }

    /// Run selections concurrently, at most `max_concurrent` at a time.
    /// Outcomes come back sorted by entity key.
    pub async fn run_batch(&self, selections: Vec<Selection>, max_concurrent: usize) -> Vec<RunOutcome> {
        let permits = Arc::new(Semaphore::new(max_concurrent.max(1)));
        let mut tasks = JoinSet::new();

        for selection in selections {
            let pipeline = self.clone();
            let permits = Arc::clone(&permits);
            tasks.spawn(async move {
                let _permit = permits.acquire_owned().await;
                pipeline.run(selection).await
            });
        }

        let mut outcomes = Vec::new();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(outcome) => outcomes.push(outcome),
                Err(e) => warn!(error = %e, "Batch task aborted"),
            }
        }

        outcomes.sort_by(|a, b| a.selection().key.cmp(&b.selection().key));
        outcomes
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::forecast::MstlForecaster;
    use crate::models::{ActivityType, Event, Source};
    use crate::table::fixtures::{event, key, table};
    use chrono::{Duration as ChronoDuration, NaiveDate};

    fn weekly_history(key: &EntityKey, weeks: i64, planned_minutes: f64, unplanned_minutes: f64) -> Vec<Event> {
        let monday = NaiveDate::from_ymd_opt(2023, 1, 2).unwrap();
        let mut events = Vec::new();
        for week in 0..weeks {
            let day = monday + ChronoDuration::weeks(week);
            let stamp = day.format("%Y-%m-%d").to_string();
            events.push(event(key, ActivityType::Planned, &stamp, planned_minutes));
            events.push(event(key, ActivityType::Unplanned, &stamp, unplanned_minutes));
        }
        events
    }

    fn selection(key: EntityKey) -> Selection {
        Selection {
            key,
            granularity: Granularity::Week,
            horizon: 12,
            threshold: 10,
        }
    }

    fn pipeline(events: Vec<Event>) -> Pipeline {
        Pipeline::new(
            Arc::new(table(events)),
            Arc::new(MstlForecaster::default()),
            Duration::from_secs(30),
        )
    }

    struct FlatForecaster(f64);

    impl Forecaster for FlatForecaster {
        fn name(&self) -> &str {
            "flat"
        }

        fn fit_predict(
            &self,
            series: &RegularSeries,
            horizon: usize,
        ) -> Result<Vec<ForecastPoint>, PipelineError> {
            let first = series.first_bucket().ok_or(PipelineError::InsufficientData {
                needed: 1,
                available: 0,
            })?;
            Ok((0..series.len() + horizon)
                .map(|i| ForecastPoint {
                    bucket_start: series.granularity.advance(first, i as i64),
                    expected_count: self.0,
                    lower: self.0,
                    upper: self.0,
                })
                .collect())
        }
    }

    struct StalledForecaster;

    impl Forecaster for StalledForecaster {
        fn name(&self) -> &str {
            "stalled"
        }

        fn fit_predict(
            &self,
            _series: &RegularSeries,
            _horizon: usize,
        ) -> Result<Vec<ForecastPoint>, PipelineError> {
            std::thread::sleep(std::time::Duration::from_millis(500));
            Ok(Vec::new())
        }
    }

    #[tokio::test]
    async fn full_run_produces_reconciled_series() {
        let key = key();
        let pipeline = pipeline(weekly_history(&key, 20, 30.0, 60.0));

        let outcome = pipeline.run(selection(key.clone())).await;
        let RunOutcome::Success(report) = outcome else {
            panic!("expected success, got {}", outcome.status());
        };

        assert_eq!(report.series.len(), 20);
        assert_eq!(report.forecast.len(), 32);
        assert_eq!(report.reconciliation.real().count(), 40);
        assert_eq!(report.reconciliation.predicted().count(), 12);

        let last = report.series.last_bucket().unwrap();
        assert!(report
            .reconciliation
            .predicted()
            .all(|record| record.timestamp > last));

        let metrics = report.reconciliation.metrics;
        assert!((metrics.percent_saved.unwrap() - 50.0).abs() < 1e-6);
        assert!(metrics.minutes_saved > 0.0);
        assert!(report.fit.rmse < 1e-3);
    }

    #[tokio::test]
    async fn unknown_key_is_empty_selection() {
        let pipeline = pipeline(weekly_history(&key(), 5, 30.0, 60.0));
        let missing = EntityKey::new("NOWHERE", "CAN LINE", "1");

        let outcome = pipeline.run(selection(missing.clone())).await;
        assert_eq!(outcome.problem(), Some(&PipelineError::EmptySelection(missing)));
    }

    #[tokio::test]
    async fn sparse_entity_is_ineligible() {
        let key = key();
        let pipeline = pipeline(weekly_history(&key, 3, 30.0, 60.0));

        let outcome = pipeline.run(selection(key)).await;
        assert_eq!(outcome.status(), "failure");
        assert!(matches!(outcome.problem(), Some(PipelineError::IneligibleBaseline { .. })));
    }

    #[tokio::test]
    async fn single_week_history_cannot_be_forecast() {
        let key = key();
        let mut events = Vec::new();
        for _ in 0..12 {
            events.push(event(&key, ActivityType::Planned, "2024-01-02", 30.0));
            events.push(event(&key, ActivityType::Unplanned, "2024-01-03", 60.0));
        }
        let outcome = pipeline(events).run(selection(key)).await;
        assert_eq!(
            outcome.problem(),
            Some(&PipelineError::InsufficientData {
                needed: 2,
                available: 1
            })
        );
    }

    #[tokio::test]
    async fn zero_forecast_yields_partial_outcome() {
        let key = key();
        let pipeline = Pipeline::new(
            Arc::new(table(weekly_history(&key, 20, 30.0, 60.0))),
            Arc::new(FlatForecaster(0.0)),
            Duration::from_secs(5),
        );

        match pipeline.run(selection(key)).await {
            RunOutcome::Partial { report, warning } => {
                assert_eq!(warning, PipelineError::UndefinedSavings);
                assert_eq!(report.reconciliation.predicted().count(), 12);
                assert_eq!(report.reconciliation.real().count(), 40);
                assert_eq!(report.reconciliation.metrics.percent_saved, None);
            }
            other => panic!("expected partial outcome, got {}", other.status()),
        }
    }

    #[tokio::test]
    async fn slow_forecaster_times_out() {
        let key = key();
        let pipeline = Pipeline::new(
            Arc::new(table(weekly_history(&key, 20, 30.0, 60.0))),
            Arc::new(StalledForecaster),
            Duration::from_millis(50),
        );

        let outcome = pipeline.run(selection(key)).await;
        assert_eq!(
            outcome.problem(),
            Some(&PipelineError::ForecastTimeout(Duration::from_millis(50)))
        );
    }

    #[tokio::test]
    async fn batch_isolates_failures() {
        let good = key();
        let sparse = EntityKey::new("COTA", "PALLETIZER", "42");
        let mut events = weekly_history(&good, 20, 30.0, 60.0);
        events.extend(weekly_history(&sparse, 2, 30.0, 60.0));
        let pipeline = pipeline(events);

        let selections = vec![selection(sparse.clone()), selection(good.clone())];
        let outcomes = pipeline.run_batch(selections, 2).await;

        assert_eq!(outcomes.len(), 2);
        assert_eq!(outcomes[0].selection().key, good);
        assert_eq!(outcomes[0].status(), "success");
        assert_eq!(outcomes[1].selection().key, sparse);
        assert_eq!(outcomes[1].status(), "failure");
    }

    #[tokio::test]
    async fn eligible_selections_follow_threshold() {
        let good = key();
        let sparse = EntityKey::new("COTA", "PALLETIZER", "42");
        let mut events = weekly_history(&good, 20, 30.0, 60.0);
        events.extend(weekly_history(&sparse, 2, 30.0, 60.0));
        let pipeline = pipeline(events);

        let config = PipelineConfig {
            threshold: 10,
            ..PipelineConfig::default()
        };
        let selections = pipeline.eligible_selections(&config);
        assert_eq!(selections.len(), 1);
        assert_eq!(selections[0].key, good);
        assert_eq!(selections[0].horizon, config.horizon);
    }

    #[tokio::test]
    async fn repeated_runs_are_identical() {
        let key = key();
        let pipeline = pipeline(weekly_history(&key, 15, 20.0, 45.0));

        let first = pipeline.run(selection(key.clone())).await;
        let second = pipeline.run(selection(key)).await;
        let (first, second) = (first.report().unwrap(), second.report().unwrap());

        assert_eq!(first.baseline, second.baseline);
        assert_eq!(first.series, second.series);
        assert_eq!(first.forecast, second.forecast);
        assert_eq!(first.reconciliation, second.reconciliation);
        assert!(first
            .reconciliation
            .records
            .iter()
            .any(|record| record.source == Source::Real));
    }
}
