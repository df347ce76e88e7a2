//! Event-volume forecasting.
//!
//! [`Forecaster`] is the seam the pipeline calls through; any model that can
//! fit a regular count series and emit one point per bucket (history plus
//! horizon) can be plugged in. [`MstlForecaster`] is the default and adapts
//! `augurs`: an additive MSTL decomposition over every seasonal period the
//! history can support, with AutoETS modelling the trend. Without a usable
//! season it falls back to a non-seasonal AutoETS.

use std::collections::HashMap;

use anofox_forecast::utils::calculate_metrics;
use augurs::ets::AutoETS;
use augurs::mstl::MSTLModel;
use augurs::prelude::*;
use augurs::Forecast;
use chrono::NaiveDate;
use serde::Serialize;
use tracing::debug;

use crate::config::ModelConfig;
use crate::error::PipelineError;
use crate::models::{ForecastPoint, Granularity, RegularSeries};

const WEEK_IN_DAYS: usize = 7;
const YEAR_IN_DAYS: usize = 365;
const YEAR_IN_WEEKS: usize = 52;

pub trait Forecaster: Send + Sync {
    fn name(&self) -> &str;

    /// Fit on `series` and return one point per training bucket followed by
    /// `horizon` future buckets at the series' granularity.
    fn fit_predict(
        &self,
        series: &RegularSeries,
        horizon: usize,
    ) -> Result<Vec<ForecastPoint>, PipelineError>;
}

#[derive(Debug, Clone)]
pub struct MstlForecaster {
    config: ModelConfig,
}

impl MstlForecaster {
    pub fn new(config: ModelConfig) -> Self {
        Self { config }
    }

    /// Seasonal periods, in buckets, covered by at least two full cycles.
    fn seasonal_periods(&self, series: &RegularSeries) -> Vec<usize> {
        let mut periods = Vec::new();
        if self.config.weekly_seasonality && series.granularity == Granularity::Day {
            periods.push(WEEK_IN_DAYS);
        }
        if self.config.yearly_seasonality {
            periods.push(match series.granularity {
                Granularity::Day => YEAR_IN_DAYS,
                Granularity::Week => YEAR_IN_WEEKS,
            });
        }
        periods.retain(|period| series.len() >= 2 * period);
        periods
    }
}

impl Default for MstlForecaster {
    fn default() -> Self {
        Self::new(ModelConfig::default())
    }
}

impl Forecaster for MstlForecaster {
    fn name(&self) -> &str {
        "mstl-ets"
    }

    fn fit_predict(
        &self,
        series: &RegularSeries,
        horizon: usize,
    ) -> Result<Vec<ForecastPoint>, PipelineError> {
        let n = series.len();
        let needed = self.config.min_buckets.max(2);
        let Some(first) = series.first_bucket().filter(|_| n >= needed) else {
            return Err(PipelineError::InsufficientData {
                needed,
                available: n,
            });
        };
        let bucket_at = |i: usize| series.granularity.advance(first, i as i64);

        let values = series.values();
        // ETS has no variance to fit on a constant history.
        if let Some(&level) = values.first().filter(|&&v| values.iter().all(|&x| x == v)) {
            debug!(buckets = n, level, "Constant history, projecting flat");
            return Ok((0..n + horizon)
                .map(|i| ForecastPoint {
                    bucket_start: bucket_at(i),
                    expected_count: level,
                    lower: level,
                    upper: level,
                })
                .collect());
        }

        let periods = self.seasonal_periods(series);
        let level = self.config.interval_width;
        let (history, future) = if periods.is_empty() {
            project(AutoETS::non_seasonal(), &values, horizon, level)?
        } else {
            let trend = AutoETS::non_seasonal().into_trend_model();
            project(MSTLModel::new(periods.clone(), trend), &values, horizon, level)?
        };

        debug!(
            buckets = n,
            horizon,
            periods = ?periods,
            "Fitted seasonal forecaster"
        );

        let segments = std::iter::once((0, &history)).chain(future.iter().map(|f| (n, f)));
        let mut points = Vec::with_capacity(n + horizon);
        for (offset, forecast) in segments {
            for (i, &yhat) in forecast.point.iter().enumerate() {
                let (lower, upper) = bounds(forecast, i);
                points.push(ForecastPoint {
                    bucket_start: bucket_at(offset + i),
                    expected_count: yhat.max(0.0),
                    lower: lower.min(yhat).max(0.0),
                    upper: upper.max(yhat).max(0.0),
                });
            }
        }

        Ok(points)
    }
}

/// Fit `model` once, then produce the in-sample and out-of-sample forecasts.
fn project<M>(
    model: M,
    values: &[f64],
    horizon: usize,
    level: f64,
) -> Result<(Forecast, Option<Forecast>), PipelineError>
where
    M: Fit,
    M::Error: std::fmt::Display,
    M::Fitted: Predict,
    <M::Fitted as Predict>::Error: std::fmt::Display,
{
    let fitted = model
        .fit(values)
        .map_err(|e| PipelineError::ModelFit(format!("fit failed: {e}")))?;
    let history = fitted
        .predict_in_sample(level)
        .map_err(|e| PipelineError::ModelFit(format!("in-sample prediction failed: {e}")))?;
    let future = if horizon == 0 {
        None
    } else {
        let forecast = fitted
            .predict(horizon, level)
            .map_err(|e| PipelineError::ModelFit(format!("prediction failed: {e}")))?;
        Some(forecast)
    };
    Ok((history, future))
}

fn bounds(forecast: &Forecast, i: usize) -> (f64, f64) {
    let point = forecast.point[i];
    match &forecast.intervals {
        Some(intervals) => (
            intervals.lower.get(i).copied().unwrap_or(point),
            intervals.upper.get(i).copied().unwrap_or(point),
        ),
        None => (point, point),
    }
}

/// In-sample error of the retrodiction points against the observed counts.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct FitQuality {
    pub buckets: usize,
    pub mae: f64,
    pub rmse: f64,
    pub r_squared: f64,
}

pub fn fit_quality(series: &RegularSeries, forecast: &[ForecastPoint]) -> FitQuality {
    let predicted: HashMap<NaiveDate, f64> = forecast
        .iter()
        .map(|point| (point.bucket_start, point.expected_count))
        .collect();

    let (actual, fitted): (Vec<f64>, Vec<f64>) = series
        .buckets
        .iter()
        .filter_map(|bucket| {
            predicted
                .get(&bucket.start)
                .map(|&expected| (bucket.count as f64, expected))
        })
        .unzip();

    match calculate_metrics(&actual, &fitted, None) {
        Ok(metrics) => FitQuality {
            buckets: actual.len(),
            mae: metrics.mae,
            rmse: metrics.rmse,
            r_squared: metrics.r_squared,
        },
        Err(e) => {
            debug!(error = %e, "No retrodiction points to score");
            FitQuality {
                buckets: 0,
                mae: 0.0,
                rmse: 0.0,
                r_squared: 0.0,
            }
        }
    }
}
