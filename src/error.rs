use std::time::Duration;

use thiserror::Error;

use crate::models::EntityKey;

/// Failures of a single pipeline run. Every variant is scoped to one
/// selection; batch runs report them per selection and keep going.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum PipelineError {
    #[error("no dated events recorded for {0}")]
    EmptySelection(EntityKey),

    #[error("{key} is not eligible for forecasting: {reason}")]
    IneligibleBaseline { key: EntityKey, reason: String },

    #[error("insufficient data to fit forecast: need {needed} buckets, have {available}")]
    InsufficientData { needed: usize, available: usize },

    #[error("forecast model could not be fitted: {0}")]
    ModelFit(String),

    #[error("forecast did not finish within {0:?}")]
    ForecastTimeout(Duration),

    #[error("forecast task aborted: {0}")]
    ForecastTask(String),

    #[error("savings undefined: predicted unplanned minutes sum to zero")]
    UndefinedSavings,
}

impl PipelineError {
    /// Short machine-friendly label used in batch summaries.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::EmptySelection(_) => "empty_selection",
            Self::IneligibleBaseline { .. } => "ineligible_baseline",
            Self::InsufficientData { .. } => "insufficient_data",
            Self::ModelFit(_) => "model_fit",
            Self::ForecastTimeout(_) => "forecast_timeout",
            Self::ForecastTask(_) => "forecast_task",
            Self::UndefinedSavings => "undefined_savings",
        }
    }
}
