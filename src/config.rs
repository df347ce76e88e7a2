//! Pipeline configuration loaded from TOML.
//!
//! Search order:
//! 1. An explicit path (`--config` or `MAINTENANCE_FORECAST_CONFIG`)
//! 2. `forecast.toml` in the current working directory
//! 3. Built-in defaults
//!
//! Every field has a default, so a config file only needs the keys it changes.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

use crate::models::Granularity;

pub const DEFAULT_CONFIG_FILE: &str = "forecast.toml";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("config I/O error ({}): {}", .0.display(), .1)]
    Io(PathBuf, #[source] std::io::Error),

    #[error("config parse error ({}): {}", .0.display(), .1)]
    Parse(PathBuf, #[source] toml::de::Error),

    #[error("config validation failed:\n  - {}", .0.join("\n  - "))]
    Validation(Vec<String>),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Minimum sample count (exclusive) either activity type must exceed.
    pub threshold: usize,
    pub granularity: Granularity,
    /// Future buckets forecast past the last observed bucket.
    pub horizon: usize,
    pub fit_timeout_secs: u64,
    pub max_concurrent_runs: usize,
    pub columns: ColumnConfig,
    pub model: ModelConfig,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            threshold: 50,
            granularity: Granularity::Week,
            horizon: 48,
            fit_timeout_secs: 60,
            max_concurrent_runs: 4,
            columns: ColumnConfig::default(),
            model: ModelConfig::default(),
        }
    }
}

/// Header names of the six core columns in the work-order extract.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ColumnConfig {
    pub location: String,
    pub functional_area: String,
    pub equipment_id: String,
    pub activity_type: String,
    pub start_timestamp: String,
    pub duration_minutes: String,
}

impl Default for ColumnConfig {
    fn default() -> Self {
        Self {
            location: "PRODUCTION_LOCATION".to_string(),
            functional_area: "FUNCTIONAL_AREA_NODE_2_MODIFIED".to_string(),
            equipment_id: "EQUIPMENT_ID".to_string(),
            activity_type: "MAINTENANCE_ACTIVITY_TYPE".to_string(),
            start_timestamp: "EXECUTION_START_DATE".to_string(),
            duration_minutes: "ACTUAL_WORK_IN_MINUTES".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    /// Width of the central prediction interval, e.g. 0.8 for 10%..90%.
    pub interval_width: f64,
    /// 7-day season, daily buckets only.
    pub weekly_seasonality: bool,
    pub yearly_seasonality: bool,
    pub min_buckets: usize,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            interval_width: 0.8,
            weekly_seasonality: true,
            yearly_seasonality: true,
            min_buckets: 2,
        }
    }
}

impl PipelineConfig {
    /// Load using the standard search order. An explicit path that cannot be
    /// read or parsed is an error; the implicit `forecast.toml` falls back to
    /// defaults with a warning.
    pub fn load(explicit: Option<&Path>) -> Result<Self, ConfigError> {
        Self::load_in(explicit, Path::new("."))
    }

    /// Same as [`load`](Self::load), looking for `forecast.toml` in `base_dir`.
    pub fn load_in(explicit: Option<&Path>, base_dir: &Path) -> Result<Self, ConfigError> {
        if let Some(path) = explicit {
            let config = Self::load_from_file(path)?;
            info!(path = %path.display(), "Loaded pipeline config");
            return Ok(config);
        }

        let local = base_dir.join(DEFAULT_CONFIG_FILE);
        if local.exists() {
            match Self::load_from_file(&local) {
                Ok(config) => {
                    info!(path = %local.display(), "Loaded pipeline config");
                    return Ok(config);
                }
                Err(e) => {
                    warn!(path = %local.display(), error = %e, "Ignoring invalid config, using defaults");
                }
            }
        }

        Ok(Self::default())
    }

    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let contents =
            std::fs::read_to_string(path).map_err(|e| ConfigError::Io(path.to_path_buf(), e))?;
        let config: Self =
            toml::from_str(&contents).map_err(|e| ConfigError::Parse(path.to_path_buf(), e))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut errors = Vec::new();

        if self.horizon == 0 {
            errors.push("horizon must be at least 1".to_string());
        }
        if self.fit_timeout_secs == 0 {
            errors.push("fit_timeout_secs must be at least 1".to_string());
        }
        if self.max_concurrent_runs == 0 {
            errors.push("max_concurrent_runs must be at least 1".to_string());
        }
        let width = self.model.interval_width;
        if !(width > 0.0 && width < 1.0) {
            errors.push(format!("model.interval_width must be in (0, 1), got {width}"));
        }
        if self.model.min_buckets < 2 {
            errors.push(format!(
                "model.min_buckets must be at least 2, got {}",
                self.model.min_buckets
            ));
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::Validation(errors))
        }
    }

    pub fn fit_timeout(&self) -> Duration {
        Duration::from_secs(self.fit_timeout_secs)
    }
}
