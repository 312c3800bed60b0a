use std::{
    fs,
    path::{Path, PathBuf},
    str::FromStr,
};

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use shared_logging::LogLevel;

use crate::{
    boosting::BoostingParams,
    dataset::DelimitedFileSource,
    predictor::DEFAULT_MEAN_MINUTES,
    scheduler::{DailySchedule, IST_OFFSET_MINUTES},
    telemetry::WaitTelemetry,
    trainer::TrainerSettings,
};

/// Service configuration, usually read from a TOML file.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct WaitConfig {
    /// Training data location.
    pub dataset: DatasetConfig,
    /// Split and boosting knobs.
    pub training: TrainingConfig,
    /// Nightly retraining.
    pub schedule: ScheduleConfig,
    /// Prediction defaults.
    pub prediction: PredictionConfig,
    /// Structured log output.
    pub logging: LoggingConfig,
}

/// `[dataset]` section.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct DatasetConfig {
    /// Delimited file with a header row.
    #[serde(default = "default_dataset_path")]
    pub path: PathBuf,
    /// Field delimiter.
    #[serde(default = "default_delimiter")]
    pub delimiter: char,
}

impl Default for DatasetConfig {
    fn default() -> Self {
        Self {
            path: default_dataset_path(),
            delimiter: default_delimiter(),
        }
    }
}

/// `[training]` section.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct TrainingConfig {
    /// Shuffle seed.
    #[serde(default = "default_seed")]
    pub seed: u64,
    /// Held-out share.
    #[serde(default = "default_validation_ratio")]
    pub validation_ratio: f64,
    /// Maximum boosting rounds.
    #[serde(default = "default_iterations")]
    pub iterations: usize,
    /// Shrinkage.
    #[serde(default = "default_learning_rate")]
    pub learning_rate: f64,
    /// Tree depth.
    #[serde(default = "default_depth")]
    pub depth: usize,
    /// Leaf L2 penalty.
    #[serde(default = "default_l2_leaf_reg")]
    pub l2_leaf_reg: f64,
    /// Patience in rounds.
    #[serde(default = "default_early_stopping_rounds")]
    pub early_stopping_rounds: usize,
    /// Minimum rows per leaf.
    #[serde(default = "default_min_samples_leaf")]
    pub min_samples_leaf: usize,
    /// Split borders per column.
    #[serde(default = "default_border_count")]
    pub border_count: usize,
    /// Target-encoding prior weight.
    #[serde(default = "default_category_smoothing")]
    pub category_smoothing: f64,
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            seed: default_seed(),
            validation_ratio: default_validation_ratio(),
            iterations: default_iterations(),
            learning_rate: default_learning_rate(),
            depth: default_depth(),
            l2_leaf_reg: default_l2_leaf_reg(),
            early_stopping_rounds: default_early_stopping_rounds(),
            min_samples_leaf: default_min_samples_leaf(),
            border_count: default_border_count(),
            category_smoothing: default_category_smoothing(),
        }
    }
}

/// `[schedule]` section.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ScheduleConfig {
    /// Whether the nightly job runs.
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Local hour.
    #[serde(default)]
    pub hour: u32,
    /// Local minute.
    #[serde(default)]
    pub minute: u32,
    /// Local offset from UTC.
    #[serde(default = "default_utc_offset_minutes")]
    pub utc_offset_minutes: i32,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            hour: 0,
            minute: 0,
            utc_offset_minutes: default_utc_offset_minutes(),
        }
    }
}

/// `[prediction]` section.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct PredictionConfig {
    /// Estimate served before any model exists.
    #[serde(default = "default_mean")]
    pub default_mean: f64,
}

impl Default for PredictionConfig {
    fn default() -> Self {
        Self {
            default_mean: default_mean(),
        }
    }
}

/// `[logging]` section.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct LoggingConfig {
    /// JSON-lines log file; logging is off when unset.
    #[serde(default)]
    pub path: Option<PathBuf>,
    /// Minimum level written.
    #[serde(default = "default_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            path: None,
            level: default_level(),
        }
    }
}

impl WaitConfig {
    /// Loads and validates a TOML file; relative paths resolve against its directory.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = fs::read_to_string(path)
            .with_context(|| format!("reading wait-time config {}", path.display()))?;
        let source_dir = path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        Self::parse(&raw, &source_dir).with_context(|| format!("loading {}", path.display()))
    }

    /// Parses and validates TOML text, resolving relative paths against `source_dir`.
    pub fn parse(raw: &str, source_dir: &Path) -> Result<Self> {
        let mut config: Self = toml::from_str(raw).context("parsing wait-time config")?;
        config.validate()?;
        if config.dataset.path.is_relative() {
            config.dataset.path = source_dir.join(&config.dataset.path);
        }
        if let Some(log_path) = config.logging.path.as_mut() {
            if log_path.is_relative() {
                *log_path = source_dir.join(&*log_path);
            }
        }
        Ok(config)
    }

    /// Checks ranges that serde cannot express.
    pub fn validate(&self) -> Result<()> {
        let training = &self.training;
        if !(training.validation_ratio > 0.0 && training.validation_ratio < 1.0) {
            bail!("training.validation_ratio must be in (0, 1)");
        }
        if !(self.prediction.default_mean.is_finite() && self.prediction.default_mean >= 0.0) {
            bail!("prediction.default_mean must be a non-negative number");
        }
        if self.dataset.delimiter == '"' || self.dataset.delimiter == '\n' {
            bail!("dataset.delimiter cannot be a quote or newline");
        }
        LogLevel::from_str(&self.logging.level)?;
        DailySchedule::new(
            self.schedule.hour,
            self.schedule.minute,
            self.schedule.utc_offset_minutes,
        )?;
        Ok(())
    }

    /// Trainer settings described by `[training]`.
    #[must_use]
    pub fn trainer_settings(&self) -> TrainerSettings {
        let training = &self.training;
        TrainerSettings {
            seed: training.seed,
            validation_ratio: training.validation_ratio,
            boosting: BoostingParams {
                iterations: training.iterations,
                learning_rate: training.learning_rate,
                depth: training.depth,
                l2_leaf_reg: training.l2_leaf_reg,
                min_samples_leaf: training.min_samples_leaf,
                border_count: training.border_count,
                early_stopping_rounds: training.early_stopping_rounds,
                category_smoothing: training.category_smoothing,
            },
        }
    }

    /// File source described by `[dataset]`.
    #[must_use]
    pub fn dataset_source(&self) -> DelimitedFileSource {
        DelimitedFileSource::new(&self.dataset.path).with_delimiter(self.dataset.delimiter)
    }

    /// Nightly schedule, or `None` when disabled.
    pub fn schedule(&self) -> Result<Option<DailySchedule>> {
        if !self.schedule.enabled {
            return Ok(None);
        }
        let schedule = DailySchedule::new(
            self.schedule.hour,
            self.schedule.minute,
            self.schedule.utc_offset_minutes,
        )?;
        Ok(Some(schedule))
    }

    /// Telemetry writing to `[logging].path`, or `None` when no path is set.
    pub fn telemetry(&self, module: &str) -> Result<Option<WaitTelemetry>> {
        let Some(path) = &self.logging.path else {
            return Ok(None);
        };
        let level = LogLevel::from_str(&self.logging.level)?;
        let telemetry = WaitTelemetry::builder(module)
            .log_path(path)
            .min_level(level)
            .build()
            .with_context(|| format!("opening log {}", path.display()))?;
        Ok(Some(telemetry))
    }
}

fn default_dataset_path() -> PathBuf {
    PathBuf::from("dataset.csv")
}

const fn default_delimiter() -> char {
    ','
}

const fn default_seed() -> u64 {
    42
}

const fn default_validation_ratio() -> f64 {
    0.2
}

const fn default_iterations() -> usize {
    1000
}

const fn default_learning_rate() -> f64 {
    0.05
}

const fn default_depth() -> usize {
    6
}

const fn default_l2_leaf_reg() -> f64 {
    1.0
}

const fn default_early_stopping_rounds() -> usize {
    100
}

const fn default_min_samples_leaf() -> usize {
    1
}

const fn default_border_count() -> usize {
    64
}

const fn default_category_smoothing() -> f64 {
    1.0
}

const fn default_true() -> bool {
    true
}

const fn default_utc_offset_minutes() -> i32 {
    IST_OFFSET_MINUTES
}

const fn default_mean() -> f64 {
    DEFAULT_MEAN_MINUTES
}

fn default_level() -> String {
    "info".into()
}
