//! Training runs: load, clean, engineer features, fit, publish.

use std::sync::Arc;

use chrono::Utc;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::json;
use shared_logging::LogLevel;
use thiserror::Error;

use crate::{
    boosting::{func, BoostingParams, FitError, GradientBoostedRegressor},
    dataset::{DatasetError, DatasetSource, RawRecord},
    features::{FeatureVector, NormalizedVisit, ProblemLookup, VisitInput},
    store::{ModelSnapshot, ModelStore, SnapshotError},
    telemetry::{emit, WaitTelemetry},
};

/// Fewest cleaned rows that still allow a train/validation split.
pub const MIN_TRAINING_ROWS: usize = 2;

/// Knobs for a training run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainerSettings {
    /// Seed for the train/validation shuffle.
    pub seed: u64,
    /// Share of cleaned rows held out for early stopping.
    pub validation_ratio: f64,
    /// Boosting hyperparameters.
    pub boosting: BoostingParams,
}

impl Default for TrainerSettings {
    fn default() -> Self {
        Self {
            seed: 42,
            validation_ratio: 0.2,
            boosting: BoostingParams::default(),
        }
    }
}

/// Summary of a finished run, carried by its snapshot.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TrainingReport {
    /// Rows read from the source.
    pub total_records: usize,
    /// Rows that survived cleaning.
    pub usable_rows: usize,
    /// Rows dropped for missing or malformed fields.
    pub dropped_rows: usize,
    /// Rows used to grow trees.
    pub train_rows: usize,
    /// Rows held out for early stopping.
    pub validation_rows: usize,
    /// Trees kept after early stopping.
    pub trees: usize,
    /// RMSE of the kept ensemble on the held-out rows.
    pub validation_rmse: f64,
}

/// Reasons a training run is abandoned.
#[derive(Debug, Error)]
pub enum TrainingError {
    /// The dataset could not be read or did not pass validation.
    #[error("data validation failed: {0}")]
    DataValidation(#[from] DatasetError),
    /// The regressor could not be fitted.
    #[error("model fit failed: {0}")]
    Fit(#[from] FitError),
    /// The fitted model could not be packaged.
    #[error("snapshot rejected: {0}")]
    Snapshot(#[from] SnapshotError),
}

/// Result of [`Trainer::train`].
#[derive(Debug)]
pub enum TrainingOutcome {
    /// A new snapshot was published.
    Trained(Arc<ModelSnapshot>),
    /// Another run held the guard; nothing was done.
    SkippedOverlap,
    /// The run was abandoned and the previous snapshot kept.
    Failed(TrainingError),
}

impl TrainingOutcome {
    /// Short label for logs and CLI output.
    #[must_use]
    pub const fn label(&self) -> &'static str {
        match self {
            Self::Trained(_) => "trained",
            Self::SkippedOverlap => "skipped_overlap",
            Self::Failed(_) => "failed",
        }
    }

    /// Published snapshot, if the run succeeded.
    #[must_use]
    pub const fn snapshot(&self) -> Option<&Arc<ModelSnapshot>> {
        match self {
            Self::Trained(snapshot) => Some(snapshot),
            _ => None,
        }
    }
}

struct PreparedRow {
    visit: NormalizedVisit,
    service_time: f64,
}

/// Runs training and publishes into a [`ModelStore`], one run at a time.
pub struct Trainer {
    store: Arc<ModelStore>,
    settings: TrainerSettings,
    guard: Mutex<()>,
    telemetry: Option<WaitTelemetry>,
}

impl std::fmt::Debug for Trainer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Trainer")
            .field("settings", &self.settings)
            .field("running", &self.guard.is_locked())
            .finish_non_exhaustive()
    }
}

impl Trainer {
    /// Trainer publishing into `store`.
    #[must_use]
    pub fn new(store: Arc<ModelStore>, settings: TrainerSettings) -> Self {
        Self {
            store,
            settings,
            guard: Mutex::new(()),
            telemetry: None,
        }
    }

    /// Attaches a telemetry handle.
    #[must_use]
    pub fn with_telemetry(mut self, telemetry: WaitTelemetry) -> Self {
        self.telemetry = Some(telemetry);
        self
    }

    /// Store this trainer publishes into.
    #[must_use]
    pub const fn store(&self) -> &Arc<ModelStore> {
        &self.store
    }

    /// Active settings.
    #[must_use]
    pub const fn settings(&self) -> &TrainerSettings {
        &self.settings
    }

    /// True while a run holds the guard.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.guard.is_locked()
    }

    /// Runs one training pass unless another is already in flight.
    ///
    /// Never panics on bad data: failures come back as [`TrainingOutcome::Failed`] and the
    /// store keeps whatever it held before.
    pub fn train(&self, source: &dyn DatasetSource) -> TrainingOutcome {
        let Some(_running) = self.guard.try_lock() else {
            emit(
                self.telemetry.as_ref(),
                LogLevel::Warn,
                "training.skipped_overlap",
                json!({ "source": source.describe() }),
            );
            return TrainingOutcome::SkippedOverlap;
        };
        emit(
            self.telemetry.as_ref(),
            LogLevel::Info,
            "training.started",
            json!({ "source": source.describe() }),
        );

        let fitted = source
            .load()
            .map_err(TrainingError::from)
            .and_then(|records| self.fit(&records));
        match fitted {
            Ok(snapshot) => {
                let snapshot = Arc::new(snapshot);
                let report = snapshot.report();
                emit(
                    self.telemetry.as_ref(),
                    LogLevel::Info,
                    "training.completed",
                    json!({
                        "snapshot_id": snapshot.id().to_string(),
                        "usable_rows": report.usable_rows,
                        "dropped_rows": report.dropped_rows,
                        "trees": report.trees,
                        "validation_rmse": report.validation_rmse,
                        "global_mean": snapshot.global_mean_service_time(),
                    }),
                );
                self.store.publish(Arc::clone(&snapshot));
                TrainingOutcome::Trained(snapshot)
            }
            Err(err) => {
                emit(
                    self.telemetry.as_ref(),
                    LogLevel::Error,
                    "training.failed",
                    json!({ "error": err.to_string() }),
                );
                TrainingOutcome::Failed(err)
            }
        }
    }

    /// Builds a snapshot from raw records without touching the store or the guard.
    pub fn fit(&self, records: &[RawRecord]) -> Result<ModelSnapshot, TrainingError> {
        let prepared: Vec<PreparedRow> = records.iter().filter_map(prepare_row).collect();
        if prepared.len() < MIN_TRAINING_ROWS {
            return Err(DatasetError::InsufficientRows {
                usable: prepared.len(),
                required: MIN_TRAINING_ROWS,
            }
            .into());
        }

        let lookup = ProblemLookup::from_observations(
            prepared
                .iter()
                .map(|row| (row.visit.problem.as_str(), row.service_time)),
        );
        let targets: Vec<f64> = prepared.iter().map(|row| row.service_time).collect();
        let global_mean = func::mean(&targets);
        let features: Vec<FeatureVector> = prepared
            .iter()
            .map(|row| row.visit.features(&lookup, global_mean))
            .collect();

        let (train_idx, validation_idx) = func::train_validation_split(
            prepared.len(),
            self.settings.validation_ratio,
            self.settings.seed,
        );
        let (train, train_targets) = select(&features, &targets, &train_idx);
        let (validation, validation_targets) = select(&features, &targets, &validation_idx);
        let regressor = GradientBoostedRegressor::fit(
            &train,
            &train_targets,
            &validation,
            &validation_targets,
            &self.settings.boosting,
        )?;

        let report = TrainingReport {
            total_records: records.len(),
            usable_rows: prepared.len(),
            dropped_rows: records.len() - prepared.len(),
            train_rows: train.len(),
            validation_rows: validation.len(),
            trees: regressor.tree_count(),
            validation_rmse: regressor.validation_rmse(),
        };
        Ok(ModelSnapshot::new(
            regressor,
            lookup,
            global_mean,
            Utc::now(),
            report,
        )?)
    }
}

fn prepare_row(record: &RawRecord) -> Option<PreparedRow> {
    if !record.is_complete() {
        return None;
    }
    let service_time = parse_number(record.service_time.as_deref())?;
    if service_time <= 0.0 {
        return None;
    }
    let age = parse_number(record.age.as_deref())?;
    let token_no = parse_number(record.token_no.as_deref())?;
    let visit = NormalizedVisit::from_input(&VisitInput {
        emergency: record.emergency.as_deref(),
        doctor_id: record.doctor_id.as_deref(),
        doctor_type: record.doctor_type.as_deref(),
        visit_type: record.visit_type.as_deref(),
        day: record.day.as_deref(),
        clinic_type: record.clinic_type.as_deref(),
        gender: record.gender.as_deref(),
        problem: record.problem.as_deref(),
        time: record.time.as_deref(),
        age,
        token_no,
    });
    Some(PreparedRow {
        visit,
        service_time,
    })
}

fn parse_number(value: Option<&str>) -> Option<f64> {
    value?
        .trim()
        .parse::<f64>()
        .ok()
        .filter(|number| number.is_finite())
}

fn select(features: &[FeatureVector], targets: &[f64], indices: &[usize]) -> (Vec<FeatureVector>, Vec<f64>) {
    indices
        .iter()
        .map(|idx| (features[*idx].clone(), targets[*idx]))
        .unzip()
}
