//! The published model and the lock that guards it.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::{boosting::GradientBoostedRegressor, features::ProblemLookup, trainer::TrainingReport};

/// Rejected snapshot contents.
#[derive(Debug, Error, PartialEq)]
pub enum SnapshotError {
    /// The fallback mean must be a positive number.
    #[error("global mean service time {0} is not a positive number")]
    InvalidGlobalMean(f64),
}

/// Everything a prediction needs, produced together by one training run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelSnapshot {
    id: Uuid,
    regressor: GradientBoostedRegressor,
    problem_lookup: ProblemLookup,
    global_mean_service_time: f64,
    trained_at: DateTime<Utc>,
    report: TrainingReport,
}

impl ModelSnapshot {
    /// Bundles a fitted model with the statistics it was trained against.
    pub fn new(
        regressor: GradientBoostedRegressor,
        problem_lookup: ProblemLookup,
        global_mean_service_time: f64,
        trained_at: DateTime<Utc>,
        report: TrainingReport,
    ) -> Result<Self, SnapshotError> {
        if !(global_mean_service_time.is_finite() && global_mean_service_time > 0.0) {
            return Err(SnapshotError::InvalidGlobalMean(global_mean_service_time));
        }
        Ok(Self {
            id: Uuid::new_v4(),
            regressor,
            problem_lookup,
            global_mean_service_time,
            trained_at,
            report,
        })
    }

    /// Unique id of this snapshot.
    #[must_use]
    pub const fn id(&self) -> Uuid {
        self.id
    }

    /// Fitted regressor.
    #[must_use]
    pub const fn regressor(&self) -> &GradientBoostedRegressor {
        &self.regressor
    }

    /// Per-problem mean service times.
    #[must_use]
    pub const fn problem_lookup(&self) -> &ProblemLookup {
        &self.problem_lookup
    }

    /// Mean service time over the training rows.
    #[must_use]
    pub const fn global_mean_service_time(&self) -> f64 {
        self.global_mean_service_time
    }

    /// When the run that produced this snapshot finished.
    #[must_use]
    pub const fn trained_at(&self) -> DateTime<Utc> {
        self.trained_at
    }

    /// Row counts and fit quality of the producing run.
    #[must_use]
    pub const fn report(&self) -> &TrainingReport {
        &self.report
    }
}

/// Holds the current snapshot, swapped atomically on publish.
#[derive(Debug, Default)]
pub struct ModelStore {
    current: RwLock<Option<Arc<ModelSnapshot>>>,
}

impl ModelStore {
    /// Empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Current snapshot, if one was ever published.
    #[must_use]
    pub fn read(&self) -> Option<Arc<ModelSnapshot>> {
        self.current.read().clone()
    }

    /// Replaces the current snapshot and hands back the previous one.
    pub fn publish(&self, snapshot: Arc<ModelSnapshot>) -> Option<Arc<ModelSnapshot>> {
        self.current.write().replace(snapshot)
    }

    /// True until the first publish.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.current.read().is_none()
    }

    /// Training time of the current snapshot.
    #[must_use]
    pub fn last_trained_at(&self) -> Option<DateTime<Utc>> {
        self.current.read().as_ref().map(|snapshot| snapshot.trained_at())
    }
}
