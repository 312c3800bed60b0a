#![deny(
    clippy::all,
    clippy::pedantic,
    clippy::nursery,
    missing_docs,
    rust_2018_idioms
)]

//! Clinic wait-time estimation: shared feature rules, background retraining, and an
//! atomically published model that predictions read without ever blocking on training.

/// Normalization and feature derivation shared by training and inference.
#[path = "../features.rs"]
pub mod features;

/// Delimited dataset loading.
#[path = "../dataset.rs"]
pub mod dataset;

/// Gradient-boosted regression trees.
#[path = "../boosting/main.rs"]
pub mod boosting;

/// Published model snapshots.
#[path = "../store.rs"]
pub mod store;

/// Training runs with overlap suppression.
#[path = "../trainer.rs"]
pub mod trainer;

/// Request resolution and fallbacks.
#[path = "../predictor.rs"]
pub mod predictor;

/// Daily retraining scheduler.
#[path = "../scheduler.rs"]
pub mod scheduler;

/// TOML configuration.
#[path = "../config.rs"]
pub mod config;

/// Telemetry helpers.
#[path = "../telemetry.rs"]
pub mod telemetry;

/// Wiring of store, trainer, predictor and scheduler.
#[path = "../service.rs"]
pub mod service;

pub use boosting::{BoostingParams, FitError, GradientBoostedRegressor, InferenceError};
pub use config::WaitConfig;
pub use dataset::{DatasetError, DatasetSource, DelimitedFileSource, InMemorySource, RawRecord};
pub use features::{
    build_priority_chain, lookup_complexity, normalize_category, parse_time_to_minutes,
    FeatureVector, NormalizedVisit, ProblemLookup, VisitInput,
};
pub use predictor::{
    FieldValue, PredictionRequest, PredictionResponse, PredictionResult, PredictionSource,
    Predictor, RequestError, ResolvedRequest,
};
pub use scheduler::{DailySchedule, RetrainScheduler, SchedulerHandle, SchedulerStatus};
pub use service::WaitTimeService;
pub use store::{ModelSnapshot, ModelStore, SnapshotError};
pub use telemetry::{WaitTelemetry, WaitTelemetryBuilder};
pub use trainer::{Trainer, TrainerSettings, TrainingError, TrainingOutcome, TrainingReport};
