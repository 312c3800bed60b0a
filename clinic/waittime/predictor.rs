//! Request handling: resolve defaults, featurize, score, fall back.

use std::{fmt, sync::Arc};

use serde::{Deserialize, Serialize};
use serde_json::json;
use shared_logging::LogLevel;
use thiserror::Error;

use crate::{
    boosting::InferenceError,
    features::{NormalizedVisit, VisitInput},
    store::{ModelSnapshot, ModelStore},
    telemetry::{emit, WaitTelemetry},
};

/// Estimate returned while no model has been published.
pub const DEFAULT_MEAN_MINUTES: f64 = 20.0;

/// A loosely typed request value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FieldValue {
    /// JSON boolean.
    Bool(bool),
    /// JSON integer.
    Integer(i64),
    /// JSON number with a fractional part or exponent.
    Float(f64),
    /// JSON string.
    Text(String),
    /// Any other JSON value (array or object).
    Other(serde_json::Value),
}

impl FieldValue {
    /// Whole-number reading of the value.
    ///
    /// Strings must hold an integer literal (surrounding whitespace allowed); floats are
    /// truncated toward zero; booleans read as 0 or 1. Arrays and objects never convert.
    pub fn to_integer(&self) -> Result<i64, RequestError> {
        match self {
            Self::Bool(flag) => Ok(i64::from(*flag)),
            Self::Integer(number) => Ok(*number),
            Self::Float(number) if number.is_finite() => Ok(number.trunc() as i64),
            Self::Float(_) | Self::Other(_) => Err(RequestError::NotAnInteger(self.to_string())),
            Self::Text(text) => text
                .trim()
                .parse::<i64>()
                .map_err(|_| RequestError::NotAnInteger(text.clone())),
        }
    }
}

impl fmt::Display for FieldValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bool(true) => f.write_str("True"),
            Self::Bool(false) => f.write_str("False"),
            Self::Integer(number) => write!(f, "{number}"),
            Self::Float(number) if number.is_nan() => f.write_str("nan"),
            Self::Float(number) if number.is_infinite() => {
                f.write_str(if *number > 0.0 { "inf" } else { "-inf" })
            }
            Self::Float(number) if number.fract() == 0.0 && number.abs() < 1e16 => {
                write!(f, "{number:.1}")
            }
            Self::Float(number) => write!(f, "{number}"),
            Self::Text(text) => f.write_str(text),
            Self::Other(value) => write!(f, "{value}"),
        }
    }
}

impl From<&str> for FieldValue {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

impl From<i64> for FieldValue {
    fn from(value: i64) -> Self {
        Self::Integer(value)
    }
}

/// Incoming prediction request; every field is optional.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PredictionRequest {
    /// Emergency flag.
    pub emergency: Option<FieldValue>,
    /// Doctor identifier.
    pub doctor_id: Option<FieldValue>,
    /// Doctor specialty.
    pub doctor_type: Option<FieldValue>,
    /// Visit type.
    pub visit_type: Option<FieldValue>,
    /// Day of week.
    pub day: Option<FieldValue>,
    /// Clinic setting.
    pub clinic_type: Option<FieldValue>,
    /// Patient gender.
    pub gender: Option<FieldValue>,
    /// Presenting problem.
    pub problem: Option<FieldValue>,
    /// Time of day.
    pub time: Option<FieldValue>,
    /// Patient age.
    pub age: Option<FieldValue>,
    /// Queue token number.
    pub token_no: Option<FieldValue>,
}

/// Request fields that cannot be used.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RequestError {
    /// A numeric field did not hold a whole number.
    #[error("`{0}` is not an integer")]
    NotAnInteger(String),
}

/// Request with every default applied, still un-normalized.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedRequest {
    /// Emergency flag text.
    pub emergency: String,
    /// Doctor identifier text.
    pub doctor_id: String,
    /// Doctor specialty text.
    pub doctor_type: String,
    /// Visit type text.
    pub visit_type: String,
    /// Day text.
    pub day: String,
    /// Clinic setting text.
    pub clinic_type: String,
    /// Gender text.
    pub gender: String,
    /// Problem text.
    pub problem: String,
    /// Time-of-day text.
    pub time: String,
    /// Age in whole years.
    pub age: i64,
    /// Token number.
    pub token_no: i64,
}

impl PredictionRequest {
    /// Applies per-field defaults and converts the numeric fields.
    pub fn resolve(&self) -> Result<ResolvedRequest, RequestError> {
        let text = |value: &Option<FieldValue>, default: &str| {
            value
                .as_ref()
                .map_or_else(|| default.to_string(), ToString::to_string)
        };
        let integer = |value: &Option<FieldValue>, default: i64| {
            value.as_ref().map_or(Ok(default), FieldValue::to_integer)
        };
        Ok(ResolvedRequest {
            emergency: text(&self.emergency, "normal"),
            doctor_id: text(&self.doctor_id, "unknown"),
            doctor_type: text(&self.doctor_type, "general"),
            visit_type: text(&self.visit_type, "new"),
            day: text(&self.day, "monday"),
            clinic_type: text(&self.clinic_type, "urban"),
            gender: text(&self.gender, "unknown"),
            problem: text(&self.problem, "missing"),
            time: text(&self.time, "09:00"),
            age: integer(&self.age, 30)?,
            token_no: integer(&self.token_no, 1)?,
        })
    }
}

impl ResolvedRequest {
    /// Runs the shared normalization rules.
    #[must_use]
    pub fn normalize(&self) -> NormalizedVisit {
        NormalizedVisit::from_input(&VisitInput {
            emergency: Some(&self.emergency),
            doctor_id: Some(&self.doctor_id),
            doctor_type: Some(&self.doctor_type),
            visit_type: Some(&self.visit_type),
            day: Some(&self.day),
            clinic_type: Some(&self.clinic_type),
            gender: Some(&self.gender),
            problem: Some(&self.problem),
            time: Some(&self.time),
            age: self.age as f64,
            token_no: self.token_no as f64,
        })
    }
}

/// Where an estimate came from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", content = "reason", rename_all = "snake_case")]
pub enum PredictionSource {
    /// The published model scored the request.
    Model,
    /// Nothing was published yet; the default mean was used.
    NoModel,
    /// The request or the model failed; the snapshot's global mean was used.
    Fallback(String),
}

/// Estimate plus its provenance.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PredictionResult {
    /// Minutes, rounded to two decimals and never negative.
    pub estimated_minutes: f64,
    /// Provenance.
    pub source: PredictionSource,
}

impl PredictionResult {
    /// Wire form of the estimate.
    #[must_use]
    pub const fn response(&self) -> PredictionResponse {
        PredictionResponse {
            estimated_wait_time: self.estimated_minutes,
        }
    }
}

/// JSON body returned to callers.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PredictionResponse {
    /// Estimated wait in minutes.
    pub estimated_wait_time: f64,
}

#[derive(Debug, Error)]
enum ScoreError {
    #[error(transparent)]
    Request(#[from] RequestError),
    #[error(transparent)]
    Inference(#[from] InferenceError),
}

/// Scores requests against whatever snapshot is currently published.
#[derive(Debug, Clone)]
pub struct Predictor {
    store: Arc<ModelStore>,
    default_mean: f64,
    telemetry: Option<WaitTelemetry>,
}

impl Predictor {
    /// Predictor reading from `store`, answering 20.0 until a model exists.
    #[must_use]
    pub const fn new(store: Arc<ModelStore>) -> Self {
        Self {
            store,
            default_mean: DEFAULT_MEAN_MINUTES,
            telemetry: None,
        }
    }

    /// Overrides the no-model estimate. Negative values clamp to zero; NaN and infinities
    /// keep the built-in default.
    #[must_use]
    pub fn with_default_mean(mut self, default_mean: f64) -> Self {
        self.default_mean = if default_mean.is_finite() {
            default_mean.max(0.0)
        } else {
            DEFAULT_MEAN_MINUTES
        };
        self
    }

    /// Attaches a telemetry handle.
    #[must_use]
    pub fn with_telemetry(mut self, telemetry: WaitTelemetry) -> Self {
        self.telemetry = Some(telemetry);
        self
    }

    /// Estimates the wait for one request. Always yields a number.
    #[must_use]
    pub fn predict(&self, request: &PredictionRequest) -> PredictionResult {
        let Some(snapshot) = self.store.read() else {
            return PredictionResult {
                estimated_minutes: round2(self.default_mean),
                source: PredictionSource::NoModel,
            };
        };
        match score(&snapshot, request) {
            Ok(minutes) => PredictionResult {
                estimated_minutes: round2(minutes.max(0.0)),
                source: PredictionSource::Model,
            },
            Err(err) => {
                let reason = err.to_string();
                emit(
                    self.telemetry.as_ref(),
                    LogLevel::Warn,
                    "prediction.fallback",
                    json!({ "reason": reason, "snapshot_id": snapshot.id().to_string() }),
                );
                PredictionResult {
                    estimated_minutes: round2(snapshot.global_mean_service_time()),
                    source: PredictionSource::Fallback(reason),
                }
            }
        }
    }
}

fn score(snapshot: &ModelSnapshot, request: &PredictionRequest) -> Result<f64, ScoreError> {
    let visit = request.resolve()?.normalize();
    let fallback = snapshot.global_mean_service_time();
    let features = visit.features(snapshot.problem_lookup(), fallback);
    Ok(snapshot.regressor().predict(&features)?)
}

/// Rounds half away from zero to two decimals.
#[must_use]
pub fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}
