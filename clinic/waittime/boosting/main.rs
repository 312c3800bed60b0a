//! Gradient-boosted regression trees over engineered visit features.
//!
//! Categorical columns are target-encoded on the training split, every column is bucketed
//! into quantile borders, and shallow least-squares trees are added one round at a time.
//! The held-out split drives early stopping and the ensemble is cut back to its best round.

/// Quantile borders and pre-bucketed training rows.
pub mod binning;
/// Smoothed target encoding of categorical columns.
pub mod encoder;
/// Split, error and averaging helpers.
pub mod func;
/// Regression trees.
pub mod tree;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::features::{FeatureVector, FEATURE_COUNT, FEATURE_NAMES};
use binning::{BinnedMatrix, FeatureBorders};
use encoder::TargetEncoder;
use tree::{RegressionTree, TreeParams};

/// Boosting hyperparameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BoostingParams {
    /// Maximum number of boosting rounds.
    pub iterations: usize,
    /// Shrinkage applied to every tree.
    pub learning_rate: f64,
    /// Tree depth.
    pub depth: usize,
    /// L2 penalty on leaf values.
    pub l2_leaf_reg: f64,
    /// Minimum rows on each side of a split.
    pub min_samples_leaf: usize,
    /// Maximum split borders per column.
    pub border_count: usize,
    /// Rounds without validation improvement before stopping.
    pub early_stopping_rounds: usize,
    /// Prior weight used by the categorical target encoder.
    pub category_smoothing: f64,
}

impl Default for BoostingParams {
    fn default() -> Self {
        Self {
            iterations: 1000,
            learning_rate: 0.05,
            depth: 6,
            l2_leaf_reg: 1.0,
            min_samples_leaf: 1,
            border_count: 64,
            early_stopping_rounds: 100,
            category_smoothing: 1.0,
        }
    }
}

impl BoostingParams {
    fn validate(&self) -> Result<(), FitError> {
        let problem = if self.iterations == 0 {
            Some("iterations must be positive")
        } else if !(self.learning_rate > 0.0 && self.learning_rate <= 1.0) {
            Some("learning_rate must be in (0, 1]")
        } else if self.depth == 0 || self.depth > 16 {
            Some("depth must be in 1..=16")
        } else if !(self.l2_leaf_reg.is_finite() && self.l2_leaf_reg >= 0.0) {
            Some("l2_leaf_reg must be a non-negative number")
        } else if self.border_count == 0 || self.border_count > usize::from(u16::MAX) - 1 {
            Some("border_count must be in 1..65535")
        } else if self.early_stopping_rounds == 0 {
            Some("early_stopping_rounds must be positive")
        } else if !(self.category_smoothing.is_finite() && self.category_smoothing > 0.0) {
            Some("category_smoothing must be positive")
        } else {
            None
        };
        problem.map_or(Ok(()), |reason| Err(FitError::InvalidParams(reason)))
    }

    const fn tree_params(&self) -> TreeParams {
        TreeParams {
            depth: self.depth,
            l2_leaf_reg: self.l2_leaf_reg,
            min_samples_leaf: self.min_samples_leaf,
        }
    }
}

/// Reasons a model fit is abandoned.
#[derive(Debug, Error, PartialEq)]
pub enum FitError {
    /// No training rows were provided.
    #[error("training split is empty")]
    EmptyTrainingSet,
    /// Feature rows and targets differ in length.
    #[error("{rows} feature rows but {targets} targets")]
    LengthMismatch {
        /// Feature rows.
        rows: usize,
        /// Targets.
        targets: usize,
    },
    /// A feature value is NaN or infinite.
    #[error("feature `{feature}` is not finite")]
    NonFiniteFeature {
        /// Column name.
        feature: &'static str,
    },
    /// A target is NaN or infinite.
    #[error("training target is not finite")]
    NonFiniteTarget,
    /// Hyperparameters are out of range.
    #[error("invalid boosting parameters: {0}")]
    InvalidParams(&'static str),
}

/// Reasons a single prediction cannot be produced.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum InferenceError {
    /// An input feature is NaN or infinite.
    #[error("feature `{feature}` is not finite")]
    NonFiniteFeature {
        /// Column name.
        feature: &'static str,
    },
    /// The ensemble produced NaN or infinity.
    #[error("model output is not finite")]
    NonFiniteOutput,
}

/// Fitted boosting ensemble.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GradientBoostedRegressor {
    encoder: TargetEncoder,
    base: f64,
    learning_rate: f64,
    trees: Vec<RegressionTree>,
    validation_rmse: f64,
}

impl GradientBoostedRegressor {
    /// Fits an ensemble on `train`, early-stopping on `validation`.
    ///
    /// With an empty validation split the training error drives early stopping instead.
    pub fn fit(
        train: &[FeatureVector],
        train_targets: &[f64],
        validation: &[FeatureVector],
        validation_targets: &[f64],
        params: &BoostingParams,
    ) -> Result<Self, FitError> {
        params.validate()?;
        if train.is_empty() {
            return Err(FitError::EmptyTrainingSet);
        }
        for (rows, targets) in [(train, train_targets), (validation, validation_targets)] {
            if rows.len() != targets.len() {
                return Err(FitError::LengthMismatch {
                    rows: rows.len(),
                    targets: targets.len(),
                });
            }
            if targets.iter().any(|target| !target.is_finite()) {
                return Err(FitError::NonFiniteTarget);
            }
        }

        let encoder = TargetEncoder::fit(train, train_targets, params.category_smoothing);
        let train_rows = encode_all(&encoder, train)?;
        let validation_rows = encode_all(&encoder, validation)?;
        let borders = FeatureBorders::fit(&train_rows, params.border_count);
        let binned = BinnedMatrix::new(&train_rows, &borders);

        let base = func::mean(train_targets);
        let mut train_predictions = vec![base; train.len()];
        let mut validation_predictions = vec![base; validation.len()];
        let score = |train_predictions: &[f64], validation_predictions: &[f64]| {
            if validation.is_empty() {
                func::rmse(train_predictions, train_targets)
            } else {
                func::rmse(validation_predictions, validation_targets)
            }
        };

        let mut best_rmse = score(&train_predictions, &validation_predictions);
        let mut best_rounds = 0;
        let mut trees = Vec::new();
        let tree_params = params.tree_params();

        for round in 1..=params.iterations {
            let residuals: Vec<f64> = train_targets
                .iter()
                .zip(&train_predictions)
                .map(|(target, prediction)| target - prediction)
                .collect();
            let tree = tree::grow(
                &binned,
                &borders,
                &residuals,
                (0..train.len()).collect(),
                tree_params,
            );
            for (prediction, row) in train_predictions.iter_mut().zip(&train_rows) {
                *prediction += params.learning_rate * tree.predict(row);
            }
            for (prediction, row) in validation_predictions.iter_mut().zip(&validation_rows) {
                *prediction += params.learning_rate * tree.predict(row);
            }
            trees.push(tree);

            let current = score(&train_predictions, &validation_predictions);
            if current < best_rmse {
                best_rmse = current;
                best_rounds = round;
            } else if round - best_rounds >= params.early_stopping_rounds {
                break;
            }
        }
        trees.truncate(best_rounds);

        Ok(Self {
            encoder,
            base,
            learning_rate: params.learning_rate,
            trees,
            validation_rmse: best_rmse,
        })
    }

    /// Predicts the service time of one visit.
    pub fn predict(&self, features: &FeatureVector) -> Result<f64, InferenceError> {
        let row = self.encoder.encode(features);
        if let Some(column) = row.iter().position(|value| !value.is_finite()) {
            return Err(InferenceError::NonFiniteFeature {
                feature: FEATURE_NAMES[column],
            });
        }
        let output = self.base
            + self.learning_rate * self.trees.iter().map(|tree| tree.predict(&row)).sum::<f64>();
        if output.is_finite() {
            Ok(output)
        } else {
            Err(InferenceError::NonFiniteOutput)
        }
    }

    /// Trees kept after early stopping.
    #[must_use]
    pub fn tree_count(&self) -> usize {
        self.trees.len()
    }

    /// Best validation RMSE seen while fitting.
    #[must_use]
    pub const fn validation_rmse(&self) -> f64 {
        self.validation_rmse
    }

    /// Mean training target the ensemble starts from.
    #[must_use]
    pub const fn base_prediction(&self) -> f64 {
        self.base
    }
}

fn encode_all(
    encoder: &TargetEncoder,
    rows: &[FeatureVector],
) -> Result<Vec<[f64; FEATURE_COUNT]>, FitError> {
    rows.iter()
        .map(|row| {
            let dense = encoder.encode(row);
            match dense.iter().position(|value| !value.is_finite()) {
                Some(column) => Err(FitError::NonFiniteFeature {
                    feature: FEATURE_NAMES[column],
                }),
                None => Ok(dense),
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::features::{NormalizedVisit, ProblemLookup, VisitInput};

    fn visit(doctor: &str, token_no: f64) -> FeatureVector {
        NormalizedVisit::from_input(&VisitInput {
            doctor_id: Some(doctor),
            visit_type: Some("new"),
            time: Some("10:00"),
            age: 40.0,
            token_no,
            ..VisitInput::default()
        })
        .features(&ProblemLookup::default(), 15.0)
    }

    /// Service time grows with the token number and doctor `b` is slower.
    fn sample(count: usize) -> (Vec<FeatureVector>, Vec<f64>) {
        (0..count)
            .map(|i| {
                let doctor = if i % 2 == 0 { "a" } else { "b" };
                let token = (i % 15) as f64 + 1.0;
                let target = 5.0 + token + if doctor == "b" { 10.0 } else { 0.0 };
                (visit(doctor, token), target)
            })
            .unzip()
    }

    fn small_params() -> BoostingParams {
        BoostingParams {
            iterations: 200,
            learning_rate: 0.2,
            depth: 3,
            early_stopping_rounds: 20,
            ..BoostingParams::default()
        }
    }

    #[test]
    fn boosting_beats_the_mean() {
        let (rows, targets) = sample(60);
        let (train_idx, valid_idx) = func::train_validation_split(rows.len(), 0.2, 42);
        let pick = |idx: &[usize]| -> (Vec<FeatureVector>, Vec<f64>) {
            idx.iter().map(|i| (rows[*i].clone(), targets[*i])).unzip()
        };
        let (train, train_y) = pick(&train_idx);
        let (valid, valid_y) = pick(&valid_idx);
        let model = GradientBoostedRegressor::fit(&train, &train_y, &valid, &valid_y, &small_params()).unwrap();

        let baseline = func::rmse(&vec![func::mean(&train_y); valid_y.len()], &valid_y);
        assert!(model.validation_rmse() < baseline / 2.0);
        assert!(model.tree_count() > 0);
        let slow = model.predict(&visit("b", 15.0)).unwrap();
        let fast = model.predict(&visit("a", 1.0)).unwrap();
        assert!(slow > fast);
    }

    #[test]
    fn fitting_is_deterministic() {
        let (rows, targets) = sample(40);
        let first = GradientBoostedRegressor::fit(&rows[..30], &targets[..30], &rows[30..], &targets[30..], &small_params()).unwrap();
        let second = GradientBoostedRegressor::fit(&rows[..30], &targets[..30], &rows[30..], &targets[30..], &small_params()).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn early_stopping_keeps_only_improving_rounds() {
        let (rows, targets) = sample(20);
        // constant targets: the first round cannot improve on the mean
        let flat = vec![12.0; targets.len()];
        let model = GradientBoostedRegressor::fit(&rows[..15], &flat[..15], &rows[15..], &flat[15..], &small_params()).unwrap();
        assert_eq!(model.tree_count(), 0);
        assert!((model.base_prediction() - 12.0).abs() < 1e-12);
        assert!((model.predict(&rows[0]).unwrap() - 12.0).abs() < 1e-12);
    }

    #[test]
    fn rejects_bad_inputs() {
        let (rows, targets) = sample(10);
        assert_eq!(
            GradientBoostedRegressor::fit(&[], &[], &[], &[], &small_params()).unwrap_err(),
            FitError::EmptyTrainingSet
        );
        assert!(matches!(
            GradientBoostedRegressor::fit(&rows, &targets[..3], &[], &[], &small_params()),
            Err(FitError::LengthMismatch { rows: 10, targets: 3 })
        ));
        let mut bad = rows.clone();
        bad[0].age = f64::NAN;
        assert_eq!(
            GradientBoostedRegressor::fit(&bad, &targets, &[], &[], &small_params()).unwrap_err(),
            FitError::NonFiniteFeature { feature: "age" }
        );
        let params = BoostingParams {
            learning_rate: 0.0,
            ..small_params()
        };
        assert!(matches!(
            GradientBoostedRegressor::fit(&rows, &targets, &[], &[], &params),
            Err(FitError::InvalidParams(_))
        ));
    }

    #[test]
    fn prediction_rejects_non_finite_features() {
        let (rows, targets) = sample(20);
        let model = GradientBoostedRegressor::fit(&rows, &targets, &[], &[], &small_params()).unwrap();
        let mut infinite = rows[0].clone();
        infinite.token_no = f64::INFINITY;
        assert_eq!(
            model.predict(&infinite).unwrap_err(),
            InferenceError::NonFiniteFeature { feature: "token_no" }
        );
    }
}
