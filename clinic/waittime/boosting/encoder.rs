use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::features::{FeatureValue, FeatureVector, FEATURE_COUNT};

/// Replaces categorical levels with smoothed training-target means.
///
/// A level seen `n` times with target sum `s` encodes as `(s + prior * k) / (n + k)`, where
/// `prior` is the overall training mean and `k` the smoothing weight. Levels never seen in
/// training encode as `prior`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TargetEncoder {
    prior: f64,
    smoothing: f64,
    tables: Vec<IndexMap<String, f64>>,
}

impl TargetEncoder {
    /// Learns one table per categorical column.
    #[must_use]
    pub fn fit(rows: &[FeatureVector], targets: &[f64], smoothing: f64) -> Self {
        let prior = super::func::mean(targets);
        let mut totals: Vec<IndexMap<String, (f64, f64)>> = vec![IndexMap::new(); FEATURE_COUNT];
        for (row, target) in rows.iter().zip(targets) {
            for (column, value) in row.columns().iter().enumerate() {
                if let FeatureValue::Categorical(level) = value {
                    let entry = totals[column].entry((*level).to_string()).or_insert((0.0, 0.0));
                    entry.0 += target;
                    entry.1 += 1.0;
                }
            }
        }
        let tables = totals
            .into_iter()
            .map(|table| {
                table
                    .into_iter()
                    .map(|(level, (sum, count))| {
                        (level, (sum + prior * smoothing) / (count + smoothing))
                    })
                    .collect()
            })
            .collect();
        Self {
            prior,
            smoothing,
            tables,
        }
    }

    /// Encodes a feature vector into a dense numeric row.
    #[must_use]
    pub fn encode(&self, row: &FeatureVector) -> [f64; FEATURE_COUNT] {
        let mut dense = [0.0; FEATURE_COUNT];
        for (column, value) in row.columns().iter().enumerate() {
            dense[column] = match value {
                FeatureValue::Numeric(number) => *number,
                FeatureValue::Categorical(level) => self.tables[column]
                    .get(*level)
                    .copied()
                    .unwrap_or(self.prior),
            };
        }
        dense
    }

    /// Encoding used for unseen levels.
    #[must_use]
    pub const fn prior(&self) -> f64 {
        self.prior
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::features::{NormalizedVisit, ProblemLookup, VisitInput};

    fn row(doctor: &str, age: f64) -> FeatureVector {
        NormalizedVisit::from_input(&VisitInput {
            doctor_id: Some(doctor),
            age,
            token_no: 1.0,
            ..VisitInput::default()
        })
        .features(&ProblemLookup::default(), 10.0)
    }

    #[test]
    fn encodes_levels_with_smoothing() {
        let rows = vec![row("a", 30.0), row("a", 40.0), row("b", 50.0)];
        let targets = [10.0, 20.0, 60.0];
        let encoder = TargetEncoder::fit(&rows, &targets, 1.0);
        assert!((encoder.prior() - 30.0).abs() < 1e-12);
        let dense = encoder.encode(&rows[0]);
        // doctor_id column: (10 + 20 + 30) / (2 + 1)
        assert!((dense[2] - 20.0).abs() < 1e-12);
        // age passes through untouched
        assert!((dense[8] - 30.0).abs() < 1e-12);
        let unseen = encoder.encode(&row("zzz", 30.0));
        assert!((unseen[2] - 30.0).abs() < 1e-12);
    }
}
