use serde::{Deserialize, Serialize};

use super::binning::{BinnedMatrix, FeatureBorders};
use crate::features::FEATURE_COUNT;

const MIN_GAIN: f64 = 1e-12;

/// Node of a regression tree; the root is at index 0.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Node {
    /// Terminal node.
    Leaf {
        /// Value added to the ensemble output (before shrinkage).
        value: f64,
    },
    /// Internal node sending `row[feature] <= threshold` left.
    Split {
        /// Column index.
        feature: usize,
        /// Split threshold.
        threshold: f64,
        /// Index of the left child.
        left: usize,
        /// Index of the right child.
        right: usize,
    },
}

/// Depth-limited least-squares regression tree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegressionTree {
    nodes: Vec<Node>,
}

impl RegressionTree {
    /// Evaluates the tree on an encoded row.
    #[must_use]
    pub fn predict(&self, row: &[f64; FEATURE_COUNT]) -> f64 {
        let mut idx = 0;
        loop {
            match &self.nodes[idx] {
                Node::Leaf { value } => return *value,
                Node::Split {
                    feature,
                    threshold,
                    left,
                    right,
                } => idx = if row[*feature] <= *threshold { *left } else { *right },
            }
        }
    }

    /// Number of leaves.
    #[must_use]
    pub fn leaf_count(&self) -> usize {
        self.nodes
            .iter()
            .filter(|node| matches!(node, Node::Leaf { .. }))
            .count()
    }
}

/// Shape limits for a single tree.
#[derive(Debug, Clone, Copy)]
pub struct TreeParams {
    /// Maximum depth; 0 yields a single leaf.
    pub depth: usize,
    /// L2 penalty on leaf values.
    pub l2_leaf_reg: f64,
    /// Minimum rows on each side of a split.
    pub min_samples_leaf: usize,
}

#[derive(Debug, Clone, Copy)]
struct SplitCandidate {
    feature: usize,
    bin: usize,
    gain: f64,
}

/// Fits one tree to `residuals` over the given training `rows`.
#[must_use]
pub fn grow(
    binned: &BinnedMatrix,
    borders: &FeatureBorders,
    residuals: &[f64],
    rows: Vec<usize>,
    params: TreeParams,
) -> RegressionTree {
    let mut builder = TreeBuilder {
        binned,
        borders,
        residuals,
        params,
        nodes: Vec::new(),
    };
    builder.build(rows, 0);
    RegressionTree {
        nodes: builder.nodes,
    }
}

struct TreeBuilder<'a> {
    binned: &'a BinnedMatrix,
    borders: &'a FeatureBorders,
    residuals: &'a [f64],
    params: TreeParams,
    nodes: Vec<Node>,
}

impl TreeBuilder<'_> {
    fn build(&mut self, rows: Vec<usize>, depth: usize) -> usize {
        let idx = self.nodes.len();
        self.nodes.push(Node::Leaf { value: 0.0 });
        let sum: f64 = rows.iter().map(|row| self.residuals[*row]).sum();
        let split = if depth < self.params.depth {
            self.best_split(&rows, sum)
        } else {
            None
        };
        let Some(split) = split else {
            self.nodes[idx] = Node::Leaf {
                value: sum / (rows.len() as f64 + self.params.l2_leaf_reg),
            };
            return idx;
        };

        let binned = self.binned;
        let (left_rows, right_rows): (Vec<usize>, Vec<usize>) = rows
            .into_iter()
            .partition(|row| binned.bin(split.feature, *row) <= split.bin);
        let left = self.build(left_rows, depth + 1);
        let right = self.build(right_rows, depth + 1);
        self.nodes[idx] = Node::Split {
            feature: split.feature,
            threshold: self.borders.column(split.feature)[split.bin],
            left,
            right,
        };
        idx
    }

    fn best_split(&self, rows: &[usize], sum: f64) -> Option<SplitCandidate> {
        let count = rows.len();
        let min_leaf = self.params.min_samples_leaf.max(1);
        if count < 2 * min_leaf {
            return None;
        }
        let l2 = self.params.l2_leaf_reg;
        let parent_score = sum * sum / (count as f64 + l2);
        let mut best: Option<SplitCandidate> = None;

        for feature in 0..FEATURE_COUNT {
            let bins = self.binned.bin_count(feature);
            if bins < 2 {
                continue;
            }
            let mut hist_sum = vec![0.0; bins];
            let mut hist_count = vec![0usize; bins];
            for &row in rows {
                let bin = self.binned.bin(feature, row);
                hist_sum[bin] += self.residuals[row];
                hist_count[bin] += 1;
            }

            let mut left_sum = 0.0;
            let mut left_count = 0;
            for bin in 0..bins - 1 {
                left_sum += hist_sum[bin];
                left_count += hist_count[bin];
                let right_count = count - left_count;
                if right_count < min_leaf {
                    break;
                }
                // empty bins repeat the previous partition
                if left_count < min_leaf || hist_count[bin] == 0 {
                    continue;
                }
                let right_sum = sum - left_sum;
                let gain = left_sum * left_sum / (left_count as f64 + l2)
                    + right_sum * right_sum / (right_count as f64 + l2)
                    - parent_score;
                if gain > best.map_or(MIN_GAIN, |candidate| candidate.gain) {
                    best = Some(SplitCandidate { feature, bin, gain });
                }
            }
        }
        best
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn step_rows() -> (Vec<[f64; FEATURE_COUNT]>, Vec<f64>) {
        let mut rows = Vec::new();
        let mut targets = Vec::new();
        for i in 0..20 {
            let mut row = [0.0; FEATURE_COUNT];
            row[6] = f64::from(i);
            rows.push(row);
            targets.push(if i < 10 { -5.0 } else { 5.0 });
        }
        (rows, targets)
    }

    #[test]
    fn learns_a_step_function() {
        let (rows, targets) = step_rows();
        let borders = FeatureBorders::fit(&rows, 32);
        let binned = BinnedMatrix::new(&rows, &borders);
        let params = TreeParams {
            depth: 2,
            l2_leaf_reg: 0.0,
            min_samples_leaf: 1,
        };
        let tree = grow(&binned, &borders, &targets, (0..rows.len()).collect(), params);
        for (row, target) in rows.iter().zip(&targets) {
            assert!((tree.predict(row) - target).abs() < 1e-9);
        }
        assert_eq!(tree.leaf_count(), 2);
    }

    #[test]
    fn zero_depth_is_a_regularized_mean() {
        let (rows, targets) = step_rows();
        let borders = FeatureBorders::fit(&rows, 32);
        let binned = BinnedMatrix::new(&rows, &borders);
        let params = TreeParams {
            depth: 0,
            l2_leaf_reg: 1.0,
            min_samples_leaf: 1,
        };
        let shifted: Vec<f64> = targets.iter().map(|t| t + 1.0).collect();
        let tree = grow(&binned, &borders, &shifted, (0..rows.len()).collect(), params);
        assert_eq!(tree.leaf_count(), 1);
        // sum 20 over 20 rows plus penalty 1
        assert!((tree.predict(&rows[0]) - 20.0 / 21.0).abs() < 1e-12);
    }
}
