use rand::{rngs::SmallRng, seq::SliceRandom, SeedableRng};

/// Shuffles `0..len` with `seed` and splits it into train and validation indices.
///
/// The validation side gets `ceil(len * validation_ratio)` rows, kept between one row and
/// `len - 1` so both sides are non-empty whenever `len >= 2`.
#[must_use]
pub fn train_validation_split(len: usize, validation_ratio: f64, seed: u64) -> (Vec<usize>, Vec<usize>) {
    let mut indices: Vec<usize> = (0..len).collect();
    if len < 2 {
        return (indices, Vec::new());
    }
    let mut rng = SmallRng::seed_from_u64(seed);
    indices.shuffle(&mut rng);
    let wanted = (len as f64 * validation_ratio.clamp(0.0, 1.0)).ceil() as usize;
    let validation_len = wanted.clamp(1, len - 1);
    let validation = indices.split_off(len - validation_len);
    (indices, validation)
}

/// Root mean squared error; zero for empty input.
#[must_use]
pub fn rmse(predictions: &[f64], targets: &[f64]) -> f64 {
    if predictions.is_empty() || predictions.len() != targets.len() {
        return 0.0;
    }
    let mse = predictions
        .iter()
        .zip(targets)
        .map(|(pred, target)| (pred - target).powi(2))
        .sum::<f64>()
        / predictions.len() as f64;
    mse.sqrt()
}

/// Arithmetic mean; zero for empty input.
#[must_use]
pub fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    values.iter().sum::<f64>() / values.len() as f64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_is_eighty_twenty_and_disjoint() {
        let (train, validation) = train_validation_split(10, 0.2, 42);
        assert_eq!(train.len(), 8);
        assert_eq!(validation.len(), 2);
        let mut all: Vec<_> = train.iter().chain(&validation).copied().collect();
        all.sort_unstable();
        assert_eq!(all, (0..10).collect::<Vec<_>>());
    }

    #[test]
    fn split_is_reproducible_for_a_seed() {
        assert_eq!(train_validation_split(25, 0.2, 7), train_validation_split(25, 0.2, 7));
    }

    #[test]
    fn split_keeps_both_sides_populated() {
        let (train, validation) = train_validation_split(2, 0.2, 42);
        assert_eq!((train.len(), validation.len()), (1, 1));
        let (train, validation) = train_validation_split(11, 0.2, 42);
        assert_eq!((train.len(), validation.len()), (8, 3));
        let (train, validation) = train_validation_split(1, 0.2, 42);
        assert_eq!((train.len(), validation.len()), (1, 0));
    }

    #[test]
    fn rmse_and_mean_handle_inputs() {
        assert!((rmse(&[1.0, 3.0], &[1.0, 1.0]) - 2.0_f64.sqrt()).abs() < 1e-12);
        assert!(rmse(&[], &[]).abs() < f64::EPSILON);
        assert!((mean(&[2.0, 4.0]) - 3.0).abs() < f64::EPSILON);
    }
}
