use crate::features::FEATURE_COUNT;

/// Candidate split thresholds per column.
///
/// Borders sit halfway between neighboring distinct training values. Columns with more
/// distinct values than `border_count + 1` keep `border_count` borders spread evenly over
/// the sorted distinct values.
#[derive(Debug, Clone)]
pub struct FeatureBorders {
    borders: Vec<Vec<f64>>,
}

impl FeatureBorders {
    /// Computes borders from encoded training rows.
    #[must_use]
    pub fn fit(rows: &[[f64; FEATURE_COUNT]], border_count: usize) -> Self {
        let border_count = border_count.max(1);
        let borders = (0..FEATURE_COUNT)
            .map(|column| {
                let mut values: Vec<f64> = rows.iter().map(|row| row[column]).collect();
                values.sort_by(f64::total_cmp);
                values.dedup();
                column_borders(&values, border_count)
            })
            .collect();
        Self { borders }
    }

    /// Borders of one column, ascending.
    #[must_use]
    pub fn column(&self, column: usize) -> &[f64] {
        &self.borders[column]
    }

    /// Bin of `value`: the number of borders strictly below it.
    #[must_use]
    pub fn bin(&self, column: usize, value: f64) -> usize {
        self.borders[column].partition_point(|border| *border < value)
    }
}

fn column_borders(distinct: &[f64], border_count: usize) -> Vec<f64> {
    if distinct.len() < 2 {
        return Vec::new();
    }
    let midpoint = |idx: usize| (distinct[idx - 1] + distinct[idx]) / 2.0;
    if distinct.len() <= border_count + 1 {
        return (1..distinct.len()).map(midpoint).collect();
    }
    let mut borders: Vec<f64> = (1..=border_count)
        .map(|k| midpoint((k * distinct.len() / (border_count + 1)).max(1)))
        .collect();
    borders.dedup();
    borders
}

/// Training rows pre-bucketed column by column.
#[derive(Debug)]
pub struct BinnedMatrix {
    columns: Vec<Vec<u16>>,
    bin_counts: Vec<usize>,
}

impl BinnedMatrix {
    /// Buckets every row with `borders`.
    #[must_use]
    pub fn new(rows: &[[f64; FEATURE_COUNT]], borders: &FeatureBorders) -> Self {
        let columns = (0..FEATURE_COUNT)
            .map(|column| {
                rows.iter()
                    .map(|row| u16::try_from(borders.bin(column, row[column])).unwrap_or(u16::MAX))
                    .collect()
            })
            .collect();
        let bin_counts = (0..FEATURE_COUNT)
            .map(|column| borders.column(column).len() + 1)
            .collect();
        Self {
            columns,
            bin_counts,
        }
    }

    /// Bin of `row` in `column`.
    #[must_use]
    pub fn bin(&self, column: usize, row: usize) -> usize {
        usize::from(self.columns[column][row])
    }

    /// Number of bins in `column`.
    #[must_use]
    pub fn bin_count(&self, column: usize) -> usize {
        self.bin_counts[column]
    }
}
