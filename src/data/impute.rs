use ndarray::{Array2, Axis};
use tracing::{debug, warn};

/// Replaces every NaN with the mean of the observed values in its own column.
///
/// A column without any observed value is filled with `0.0`. Returns the
/// number of cells that were imputed.
pub fn impute_column_means(values: &mut Array2<f64>) -> usize {
    let mut imputed = 0;

    for (index, mut column) in values.axis_iter_mut(Axis(1)).enumerate() {
        let (sum, observed) = column
            .iter()
            .filter(|v| !v.is_nan())
            .fold((0.0, 0usize), |(sum, n), v| (sum + v, n + 1));
        let missing = column.len() - observed;
        if missing == 0 {
            continue;
        }

        let fill = if observed == 0 {
            warn!(column = index, "column has no observed values, filling with 0");
            0.0
        } else {
            sum / observed as f64
        };

        column.mapv_inplace(|v| if v.is_nan() { fill } else { v });
        imputed += missing;
    }

    if imputed > 0 {
        debug!(imputed, "filled missing values with column means");
    }
    imputed
}
