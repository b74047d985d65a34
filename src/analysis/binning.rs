/// Per-bin aggregation of local effects.
#[derive(Debug, Clone, PartialEq)]
pub struct BinStats {
    pub mean: Vec<f64>,
    pub variance: Vec<f64>,
    pub counts: Vec<usize>,
}

/// Reduces local effects into one value per bin.
pub trait BinEffect: Send + Sync {
    /// `limits` holds `n_bins + 1` increasing edges.
    fn compute(&self, xs: &[f64], local_effects: &[f64], limits: &[f64]) -> BinStats;
}

/// Mean per bin; empty bins are interpolated from their non-empty neighbours.
#[derive(Debug, Clone, Copy, Default)]
pub struct MeanBinEffect;

impl BinEffect for MeanBinEffect {
    fn compute(&self, xs: &[f64], local_effects: &[f64], limits: &[f64]) -> BinStats {
        let n_bins = limits.len().saturating_sub(1);
        let mut sums = vec![0.0; n_bins];
        let mut squares = vec![0.0; n_bins];
        let mut counts = vec![0usize; n_bins];

        for (&x, &effect) in xs.iter().zip(local_effects) {
            if let Some(bin) = bin_index(x, limits) {
                sums[bin] += effect;
                squares[bin] += effect * effect;
                counts[bin] += 1;
            }
        }

        let mut mean = vec![f64::NAN; n_bins];
        let mut variance = vec![f64::NAN; n_bins];
        for bin in 0..n_bins {
            if counts[bin] > 0 {
                let n = counts[bin] as f64;
                let m = sums[bin] / n;
                mean[bin] = m;
                variance[bin] = (squares[bin] / n - m * m).max(0.0);
            }
        }
        fill_gaps(&mut mean);
        fill_gaps(&mut variance);

        BinStats {
            mean,
            variance,
            counts,
        }
    }
}

/// Bin containing `x`; the last bin is closed on the right.
pub(crate) fn bin_index(x: f64, limits: &[f64]) -> Option<usize> {
    let n_bins = limits.len().checked_sub(1)?;
    if n_bins == 0 || x.is_nan() || x < limits[0] || x > limits[n_bins] {
        return None;
    }
    let upper = limits[1..].partition_point(|&edge| edge <= x);
    Some(upper.min(n_bins - 1))
}

fn fill_gaps(values: &mut [f64]) {
    let known: Vec<usize> = (0..values.len()).filter(|&i| !values[i].is_nan()).collect();
    if known.is_empty() {
        values.iter_mut().for_each(|v| *v = 0.0);
        return;
    }

    for i in 0..values.len() {
        if !values[i].is_nan() {
            continue;
        }
        let right = known.partition_point(|&k| k < i);
        values[i] = match (right.checked_sub(1).map(|l| known[l]), known.get(right)) {
            (Some(l), Some(&r)) => {
                values[l] + (values[r] - values[l]) * (i - l) as f64 / (r - l) as f64
            }
            (Some(l), None) => values[l],
            (None, Some(&r)) => values[r],
            (None, None) => 0.0,
        };
    }
}
