use anyhow::{bail, ensure};
use ndarray::{Array1, Array2, ArrayView2, Axis};
use rand::{SeedableRng, rngs::StdRng, seq::index};
use tracing::{debug, info};

use crate::{
    analysis::{AnalysisJob, BinEffect, Curve, EffectEngine, Method, PlotSet, render_png},
    config::AppConfig,
    data::NumericTable,
    model::Predict,
};

/// Relative step of the central finite difference used for RHALE.
const DERIVATIVE_STEP: f64 = 1e-3;

#[derive(Debug, Clone, Copy)]
pub struct EngineSettings {
    pub nof_instances: usize,
    pub grid_points: usize,
    pub bins: usize,
    pub width: u32,
    pub height: u32,
    pub seed: u64,
}

impl From<&AppConfig> for EngineSettings {
    fn from(config: &AppConfig) -> Self {
        Self {
            nof_instances: config.nof_instances,
            grid_points: config.pdp_grid_points,
            bins: config.rhale_bins,
            width: config.plot_width,
            height: config.plot_height,
            seed: config.seed,
        }
    }
}

/// PDP and RHALE computed in-process and rendered to PNG.
pub struct BuiltinEngine {
    settings: EngineSettings,
}

impl BuiltinEngine {
    pub fn new(settings: EngineSettings) -> Self {
        Self { settings }
    }

    /// Centered partial dependence over an even grid of the feature's range.
    fn pdp(&self, table: &NumericTable, model: &dyn Predict, feature: usize) -> anyhow::Result<Curve> {
        let instances = self.subsample(table.view());
        let (lo, hi) = range(table.column(feature).iter().copied())?;
        let grid = Array1::linspace(lo, hi, self.settings.grid_points.max(2));

        let mut averages = Vec::with_capacity(grid.len());
        let mut probe = instances.clone();
        for &value in grid.iter() {
            probe.column_mut(feature).fill(value);
            let predictions = model.predict(probe.view())?;
            ensure!(!predictions.is_empty(), "model returned no predictions");
            averages.push(predictions.mean().unwrap_or(0.0));
        }

        let offset = averages.iter().sum::<f64>() / averages.len() as f64;
        debug!(instances = instances.nrows(), offset, "pdp averaged");

        Ok(Curve {
            xs: grid.to_vec(),
            ys: averages.iter().map(|y| y - offset).collect(),
            std: None,
            rug: instances.column(feature).to_vec(),
        })
    }

    /// Accumulated local effects from finite-difference derivatives,
    /// reduced per bin by the supplied strategy.
    fn rhale(
        &self,
        table: &NumericTable,
        model: &dyn Predict,
        feature: usize,
        bin_effect: &dyn BinEffect,
    ) -> anyhow::Result<Curve> {
        let xs = table.column(feature).to_vec();
        let (lo, hi) = range(xs.iter().copied())?;
        ensure!(hi > lo, "feature {feature} is constant, no effect to accumulate");

        let step = (hi - lo) * DERIVATIVE_STEP;
        let mut upper = table.view().to_owned();
        let mut lower = table.view().to_owned();
        upper.column_mut(feature).mapv_inplace(|v| v + step / 2.0);
        lower.column_mut(feature).mapv_inplace(|v| v - step / 2.0);

        let y_upper = model.predict(upper.view())?;
        let y_lower = model.predict(lower.view())?;
        if y_upper.len() != xs.len() || y_lower.len() != xs.len() {
            bail!(
                "model returned {} predictions for {} rows, RHALE needs one per row",
                y_upper.len(),
                xs.len()
            );
        }
        let local_effects = ((y_upper - y_lower) / step).to_vec();

        let limits = Array1::linspace(lo, hi, self.settings.bins.max(1) + 1).to_vec();
        let stats = bin_effect.compute(&xs, &local_effects, &limits);

        let mut accumulated = vec![0.0; limits.len()];
        let mut spread = vec![0.0; limits.len()];
        let mut variance_sum = 0.0;
        for bin in 0..limits.len() - 1 {
            let width = limits[bin + 1] - limits[bin];
            accumulated[bin + 1] = accumulated[bin] + stats.mean[bin] * width;
            variance_sum += stats.variance[bin] * width * width;
            spread[bin + 1] = variance_sum.sqrt();
        }

        // center on the mean effect over the observed points
        let mut total = 0.0;
        let mut counted = 0usize;
        for &x in &xs {
            if let Some(bin) = super::binning::bin_index(x, &limits) {
                total += accumulated[bin] + stats.mean[bin] * (x - limits[bin]);
                counted += 1;
            }
        }
        let offset = if counted > 0 { total / counted as f64 } else { 0.0 };

        let rug = self.subsample(table.view()).column(feature).to_vec();
        Ok(Curve {
            xs: limits,
            ys: accumulated.iter().map(|y| y - offset).collect(),
            std: Some(spread),
            rug,
        })
    }

    fn subsample(&self, x: ArrayView2<'_, f64>) -> Array2<f64> {
        let n = x.nrows();
        let k = self.settings.nof_instances;
        if n <= k {
            return x.to_owned();
        }
        let mut rng = StdRng::seed_from_u64(self.settings.seed);
        let mut rows = index::sample(&mut rng, n, k).into_vec();
        rows.sort_unstable();
        x.select(Axis(0), &rows)
    }
}

impl EffectEngine for BuiltinEngine {
    fn run(
        &self,
        table: &NumericTable,
        model: &dyn Predict,
        job: &AnalysisJob,
        bin_effect: &dyn BinEffect,
    ) -> anyhow::Result<PlotSet> {
        ensure!(
            job.feature < table.n_features(),
            "feature index {} out of range for {} features",
            job.feature,
            table.n_features()
        );

        let curve = match job.method {
            Method::Pdp => self.pdp(table, model, job.feature)?,
            Method::Rhale => self.rhale(table, model, job.feature, bin_effect)?,
            Method::RegionalPdp | Method::RegionalRhale | Method::ShapDependence => {
                bail!("method `{}` is not available in the built-in engine", job.method)
            }
        };

        info!(
            method = %job.method,
            feature = %table.feature_names()[job.feature],
            target = %job.target_name,
            points = curve.xs.len(),
            "feature effect computed"
        );

        let png = render_png(&curve, self.settings.width, self.settings.height)?;
        let mut plots = PlotSet::default();
        plots.insert(job.method.plot_key(), png);
        Ok(plots)
    }
}

/// Range of the finite values.
fn range(values: impl Iterator<Item = f64>) -> anyhow::Result<(f64, f64)> {
    let (lo, hi) = values
        .filter(|v| v.is_finite())
        .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), v| {
            (lo.min(v), hi.max(v))
        });
    ensure!(lo <= hi, "feature has no finite values");
    Ok((lo, hi))
}
