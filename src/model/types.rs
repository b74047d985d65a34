use chrono::{DateTime, Duration, Utc};
use ndarray::{Array1, Array2, ArrayView2, Axis, concatenate, s};

/// A natively loaded model, before adaptation.
pub trait Estimator: Send + Sync {
    fn model_type(&self) -> &str;

    fn input_chunk_length(&self) -> Option<usize> {
        None
    }

    fn output_chunk_length(&self) -> Option<usize> {
        None
    }

    fn predict(&self, x: ArrayView2<'_, f64>) -> anyhow::Result<Array1<f64>>;

    /// One- or multi-step forecast from a target history and its covariates.
    fn forecast(
        &self,
        n: usize,
        series: &TimeSeries,
        future_covariates: &TimeSeries,
    ) -> anyhow::Result<TimeSeries> {
        let _ = (n, series, future_covariates);
        anyhow::bail!("{} does not support forecasting", self.model_type())
    }
}

/// Options handed to a runtime when deserializing a model artifact.
#[derive(Debug, Clone, Copy, Default)]
pub struct LoadOptions {
    /// Restore optimizer/loss configuration alongside the weights.
    pub compile: bool,
}

/// Hourly-indexed multivariate series. Rows are time steps, columns components.
#[derive(Debug, Clone, PartialEq)]
pub struct TimeSeries {
    index: Vec<DateTime<Utc>>,
    values: Array2<f64>,
    components: Vec<String>,
}

impl TimeSeries {
    /// Builds a single-component series over an hourly index ending at `end`.
    pub fn hourly(end: DateTime<Utc>, values: Array1<f64>, component: &str) -> Self {
        let len = values.len();
        let index = hourly_index(end, len);
        let values = values.insert_axis(Axis(1));
        Self {
            index,
            values,
            components: vec![component.to_string()],
        }
    }

    pub fn from_parts(
        index: Vec<DateTime<Utc>>,
        values: Array2<f64>,
        components: Vec<String>,
    ) -> anyhow::Result<Self> {
        anyhow::ensure!(
            index.len() == values.nrows() && components.len() == values.ncols(),
            "series of shape {:?} does not match {} timestamps and {} components",
            values.dim(),
            index.len(),
            components.len()
        );
        Ok(Self {
            index,
            values,
            components,
        })
    }

    /// Stacks the components of `other` next to ours. Both must share an index.
    pub fn concatenate(mut self, other: &TimeSeries) -> anyhow::Result<Self> {
        anyhow::ensure!(self.index == other.index, "series indices differ");
        self.values = concatenate(Axis(1), &[self.values.view(), other.values.view()])?;
        self.components.extend(other.components.iter().cloned());
        Ok(self)
    }

    /// The most recent `n` steps, or the whole series when it is shorter.
    pub fn tail(&self, n: usize) -> Self {
        let start = self.len().saturating_sub(n);
        Self {
            index: self.index[start..].to_vec(),
            values: self.values.slice(s![start.., ..]).to_owned(),
            components: self.components.clone(),
        }
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    pub fn width(&self) -> usize {
        self.values.ncols()
    }

    pub fn index(&self) -> &[DateTime<Utc>] {
        &self.index
    }

    pub fn values(&self) -> &Array2<f64> {
        &self.values
    }

    pub fn components(&self) -> &[String] {
        &self.components
    }
}

pub(crate) fn hourly_index(end: DateTime<Utc>, len: usize) -> Vec<DateTime<Utc>> {
    (0..len)
        .map(|i| end - Duration::hours((len - 1 - i) as i64))
        .collect()
}
