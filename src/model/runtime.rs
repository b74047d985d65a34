use std::{collections::HashMap, io::Read, path::Path, sync::Arc};

use anyhow::{Context, bail};
use ndarray::{Array1, Array2, ArrayView2};
use parking_lot::RwLock;
use serde_pickle::{DeOptions, HashableValue, Value};

use crate::{
    format::FormatTag,
    model::{Estimator, LoadOptions, TimeSeries},
};

const BZIP2_MAGIC: &[u8] = b"BZh";

/// Deserializes a model artifact of one format from disk.
pub trait ModelRuntime: Send + Sync {
    fn name(&self) -> &'static str;

    fn load(&self, path: &Path, options: LoadOptions) -> anyhow::Result<Box<dyn Estimator>>;
}

/// Format → runtime table consulted by the loader.
pub struct RuntimeRegistry {
    runtimes: RwLock<HashMap<FormatTag, Arc<dyn ModelRuntime>>>,
}

impl RuntimeRegistry {
    pub fn empty() -> Self {
        Self {
            runtimes: RwLock::new(HashMap::new()),
        }
    }

    /// Registry with the runtimes compiled into this crate.
    pub fn with_defaults() -> Self {
        let registry = Self::empty();
        registry.register(FormatTag::Pickle, Arc::new(PickleRuntime));
        registry
    }

    pub fn register(&self, format: FormatTag, runtime: Arc<dyn ModelRuntime>) {
        tracing::info!(%format, runtime = runtime.name(), "registering model runtime");
        self.runtimes.write().insert(format, runtime);
    }

    pub fn get(&self, format: FormatTag) -> Option<Arc<dyn ModelRuntime>> {
        self.runtimes.read().get(&format).cloned()
    }
}

impl Default for RuntimeRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}

/// Loads pickled parameter mappings, optionally bzip2-compressed.
///
/// The mapping must hold `coef` (list of numbers) and may hold `intercept`,
/// `model_type`, `input_chunk_length` and `output_chunk_length`.
pub struct PickleRuntime;

impl ModelRuntime for PickleRuntime {
    fn name(&self) -> &'static str {
        "pickle"
    }

    fn load(&self, path: &Path, _options: LoadOptions) -> anyhow::Result<Box<dyn Estimator>> {
        let raw = std::fs::read(path)
            .with_context(|| format!("reading {}", path.display()))?;
        let raw = if raw.starts_with(BZIP2_MAGIC) {
            let mut decoded = Vec::new();
            bzip2::read::BzDecoder::new(raw.as_slice())
                .read_to_end(&mut decoded)
                .context("decompressing bzip2 pickle")?;
            decoded
        } else {
            raw
        };

        let value = serde_pickle::value_from_slice(&raw, DeOptions::new())
            .context("decoding pickle")?;
        let estimator = LinearEstimator::from_pickle(value)?;
        tracing::debug!(
            model_type = estimator.model_type(),
            n_coef = estimator.coef.len(),
            "decoded pickled linear model"
        );
        Ok(Box::new(estimator))
    }
}

/// `y = X·coef + intercept`.
#[derive(Debug, Clone)]
pub struct LinearEstimator {
    model_type: String,
    coef: Array1<f64>,
    intercept: f64,
    input_chunk_length: Option<usize>,
    output_chunk_length: Option<usize>,
}

impl LinearEstimator {
    pub fn new(coef: Vec<f64>, intercept: f64) -> Self {
        Self {
            model_type: "LinearModel".to_string(),
            coef: Array1::from(coef),
            intercept,
            input_chunk_length: None,
            output_chunk_length: None,
        }
    }

    fn from_pickle(value: Value) -> anyhow::Result<Self> {
        let Value::Dict(mut fields) = value else {
            bail!("pickle does not contain a parameter mapping");
        };
        let mut take = |key: &str| fields.remove(&HashableValue::String(key.to_string()));

        let coef = match take("coef") {
            Some(Value::List(items)) | Some(Value::Tuple(items)) => items
                .iter()
                .map(pickle_number)
                .collect::<anyhow::Result<Vec<_>>>()?,
            Some(_) => bail!("`coef` must be a list of numbers"),
            None => bail!("pickle mapping has no `coef` entry"),
        };
        let intercept = take("intercept").map(|v| pickle_number(&v)).transpose()?;
        let model_type = match take("model_type") {
            Some(Value::String(name)) => Some(name),
            Some(_) => bail!("`model_type` must be a string"),
            None => None,
        };
        let input_chunk_length = take("input_chunk_length")
            .map(|v| pickle_usize(&v))
            .transpose()?;
        let output_chunk_length = take("output_chunk_length")
            .map(|v| pickle_usize(&v))
            .transpose()?;

        let mut estimator = Self::new(coef, intercept.unwrap_or(0.0));
        if let Some(model_type) = model_type {
            estimator.model_type = model_type;
        }
        estimator.input_chunk_length = input_chunk_length;
        estimator.output_chunk_length = output_chunk_length;
        Ok(estimator)
    }

    fn check_width(&self, width: usize) -> anyhow::Result<()> {
        if width != self.coef.len() {
            bail!(
                "model expects {} features, input has {}",
                self.coef.len(),
                width
            );
        }
        Ok(())
    }
}

impl Estimator for LinearEstimator {
    fn model_type(&self) -> &str {
        &self.model_type
    }

    fn input_chunk_length(&self) -> Option<usize> {
        self.input_chunk_length
    }

    fn output_chunk_length(&self) -> Option<usize> {
        self.output_chunk_length
    }

    fn predict(&self, x: ArrayView2<'_, f64>) -> anyhow::Result<Array1<f64>> {
        self.check_width(x.ncols())?;
        Ok(x.dot(&self.coef) + self.intercept)
    }

    /// Every forecast step applies the weights to the latest covariate row.
    fn forecast(
        &self,
        n: usize,
        series: &TimeSeries,
        future_covariates: &TimeSeries,
    ) -> anyhow::Result<TimeSeries> {
        anyhow::ensure!(!series.is_empty(), "empty target series");
        anyhow::ensure!(!future_covariates.is_empty(), "empty covariate series");
        self.check_width(future_covariates.width())?;

        let latest = future_covariates.values().row(future_covariates.len() - 1);
        let step = latest.dot(&self.coef) + self.intercept;

        let last = series.index()[series.len() - 1];
        let index = (1..=n)
            .map(|h| last + chrono::Duration::hours(h as i64))
            .collect();
        TimeSeries::from_parts(
            index,
            Array2::from_elem((n, 1), step),
            series.components()[..1].to_vec(),
        )
    }
}

fn pickle_number(value: &Value) -> anyhow::Result<f64> {
    match value {
        Value::F64(v) => Ok(*v),
        Value::I64(v) => Ok(*v as f64),
        Value::Bool(b) => Ok(if *b { 1.0 } else { 0.0 }),
        other => bail!("expected a number, found {other:?}"),
    }
}

fn pickle_usize(value: &Value) -> anyhow::Result<usize> {
    match value {
        Value::I64(v) if *v >= 0 => Ok(*v as usize),
        other => bail!("expected a non-negative integer, found {other:?}"),
    }
}
