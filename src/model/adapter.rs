use std::fmt;

use chrono::Utc;
use ndarray::{Array1, ArrayView2};
use rand::{Rng, SeedableRng, rngs::StdRng};
use tracing::{debug, error, info};

use crate::{
    error::ModelError,
    model::{Estimator, TimeSeries, types::hourly_index},
};

/// Model types whose `predict` expects a target history plus covariates.
const FORECASTER_TYPES: &[&str] = &["CatBoostModel"];

/// Rows used by the post-load smoke prediction, at minimum.
const SMOKE_TEST_ROWS: usize = 48;

/// Anything that maps a feature table to one prediction per call.
pub trait Predict: Send + Sync {
    fn predict(&self, x: ArrayView2<'_, f64>) -> Result<Array1<f64>, ModelError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowConfig {
    pub input_chunk_length: usize,
    pub output_chunk_length: usize,
    pub n_features: usize,
    pub n_covariates: usize,
}

impl Default for WindowConfig {
    fn default() -> Self {
        Self {
            input_chunk_length: 24,
            output_chunk_length: 1,
            n_features: 11,
            n_covariates: 11,
        }
    }
}

/// Uniform `predict` over generic and time-series estimators.
pub struct ModelAdapter {
    inner: Box<dyn Estimator>,
    model_type: String,
    window: WindowConfig,
}

impl fmt::Debug for ModelAdapter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModelAdapter")
            .field("model_type", &self.model_type)
            .field("window", &self.window)
            .finish_non_exhaustive()
    }
}

impl ModelAdapter {
    pub fn new(inner: Box<dyn Estimator>) -> Self {
        let model_type = inner.model_type().to_string();
        let mut window = WindowConfig::default();
        if let Some(len) = inner.input_chunk_length() {
            window.input_chunk_length = len;
        }
        if let Some(len) = inner.output_chunk_length() {
            window.output_chunk_length = len;
        }

        info!(
            %model_type,
            input_chunk_length = window.input_chunk_length,
            output_chunk_length = window.output_chunk_length,
            n_features = window.n_features,
            n_covariates = window.n_covariates,
            "wrapped model"
        );

        Self {
            inner,
            model_type,
            window,
        }
    }

    pub fn model_type(&self) -> &str {
        &self.model_type
    }

    pub fn window(&self) -> WindowConfig {
        self.window
    }

    pub fn is_forecaster(&self) -> bool {
        FORECASTER_TYPES.contains(&self.model_type.as_str())
    }

    /// Predicts once on random `[0, 1]` inputs shaped like the window.
    pub fn smoke_test(&self, seed: u64) -> Result<(), ModelError> {
        let rows = self.window.input_chunk_length.max(SMOKE_TEST_ROWS);
        let mut rng = StdRng::seed_from_u64(seed);
        let sample = ndarray::Array2::from_shape_fn((rows, self.window.n_features), |_| {
            rng.gen_range(0.0..1.0)
        });

        debug!(shape = ?sample.dim(), "testing prediction");
        let prediction = self.predict(sample.view()).map_err(|err| {
            ModelError::ModelLoad(format!("test prediction failed: {err}"))
        })?;
        debug!(len = prediction.len(), "test prediction successful");
        Ok(())
    }

    fn forecast(&self, x: ArrayView2<'_, f64>) -> Result<Array1<f64>, ModelError> {
        let (rows, cols) = x.dim();
        let required = self.window.input_chunk_length;
        if rows < required {
            return Err(ModelError::InsufficientData {
                required,
                available: rows,
            });
        }
        if cols == 0 {
            return Err(self.prediction_error(anyhow::anyhow!("input has no columns")));
        }

        let (target, covariates) = self
            .build_series(x)
            .map_err(|err| self.prediction_error(err))?;

        let window_start = required;
        let forecast = self
            .inner
            .forecast(1, &target.tail(window_start), &covariates.tail(window_start))
            .map_err(|err| self.prediction_error(err))?;

        Ok(forecast.values().iter().copied().collect())
    }

    /// Target from the last column, one covariate per leading column.
    fn build_series(&self, x: ArrayView2<'_, f64>) -> anyhow::Result<(TimeSeries, TimeSeries)> {
        let (rows, cols) = x.dim();
        let end = Utc::now();

        let target = TimeSeries::hourly(end, x.column(cols - 1).to_owned(), "target");

        let n_covariates = self.window.n_covariates.min(cols);
        let index = hourly_index(end, rows);
        let covariates = TimeSeries::from_parts(
            index,
            x.slice(ndarray::s![.., ..n_covariates]).to_owned(),
            (0..n_covariates).map(|i| format!("feature_{i}")).collect(),
        )?;

        debug!(
            target = ?target.values().dim(),
            covariates = ?covariates.values().dim(),
            "time series created"
        );
        Ok((target, covariates))
    }

    fn prediction_error(&self, source: anyhow::Error) -> ModelError {
        ModelError::Prediction {
            model_type: self.model_type.clone(),
            source,
        }
    }
}

impl Predict for ModelAdapter {
    fn predict(&self, x: ArrayView2<'_, f64>) -> Result<Array1<f64>, ModelError> {
        let result = if self.is_forecaster() {
            self.forecast(x)
        } else {
            self.inner
                .predict(x)
                .map_err(|err| self.prediction_error(err))
        };

        if let Err(err) = &result {
            error!(
                model_type = %self.model_type,
                input_shape = ?x.dim(),
                error = %err,
                "prediction error"
            );
        }
        result
    }
}
