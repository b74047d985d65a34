//! Per-request orchestration: validate inputs, ingest data and model
//! concurrently, run the analysis, optionally publish the results.

use std::{collections::BTreeMap, fmt, sync::Arc};

use base64::{Engine, engine::general_purpose::STANDARD};
use tokio::task;
use tracing::{debug, info, warn};

use crate::{
    analysis::{
        AnalysisJob, BinEffect, BuiltinEngine, EffectEngine, EngineSettings, MeanBinEffect,
        Method, PlotSet,
    },
    config::AppConfig,
    data::{self, DataSource, NumericTable},
    error::{DataError, ServiceError},
    format::{FormatTag, url_extension},
    model::{ModelLoader, ModelSource, RuntimeRegistry},
    remote::{HttpRemote, RemoteClient},
};

const DEFAULT_TARGET_NAME: &str = "prediction";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Received,
    InputValidated,
    DataParsed,
    ModelLoaded,
    AnalysisRun,
    ResponseSent,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Received => "received",
            Stage::InputValidated => "input_validated",
            Stage::DataParsed => "data_parsed",
            Stage::ModelLoaded => "model_loaded",
            Stage::AnalysisRun => "analysis_run",
            Stage::ResponseSent => "response_sent",
        };
        f.write_str(name)
    }
}

/// Raw, unvalidated request fields, independent of the HTTP encoding.
#[derive(Debug, Clone, Default)]
pub struct AnalysisInputs {
    pub data: Option<DataSource>,
    pub model: Option<ModelSource>,
    pub method: Option<String>,
    pub feature_index: Option<String>,
    pub feature_names: Option<Vec<String>>,
    pub target_name: Option<String>,
    pub node_idx: Option<String>,
    pub publish_url: Option<String>,
}

#[derive(Debug, Clone)]
pub struct AnalysisOutcome {
    pub method: Method,
    pub plots: PlotSet,
    /// `None` when no publish URL was given.
    pub published: Option<bool>,
}

struct ValidatedInputs {
    data: DataSource,
    model: ModelSource,
    job: AnalysisJob,
    feature_names: Option<Vec<String>>,
    publish_url: Option<String>,
}

pub struct AnalysisPipeline {
    remote: Arc<dyn RemoteClient>,
    loader: ModelLoader,
    engine: Arc<dyn EffectEngine>,
    bin_effect: Arc<dyn BinEffect>,
}

impl AnalysisPipeline {
    pub fn new(
        config: &AppConfig,
        remote: Arc<dyn RemoteClient>,
        runtimes: Arc<RuntimeRegistry>,
        engine: Arc<dyn EffectEngine>,
        bin_effect: Arc<dyn BinEffect>,
    ) -> Self {
        let loader = ModelLoader::new(
            runtimes,
            remote.clone(),
            config.model_temp_dir.clone(),
            config.seed,
        );
        Self {
            remote,
            loader,
            engine,
            bin_effect,
        }
    }

    /// Pipeline wired with the HTTP client, default runtimes and the
    /// built-in engine.
    pub fn from_config(config: &AppConfig) -> Self {
        Self::with_remote(config, Arc::new(HttpRemote::default()))
    }

    pub fn with_remote(config: &AppConfig, remote: Arc<dyn RemoteClient>) -> Self {
        Self::new(
            config,
            remote,
            Arc::new(RuntimeRegistry::with_defaults()),
            Arc::new(BuiltinEngine::new(EngineSettings::from(config))),
            Arc::new(MeanBinEffect),
        )
    }

    pub async fn run(&self, inputs: AnalysisInputs) -> Result<AnalysisOutcome, ServiceError> {
        debug!(stage = %Stage::Received, "analysis request");

        let ValidatedInputs {
            data,
            model,
            mut job,
            feature_names,
            publish_url,
        } = validate(inputs)?;
        debug!(stage = %Stage::InputValidated, method = %job.method, feature = job.feature);

        let (mut table, model) = tokio::try_join!(
            async { self.ingest(data).await },
            async { self.loader.load(model).await.map_err(ServiceError::from) },
        )?;
        debug!(stage = %Stage::DataParsed, shape = ?table.shape());
        debug!(stage = %Stage::ModelLoaded, model_type = model.model_type());

        if let Some(names) = feature_names {
            table.rename(names)?;
        }
        if job.feature >= table.n_features() {
            return Err(ServiceError::InvalidRequest(format!(
                "feature_index {} out of range [0, {})",
                job.feature,
                table.n_features()
            )));
        }
        if job.target_name.is_empty() {
            job.target_name = DEFAULT_TARGET_NAME.to_string();
        }

        let engine = self.engine.clone();
        let bin_effect = self.bin_effect.clone();
        let method = job.method;
        let plots = task::spawn_blocking(move || {
            engine.run(&table, &model, &job, bin_effect.as_ref())
        })
        .await
        .map_err(|err| ServiceError::Analysis(format!("analysis task failed: {err}")))?
        .map_err(|err| ServiceError::Analysis(format!("{err:#}")))?;
        info!(stage = %Stage::AnalysisRun, %method, plots = plots.iter().count(), "analysis finished");

        let published = match publish_url {
            Some(url) => {
                let payload = serde_json::to_value(encode_plots(&plots))
                    .map_err(|err| ServiceError::Internal(err.to_string()))?;
                let ok = self.remote.publish(&url, &payload).await;
                if !ok {
                    warn!(%url, "results were not published");
                }
                Some(ok)
            }
            None => None,
        };

        Ok(AnalysisOutcome {
            method,
            plots,
            published,
        })
    }

    /// Fetches (if needed), detects and parses a dataset.
    pub async fn ingest(&self, source: DataSource) -> Result<NumericTable, ServiceError> {
        let (bytes, format) = match source {
            DataSource::Upload { filename, bytes } => {
                debug!(%filename, size = bytes.len(), "processing uploaded data");
                let format = FormatTag::detect_filename(&filename)?;
                (bytes, format)
            }
            DataSource::Url(url) => {
                debug!(%url, "processing data from URL");
                let fetched = self.remote.fetch(&url).await.map_err(|err| DataError::Fetch {
                    url: url.clone(),
                    reason: format!("{err:#}"),
                })?;
                let format = match fetched.content_type.as_deref() {
                    Some(content_type) => FormatTag::detect_content_type(content_type)?,
                    None => {
                        let ext = url_extension(&url);
                        FormatTag::from_extension(&ext)
                            .ok_or(DataError::UnsupportedFormat(ext))?
                    }
                };
                (fetched.bytes, format)
            }
        };

        let table = task::spawn_blocking(move || data::parse(&bytes, format))
            .await
            .map_err(|err| ServiceError::Internal(format!("parsing task failed: {err}")))??;
        Ok(table)
    }
}

fn validate(inputs: AnalysisInputs) -> Result<ValidatedInputs, ServiceError> {
    let data = inputs.data.ok_or(ServiceError::MissingInput("data"))?;
    let model = inputs.model.ok_or(ServiceError::MissingInput("model"))?;

    let method = match inputs.method.as_deref().map(str::trim) {
        None | Some("") => Method::default(),
        Some(raw) => raw.parse().map_err(ServiceError::InvalidRequest)?,
    };
    let feature = match inputs.feature_index.as_deref().map(str::trim) {
        None | Some("") => 0,
        Some(raw) => raw.parse::<usize>().map_err(|_| {
            ServiceError::InvalidRequest(format!(
                "feature_index must be a non-negative integer, got `{raw}`"
            ))
        })?,
    };
    let node_idx = match inputs.node_idx.as_deref().map(str::trim) {
        None | Some("") => None,
        Some(raw) => Some(raw.parse::<usize>().map_err(|_| {
            ServiceError::InvalidRequest(format!("node_idx must be a non-negative integer, got `{raw}`"))
        })?),
    };

    Ok(ValidatedInputs {
        data,
        model,
        job: AnalysisJob {
            method,
            feature,
            target_name: inputs.target_name.unwrap_or_default(),
            node_idx,
        },
        feature_names: inputs.feature_names,
        publish_url: inputs.publish_url.filter(|url| !url.trim().is_empty()),
    })
}

/// Plot name → base64 PNG.
pub fn encode_plots(plots: &PlotSet) -> BTreeMap<String, String> {
    plots
        .iter()
        .map(|(key, png)| (key.to_string(), STANDARD.encode(png)))
        .collect()
}
