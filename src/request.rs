//! Extraction of analysis inputs from multipart forms and JSON bodies.

use axum::{
    Json,
    async_trait,
    body::Bytes,
    extract::{FromRequest, Multipart, Request},
    http::header::CONTENT_TYPE,
};
use base64::{Engine, engine::general_purpose::STANDARD};
use serde::Deserialize;
use tracing::debug;

use crate::{
    data::DataSource, error::ServiceError, model::ModelSource, pipeline::AnalysisInputs,
};

const DEFAULT_DATA_NAME: &str = "data.csv";
const DEFAULT_MODEL_NAME: &str = "model.pkl";

/// JSON form of a request. Files travel base64-encoded in `file`/`model`;
/// otherwise `data_url`/`model_url` point at them.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct JsonRequest {
    pub file: Option<String>,
    pub file_name: Option<String>,
    pub data_url: Option<String>,
    pub model: Option<String>,
    pub model_name: Option<String>,
    pub model_url: Option<String>,
    pub method: Option<String>,
    pub feature_index: Option<Scalar>,
    pub feature_names: Option<Vec<String>>,
    pub target_name: Option<String>,
    pub node_idx: Option<Scalar>,
    pub publish_url: Option<String>,
}

/// A number that callers may also send as a string.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum Scalar {
    Int(i64),
    Text(String),
}

impl Scalar {
    fn into_text(self) -> String {
        match self {
            Scalar::Int(value) => value.to_string(),
            Scalar::Text(text) => text,
        }
    }
}

impl TryFrom<JsonRequest> for AnalysisInputs {
    type Error = ServiceError;

    fn try_from(body: JsonRequest) -> Result<Self, Self::Error> {
        let data = match (non_empty(body.file), non_empty(body.data_url)) {
            (Some(encoded), _) => Some(DataSource::Upload {
                filename: body.file_name.unwrap_or_else(|| DEFAULT_DATA_NAME.to_string()),
                bytes: decode_base64("file", &encoded)?,
            }),
            (None, Some(url)) => Some(DataSource::Url(url)),
            (None, None) => None,
        };
        let model = match (non_empty(body.model), non_empty(body.model_url)) {
            (Some(encoded), _) => Some(ModelSource::Upload {
                filename: body.model_name.unwrap_or_else(|| DEFAULT_MODEL_NAME.to_string()),
                bytes: decode_base64("model", &encoded)?,
            }),
            (None, Some(url)) => Some(ModelSource::Url(url)),
            (None, None) => None,
        };

        Ok(AnalysisInputs {
            data,
            model,
            method: body.method,
            feature_index: body.feature_index.map(Scalar::into_text),
            feature_names: body.feature_names,
            target_name: body.target_name,
            node_idx: body.node_idx.map(Scalar::into_text),
            publish_url: body.publish_url,
        })
    }
}

/// Extractor accepting either `multipart/form-data` or `application/json`.
///
/// Any other content type yields empty inputs, which the pipeline reports
/// as missing data.
pub struct AnalysisForm(pub AnalysisInputs);

#[async_trait]
impl<S> FromRequest<S> for AnalysisForm
where
    S: Send + Sync,
{
    type Rejection = ServiceError;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        let content_type = req
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .unwrap_or_default()
            .to_ascii_lowercase();

        if content_type.starts_with("multipart/form-data") {
            let multipart = Multipart::from_request(req, state)
                .await
                .map_err(|rejection| ServiceError::InvalidRequest(rejection.body_text()))?;
            return read_multipart(multipart).await.map(AnalysisForm);
        }
        if content_type.contains("json") {
            let Json(body) = Json::<JsonRequest>::from_request(req, state)
                .await
                .map_err(|rejection| ServiceError::InvalidRequest(rejection.body_text()))?;
            return AnalysisInputs::try_from(body).map(AnalysisForm);
        }

        debug!(%content_type, "request carries no recognised body");
        Ok(AnalysisForm(AnalysisInputs::default()))
    }
}

async fn read_multipart(mut multipart: Multipart) -> Result<AnalysisInputs, ServiceError> {
    let mut inputs = AnalysisInputs::default();
    let mut data_url = None;
    let mut model_url = None;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|err| ServiceError::InvalidRequest(err.body_text()))?
    {
        let name = field.name().unwrap_or_default().to_string();
        let filename = field.file_name().map(str::to_string);

        match (name.as_str(), filename) {
            ("data" | "file", Some(filename)) => {
                let bytes = field_bytes(field).await?;
                debug!(%filename, size = bytes.len(), "received data upload");
                inputs.data = Some(DataSource::Upload { filename, bytes });
            }
            ("model", Some(filename)) => {
                let bytes = field_bytes(field).await?;
                debug!(%filename, size = bytes.len(), "received model upload");
                inputs.model = Some(ModelSource::Upload { filename, bytes });
            }
            _ => {
                let text = field
                    .text()
                    .await
                    .map_err(|err| ServiceError::InvalidRequest(err.body_text()))?;
                let Some(text) = non_empty(Some(text)) else {
                    continue;
                };
                match name.as_str() {
                    "data_url" => data_url = Some(text),
                    "model_url" => model_url = Some(text),
                    "method" => inputs.method = Some(text),
                    "feature_index" => inputs.feature_index = Some(text),
                    "feature_names" => inputs.feature_names = Some(parse_feature_names(&text)),
                    "target_name" => inputs.target_name = Some(text),
                    "node_idx" => inputs.node_idx = Some(text),
                    "publish_url" => inputs.publish_url = Some(text),
                    other => debug!(field = other, "ignoring form field"),
                }
            }
        }
    }

    // uploads win over URLs
    if inputs.data.is_none() {
        inputs.data = data_url.map(DataSource::Url);
    }
    if inputs.model.is_none() {
        inputs.model = model_url.map(ModelSource::Url);
    }
    Ok(inputs)
}

async fn field_bytes(field: axum::extract::multipart::Field<'_>) -> Result<Bytes, ServiceError> {
    field
        .bytes()
        .await
        .map_err(|err| ServiceError::InvalidRequest(err.body_text()))
}

/// Accepts a JSON array of strings or a comma-separated list.
fn parse_feature_names(raw: &str) -> Vec<String> {
    if let Ok(names) = serde_json::from_str::<Vec<String>>(raw) {
        return names;
    }
    raw.split(',').map(|name| name.trim().to_string()).collect()
}

fn decode_base64(field: &str, encoded: &str) -> Result<Bytes, ServiceError> {
    STANDARD
        .decode(encoded.trim())
        .map(Bytes::from)
        .map_err(|err| ServiceError::InvalidRequest(format!("`{field}` is not valid base64: {err}")))
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}
