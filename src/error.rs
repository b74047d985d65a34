use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;

/// Failures raised while detecting or parsing a dataset.
#[derive(Debug, Error)]
pub enum DataError {
    #[error("unsupported file format: {0}")]
    UnsupportedFormat(String),
    #[error("data is empty")]
    EmptyData,
    #[error("invalid JSON: {0}")]
    InvalidJson(String),
    #[error("unsupported data structure: {0}")]
    UnsupportedStructure(String),
    #[error("data has {0} dimensions, at most 2 are supported")]
    TooManyDimensions(usize),
    #[error("csv error: {0}")]
    Csv(String),
    #[error("npy error: {0}")]
    Npy(String),
    #[error("failed to fetch data from {url}: {reason}")]
    Fetch { url: String, reason: String },
}

/// Failures raised while resolving, loading or invoking a model.
#[derive(Debug, Error)]
pub enum ModelError {
    #[error("unsupported model format: {0}")]
    UnsupportedModelFormat(String),
    #[error("failed to fetch model from {url}: {reason}")]
    ModelFetch { url: String, reason: String },
    #[error("failed to load model: {0}")]
    ModelLoad(String),
    #[error("need at least {required} data points, got {available}")]
    InsufficientData { required: usize, available: usize },
    #[error("prediction failed in {model_type}: {source}")]
    Prediction {
        model_type: String,
        #[source]
        source: anyhow::Error,
    },
}

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("No {0} provided")]
    MissingInput(&'static str),
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error("Failed to parse file data: {0}")]
    DataParse(#[from] DataError),
    #[error("Error processing model: {0}")]
    Model(#[from] ModelError),
    #[error("Error during analysis: {0}")]
    Analysis(String),
    #[error("internal error: {0}")]
    Internal(String),
}

impl ServiceError {
    pub fn status(&self) -> StatusCode {
        match self {
            ServiceError::MissingInput(_)
            | ServiceError::InvalidRequest(_)
            | ServiceError::DataParse(_)
            | ServiceError::Model(_) => StatusCode::BAD_REQUEST,
            ServiceError::Analysis(_) | ServiceError::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

impl IntoResponse for ServiceError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!(error = %self, "request failed");
        } else {
            tracing::warn!(error = %self, "request rejected");
        }

        let body = serde_json::json!({
            "status": "error",
            "message": self.to_string(),
        });

        (status, axum::Json(body)).into_response()
    }
}
