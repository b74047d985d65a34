use std::{collections::BTreeMap, sync::Arc};

use axum::{
    Json, Router,
    extract::{DefaultBodyLimit, State},
    http::{HeaderValue, Method, header},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde::Serialize;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{debug, warn};

use crate::{
    config::AppConfig,
    error::ServiceError,
    pipeline::{AnalysisPipeline, Stage, encode_plots},
    request::AnalysisForm,
};

const FALLBACK_ORIGIN: &str = "http://localhost:4200";

#[derive(Clone)]
pub struct AppState {
    pub pipeline: Arc<AnalysisPipeline>,
}

#[derive(Serialize)]
struct AnalyzeResponse {
    status: &'static str,
    results: BTreeMap<String, String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    published: Option<bool>,
}

pub fn build_router(config: Arc<AppConfig>, pipeline: Arc<AnalysisPipeline>) -> Router {
    let cors = cors_layer(&config);
    let body_limit = DefaultBodyLimit::max(config.max_upload_bytes);
    let state = AppState { pipeline };

    Router::new()
        .route("/health", get(health))
        .route("/analyze", post(analyze))
        .route("/feature_effect", post(feature_effect))
        .with_state(state)
        .layer(body_limit)
        .layer(cors)
        .layer(TraceLayer::new_for_http())
}

fn cors_layer(config: &AppConfig) -> CorsLayer {
    let origin = HeaderValue::from_str(&config.allowed_origin).unwrap_or_else(|_| {
        warn!(origin = %config.allowed_origin, "invalid CORS origin, using default");
        HeaderValue::from_static(FALLBACK_ORIGIN)
    });
    CorsLayer::new()
        .allow_origin(origin)
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([header::CONTENT_TYPE])
        .allow_credentials(true)
}

async fn health() -> &'static str {
    "ok"
}

async fn analyze(
    State(state): State<AppState>,
    AnalysisForm(inputs): AnalysisForm,
) -> Result<Json<AnalyzeResponse>, ServiceError> {
    let outcome = state.pipeline.run(inputs).await?;
    let results = encode_plots(&outcome.plots);
    debug!(stage = %Stage::ResponseSent, plots = results.len());

    Ok(Json(AnalyzeResponse {
        status: "success",
        results,
        published: outcome.published,
    }))
}

/// Same pipeline as `/analyze`, answering with the bare PNG.
async fn feature_effect(
    State(state): State<AppState>,
    AnalysisForm(inputs): AnalysisForm,
) -> Result<Response, ServiceError> {
    let outcome = state.pipeline.run(inputs).await?;
    let png = outcome
        .plots
        .get(&outcome.method.plot_key())
        .ok_or_else(|| {
            ServiceError::Analysis(format!("no `{}` plot was produced", outcome.method))
        })?
        .to_vec();
    debug!(stage = %Stage::ResponseSent, bytes = png.len());

    Ok(([(header::CONTENT_TYPE, "image/png")], png).into_response())
}
