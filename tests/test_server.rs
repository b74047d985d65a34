//! Integration test: HTTP surface of the analysis service

use std::{collections::BTreeMap, sync::Arc};

use async_trait::async_trait;
use axum::body::{Body, Bytes};
use axum::http::{Request, StatusCode, header};
use base64::{Engine, engine::general_purpose::STANDARD};
use feature_effect_service::{
    AnalysisPipeline, AppConfig, build_router,
    remote::{FetchedResource, RemoteClient},
};
use parking_lot::Mutex;
use serde_json::{Value, json};
use serde_pickle::{HashableValue, SerOptions};
use tower::ServiceExt;

const BOUNDARY: &str = "XxFeatureEffectBoundaryxX";
const PNG_SIGNATURE: &[u8] = b"\x89PNG\r\n\x1a\n";

#[derive(Default)]
struct StubRemote {
    resources: Mutex<BTreeMap<String, FetchedResource>>,
    published: Mutex<Vec<String>>,
}

impl StubRemote {
    fn serve(&self, url: &str, body: Vec<u8>, content_type: Option<&str>) {
        self.resources.lock().insert(
            url.to_string(),
            FetchedResource {
                bytes: Bytes::from(body),
                content_type: content_type.map(str::to_string),
            },
        );
    }
}

#[async_trait]
impl RemoteClient for StubRemote {
    async fn fetch(&self, url: &str) -> anyhow::Result<FetchedResource> {
        self.resources
            .lock()
            .get(url)
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("404 Not Found for {url}"))
    }

    async fn publish(&self, url: &str, _payload: &Value) -> bool {
        self.published.lock().push(url.to_string());
        true
    }
}

fn test_config() -> AppConfig {
    AppConfig {
        nof_instances: 100,
        pdp_grid_points: 20,
        rhale_bins: 10,
        plot_width: 240,
        plot_height: 180,
        ..AppConfig::default()
    }
}

fn test_app(remote: Arc<StubRemote>) -> axum::Router {
    app_with_config(remote, test_config())
}

fn app_with_config(remote: Arc<StubRemote>, config: AppConfig) -> axum::Router {
    let config = Arc::new(config);
    let pipeline = Arc::new(AnalysisPipeline::with_remote(config.as_ref(), remote));
    build_router(config, pipeline)
}

fn linear_model(coef: &[f64]) -> Vec<u8> {
    let mut map = BTreeMap::new();
    map.insert(
        HashableValue::String("coef".into()),
        serde_pickle::Value::List(coef.iter().map(|c| serde_pickle::Value::F64(*c)).collect()),
    );
    map.insert(
        HashableValue::String("intercept".into()),
        serde_pickle::Value::F64(0.5),
    );
    serde_pickle::value_to_vec(&serde_pickle::Value::Dict(map), SerOptions::new()).unwrap()
}

fn training_csv(rows: usize) -> Vec<u8> {
    let mut csv = String::from("x1,x2,x3\n");
    for i in 0..rows {
        let t = i as f64 / rows as f64;
        csv.push_str(&format!("{},{},{}\n", t, (t * 7.0) % 1.0, 1.0 - t * t));
    }
    csv.into_bytes()
}

enum Part<'a> {
    File { name: &'a str, filename: &'a str, bytes: Vec<u8> },
    Text { name: &'a str, value: &'a str },
}

fn multipart_request(uri: &str, parts: Vec<Part<'_>>) -> Request<Body> {
    let mut body = Vec::new();
    for part in parts {
        body.extend_from_slice(format!("--{BOUNDARY}\r\n").as_bytes());
        match part {
            Part::File { name, filename, bytes } => {
                body.extend_from_slice(
                    format!(
                        "Content-Disposition: form-data; name=\"{name}\"; filename=\"{filename}\"\r\n\
                         Content-Type: application/octet-stream\r\n\r\n"
                    )
                    .as_bytes(),
                );
                body.extend_from_slice(&bytes);
            }
            Part::Text { name, value } => {
                body.extend_from_slice(
                    format!("Content-Disposition: form-data; name=\"{name}\"\r\n\r\n{value}")
                        .as_bytes(),
                );
            }
        }
        body.extend_from_slice(b"\r\n");
    }
    body.extend_from_slice(format!("--{BOUNDARY}--\r\n").as_bytes());

    Request::builder()
        .method("POST")
        .uri(uri)
        .header(
            header::CONTENT_TYPE,
            format!("multipart/form-data; boundary={BOUNDARY}"),
        )
        .body(Body::from(body))
        .unwrap()
}

fn json_request(uri: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

async fn send(app: axum::Router, request: Request<Body>) -> (StatusCode, Bytes) {
    let response = app.oneshot(request).await.unwrap();
    let status = response.status();
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    (status, body)
}

async fn send_json(app: axum::Router, request: Request<Body>) -> (StatusCode, Value) {
    let (status, body) = send(app, request).await;
    (status, serde_json::from_slice(&body).unwrap())
}

fn decoded_plot(body: &Value, key: &str) -> Vec<u8> {
    let encoded = body["results"][key].as_str().unwrap();
    STANDARD.decode(encoded).unwrap()
}

#[tokio::test]
async fn test_health_endpoint() {
    let (status, body) = send(
        test_app(Arc::default()),
        Request::builder().uri("/health").body(Body::empty()).unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(&body[..], b"ok");
}

#[tokio::test]
async fn test_multipart_csv_and_pickle_pdp() {
    let request = multipart_request(
        "/analyze",
        vec![
            Part::File { name: "data", filename: "train.csv", bytes: training_csv(1000) },
            Part::File { name: "model", filename: "model.pkl", bytes: linear_model(&[1.0, 2.0, 3.0]) },
            Part::Text { name: "method", value: "PDP" },
            Part::Text { name: "feature_index", value: "0" },
        ],
    );

    let (status, body) = send_json(test_app(Arc::default()), request).await;
    assert_eq!(status, StatusCode::OK, "{body}");
    assert_eq!(body["status"], "success");
    assert!(body.get("published").is_none());
    assert!(decoded_plot(&body, "pdp_plot").starts_with(PNG_SIGNATURE));
}

#[tokio::test]
async fn test_json_urls_with_rhale() {
    let remote = Arc::new(StubRemote::default());
    remote.serve("https://data.test/train.csv", training_csv(400), Some("text/csv"));
    remote.serve("https://models.test/linear.pkl", linear_model(&[1.0, -2.0, 0.5]), None);

    let request = json_request(
        "/analyze",
        json!({
            "data_url": "https://data.test/train.csv",
            "model_url": "https://models.test/linear.pkl",
            "method": "rhale",
            "feature_index": 1,
        }),
    );
    let (status, body) = send_json(test_app(remote), request).await;
    assert_eq!(status, StatusCode::OK, "{body}");
    assert!(decoded_plot(&body, "rhale_plot").starts_with(PNG_SIGNATURE));
}

#[tokio::test]
async fn test_json_data_object_from_url() {
    let remote = Arc::new(StubRemote::default());
    remote.serve(
        "https://data.test/matrix",
        br#"{"data": [[1, 2], [3, 4]]}"#.to_vec(),
        Some("application/json; charset=utf-8"),
    );

    let request = json_request(
        "/analyze",
        json!({
            "data_url": "https://data.test/matrix",
            "model": STANDARD.encode(linear_model(&[2.0, 0.0])),
        }),
    );
    let (status, body) = send_json(test_app(remote), request).await;
    assert_eq!(status, StatusCode::OK, "{body}");
    assert!(body["results"]["pdp_plot"].is_string());
}

#[tokio::test]
async fn test_feature_effect_returns_png() {
    let request = json_request(
        "/feature_effect",
        json!({
            "file": STANDARD.encode(training_csv(200)),
            "model": STANDARD.encode(linear_model(&[1.0, 1.0, 1.0])),
            "feature_index": "2",
        }),
    );
    let response = test_app(Arc::default()).oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()[header::CONTENT_TYPE], "image/png");

    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    assert!(body.starts_with(PNG_SIGNATURE));
}

#[tokio::test]
async fn test_unsupported_model_extension_is_rejected() {
    let request = json_request(
        "/analyze",
        json!({
            "file": STANDARD.encode(training_csv(10)),
            "model_url": "https://models.test/payload.exe",
        }),
    );
    let (status, body) = send_json(test_app(Arc::default()), request).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["status"], "error");
    assert!(body["message"].as_str().unwrap().contains("exe"));
}

#[tokio::test]
async fn test_missing_data_is_rejected() {
    let request = multipart_request(
        "/analyze",
        vec![Part::File { name: "model", filename: "model.pkl", bytes: linear_model(&[1.0]) }],
    );
    let (status, body) = send_json(test_app(Arc::default()), request).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body, json!({ "status": "error", "message": "No data provided" }));
}

#[tokio::test]
async fn test_empty_body_reports_missing_data() {
    let request = Request::builder()
        .method("POST")
        .uri("/analyze")
        .body(Body::empty())
        .unwrap();
    let (status, body) = send_json(test_app(Arc::default()), request).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["message"], "No data provided");
}

#[tokio::test]
async fn test_unknown_data_extension_is_rejected() {
    let request = multipart_request(
        "/analyze",
        vec![
            Part::File { name: "data", filename: "notes.txt", bytes: b"1,2\n".to_vec() },
            Part::File { name: "model", filename: "model.pkl", bytes: linear_model(&[1.0, 1.0]) },
        ],
    );
    let (status, body) = send_json(test_app(Arc::default()), request).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["message"].as_str().unwrap().contains("txt"));
}

#[tokio::test]
async fn test_feature_index_out_of_range() {
    let request = json_request(
        "/analyze",
        json!({
            "file": STANDARD.encode(training_csv(50)),
            "model": STANDARD.encode(linear_model(&[1.0, 1.0, 1.0])),
            "feature_index": 3,
        }),
    );
    let (status, body) = send_json(test_app(Arc::default()), request).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["message"].as_str().unwrap().contains("out of range"));
}

#[tokio::test]
async fn test_unavailable_method_is_a_server_error() {
    let request = json_request(
        "/analyze",
        json!({
            "file": STANDARD.encode(training_csv(50)),
            "model": STANDARD.encode(linear_model(&[1.0, 1.0, 1.0])),
            "method": "shap_dp",
        }),
    );
    let (status, body) = send_json(test_app(Arc::default()), request).await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(body["status"], "error");
    assert!(body["message"].as_str().unwrap().starts_with("Error during analysis"));
}

#[tokio::test]
async fn test_results_are_published_on_request() {
    let remote = Arc::new(StubRemote::default());
    let request = json_request(
        "/analyze",
        json!({
            "file": STANDARD.encode(training_csv(50)),
            "model": STANDARD.encode(linear_model(&[1.0, 1.0, 1.0])),
            "publish_url": "https://sink.test/results",
        }),
    );
    let (status, body) = send_json(test_app(remote.clone()), request).await;
    assert_eq!(status, StatusCode::OK, "{body}");
    assert_eq!(body["published"], true);
    assert_eq!(remote.published.lock().as_slice(), ["https://sink.test/results"]);
}

#[tokio::test]
async fn test_cors_preflight_allows_configured_origin() {
    let request = Request::builder()
        .method("OPTIONS")
        .uri("/analyze")
        .header(header::ORIGIN, "http://localhost:4200")
        .header(header::ACCESS_CONTROL_REQUEST_METHOD, "POST")
        .header(header::ACCESS_CONTROL_REQUEST_HEADERS, "content-type")
        .body(Body::empty())
        .unwrap();
    let response = test_app(Arc::default()).oneshot(request).await.unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let headers = response.headers();
    assert_eq!(headers[header::ACCESS_CONTROL_ALLOW_ORIGIN], "http://localhost:4200");
    assert_eq!(headers[header::ACCESS_CONTROL_ALLOW_CREDENTIALS], "true");
}

#[tokio::test]
async fn test_oversized_body_is_rejected() {
    let config = AppConfig {
        max_upload_bytes: 1024,
        ..test_config()
    };
    let request = json_request(
        "/analyze",
        json!({
            "file": STANDARD.encode(training_csv(500)),
            "model": STANDARD.encode(linear_model(&[1.0, 1.0, 1.0])),
        }),
    );
    let (status, body) = send_json(app_with_config(Arc::default(), config), request).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["status"], "error");
    assert!(body["message"].as_str().unwrap().contains("limit"));
}
