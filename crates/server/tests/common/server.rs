//! Server test utilities.

use axum::body::Body;
use axum::http::{Request, StatusCode, header};
use axum::response::Response;
use courier_core::config::AppConfig;
use courier_server::{AppState, create_router};
use serde_json::Value;
use std::path::Path;
use tempfile::TempDir;
use tower::ServiceExt;

/// A test server wrapper with all dependencies.
/// Note: #[allow(dead_code)] because each test file compiles common/ separately.
#[allow(dead_code)]
pub struct TestServer {
    pub router: axum::Router,
    pub state: AppState,
    temp_dir: TempDir,
}

#[allow(dead_code)]
impl TestServer {
    /// Create a new test server with temporary storage.
    pub async fn new() -> Self {
        Self::with_config(|_| {}).await
    }

    /// Create a test server with custom config modifications.
    pub async fn with_config<F>(modifier: F) -> Self
    where
        F: FnOnce(&mut AppConfig),
    {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp directory");
        let mut config = AppConfig::for_testing(temp_dir.path());
        modifier(&mut config);

        let stores = courier_storage::from_config(&config.storage)
            .await
            .expect("Failed to create storage");
        let metadata = courier_metadata::from_config(&config.metadata)
            .await
            .expect("Failed to create metadata store");

        let state = AppState::new(config, stores, metadata);
        let router = create_router(state.clone());

        Self {
            router,
            state,
            temp_dir,
        }
    }

    /// Root of the temporary data directory.
    pub fn root(&self) -> &Path {
        self.temp_dir.path()
    }

    /// Send a request and return the raw response.
    pub async fn send(&self, request: Request<Body>) -> Response {
        self.router.clone().oneshot(request).await.unwrap()
    }

    /// Send a JSON request (or a bodyless one) and decode the JSON reply.
    pub async fn json(&self, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
        let builder = Request::builder().method(method).uri(uri);
        let request = match body {
            Some(v) => builder
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(serde_json::to_vec(&v).unwrap()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        };
        into_json(self.send(request).await).await
    }

    /// POST a multipart form and decode the JSON reply.
    pub async fn multipart(&self, uri: &str, form: super::Multipart) -> (StatusCode, Value) {
        let (content_type, body) = form.finish();
        let request = Request::builder()
            .method("POST")
            .uri(uri)
            .header(header::CONTENT_TYPE, content_type)
            .body(Body::from(body))
            .unwrap();
        into_json(self.send(request).await).await
    }

    /// GET a path and return status, headers, and the full body.
    pub async fn get_bytes(&self, uri: &str) -> (StatusCode, axum::http::HeaderMap, Vec<u8>) {
        let request = Request::builder().uri(uri).body(Body::empty()).unwrap();
        let response = self.send(request).await;
        let status = response.status();
        let headers = response.headers().clone();
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        (status, headers, body.to_vec())
    }
}

async fn into_json(response: Response) -> (StatusCode, Value) {
    let status = response.status();
    let body_bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();

    let json: Value = if body_bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&body_bytes).unwrap_or(Value::Null)
    };

    (status, json)
}
