//! HTTP surface for the batch pipeline
//!
//! `POST /api/screenshot` takes `{"urls": [...]}` and always answers a
//! completed batch with `200`, even when individual URLs failed.

use crate::{validate_batch, BatchOrchestrator, PipelineError};
use axum::{
    body::Bytes,
    extract::State,
    http::StatusCode,
    response::{Html, IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use metrics_exporter_prometheus::PrometheusHandle;
use serde::Serialize;
use std::future::Future;
use tracing::{error, info};

#[derive(Clone)]
pub struct AppState {
    pub orchestrator: BatchOrchestrator,
    pub metrics: Option<PrometheusHandle>,
}

impl AppState {
    pub fn new(orchestrator: BatchOrchestrator) -> Self {
        Self {
            orchestrator,
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, handle: PrometheusHandle) -> Self {
        self.metrics = Some(handle);
        self
    }
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub message: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
}

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/", get(index_handler))
        .route(
            "/api/screenshot",
            post(capture_batch_handler).fallback(method_not_allowed),
        )
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .with_state(state)
}

/// Bind `bind_address` and serve until `shutdown` resolves.
pub async fn serve<F>(
    state: AppState,
    bind_address: &str,
    shutdown: F,
) -> Result<(), PipelineError>
where
    F: Future<Output = ()> + Send + 'static,
{
    let listener = tokio::net::TcpListener::bind(bind_address).await?;
    info!("Listening on {}", listener.local_addr()?);

    axum::serve(listener, create_router(state))
        .with_graceful_shutdown(shutdown)
        .await?;

    info!("Server stopped");
    Ok(())
}

async fn capture_batch_handler(State(state): State<AppState>, body: Bytes) -> Response {
    let value: serde_json::Value = match serde_json::from_slice(&body) {
        Ok(value) => value,
        Err(e) => return bad_request(format!("Request body must be JSON: {e}")),
    };

    let allow_empty = state.orchestrator.config().allow_empty_batch;
    let urls = match validate_batch(&value, allow_empty) {
        Ok(urls) => urls,
        Err(e) => return bad_request(e.to_string()),
    };

    info!("Received {} URLs for capture", urls.len());

    match state.orchestrator.run(urls).await {
        Ok(result) => (StatusCode::OK, Json(result)).into_response(),
        Err(e @ PipelineError::InvalidBatch(_)) => bad_request(e.to_string()),
        Err(e) => {
            error!("Batch failed: {}", e);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(ErrorResponse {
                    message: "Internal server error",
                    error: Some(e.to_string()),
                }),
            )
                .into_response()
        }
    }
}

fn bad_request(error: String) -> Response {
    (
        StatusCode::BAD_REQUEST,
        Json(ErrorResponse {
            message: "Bad request",
            error: Some(error),
        }),
    )
        .into_response()
}

async fn method_not_allowed() -> Response {
    (
        StatusCode::METHOD_NOT_ALLOWED,
        Json(ErrorResponse {
            message: "Method not allowed",
            error: None,
        }),
    )
        .into_response()
}

async fn health_handler() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}

async fn metrics_handler(State(state): State<AppState>) -> Response {
    match &state.metrics {
        Some(handle) => (StatusCode::OK, handle.render()).into_response(),
        None => (StatusCode::NOT_FOUND, "metrics exporter not installed").into_response(),
    }
}

async fn index_handler() -> Html<&'static str> {
    Html(INDEX_HTML)
}

const INDEX_HTML: &str = r#"<!doctype html>
<html lang="en">
<head>
<meta charset="utf-8">
<title>Page Capture</title>
<style>
  body { font-family: sans-serif; max-width: 48rem; margin: 2rem auto; }
  textarea { width: 100%; height: 10rem; }
  li.failed { color: #b00020; }
</style>
</head>
<body>
<h1>Page Capture</h1>
<form id="capture">
  <label for="urls">URLs, one per line</label>
  <textarea id="urls" name="urls" placeholder="https://example.com"></textarea>
  <button type="submit">Capture</button>
</form>
<ul id="results"></ul>
<script>
document.getElementById('capture').addEventListener('submit', async (event) => {
  event.preventDefault();
  const urls = document.getElementById('urls').value
    .split('\n').map(u => u.trim()).filter(Boolean);
  const list = document.getElementById('results');
  list.innerHTML = '';
  const res = await fetch('/api/screenshot', {
    method: 'POST',
    headers: { 'Content-Type': 'application/json' },
    body: JSON.stringify({ urls }),
  });
  const data = await res.json();
  if (!res.ok) {
    list.innerHTML = '<li class="failed"></li>';
    list.firstChild.textContent = data.error || data.message;
    return;
  }
  for (const entry of data.results) {
    const item = document.createElement('li');
    item.textContent = entry.url + ': ';
    if (entry.status === 'failed') {
      item.className = 'failed';
      item.textContent += entry.error.message;
    } else {
      for (const asset of entry.stored) {
        if (asset.status === 'stored') {
          const link = document.createElement('a');
          link.href = asset.reference;
          link.textContent = 'part ' + asset.index;
          item.appendChild(link);
          item.appendChild(document.createTextNode(' '));
        } else {
          item.appendChild(document.createTextNode('part ' + asset.index + ' failed '));
        }
      }
    }
    list.appendChild(item);
  }
});
</script>
</body>
</html>
"#;
