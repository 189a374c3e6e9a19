//! REST API handlers
//!
//! Entity routes submit a job to the worker's queue and relay its reply.

use axum::{
    body::Bytes,
    extract::{Path, Query, State},
    http::{header, StatusCode},
    response::{IntoResponse, Json, Response},
    routing::{get, post, put},
    Router,
};
use modeld_network::{JobFailure, JobFunc, QueueClient};
use modeld_scheduler::{Dispatcher, WorkerStatus};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use tracing::info;

/// Application state shared across handlers
pub struct AppState {
    pub client: QueueClient,
    pub dispatcher: Dispatcher,
}

/// Create the API router
pub fn create_router(client: QueueClient, dispatcher: Dispatcher) -> Router {
    let state = Arc::new(AppState { client, dispatcher });

    Router::new()
        .route("/api/v1/models/save", post(save_models))
        .route("/api/v1/models/:name/run", post(run_model))
        .route("/api/v1/models/:name/save", post(save_model))
        .route("/api/v1/models/:name/reset", post(reset_model))
        .route("/api/v1/models/:name/save_delay", put(set_save_delay))
        .route(
            "/api/v1/models/:name/snapshot",
            get(get_snapshot).put(put_snapshot),
        )
        .route("/api/v1/status", get(get_status))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Job failure rendered as an HTTP error
#[derive(Debug)]
pub struct ApiError(pub JobFailure);

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: String,
    pub message: String,
}

/// HTTP status for a job failure kind
pub fn status_for(kind: &str) -> StatusCode {
    match kind {
        "not_found" | "unknown_model_kind" => StatusCode::NOT_FOUND,
        "invalid_request" | "configuration_invalid" => StatusCode::BAD_REQUEST,
        "lock_timeout" => StatusCode::CONFLICT,
        "timeout" => StatusCode::GATEWAY_TIMEOUT,
        "unavailable" => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: self.0.kind.clone(),
            message: self.0.message,
        };
        (status_for(&body.error), Json(body)).into_response()
    }
}

impl From<JobFailure> for ApiError {
    fn from(failure: JobFailure) -> Self {
        Self(failure)
    }
}

/// Relay a JSON job reply
fn json_reply(bytes: Vec<u8>) -> Response {
    ([(header::CONTENT_TYPE, "application/json")], bytes).into_response()
}

async fn submit(
    state: &AppState,
    func: JobFunc,
    name: &str,
    payload: Vec<u8>,
) -> Result<Response, ApiError> {
    let reply = state.client.submit(func, name, payload).await?;
    Ok(json_reply(reply))
}

/// Run one input through an entity's model
async fn run_model(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
    body: Bytes,
) -> Result<Response, ApiError> {
    submit(&state, JobFunc::Run, &name, body.to_vec()).await
}

/// Snapshot one entity
async fn save_model(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
) -> Result<Response, ApiError> {
    submit(&state, JobFunc::SaveModel, &name, Vec::new()).await
}

#[derive(Debug, Default, Deserialize)]
pub struct SaveQuery {
    /// Only write back evicted entities
    #[serde(default)]
    pub evicted: bool,
}

/// Snapshot every dirty entity
async fn save_models(
    State(state): State<Arc<AppState>>,
    Query(query): Query<SaveQuery>,
) -> Result<Response, ApiError> {
    let func = if query.evicted {
        JobFunc::SaveEvicted
    } else {
        JobFunc::SaveModels
    };
    info!(func = %func, "Save requested");
    submit(&state, func, "", Vec::new()).await
}

/// Discard an entity's state; the body may carry replacement parameters
async fn reset_model(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
    body: Bytes,
) -> Result<Response, ApiError> {
    info!(name = %name, "Reset requested");
    submit(&state, JobFunc::ResetModel, &name, body.to_vec()).await
}

/// Change an entity's auto-save delay
async fn set_save_delay(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
    body: Bytes,
) -> Result<Response, ApiError> {
    submit(&state, JobFunc::SetSaveDelay, &name, body.to_vec()).await
}

/// Download an entity's snapshot
async fn get_snapshot(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
) -> Result<Response, ApiError> {
    submit(&state, JobFunc::GetModel, &name, Vec::new()).await
}

/// Upload a snapshot for an entity
async fn put_snapshot(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
    body: Bytes,
) -> Result<Response, ApiError> {
    info!(name = %name, bytes = body.len(), "Snapshot upload");
    submit(&state, JobFunc::PutModel, &name, body.to_vec()).await
}

/// System status response
#[derive(Debug, Serialize)]
pub struct StatusResponse {
    pub version: String,
    pub queue_open: bool,
    #[serde(flatten)]
    pub worker: WorkerStatus,
}

/// Get system status
async fn get_status(
    State(state): State<Arc<AppState>>,
) -> Result<Json<StatusResponse>, ApiError> {
    let worker = state
        .dispatcher
        .status()
        .await
        .map_err(|e| ApiError(JobFailure::from(&e)))?;
    Ok(Json(StatusResponse {
        version: env!("CARGO_PKG_VERSION").to_string(),
        queue_open: !state.client.is_closed(),
        worker,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{Method, Request};
    use modeld_core::{FlushMode, WorkerConfig};
    use modeld_network::MemoryQueue;
    use serde_json::{json, Value};
    use std::time::Duration;
    use tempfile::TempDir;
    use tower::ServiceExt;

    async fn app(tmp: &TempDir) -> Router {
        let mut config = WorkerConfig::default();
        config.storage.checkpoint_root = tmp.path().join("models");
        config.cache.capacity = 2;
        config.cache.flush_mode = FlushMode::Inline;

        let dispatcher = Dispatcher::from_config(&config).unwrap();
        dispatcher.store().init().await.unwrap();
        let (queue, client) = MemoryQueue::new(16, Duration::from_secs(5));
        tokio::spawn(modeld_scheduler::serve(
            Arc::new(queue),
            dispatcher.clone(),
            4,
            std::future::pending::<()>(),
        ));
        create_router(client, dispatcher)
    }

    async fn call(app: &Router, method: Method, uri: &str, body: Value) -> (StatusCode, Value) {
        let body = if body.is_null() {
            Body::empty()
        } else {
            Body::from(body.to_string())
        };
        let request = Request::builder()
            .method(method)
            .uri(uri)
            .header(header::CONTENT_TYPE, "application/json")
            .body(body)
            .unwrap();
        let response = app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let value = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, value)
    }

    #[test]
    fn test_status_mapping() {
        assert_eq!(status_for("not_found"), StatusCode::NOT_FOUND);
        assert_eq!(status_for("unknown_model_kind"), StatusCode::NOT_FOUND);
        assert_eq!(status_for("configuration_invalid"), StatusCode::BAD_REQUEST);
        assert_eq!(status_for("lock_timeout"), StatusCode::CONFLICT);
        assert_eq!(status_for("corrupt"), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[tokio::test]
    async fn test_run_and_snapshot_routes() {
        let tmp = TempDir::new().unwrap();
        let app = app(&tmp).await;

        let (status, out) = call(
            &app,
            Method::POST,
            "/api/v1/models/cpu/run",
            json!({ "input": 12.5 }),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(out["mean"], 12.5);

        let (status, _) = call(&app, Method::POST, "/api/v1/models/cpu/save", Value::Null).await;
        assert_eq!(status, StatusCode::OK);

        let (status, snapshot) =
            call(&app, Method::GET, "/api/v1/models/cpu/snapshot", Value::Null).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(snapshot["model_kind"], "ewma");

        let (status, meta) =
            call(&app, Method::PUT, "/api/v1/models/copy/snapshot", snapshot).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(meta["entity"], "copy");
    }

    #[tokio::test]
    async fn test_error_routes() {
        let tmp = TempDir::new().unwrap();
        let app = app(&tmp).await;

        let (status, body) =
            call(&app, Method::GET, "/api/v1/models/ghost/snapshot", Value::Null).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["error"], "not_found");

        let (status, _) = call(
            &app,
            Method::POST,
            "/api/v1/models/cpu/run",
            json!({ "model": "lstm", "input": 1 }),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, body) = call(
            &app,
            Method::PUT,
            "/api/v1/models/cpu/save_delay",
            json!({ "save_delay": -3 }),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "invalid_request");
    }

    #[tokio::test]
    async fn test_admin_routes() {
        let tmp = TempDir::new().unwrap();
        let app = app(&tmp).await;

        for name in ["a", "b", "c"] {
            let uri = format!("/api/v1/models/{}/run", name);
            let (status, _) = call(&app, Method::POST, &uri, json!({ "input": 1 })).await;
            assert_eq!(status, StatusCode::OK);
        }

        let (status, _) = call(
            &app,
            Method::PUT,
            "/api/v1/models/b/save_delay",
            json!({ "save_delay": 60 }),
        )
        .await;
        assert_eq!(status, StatusCode::OK);

        let (status, report) =
            call(&app, Method::POST, "/api/v1/models/save?evicted=true", Value::Null).await;
        assert_eq!(status, StatusCode::OK);
        assert!(report["failed"].as_array().unwrap().is_empty());

        let (status, report) = call(&app, Method::POST, "/api/v1/models/save", Value::Null).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(report["flushed"], json!(["b", "c"]));

        let (status, _) = call(&app, Method::POST, "/api/v1/models/a/reset", Value::Null).await;
        assert_eq!(status, StatusCode::OK);
        let (status, _) =
            call(&app, Method::GET, "/api/v1/models/a/snapshot", Value::Null).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, body) = call(&app, Method::GET, "/api/v1/status", Value::Null).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["queue_open"], true);
        assert_eq!(body["cache"]["capacity"], 2);
        assert_eq!(body["default_model"], "ewma");
        assert_eq!(body["retention"], 2);
        assert_eq!(body["cache"]["lost_changes"], 0);
    }
}
