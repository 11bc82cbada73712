//! HTTP API for the workflow engine and canonical store.
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `POST` | `/workflow/jobs` | Create a workflow job |
//! | `GET`  | `/workflow/jobs/{job_id}/status` | Job status (missing → synthesized failed job) |
//! | `POST` | `/workflow/jobs/{job_id}/steps/{step_name}/execute` | Execute one step |
//! | `GET`  | `/workflow/jobs/{job_id}/results` | Page over one step's results |
//! | `POST` | `/canonical/artifacts/ingest` | Record an ingested artifact |
//! | `POST` | `/canonical/artifacts/{id}/lineage` | Append a lineage event |
//! | `GET`  | `/canonical/artifacts/{id}/lineage` | List lineage, oldest first |
//! | `GET`  | `/health` | Health check (returns version) |
//!
//! # Error Contract
//!
//! ```json
//! { "error": { "code": "bad_request", "message": "unknown step: 'x'" } }
//! ```
//!
//! Error codes: `bad_request` (400), `not_found` (404), `immutable` (403),
//! `internal` (500). An unknown `job_id` is deliberately NOT a 404 — status
//! and results return a synthesized failed job instead (see `models`).
//!
//! # CORS
//!
//! All origins, methods, and headers are permitted to support browser
//! review tooling.

use axum::{
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};

use crate::canonical::{self, NewArtifact};
use crate::config::Config;
use crate::steps::{ExecutorRegistry, FolderOrganizer, LocalFileIndexer, StepContext};
use crate::webhook::WebhookDelivery;
use crate::workflow::{CreateJobRequest, ExecuteStepRequest, WorkflowService};

/// Shared application state passed to all route handlers.
#[derive(Clone)]
struct AppState {
    service: Arc<WorkflowService>,
}

/// Starts the HTTP server with the built-in collaborators.
///
/// Binds to `[server].bind` and runs until the process is terminated.
pub async fn run_server(config: &Config) -> anyhow::Result<()> {
    let pool = crate::db::connect(config).await?;
    crate::migrate::apply_schema(&pool).await?;

    let indexer_cfg = config.indexer.clone().unwrap_or_else(|| {
        crate::config::IndexerConfig {
            root: std::path::PathBuf::from("."),
            include_globs: vec!["**/*".to_string()],
            exclude_globs: Vec::new(),
            follow_symlinks: false,
        }
    });
    let indexer = Arc::new(LocalFileIndexer::new(indexer_cfg));
    let organizer = Arc::new(FolderOrganizer::new(indexer.clone()));
    let ctx = StepContext {
        indexer,
        organizer,
    };

    let webhooks = Arc::new(WebhookDelivery::new(config.webhook.clone())?);
    let service = Arc::new(WorkflowService::new(
        pool,
        webhooks,
        ExecutorRegistry::with_builtins(),
        ctx,
        config.workflow.clone(),
    ));

    run_server_with_service(&config.server.bind, service).await
}

/// Starts the HTTP server around an already-assembled [`WorkflowService`].
/// Used by tests and by embedders wiring custom collaborators.
pub async fn run_server_with_service(
    bind_addr: &str,
    service: Arc<WorkflowService>,
) -> anyhow::Result<()> {
    let app = router(service);

    println!("caseflow listening on http://{}", bind_addr);

    let listener = tokio::net::TcpListener::bind(bind_addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

fn router(service: Arc<WorkflowService>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/workflow/jobs", post(handle_create_job))
        .route("/workflow/jobs/{job_id}/status", get(handle_job_status))
        .route(
            "/workflow/jobs/{job_id}/steps/{step_name}/execute",
            post(handle_execute_step),
        )
        .route("/workflow/jobs/{job_id}/results", get(handle_job_results))
        .route("/canonical/artifacts/ingest", post(handle_ingest_artifact))
        .route(
            "/canonical/artifacts/{id}/lineage",
            post(handle_append_lineage).get(handle_list_lineage),
        )
        .route("/health", get(handle_health))
        .layer(cors)
        .with_state(AppState { service })
}

// ============ Error response ============

#[derive(Serialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Serialize)]
struct ErrorDetail {
    code: String,
    message: String,
}

struct AppError {
    status: StatusCode,
    code: String,
    message: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: ErrorDetail {
                code: self.code,
                message: self.message,
            },
        };
        (self.status, Json(body)).into_response()
    }
}

fn bad_request(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::BAD_REQUEST,
        code: "bad_request".to_string(),
        message: message.into(),
    }
}

fn immutable_error(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::FORBIDDEN,
        code: "immutable".to_string(),
        message: message.into(),
    }
}

fn not_found(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::NOT_FOUND,
        code: "not_found".to_string(),
        message: message.into(),
    }
}

fn internal_error(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::INTERNAL_SERVER_ERROR,
        code: "internal".to_string(),
        message: message.into(),
    }
}

/// Map service errors to HTTP statuses by message inspection, so the
/// library layer stays on plain `anyhow` errors.
fn classify_error(err: anyhow::Error) -> AppError {
    let msg = err.to_string();

    if msg.contains("immutable") {
        immutable_error(msg)
    } else if msg.contains("unknown step")
        || msg.contains("invalid")
        || msg.contains("must not be empty")
        || msg.contains("strict sequencing")
    {
        bad_request(msg)
    } else if msg.contains("FOREIGN KEY") || msg.contains("no such artifact") {
        not_found(msg)
    } else {
        internal_error(msg)
    }
}

// ============ GET /health ============

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
}

async fn handle_health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

// ============ Workflow routes ============

async fn handle_create_job(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(mut req): Json<CreateJobRequest>,
) -> Result<Json<serde_json::Value>, AppError> {
    // Header is honored as a fallback when the body carries no key.
    if req.idempotency_key.is_none() {
        req.idempotency_key = headers
            .get("Idempotency-Key")
            .and_then(|v| v.to_str().ok())
            .map(String::from);
    }

    let response = state
        .service
        .create_job(req)
        .await
        .map_err(classify_error)?;
    Ok(Json(response))
}

async fn handle_job_status(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
) -> Result<Json<serde_json::Value>, AppError> {
    let job = state
        .service
        .get_status(&job_id)
        .await
        .map_err(classify_error)?;
    Ok(Json(serde_json::json!({ "success": true, "job": job })))
}

async fn handle_execute_step(
    State(state): State<AppState>,
    Path((job_id, step_name)): Path<(String, String)>,
    Json(req): Json<ExecuteStepRequest>,
) -> Result<Json<serde_json::Value>, AppError> {
    let response = state
        .service
        .execute_step(&job_id, &step_name, req)
        .await
        .map_err(classify_error)?;
    Ok(Json(response))
}

#[derive(Deserialize)]
struct ResultsQuery {
    step: String,
    #[serde(default = "default_limit")]
    limit: i64,
    #[serde(default)]
    offset: i64,
}

fn default_limit() -> i64 {
    50
}

async fn handle_job_results(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
    Query(query): Query<ResultsQuery>,
) -> Result<Json<serde_json::Value>, AppError> {
    let response = state
        .service
        .get_results(&job_id, &query.step, query.limit, query.offset)
        .await
        .map_err(classify_error)?;
    Ok(Json(response))
}

// ============ Canonical routes ============

#[derive(Deserialize)]
struct IngestRequest {
    artifact_id: String,
    sha256: String,
    source_uri: Option<String>,
    mime_type: Option<String>,
    metadata: Option<serde_json::Value>,
    blob_locator: Option<String>,
    content_size_bytes: Option<i64>,
}

async fn handle_ingest_artifact(
    State(state): State<AppState>,
    Json(req): Json<IngestRequest>,
) -> Result<Json<serde_json::Value>, AppError> {
    if req.artifact_id.trim().is_empty() {
        return Err(bad_request("artifact_id must not be empty"));
    }
    if req.sha256.len() != 64 || !req.sha256.chars().all(|c| c.is_ascii_hexdigit()) {
        return Err(bad_request("sha256 must be a 64-char hex digest"));
    }

    let artifact = NewArtifact {
        artifact_id: req.artifact_id,
        sha256: req.sha256,
        source_uri: req.source_uri,
        mime_type: req.mime_type,
        metadata: req.metadata,
        blob_locator: req.blob_locator,
        content_size_bytes: req.content_size_bytes,
    };

    let row_id = canonical::ingest_artifact(state.service.pool(), &artifact)
        .await
        .map_err(classify_error)?;
    Ok(Json(
        serde_json::json!({ "success": true, "artifact_row_id": row_id }),
    ))
}

#[derive(Deserialize)]
struct LineageRequest {
    event_type: String,
    event_data: Option<serde_json::Value>,
}

async fn handle_append_lineage(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Json(req): Json<LineageRequest>,
) -> Result<Json<serde_json::Value>, AppError> {
    if req.event_type.trim().is_empty() {
        return Err(bad_request("event_type must not be empty"));
    }

    let event_id =
        canonical::append_lineage_event(state.service.pool(), id, &req.event_type, req.event_data)
            .await
            .map_err(classify_error)?;
    Ok(Json(
        serde_json::json!({ "success": true, "event_id": event_id }),
    ))
}

async fn handle_list_lineage(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<Json<serde_json::Value>, AppError> {
    let events = canonical::list_lineage(state.service.pool(), id)
        .await
        .map_err(classify_error)?;
    Ok(Json(
        serde_json::json!({ "success": true, "events": events }),
    ))
}
