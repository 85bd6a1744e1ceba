//! HTTP surface for GUI collaborators.
//!
//! A thin JSON layer over [`Collector`]. Submissions made over HTTP share the
//! same scheduler, cache and dedup registry as in-process callers.
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `GET`  | `/health` | Health check (version, adapters, queue depth) |
//! | `POST` | `/collect` | Submit and wait: `{input, kind?, priority?, wait_secs?}` |
//! | `GET`  | `/cached?input=..&kind=..` | Fresh cached record or 404 |
//! | `DELETE` | `/cached?input=..&kind=..` | Invalidate the cached record |
//! | `GET`  | `/queue` | Pending jobs in dequeue order |
//!
//! # Error Contract
//!
//! ```json
//! { "error": { "code": "bad_request", "message": "invalid input '': input must not be empty" } }
//! ```
//!
//! Error codes: `bad_request` (400), `not_found` (404), `timeout` (408),
//! `unavailable` (503), `internal` (500).

use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    routing::post,
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tower_http::cors::{Any, CorsLayer};
use tracing::info;

use crate::collector::Collector;
use crate::error::CollectError;
use crate::job::{JobId, JobSnapshot};
use crate::models::{CollectionRecord, KeyKind, Priority};
use crate::normalize::normalize;

const DEFAULT_WAIT_SECS: u64 = 120;

#[derive(Clone)]
struct AppState {
    collector: Arc<Collector>,
}

/// Builds the router. Exposed so tests and embedding binaries can serve it
/// on their own listener.
pub fn router(collector: Arc<Collector>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(handle_health))
        .route("/collect", post(handle_collect))
        .route(
            "/cached",
            get(handle_get_cached).delete(handle_invalidate),
        )
        .route("/queue", get(handle_queue))
        .layer(cors)
        .with_state(AppState { collector })
}

/// Serves until the process is terminated.
pub async fn serve(collector: Arc<Collector>, bind_addr: &str) -> anyhow::Result<()> {
    let app = router(collector);
    let listener = tokio::net::TcpListener::bind(bind_addr).await?;
    info!(bind = bind_addr, "http server listening");
    println!("parcel server listening on http://{}", bind_addr);
    axum::serve(listener, app).await?;
    Ok(())
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
    code: &'static str,
    message: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: ErrorDetail {
                code: self.code.to_string(),
                message: self.message,
            },
        };
        (self.status, Json(body)).into_response()
    }
}

fn bad_request(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::BAD_REQUEST,
        code: "bad_request",
        message: message.into(),
    }
}

fn not_found(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::NOT_FOUND,
        code: "not_found",
        message: message.into(),
    }
}

impl From<CollectError> for AppError {
    fn from(err: CollectError) -> Self {
        let (status, code) = match &err {
            CollectError::InvalidFormat { .. } => (StatusCode::BAD_REQUEST, "bad_request"),
            CollectError::WaitTimeout => (StatusCode::REQUEST_TIMEOUT, "timeout"),
            CollectError::Cancelled | CollectError::ShutDown => {
                (StatusCode::SERVICE_UNAVAILABLE, "unavailable")
            }
            CollectError::JobFailed(_) => (StatusCode::INTERNAL_SERVER_ERROR, "internal"),
        };
        AppError {
            status,
            code,
            message: err.to_string(),
        }
    }
}

fn parse_kind(kind: Option<&str>) -> Result<Option<KeyKind>, AppError> {
    kind.map(|k| k.parse::<KeyKind>().map_err(bad_request))
        .transpose()
}

// ============ GET /health ============

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
    adapters: Vec<String>,
    queued: usize,
}

async fn handle_health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        adapters: state.collector.adapter_names(),
        queued: state.collector.queue_snapshot().len(),
    })
}

// ============ POST /collect ============

#[derive(Deserialize)]
struct CollectRequest {
    input: String,
    kind: Option<String>,
    priority: Option<String>,
    wait_secs: Option<u64>,
}

#[derive(Serialize)]
struct CollectResponse {
    job_id: Option<JobId>,
    cached: bool,
    record: Arc<CollectionRecord>,
}

async fn handle_collect(
    State(state): State<AppState>,
    Json(req): Json<CollectRequest>,
) -> Result<Json<CollectResponse>, AppError> {
    let hint = parse_kind(req.kind.as_deref())?;
    let priority = req
        .priority
        .as_deref()
        .map(|p| p.parse::<Priority>().map_err(bad_request))
        .transpose()?
        .unwrap_or_default();

    let handle = state
        .collector
        .submit_collection(&req.input, hint, priority)?;
    let wait = Duration::from_secs(req.wait_secs.unwrap_or(DEFAULT_WAIT_SECS));
    let record = handle.wait(wait).await?;

    Ok(Json(CollectResponse {
        job_id: handle.job_id(),
        cached: handle.is_cached(),
        record,
    }))
}

// ============ /cached ============

#[derive(Deserialize)]
struct CachedQuery {
    input: String,
    kind: Option<String>,
}

async fn handle_get_cached(
    State(state): State<AppState>,
    Query(query): Query<CachedQuery>,
) -> Result<Json<Arc<CollectionRecord>>, AppError> {
    let key = normalize(&query.input, parse_kind(query.kind.as_deref())?)?;
    state
        .collector
        .get_cached_if_fresh(&key)
        .map(Json)
        .ok_or_else(|| not_found(format!("no fresh record for {}", key)))
}

#[derive(Serialize)]
struct InvalidateResponse {
    key: String,
    removed: bool,
}

async fn handle_invalidate(
    State(state): State<AppState>,
    Query(query): Query<CachedQuery>,
) -> Result<Json<InvalidateResponse>, AppError> {
    let key = normalize(&query.input, parse_kind(query.kind.as_deref())?)?;
    let removed = state.collector.invalidate(&key);
    Ok(Json(InvalidateResponse {
        key: key.to_string(),
        removed,
    }))
}

// ============ GET /queue ============

async fn handle_queue(State(state): State<AppState>) -> Json<Vec<JobSnapshot>> {
    Json(state.collector.queue_snapshot())
}
