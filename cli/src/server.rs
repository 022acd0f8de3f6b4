use std::sync::Arc;

use anyhow::Context;
use axum::{
    Json, Router,
    extract::{Path, Query, Request, State},
    http::{HeaderValue, StatusCode, header},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde::{Deserialize, Serialize};
use tower_http::limit::RequestBodyLimitLayer;
use tracing::{error, info, warn};

use foodscan_core::classifier::Detection;
use foodscan_core::error::SyncError;
use foodscan_core::models::{Classification, LookupResult, LookupSource, ScanEntry, StoreStats};
use foodscan_core::service::{CatalogService, ProductLookupProvider};
use foodscan_core::sync::{CancelToken, DatasetSource, SyncPhase};

const BODY_LIMIT: usize = 1024 * 1024; // 1 MB
const DEFAULT_HISTORY_LIMIT: i64 = 50;
const MAX_HISTORY_LIMIT: i64 = 500;

#[derive(Clone)]
struct AppState {
    svc: Arc<CatalogService>,
    off: Option<Arc<dyn ProductLookupProvider>>,
    dataset: Option<Arc<dyn DatasetSource>>,
    api_key: Option<String>,
}

// --- Request / Response types ---

#[derive(Deserialize)]
struct ClassifyRequest {
    ingredients: String,
}

#[derive(Serialize)]
struct ClassifyResponse {
    classification: Classification,
    label: &'static str,
    detection: Detection,
}

#[derive(Deserialize)]
struct HistoryQuery {
    limit: Option<i64>,
}

#[derive(Serialize)]
struct StatsResponse {
    #[serde(flatten)]
    stats: StoreStats,
    sync_phase: SyncPhase,
}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
}

// --- Error handling ---

enum ApiError {
    NotFound(String),
    BadRequest(String),
    Conflict(String),
    Unavailable(String),
    BadGateway(String),
    Internal(anyhow::Error),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            Self::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            Self::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            Self::Conflict(msg) => (StatusCode::CONFLICT, msg),
            Self::Unavailable(msg) => (StatusCode::SERVICE_UNAVAILABLE, msg),
            Self::BadGateway(msg) => (StatusCode::BAD_GATEWAY, msg),
            Self::Internal(err) => {
                error!("Internal server error: {err:#}");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Internal server error".to_string(),
                )
            }
        };
        (status, Json(ErrorResponse { error: message })).into_response()
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(err: anyhow::Error) -> Self {
        Self::Internal(err)
    }
}

impl From<SyncError> for ApiError {
    fn from(err: SyncError) -> Self {
        match err {
            SyncError::AlreadyRunning => Self::Conflict(err.to_string()),
            SyncError::DownloadFailed(_) | SyncError::CorruptDataset { .. } => {
                Self::BadGateway(err.to_string())
            }
            other => Self::Internal(other.into()),
        }
    }
}

// --- Middleware ---

async fn require_auth(State(state): State<AppState>, request: Request, next: Next) -> Response {
    if let Some(ref expected_key) = state.api_key {
        let authorized = request
            .headers()
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "))
            .is_some_and(|token| token == expected_key);

        if !authorized {
            return (
                StatusCode::UNAUTHORIZED,
                Json(ErrorResponse {
                    error: "Invalid or missing API key".to_string(),
                }),
            )
                .into_response();
        }
    }
    next.run(request).await
}

async fn security_headers(request: Request, next: Next) -> Response {
    let mut response = next.run(request).await;
    let headers = response.headers_mut();
    headers.insert(
        "x-content-type-options",
        HeaderValue::from_static("nosniff"),
    );
    headers.insert("x-frame-options", HeaderValue::from_static("DENY"));
    headers.insert(
        "content-security-policy",
        HeaderValue::from_static("default-src 'none'"),
    );
    response
}

// --- Handlers ---

async fn get_product(
    State(state): State<AppState>,
    Path(code): Path<String>,
) -> Result<Json<LookupResult>, ApiError> {
    let code = code.trim().to_string();
    if code.is_empty() || !code.bytes().all(|b| b.is_ascii_digit()) {
        return Err(ApiError::BadRequest(format!(
            "Invalid barcode '{code}': digits only"
        )));
    }

    // Remote fallback blocks on the runtime handle, so run off the async pool.
    let svc = state.svc.clone();
    let off = state.off.clone();
    let result = tokio::task::spawn_blocking(move || svc.lookup(&code, off.as_deref()))
        .await
        .context("lookup task failed")??;

    if result.source == LookupSource::NotFound {
        return Err(ApiError::NotFound(format!(
            "No product found for barcode '{}'",
            result.code
        )));
    }
    Ok(Json(result))
}

async fn classify(
    State(state): State<AppState>,
    Json(req): Json<ClassifyRequest>,
) -> Json<ClassifyResponse> {
    let (classification, detection) = state.svc.classify_text(&req.ingredients);
    Json(ClassifyResponse {
        classification,
        label: classification.label(),
        detection,
    })
}

async fn get_stats(State(state): State<AppState>) -> Result<Json<StatsResponse>, ApiError> {
    let stats = state.svc.stats()?;
    Ok(Json(StatsResponse {
        stats,
        sync_phase: state.svc.sync_phase(),
    }))
}

async fn get_history(
    State(state): State<AppState>,
    Query(query): Query<HistoryQuery>,
) -> Result<Json<Vec<ScanEntry>>, ApiError> {
    let limit = query.limit.unwrap_or(DEFAULT_HISTORY_LIMIT);
    if !(1..=MAX_HISTORY_LIMIT).contains(&limit) {
        return Err(ApiError::BadRequest(format!(
            "limit must be between 1 and {MAX_HISTORY_LIMIT}"
        )));
    }
    Ok(Json(state.svc.recent_scans(limit)?))
}

async fn run_sync(State(state): State<AppState>) -> Result<Response, ApiError> {
    let Some(dataset) = state.dataset.clone() else {
        return Err(ApiError::Unavailable(
            "No dataset URL configured".to_string(),
        ));
    };
    if state.svc.is_syncing() {
        return Err(SyncError::AlreadyRunning.into());
    }

    let svc = state.svc.clone();
    let result = tokio::task::spawn_blocking(move || {
        svc.sync(dataset.as_ref(), &CancelToken::new(), &mut |_| {})
    })
    .await
    .context("sync task failed")?;

    match result {
        Ok(outcome) => Ok(Json(outcome).into_response()),
        // Remote marker unavailable: nothing to update right now.
        Err(SyncError::VersionCheckFailed(reason)) => {
            warn!("version check failed: {reason}");
            Ok(Json(serde_json::json!({ "status": "unavailable", "reason": reason }))
                .into_response())
        }
        Err(e) => Err(e.into()),
    }
}

fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/api/products/{code}", get(get_product))
        .route("/api/classify", post(classify))
        .route("/api/stats", get(get_stats))
        .route("/api/history", get(get_history))
        .route("/api/sync", post(run_sync))
        .route_layer(middleware::from_fn_with_state(state.clone(), require_auth))
        .layer(RequestBodyLimitLayer::new(BODY_LIMIT))
        .layer(middleware::from_fn(security_headers))
        .with_state(state)
}

// --- Server startup ---

/// First and last four bytes of the key. A key that is too short, or whose
/// cut points fall inside a multi-byte character, is not shown at all.
fn key_hint(key: &str) -> String {
    let tail = key.len().checked_sub(4).and_then(|start| key.get(start..));
    match (key.get(..4), tail) {
        (Some(head), Some(tail)) if key.len() >= 8 => format!("{head}...{tail}"),
        _ => "****".to_string(),
    }
}

pub async fn start_server(
    svc: Arc<CatalogService>,
    off: Option<Arc<dyn ProductLookupProvider>>,
    dataset: Option<Arc<dyn DatasetSource>>,
    port: u16,
    bind: &str,
    api_key: Option<String>,
) -> anyhow::Result<()> {
    let state = AppState {
        svc,
        off,
        dataset,
        api_key: api_key.clone(),
    };

    if state.dataset.is_none() {
        warn!("no dataset URL configured; POST /api/sync will return 503");
    }

    let app = build_router(state);

    if let Some(ref key) = api_key {
        eprintln!(
            "API key: {} (see api_key file in data directory)",
            key_hint(key)
        );
    } else {
        eprintln!("Warning: Authentication disabled (--no-auth). API is open to anyone.");
    }

    if bind != "127.0.0.1" && bind != "localhost" && api_key.is_none() {
        eprintln!(
            "Warning: Listening on {bind} with no authentication. Any device on your network can access this API."
        );
    }

    let listener = tokio::net::TcpListener::bind(format!("{bind}:{port}"))
        .await
        .with_context(|| format!("Failed to bind {bind}:{port}"))?;
    info!("listening on http://{bind}:{port}");
    eprintln!("Listening on http://{bind}:{port}");
    axum::serve(listener, app).await?;

    Ok(())
}
