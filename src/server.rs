//! HTTP surface
//!
//! | Route            | Auth   | Description                                  |
//! |------------------|--------|----------------------------------------------|
//! | `POST /captures` | bearer | Capture a page, respond with the image bytes |
//! | `GET /captures`  | bearer | Paginated capture history, newest first      |
//! | `GET /profile`   | bearer | Identity and capture count                   |
//! | `GET /health`    | none   | Liveness plus governor and engine stats      |
//! | `GET /metrics`   | none   | Prometheus exposition, when enabled          |

use crate::{
    bearer_token, AuthError, CaptureError, CaptureParams, CapturePipeline, CaptureRecord, ErrorKind,
    GovernorStats, Identity, IdentityVerifier, LedgerError, ServerConfig,
};
use axum::extract::rejection::{JsonRejection, QueryRejection};
use axum::extract::{FromRequestParts, Query, State};
use axum::http::request::Parts;
use axum::http::{header, HeaderName, HeaderValue, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use metrics_exporter_prometheus::PrometheusHandle;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info};

pub const CAPTURE_ID_HEADER: HeaderName = HeaderName::from_static("x-capture-id");
pub const CAPTURE_COUNT_HEADER: HeaderName = HeaderName::from_static("x-capture-count");

/// Shared state handed to every handler
#[derive(Clone)]
pub struct AppState {
    pipeline: Arc<CapturePipeline>,
    verifier: Arc<dyn IdentityVerifier>,
    prometheus: Option<PrometheusHandle>,
}

impl AppState {
    pub fn new(pipeline: Arc<CapturePipeline>, verifier: Arc<dyn IdentityVerifier>) -> Self {
        Self {
            pipeline,
            verifier,
            prometheus: None,
        }
    }

    pub fn with_prometheus(mut self, handle: PrometheusHandle) -> Self {
        self.prometheus = Some(handle);
        self
    }

    pub fn pipeline(&self) -> &Arc<CapturePipeline> {
        &self.pipeline
    }
}

/// Errors returned by HTTP handlers
#[derive(Debug, thiserror::Error)]
pub enum WebError {
    #[error(transparent)]
    Capture(CaptureError),

    #[error(transparent)]
    Auth(#[from] AuthError),

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<CaptureError> for WebError {
    fn from(err: CaptureError) -> Self {
        WebError::Capture(err)
    }
}

impl From<LedgerError> for WebError {
    fn from(err: LedgerError) -> Self {
        WebError::Internal(err.to_string())
    }
}

#[derive(Serialize)]
struct ErrorResponse {
    error: &'static str,
    kind: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    details: Option<String>,
}

impl IntoResponse for WebError {
    fn into_response(self) -> Response {
        let mut retry_after = None;

        let (status, error, kind, details) = match &self {
            WebError::Capture(err) => {
                let kind = err.kind();
                let status = match kind {
                    ErrorKind::InvalidRequest | ErrorKind::InvalidTarget => StatusCode::BAD_REQUEST,
                    ErrorKind::CapacityExceeded => StatusCode::TOO_MANY_REQUESTS,
                    _ => StatusCode::INTERNAL_SERVER_ERROR,
                };
                let details = match err {
                    CaptureError::InvalidRequest(msg) => Some(msg.clone()),
                    _ => None,
                };
                if let CaptureError::CapacityExceeded(_) = err {
                    retry_after = Some(RETRY_AFTER);
                }
                (status, kind.public_message(), kind.as_str(), details)
            }
            WebError::Auth(AuthError::InvalidToken(reason)) => {
                debug!("Rejected bearer token: {}", reason);
                (StatusCode::FORBIDDEN, "Invalid or expired token", "forbidden", None)
            }
            WebError::Auth(err) => {
                debug!("Missing credentials: {}", err);
                (StatusCode::UNAUTHORIZED, "Access token required", "unauthorized", None)
            }
            WebError::BadRequest(msg) => (
                StatusCode::BAD_REQUEST,
                ErrorKind::InvalidRequest.public_message(),
                ErrorKind::InvalidRequest.as_str(),
                Some(msg.clone()),
            ),
            WebError::Internal(msg) => {
                error!("Internal server error: {}", msg);
                (StatusCode::INTERNAL_SERVER_ERROR, "Internal server error", "internal", None)
            }
        };

        let mut response = (status, Json(ErrorResponse { error, kind, details })).into_response();
        if let Some(delay) = retry_after {
            response
                .headers_mut()
                .insert(header::RETRY_AFTER, HeaderValue::from(delay.as_secs()));
        }
        response
    }
}

/// Suggested client back-off after a capacity rejection
const RETRY_AFTER: Duration = Duration::from_secs(5);

/// A request whose bearer token has been verified
pub struct Authenticated(pub Identity);

impl FromRequestParts<AppState> for Authenticated {
    type Rejection = WebError;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, Self::Rejection> {
        let header = parts
            .headers
            .get(header::AUTHORIZATION)
            .ok_or(AuthError::MissingCredentials)?
            .to_str()
            .map_err(|_| AuthError::MalformedHeader)?;

        let token = bearer_token(header)?;
        let identity = state.verifier.verify(token)?;
        Ok(Authenticated(identity))
    }
}

async fn create_capture(
    State(state): State<AppState>,
    Authenticated(identity): Authenticated,
    payload: Result<Json<CaptureParams>, JsonRejection>,
) -> Result<Response, WebError> {
    let Json(params) = payload.map_err(|rejection| WebError::BadRequest(rejection.body_text()))?;

    let outcome = state.pipeline.capture(&params, &identity).await?;

    let id = HeaderValue::from_str(&outcome.record.id.to_string()).map_err(|e| WebError::Internal(e.to_string()))?;
    let mut response = (StatusCode::CREATED, outcome.image).into_response();
    let headers = response.headers_mut();
    headers.insert(header::CONTENT_TYPE, HeaderValue::from_static(outcome.record.format.mime_type()));
    headers.insert(CAPTURE_ID_HEADER, id);
    headers.insert(CAPTURE_COUNT_HEADER, HeaderValue::from(outcome.capture_count));
    Ok(response)
}

#[derive(Debug, Default, Deserialize)]
pub struct HistoryParams {
    pub limit: Option<usize>,
    pub offset: Option<usize>,
}

#[derive(Debug, Serialize)]
pub struct HistoryResponse {
    pub captures: Vec<CaptureRecord>,
    pub total: u64,
    pub limit: usize,
    pub offset: usize,
}

async fn list_captures(
    State(state): State<AppState>,
    Authenticated(identity): Authenticated,
    query: Result<Query<HistoryParams>, QueryRejection>,
) -> Result<Json<HistoryResponse>, WebError> {
    let Query(params) = query.map_err(|rejection| WebError::BadRequest(rejection.body_text()))?;

    let limits = &state.pipeline.config().limits;
    let limit = params.limit.unwrap_or(limits.default_page_size).min(limits.max_page_size);
    let offset = params.offset.unwrap_or(0);

    let page = state.pipeline.ledger().history(&identity.id, limit, offset).await?;

    Ok(Json(HistoryResponse {
        captures: page.records,
        total: page.total,
        limit,
        offset,
    }))
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProfileResponse {
    pub id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    pub capture_count: u64,
}

async fn profile(
    State(state): State<AppState>,
    Authenticated(identity): Authenticated,
) -> Result<Json<ProfileResponse>, WebError> {
    let capture_count = state.pipeline.ledger().count_for(&identity.id).await?;
    Ok(Json(ProfileResponse {
        id: identity.id,
        username: identity.username,
        capture_count,
    }))
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
    pub timestamp: DateTime<Utc>,
    pub governor: GovernorStats,
    pub live_engines: u64,
}

async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "OK",
        version: env!("CARGO_PKG_VERSION"),
        timestamp: Utc::now(),
        governor: state.pipeline.governor().stats(),
        live_engines: state.pipeline.tracker().live(),
    })
}

async fn metrics(State(state): State<AppState>) -> Response {
    match &state.prometheus {
        Some(handle) => (
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            handle.render(),
        )
            .into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

/// Build the Axum router with all routes.
pub fn build_router(state: AppState, cors_permissive: bool) -> Router {
    let cors = if cors_permissive {
        CorsLayer::new()
            .allow_origin(Any)
            .allow_methods([Method::GET, Method::POST])
            .allow_headers([header::CONTENT_TYPE, header::AUTHORIZATION])
            .expose_headers([CAPTURE_ID_HEADER, CAPTURE_COUNT_HEADER])
    } else {
        CorsLayer::new()
            .allow_methods([Method::GET, Method::POST])
            .allow_headers([header::CONTENT_TYPE, header::AUTHORIZATION])
    };

    Router::new()
        .route("/captures", post(create_capture).get(list_captures))
        .route("/profile", get(profile))
        .route("/health", get(health))
        .route("/metrics", get(metrics))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Run the web server until `shutdown` resolves.
pub async fn run_server(
    state: AppState,
    config: &ServerConfig,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> anyhow::Result<()> {
    let addr: SocketAddr = format!("{}:{}", config.host, config.port).parse()?;
    let app = build_router(state, config.cors_permissive);

    info!("Starting capture service at http://{}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).with_graceful_shutdown(shutdown).await?;

    info!("Capture service stopped");
    Ok(())
}
