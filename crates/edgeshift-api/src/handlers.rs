//! REST API handlers.
//!
//! Each handler calls into the rollout controller and returns JSON in the
//! `{success, data, error}` envelope.

use axum::Json;
use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::{StatusCode, header};
use axum::response::IntoResponse;
use serde::{Deserialize, Serialize};
use tracing::info;

use edgeshift_rollout::{RolloutError, RolloutHandle, RolloutPhase};
use edgeshift_state::{RegistryError, RolloutKind, RolloutRecord};
use edgeshift_telemetry::render_prometheus;

use crate::ApiState;

/// Response wrapper for consistent API format.
#[derive(Serialize)]
struct ApiResponse<T: Serialize> {
    success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl<T: Serialize> ApiResponse<T> {
    fn ok(data: T) -> Json<Self> {
        Json(Self {
            success: true,
            data: Some(data),
            error: None,
        })
    }
}

fn error_response(msg: &str, status: StatusCode) -> impl IntoResponse {
    (
        status,
        Json(ApiResponse::<()> {
            success: false,
            data: None,
            error: Some(msg.to_string()),
        }),
    )
}

/// Conflicts → 409, lookups → 404, precondition failures → 422, the rest → 500.
fn status_for(err: &RolloutError) -> StatusCode {
    match err {
        RolloutError::RolloutInProgress { .. }
        | RolloutError::CannotCancel { .. }
        | RolloutError::NotInProgress(_) => StatusCode::CONFLICT,
        RolloutError::NoRollbackTarget { .. } => StatusCode::NOT_FOUND,
        RolloutError::Registry(e) => match e {
            RegistryError::DuplicateVersion { .. } => StatusCode::CONFLICT,
            RegistryError::UnknownInstance(_) => StatusCode::NOT_FOUND,
            RegistryError::NoHealthyCandidate { .. }
            | RegistryError::InvalidRole { .. }
            | RegistryError::DrainPending(_) => StatusCode::UNPROCESSABLE_ENTITY,
        },
        RolloutError::State(_) | RolloutError::Interrupted(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn rollout_error(err: &RolloutError) -> axum::response::Response {
    error_response(&err.to_string(), status_for(err)).into_response()
}

/// Body of a deploy request.
#[derive(Debug, Deserialize)]
pub struct DeployRequest {
    pub version: String,
}

/// Optional body of a rollback request.
#[derive(Debug, Default, Deserialize)]
pub struct RollbackRequest {
    #[serde(default)]
    pub version: Option<String>,
}

/// Returned when a deploy or rollback has been accepted.
#[derive(Debug, Serialize)]
pub struct RolloutAccepted {
    pub hostname: String,
    pub version: String,
    pub kind: RolloutKind,
    pub instance_id: String,
}

impl From<&RolloutHandle> for RolloutAccepted {
    fn from(h: &RolloutHandle) -> Self {
        Self {
            hostname: h.hostname.clone(),
            version: h.version.clone(),
            kind: h.kind,
            instance_id: h.instance_id.clone(),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct AbortResult {
    pub hostname: String,
    /// The `aborted` record, or none when a failure was acknowledged.
    pub record: Option<RolloutRecord>,
}

// ── Hosts ──────────────────────────────────────────────────────

/// GET /api/v1/hosts
pub async fn list_hosts(State(state): State<ApiState>) -> impl IntoResponse {
    match state.controller.statuses() {
        Ok(statuses) => ApiResponse::ok(statuses).into_response(),
        Err(e) => rollout_error(&e),
    }
}

/// GET /api/v1/hosts/:hostname
pub async fn get_host(
    State(state): State<ApiState>,
    Path(hostname): Path<String>,
) -> impl IntoResponse {
    match state.controller.status(&hostname) {
        Ok(status)
            if status.phase == RolloutPhase::Idle
                && status.instances.is_empty()
                && status.history.is_empty() =>
        {
            error_response("hostname not found", StatusCode::NOT_FOUND).into_response()
        }
        Ok(status) => ApiResponse::ok(status).into_response(),
        Err(e) => rollout_error(&e),
    }
}

/// POST /api/v1/hosts/:hostname/deploy
pub async fn deploy(
    State(state): State<ApiState>,
    Path(hostname): Path<String>,
    Json(req): Json<DeployRequest>,
) -> impl IntoResponse {
    if req.version.trim().is_empty() {
        return error_response("version must not be empty", StatusCode::BAD_REQUEST).into_response();
    }
    match state.controller.deploy(&hostname, &req.version) {
        Ok(handle) => {
            info!(%hostname, version = %req.version, "deploy accepted");
            (StatusCode::ACCEPTED, ApiResponse::ok(RolloutAccepted::from(&handle))).into_response()
        }
        Err(e) => rollout_error(&e),
    }
}

/// POST /api/v1/hosts/:hostname/rollback
///
/// The body is optional; without a version the previous successful
/// version is used.
pub async fn rollback(
    State(state): State<ApiState>,
    Path(hostname): Path<String>,
    body: Bytes,
) -> impl IntoResponse {
    let req = if body.is_empty() {
        RollbackRequest::default()
    } else {
        match serde_json::from_slice::<RollbackRequest>(&body) {
            Ok(req) => req,
            Err(e) => {
                return error_response(&format!("invalid request body: {e}"), StatusCode::BAD_REQUEST)
                    .into_response();
            }
        }
    };

    let result = match &req.version {
        Some(version) => state.controller.rollback_to(&hostname, version).await,
        None => state.controller.rollback(&hostname).await,
    };
    match result {
        Ok(handle) => {
            info!(%hostname, version = %handle.version, "rollback accepted");
            (StatusCode::ACCEPTED, ApiResponse::ok(RolloutAccepted::from(&handle))).into_response()
        }
        Err(e) => rollout_error(&e),
    }
}

/// POST /api/v1/hosts/:hostname/abort
pub async fn abort(
    State(state): State<ApiState>,
    Path(hostname): Path<String>,
) -> impl IntoResponse {
    match state.controller.abort(&hostname).await {
        Ok(record) => ApiResponse::ok(AbortResult { hostname, record }).into_response(),
        Err(e) => rollout_error(&e),
    }
}

// ── Routing & metrics ──────────────────────────────────────────

/// GET /api/v1/routes
pub async fn get_routes(State(state): State<ApiState>) -> impl IntoResponse {
    ApiResponse::ok(state.publisher.published().await).into_response()
}

/// GET /metrics: Prometheus text exposition.
pub async fn prometheus_metrics(State(state): State<ApiState>) -> impl IntoResponse {
    let body = render_prometheus(&state.registry.list());
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        body,
    )
        .into_response()
}
