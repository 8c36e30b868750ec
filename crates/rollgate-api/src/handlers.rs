//! REST API handlers.
//!
//! Each handler goes through the `Orchestrator` and returns the
//! `{success, data, error}` envelope.

use axum::Json;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;
use tracing::{info, warn};

use rollgate_core::RolloutPlan;
use rollgate_rollout::{AbortOutcome, RolloutError, replay};
use rollgate_state::{RolloutState, RolloutStatus, Stage};

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

fn error_response(msg: &str, status: StatusCode) -> Response {
    (
        status,
        Json(ApiResponse::<()> {
            success: false,
            data: None,
            error: Some(msg.to_string()),
        }),
    )
        .into_response()
}

fn rollout_error(err: RolloutError) -> Response {
    let status = match &err {
        RolloutError::Plan(_) => StatusCode::UNPROCESSABLE_ENTITY,
        RolloutError::LeaseConflict { .. } | RolloutError::NotActive(_) => StatusCode::CONFLICT,
        RolloutError::NotFound(_) => StatusCode::NOT_FOUND,
        RolloutError::State(_) => StatusCode::INTERNAL_SERVER_ERROR,
        RolloutError::Validation { failed_checks, .. } => {
            return (
                StatusCode::UNPROCESSABLE_ENTITY,
                Json(ApiResponse {
                    success: false,
                    data: Some(serde_json::json!({ "failed_checks": failed_checks })),
                    error: Some(err.to_string()),
                }),
            )
                .into_response();
        }
    };
    error_response(&err.to_string(), status)
}

/// Compact rollout view for listings.
#[derive(Debug, Serialize)]
pub struct RolloutSummary {
    pub id: String,
    pub target: String,
    pub status: RolloutStatus,
    pub stage: Stage,
    pub current_phase: usize,
    pub phases: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    pub manual_intervention: bool,
    pub created_at: u64,
    pub updated_at: u64,
}

impl From<&RolloutState> for RolloutSummary {
    fn from(s: &RolloutState) -> Self {
        Self {
            id: s.id.clone(),
            target: s.target.clone(),
            status: s.status(),
            stage: s.stage(),
            current_phase: s.current_phase(),
            phases: s.plan.phases.len(),
            reason: s.reason().map(str::to_string),
            manual_intervention: s.manual_intervention(),
            created_at: s.created_at(),
            updated_at: s.updated_at(),
        }
    }
}

// ── Rollouts ──────────────────────────────────────────────────────

/// GET /api/v1/rollouts
pub async fn list_rollouts(State(state): State<ApiState>) -> Response {
    match state.orchestrator.list().await {
        Ok(rollouts) => {
            let summaries: Vec<RolloutSummary> = rollouts.iter().map(RolloutSummary::from).collect();
            ApiResponse::ok(summaries).into_response()
        }
        Err(e) => rollout_error(e),
    }
}

/// POST /api/v1/rollouts
pub async fn start_rollout(
    State(state): State<ApiState>,
    Json(plan): Json<RolloutPlan>,
) -> Response {
    let target = plan.target.clone();
    match state.orchestrator.start(plan).await {
        Ok(rollout) => {
            info!(rollout = %rollout.id, %target, "rollout started via API");
            (StatusCode::CREATED, ApiResponse::ok(rollout)).into_response()
        }
        Err(e) => {
            warn!(%target, error = %e, "rollout start rejected");
            rollout_error(e)
        }
    }
}

/// GET /api/v1/rollouts/{id}
pub async fn get_rollout(State(state): State<ApiState>, Path(id): Path<String>) -> Response {
    match state.orchestrator.status(&id).await {
        Ok(rollout) => ApiResponse::ok(rollout).into_response(),
        Err(e) => rollout_error(e),
    }
}

/// POST /api/v1/rollouts/{id}/abort
pub async fn abort_rollout(State(state): State<ApiState>, Path(id): Path<String>) -> Response {
    match state.orchestrator.abort(&id).await {
        Ok(AbortOutcome::Accepted(snapshot)) | Ok(AbortOutcome::AlreadyRequested(snapshot)) => {
            (StatusCode::ACCEPTED, ApiResponse::ok(RolloutSummary::from(&snapshot))).into_response()
        }
        Ok(AbortOutcome::AlreadyTerminal(snapshot)) => (
            StatusCode::CONFLICT,
            Json(ApiResponse {
                success: false,
                data: Some(RolloutSummary::from(&snapshot)),
                error: Some(format!("rollout {id} already {}", snapshot.status())),
            }),
        )
            .into_response(),
        Err(e) => rollout_error(e),
    }
}

/// GET /api/v1/rollouts/{id}/replay
pub async fn replay_rollout(State(state): State<ApiState>, Path(id): Path<String>) -> Response {
    match state.orchestrator.status(&id).await {
        Ok(rollout) => ApiResponse::ok(replay(&rollout)).into_response(),
        Err(e) => rollout_error(e),
    }
}

/// GET /healthz
pub async fn healthz() -> impl IntoResponse {
    ApiResponse::ok("ok")
}
