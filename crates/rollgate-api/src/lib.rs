//! rollgate-api: REST API for the rollout orchestrator.
//!
//! # API Routes
//!
//! | Method | Path | Description |
//! |---|---|---|
//! | GET | `/api/v1/rollouts` | List all rollouts |
//! | POST | `/api/v1/rollouts` | Start a rollout from a JSON plan |
//! | GET | `/api/v1/rollouts/{id}` | Rollout snapshot |
//! | POST | `/api/v1/rollouts/{id}/abort` | Request an abort |
//! | GET | `/api/v1/rollouts/{id}/replay` | Re-evaluate recorded decisions |
//! | GET | `/healthz` | Liveness |

pub mod handlers;

use axum::Router;
use axum::routing::{get, post};
use rollgate_rollout::Orchestrator;

/// Shared state for API handlers.
#[derive(Clone)]
pub struct ApiState {
    pub orchestrator: Orchestrator,
}

/// Build the complete API router.
pub fn build_router(orchestrator: Orchestrator) -> Router {
    let api_state = ApiState { orchestrator };

    let api_routes = Router::new()
        .route("/rollouts", get(handlers::list_rollouts).post(handlers::start_rollout))
        .route("/rollouts/{id}", get(handlers::get_rollout))
        .route("/rollouts/{id}/abort", post(handlers::abort_rollout))
        .route("/rollouts/{id}/replay", get(handlers::replay_rollout))
        .with_state(api_state);

    Router::new()
        .nest("/api/v1", api_routes)
        .route("/healthz", get(handlers::healthz))
}
