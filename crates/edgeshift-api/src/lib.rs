//! edgeshift-api: operator-facing REST API.
//!
//! Thin axum layer over the [`RolloutController`]: commands are forwarded
//! as-is and their errors mapped onto HTTP status codes.
//!
//! # API Routes
//!
//! | Method | Path | Description |
//! |---|---|---|
//! | GET | `/api/v1/hosts` | Status of every hostname |
//! | GET | `/api/v1/hosts/{hostname}` | Phase, instances and recent history |
//! | POST | `/api/v1/hosts/{hostname}/deploy` | Start a deploy (`{"version": "v2"}`) |
//! | POST | `/api/v1/hosts/{hostname}/rollback` | Roll back (optional `{"version": "v1"}`) |
//! | POST | `/api/v1/hosts/{hostname}/abort` | Cancel a deploy or acknowledge a failure |
//! | GET | `/api/v1/routes` | Last published routing table |
//! | GET | `/metrics` | Prometheus exposition |

pub mod handlers;

use std::sync::Arc;

use axum::Router;
use axum::routing::{get, post};

use edgeshift_proxy::RoutingTablePublisher;
use edgeshift_rollout::RolloutController;
use edgeshift_state::InstanceRegistry;

/// Shared state for API handlers.
#[derive(Clone)]
pub struct ApiState {
    pub controller: RolloutController,
    pub registry: InstanceRegistry,
    pub publisher: Arc<RoutingTablePublisher>,
}

/// Build the complete API router (REST + metrics).
pub fn build_router(state: ApiState) -> Router {
    let api_routes = Router::new()
        .route("/hosts", get(handlers::list_hosts))
        .route("/hosts/{hostname}", get(handlers::get_host))
        .route("/hosts/{hostname}/deploy", post(handlers::deploy))
        .route("/hosts/{hostname}/rollback", post(handlers::rollback))
        .route("/hosts/{hostname}/abort", post(handlers::abort))
        .route("/routes", get(handlers::get_routes))
        .with_state(state.clone());

    Router::new()
        .nest("/api/v1", api_routes)
        .route("/metrics", get(handlers::prometheus_metrics).with_state(state))
}
