//! Control API - status and programmatic entry points
//!
//! Provides:
//! - Health and status (device, supervisor generation, vote decision, sets)
//! - Operating configuration replacement
//! - Manual proposal creation and voting
//! - Restart requests (DAO membership changes)

pub mod routes;

use axum::{
    routing::{get, post, put},
    Router,
};
use std::sync::Arc;

use crate::agent::Agent;

pub type SharedAgent = Arc<Agent>;

/// Create the control API router
pub fn create_router(agent: SharedAgent) -> Router {
    Router::new()
        .route("/api/status", get(routes::api_status))
        .route("/api/config", put(routes::api_update_config))
        .route("/api/proposals", post(routes::api_create_proposal))
        .route("/api/votes", post(routes::api_vote))
        .route("/api/restart", post(routes::api_restart))
        // Health check
        .route("/health", get(routes::health))
        .with_state(agent)
}
