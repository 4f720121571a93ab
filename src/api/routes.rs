//! Control API handlers

use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Json},
};
use serde::{Deserialize, Serialize};
use tracing::info;

use super::SharedAgent;
use crate::agent::proposer::{ProposalOutcome, VoteOutcome};
use crate::agent::{AgentError, AgentStatus};
use crate::config::AgentConfig;
use crate::ledger::{ActionValue, LedgerError, ProposalId, Stance};

type ApiResult<T> = Result<Json<T>, (StatusCode, String)>;

/// Health check endpoint
pub async fn health() -> impl IntoResponse {
    "OK"
}

/// GET /api/status
pub async fn api_status(State(agent): State<SharedAgent>) -> Json<AgentStatus> {
    Json(agent.status().await)
}

#[derive(Debug, Serialize)]
pub struct UpdateConfigResponse {
    pub updated: bool,
    pub rules: usize,
}

/// PUT /api/config
///
/// Accepts the operating configuration as JSON in its file schema. An
/// invalid configuration is rejected and the running one is kept.
pub async fn api_update_config(
    State(agent): State<SharedAgent>,
    Json(body): Json<serde_json::Value>,
) -> ApiResult<UpdateConfigResponse> {
    let config = AgentConfig::from_json_value(body)
        .map_err(|e| (StatusCode::BAD_REQUEST, e.to_string()))?;
    let rules = config.rules.len();
    let updated = agent
        .update_config(config)
        .await
        .map_err(error_response)?;

    Ok(Json(UpdateConfigResponse { updated, rules }))
}

#[derive(Debug, Deserialize)]
pub struct CreateProposalRequest {
    pub action_value: ActionValue,
    pub message: String,
}

/// POST /api/proposals
pub async fn api_create_proposal(
    State(agent): State<SharedAgent>,
    Json(req): Json<CreateProposalRequest>,
) -> ApiResult<ProposalOutcome> {
    if req.message.trim().is_empty() {
        return Err((StatusCode::BAD_REQUEST, "message must not be empty".to_string()));
    }

    agent
        .create_proposal(req.action_value, &req.message)
        .await
        .map(Json)
        .map_err(error_response)
}

#[derive(Debug, Deserialize)]
pub struct VoteRequest {
    pub proposal_id: ProposalId,
    pub stance: Stance,
    #[serde(default = "default_reason")]
    pub reason: String,
}

fn default_reason() -> String {
    "Manual vote".to_string()
}

/// POST /api/votes
pub async fn api_vote(
    State(agent): State<SharedAgent>,
    Json(req): Json<VoteRequest>,
) -> ApiResult<VoteOutcome> {
    agent
        .vote(&req.proposal_id, req.stance, &req.reason)
        .await
        .map(Json)
        .map_err(error_response)
}

#[derive(Debug, Serialize)]
pub struct RestartResponse {
    pub requested: bool,
}

/// POST /api/restart
pub async fn api_restart(State(agent): State<SharedAgent>) -> Json<RestartResponse> {
    info!("Restart requested through API");
    agent.restart_handle().request();
    Json(RestartResponse { requested: true })
}

fn error_response(e: AgentError) -> (StatusCode, String) {
    let status = match &e {
        AgentError::Ledger(LedgerError::Rejected(_)) => StatusCode::CONFLICT,
        AgentError::Ledger(LedgerError::Timeout(_)) => StatusCode::GATEWAY_TIMEOUT,
        AgentError::Ledger(_) | AgentError::Telemetry(_) => StatusCode::BAD_GATEWAY,
        AgentError::Config(_) | AgentError::Query(_) => StatusCode::BAD_REQUEST,
        AgentError::AlreadyStarted => StatusCode::CONFLICT,
    };
    (status, e.to_string())
}
