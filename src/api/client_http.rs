//! HTTP client API for a node
//!
//! Endpoints for external clients:
//! - Submit service commands to the leader
//! - Query node status and leader information

use axum::{
    extract::State,
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};

use crate::core::raft_core::{RaftState, ServiceCommand};
use crate::core::raft_node::SharedCore;
use crate::core::raft_server::{RaftError, RaftHandle};

/// State for client HTTP handlers - the handle for commands and the core
/// for status queries
#[derive(Clone)]
pub struct ClientState {
    pub handle: RaftHandle,
    pub core: SharedCore,
}

/// Request body for submitting a command
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmitRequest {
    pub command: ServiceCommand,
}

/// Response from a successful submit: the entry was appended and persisted
/// on the leader. The commit is reported later on the commit channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmitResponse {
    pub index: i64,
    pub term: i64,
    pub chosen_id: u64,
}

/// Error response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    /// Leader hint (node ID) if known, for redirect
    #[serde(skip_serializing_if = "Option::is_none")]
    pub leader_hint: Option<u64>,
}

/// Response for leader query
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LeaderResponse {
    pub leader_id: Option<u64>,
    pub node_id: u64,
    pub is_leader: bool,
}

/// Response for status query
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusResponse {
    pub node_id: u64,
    pub state: String,
    pub term: i64,
    pub leader_id: Option<u64>,
    pub commit_index: i64,
    pub last_applied: i64,
    pub log_length: i64,
    pub load_level: u32,
}

/// Create an axum router for the client HTTP API
pub fn create_client_router(handle: RaftHandle, core: SharedCore) -> Router {
    let state = ClientState { handle, core };
    Router::new()
        .route("/client/submit", post(handle_submit))
        .route("/client/leader", get(handle_leader))
        .route("/client/status", get(handle_status))
        .with_state(state)
}

/// Handle POST /client/submit - append a command on the leader
pub async fn handle_submit(
    State(state): State<ClientState>,
    Json(request): Json<SubmitRequest>,
) -> Result<Json<SubmitResponse>, (StatusCode, Json<ErrorResponse>)> {
    match state.handle.submit(request.command).await {
        Ok(entry) => Ok(Json(SubmitResponse {
            index: entry.index,
            term: entry.term,
            chosen_id: entry.chosen_id,
        })),
        Err(RaftError::NotLeader { leader_hint }) => Err((
            StatusCode::SERVICE_UNAVAILABLE,
            Json(ErrorResponse {
                error: "not the leader".to_string(),
                leader_hint,
            }),
        )),
        Err(err) => Err((
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(ErrorResponse {
                error: err.to_string(),
                leader_hint: None,
            }),
        )),
    }
}

/// Handle GET /client/leader - current leader information
pub async fn handle_leader(State(state): State<ClientState>) -> Json<LeaderResponse> {
    let core = state.core.lock().await;
    Json(LeaderResponse {
        leader_id: core.current_leader,
        node_id: core.id,
        is_leader: core.state == RaftState::Leader,
    })
}

/// Handle GET /client/status - node status
pub async fn handle_status(State(state): State<ClientState>) -> Json<StatusResponse> {
    let core = state.core.lock().await;
    Json(StatusResponse {
        node_id: core.id,
        state: format!("{:?}", core.state),
        term: core.current_term,
        leader_id: core.current_leader,
        commit_index: core.commit_index,
        last_applied: core.last_applied,
        log_length: core.log_len(),
        load_level: core.load_level,
    })
}
