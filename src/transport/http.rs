//! HTTP transport implementation for consensus RPC
//!
//! Uses axum for the server and reqwest for the client. Incoming requests
//! are injected into the shared core through the handlers in `raft_node`,
//! which apply the load-weighted vote delay outside the node lock.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use axum::{extract::State, routing::post, Json, Router};

use crate::core::raft_core::{
    AppendEntriesArgs, AppendEntriesResult, RequestVoteArgs, RequestVoteResult,
};
use crate::core::raft_node::{self, SharedCore};
use crate::transport::{Transport, TransportError};

/// HTTP transport for consensus RPC communication
pub struct HttpTransport {
    /// Map of node ID to address (e.g., "127.0.0.1:8001")
    peers: HashMap<u64, String>,
    /// HTTP client with timeout
    client: reqwest::Client,
}

impl HttpTransport {
    /// Create a new HTTP transport with peer addresses
    pub fn new(peers: HashMap<u64, String>, timeout: Duration) -> Self {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .expect("failed to create HTTP client");

        HttpTransport { peers, client }
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn request_vote(
        &self,
        target: u64,
        args: RequestVoteArgs,
    ) -> Result<RequestVoteResult, TransportError> {
        let addr = self.peers.get(&target).ok_or(TransportError::NodeNotFound)?;
        let url = format!("http://{}/raft/request_vote", addr);

        let response = self
            .client
            .post(&url)
            .json(&args)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    TransportError::Timeout
                } else {
                    TransportError::ConnectionFailed
                }
            })?;

        response
            .json::<RequestVoteResult>()
            .await
            .map_err(|_| TransportError::ConnectionFailed)
    }

    async fn append_entries(
        &self,
        target: u64,
        args: AppendEntriesArgs,
    ) -> Result<AppendEntriesResult, TransportError> {
        let addr = self.peers.get(&target).ok_or(TransportError::NodeNotFound)?;
        let url = format!("http://{}/raft/append_entries", addr);

        let response = self
            .client
            .post(&url)
            .json(&args)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    TransportError::Timeout
                } else {
                    TransportError::ConnectionFailed
                }
            })?;

        response
            .json::<AppendEntriesResult>()
            .await
            .map_err(|_| TransportError::ConnectionFailed)
    }
}

/// Create an axum router for handling incoming consensus RPCs
pub fn create_router(core: SharedCore) -> Router {
    Router::new()
        .route("/raft/request_vote", post(handle_request_vote))
        .route("/raft/append_entries", post(handle_append_entries))
        .with_state(core)
}

async fn handle_request_vote(
    State(core): State<SharedCore>,
    Json(args): Json<RequestVoteArgs>,
) -> Json<RequestVoteResult> {
    Json(raft_node::handle_request_vote(&core, args).await)
}

async fn handle_append_entries(
    State(core): State<SharedCore>,
    Json(args): Json<AppendEntriesArgs>,
) -> Json<AppendEntriesResult> {
    Json(raft_node::handle_append_entries(&core, args).await)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::raft_core::ConsensusCore;
    use crate::storage::memory::MemoryStorage;
    use std::sync::Arc;
    use tokio::net::TcpListener;
    use tokio::sync::Mutex;

    fn new_test_core(id: u64, peers: Vec<u64>) -> ConsensusCore {
        ConsensusCore::new(id, peers, Box::new(MemoryStorage::new()))
    }

    async fn spawn_node(core: ConsensusCore) -> (SharedCore, String) {
        let shared = Arc::new(Mutex::new(core));
        let router = create_router(shared.clone());

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        tokio::time::sleep(Duration::from_millis(10)).await;

        (shared, addr.to_string())
    }

    #[tokio::test]
    async fn test_http_request_vote() {
        let (shared2, addr) = spawn_node(new_test_core(2, vec![1, 3])).await;

        let mut peers = HashMap::new();
        peers.insert(2, addr);
        let transport = HttpTransport::new(peers, Duration::from_secs(5));

        let args = RequestVoteArgs {
            term: 1,
            candidate_id: 1,
            last_log_index: -1,
            last_log_term: -1,
            load_level: 5,
        };

        let result = transport.request_vote(2, args).await.unwrap();

        assert!(result.vote_granted);
        assert_eq!(result.term, 1);
        assert_eq!(shared2.lock().await.voted_for, Some(1));
    }

    #[tokio::test]
    async fn test_http_append_entries() {
        let (_shared2, addr) = spawn_node(new_test_core(2, vec![1, 3])).await;

        let mut peers = HashMap::new();
        peers.insert(2, addr);
        let transport = HttpTransport::new(peers, Duration::from_secs(5));

        let args = AppendEntriesArgs {
            term: 1,
            leader_id: 1,
            prev_log_index: -1,
            prev_log_term: -1,
            entries: vec![],
            leader_commit: -1,
            chosen_id: -1,
        };

        let result = transport.append_entries(2, args).await.unwrap();

        assert!(result.success);
        assert_eq!(result.term, 1);
    }

    #[tokio::test]
    async fn test_http_unreachable_peer() {
        let mut peers = HashMap::new();
        peers.insert(2, "127.0.0.1:59999".to_string());
        let transport = HttpTransport::new(peers, Duration::from_millis(100));

        let args = RequestVoteArgs {
            term: 1,
            candidate_id: 1,
            last_log_index: -1,
            last_log_term: -1,
            load_level: 5,
        };

        let result = transport.request_vote(2, args).await;

        assert!(matches!(
            result,
            Err(TransportError::ConnectionFailed) | Err(TransportError::Timeout)
        ));
    }

    #[tokio::test]
    async fn test_http_node_not_found() {
        let transport = HttpTransport::new(HashMap::new(), Duration::from_secs(5));

        let args = RequestVoteArgs {
            term: 1,
            candidate_id: 1,
            last_log_index: -1,
            last_log_term: -1,
            load_level: 5,
        };

        let result = transport.request_vote(2, args).await;

        assert!(matches!(result, Err(TransportError::NodeNotFound)));
    }
}
