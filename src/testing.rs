//! Testing utilities for cluster integration tests
//!
//! Provides `TestCluster` for spinning up in-process clusters over the HTTP
//! transport, with a commit-channel tap per node.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::sync::{mpsc, oneshot};

use axum::Router;

use crate::api::client_http::create_client_router;
use crate::core::config::RaftConfig;
use crate::core::raft_core::{CommitEntry, ConsensusCore};
use crate::core::raft_node::SharedCore;
use crate::core::raft_server::{RaftHandle, RaftServer};
use crate::load::FixedLoadProbe;
use crate::storage::memory::MemoryStorage;
use crate::transport::http::{create_router, HttpTransport};

/// A single test node in the cluster
pub struct TestNode {
    /// Node ID
    pub id: u64,
    /// HTTP address (transport and client API share it)
    pub addr: SocketAddr,
    /// HTTP server shutdown channel
    http_shutdown_tx: Option<oneshot::Sender<()>>,
    /// Server handle
    pub raft_handle: RaftHandle,
    /// Shared consensus core
    pub shared_core: SharedCore,
    /// Commit channel tap
    pub commit_rx: mpsc::Receiver<CommitEntry>,
}

impl TestNode {
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }
}

/// A test cluster of nodes
pub struct TestCluster {
    pub nodes: Vec<TestNode>,
}

impl TestCluster {
    /// Create and start a new 3-node cluster
    pub async fn new() -> Self {
        Self::with_nodes(3).await
    }

    /// Create and start a cluster with the specified number of nodes
    pub async fn with_nodes(count: usize) -> Self {
        Self::with_nodes_and_loads(count, None).await
    }

    /// Create and start a cluster with fixed per-node load levels
    pub async fn with_nodes_and_loads(count: usize, loads: Option<Vec<u32>>) -> Self {
        let node_ids: Vec<u64> = (1..=count as u64).collect();

        // Bind all listeners first to learn the addresses
        let mut listeners = Vec::new();
        let mut addrs = HashMap::new();

        for &id in &node_ids {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            let addr = listener.local_addr().unwrap();
            addrs.insert(id, addr.to_string());
            listeners.push((id, listener, addr));
        }

        // Faster timeouts for testing
        let config = RaftConfig::default()
            .with_heartbeat_interval(Duration::from_millis(50))
            .with_election_timeout(Duration::from_millis(150), Duration::from_millis(300));

        let mut nodes = Vec::new();

        for (index, (id, listener, addr)) in listeners.into_iter().enumerate() {
            // Peer map: all nodes except self
            let peers: HashMap<u64, String> = addrs
                .iter()
                .filter(|(&peer_id, _)| peer_id != id)
                .map(|(&peer_id, addr)| (peer_id, addr.clone()))
                .collect();
            let peer_ids: Vec<u64> = peers.keys().copied().collect();

            let transport = HttpTransport::new(peers, Duration::from_secs(2));
            let core = ConsensusCore::new(id, peer_ids, Box::new(MemoryStorage::new()));

            let load = loads
                .as_ref()
                .and_then(|levels| levels.get(index).copied())
                .unwrap_or(5);
            let (commit_tx, commit_rx) = mpsc::channel(64);
            let (server, shared_core) = RaftServer::with_config(
                core,
                transport,
                commit_tx,
                config.clone(),
                Box::new(FixedLoadProbe::new(load)),
            );

            let raft_handle = server.start();

            let app = create_combined_router(shared_core.clone(), raft_handle.clone());

            let (http_shutdown_tx, http_shutdown_rx) = oneshot::channel();
            tokio::spawn(async move {
                axum::serve(listener, app)
                    .with_graceful_shutdown(async {
                        let _ = http_shutdown_rx.await;
                    })
                    .await
                    .unwrap();
            });

            nodes.push(TestNode {
                id,
                addr,
                http_shutdown_tx: Some(http_shutdown_tx),
                raft_handle,
                shared_core,
                commit_rx,
            });
        }

        // Give servers time to start
        tokio::time::sleep(Duration::from_millis(50)).await;

        TestCluster { nodes }
    }

    /// Shutdown all nodes gracefully
    pub async fn shutdown(mut self) {
        for node in &mut self.nodes {
            if let Some(tx) = node.http_shutdown_tx.take() {
                let _ = tx.send(());
            }
            node.raft_handle.shutdown().await;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    /// Shutdown a specific node (HTTP server and consensus loop)
    pub async fn shutdown_node(&mut self, index: usize) {
        if let Some(tx) = self.nodes[index].http_shutdown_tx.take() {
            let _ = tx.send(());
        }
        self.nodes[index].raft_handle.shutdown().await;
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    /// Wait for a leader to be elected, with timeout
    pub async fn wait_for_leader(&self, timeout: Duration) -> Option<SocketAddr> {
        let start = std::time::Instant::now();
        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(500))
            .build()
            .unwrap();

        while start.elapsed() < timeout {
            for node in &self.nodes {
                if node.http_shutdown_tx.is_none() {
                    continue;
                }
                if let Ok(response) = client
                    .get(format!("http://{}/client/status", node.addr))
                    .send()
                    .await
                {
                    if let Ok(status) = response.json::<StatusResponse>().await {
                        if status.state == "Leader" {
                            return Some(node.addr);
                        }
                    }
                }
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        None
    }

    /// Index of the current leader node, if any
    pub async fn leader_index(&self) -> Option<usize> {
        for (index, node) in self.nodes.iter().enumerate() {
            let core = node.shared_core.lock().await;
            if core.state == crate::core::raft_core::RaftState::Leader {
                return Some(index);
            }
        }
        None
    }

    /// Index of some follower node, if any
    pub async fn follower_index(&self) -> Option<usize> {
        for (index, node) in self.nodes.iter().enumerate() {
            let core = node.shared_core.lock().await;
            if core.state == crate::core::raft_core::RaftState::Follower {
                return Some(index);
            }
        }
        None
    }
}

/// Response for status query (duplicated here to avoid parsing through the
/// api module's types in tests)
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
struct StatusResponse {
    node_id: u64,
    state: String,
    term: i64,
    leader_id: Option<u64>,
    commit_index: i64,
    last_applied: i64,
    log_length: i64,
    load_level: u32,
}

/// Combined router: consensus transport plus client API on one listener
fn create_combined_router(core: SharedCore, handle: RaftHandle) -> Router {
    let raft_router = create_router(core.clone());
    let client_router = create_client_router(handle, core);

    raft_router.merge(client_router)
}
