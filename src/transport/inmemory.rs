//! In-memory transport implementation for testing

use async_trait::async_trait;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};

use crate::core::raft_core::{
    AppendEntriesArgs, AppendEntriesResult, ConsensusCore, RequestVoteArgs, RequestVoteResult,
};
use crate::core::raft_node::{self, SharedCore};
use crate::transport::{Transport, TransportError};

/// Request types that can be sent to a node
pub enum Request {
    RequestVote {
        args: RequestVoteArgs,
        reply: oneshot::Sender<RequestVoteResult>,
    },
    AppendEntries {
        args: AppendEntriesArgs,
        reply: oneshot::Sender<AppendEntriesResult>,
    },
}

/// In-memory transport that uses channels for communication
pub struct InMemoryTransport {
    /// Senders to each node's request channel
    senders: HashMap<u64, mpsc::Sender<Request>>,
    /// Optional timeout for RPC calls
    timeout: Option<Duration>,
}

impl InMemoryTransport {
    /// Create a new in-memory transport with senders to all nodes (no timeout)
    pub fn new(senders: HashMap<u64, mpsc::Sender<Request>>) -> Self {
        Self { senders, timeout: None }
    }

    /// Create a new in-memory transport with a timeout
    pub fn with_timeout(senders: HashMap<u64, mpsc::Sender<Request>>, timeout: Duration) -> Self {
        Self { senders, timeout: Some(timeout) }
    }
}

#[async_trait]
impl Transport for InMemoryTransport {
    async fn request_vote(
        &self,
        target: u64,
        args: RequestVoteArgs,
    ) -> Result<RequestVoteResult, TransportError> {
        let sender = self.senders.get(&target).ok_or(TransportError::NodeNotFound)?;

        let (reply_tx, reply_rx) = oneshot::channel();
        sender
            .send(Request::RequestVote { args, reply: reply_tx })
            .await
            .map_err(|_| TransportError::ConnectionFailed)?;

        match self.timeout {
            Some(timeout) => tokio::time::timeout(timeout, reply_rx)
                .await
                .map_err(|_| TransportError::Timeout)?
                .map_err(|_| TransportError::ConnectionFailed),
            None => reply_rx.await.map_err(|_| TransportError::ConnectionFailed),
        }
    }

    async fn append_entries(
        &self,
        target: u64,
        args: AppendEntriesArgs,
    ) -> Result<AppendEntriesResult, TransportError> {
        let sender = self.senders.get(&target).ok_or(TransportError::NodeNotFound)?;

        let (reply_tx, reply_rx) = oneshot::channel();
        sender
            .send(Request::AppendEntries { args, reply: reply_tx })
            .await
            .map_err(|_| TransportError::ConnectionFailed)?;

        match self.timeout {
            Some(timeout) => tokio::time::timeout(timeout, reply_rx)
                .await
                .map_err(|_| TransportError::Timeout)?
                .map_err(|_| TransportError::ConnectionFailed),
            None => reply_rx.await.map_err(|_| TransportError::ConnectionFailed),
        }
    }
}

/// Handle for a node that processes incoming requests
pub struct NodeHandle {
    receiver: mpsc::Receiver<Request>,
}

impl NodeHandle {
    /// Process one incoming request directly against a core, without the
    /// vote delay (for synchronous-style tests)
    pub async fn process_one(&mut self, node: &mut ConsensusCore) -> bool {
        match self.receiver.recv().await {
            Some(Request::RequestVote { args, reply }) => {
                node.observe_vote_request(&args);
                let _ = reply.send(node.decide_vote(&args));
                true
            }
            Some(Request::AppendEntries { args, reply }) => {
                let _ = reply.send(node.handle_append_entries(&args));
                true
            }
            None => false,
        }
    }

    /// Process one request against a shared core through the RPC injectors,
    /// including the load-weighted vote delay
    pub async fn process_one_shared(&mut self, node: &SharedCore) -> bool {
        match self.receiver.recv().await {
            Some(Request::RequestVote { args, reply }) => {
                let result = raft_node::handle_request_vote(node, args).await;
                let _ = reply.send(result);
                true
            }
            Some(Request::AppendEntries { args, reply }) => {
                let result = raft_node::handle_append_entries(node, args).await;
                let _ = reply.send(result);
                true
            }
            None => false,
        }
    }
}

/// Create transports and handles for a cluster of nodes
pub fn create_cluster(
    node_ids: &[u64],
) -> (HashMap<u64, InMemoryTransport>, HashMap<u64, NodeHandle>) {
    create_cluster_with_timeout(node_ids, None)
}

/// Create transports and handles for a cluster of nodes with optional timeout
pub fn create_cluster_with_timeout(
    node_ids: &[u64],
    timeout: Option<Duration>,
) -> (HashMap<u64, InMemoryTransport>, HashMap<u64, NodeHandle>) {
    let mut senders: HashMap<u64, mpsc::Sender<Request>> = HashMap::new();
    let mut handles: HashMap<u64, NodeHandle> = HashMap::new();

    // Create a channel for each node
    for &id in node_ids {
        let (tx, rx) = mpsc::channel(32);
        senders.insert(id, tx);
        handles.insert(id, NodeHandle { receiver: rx });
    }

    // Create a transport for each node with senders to all other nodes
    let mut transports: HashMap<u64, InMemoryTransport> = HashMap::new();
    for &id in node_ids {
        let other_senders: HashMap<u64, mpsc::Sender<Request>> = senders
            .iter()
            .filter(|(&k, _)| k != id)
            .map(|(&k, v)| (k, v.clone()))
            .collect();
        let transport = match timeout {
            Some(t) => InMemoryTransport::with_timeout(other_senders, t),
            None => InMemoryTransport::new(other_senders),
        };
        transports.insert(id, transport);
    }

    (transports, handles)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::memory::MemoryStorage;

    fn new_test_core(id: u64, peers: Vec<u64>) -> ConsensusCore {
        ConsensusCore::new(id, peers, Box::new(MemoryStorage::new()))
    }

    fn vote_args(term: i64, candidate_id: u64) -> RequestVoteArgs {
        RequestVoteArgs {
            term,
            candidate_id,
            last_log_index: -1,
            last_log_term: -1,
            load_level: 5,
        }
    }

    fn heartbeat_args(term: i64, leader_id: u64) -> AppendEntriesArgs {
        AppendEntriesArgs {
            term,
            leader_id,
            prev_log_index: -1,
            prev_log_term: -1,
            entries: vec![],
            leader_commit: -1,
            chosen_id: -1,
        }
    }

    #[tokio::test]
    async fn test_request_vote() {
        let node_ids = vec![1, 2, 3];
        let (transports, mut handles) = create_cluster(&node_ids);

        let mut node2 = new_test_core(2, vec![1, 3]);
        node2.load_level = 4;

        let transport1 = transports.get(&1).unwrap();
        let vote_future = transport1.request_vote(2, vote_args(1, 1));

        let handle2 = handles.get_mut(&2).unwrap();
        let (result, _) = tokio::join!(vote_future, handle2.process_one(&mut node2));

        let result = result.unwrap();
        assert!(result.vote_granted);
        assert_eq!(result.term, 1);
        assert_eq!(result.load_level, 4);
        assert_eq!(node2.voted_for, Some(1));
    }

    #[tokio::test]
    async fn test_append_entries() {
        let node_ids = vec![1, 2, 3];
        let (transports, mut handles) = create_cluster(&node_ids);

        let mut node2 = new_test_core(2, vec![1, 3]);

        let transport1 = transports.get(&1).unwrap();
        let append_future = transport1.append_entries(2, heartbeat_args(1, 1));

        let handle2 = handles.get_mut(&2).unwrap();
        let (result, _) = tokio::join!(append_future, handle2.process_one(&mut node2));

        let result = result.unwrap();
        assert!(result.success);
        assert_eq!(result.term, 1);
    }

    #[tokio::test]
    async fn test_node_not_found() {
        let node_ids = vec![1, 2];
        let (transports, _handles) = create_cluster(&node_ids);

        let transport1 = transports.get(&1).unwrap();
        let result = transport1.request_vote(99, vote_args(1, 1)).await;
        assert!(matches!(result, Err(TransportError::NodeNotFound)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_request_vote_timeout() {
        let node_ids = vec![1, 2];
        let timeout = Duration::from_millis(100);
        let (transports, _handles) = create_cluster_with_timeout(&node_ids, Some(timeout));

        let transport1 = transports.get(&1).unwrap();

        // Request vote but never process on node 2 - must time out
        let result = transport1.request_vote(2, vote_args(1, 1)).await;
        assert!(matches!(result, Err(TransportError::Timeout)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_append_entries_timeout() {
        let node_ids = vec![1, 2];
        let timeout = Duration::from_millis(100);
        let (transports, _handles) = create_cluster_with_timeout(&node_ids, Some(timeout));

        let transport1 = transports.get(&1).unwrap();

        let result = transport1.append_entries(2, heartbeat_args(1, 1)).await;
        assert!(matches!(result, Err(TransportError::Timeout)));
    }
}
