//! Transport abstraction for consensus RPC communication

use async_trait::async_trait;
use thiserror::Error;

use crate::core::raft_core::{
    AppendEntriesArgs, AppendEntriesResult, RequestVoteArgs, RequestVoteResult,
};

/// Transport abstraction for consensus RPC communication.
///
/// Best-effort request/reply to named peers; errors are reported, never
/// retried here (the protocol retries through heartbeats and elections).
#[async_trait]
pub trait Transport: Send + Sync {
    /// Send a RequestVote RPC to a peer node
    async fn request_vote(
        &self,
        target: u64,
        args: RequestVoteArgs,
    ) -> Result<RequestVoteResult, TransportError>;

    /// Send an AppendEntries RPC to a peer node
    async fn append_entries(
        &self,
        target: u64,
        args: AppendEntriesArgs,
    ) -> Result<AppendEntriesResult, TransportError>;
}

/// Errors that can occur during transport operations
#[derive(Debug, Clone, Error)]
pub enum TransportError {
    /// Connection to the target node failed
    #[error("connection failed")]
    ConnectionFailed,
    /// Request timed out
    #[error("request timed out")]
    Timeout,
    /// Target node not found
    #[error("node not found")]
    NodeNotFound,
}
