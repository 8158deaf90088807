//! RaftNode - outbound RPC fan-out and incoming RPC injectors
//!
//! Wraps the shared `ConsensusCore` and a `Transport`. Outbound traffic
//! (vote rounds, AppendEntries rounds) snapshots state under the lock,
//! releases it across the network call, then reacquires and re-checks role
//! and term before applying the reply. Incoming RPCs enter through the free
//! functions at the bottom, which follow the same discipline around the
//! load-weighted vote delay.

use std::sync::Arc;
use tokio::sync::Mutex;

use futures::stream::FuturesUnordered;
use futures::StreamExt;

use super::raft_core::{
    AppendEntriesArgs, AppendEntriesResult, ConsensusCore, RaftState, RequestVoteArgs,
    RequestVoteResult,
};
use crate::transport::Transport;

/// Shared reference to the consensus core
pub type SharedCore = Arc<Mutex<ConsensusCore>>;

/// Node-level handle over the core and the cluster transport
pub struct RaftNode<T: Transport> {
    core: SharedCore,
    transport: T,
}

impl<T: Transport> RaftNode<T> {
    pub fn new(core: ConsensusCore, transport: T) -> Self {
        Self {
            core: Arc::new(Mutex::new(core)),
            transport,
        }
    }

    /// Shared core handle (for incoming RPC handling and status queries)
    pub fn shared_core(&self) -> SharedCore {
        self.core.clone()
    }

    /// Begin an election on the core
    pub async fn start_election(&self) {
        let mut core = self.core.lock().await;
        core.start_election();
    }

    /// Request votes from all peers concurrently, tallying replies as they
    /// arrive. Returns true if this node became leader.
    pub async fn request_votes(&self) -> bool {
        let (args, peers) = {
            let core = self.core.lock().await;
            if core.state != RaftState::Candidate {
                return false;
            }
            let (last_log_index, last_log_term) = core.last_log_index_and_term();
            let args = RequestVoteArgs {
                term: core.current_term,
                candidate_id: core.id,
                last_log_index,
                last_log_term,
                load_level: core.load_level,
            };
            (args, core.peers.clone())
        };

        let mut futures: FuturesUnordered<_> = peers
            .iter()
            .map(|&peer_id| {
                let args = args.clone();
                let transport = &self.transport;
                async move { (peer_id, transport.request_vote(peer_id, args).await) }
            })
            .collect();

        // Drain every reply, even after winning: late replies still carry
        // load levels the placement selector needs
        let mut became_leader = false;
        while let Some((peer_id, result)) = futures.next().await {
            if let Ok(result) = result {
                let mut core = self.core.lock().await;
                if core.handle_request_vote_result(peer_id, &result) {
                    became_leader = true;
                }
            }
        }

        became_leader
    }

    /// Send one AppendEntries round (possibly empty - heartbeat) to every
    /// peer and fold the replies back into the core. Returns whether this
    /// node is still leader afterwards.
    pub async fn broadcast_append_entries(&self) -> bool {
        let requests = {
            let core = self.core.lock().await;
            if core.state != RaftState::Leader {
                return false;
            }

            let mut requests = Vec::new();
            for &peer_id in &core.peers {
                let ni = core.next_index.get(&peer_id).copied().unwrap_or(core.log_len());
                let prev_log_index = ni - 1;
                let prev_log_term = core.entry(prev_log_index).map(|e| e.term).unwrap_or(-1);
                let entries: Vec<_> = core.log[ni as usize..].to_vec();
                let chosen_id = entries.first().map(|e| e.chosen_id as i64).unwrap_or(-1);

                let args = AppendEntriesArgs {
                    term: core.current_term,
                    leader_id: core.id,
                    prev_log_index,
                    prev_log_term,
                    entries,
                    leader_commit: core.commit_index,
                    chosen_id,
                };
                requests.push((peer_id, ni, args));
            }
            requests
        };

        // Send to all peers concurrently (lock released)
        let mut futures: FuturesUnordered<_> = requests
            .into_iter()
            .map(|(peer_id, ni, args)| {
                let sent = args.entries.len();
                let transport = &self.transport;
                async move {
                    (
                        peer_id,
                        ni,
                        sent,
                        transport.append_entries(peer_id, args).await,
                    )
                }
            })
            .collect();

        while let Some((peer_id, ni, sent, result)) = futures.next().await {
            if let Ok(result) = result {
                let mut core = self.core.lock().await;
                core.handle_append_entries_result(peer_id, ni, sent, &result);
                if core.state != RaftState::Leader {
                    return false; // Demoted by a higher-term reply
                }
            }
            // Transport errors are dropped: the next heartbeat retries
        }

        self.core.lock().await.state == RaftState::Leader
    }

    /// Current role
    pub async fn state(&self) -> RaftState {
        self.core.lock().await.state
    }

    /// Current commit index
    pub async fn commit_index(&self) -> i64 {
        self.core.lock().await.commit_index
    }
}

/// Handle an incoming RequestVote RPC against the shared core.
///
/// Non-candidate voters pause for `vote_delay_base / load_level` ms with the
/// lock released, so a lightly loaded candidate is answered late and a
/// heavily loaded one early; the grant condition is re-evaluated against
/// current state after the pause.
pub async fn handle_request_vote(core: &SharedCore, args: RequestVoteArgs) -> RequestVoteResult {
    let delay = {
        let mut core = core.lock().await;
        core.observe_vote_request(&args)
    };

    if let Some(delay) = delay {
        tokio::time::sleep(delay).await;
    }

    let mut core = core.lock().await;
    core.decide_vote(&args)
}

/// Handle an incoming AppendEntries RPC against the shared core
pub async fn handle_append_entries(
    core: &SharedCore,
    args: AppendEntriesArgs,
) -> AppendEntriesResult {
    let mut core = core.lock().await;
    core.handle_append_entries(&args)
}
