//! Core consensus state machine (sync, transport-agnostic)
//!
//! Implements a single node of a load-aware Raft variant: leader election is
//! biased toward lightly loaded nodes through a load-weighted vote delay, and
//! every replicated command carries the id of the peer chosen to execute it.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::Notify;
use tokio::time::Instant;

use crate::storage::{DurableRecord, Storage, TERM_SCALAR, VOTED_FOR_SCALAR};

/// Node roles
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RaftState {
    /// Passive state, receives updates from leader
    Follower,
    /// Actively seeking votes to become leader
    Candidate,
    /// Handles all client requests and replicates log
    Leader,
    /// Terminal state after `stop`, refuses all actions
    Dead,
}

/// Type tag of a service command
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ServiceKind {
    #[serde(rename = "DEPLOY")]
    Deploy,
    #[serde(rename = "REMOVE")]
    Remove,
}

impl std::fmt::Display for ServiceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ServiceKind::Deploy => write!(f, "DEPLOY"),
            ServiceKind::Remove => write!(f, "REMOVE"),
        }
    }
}

/// Application command replicated through the log. Opaque to consensus: a
/// service identifier (64 bytes on the artifact channel) plus a type tag.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceCommand {
    #[serde(rename = "ServiceID")]
    pub service_id: String,
    #[serde(rename = "Type")]
    pub kind: ServiceKind,
}

/// A single log entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    /// Command carried by this entry
    pub command: ServiceCommand,
    /// Term when the entry was created by the leader
    pub term: i64,
    /// Leader that originated the entry
    pub leader_id: u64,
    /// Position in the log (0-based)
    pub index: i64,
    /// Peer selected to execute the command; fixed once persisted
    pub chosen_id: u64,
}

/// Entry reported on the commit channel once consensus is reached
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitEntry {
    pub command: ServiceCommand,
    /// Log index at which the command is committed
    pub index: i64,
    /// Term at which the command is committed
    pub term: i64,
    /// Peer designated to execute the command
    pub chosen_id: u64,
}

/// RequestVote RPC arguments
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestVoteArgs {
    pub term: i64,
    pub candidate_id: u64,
    /// Index of candidate's last log entry (-1 if empty)
    pub last_log_index: i64,
    /// Term of candidate's last log entry (-1 if empty)
    pub last_log_term: i64,
    /// Candidate's load level; drives the voter-side delay
    pub load_level: u32,
}

/// RequestVote RPC results
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestVoteResult {
    pub term: i64,
    pub vote_granted: bool,
    /// Voter's load level, harvested by the candidate for placement
    pub load_level: u32,
}

/// AppendEntries RPC arguments
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppendEntriesArgs {
    pub term: i64,
    pub leader_id: u64,
    /// Index of log entry immediately preceding the new ones (-1 for none)
    pub prev_log_index: i64,
    /// Term of the prev_log_index entry (-1 for none)
    pub prev_log_term: i64,
    /// Entries to store (empty for heartbeat)
    pub entries: Vec<LogEntry>,
    /// Leader's commit index (-1 if nothing committed)
    pub leader_commit: i64,
    /// Chosen peer of the first new entry, -1 when `entries` is empty
    pub chosen_id: i64,
}

/// AppendEntries RPC results
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppendEntriesResult {
    pub term: i64,
    pub success: bool,
    /// Accelerated-backtracking hints; meaningful only when !success
    pub conflict_index: i64,
    pub conflict_term: i64,
}

/// Load-weighted vote delay: `base / load_level` milliseconds. A request
/// from a lightly loaded candidate is answered after a longer pause than one
/// from a heavily loaded candidate.
pub fn vote_delay(base: u64, load_level: u32) -> Duration {
    Duration::from_millis(base / load_level.max(1) as u64)
}

/// Core consensus state machine for a single node.
///
/// Sync and transport-agnostic: incoming RPCs and outbound replies are plain
/// method calls; async wrappers in `raft_node` handle locking, the vote
/// delay, and the network. All durable state flows through the `Storage`
/// adapter before any reply that depends on it is produced.
pub struct ConsensusCore {
    storage: Box<dyn Storage>,

    // Persistent state (cached in memory, always written through storage)
    /// Latest term this node has seen (monotonic, initially 0)
    pub current_term: i64,
    /// Candidate that received this node's vote in the current term
    pub voted_for: Option<u64>,
    /// Log entries (0-based, dense)
    pub log: Vec<LogEntry>,

    // Volatile state on all servers
    /// Highest log index known committed (-1 if none)
    pub commit_index: i64,
    /// Highest log index handed to the commit dispatcher (-1 if none)
    pub last_applied: i64,
    /// Current role
    pub state: RaftState,
    /// Last event that postponed an election (vote granted, valid heartbeat)
    pub election_reset_at: Instant,
    /// Leader this node currently recognizes
    pub current_leader: Option<u64>,

    // Load awareness
    /// This node's latest sampled load level (1..=10)
    pub load_level: u32,
    /// Last reported load level per node, refreshed by vote replies
    pub load_level_map: HashMap<u64, u32>,
    /// Numerator of the vote delay formula
    pub vote_delay_base: u64,

    // Volatile state on leaders (reinitialized after election)
    /// Next log index to send to each peer
    pub next_index: HashMap<u64, i64>,
    /// Highest log index known replicated on each peer (-1 initially)
    pub match_index: HashMap<u64, i64>,

    /// Unique identifier for this node
    pub id: u64,
    /// Other nodes in the cluster (self excluded)
    pub peers: Vec<u64>,
    /// Peers that granted votes in the current election
    votes_received: Vec<u64>,

    // Wakeup signals, single-slot with coalescing
    commit_ready: Arc<Notify>,
    trigger_append: Arc<Notify>,
}

impl ConsensusCore {
    /// Create a new core with the given id, peer list, and storage backend.
    /// If the storage holds prior state, the term, vote, and log are
    /// restored from it; missing scalars or corrupted records are fatal.
    pub fn new(id: u64, peers: Vec<u64>, storage: Box<dyn Storage>) -> Self {
        let mut core = ConsensusCore {
            storage,
            current_term: 0,
            voted_for: None,
            log: Vec::new(),
            commit_index: -1,
            last_applied: -1,
            state: RaftState::Follower,
            election_reset_at: Instant::now(),
            current_leader: None,
            load_level: 10,
            load_level_map: HashMap::new(),
            vote_delay_base: 100,
            next_index: HashMap::new(),
            match_index: HashMap::new(),
            id,
            peers,
            votes_received: Vec::new(),
            commit_ready: Arc::new(Notify::new()),
            trigger_append: Arc::new(Notify::new()),
        };

        let has_data = core
            .storage
            .has_data()
            .expect("failed to probe storage for prior state");
        if has_data {
            core.restore_from_storage();
        }

        core
    }

    /// Rebuild term, vote, and log from storage. Called from the
    /// constructor, before any concurrency concerns.
    fn restore_from_storage(&mut self) {
        let term = self
            .storage
            .get(TERM_SCALAR)
            .expect("failed to read Term from storage")
            .expect("no Term found in storage");
        self.current_term = term.parse().expect("invalid Term in storage");

        let voted_for = self
            .storage
            .get(VOTED_FOR_SCALAR)
            .expect("failed to read VotedFor from storage")
            .expect("no VotedFor found in storage");
        let voted_for: i64 = voted_for.parse().expect("invalid VotedFor in storage");
        self.voted_for = if voted_for < 0 { None } else { Some(voted_for as u64) };

        let records = self
            .storage
            .all_records()
            .expect("failed to replay records from storage");
        for (position, record) in records.iter().enumerate() {
            let command = record
                .command
                .clone()
                .expect("entry record without command in storage");
            self.log.push(LogEntry {
                command,
                term: record.term_value().expect("invalid term in record"),
                leader_id: record.leader_value().expect("invalid leader in record").max(0) as u64,
                index: position as i64,
                chosen_id: record.chosen_value().expect("invalid chosen in record").max(0) as u64,
            });
        }

        tracing::info!(
            node_id = self.id,
            term = self.current_term,
            log_len = self.log.len(),
            "restored state from storage"
        );
    }

    /// Wakeup signal for the commit dispatcher
    pub fn commit_ready(&self) -> Arc<Notify> {
        self.commit_ready.clone()
    }

    /// Wakeup signal for the leader's replication driver
    pub fn trigger_append(&self) -> Arc<Notify> {
        self.trigger_append.clone()
    }

    // === Persistence helpers ===

    /// Persist the Term/VotedFor scalars (hard-state record, no command)
    fn persist_hard_state(&mut self) {
        let (leader, chosen) = match self.log.last() {
            Some(entry) => (entry.leader_id as i64, entry.chosen_id as i64),
            None => (-1, -1),
        };
        let position = self.log.len().saturating_sub(1) as u64;
        let record = DurableRecord::new(
            position,
            self.current_term,
            None,
            leader,
            chosen,
            self.voted_for.map(|v| v as i64).unwrap_or(-1),
        );
        self.storage
            .put(&record)
            .expect("failed to persist hard state");
    }

    /// Persist the log entry at `position`
    fn persist_entry(&mut self, position: usize) {
        let entry = &self.log[position];
        let record = DurableRecord::new(
            position as u64,
            entry.term,
            Some(entry.command.clone()),
            entry.leader_id as i64,
            entry.chosen_id as i64,
            self.voted_for.map(|v| v as i64).unwrap_or(-1),
        );
        self.storage
            .put(&record)
            .expect("failed to persist log entry");
    }

    // === Log model ===

    /// Log length as a signed index bound
    pub fn log_len(&self) -> i64 {
        self.log.len() as i64
    }

    /// Entry at `index`, or None when out of range
    pub fn entry(&self, index: i64) -> Option<&LogEntry> {
        if index < 0 {
            return None;
        }
        self.log.get(index as usize)
    }

    /// Last log index and term, (-1, -1) when the log is empty
    pub fn last_log_index_and_term(&self) -> (i64, i64) {
        match self.log.last() {
            Some(entry) => (entry.index, entry.term),
            None => (-1, -1),
        }
    }

    /// Check if a candidate's log is at least as up-to-date as ours
    pub fn is_log_up_to_date(&self, last_log_term: i64, last_log_index: i64) -> bool {
        let (my_last_index, my_last_term) = self.last_log_index_and_term();
        last_log_term > my_last_term
            || (last_log_term == my_last_term && last_log_index >= my_last_index)
    }

    /// Votes (or match counts) needed for a majority, self included
    fn majority(&self) -> usize {
        (self.peers.len() + 1) / 2 + 1
    }

    // === Role transitions ===

    /// Step down to follower at `term`, clearing the vote
    pub fn become_follower(&mut self, term: i64) {
        let old_state = self.state;
        self.state = RaftState::Follower;
        self.current_term = term;
        self.voted_for = None;
        self.current_leader = None;
        self.persist_hard_state();
        if old_state != RaftState::Follower {
            tracing::info!(node_id = self.id, term, was = ?old_state, "stepped down to follower");
        }
    }

    /// Begin an election: bump the term, vote for self, seed the load map
    /// with our own level
    pub fn start_election(&mut self) {
        self.state = RaftState::Candidate;
        self.current_term += 1;
        self.voted_for = Some(self.id);
        self.current_leader = None;
        self.election_reset_at = Instant::now();
        self.votes_received.clear();
        self.votes_received.push(self.id);
        self.load_level_map.insert(self.id, self.load_level);
        self.persist_hard_state();
        tracing::info!(
            node_id = self.id,
            term = self.current_term,
            load_level = self.load_level,
            "became candidate"
        );
    }

    /// Switch into the leader role and initialize per-peer progress
    pub fn become_leader(&mut self) {
        self.state = RaftState::Leader;
        self.current_leader = Some(self.id);
        self.election_reset_at = Instant::now();
        for &peer_id in &self.peers {
            self.next_index.insert(peer_id, self.log.len() as i64);
            self.match_index.insert(peer_id, -1);
        }
        tracing::info!(
            node_id = self.id,
            term = self.current_term,
            log_len = self.log.len(),
            "became leader"
        );
    }

    /// Transition to Dead and wake the commit dispatcher so it can exit
    pub fn stop(&mut self) {
        self.state = RaftState::Dead;
        tracing::info!(node_id = self.id, "becomes dead");
        self.commit_ready.notify_one();
    }

    // === RequestVote ===

    /// First half of the RequestVote handler, run before the vote delay:
    /// absorbs a higher term and reports whether the caller should delay
    /// (non-candidates wait `vote_delay_base / load_level` ms)
    pub fn observe_vote_request(&mut self, args: &RequestVoteArgs) -> Option<Duration> {
        if self.state == RaftState::Dead {
            return None;
        }
        if args.term > self.current_term {
            tracing::debug!(node_id = self.id, term = args.term, "term out of date in RequestVote");
            self.become_follower(args.term);
        }
        if self.state != RaftState::Candidate {
            Some(vote_delay(self.vote_delay_base, args.load_level))
        } else {
            None
        }
    }

    /// Second half of the RequestVote handler, run after the delay with the
    /// lock reacquired. State may have moved on during the delay, so every
    /// condition is evaluated against current state.
    pub fn decide_vote(&mut self, args: &RequestVoteArgs) -> RequestVoteResult {
        if self.state == RaftState::Dead {
            return RequestVoteResult {
                term: -1,
                vote_granted: false,
                load_level: self.load_level,
            };
        }

        let (last_log_index, last_log_term) = self.last_log_index_and_term();
        let grant = args.term == self.current_term
            && (self.voted_for.is_none() || self.voted_for == Some(args.candidate_id))
            && (args.last_log_term > last_log_term
                || (args.last_log_term == last_log_term && args.last_log_index >= last_log_index));

        if grant {
            self.voted_for = Some(args.candidate_id);
            self.election_reset_at = Instant::now();
            self.persist_hard_state();
            tracing::debug!(
                node_id = self.id,
                candidate = args.candidate_id,
                term = self.current_term,
                "vote granted"
            );
        }

        RequestVoteResult {
            term: self.current_term,
            vote_granted: grant,
            load_level: self.load_level,
        }
    }

    /// Handle a vote reply on the candidate. The peer's load level is
    /// recorded unconditionally, even when the vote was denied. Returns true
    /// if the reply completed a majority and this node became leader.
    pub fn handle_request_vote_result(&mut self, peer_id: u64, result: &RequestVoteResult) -> bool {
        self.load_level_map.insert(peer_id, result.load_level);

        if result.term > self.current_term {
            tracing::debug!(node_id = self.id, "term out of date in vote reply");
            self.become_follower(result.term);
            return false;
        }

        if self.state != RaftState::Candidate || result.term != self.current_term {
            return false;
        }

        if result.vote_granted && !self.votes_received.contains(&peer_id) {
            self.votes_received.push(peer_id);
        }

        if self.votes_received.len() >= self.majority() {
            tracing::info!(
                node_id = self.id,
                votes = self.votes_received.len(),
                "won election"
            );
            self.become_leader();
            return true;
        }

        false
    }

    // === AppendEntries ===

    /// Handle an AppendEntries RPC (heartbeat or replication)
    pub fn handle_append_entries(&mut self, args: &AppendEntriesArgs) -> AppendEntriesResult {
        if self.state == RaftState::Dead {
            return AppendEntriesResult {
                term: -1,
                success: false,
                conflict_index: -1,
                conflict_term: -1,
            };
        }

        if args.term > self.current_term {
            tracing::debug!(node_id = self.id, term = args.term, "term out of date in AppendEntries");
            self.become_follower(args.term);
        }

        let mut success = false;
        let mut conflict_index = -1;
        let mut conflict_term = -1;

        if args.term == self.current_term {
            if self.state != RaftState::Follower {
                // Same-term step-down keeps the vote (cast for this term)
                self.state = RaftState::Follower;
            }
            self.current_leader = Some(args.leader_id);
            self.election_reset_at = Instant::now();

            // Does our log contain a matching entry at prev_log_index?
            // Vacuously true when prev_log_index == -1.
            let matched = args.prev_log_index == -1
                || (args.prev_log_index < self.log_len()
                    && args.prev_log_term == self.log[args.prev_log_index as usize].term);

            if matched {
                success = true;

                // Find the insertion point: first position where the local
                // log and the incoming entries disagree on term
                let mut insert = (args.prev_log_index + 1) as usize;
                let mut incoming = 0usize;
                while insert < self.log.len()
                    && incoming < args.entries.len()
                    && self.log[insert].term == args.entries[incoming].term
                {
                    insert += 1;
                    incoming += 1;
                }

                if incoming < args.entries.len() {
                    self.log.truncate(insert);
                    for entry in &args.entries[incoming..] {
                        self.log.push(entry.clone());
                    }
                    for position in insert..self.log.len() {
                        self.persist_entry(position);
                    }
                    tracing::debug!(
                        node_id = self.id,
                        from = insert,
                        count = args.entries.len() - incoming,
                        chosen_id = args.chosen_id,
                        "replicated entries"
                    );
                }

                if args.leader_commit > self.commit_index {
                    self.commit_index = std::cmp::min(args.leader_commit, self.log_len() - 1);
                    tracing::debug!(
                        node_id = self.id,
                        commit_index = self.commit_index,
                        "commit index advanced from leader"
                    );
                    self.commit_ready.notify_one();
                }
            } else {
                // No match for prev_log_index/prev_log_term. Populate
                // conflict hints so the leader can skip over the whole
                // mismatched term run instead of probing one entry at a time.
                if args.prev_log_index >= self.log_len() {
                    conflict_index = self.log_len();
                    conflict_term = -1;
                } else {
                    conflict_term = self.log[args.prev_log_index as usize].term;
                    let mut i = args.prev_log_index - 1;
                    while i >= 0 && self.log[i as usize].term == conflict_term {
                        i -= 1;
                    }
                    conflict_index = i + 1;
                }
            }
        }

        AppendEntriesResult {
            term: self.current_term,
            success,
            conflict_index,
            conflict_term,
        }
    }

    /// Handle an AppendEntries reply on the leader. `next_index_snapshot`
    /// and `sent` describe the round this reply belongs to. Returns true
    /// when the reply advanced the commit index.
    pub fn handle_append_entries_result(
        &mut self,
        peer_id: u64,
        next_index_snapshot: i64,
        sent: usize,
        result: &AppendEntriesResult,
    ) -> bool {
        if result.term > self.current_term {
            tracing::debug!(node_id = self.id, "term out of date in append reply");
            self.become_follower(result.term);
            return false;
        }

        if self.state != RaftState::Leader || result.term != self.current_term {
            return false;
        }

        if result.success {
            let next = next_index_snapshot + sent as i64;
            self.next_index.insert(peer_id, next);
            self.match_index.insert(peer_id, next - 1);

            let saved_commit_index = self.commit_index;
            for i in (self.commit_index + 1)..self.log_len() {
                // Only entries from the current term advance the commit
                // index through the majority rule
                if self.log[i as usize].term != self.current_term {
                    continue;
                }
                let replicated =
                    1 + self.match_index.values().filter(|&&m| m >= i).count();
                if replicated >= self.majority() {
                    self.commit_index = i;
                }
            }

            if self.commit_index != saved_commit_index {
                tracing::debug!(
                    node_id = self.id,
                    commit_index = self.commit_index,
                    "leader advanced commit index"
                );
                self.commit_ready.notify_one();
                self.trigger_append.notify_one();
                return true;
            }
        } else if result.conflict_term >= 0 {
            // Follower told us which term run conflicts; jump past our last
            // entry of that term if we have one, else to its first index
            let mut last_index_of_term = -1;
            for i in (0..self.log_len()).rev() {
                if self.log[i as usize].term == result.conflict_term {
                    last_index_of_term = i;
                    break;
                }
            }
            if last_index_of_term >= 0 {
                self.next_index.insert(peer_id, last_index_of_term + 1);
            } else {
                self.next_index.insert(peer_id, result.conflict_index);
            }
        } else if result.conflict_index >= 0 {
            self.next_index.insert(peer_id, result.conflict_index);
        }

        false
    }

    // === Submit path and placement ===

    /// Pick the peer with the lowest reported load level, breaking ties
    /// uniformly at random among the minima
    pub fn min_load_peer(&self) -> u64 {
        use rand::Rng;

        let Some(&min) = self.load_level_map.values().min() else {
            return self.id;
        };
        let minima: Vec<u64> = self
            .load_level_map
            .iter()
            .filter(|&(_, &level)| level == min)
            .map(|(&peer_id, _)| peer_id)
            .collect();
        minima[rand::rng().random_range(0..minima.len())]
    }

    /// Submit a command. On the leader this appends, persists, and sets the
    /// replication trigger, returning the new entry. On any other role the
    /// command is ignored and None is returned; the client retries elsewhere.
    pub fn submit(&mut self, command: ServiceCommand) -> Option<LogEntry> {
        if self.state != RaftState::Leader {
            return None;
        }

        let chosen_id = self.min_load_peer();
        let entry = LogEntry {
            command,
            term: self.current_term,
            leader_id: self.id,
            index: self.log_len(),
            chosen_id,
        };
        self.log.push(entry.clone());
        self.persist_entry(entry.index as usize);
        tracing::debug!(
            node_id = self.id,
            index = entry.index,
            term = entry.term,
            chosen_id,
            "appended command"
        );
        self.trigger_append.notify_one();
        Some(entry)
    }

    // === Commit dispatch ===

    /// Drain entries that are committed but not yet dispatched, advancing
    /// `last_applied`. Called by the commit dispatcher under the lock; the
    /// returned entries are sent on the commit channel outside it.
    pub fn take_committed_entries(&mut self) -> Vec<CommitEntry> {
        let mut entries = Vec::new();
        while self.last_applied < self.commit_index {
            self.last_applied += 1;
            let entry = &self.log[self.last_applied as usize];
            entries.push(CommitEntry {
                command: entry.command.clone(),
                index: entry.index,
                term: entry.term,
                chosen_id: entry.chosen_id,
            });
        }
        entries
    }

    // === Peer directory ===

    /// Add a peer to the directory (no-op if already present)
    pub fn connect_peer(&mut self, peer_id: u64) {
        if !self.peers.contains(&peer_id) {
            self.peers.push(peer_id);
        }
    }

    /// Remove a peer from the directory
    pub fn disconnect_peer(&mut self, peer_id: u64) {
        self.peers.retain(|&p| p != peer_id);
        self.next_index.remove(&peer_id);
        self.match_index.remove(&peer_id);
    }

    /// Report id, term, and leadership (for status endpoints)
    pub fn report(&self) -> (u64, i64, bool) {
        (self.id, self.current_term, self.state == RaftState::Leader)
    }
}
