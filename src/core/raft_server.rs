//! RaftServer - event loop driving timers, elections, and the commit path
//!
//! Owns the background tasks of one node: the main select loop (heartbeat
//! ticks, randomized election deadline, client commands, replication
//! trigger), the commit dispatcher, and the load probe.

use std::pin::pin;
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::{mpsc, oneshot, Notify};
use tokio::time::{interval, sleep_until, Duration, Instant, MissedTickBehavior};

use super::config::RaftConfig;
use super::raft_core::{CommitEntry, ConsensusCore, LogEntry, RaftState, ServiceCommand};
use super::raft_node::{RaftNode, SharedCore};
use crate::load::{LoadProbe, SystemLoadProbe};
use crate::transport::{Transport, TransportError};

/// Errors surfaced to clients of a node
#[derive(Debug, Clone, Error)]
pub enum RaftError {
    /// This node is not the leader (includes leader hint if known)
    #[error("not the leader (known leader: {leader_hint:?})")]
    NotLeader { leader_hint: Option<u64> },
    /// The node is shutting down
    #[error("node stopped")]
    Stopped,
    /// Transport error occurred
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),
}

/// Command sent to the RaftServer from clients
enum Command {
    /// Submit a command to be replicated; replies with the appended entry
    Submit {
        command: ServiceCommand,
        reply: oneshot::Sender<Result<LogEntry, RaftError>>,
    },
    /// Force an election now (or restart heartbeats when already leader)
    Resume,
    /// Suspend the leader's replication driver
    Pause,
}

/// Handle for interacting with a running RaftServer
#[derive(Clone)]
pub struct RaftHandle {
    command_tx: mpsc::Sender<Command>,
    shutdown_tx: mpsc::Sender<()>,
}

impl RaftHandle {
    /// Submit a command to the cluster. Returns the appended log entry once
    /// it is persisted on the leader; the commit arrives later on the
    /// commit channel (or never - callers keep their own retry timer).
    pub async fn submit(&self, command: ServiceCommand) -> Result<LogEntry, RaftError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.command_tx
            .send(Command::Submit {
                command,
                reply: reply_tx,
            })
            .await
            .map_err(|_| RaftError::Stopped)?;

        reply_rx.await.map_err(|_| RaftError::Stopped)?
    }

    /// Signal readiness: start an election immediately
    pub async fn resume(&self) {
        let _ = self.command_tx.send(Command::Resume).await;
    }

    /// Suspend the replication driver
    pub async fn pause(&self) {
        let _ = self.command_tx.send(Command::Pause).await;
    }

    /// Shut the node down
    pub async fn shutdown(&self) {
        let _ = self.shutdown_tx.send(()).await;
    }
}

/// Server for a single node: wires the core, the transport, the commit
/// channel, and the load probe together
pub struct RaftServer<T: Transport> {
    node: RaftNode<T>,
    command_rx: mpsc::Receiver<Command>,
    command_tx: mpsc::Sender<Command>,
    shutdown_rx: mpsc::Receiver<()>,
    shutdown_tx: mpsc::Sender<()>,
    commit_tx: mpsc::Sender<CommitEntry>,
    commit_ready: Arc<Notify>,
    trigger_append: Arc<Notify>,
    probe: Option<Box<dyn LoadProbe>>,
    config: RaftConfig,
    paused: bool,
}

impl<T: Transport + 'static> RaftServer<T> {
    /// Create a server with the default config and the system load probe.
    /// Committed entries are delivered on `commit_tx` in index order,
    /// exactly once.
    pub fn new(
        core: ConsensusCore,
        transport: T,
        commit_tx: mpsc::Sender<CommitEntry>,
    ) -> (Self, SharedCore) {
        Self::with_config(
            core,
            transport,
            commit_tx,
            RaftConfig::default(),
            Box::new(SystemLoadProbe::new()),
        )
    }

    /// Create a server with a custom config and load probe
    pub fn with_config(
        mut core: ConsensusCore,
        transport: T,
        commit_tx: mpsc::Sender<CommitEntry>,
        config: RaftConfig,
        probe: Box<dyn LoadProbe>,
    ) -> (Self, SharedCore) {
        core.vote_delay_base = config.vote_delay_base;
        let commit_ready = core.commit_ready();
        let trigger_append = core.trigger_append();
        let (command_tx, command_rx) = mpsc::channel(32);
        let (shutdown_tx, shutdown_rx) = mpsc::channel(1);
        let node = RaftNode::new(core, transport);
        let shared_core = node.shared_core();
        let server = Self {
            node,
            command_rx,
            command_tx,
            shutdown_rx,
            shutdown_tx,
            commit_tx,
            commit_ready,
            trigger_append,
            probe: Some(probe),
            config,
            paused: false,
        };
        (server, shared_core)
    }

    /// Start the server and its background tasks, returning the handle
    pub fn start(self) -> RaftHandle {
        let handle = RaftHandle {
            command_tx: self.command_tx.clone(),
            shutdown_tx: self.shutdown_tx.clone(),
        };

        tokio::spawn(self.run());

        handle
    }

    /// Main server loop
    async fn run(mut self) {
        let shared_core = self.node.shared_core();

        tokio::spawn(run_commit_dispatcher(
            shared_core.clone(),
            self.commit_ready.clone(),
            self.commit_tx.clone(),
        ));
        if let Some(probe) = self.probe.take() {
            tokio::spawn(run_load_probe(
                shared_core.clone(),
                probe,
                self.config.load_probe_interval,
            ));
        }

        let trigger = self.trigger_append.clone();
        let mut heartbeat_interval = interval(self.config.heartbeat_interval);
        // Delay behavior keeps missed ticks from starving the other branches
        heartbeat_interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let election_timeout = self.config.random_election_timeout();

        loop {
            let (state, election_deadline) = {
                let core = shared_core.lock().await;
                (core.state, core.election_reset_at + election_timeout)
            };
            if state == RaftState::Dead {
                break;
            }
            let election_sleep = pin!(sleep_until(election_deadline));

            tokio::select! {
                _ = self.shutdown_rx.recv() => {
                    shared_core.lock().await.stop();
                    break;
                }
                Some(cmd) = self.command_rx.recv() => {
                    match cmd {
                        Command::Submit { command, reply } => {
                            let result = self.handle_submit(command).await;
                            let _ = reply.send(result);
                        }
                        Command::Resume => {
                            self.paused = false;
                            if self.node.state().await == RaftState::Leader {
                                self.node.broadcast_append_entries().await;
                            } else {
                                self.run_election().await;
                            }
                        }
                        Command::Pause => {
                            self.paused = true;
                        }
                    }
                }
                // Replication trigger: submit or commit advance
                _ = trigger.notified() => {
                    if !self.paused && self.node.state().await == RaftState::Leader {
                        self.node.broadcast_append_entries().await;
                    }
                }
                // Heartbeat round when leading
                _ = heartbeat_interval.tick() => {
                    if !self.paused && self.node.state().await == RaftState::Leader {
                        // A leader never times itself out
                        shared_core.lock().await.election_reset_at = Instant::now();
                        self.node.broadcast_append_entries().await;
                    }
                }
                // Election deadline: nothing heard from a leader in time.
                // Also re-runs a candidate that got neither a majority nor
                // a higher-term reply, at term+1.
                _ = election_sleep => {
                    let core = shared_core.lock().await;
                    let timed_out = Instant::now() >= core.election_reset_at + election_timeout;
                    let state = core.state;
                    drop(core);
                    if timed_out
                        && state != RaftState::Leader
                        && state != RaftState::Dead
                        && !self.paused
                    {
                        self.run_election().await;
                    }
                }
                else => break,
            }
        }
    }

    /// Run one election round; on a win, assert leadership immediately
    async fn run_election(&self) {
        self.node.start_election().await;
        if self.node.request_votes().await {
            self.node.broadcast_append_entries().await;
        }
    }

    /// Append a client command on the leader; replication is triggered by
    /// the core and picked up by the select loop
    async fn handle_submit(&self, command: ServiceCommand) -> Result<LogEntry, RaftError> {
        let shared_core = self.node.shared_core();
        let mut core = shared_core.lock().await;
        match core.submit(command) {
            Some(entry) => Ok(entry),
            None => Err(RaftError::NotLeader {
                leader_hint: core.current_leader,
            }),
        }
    }

    /// Current role (test hook)
    pub async fn state(&self) -> RaftState {
        self.node.state().await
    }
}

/// Commit dispatcher: waits for wakeups, drains newly committed entries
/// under the lock, and emits them on the commit channel outside it. Strictly
/// ascending by index, exactly once. Exits when the node is Dead or the
/// application dropped its receiver.
async fn run_commit_dispatcher(
    core: SharedCore,
    commit_ready: Arc<Notify>,
    commit_tx: mpsc::Sender<CommitEntry>,
) {
    loop {
        commit_ready.notified().await;
        let (entries, dead) = {
            let mut core = core.lock().await;
            (core.take_committed_entries(), core.state == RaftState::Dead)
        };
        for entry in entries {
            if commit_tx.send(entry).await.is_err() {
                return;
            }
        }
        if dead {
            return;
        }
    }
}

/// Load probe driver: samples the host load level periodically and stores
/// it on the core. Exits once the node is Dead.
async fn run_load_probe(core: SharedCore, probe: Box<dyn LoadProbe>, period: Duration) {
    let mut tick = interval(period);
    tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tick.tick().await;
        let level = probe.sample().clamp(1, 10);
        let mut core = core.lock().await;
        if core.state == RaftState::Dead {
            return;
        }
        core.load_level = level;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::raft_core::ServiceKind;
    use crate::load::FixedLoadProbe;
    use crate::storage::memory::MemoryStorage;
    use crate::transport::inmemory::create_cluster;
    use tokio::sync::Mutex;

    fn new_test_core(id: u64, peers: Vec<u64>) -> ConsensusCore {
        ConsensusCore::new(id, peers, Box::new(MemoryStorage::new()))
    }

    fn command(name: &str) -> ServiceCommand {
        ServiceCommand {
            service_id: format!("{:0<64}", name),
            kind: ServiceKind::Deploy,
        }
    }

    fn test_config() -> RaftConfig {
        RaftConfig::default()
            .with_heartbeat_interval(Duration::from_millis(50))
            .with_election_timeout(Duration::from_millis(150), Duration::from_millis(300))
    }

    fn new_test_server(
        id: u64,
        peers: Vec<u64>,
        transport: crate::transport::inmemory::InMemoryTransport,
    ) -> (
        RaftServer<crate::transport::inmemory::InMemoryTransport>,
        SharedCore,
        mpsc::Receiver<CommitEntry>,
    ) {
        let (commit_tx, commit_rx) = mpsc::channel(16);
        let (server, shared) = RaftServer::with_config(
            new_test_core(id, peers),
            transport,
            commit_tx,
            test_config(),
            Box::new(FixedLoadProbe::new(5)),
        );
        (server, shared, commit_rx)
    }

    #[tokio::test]
    async fn test_submit_rejected_when_not_leader() {
        use crate::transport::inmemory::create_cluster_with_timeout;

        // Timeout transport keeps background elections from blocking the
        // command loop while no peer responds
        let node_ids = vec![1, 2, 3];
        let (mut transports, _handles) =
            create_cluster_with_timeout(&node_ids, Some(Duration::from_millis(100)));

        let (server, _shared, _commit_rx) =
            new_test_server(1, vec![2, 3], transports.remove(&1).unwrap());
        let handle = server.start();

        let result = handle.submit(command("x")).await;
        assert!(matches!(result, Err(RaftError::NotLeader { .. })));
    }

    #[tokio::test]
    async fn test_resume_forces_immediate_election() {
        let node_ids = vec![1, 2];
        let (mut transports, mut handles) = create_cluster(&node_ids);

        let (server, shared1, _commit_rx) =
            new_test_server(1, vec![2], transports.remove(&1).unwrap());
        let shared2 = Arc::new(Mutex::new(new_test_core(2, vec![1])));

        let handle = server.start();

        let mut handle2 = handles.remove(&2).unwrap();
        let shared2_clone = shared2.clone();
        tokio::spawn(async move {
            while handle2.process_one_shared(&shared2_clone).await {}
        });

        handle.resume().await;
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert_eq!(shared1.lock().await.state, RaftState::Leader);
        assert_eq!(shared2.lock().await.voted_for, Some(1));
        handle.shutdown().await;
    }

    #[tokio::test]
    async fn test_commit_channel_delivers_exactly_once() {
        let node_ids = vec![1, 2];
        let (mut transports, mut handles) = create_cluster(&node_ids);

        let (server, _shared1, mut commit_rx) =
            new_test_server(1, vec![2], transports.remove(&1).unwrap());
        let shared2 = Arc::new(Mutex::new(new_test_core(2, vec![1])));

        let handle = server.start();

        // Keep node 2 responsive in the background
        let mut handle2 = handles.remove(&2).unwrap();
        let shared2_clone = shared2.clone();
        let responder = tokio::spawn(async move {
            while handle2.process_one_shared(&shared2_clone).await {}
        });

        handle.resume().await;
        tokio::time::sleep(Duration::from_millis(100)).await;

        let entry = handle.submit(command("x")).await.unwrap();
        assert_eq!(entry.index, 0);

        let committed = tokio::time::timeout(Duration::from_secs(2), commit_rx.recv())
            .await
            .expect("commit did not arrive")
            .unwrap();
        assert_eq!(committed.index, 0);
        assert_eq!(committed.command, command("x"));

        // No duplicate delivery
        let dup = tokio::time::timeout(Duration::from_millis(200), commit_rx.recv()).await;
        assert!(dup.is_err());

        handle.shutdown().await;
        responder.abort();
    }

    #[tokio::test]
    async fn test_election_timeout_elects_leader() {
        let node_ids = vec![1, 2];
        let (mut transports, mut handles) = create_cluster(&node_ids);

        let (server, shared1, _commit_rx) =
            new_test_server(1, vec![2], transports.remove(&1).unwrap());
        let shared2 = Arc::new(Mutex::new(new_test_core(2, vec![1])));

        let _handle = server.start();

        let mut handle2 = handles.remove(&2).unwrap();
        let shared2_clone = shared2.clone();
        let responder = tokio::spawn(async move {
            while handle2.process_one_shared(&shared2_clone).await {}
        });

        // No resume signal: the randomized election timeout must fire
        tokio::time::sleep(Duration::from_millis(600)).await;

        assert_eq!(shared1.lock().await.state, RaftState::Leader);
        responder.abort();
    }

    #[tokio::test]
    async fn test_shutdown_closes_commit_dispatcher() {
        use crate::transport::inmemory::create_cluster_with_timeout;

        let node_ids = vec![1, 2];
        let (mut transports, _handles) =
            create_cluster_with_timeout(&node_ids, Some(Duration::from_millis(100)));

        let (server, shared1, mut commit_rx) =
            new_test_server(1, vec![2], transports.remove(&1).unwrap());
        let handle = server.start();

        handle.shutdown().await;
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(shared1.lock().await.state, RaftState::Dead);
        // Dispatcher exited: the channel reports closed
        assert!(commit_rx.recv().await.is_none());
    }
}
