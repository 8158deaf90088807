//! Node binary
//!
//! Runs a single node with separate ports for cluster transport and client
//! API, plus the artifact side channel.
//!
//! Usage: placeraft-server --id <NODE_ID> --transport-port <PORT>
//!   --api-port <PORT> --data-dir <DIR> --peers <PEER1,PEER2,...>
//!   [--artifact-port <PORT>] [--heartbeat-ms <MS>]
//!
//! Example for a 3-node cluster:
//!   placeraft-server --id 1 --transport-port 8001 --api-port 9001 \
//!     --data-dir /var/lib/placeraft/1 --peers 2=10.0.0.2:8002,3=10.0.0.3:8003
//!
//! Ports:
//!   --transport-port: consensus RPC between nodes (/raft/* endpoints)
//!   --api-port: client requests (/client/* endpoints)
//!   --artifact-port: post-commit artifact transfers (default 4001)

use std::collections::HashMap;
use std::env;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;

use placeraft::api::client_http::create_client_router;
use placeraft::artifact::ArtifactChannel;
use placeraft::core::config::RaftConfig;
use placeraft::core::raft_core::{CommitEntry, ConsensusCore, RaftState};
use placeraft::core::raft_node::SharedCore;
use placeraft::core::raft_server::RaftServer;
use placeraft::load::SystemLoadProbe;
use placeraft::storage::file::FileStorage;
use placeraft::transport::http::{create_router, HttpTransport};

struct Args {
    id: u64,
    transport_port: u16,
    api_port: u16,
    data_dir: String,
    peers: HashMap<u64, String>,
    artifact_port: u16,
    heartbeat_ms: u64,
}

fn parse_args() -> Args {
    let args: Vec<String> = env::args().collect();

    let mut id: Option<u64> = None;
    let mut transport_port: Option<u16> = None;
    let mut api_port: Option<u16> = None;
    let mut data_dir: Option<String> = None;
    let mut peers: HashMap<u64, String> = HashMap::new();
    let mut artifact_port: u16 = 4001;
    let mut heartbeat_ms: u64 = 50;

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--id" => {
                id = Some(args[i + 1].parse().expect("invalid node ID"));
                i += 2;
            }
            "--transport-port" => {
                transport_port = Some(args[i + 1].parse().expect("invalid transport port"));
                i += 2;
            }
            "--api-port" => {
                api_port = Some(args[i + 1].parse().expect("invalid API port"));
                i += 2;
            }
            "--data-dir" => {
                data_dir = Some(args[i + 1].clone());
                i += 2;
            }
            "--peers" => {
                // Format: 2=10.0.0.2:8002,3=10.0.0.3:8003
                for peer_spec in args[i + 1].split(',') {
                    let parts: Vec<&str> = peer_spec.split('=').collect();
                    if parts.len() == 2 {
                        let peer_id: u64 = parts[0].parse().expect("invalid peer ID");
                        peers.insert(peer_id, parts[1].to_string());
                    }
                }
                i += 2;
            }
            "--artifact-port" => {
                artifact_port = args[i + 1].parse().expect("invalid artifact port");
                i += 2;
            }
            "--heartbeat-ms" => {
                heartbeat_ms = args[i + 1].parse().expect("invalid heartbeat interval");
                i += 2;
            }
            other => {
                eprintln!("unknown argument: {}", other);
                i += 1;
            }
        }
    }

    Args {
        id: id.expect("--id is required"),
        transport_port: transport_port.expect("--transport-port is required"),
        api_port: api_port.expect("--api-port is required"),
        data_dir: data_dir.expect("--data-dir is required"),
        peers,
        artifact_port,
        heartbeat_ms,
    }
}

/// Drive the artifact side channel from the commit stream: the leader
/// serves one transfer per entry placed on a peer; the chosen peer fetches
/// from the leader.
async fn run_artifact_driver(
    node_id: u64,
    core: SharedCore,
    channel: Arc<ArtifactChannel>,
    peer_hosts: HashMap<u64, String>,
    mut commit_rx: mpsc::Receiver<CommitEntry>,
) {
    while let Some(entry) = commit_rx.recv().await {
        let (is_leader, leader_id) = {
            let core = core.lock().await;
            (core.state == RaftState::Leader, core.current_leader)
        };

        tracing::info!(
            index = entry.index,
            term = entry.term,
            chosen_id = entry.chosen_id,
            service_id = %entry.command.service_id,
            "command committed"
        );

        if is_leader && entry.chosen_id != node_id {
            let channel = channel.clone();
            tokio::spawn(async move {
                if let Err(err) = channel.serve_one().await {
                    tracing::warn!(error = %err, "artifact transfer failed");
                }
            });
        } else if !is_leader && entry.chosen_id == node_id {
            let Some(leader_id) = leader_id else {
                tracing::warn!(index = entry.index, "chosen but no known leader");
                continue;
            };
            let Some(host) = peer_hosts.get(&leader_id).cloned() else {
                tracing::warn!(leader_id, "no address for leader");
                continue;
            };
            let channel = channel.clone();
            let service_id = entry.command.service_id.clone();
            tokio::spawn(async move {
                // The leader listens on demand; it may be a beat behind us
                for attempt in 1..=5 {
                    match channel.fetch(&host, &service_id).await {
                        Ok(()) => return,
                        Err(err) if attempt < 5 => {
                            tracing::debug!(error = %err, attempt, "artifact fetch retry");
                            tokio::time::sleep(Duration::from_millis(200)).await;
                        }
                        Err(err) => {
                            tracing::warn!(error = %err, service_id = %service_id, "artifact fetch failed");
                        }
                    }
                }
            });
        }
    }
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt::init();

    let args = parse_args();

    tracing::info!(
        node_id = args.id,
        transport_port = args.transport_port,
        api_port = args.api_port,
        data_dir = %args.data_dir,
        peers = ?args.peers,
        "starting node"
    );

    let storage = FileStorage::new(format!("{}/state", args.data_dir))
        .expect("failed to open storage");

    let peer_ids: Vec<u64> = args.peers.keys().copied().collect();
    // Hosts only, for the artifact channel (which has its own port)
    let peer_hosts: HashMap<u64, String> = args
        .peers
        .iter()
        .map(|(&peer_id, addr)| {
            let host = addr.split(':').next().unwrap_or(addr).to_string();
            (peer_id, host)
        })
        .collect();

    let transport = HttpTransport::new(args.peers.clone(), Duration::from_secs(5));
    let core = ConsensusCore::new(args.id, peer_ids, Box::new(storage));

    let config = RaftConfig::default()
        .with_heartbeat_interval(Duration::from_millis(args.heartbeat_ms))
        .with_artifact_port(args.artifact_port);

    let (commit_tx, commit_rx) = mpsc::channel(64);
    let (server, shared_core) = RaftServer::with_config(
        core,
        transport,
        commit_tx,
        config,
        Box::new(SystemLoadProbe::new()),
    );
    let raft_handle = server.start();

    // Artifact side channel, driven by the commit stream
    let artifact = Arc::new(ArtifactChannel::new(
        format!("{}/services", args.data_dir),
        args.artifact_port,
    ));
    tokio::spawn(run_artifact_driver(
        args.id,
        shared_core.clone(),
        artifact,
        peer_hosts,
        commit_rx,
    ));

    let raft_router = create_router(shared_core.clone());
    let client_router = create_client_router(raft_handle, shared_core);

    let transport_addr: SocketAddr = format!("0.0.0.0:{}", args.transport_port).parse().unwrap();
    tracing::info!(addr = %transport_addr, "transport server listening");
    let transport_listener = tokio::net::TcpListener::bind(transport_addr)
        .await
        .expect("failed to bind transport port");
    tokio::spawn(async move {
        axum::serve(transport_listener, raft_router).await.unwrap();
    });

    let api_addr: SocketAddr = format!("0.0.0.0:{}", args.api_port).parse().unwrap();
    tracing::info!(addr = %api_addr, "API server listening");
    let api_listener = tokio::net::TcpListener::bind(api_addr)
        .await
        .expect("failed to bind API port");
    axum::serve(api_listener, client_router).await.unwrap();
}
