//! Post-commit artifact side channel
//!
//! After a command commits, the chosen peer dials the leader's well-known
//! TCP port, sends the 64-byte ServiceID, receives the artifact bytes, and
//! persists them under `services/<ServiceID>`. Framing is the legacy
//! format: 10-byte I/O chunks with an `END` sentinel terminating each
//! message, and a final `LAST` acknowledgement from the receiver.
//!
//! The leader listens on demand: the listener is created for the first
//! concurrent transfer and closed when the last one completes.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;

/// ServiceIDs are exactly this many bytes on the wire
pub const SERVICE_ID_LEN: usize = 64;

/// Legacy framing buffer size
const CHUNK_SIZE: usize = 10;

const END_SENTINEL: &[u8] = b"END";
const LAST_ACK: &[u8] = b"LAST";

#[derive(Debug, Error)]
pub enum ArtifactError {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error("unknown service {0}")]
    UnknownService(String),
}

/// Write a message in legacy chunks, then the terminating sentinel
async fn send_framed(stream: &mut TcpStream, payload: &[u8]) -> Result<(), ArtifactError> {
    for chunk in payload.chunks(CHUNK_SIZE) {
        stream.write_all(chunk).await?;
    }
    stream.write_all(END_SENTINEL).await?;
    stream.flush().await?;
    Ok(())
}

/// Read a message up to its sentinel. A payload that itself ends in the
/// sentinel bytes is indistinguishable; the legacy format accepts that.
async fn receive_framed(stream: &mut TcpStream) -> Result<Vec<u8>, ArtifactError> {
    let mut message = Vec::new();
    let mut buf = [0u8; CHUNK_SIZE];
    loop {
        let n = stream.read(&mut buf).await?;
        if n == 0 {
            return Err(ArtifactError::Protocol(
                "connection closed before sentinel".to_string(),
            ));
        }
        message.extend_from_slice(&buf[..n]);
        if message.ends_with(END_SENTINEL) {
            message.truncate(message.len() - END_SENTINEL.len());
            return Ok(message);
        }
    }
}

struct ListenerState {
    listener: Option<Arc<TcpListener>>,
    active: usize,
}

/// One node's end of the artifact channel: serves transfers when leading,
/// fetches artifacts when chosen
pub struct ArtifactChannel {
    services_dir: PathBuf,
    port: u16,
    state: Arc<Mutex<ListenerState>>,
}

impl ArtifactChannel {
    pub fn new<P: Into<PathBuf>>(services_dir: P, port: u16) -> Self {
        ArtifactChannel {
            services_dir: services_dir.into(),
            port,
            state: Arc::new(Mutex::new(ListenerState {
                listener: None,
                active: 0,
            })),
        }
    }

    pub fn services_dir(&self) -> &Path {
        &self.services_dir
    }

    /// Leader side: accept and serve exactly one transfer. The listener is
    /// shared by concurrent calls and dropped when the last one finishes.
    /// Returns the ServiceID that was served.
    pub async fn serve_one(&self) -> Result<String, ArtifactError> {
        let listener = {
            let mut state = self.state.lock().await;
            let listener = match state.listener.as_ref() {
                Some(listener) => listener.clone(),
                None => {
                    let listener = Arc::new(TcpListener::bind(("0.0.0.0", self.port)).await?);
                    state.listener = Some(listener.clone());
                    listener
                }
            };
            state.active += 1;
            listener
        };

        let result = self.serve_on(&listener).await;

        let mut state = self.state.lock().await;
        state.active -= 1;
        if state.active == 0 {
            state.listener = None;
        }

        result
    }

    async fn serve_on(&self, listener: &TcpListener) -> Result<String, ArtifactError> {
        let (mut stream, remote) = listener.accept().await?;

        let id_bytes = receive_framed(&mut stream).await?;
        let service_id = parse_service_id(&id_bytes)?;

        let path = self.services_dir.join(&service_id);
        let artifact = tokio::fs::read(&path)
            .await
            .map_err(|_| ArtifactError::UnknownService(service_id.clone()))?;

        send_framed(&mut stream, &artifact).await?;

        let ack = receive_framed(&mut stream).await?;
        if ack != LAST_ACK {
            return Err(ArtifactError::Protocol(format!(
                "expected LAST acknowledgement, got {} bytes",
                ack.len()
            )));
        }

        tracing::info!(service_id = %service_id, peer = %remote, bytes = artifact.len(), "served artifact");
        Ok(service_id)
    }

    /// Chosen side: dial the leader, fetch the artifact, and persist it
    /// under `services/<ServiceID>`
    pub async fn fetch(&self, leader_host: &str, service_id: &str) -> Result<(), ArtifactError> {
        if service_id.len() != SERVICE_ID_LEN {
            return Err(ArtifactError::Protocol(format!(
                "service id must be {} bytes, got {}",
                SERVICE_ID_LEN,
                service_id.len()
            )));
        }

        let mut stream = TcpStream::connect((leader_host, self.port)).await?;

        send_framed(&mut stream, service_id.as_bytes()).await?;
        let artifact = receive_framed(&mut stream).await?;
        send_framed(&mut stream, LAST_ACK).await?;

        tokio::fs::create_dir_all(&self.services_dir).await?;
        tokio::fs::write(self.services_dir.join(service_id), &artifact).await?;

        tracing::info!(service_id = %service_id, bytes = artifact.len(), "fetched artifact");
        Ok(())
    }
}

fn parse_service_id(bytes: &[u8]) -> Result<String, ArtifactError> {
    if bytes.len() != SERVICE_ID_LEN {
        return Err(ArtifactError::Protocol(format!(
            "service id must be {} bytes, got {}",
            SERVICE_ID_LEN,
            bytes.len()
        )));
    }
    let id = String::from_utf8(bytes.to_vec())
        .map_err(|_| ArtifactError::Protocol("service id is not valid UTF-8".to_string()))?;
    if id.contains('/') || id.contains('\\') || id.contains("..") {
        return Err(ArtifactError::Protocol("service id contains path separators".to_string()));
    }
    Ok(id)
}
