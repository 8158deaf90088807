//! Storage abstraction for durable node state
//!
//! Raft requires certain state to be persisted to stable storage before
//! responding to RPCs: the current term, the vote cast in that term, and the
//! log contents. The adapter is record-oriented: every log position maps to
//! one checksummed record, and the `Term`/`VotedFor` scalars are kept in a
//! small metadata header.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha512};
use thiserror::Error;

use crate::core::raft_core::ServiceCommand;

/// Errors that can occur during storage operations
#[derive(Debug, Clone, Error)]
pub enum StorageError {
    /// I/O error (e.g., disk full, permission denied)
    #[error("i/o error: {0}")]
    Io(String),
    /// Data corruption detected (bad checksum, unparseable record)
    #[error("data corruption: {0}")]
    Corruption(String),
}

/// Scalar name for the persisted current term
pub const TERM_SCALAR: &str = "Term";
/// Scalar name for the persisted vote
pub const VOTED_FOR_SCALAR: &str = "VotedFor";

/// A single durable record.
///
/// One record per log position, plus at most one hard-state record (no
/// command) while the log is still empty. Numeric fields keep their legacy
/// decimal-string form; `id` is the hex-encoded log position. The checksum
/// is a lowercase-hex SHA-512 over the canonical field order Id, Term,
/// Command (ServiceID then Type), Leader, Chosen, VotedFor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DurableRecord {
    #[serde(rename = "Id")]
    pub id: String,
    #[serde(rename = "Term")]
    pub term: String,
    #[serde(rename = "Command", default, skip_serializing_if = "Option::is_none")]
    pub command: Option<ServiceCommand>,
    #[serde(rename = "Leader")]
    pub leader: String,
    #[serde(rename = "Chosen")]
    pub chosen: String,
    #[serde(rename = "VotedFor")]
    pub voted_for: String,
    pub checksum: String,
}

impl DurableRecord {
    /// Build a record for the log position, stamped with the vote in force
    /// at persist time.
    pub fn new(
        position: u64,
        term: i64,
        command: Option<ServiceCommand>,
        leader: i64,
        chosen: i64,
        voted_for: i64,
    ) -> Self {
        let mut record = DurableRecord {
            id: format!("{:x}", position),
            term: term.to_string(),
            command,
            leader: leader.to_string(),
            chosen: chosen.to_string(),
            voted_for: voted_for.to_string(),
            checksum: String::new(),
        };
        record.checksum = record.compute_checksum();
        record
    }

    /// Log position this record describes
    pub fn position(&self) -> Result<u64, StorageError> {
        u64::from_str_radix(&self.id, 16)
            .map_err(|e| StorageError::Corruption(format!("invalid record id {:?}: {}", self.id, e)))
    }

    pub fn term_value(&self) -> Result<i64, StorageError> {
        self.term
            .parse()
            .map_err(|e| StorageError::Corruption(format!("invalid record term {:?}: {}", self.term, e)))
    }

    pub fn leader_value(&self) -> Result<i64, StorageError> {
        self.leader.parse().map_err(|e| {
            StorageError::Corruption(format!("invalid record leader {:?}: {}", self.leader, e))
        })
    }

    pub fn chosen_value(&self) -> Result<i64, StorageError> {
        self.chosen.parse().map_err(|e| {
            StorageError::Corruption(format!("invalid record chosen {:?}: {}", self.chosen, e))
        })
    }

    /// Canonical concatenation the checksum is computed over. The field
    /// order is fixed so stored checksums stay verifiable after restart.
    fn checksum_input(&self) -> String {
        let command = match &self.command {
            Some(c) => format!("{}{}", c.service_id, c.kind),
            None => String::new(),
        };
        format!(
            "{}{}{}{}{}{}",
            self.id, self.term, command, self.leader, self.chosen, self.voted_for
        )
    }

    /// Lowercase-hex SHA-512 over the canonical field concatenation
    pub fn compute_checksum(&self) -> String {
        hex::encode(Sha512::digest(self.checksum_input().as_bytes()))
    }

    /// Verify the stored checksum against the record contents
    pub fn verify(&self) -> bool {
        self.checksum == self.compute_checksum()
    }
}

/// Storage trait for durable node state
///
/// Implementations must ensure durability - data must survive crashes.
/// All operations are synchronous to simplify the consensus logic: return
/// implies the data is on stable storage. The `Send` bound is required for
/// use in async contexts.
pub trait Storage: Send {
    /// Whether any prior state exists (a fresh node returns false)
    fn has_data(&self) -> Result<bool, StorageError>;

    /// Read a named scalar (`Term` or `VotedFor`)
    fn get(&self, name: &str) -> Result<Option<String>, StorageError>;

    /// Persist one record.
    ///
    /// A record without a command refreshes the `Term`/`VotedFor` scalars
    /// only. A record with a command is written at its position: if that
    /// position already holds a record, the tail from there is discarded
    /// first (follower log truncation), otherwise the record is appended.
    fn put(&mut self, record: &DurableRecord) -> Result<(), StorageError>;

    /// All entry records, ordered by position. Checksums are verified; a
    /// mismatch is reported as corruption.
    fn all_records(&self) -> Result<Vec<DurableRecord>, StorageError>;
}
