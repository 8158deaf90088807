//! File-based storage implementation for durable node state
//!
//! Stores state in two files within a directory:
//! - `meta` - Term/VotedFor header, a single JSON object carrying its own
//!   SHA-512 checksum (same scheme as the records)
//! - `records` - Record sequence (JSON lines, one record per log position)
//!
//! Every piece of durable data self-checksums, so a torn write surfaces as
//! corruption on the next read instead of silently wrong state.

use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha512};

use super::{DurableRecord, Storage, StorageError, TERM_SCALAR, VOTED_FOR_SCALAR};

/// On-disk header holding the Term/VotedFor scalars
#[derive(Debug, Clone, Serialize, Deserialize)]
struct MetaHeader {
    #[serde(rename = "Term")]
    term: String,
    #[serde(rename = "VotedFor")]
    voted_for: String,
    checksum: String,
}

impl MetaHeader {
    fn new(term: &str, voted_for: &str) -> Self {
        let mut header = MetaHeader {
            term: term.to_string(),
            voted_for: voted_for.to_string(),
            checksum: String::new(),
        };
        header.checksum = header.compute_checksum();
        header
    }

    fn compute_checksum(&self) -> String {
        let input = format!("{}{}", self.term, self.voted_for);
        hex::encode(Sha512::digest(input.as_bytes()))
    }

    fn verify(&self) -> bool {
        self.checksum == self.compute_checksum()
    }
}

/// File-based storage implementation
pub struct FileStorage {
    dir: PathBuf,
    record_count: usize,
}

impl FileStorage {
    /// Open (or create) storage in the given directory
    pub fn new<P: AsRef<Path>>(dir: P) -> Result<Self, StorageError> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir).map_err(|e| StorageError::Io(e.to_string()))?;
        let mut storage = FileStorage { dir, record_count: 0 };
        storage.record_count = storage.read_records()?.len();
        Ok(storage)
    }

    fn meta_path(&self) -> PathBuf {
        self.dir.join("meta")
    }

    fn records_path(&self) -> PathBuf {
        self.dir.join("records")
    }

    /// Replace a file's contents through a sibling swap file: write, fsync,
    /// rename over the target, then fsync the directory so the rename
    /// itself is durable. A crash mid-write leaves the old version intact.
    fn swap_in(&self, path: &Path, bytes: &[u8]) -> Result<(), StorageError> {
        let swap_path = path.with_extension("swap");

        let mut swap = File::create(&swap_path).map_err(|e| StorageError::Io(e.to_string()))?;
        swap.write_all(bytes)
            .map_err(|e| StorageError::Io(e.to_string()))?;
        swap.sync_all().map_err(|e| StorageError::Io(e.to_string()))?;

        fs::rename(&swap_path, path).map_err(|e| StorageError::Io(e.to_string()))?;
        File::open(&self.dir)
            .and_then(|dir| dir.sync_all())
            .map_err(|e| StorageError::Io(e.to_string()))?;

        Ok(())
    }

    fn write_meta(&self, term: &str, voted_for: &str) -> Result<(), StorageError> {
        let header = MetaHeader::new(term, voted_for);
        let json = serde_json::to_string(&header)
            .map_err(|e| StorageError::Io(format!("serialization error: {}", e)))?;
        self.swap_in(&self.meta_path(), json.as_bytes())
    }

    fn read_meta(&self) -> Result<Option<MetaHeader>, StorageError> {
        let path = self.meta_path();
        if !path.exists() {
            return Ok(None);
        }

        let contents = fs::read_to_string(&path).map_err(|e| StorageError::Io(e.to_string()))?;
        if contents.trim().is_empty() {
            return Ok(None);
        }

        let header: MetaHeader = serde_json::from_str(contents.trim()).map_err(|e| {
            StorageError::Corruption(format!("meta header at {:?} is not valid JSON: {}", path, e))
        })?;
        if !header.verify() {
            return Err(StorageError::Corruption(format!(
                "meta header at {:?} failed its checksum",
                path
            )));
        }

        Ok(Some(header))
    }

    /// Parse the records file without checksum verification (verification
    /// happens in `all_records` so a corrupted tail fails restore, not open)
    fn read_records(&self) -> Result<Vec<DurableRecord>, StorageError> {
        let path = self.records_path();
        if !path.exists() {
            return Ok(Vec::new());
        }

        let file = File::open(&path).map_err(|e| StorageError::Io(e.to_string()))?;
        let reader = BufReader::new(file);
        let mut records = Vec::new();

        for (line_num, line) in reader.lines().enumerate() {
            let line = line.map_err(|e| StorageError::Io(e.to_string()))?;
            if line.trim().is_empty() {
                continue;
            }
            let record: DurableRecord = serde_json::from_str(&line).map_err(|e| {
                StorageError::Corruption(format!("invalid record at line {}: {}", line_num + 1, e))
            })?;
            records.push(record);
        }

        Ok(records)
    }

    fn append_record(&self, record: &DurableRecord) -> Result<(), StorageError> {
        let json = serde_json::to_string(record)
            .map_err(|e| StorageError::Io(format!("serialization error: {}", e)))?;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.records_path())
            .map_err(|e| StorageError::Io(e.to_string()))?;
        writeln!(file, "{}", json).map_err(|e| StorageError::Io(e.to_string()))?;
        file.sync_all().map_err(|e| StorageError::Io(e.to_string()))?;
        Ok(())
    }

    /// Rewrite the records file keeping positions `< position`, then append
    fn truncate_and_append(
        &self,
        position: usize,
        record: &DurableRecord,
    ) -> Result<(), StorageError> {
        let keep = self.read_records()?;
        let mut content = String::new();
        for existing in keep.iter().take(position) {
            let json = serde_json::to_string(existing)
                .map_err(|e| StorageError::Io(format!("serialization error: {}", e)))?;
            content.push_str(&json);
            content.push('\n');
        }
        let json = serde_json::to_string(record)
            .map_err(|e| StorageError::Io(format!("serialization error: {}", e)))?;
        content.push_str(&json);
        content.push('\n');

        self.swap_in(&self.records_path(), content.as_bytes())
    }
}

impl Storage for FileStorage {
    fn has_data(&self) -> Result<bool, StorageError> {
        Ok(self.meta_path().exists())
    }

    fn get(&self, name: &str) -> Result<Option<String>, StorageError> {
        let header = self.read_meta()?;
        Ok(header.and_then(|header| match name {
            TERM_SCALAR => Some(header.term),
            VOTED_FOR_SCALAR => Some(header.voted_for),
            _ => None,
        }))
    }

    fn put(&mut self, record: &DurableRecord) -> Result<(), StorageError> {
        if record.command.is_some() {
            let position = record.position()? as usize;
            if position > self.record_count {
                return Err(StorageError::Corruption(format!(
                    "record position {} beyond record count {}",
                    position, self.record_count
                )));
            }
            if position < self.record_count {
                self.truncate_and_append(position, record)?;
            } else {
                self.append_record(record)?;
            }
            self.record_count = position + 1;
        } else {
            self.write_meta(&record.term, &record.voted_for)?;
        }
        Ok(())
    }

    fn all_records(&self) -> Result<Vec<DurableRecord>, StorageError> {
        let records = self.read_records()?;
        for (position, record) in records.iter().enumerate() {
            if !record.verify() {
                return Err(StorageError::Corruption(format!(
                    "checksum mismatch for record {} (position {})",
                    record.id, position
                )));
            }
        }
        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::raft_core::{ServiceCommand, ServiceKind};
    use tempfile::TempDir;

    fn test_storage() -> (FileStorage, TempDir) {
        let dir = TempDir::new().unwrap();
        let storage = FileStorage::new(dir.path()).unwrap();
        (storage, dir)
    }

    fn command(n: u32) -> ServiceCommand {
        ServiceCommand {
            service_id: format!("svc-{:058}", n),
            kind: ServiceKind::Deploy,
        }
    }

    #[test]
    fn test_file_storage_fresh_has_no_data() {
        let (storage, _dir) = test_storage();
        assert!(!storage.has_data().unwrap());
        assert_eq!(storage.get(TERM_SCALAR).unwrap(), None);
        assert!(storage.all_records().unwrap().is_empty());
    }

    #[test]
    fn test_file_storage_scalars() {
        let (mut storage, _dir) = test_storage();

        storage.put(&DurableRecord::new(0, 5, None, -1, -1, 2)).unwrap();

        assert!(storage.has_data().unwrap());
        assert_eq!(storage.get(TERM_SCALAR).unwrap().as_deref(), Some("5"));
        assert_eq!(storage.get(VOTED_FOR_SCALAR).unwrap().as_deref(), Some("2"));

        storage.put(&DurableRecord::new(0, 100, None, -1, -1, -1)).unwrap();
        assert_eq!(storage.get(TERM_SCALAR).unwrap().as_deref(), Some("100"));
        assert_eq!(storage.get(VOTED_FOR_SCALAR).unwrap().as_deref(), Some("-1"));
    }

    #[test]
    fn test_meta_header_checksum() {
        let header = MetaHeader::new("7", "-1");
        assert!(header.verify());

        let mut tampered = header.clone();
        tampered.term = "8".to_string();
        assert!(!tampered.verify());
    }

    #[test]
    fn test_file_storage_records() {
        let (mut storage, _dir) = test_storage();

        storage
            .put(&DurableRecord::new(0, 1, Some(command(1)), 1, 2, 1))
            .unwrap();
        storage
            .put(&DurableRecord::new(1, 1, Some(command(2)), 1, 3, 1))
            .unwrap();

        let records = storage.all_records().unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(
            records[0].command.as_ref().unwrap().service_id,
            command(1).service_id
        );
        assert_eq!(records[1].chosen_value().unwrap(), 3);
    }

    #[test]
    fn test_file_storage_put_truncates_tail() {
        let (mut storage, _dir) = test_storage();

        for i in 0..3u64 {
            storage
                .put(&DurableRecord::new(i, 1, Some(command(i as u32)), 1, 2, 1))
                .unwrap();
        }

        storage
            .put(&DurableRecord::new(1, 2, Some(command(9)), 2, 4, 2))
            .unwrap();

        let records = storage.all_records().unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].term_value().unwrap(), 1);
        assert_eq!(records[1].term_value().unwrap(), 2);
    }

    #[test]
    fn test_file_storage_persistence_across_instances() {
        let dir = TempDir::new().unwrap();

        // First instance - write data
        {
            let mut storage = FileStorage::new(dir.path()).unwrap();
            storage.put(&DurableRecord::new(0, 42, None, -1, -1, 7)).unwrap();
            storage
                .put(&DurableRecord::new(0, 42, Some(command(1)), 1, 2, 7))
                .unwrap();
        }

        // Second instance - read data (simulates restart)
        {
            let storage = FileStorage::new(dir.path()).unwrap();
            assert_eq!(storage.get(TERM_SCALAR).unwrap().as_deref(), Some("42"));
            assert_eq!(storage.get(VOTED_FOR_SCALAR).unwrap().as_deref(), Some("7"));
            let records = storage.all_records().unwrap();
            assert_eq!(records.len(), 1);
            assert!(records[0].verify());
        }
    }

    #[test]
    fn test_detects_tampered_meta() {
        let dir = TempDir::new().unwrap();
        let mut storage = FileStorage::new(dir.path()).unwrap();

        storage.put(&DurableRecord::new(0, 42, None, -1, -1, -1)).unwrap();

        // Change the term without recomputing the header checksum
        let path = dir.path().join("meta");
        let tampered = fs::read_to_string(&path)
            .unwrap()
            .replace("\"Term\":\"42\"", "\"Term\":\"43\"");
        fs::write(&path, tampered).unwrap();

        assert!(matches!(
            storage.get(TERM_SCALAR),
            Err(StorageError::Corruption(_))
        ));
    }

    #[test]
    fn test_detects_garbage_meta() {
        let dir = TempDir::new().unwrap();
        let mut storage = FileStorage::new(dir.path()).unwrap();

        storage.put(&DurableRecord::new(0, 42, None, -1, -1, -1)).unwrap();
        fs::write(dir.path().join("meta"), "not a header\n").unwrap();

        assert!(matches!(
            storage.get(TERM_SCALAR),
            Err(StorageError::Corruption(_))
        ));
    }

    #[test]
    fn test_detects_corrupted_record() {
        let dir = TempDir::new().unwrap();
        let mut storage = FileStorage::new(dir.path()).unwrap();

        storage
            .put(&DurableRecord::new(0, 1, Some(command(1)), 1, 2, 1))
            .unwrap();

        // Flip the stored term without recomputing the checksum
        let path = dir.path().join("records");
        let tampered = fs::read_to_string(&path)
            .unwrap()
            .replace("\"Term\":\"1\"", "\"Term\":\"2\"");
        fs::write(&path, tampered).unwrap();

        assert!(matches!(
            storage.all_records(),
            Err(StorageError::Corruption(_))
        ));
    }

    #[test]
    fn test_record_checksum_stable_across_serialization() {
        let record = DurableRecord::new(2, 3, Some(command(5)), 1, 4, 2);
        assert_eq!(record.id, "2");
        assert!(record.verify());

        let json = serde_json::to_string(&record).unwrap();
        let parsed: DurableRecord = serde_json::from_str(&json).unwrap();
        assert!(parsed.verify());
        assert_eq!(parsed.checksum, record.checksum);
    }
}
