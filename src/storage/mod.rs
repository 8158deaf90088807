//! Storage layer for durable node state
//!
//! - `MemoryStorage`: Fast, in-memory storage for testing
//! - `FileStorage`: File-based storage (metadata header + record sequence)

pub mod file;
pub mod memory;
pub mod traits;

pub use traits::{DurableRecord, Storage, StorageError, TERM_SCALAR, VOTED_FOR_SCALAR};
