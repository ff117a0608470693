//! Error types for the durable log and metadata subsystem.

use raftlog_types::LogIndex;
use thiserror::Error;

/// Errors produced by the segment store, log manager, and metadata journal.
#[derive(Error, Debug)]
pub enum StorageError {
    /// An operation was attempted on a store that has not been opened.
    #[error("store is not open")]
    NotOpen,

    /// The requested log index does not exist in the log.
    #[error("log index {0} not found")]
    NotFound(LogIndex),

    /// The requested index lies outside the log's current `[start, last]` range.
    #[error("log index {0} is out of range [{1}, {2}]")]
    OutOfRange(LogIndex, LogIndex, LogIndex),

    /// The segment has no room for the entry; the log manager should roll.
    #[error("segment is full")]
    SegmentFull,

    /// A magic sentinel or stored index did not match what was expected.
    ///
    /// Fatal for the affected segment or metadata file.
    #[error("corruption detected: {0}")]
    Corruption(String),

    /// The request violates an API precondition (e.g. non-contiguous append).
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Underlying filesystem or memory-mapping failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for storage operations.
pub type Result<T> = std::result::Result<T, StorageError>;
