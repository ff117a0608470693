//! The log entry type stored by the segment store.

use bytes::Bytes;
use raftlog_types::{EntryType, LogIndex, Term};

/// A single self-describing entry in the replicated log.
///
/// Entries are opaque to the segment store and log manager — `data` is
/// whatever the Raft layer above asked to have durably ordered. The byte
/// codec length-prefixes `data` for on-disk framing; this type holds the
/// decoded form.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogEntry {
    pub index: LogIndex,
    pub term: Term,
    pub entry_type: EntryType,
    pub data: Bytes,
}

impl LogEntry {
    pub fn new(index: LogIndex, term: Term, entry_type: EntryType, data: Bytes) -> Self {
        Self {
            index,
            term,
            entry_type,
            data,
        }
    }

    /// Length in bytes of the encoded message: `index | term | type | len | data`.
    ///
    /// This is the value the segment frames with a leading and trailing
    /// magic sentinel (8 bytes of overhead not counted here).
    pub fn message_len(&self) -> usize {
        8 + 8 + 4 + 4 + self.data.len()
    }
}
