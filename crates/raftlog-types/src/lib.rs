//! # raftlog-types: core identifiers for the durable log subsystem
//!
//! Small `Copy` newtypes shared between the segment store, the log
//! manager, and the metadata journal:
//!
//! - [`LogIndex`] — position of an entry in the replicated log.
//! - [`Term`] — Raft election epoch.
//! - [`EntryType`] — what kind of payload a log entry carries.
//! - [`PeerInfo`] — a cluster member's id and network address, as
//!   persisted by the metadata journal's `PEER_INFO` tag.

use std::fmt::{self, Display};
use std::ops::Add;

/// Monotonic identifier for an entry in the replicated log.
///
/// Index `0` is reserved to mean "no log" — it is never the index of a
/// real entry. Valid entry indices start at 1 and are globally monotonic
/// across the whole log, not per-segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct LogIndex(u64);

impl LogIndex {
    /// The reserved "no log" sentinel.
    pub const NONE: LogIndex = LogIndex(0);

    pub fn new(index: u64) -> Self {
        Self(index)
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }

    /// Returns the index as a `usize` for indexing into in-memory buffers.
    ///
    /// # Panics
    ///
    /// Panics on 32-bit platforms if the index exceeds `usize::MAX`.
    pub fn as_usize(self) -> usize {
        self.0 as usize
    }

    /// Returns whether this is the reserved "no log" sentinel.
    pub fn is_none(self) -> bool {
        self.0 == 0
    }

    /// Returns the next index in sequence.
    pub fn next(self) -> Self {
        Self(self.0 + 1)
    }

    /// Returns the previous index, saturating at zero.
    pub fn prev(self) -> Self {
        Self(self.0.saturating_sub(1))
    }
}

impl Display for LogIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for LogIndex {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

impl From<LogIndex> for u64 {
    fn from(index: LogIndex) -> Self {
        index.0
    }
}

impl Add<u64> for LogIndex {
    type Output = LogIndex;

    fn add(self, rhs: u64) -> Self::Output {
        LogIndex(self.0 + rhs)
    }
}

/// Raft election epoch. Non-decreasing in the writer's observed order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Term(u64);

impl Term {
    pub const ZERO: Term = Term(0);

    pub fn new(term: u64) -> Self {
        Self(term)
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl Display for Term {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for Term {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

impl From<Term> for u64 {
    fn from(term: Term) -> Self {
        term.0
    }
}

/// What a log entry's opaque payload represents.
///
/// Distinguishes entries the state machine must apply from entries the
/// log manager uses for its own bookkeeping, without the storage layer
/// needing to understand the payload itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum EntryType {
    /// A normal application command destined for the state machine.
    #[default]
    RaftLog,
    /// A no-op entry committed by a new leader to confirm its term.
    Nop,
    /// A cluster membership change.
    ConfigChange,
}

impl EntryType {
    /// Returns the four-byte discriminant used in the on-disk entry schema.
    pub fn as_u32(self) -> u32 {
        match self {
            EntryType::RaftLog => 0,
            EntryType::Nop => 1,
            EntryType::ConfigChange => 2,
        }
    }

    /// Creates an `EntryType` from its on-disk discriminant.
    ///
    /// Returns `None` if the value is not a valid discriminant; callers
    /// should treat that as corruption of the entry header.
    pub fn from_u32(value: u32) -> Option<Self> {
        match value {
            0 => Some(EntryType::RaftLog),
            1 => Some(EntryType::Nop),
            2 => Some(EntryType::ConfigChange),
            _ => None,
        }
    }
}

/// A cluster member's id and network address.
///
/// Persisted in the metadata journal's `PEER_INFO` record so that
/// cluster membership survives a restart alongside term and vote state.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PeerInfo {
    pub id: String,
    pub addr: String,
}

impl PeerInfo {
    pub fn new(id: impl Into<String>, addr: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            addr: addr.into(),
        }
    }

    /// Encoded payload length: `4 + len(id) + 4 + len(addr)` bytes.
    pub fn encoded_len(&self) -> usize {
        4 + self.id.len() + 4 + self.addr.len()
    }
}

impl Display for PeerInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.id, self.addr)
    }
}
