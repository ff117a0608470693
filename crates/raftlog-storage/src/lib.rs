//! # raftlog-storage: the durable log and metadata journal
//!
//! ```text
//! LogManager                          MetadataStore
//! ├── BTreeMap<LogIndex, Segment>      ├── current_term
//! │   ├── 1.log / 1.log.index          ├── committed_index
//! │   ├── 4001.log / 4001.log.index    ├── applied_index
//! │   └── 9002.log / 9002.log.index    ├── voted_for
//! └── last_index / last_term           └── peer_info
//! ```
//!
//! [`log_manager::LogManager`] orders fixed-size, memory-mapped
//! [`segment::Segment`]s by their starting [`raftlog_types::LogIndex`],
//! routes reads to the right one, and rolls to a new segment when the
//! tail fills up. [`metadata::MetadataStore`] is the sibling journal for
//! everything about Raft's persistent state that isn't a log entry.
//! Both are built on the same primitives: [`codec`] for fixed-width,
//! little-endian pack/unpack, and a pair of `MAGIC_START`/`MAGIC_END`
//! sentinels bracketing every on-disk record so a torn write is always
//! detectable on reload.
//!
//! Neither store performs Raft's consensus logic, RPC handling, or
//! state machine application — those are external collaborators that
//! call into the operations exposed here.

pub mod codec;
pub mod entry;
pub mod error;
pub mod log_manager;
pub mod metadata;
pub mod segment;

pub use entry::LogEntry;
pub use error::{Result, StorageError};
pub use log_manager::{LogManager, LogManagerConfig};
pub use metadata::{MetadataStore, MetadataStoreConfig};
pub use segment::Segment;
