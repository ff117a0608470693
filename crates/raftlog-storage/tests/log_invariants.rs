//! Property tests for the log manager's core invariants: contiguity,
//! round-tripping, range caps, and truncate/discard semantics.

use bytes::Bytes;
use proptest::prelude::*;
use raftlog_storage::log_manager::{LogManager, LogManagerConfig};
use raftlog_storage::StorageError;
use raftlog_types::{EntryType, LogIndex, Term};
use tempfile::tempdir;

fn small_entry(index: u64, term: u64, payload: &[u8]) -> raftlog_storage::LogEntry {
    raftlog_storage::LogEntry::new(
        LogIndex::new(index),
        Term::new(term),
        EntryType::RaftLog,
        Bytes::copy_from_slice(payload),
    )
}

proptest! {
    /// After appending a strictly-increasing run of entries, `read` recovers
    /// each one exactly, and the live range has no gaps.
    #[test]
    fn contiguity_and_round_trip(terms in prop::collection::vec(0u64..5, 1..40)) {
        let dir = tempdir().unwrap();
        let manager = LogManager::open(LogManagerConfig::new(dir.path())).unwrap();

        let mut last_term = 0u64;
        let mut expected = Vec::new();
        for (i, bump) in terms.iter().enumerate() {
            last_term += bump;
            let index = i as u64 + 1;
            let entry = small_entry(index, last_term, b"x");
            manager.append(&entry).unwrap();
            expected.push(entry);
        }

        prop_assert_eq!(manager.start_index(), LogIndex::new(1));
        prop_assert_eq!(manager.last_index(), LogIndex::new(expected.len() as u64));

        for entry in &expected {
            let read = manager.read(entry.index).unwrap();
            prop_assert_eq!(&read, entry);
        }
    }

    /// `read_range` never returns more than `max_count` entries or more
    /// than `max_bytes` of payload, and indices are strictly increasing
    /// starting at the requested index.
    #[test]
    fn range_caps_are_respected(count in 1usize..30, max_count in 1usize..10) {
        let dir = tempdir().unwrap();
        let manager = LogManager::open(LogManagerConfig::new(dir.path())).unwrap();
        for i in 1..=count as u64 {
            manager.append(&small_entry(i, 1, b"payload")).unwrap();
        }

        let entries = manager.read_range(LogIndex::new(1), u64::MAX, max_count).unwrap();
        prop_assert!(entries.len() <= max_count);
        prop_assert!(entries.len() <= count);
        for window in entries.windows(2) {
            prop_assert!(window[1].index > window[0].index);
        }
        if let Some(first) = entries.first() {
            prop_assert_eq!(first.index, LogIndex::new(1));
        }
    }

    /// Truncating the same index twice is equivalent to truncating it once.
    #[test]
    fn truncate_is_idempotent(count in 2usize..20, cut in 1u64..19) {
        let dir = tempdir().unwrap();
        let manager = LogManager::open(LogManagerConfig::new(dir.path())).unwrap();
        for i in 1..=count as u64 {
            manager.append(&small_entry(i, 1, b"x")).unwrap();
        }
        let cut = LogIndex::new(cut.min(count as u64));

        manager.truncate(cut).unwrap();
        let after_first = manager.last_index();
        manager.truncate(cut).unwrap();
        let after_second = manager.last_index();

        prop_assert_eq!(after_first, cut);
        prop_assert_eq!(after_second, cut);
    }

    /// After `truncate(k)`, the only index `append` will accept is `k + 1`.
    #[test]
    fn truncate_then_append_requires_next_index(count in 3usize..20, cut in 1u64..19) {
        let dir = tempdir().unwrap();
        let manager = LogManager::open(LogManagerConfig::new(dir.path())).unwrap();
        for i in 1..=count as u64 {
            manager.append(&small_entry(i, 1, b"x")).unwrap();
        }
        let cut = LogIndex::new(cut.min(count as u64 - 1));
        manager.truncate(cut).unwrap();

        let wrong = small_entry(cut.as_u64() + 2, 5, b"nope");
        prop_assert!(matches!(manager.append(&wrong), Err(StorageError::InvalidArgument(_))));

        let right = small_entry(cut.as_u64() + 1, 5, b"yes");
        prop_assert!(manager.append(&right).is_ok());
    }
}

#[test]
fn discard_removes_exactly_covered_segments_and_start_index_advances() {
    let dir = tempdir().unwrap();
    let mut config = LogManagerConfig::new(dir.path());
    config.max_segment_size = 65536;
    let manager = LogManager::open(config).unwrap();

    let payload = vec![0u8; 200_000];
    for i in 1..=60u64 {
        manager
            .append(&raftlog_storage::LogEntry::new(
                LogIndex::new(i),
                Term::new(1),
                EntryType::RaftLog,
                Bytes::from(payload.clone()),
            ))
            .unwrap();
    }

    let before = manager.start_index();
    let info_before = manager.logs_info();
    let removed = manager.discard(LogIndex::new(30));
    let info_after = manager.logs_info();

    assert!(removed > 0);
    assert!(manager.start_index() >= before);
    assert!(info_after.len() <= info_before.len());
    for (start, last) in &info_after {
        assert!(*last > LogIndex::new(30) || *start > LogIndex::new(30));
    }
    for i in 1..manager.start_index().as_u64() {
        assert!(matches!(manager.read(LogIndex::new(i)), Err(StorageError::NotFound(_))));
    }
}
