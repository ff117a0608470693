//! Property tests for the metadata journal: idempotent reload, and
//! rotation preserving every current value.

use proptest::prelude::*;
use raftlog_storage::{MetadataStore, MetadataStoreConfig};
use raftlog_types::{PeerInfo, Term};
use tempfile::tempdir;

proptest! {
    /// Reloading after any sequence of setters recovers the last value set
    /// for each tag.
    #[test]
    fn reload_recovers_last_values(
        term in 0u64..1000,
        committed in 0u64..1000,
        applied in 0u64..1000,
        voter in "[a-z]{1,8}",
    ) {
        let dir = tempdir().unwrap();
        {
            let store = MetadataStore::open(MetadataStoreConfig::new(dir.path())).unwrap();
            store.set_current_term(Term::new(term)).unwrap();
            store.set_committed_index(committed).unwrap();
            store.set_applied_index(applied).unwrap();
            store.set_vote_for(&voter, Term::new(term)).unwrap();
        }

        let store = MetadataStore::open(MetadataStoreConfig::new(dir.path())).unwrap();
        prop_assert_eq!(store.get_current_term(), Term::new(term));
        prop_assert_eq!(store.get_committed_index(), committed);
        prop_assert_eq!(store.get_applied_index(), applied);
        prop_assert_eq!(store.get_vote_for(), Some((voter, Term::new(term))));
    }
}

#[test]
fn rotation_preserves_every_value_including_peers() {
    let dir = tempdir().unwrap();
    let mut config = MetadataStoreConfig::new(dir.path());
    config.max_file_size = 160; // small enough to force several rotations
    let store = MetadataStore::open(config).unwrap();

    store
        .set_peer_infos(vec![PeerInfo::new("n1", "10.0.0.1:9000"), PeerInfo::new("n2", "10.0.0.2:9000")])
        .unwrap();
    for term in 1..=20u64 {
        store.set_current_term(Term::new(term)).unwrap();
        store.set_committed_index(term * 2).unwrap();
    }

    assert_eq!(store.get_current_term(), Term::new(20));
    assert_eq!(store.get_committed_index(), 40);
    assert_eq!(store.get_peer_infos().len(), 2);

    drop(store);
    let store = MetadataStore::open(MetadataStoreConfig {
        dir: dir.path().to_path_buf(),
        max_file_size: 160,
    })
    .unwrap();
    assert_eq!(store.get_current_term(), Term::new(20));
    assert_eq!(store.get_committed_index(), 40);
    assert_eq!(store.get_peer_infos().len(), 2);
}
