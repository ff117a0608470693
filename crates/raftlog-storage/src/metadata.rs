//! A single memory-mapped, append-only journal of small tagged records:
//! `current_term`, `committed_index`, `applied_index`, the last vote
//! cast, and cluster membership.
//!
//! ```text
//! <dir>/0.meta   [ MAGIC_START | TAG | payload | MAGIC_END ]...
//! ```
//!
//! The newest occurrence of a tag wins on reload. When a file runs out
//! of room for the next record, the store rotates to a new file seeded
//! with a checkpoint of every current value, then unlinks the old one.

use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use memmap2::MmapMut;
use raftlog_types::{PeerInfo, Term};

use crate::codec;
use crate::error::{Result, StorageError};

const MAGIC_START: u32 = 123_456_789;
const MAGIC_END: u32 = 987_654_321;

const TAG_APPLIED_INDEX: u8 = 1;
const TAG_COMMITTED_INDEX: u8 = 2;
const TAG_VOTE_FOR: u8 = 3;
const TAG_CURRENT_TERM: u8 = 4;
const TAG_PEER_INFO: u8 = 5;

/// Default region for a metadata file: generous for a handful of
/// scalar tags plus a modest peer list.
pub const DEFAULT_METADATA_FILE_SIZE: u64 = 64 * 1024;

/// Framing overhead per record: `MAGIC_START(4) + TAG(1) + MAGIC_END(4)`.
const RECORD_OVERHEAD: u64 = 9;

/// Configuration for a [`MetadataStore`].
#[derive(Debug, Clone)]
pub struct MetadataStoreConfig {
    pub dir: PathBuf,
    pub max_file_size: u64,
}

impl MetadataStoreConfig {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            max_file_size: DEFAULT_METADATA_FILE_SIZE,
        }
    }
}

/// A snapshot of every tag's current value; used both to decode a file
/// during reload and to seed a fresh file during checkpoint/rotate.
#[derive(Debug, Clone, Default)]
struct Snapshot {
    applied_index: u64,
    committed_index: u64,
    current_term: Term,
    vote_for: Option<(String, Term)>,
    peers: Vec<PeerInfo>,
}

struct MetadataState {
    mmap: MmapMut,
    file_path: PathBuf,
    file_index: u64,
    /// Byte offset of the append point; the next record starts here.
    cursor: u64,
    applied_index: u64,
    committed_index: u64,
    current_term: Term,
    vote_for: Option<(String, Term)>,
    peers: Vec<PeerInfo>,
}

impl MetadataState {
    fn snapshot(&self) -> Snapshot {
        Snapshot {
            applied_index: self.applied_index,
            committed_index: self.committed_index,
            current_term: self.current_term,
            vote_for: self.vote_for.clone(),
            peers: self.peers.clone(),
        }
    }
}

/// The versioned metadata journal: `current_term`, `voted_for`,
/// `committed_index`, `applied_index`, and peer membership.
///
/// One mutex serializes every operation — readers return the in-memory
/// copy under the lock and never touch disk.
pub struct MetadataStore {
    config: MetadataStoreConfig,
    state: Mutex<MetadataState>,
}

impl MetadataStore {
    /// Opens the newest valid metadata file in `config.dir`, or creates
    /// one if none exist or all are corrupt.
    ///
    /// # Errors
    ///
    /// [`StorageError::Io`] if the directory or a file cannot be created
    /// or mapped.
    pub fn open(config: MetadataStoreConfig) -> Result<Self> {
        std::fs::create_dir_all(&config.dir)?;
        let candidates = list_meta_files(&config.dir)?;

        let mut opened = None;
        for (file_index, path) in &candidates {
            let file = open_and_size(path, config.max_file_size)?;
            // SAFETY: this file is opened exclusively by this store for its lifetime.
            #[allow(unsafe_code)]
            let mmap = unsafe { MmapMut::map_mut(&file)? };
            match scan_file(&mmap) {
                Ok((snapshot, cursor)) => {
                    opened = Some(MetadataState {
                        mmap,
                        file_path: path.clone(),
                        file_index: *file_index,
                        cursor,
                        applied_index: snapshot.applied_index,
                        committed_index: snapshot.committed_index,
                        current_term: snapshot.current_term,
                        vote_for: snapshot.vote_for,
                        peers: snapshot.peers,
                    });
                    break;
                }
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "metadata file failed to reload, trying next");
                }
            }
        }

        let state = match opened {
            Some(state) => state,
            None => {
                let next_index = candidates.iter().map(|(n, _)| n + 1).max().unwrap_or(0);
                let path = config.dir.join(format!("{next_index}.meta"));
                let file = open_and_size(&path, config.max_file_size)?;
                // SAFETY: this file is opened exclusively by this store for its lifetime.
                #[allow(unsafe_code)]
                let mut mmap = unsafe { MmapMut::map_mut(&file)? };
                let cursor = checkpoint_into(&mut mmap, &Snapshot::default());
                MetadataState {
                    mmap,
                    file_path: path,
                    file_index: next_index,
                    cursor,
                    applied_index: 0,
                    committed_index: 0,
                    current_term: Term::ZERO,
                    vote_for: None,
                    peers: Vec::new(),
                }
            }
        };

        tracing::info!(file_index = state.file_index, "opened metadata journal");
        Ok(Self {
            config,
            state: Mutex::new(state),
        })
    }

    fn append_record(&self, state: &mut MetadataState, tag: u8, payload: &[u8]) -> Result<()> {
        let record_len = payload.len() as u64 + RECORD_OVERHEAD;
        let remaining = state.mmap.len() as u64 - state.cursor;
        if remaining < record_len + 4 {
            self.rotate(state)?;
        }

        let remaining = state.mmap.len() as u64 - state.cursor;
        if remaining < record_len + 4 {
            return Err(StorageError::InvalidArgument(format!(
                "metadata file size {} too small to hold a checkpoint",
                self.config.max_file_size
            )));
        }

        state.cursor = write_record(&mut state.mmap, state.cursor, tag, payload);
        Ok(())
    }

    /// Creates `<file_index+1>.meta`, writes a fresh checkpoint of every
    /// current value into it, then unlinks the old file.
    fn rotate(&self, state: &mut MetadataState) -> Result<()> {
        let next_index = state.file_index + 1;
        let next_path = self.config.dir.join(format!("{next_index}.meta"));
        let file = open_and_size(&next_path, self.config.max_file_size)?;
        // SAFETY: this file is opened exclusively by this store for its lifetime.
        #[allow(unsafe_code)]
        let mut mmap = unsafe { MmapMut::map_mut(&file)? };
        let cursor = checkpoint_into(&mut mmap, &state.snapshot());

        let old_path = std::mem::replace(&mut state.file_path, next_path);
        state.mmap = mmap;
        state.file_index = next_index;
        state.cursor = cursor;

        if let Err(e) = std::fs::remove_file(&old_path) {
            tracing::warn!(path = %old_path.display(), error = %e, "failed to remove old metadata file");
        }
        tracing::info!(file_index = next_index, "rotated metadata journal");
        Ok(())
    }

    /// Forces an out-of-band checkpoint: a fresh file seeded with every
    /// current value, independent of remaining capacity.
    pub fn checkpoint(&self) -> Result<()> {
        let mut state = self.state.lock().expect("metadata lock poisoned");
        self.rotate(&mut state)
    }

    pub fn get_applied_index(&self) -> u64 {
        self.state.lock().expect("metadata lock poisoned").applied_index
    }

    pub fn set_applied_index(&self, value: u64) -> Result<()> {
        let mut state = self.state.lock().expect("metadata lock poisoned");
        self.append_record(&mut state, TAG_APPLIED_INDEX, &value.to_le_bytes())?;
        state.applied_index = value;
        Ok(())
    }

    pub fn get_committed_index(&self) -> u64 {
        self.state.lock().expect("metadata lock poisoned").committed_index
    }

    pub fn set_committed_index(&self, value: u64) -> Result<()> {
        let mut state = self.state.lock().expect("metadata lock poisoned");
        self.append_record(&mut state, TAG_COMMITTED_INDEX, &value.to_le_bytes())?;
        state.committed_index = value;
        Ok(())
    }

    pub fn get_current_term(&self) -> Term {
        self.state.lock().expect("metadata lock poisoned").current_term
    }

    pub fn set_current_term(&self, term: Term) -> Result<()> {
        let mut state = self.state.lock().expect("metadata lock poisoned");
        self.append_record(&mut state, TAG_CURRENT_TERM, &term.as_u64().to_le_bytes())?;
        state.current_term = term;
        Ok(())
    }

    pub fn get_vote_for(&self) -> Option<(String, Term)> {
        self.state.lock().expect("metadata lock poisoned").vote_for.clone()
    }

    pub fn set_vote_for(&self, id: &str, term: Term) -> Result<()> {
        let mut state = self.state.lock().expect("metadata lock poisoned");
        let payload = encode_vote_for_payload(id, term);
        self.append_record(&mut state, TAG_VOTE_FOR, &payload)?;
        state.vote_for = Some((id.to_string(), term));
        Ok(())
    }

    pub fn get_peer_infos(&self) -> Vec<PeerInfo> {
        self.state.lock().expect("metadata lock poisoned").peers.clone()
    }

    pub fn set_peer_infos(&self, peers: Vec<PeerInfo>) -> Result<()> {
        let mut state = self.state.lock().expect("metadata lock poisoned");
        let payload = encode_peer_info_payload(&peers);
        self.append_record(&mut state, TAG_PEER_INFO, &payload)?;
        state.peers = peers;
        Ok(())
    }

    /// Logs the current in-memory snapshot at info level.
    pub fn print_status(&self) {
        let state = self.state.lock().expect("metadata lock poisoned");
        tracing::info!(
            file_index = state.file_index,
            applied_index = state.applied_index,
            committed_index = state.committed_index,
            current_term = %state.current_term,
            vote_for = ?state.vote_for,
            peer_count = state.peers.len(),
            "metadata status"
        );
    }
}

fn encode_vote_for_payload(id: &str, term: Term) -> Vec<u8> {
    let mut buf = vec![0u8; 8 + 4 + id.len()];
    let mut pos = 0;
    codec::put_u64(&mut buf, &mut pos, term.as_u64());
    codec::put_string(&mut buf, &mut pos, id);
    buf
}

fn encode_peer_info_payload(peers: &[PeerInfo]) -> Vec<u8> {
    let total = 4 + peers.iter().map(PeerInfo::encoded_len).sum::<usize>();
    let mut buf = vec![0u8; total];
    let mut pos = 0;
    codec::put_u32(&mut buf, &mut pos, peers.len() as u32);
    for peer in peers {
        codec::put_string(&mut buf, &mut pos, &peer.id);
        codec::put_string(&mut buf, &mut pos, &peer.addr);
    }
    buf
}

fn write_record(mmap: &mut MmapMut, cursor: u64, tag: u8, payload: &[u8]) -> u64 {
    let mut pos = cursor as usize;
    let buf = &mut mmap[..];
    codec::put_u32(buf, &mut pos, MAGIC_START);
    codec::put_u8(buf, &mut pos, tag);
    buf[pos..pos + payload.len()].copy_from_slice(payload);
    pos += payload.len();
    codec::put_u32(buf, &mut pos, MAGIC_END);
    pos as u64
}

/// Writes `current_term`, `committed_index`, `applied_index`, and — if
/// present — `vote_for` and `peer_info`, into a freshly mapped file.
/// Returns the cursor past the last record written.
fn checkpoint_into(mmap: &mut MmapMut, snapshot: &Snapshot) -> u64 {
    let mut cursor = 0;
    cursor = write_record(mmap, cursor, TAG_CURRENT_TERM, &snapshot.current_term.as_u64().to_le_bytes());
    cursor = write_record(mmap, cursor, TAG_COMMITTED_INDEX, &snapshot.committed_index.to_le_bytes());
    cursor = write_record(mmap, cursor, TAG_APPLIED_INDEX, &snapshot.applied_index.to_le_bytes());
    if let Some((id, term)) = &snapshot.vote_for {
        cursor = write_record(mmap, cursor, TAG_VOTE_FOR, &encode_vote_for_payload(id, *term));
    }
    if !snapshot.peers.is_empty() {
        cursor = write_record(mmap, cursor, TAG_PEER_INFO, &encode_peer_info_payload(&snapshot.peers));
    }
    cursor
}

/// Scans a mapped metadata file forward from offset 0, applying each
/// well-formed record to a [`Snapshot`] (the newest occurrence of a tag
/// wins). Stops at the first non-`MAGIC_START` cursor position — the
/// append point — or returns [`StorageError::Corruption`] if a record's
/// framing or payload is malformed partway through.
fn scan_file(mmap: &MmapMut) -> Result<(Snapshot, u64)> {
    let buf = &mmap[..];
    let mut snapshot = Snapshot::default();
    let mut cursor: u64 = 0;

    loop {
        if cursor as usize + 4 > buf.len() {
            break;
        }
        let mut pos = cursor as usize;
        let magic_start = codec::get_u32(buf, &mut pos);
        if magic_start != MAGIC_START {
            break;
        }
        let tag = codec::get_u8(buf, &mut pos);
        match tag {
            TAG_APPLIED_INDEX => snapshot.applied_index = codec::get_u64(buf, &mut pos),
            TAG_COMMITTED_INDEX => snapshot.committed_index = codec::get_u64(buf, &mut pos),
            TAG_CURRENT_TERM => snapshot.current_term = Term::new(codec::get_u64(buf, &mut pos)),
            TAG_VOTE_FOR => {
                let term = Term::new(codec::get_u64(buf, &mut pos));
                let id = codec::get_string(buf, &mut pos)?;
                snapshot.vote_for = Some((id, term));
            }
            TAG_PEER_INFO => {
                let count = codec::get_u32(buf, &mut pos) as usize;
                let mut peers = Vec::with_capacity(count);
                for _ in 0..count {
                    let id = codec::get_string(buf, &mut pos)?;
                    let addr = codec::get_string(buf, &mut pos)?;
                    peers.push(PeerInfo::new(id, addr));
                }
                snapshot.peers = peers;
            }
            other => return Err(StorageError::Corruption(format!("unknown metadata tag {other}"))),
        }
        let magic_end = codec::get_u32(buf, &mut pos);
        if magic_end != MAGIC_END {
            return Err(StorageError::Corruption("metadata record missing MAGIC_END".to_string()));
        }
        cursor = pos as u64;
    }

    Ok((snapshot, cursor))
}

fn list_meta_files(dir: &Path) -> Result<Vec<(u64, PathBuf)>> {
    let mut files = Vec::new();
    for dir_entry in std::fs::read_dir(dir)? {
        let path = dir_entry?.path();
        if path.extension().and_then(|e| e.to_str()) != Some("meta") {
            continue;
        }
        let Some(file_index) = path
            .file_stem()
            .and_then(|s| s.to_str())
            .and_then(|s| s.parse::<u64>().ok())
        else {
            continue;
        };
        files.push((file_index, path));
    }
    files.sort_by(|a, b| b.0.cmp(&a.0));
    Ok(files)
}

fn open_and_size(path: &Path, size: u64) -> Result<File> {
    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(path)?;
    if file.metadata()?.len() < size {
        file.set_len(size)?;
    }
    Ok(file)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn fresh_store_has_zero_values() {
        let dir = tempdir().unwrap();
        let store = MetadataStore::open(MetadataStoreConfig::new(dir.path())).unwrap();
        assert_eq!(store.get_applied_index(), 0);
        assert_eq!(store.get_committed_index(), 0);
        assert_eq!(store.get_current_term(), Term::ZERO);
        assert_eq!(store.get_vote_for(), None);
        assert!(store.get_peer_infos().is_empty());
    }

    #[test]
    fn setters_are_observed_immediately() {
        let dir = tempdir().unwrap();
        let store = MetadataStore::open(MetadataStoreConfig::new(dir.path())).unwrap();
        store.set_current_term(Term::new(5)).unwrap();
        store.set_vote_for("n2", Term::new(5)).unwrap();
        store.set_committed_index(42).unwrap();

        assert_eq!(store.get_current_term(), Term::new(5));
        assert_eq!(store.get_vote_for(), Some(("n2".to_string(), Term::new(5))));
        assert_eq!(store.get_committed_index(), 42);
        assert_eq!(store.get_applied_index(), 0);
    }

    #[test]
    fn reload_recovers_last_set_values() {
        let dir = tempdir().unwrap();
        {
            let store = MetadataStore::open(MetadataStoreConfig::new(dir.path())).unwrap();
            store.set_current_term(Term::new(5)).unwrap();
            store.set_vote_for("n2", Term::new(5)).unwrap();
            store.set_committed_index(42).unwrap();
            store.set_applied_index(10).unwrap();
            store
                .set_peer_infos(vec![PeerInfo::new("n1", "10.0.0.1:9000"), PeerInfo::new("n2", "10.0.0.2:9000")])
                .unwrap();
        }

        let store = MetadataStore::open(MetadataStoreConfig::new(dir.path())).unwrap();
        assert_eq!(store.get_current_term(), Term::new(5));
        assert_eq!(store.get_vote_for(), Some(("n2".to_string(), Term::new(5))));
        assert_eq!(store.get_committed_index(), 42);
        assert_eq!(store.get_applied_index(), 10);
        assert_eq!(store.get_peer_infos().len(), 2);
    }

    #[test]
    fn rotation_leaves_exactly_one_file_with_current_values() {
        let dir = tempdir().unwrap();
        let mut config = MetadataStoreConfig::new(dir.path());
        config.max_file_size = 128; // room for only a couple of records
        let store = MetadataStore::open(config).unwrap();

        for term in 1..=10u64 {
            store.set_current_term(Term::new(term)).unwrap();
        }

        let meta_files: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.path().extension().and_then(|x| x.to_str()) == Some("meta"))
            .collect();
        assert_eq!(meta_files.len(), 1, "rotation should leave exactly one file");
        assert_eq!(store.get_current_term(), Term::new(10));

        drop(store);
        let store = MetadataStore::open(MetadataStoreConfig {
            dir: dir.path().to_path_buf(),
            max_file_size: 128,
        })
        .unwrap();
        assert_eq!(store.get_current_term(), Term::new(10));
    }

    #[test]
    fn checkpoint_is_idempotent_for_readers() {
        let dir = tempdir().unwrap();
        let store = MetadataStore::open(MetadataStoreConfig::new(dir.path())).unwrap();
        store.set_committed_index(7).unwrap();
        store.checkpoint().unwrap();
        assert_eq!(store.get_committed_index(), 7);
        store.print_status();
    }
}
