//! Orders segments by starting index, routes reads to the right one, and
//! rolls a new segment when the tail fills up.
//!
//! ```text
//! <dir>/1.log         <dir>/1.log.index
//! <dir>/4001.log       <dir>/4001.log.index
//! <dir>/9002.log       <dir>/9002.log.index   <-- tail, still being written
//! ```
//!
//! The segment map is keyed by each segment's `start_index`. A reader
//! looks up the segment whose `start_index` is the largest one `<=` the
//! requested log index, then operates on it without holding the
//! manager's lock — see the reference-counting note on [`LogManager`].

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use raftlog_types::{LogIndex, Term};

use crate::entry::LogEntry;
use crate::error::{Result, StorageError};
use crate::segment::Segment;

/// Default per-segment data region size before rounding (4 MiB).
pub const DEFAULT_SEGMENT_SIZE: u64 = 4 * 1024 * 1024;
/// Default segment file extension.
pub const DEFAULT_SEGMENT_EXT: &str = "log";

/// Configuration for a [`LogManager`].
#[derive(Debug, Clone)]
pub struct LogManagerConfig {
    pub dir: PathBuf,
    pub max_segment_size: u64,
    pub file_ext: String,
}

impl LogManagerConfig {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            ..Self::default_with_empty_dir()
        }
    }

    fn default_with_empty_dir() -> Self {
        Self {
            dir: PathBuf::new(),
            max_segment_size: DEFAULT_SEGMENT_SIZE,
            file_ext: DEFAULT_SEGMENT_EXT.to_string(),
        }
    }
}

impl Default for LogManagerConfig {
    fn default() -> Self {
        Self::default_with_empty_dir()
    }
}

struct LogManagerState {
    /// Keyed by `start_index`; ordering lets reads find the right segment
    /// with a single reverse range lookup.
    segments: BTreeMap<LogIndex, Arc<Segment>>,
    /// The scalar tail, authoritative when `segments` is empty (e.g.
    /// right after a snapshot-driven discard of the whole log).
    last_index: LogIndex,
    last_term: Term,
}

/// The segmented append-only log.
///
/// Concurrent reference counting: [`LogManager::read`] and
/// [`LogManager::read_range`] clone an `Arc<Segment>` out of the map
/// while holding the manager's mutex, then release the mutex before
/// touching the segment. A segment removed from the map by
/// [`LogManager::truncate`] or [`LogManager::discard`] while a reader
/// still holds a clone stays mapped and readable until that clone (and
/// every other) drops — at which point its files are unlinked if it was
/// marked for auto-delete.
pub struct LogManager {
    config: LogManagerConfig,
    state: Mutex<LogManagerState>,
}

impl LogManager {
    /// Opens (creating if necessary) the log directory and reloads any
    /// existing segments.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Io`] if the directory cannot be created or
    /// listed, or [`StorageError::Corruption`] if a non-empty segment
    /// fails to open for a reason other than being empty.
    pub fn open(config: LogManagerConfig) -> Result<Self> {
        fs::create_dir_all(&config.dir)?;
        let manager = Self {
            config,
            state: Mutex::new(LogManagerState {
                segments: BTreeMap::new(),
                last_index: LogIndex::NONE,
                last_term: Term::ZERO,
            }),
        };
        manager.reload_logs()?;
        Ok(manager)
    }

    /// Lists segment data files in numeric order, opens each, drops and
    /// deletes any that turn out to be empty, and inserts the rest into
    /// the segment map.
    pub fn reload_logs(&self) -> Result<()> {
        let mut entries: Vec<(LogIndex, PathBuf)> = Vec::new();
        for dir_entry in fs::read_dir(&self.config.dir)? {
            let dir_entry = dir_entry?;
            let path = dir_entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some(self.config.file_ext.as_str()) {
                continue;
            }
            let Some(start_index) = parse_start_index(&path) else {
                continue;
            };
            entries.push((start_index, path));
        }
        entries.sort_by_key(|(start_index, _)| *start_index);

        let mut state = self.state.lock().expect("log manager lock poisoned");
        for (start_index, path) in entries {
            let segment = Segment::open(&path, self.config.max_segment_size, start_index)?;
            if segment.is_empty() {
                tracing::info!(path = %path.display(), "dropping empty segment found on reload");
                segment.set_auto_delete(true);
                drop(segment);
                continue;
            }
            let previous = state.segments.insert(segment.start_index(), Arc::new(segment));
            debug_assert!(previous.is_none(), "duplicate segment start_index on reload");
        }

        if let Some((_, tail)) = state.segments.iter().next_back() {
            state.last_index = tail.last_index();
            state.last_term = tail.last_term();
        }

        tracing::info!(
            segments = state.segments.len(),
            last_index = %state.last_index,
            "reloaded log"
        );
        Ok(())
    }

    fn segment_path(&self, start_index: LogIndex) -> PathBuf {
        self.config
            .dir
            .join(format!("{}.{}", start_index.as_u64(), self.config.file_ext))
    }

    /// Appends `entry`, rolling to a new segment if the tail is full or
    /// absent.
    ///
    /// # Errors
    ///
    /// Propagates segment creation failures, and
    /// [`StorageError::Corruption`] if a freshly created segment still
    /// refuses the write.
    pub fn append(&self, entry: &LogEntry) -> Result<LogIndex> {
        let mut state = self.state.lock().expect("log manager lock poisoned");

        let tail = state.segments.values().next_back().cloned();
        let needs_new_segment = match &tail {
            Some(tail) => match tail.write(entry) {
                Ok(()) => false,
                Err(StorageError::SegmentFull) => true,
                Err(e) => return Err(e),
            },
            None => true,
        };

        if needs_new_segment {
            let path = self.segment_path(entry.index);
            let segment = Segment::open(&path, self.config.max_segment_size, entry.index)?;
            segment.write(entry).map_err(|e| {
                StorageError::Corruption(format!(
                    "newly created segment at {} rejected its first write: {e}",
                    entry.index
                ))
            })?;
            state.segments.insert(segment.start_index(), Arc::new(segment));
            tracing::info!(start_index = %entry.index, "rolled to new segment");
        }

        state.last_index = entry.index;
        state.last_term = entry.term;
        Ok(entry.index)
    }

    fn find_segment(state: &LogManagerState, index: LogIndex) -> Option<Arc<Segment>> {
        state
            .segments
            .range(..=index)
            .next_back()
            .map(|(_, segment)| Arc::clone(segment))
    }

    /// Reads the entry at `index`.
    ///
    /// # Errors
    ///
    /// [`StorageError::NotFound`] if the log is empty or `index` is
    /// outside `[start_index(), last_index()]`.
    pub fn read(&self, index: LogIndex) -> Result<LogEntry> {
        let segment = {
            let state = self.state.lock().expect("log manager lock poisoned");
            if state.segments.is_empty() || index < self.start_index_locked(&state) || index > state.last_index {
                return Err(StorageError::NotFound(index));
            }
            Self::find_segment(&state, index).ok_or(StorageError::NotFound(index))?
        };
        segment.read(index)
    }

    /// Reads up to `max_count` entries starting at `index`, spanning
    /// segments as needed, stopping when a segment returns nothing more,
    /// `index` passes `last_index()`, or either budget is exhausted.
    pub fn read_range(&self, index: LogIndex, max_bytes: u64, max_count: usize) -> Result<Vec<LogEntry>> {
        let mut out = Vec::new();
        let mut cursor = index;
        let mut remaining_bytes = max_bytes;
        let mut remaining_count = max_count;

        loop {
            if remaining_count == 0 {
                break;
            }
            let segment = {
                let state = self.state.lock().expect("log manager lock poisoned");
                if state.segments.is_empty() || cursor > state.last_index {
                    break;
                }
                match Self::find_segment(&state, cursor) {
                    Some(segment) => segment,
                    None => break,
                }
            };

            let (entries, bytes_consumed) = match segment.read_range(cursor, remaining_bytes, remaining_count) {
                Ok(result) => result,
                Err(StorageError::NotFound(_)) => break,
                Err(e) => return Err(e),
            };
            if entries.is_empty() {
                break;
            }

            let last = entries.last().map(|e| e.index).expect("non-empty");
            remaining_count -= entries.len();
            remaining_bytes = remaining_bytes.saturating_sub(bytes_consumed);
            cursor = last.next();
            out.extend(entries);

            if remaining_bytes == 0 {
                break;
            }
        }

        Ok(out)
    }

    /// Drops the tail of the log at or after `index`.
    ///
    /// Deletes every segment whose `start_index > index` outright, and
    /// tail-truncates the segment that contains `index` in place.
    ///
    /// # Errors
    ///
    /// [`StorageError::NotFound`] if no segment contains `index`.
    pub fn truncate(&self, index: LogIndex) -> Result<()> {
        let mut state = self.state.lock().expect("log manager lock poisoned");

        // Resolve and validate the straddling segment before deleting
        // anything: a failed truncate must leave every segment file
        // untouched, per the "failed operation, unchanged state" policy.
        if state.segments.is_empty() || index > state.last_index {
            return Err(StorageError::NotFound(index));
        }
        let containing = Self::find_segment(&state, index).ok_or(StorageError::NotFound(index))?;
        if index > containing.last_index() {
            return Err(StorageError::NotFound(index));
        }

        let above: Vec<LogIndex> = state
            .segments
            .range((index.next())..)
            .map(|(start, _)| *start)
            .collect();
        for start in above {
            if let Some(segment) = state.segments.remove(&start) {
                segment.set_auto_delete(true);
            }
        }

        containing.truncate(index)?;

        state.last_index = index;
        state.last_term = if index.is_none() {
            Term::ZERO
        } else {
            containing.last_term()
        };

        tracing::info!(index = %index, "truncated log");
        Ok(())
    }

    /// Deletes whole segments covered by a snapshot up to `upto_index`.
    ///
    /// Returns the number of segments removed. Stops at the first
    /// segment whose range straddles `upto_index`.
    pub fn discard(&self, upto_index: LogIndex) -> usize {
        let mut state = self.state.lock().expect("log manager lock poisoned");
        let starts: Vec<LogIndex> = state.segments.keys().copied().collect();

        let mut removed = 0;
        for start in starts {
            let segment = state.segments.get(&start).expect("key from snapshot").clone();
            if segment.last_index() <= upto_index {
                state.segments.remove(&start);
                segment.set_auto_delete(true);
                removed += 1;
            } else {
                break;
            }
        }

        tracing::info!(upto_index = %upto_index, removed, "discarded segments");
        removed
    }

    fn start_index_locked(&self, state: &LogManagerState) -> LogIndex {
        state
            .segments
            .keys()
            .next()
            .copied()
            .unwrap_or(state.last_index)
    }

    pub fn start_index(&self) -> LogIndex {
        let state = self.state.lock().expect("log manager lock poisoned");
        self.start_index_locked(&state)
    }

    pub fn last_index(&self) -> LogIndex {
        self.state.lock().expect("log manager lock poisoned").last_index
    }

    pub fn last_term(&self) -> Term {
        self.state.lock().expect("log manager lock poisoned").last_term
    }

    pub fn log_count(&self) -> usize {
        self.state.lock().expect("log manager lock poisoned").segments.len()
    }

    /// A snapshot of `{start_index -> last_index}` for every live segment.
    pub fn logs_info(&self) -> Vec<(LogIndex, LogIndex)> {
        self.state
            .lock()
            .expect("log manager lock poisoned")
            .segments
            .values()
            .map(|segment| (segment.start_index(), segment.last_index()))
            .collect()
    }

    /// Repoints the logical tail directly; used after a snapshot-driven
    /// discard leaves no segments but the Raft layer still knows its
    /// last applied index and term.
    pub fn set_last_index(&self, index: LogIndex) {
        self.state.lock().expect("log manager lock poisoned").last_index = index;
    }

    pub fn set_last_term(&self, term: Term) {
        self.state.lock().expect("log manager lock poisoned").last_term = term;
    }
}

fn parse_start_index(path: &Path) -> Option<LogIndex> {
    path.file_stem()?.to_str()?.parse::<u64>().ok().map(LogIndex::new)
}
