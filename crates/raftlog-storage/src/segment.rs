//! A bounded, memory-mapped pair of files storing a contiguous range of
//! the replicated log.
//!
//! ```text
//! <path>         data file:  [ MAGIC_START | message | MAGIC_END ]...
//! <path>.index   index file: [ MAGIC_START | log_index | data_offset | MAGIC_END ]...
//! ```
//!
//! Each data-region entry is bracketed by [`MAGIC_START`]/[`MAGIC_END`]
//! sentinels; each index-region slot is a fixed 20 bytes. A slot whose
//! leading `u32` is not `MAGIC_START` marks the append position — and,
//! after a [`Segment::truncate`], marks the entries that no longer exist.

use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, RwLock};

use memmap2::MmapMut;
use raftlog_types::{LogIndex, Term};

use crate::codec;
use crate::entry::LogEntry;
use crate::error::{Result, StorageError};

/// Sentinel opening a framed record or index slot.
pub const MAGIC_START: u32 = 123_456_789;
/// Sentinel closing a framed record or index slot.
pub const MAGIC_END: u32 = 987_654_321;

const SIXTY_FOUR_KIB: u64 = 64 * 1024;
const DEFAULT_DATA_REGION_SIZE: u64 = 4 * 1024 * 1024;

/// `index(8) | term(8) | type(4) | len(4)` — see [`codec::put_message`].
const ENTRY_HEADER_LEN: u64 = 24;
/// `MAGIC_START(4) + message + MAGIC_END(4)`.
const ENTRY_FRAME_OVERHEAD: u64 = 8;
/// The smallest an on-disk entry frame can be (zero-length payload).
const MIN_ENTRY_FRAME_LEN: u64 = ENTRY_HEADER_LEN + ENTRY_FRAME_OVERHEAD;

/// `MAGIC_START(4) + log_index(8) + data_offset(4) + MAGIC_END(4)`.
pub const INDEX_SLOT_SIZE: u64 = 20;

fn round_up_64kib(size: u64) -> u64 {
    size.div_ceil(SIXTY_FOUR_KIB) * SIXTY_FOUR_KIB
}

/// Rounds `max_size` up to a 64 KiB multiple, with a 4 MiB floor.
pub fn data_region_size(max_size: u64) -> u64 {
    round_up_64kib(max_size).max(DEFAULT_DATA_REGION_SIZE)
}

/// Enough 20-byte slots to describe the worst case of minimum-sized
/// entries filling `data_region_size`, rounded up to 64 KiB.
pub fn compute_index_region(data_region_size: u64) -> u64 {
    let max_entries = data_region_size / MIN_ENTRY_FRAME_LEN;
    round_up_64kib(max_entries * INDEX_SLOT_SIZE).max(SIXTY_FOUR_KIB)
}

/// Mutable state behind the segment's `RwLock`: the mapped regions and
/// the write cursor. Guarded together so a structural read (e.g.
/// `read_range` walking several slots) observes a consistent snapshot.
struct SegmentInner {
    data_mmap: MmapMut,
    index_mmap: MmapMut,
    /// Byte offset in `data_mmap` where the next entry frame will start.
    data_write_pos: u64,
    last_index: LogIndex,
    last_term: Term,
    /// Set once an append would exceed the data region; only reads and
    /// truncation are permitted from then on.
    eof: bool,
}

/// One memory-mapped data/index file pair covering a contiguous range of
/// log indices.
pub struct Segment {
    start_index: LogIndex,
    data_path: PathBuf,
    index_path: PathBuf,
    data_region_size: u64,
    index_region_size: u64,
    /// Taken by `write` and `truncate`, before the `RwLock`; see the
    /// module-level lock-ordering note in `log_manager`.
    write_lock: Mutex<()>,
    inner: RwLock<SegmentInner>,
    auto_delete: std::sync::atomic::AtomicBool,
}

impl Segment {
    /// Opens `path`/`path.index`, creating and preallocating them if
    /// absent, and reloads whatever entries are already on disk.
    ///
    /// `start_index` is used only for a freshly created, still-empty
    /// segment; a non-empty segment's `start_index` is recovered from the
    /// index region itself during reload, per the file layout in
    /// `log_manager`.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Io`] if the files cannot be created, sized,
    /// or mapped, and [`StorageError::Corruption`] if the index region is
    /// not a well-formed prefix of valid slots.
    pub fn open(path: impl AsRef<Path>, max_size: u64, start_index: LogIndex) -> Result<Self> {
        let data_path = path.as_ref().to_path_buf();
        let index_path = index_path_for(&data_path);
        let data_region_size = data_region_size(max_size);
        let index_region_size = compute_index_region(data_region_size);

        let data_file = open_and_size(&data_path, data_region_size)?;
        let index_file = open_and_size(&index_path, index_region_size)?;

        // SAFETY: both files are owned exclusively by this segment for its
        // lifetime; no other process is expected to truncate them while mapped.
        #[allow(unsafe_code)]
        let data_mmap = unsafe { MmapMut::map_mut(&data_file)? };
        #[allow(unsafe_code)]
        let index_mmap = unsafe { MmapMut::map_mut(&index_file)? };

        let reloaded = reload(&data_mmap, &index_mmap, index_region_size, start_index)?;

        tracing::debug!(
            path = %data_path.display(),
            start_index = %reloaded.start_index,
            last_index = %reloaded.last_index,
            "opened segment"
        );

        Ok(Self {
            start_index: reloaded.start_index,
            data_path,
            index_path,
            data_region_size,
            index_region_size,
            write_lock: Mutex::new(()),
            inner: RwLock::new(SegmentInner {
                data_mmap,
                index_mmap,
                data_write_pos: reloaded.data_write_pos,
                last_index: reloaded.last_index,
                last_term: reloaded.last_term,
                eof: false,
            }),
            auto_delete: std::sync::atomic::AtomicBool::new(false),
        })
    }

    pub fn start_index(&self) -> LogIndex {
        self.start_index
    }

    pub fn last_index(&self) -> LogIndex {
        self.inner.read().expect("segment lock poisoned").last_index
    }

    pub fn last_term(&self) -> Term {
        self.inner.read().expect("segment lock poisoned").last_term
    }

    pub fn is_empty(&self) -> bool {
        self.last_index().next() == self.start_index
    }

    pub fn is_eof(&self) -> bool {
        self.inner.read().expect("segment lock poisoned").eof
    }

    /// Marks the file pair for unlinking when this segment is dropped.
    pub fn set_auto_delete(&self, auto_delete: bool) {
        self.auto_delete
            .store(auto_delete, std::sync::atomic::Ordering::SeqCst);
    }

    /// Appends `entry` to the segment.
    ///
    /// # Errors
    ///
    /// - [`StorageError::InvalidArgument`] if `entry.index` does not
    ///   equal `last_index + 1`.
    /// - [`StorageError::SegmentFull`] if the entry does not fit in the
    ///   remaining data region; the segment is marked `eof` and the log
    ///   manager should roll to a new segment.
    pub fn write(&self, entry: &LogEntry) -> Result<()> {
        let _write_guard = self.write_lock.lock().expect("write lock poisoned");
        let mut inner = self.inner.write().expect("segment lock poisoned");

        if inner.eof {
            return Err(StorageError::SegmentFull);
        }

        let expected = inner.last_index.next();
        if entry.index != expected {
            return Err(StorageError::InvalidArgument(format!(
                "expected next index {expected}, got {}",
                entry.index
            )));
        }

        let message_len = entry.message_len() as u64;
        let frame_len = message_len + 8;
        let slot_index = entry.index.as_u64() - self.start_index.as_u64();
        let slot_offset = slot_index * INDEX_SLOT_SIZE;

        if inner.data_write_pos + frame_len > self.data_region_size
            || slot_offset + INDEX_SLOT_SIZE > self.index_region_size
        {
            inner.eof = true;
            return Err(StorageError::SegmentFull);
        }

        let data_offset = inner.data_write_pos;
        {
            let buf = &mut inner.data_mmap[..];
            let mut pos = data_offset as usize;
            codec::put_u32(buf, &mut pos, MAGIC_START);
            codec::put_message(buf, &mut pos, entry);
            codec::put_u32(buf, &mut pos, MAGIC_END);
            debug_assert_eq!(pos as u64, data_offset + frame_len);
        }

        // The index slot is the commit point: write it only after the data
        // bytes are in place so a concurrent reader never observes a slot
        // pointing at a torn entry.
        {
            let buf = &mut inner.index_mmap[..];
            let mut pos = slot_offset as usize;
            codec::put_u32(buf, &mut pos, MAGIC_START);
            codec::put_u64(buf, &mut pos, entry.index.as_u64());
            codec::put_u32(buf, &mut pos, data_offset as u32);
            codec::put_u32(buf, &mut pos, MAGIC_END);
        }

        inner.data_write_pos += frame_len;
        inner.last_index = entry.index;
        inner.last_term = entry.term;

        tracing::debug!(index = %entry.index, term = %entry.term, "wrote entry");
        Ok(())
    }

    /// Reads the entry at `index`.
    ///
    /// # Errors
    ///
    /// [`StorageError::NotFound`] if `index` is outside
    /// `[start_index, last_index]`; [`StorageError::Corruption`] if a
    /// magic sentinel or the stored index does not match.
    pub fn read(&self, index: LogIndex) -> Result<LogEntry> {
        let inner = self.inner.read().expect("segment lock poisoned");
        self.read_locked(&inner, index)
    }

    fn read_locked(&self, inner: &SegmentInner, index: LogIndex) -> Result<LogEntry> {
        if index < self.start_index || index > inner.last_index {
            return Err(StorageError::NotFound(index));
        }

        let slot_index = index.as_u64() - self.start_index.as_u64();
        let slot_offset = (slot_index * INDEX_SLOT_SIZE) as usize;
        let slot = &inner.index_mmap[slot_offset..slot_offset + INDEX_SLOT_SIZE as usize];

        let mut pos = 0;
        let magic_start = codec::get_u32(slot, &mut pos);
        if magic_start != MAGIC_START {
            return Err(StorageError::Corruption(format!(
                "index slot {slot_index} missing MAGIC_START"
            )));
        }
        let stored_index = codec::get_u64(slot, &mut pos);
        if stored_index != index.as_u64() {
            return Err(StorageError::Corruption(format!(
                "index slot {slot_index} stores index {stored_index}, expected {index}"
            )));
        }
        let data_offset = codec::get_u32(slot, &mut pos) as usize;
        let magic_end = codec::get_u32(slot, &mut pos);
        if magic_end != MAGIC_END {
            return Err(StorageError::Corruption(format!(
                "index slot {slot_index} missing MAGIC_END"
            )));
        }

        self.decode_entry_at(inner, data_offset)
    }

    fn decode_entry_at(&self, inner: &SegmentInner, data_offset: usize) -> Result<LogEntry> {
        let mut pos = data_offset;
        let buf = &inner.data_mmap[..];
        let magic_start = codec::get_u32(buf, &mut pos);
        if magic_start != MAGIC_START {
            return Err(StorageError::Corruption(format!(
                "data offset {data_offset} missing MAGIC_START"
            )));
        }
        let entry = codec::get_message(buf, &mut pos)?;
        let magic_end = codec::get_u32(buf, &mut pos);
        if magic_end != MAGIC_END {
            return Err(StorageError::Corruption(format!(
                "data offset {data_offset} missing MAGIC_END"
            )));
        }
        Ok(entry)
    }

    /// Reads entries starting at `from`, stopping before exceeding
    /// `max_bytes` or `max_count`, reaching `last_index`, or reaching the
    /// index-region capacity boundary.
    ///
    /// Returns the entries read and the number of message bytes consumed.
    /// At least one entry is returned if `from` is present and the caps
    /// allow it.
    ///
    /// # Errors
    ///
    /// [`StorageError::NotFound`] if `from` is outside the segment's range.
    pub fn read_range(
        &self,
        from: LogIndex,
        max_bytes: u64,
        max_count: usize,
    ) -> Result<(Vec<LogEntry>, u64)> {
        let inner = self.inner.read().expect("segment lock poisoned");
        if from < self.start_index || from > inner.last_index {
            return Err(StorageError::NotFound(from));
        }

        let mut entries = Vec::new();
        let mut bytes_consumed: u64 = 0;
        let mut index = from;

        loop {
            if index > inner.last_index {
                break;
            }
            let slot_index = index.as_u64() - self.start_index.as_u64();
            if slot_index * INDEX_SLOT_SIZE >= self.index_region_size {
                break;
            }

            let entry = self.read_locked(&inner, index)?;
            let entry_len = entry.message_len() as u64;

            if !entries.is_empty() && bytes_consumed + entry_len > max_bytes {
                break;
            }
            if entries.len() >= max_count {
                break;
            }

            bytes_consumed += entry_len;
            index = index.next();
            entries.push(entry);
        }

        Ok((entries, bytes_consumed))
    }

    /// Drops all entries after `index`.
    ///
    /// Zeroes the index slot for `index + 1` (not `index`, which must
    /// remain readable) so a future reload sees no entries beyond `index`.
    ///
    /// # Errors
    ///
    /// [`StorageError::InvalidArgument`] if `index` is outside
    /// `[start_index, last_index]`.
    pub fn truncate(&self, index: LogIndex) -> Result<()> {
        let _write_guard = self.write_lock.lock().expect("write lock poisoned");
        let mut inner = self.inner.write().expect("segment lock poisoned");

        if index < self.start_index || index > inner.last_index {
            return Err(StorageError::InvalidArgument(format!(
                "truncate index {index} outside [{}, {}]",
                self.start_index, inner.last_index
            )));
        }

        let next = index.next();
        if next <= inner.last_index {
            let slot_index = next.as_u64() - self.start_index.as_u64();
            let slot_offset = (slot_index * INDEX_SLOT_SIZE) as usize;
            inner.index_mmap[slot_offset..slot_offset + 4].copy_from_slice(&0u32.to_le_bytes());
        }

        let slot_index = index.as_u64() - self.start_index.as_u64();
        let slot_offset = (slot_index * INDEX_SLOT_SIZE) as usize;
        let mut slot_pos = slot_offset + 12; // past MAGIC_START + log_index
        let data_offset = codec::get_u32(&inner.index_mmap[..], &mut slot_pos) as u64;

        let mut pos = data_offset as usize;
        let buf = &inner.data_mmap[..];
        let _magic_start = codec::get_u32(buf, &mut pos);
        let mut len_pos = pos + 20; // index(8) + term(8) + type(4), then len(4)
        let data_len = codec::get_u32(buf, &mut len_pos) as u64;
        let message_len = data_len + ENTRY_HEADER_LEN;
        let new_write_pos = data_offset + ENTRY_FRAME_OVERHEAD + message_len;

        inner.last_index = index;
        inner.data_write_pos = new_write_pos;
        inner.eof = false;

        tracing::info!(index = %index, "truncated segment");
        Ok(())
    }
}

impl Drop for Segment {
    fn drop(&mut self) {
        if self.auto_delete.load(std::sync::atomic::Ordering::SeqCst) {
            if let Err(e) = std::fs::remove_file(&self.data_path) {
                tracing::warn!(path = %self.data_path.display(), error = %e, "failed to remove segment data file");
            }
            if let Err(e) = std::fs::remove_file(&self.index_path) {
                tracing::warn!(path = %self.index_path.display(), error = %e, "failed to remove segment index file");
            }
        }
    }
}

fn index_path_for(data_path: &Path) -> PathBuf {
    let mut s = data_path.as_os_str().to_owned();
    s.push(".index");
    PathBuf::from(s)
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

struct Reloaded {
    start_index: LogIndex,
    last_index: LogIndex,
    last_term: Term,
    data_write_pos: u64,
}

/// Scans the index region forward from slot 0. The first valid slot
/// fixes `start_index`; scanning stops at the first slot whose leading
/// `u32` is not `MAGIC_START`, which marks the append position.
fn reload(
    data_mmap: &MmapMut,
    index_mmap: &MmapMut,
    index_region_size: u64,
    fallback_start_index: LogIndex,
) -> Result<Reloaded> {
    let slot_count = index_region_size / INDEX_SLOT_SIZE;
    let mut start_index = None;
    let mut last_index = LogIndex::NONE;
    let mut last_term = Term::ZERO;
    let mut last_data_offset: Option<u64> = None;

    for slot in 0..slot_count {
        let slot_offset = (slot * INDEX_SLOT_SIZE) as usize;
        let slot_bytes = &index_mmap[slot_offset..slot_offset + INDEX_SLOT_SIZE as usize];
        let mut pos = 0;
        let magic_start = codec::get_u32(slot_bytes, &mut pos);
        if magic_start != MAGIC_START {
            break;
        }
        let stored_index = codec::get_u64(slot_bytes, &mut pos);
        let data_offset = codec::get_u32(slot_bytes, &mut pos) as u64;
        let magic_end = codec::get_u32(slot_bytes, &mut pos);
        if magic_end != MAGIC_END {
            return Err(StorageError::Corruption(format!(
                "index slot {slot} missing MAGIC_END during reload"
            )));
        }

        if start_index.is_none() {
            start_index = Some(LogIndex::new(stored_index));
        }
        last_index = LogIndex::new(stored_index);
        last_data_offset = Some(data_offset);
    }

    let start_index = start_index.unwrap_or(fallback_start_index);

    let data_write_pos = if let Some(data_offset) = last_data_offset {
        let mut pos = data_offset as usize;
        let buf = &data_mmap[..];
        let magic_start = codec::get_u32(buf, &mut pos);
        if magic_start != MAGIC_START {
            return Err(StorageError::Corruption(format!(
                "data offset {data_offset} missing MAGIC_START during reload"
            )));
        }
        let entry = codec::get_message(buf, &mut pos)?;
        let magic_end = codec::get_u32(buf, &mut pos);
        if magic_end != MAGIC_END {
            return Err(StorageError::Corruption(format!(
                "data offset {data_offset} missing MAGIC_END during reload"
            )));
        }
        last_term = entry.term;
        pos as u64
    } else {
        0
    };

    Ok(Reloaded {
        start_index,
        last_index: if last_data_offset.is_some() {
            last_index
        } else {
            start_index.prev()
        },
        last_term,
        data_write_pos,
    })
}
