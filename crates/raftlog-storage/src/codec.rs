//! Primitive byte pack/unpack for fixed-width integers, length-prefixed
//! strings, and the log entry message schema.
//!
//! Every `put_*`/`get_*` pair advances a cursor through a byte slice; the
//! codec does no framing of its own — magic sentinels and record tags are
//! the caller's responsibility (see [`crate::segment`] and
//! [`crate::metadata`]). All integers are little-endian, fixed for every
//! implementation of this format.

use bytes::Bytes;
use raftlog_types::{EntryType, LogIndex, Term};

use crate::entry::LogEntry;
use crate::error::{Result, StorageError};

pub fn put_u8(buf: &mut [u8], pos: &mut usize, value: u8) {
    buf[*pos] = value;
    *pos += 1;
}

pub fn put_u32(buf: &mut [u8], pos: &mut usize, value: u32) {
    buf[*pos..*pos + 4].copy_from_slice(&value.to_le_bytes());
    *pos += 4;
}

pub fn put_u64(buf: &mut [u8], pos: &mut usize, value: u64) {
    buf[*pos..*pos + 8].copy_from_slice(&value.to_le_bytes());
    *pos += 8;
}

/// Writes a `u32` length prefix followed by the string's UTF-8 bytes.
pub fn put_string(buf: &mut [u8], pos: &mut usize, value: &str) {
    put_u32(buf, pos, value.len() as u32);
    let bytes = value.as_bytes();
    buf[*pos..*pos + bytes.len()].copy_from_slice(bytes);
    *pos += bytes.len();
}

pub fn get_u8(buf: &[u8], pos: &mut usize) -> u8 {
    let v = buf[*pos];
    *pos += 1;
    v
}

pub fn get_u32(buf: &[u8], pos: &mut usize) -> u32 {
    let v = u32::from_le_bytes(buf[*pos..*pos + 4].try_into().expect("4 bytes"));
    *pos += 4;
    v
}

pub fn get_u64(buf: &[u8], pos: &mut usize) -> u64 {
    let v = u64::from_le_bytes(buf[*pos..*pos + 8].try_into().expect("8 bytes"));
    *pos += 8;
    v
}

/// Reads a `u32` length prefix followed by that many bytes, decoded as UTF-8.
///
/// # Errors
///
/// Returns [`StorageError::Corruption`] if the bytes are not valid UTF-8.
pub fn get_string(buf: &[u8], pos: &mut usize) -> Result<String> {
    let len = get_u32(buf, pos) as usize;
    let bytes = &buf[*pos..*pos + len];
    *pos += len;
    String::from_utf8(bytes.to_vec())
        .map_err(|e| StorageError::Corruption(format!("invalid UTF-8 string: {e}")))
}

/// Encodes a [`LogEntry`] as `u64 index | u64 term | u32 type | u32 len | bytes`.
///
/// The caller is responsible for bracketing the result with magic
/// sentinels; see [`LogEntry::message_len`] for the number of bytes this
/// writes.
pub fn put_message(buf: &mut [u8], pos: &mut usize, entry: &LogEntry) {
    put_u64(buf, pos, entry.index.as_u64());
    put_u64(buf, pos, entry.term.as_u64());
    put_u32(buf, pos, entry.entry_type.as_u32());
    put_u32(buf, pos, entry.data.len() as u32);
    buf[*pos..*pos + entry.data.len()].copy_from_slice(&entry.data);
    *pos += entry.data.len();
}

/// Decodes a [`LogEntry`] written by [`put_message`].
///
/// # Errors
///
/// Returns [`StorageError::Corruption`] if the entry type discriminant is
/// not recognized.
pub fn get_message(buf: &[u8], pos: &mut usize) -> Result<LogEntry> {
    let index = LogIndex::new(get_u64(buf, pos));
    let term = Term::new(get_u64(buf, pos));
    let type_byte = get_u32(buf, pos);
    let entry_type = EntryType::from_u32(type_byte)
        .ok_or_else(|| StorageError::Corruption(format!("invalid entry type {type_byte}")))?;
    let len = get_u32(buf, pos) as usize;
    let data = Bytes::copy_from_slice(&buf[*pos..*pos + len]);
    *pos += len;
    Ok(LogEntry::new(index, term, entry_type, data))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn integers_round_trip_little_endian() {
        let mut buf = [0u8; 8];
        let mut pos = 0;
        put_u64(&mut buf, &mut pos, 0x0102_0304_0506_0708);
        assert_eq!(buf[0], 0x08, "least-significant byte first");
        pos = 0;
        assert_eq!(get_u64(&buf, &mut pos), 0x0102_0304_0506_0708);
    }

    #[test]
    fn string_round_trips() {
        let mut buf = [0u8; 32];
        let mut pos = 0;
        put_string(&mut buf, &mut pos, "hello");
        let written = pos;
        pos = 0;
        let s = get_string(&buf[..written], &mut pos).unwrap();
        assert_eq!(s, "hello");
    }

    #[test]
    fn message_round_trips() {
        let entry = LogEntry::new(
            LogIndex::new(7),
            Term::new(2),
            EntryType::RaftLog,
            Bytes::from_static(b"payload"),
        );
        let mut buf = vec![0u8; entry.message_len()];
        let mut pos = 0;
        put_message(&mut buf, &mut pos, &entry);
        assert_eq!(pos, entry.message_len());

        let mut pos = 0;
        let decoded = get_message(&buf, &mut pos).unwrap();
        assert_eq!(decoded, entry);
    }

    #[test]
    fn message_rejects_invalid_entry_type() {
        let mut buf = vec![0u8; 24];
        let mut pos = 0;
        put_u64(&mut buf, &mut pos, 1);
        put_u64(&mut buf, &mut pos, 1);
        put_u32(&mut buf, &mut pos, 99); // invalid discriminant
        put_u32(&mut buf, &mut pos, 0);

        let mut pos = 0;
        assert!(matches!(
            get_message(&buf, &mut pos),
            Err(StorageError::Corruption(_))
        ));
    }
}
