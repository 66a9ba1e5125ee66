//! Disk-backed state store on a memory-mapped record log.
//!
//! # Design
//!
//! - **Data tier**: an append-only log of put and delete records in a
//!   memory-mapped file. Every record carries a crc32c over its kind, key and
//!   value.
//! - **Index tier**: `BTreeMap` from key to the offset of its latest value,
//!   rebuilt by replaying the log when the file is reopened.
//!
//! Replay stops at the first zeroed or corrupt record; anything after a torn
//! write is discarded. Deleted and overwritten values stay in the log until
//! [`MmapStateStore::compact`] rewrites the live set, which also runs on its
//! own once more than half of a sizeable log is dead.
//!
//! # Record layout
//!
//! ```text
//! | kind u8 | key_len u32 | value_len u32 | crc32c u32 | key | value |
//! ```

use bytes::Bytes;
use memmap2::MmapMut;
use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::ops::{Bound, Range};
use std::path::{Path, PathBuf};

use super::{prefix_successor, StateError, StateSnapshot, StateStore};

/// Header size in the mmap file (magic + version + reserved).
const MMAP_HEADER_SIZE: usize = 32;
/// "WINDJOIN"
const MMAP_MAGIC: u64 = 0x5749_4E44_4A4F_494E;
/// Current file format version.
const MMAP_VERSION: u32 = 1;
/// Initial file size for new stores.
const DEFAULT_CAPACITY: usize = 64 * 1024;
/// Bytes of a record before its key.
const RECORD_HEADER_SIZE: usize = 13;
/// Logs smaller than this are never compacted automatically.
const AUTO_COMPACT_MIN_BYTES: usize = 256 * 1024;

const KIND_PUT: u8 = 1;
const KIND_DELETE: u8 = 2;

/// Location of a live value inside the data region.
#[derive(Debug, Clone, Copy)]
struct ValueEntry {
    offset: usize,
    len: usize,
}

/// Persistent state store backed by a memory-mapped record log.
///
/// ```rust,no_run
/// use windjoin_core::state::{MmapStateStore, StateStore};
/// use std::path::Path;
///
/// let mut store = MmapStateStore::open(Path::new("/tmp/left.state")).unwrap();
/// store.put(b"key", b"value").unwrap();
/// store.flush().unwrap();
///
/// drop(store);
/// let store = MmapStateStore::open(Path::new("/tmp/left.state")).unwrap();
/// assert_eq!(store.get(b"key").unwrap().as_ref(), b"value");
/// ```
pub struct MmapStateStore {
    index: BTreeMap<Vec<u8>, ValueEntry>,
    mmap: MmapMut,
    file: File,
    path: PathBuf,
    /// End of the log, relative to the data region.
    write_pos: usize,
    capacity: usize,
    size_bytes: usize,
}

impl std::fmt::Debug for MmapStateStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MmapStateStore")
            .field("path", &self.path)
            .field("entries", &self.index.len())
            .field("write_pos", &self.write_pos)
            .field("capacity", &self.capacity)
            .finish_non_exhaustive()
    }
}

impl MmapStateStore {
    /// Opens or creates a store at `path` with the default initial size.
    ///
    /// # Errors
    ///
    /// Returns `StateError::Io` if file operations fail, or
    /// `StateError::Corruption` if the file is not a state file.
    pub fn open(path: &Path) -> Result<Self, StateError> {
        Self::open_with_capacity(path, DEFAULT_CAPACITY)
    }

    /// Opens or creates a store, sizing a new file to `initial_capacity`.
    ///
    /// An existing file is validated and its log replayed into the index.
    ///
    /// # Errors
    ///
    /// Returns `StateError::Io` if file operations fail, or
    /// `StateError::Corruption` if the header is invalid.
    pub fn open_with_capacity(path: &Path, initial_capacity: usize) -> Result<Self, StateError> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;

        let existing_len = usize::try_from(file.metadata()?.len())
            .map_err(|_| StateError::CapacityExceeded(path.display().to_string()))?;
        let is_new = existing_len < MMAP_HEADER_SIZE;

        let capacity = if is_new {
            let capacity = initial_capacity.max(MMAP_HEADER_SIZE + 1024);
            file.set_len(capacity as u64)?;
            capacity
        } else {
            existing_len
        };

        // SAFETY: the file was opened read/write by this call and is only
        // reachable through this store, which takes &mut self for every write.
        #[allow(unsafe_code)]
        let mut mmap = unsafe { MmapMut::map_mut(&file)? };

        if is_new {
            mmap[..MMAP_HEADER_SIZE].fill(0);
            mmap[0..8].copy_from_slice(&MMAP_MAGIC.to_le_bytes());
            mmap[8..12].copy_from_slice(&MMAP_VERSION.to_le_bytes());
        } else {
            Self::validate_header(&mmap)?;
        }

        let mut store = Self {
            index: BTreeMap::new(),
            mmap,
            file,
            path: path.to_path_buf(),
            write_pos: 0,
            capacity,
            size_bytes: 0,
        };
        if !is_new {
            store.replay();
        }
        Ok(store)
    }

    fn validate_header(mmap: &MmapMut) -> Result<(), StateError> {
        let magic = read_u64(mmap, 0);
        if magic != Some(MMAP_MAGIC) {
            return Err(StateError::Corruption(
                "Invalid magic number in state file".to_string(),
            ));
        }
        match read_u32(mmap, 8) {
            Some(MMAP_VERSION) => Ok(()),
            other => Err(StateError::Corruption(format!(
                "Unsupported state file version: {other:?}"
            ))),
        }
    }

    /// Rebuilds the index from the log, stopping at the first invalid record.
    fn replay(&mut self) {
        let data = &self.mmap[MMAP_HEADER_SIZE..];
        let mut pos = 0;
        let mut records = 0u64;

        while let Some(kind) = data.get(pos).copied() {
            if kind == 0 {
                break;
            }
            let Some(record) = decode_record(data, pos) else {
                tracing::warn!(
                    path = %self.path.display(),
                    offset = pos,
                    "corrupt record in state log, discarding tail"
                );
                break;
            };
            match record.kind {
                KIND_PUT => {
                    let entry = ValueEntry {
                        offset: record.value_offset,
                        len: record.value_len,
                    };
                    let key = data[record.key_offset..record.key_offset + record.key_len].to_vec();
                    if let Some(old) = self.index.insert(key, entry) {
                        self.size_bytes -= old.len;
                        self.size_bytes += record.value_len;
                    } else {
                        self.size_bytes += record.key_len + record.value_len;
                    }
                }
                _ => {
                    let key = &data[record.key_offset..record.key_offset + record.key_len];
                    if let Some(old) = self.index.remove(key) {
                        self.size_bytes -= key.len() + old.len;
                    }
                }
            }
            pos = record.end;
            records += 1;
        }

        // zero anything after the last good record so later appends replay cleanly
        let tail_end = self.capacity - MMAP_HEADER_SIZE;
        if pos < tail_end && data[pos..tail_end].iter().any(|b| *b != 0) {
            self.mmap[MMAP_HEADER_SIZE + pos..].fill(0);
        }
        self.write_pos = pos;

        tracing::debug!(
            path = %self.path.display(),
            records,
            live = self.index.len(),
            "state log replayed"
        );
    }

    /// Appends a record and returns the data-region offset of its value.
    fn append(&mut self, kind: u8, key: &[u8], value: &[u8]) -> Result<usize, StateError> {
        let key_len = u32::try_from(key.len())
            .map_err(|_| StateError::CapacityExceeded("key longer than 4 GiB".to_string()))?;
        let value_len = u32::try_from(value.len())
            .map_err(|_| StateError::CapacityExceeded("value longer than 4 GiB".to_string()))?;

        let record_len = RECORD_HEADER_SIZE + key.len() + value.len();
        let start = self.write_pos;
        let end = start + record_len;
        // one spare byte keeps a zero terminator after the last record
        self.ensure_capacity(MMAP_HEADER_SIZE + end + 1)?;

        let mut crc = crc32c::crc32c(&[kind]);
        crc = crc32c::crc32c_append(crc, key);
        crc = crc32c::crc32c_append(crc, value);

        let base = MMAP_HEADER_SIZE + start;
        let buf = &mut self.mmap[base..base + record_len];
        buf[0] = kind;
        buf[1..5].copy_from_slice(&key_len.to_le_bytes());
        buf[5..9].copy_from_slice(&value_len.to_le_bytes());
        buf[9..13].copy_from_slice(&crc.to_le_bytes());
        buf[RECORD_HEADER_SIZE..RECORD_HEADER_SIZE + key.len()].copy_from_slice(key);
        buf[RECORD_HEADER_SIZE + key.len()..].copy_from_slice(value);

        self.write_pos = end;
        Ok(start + RECORD_HEADER_SIZE + key.len())
    }

    fn ensure_capacity(&mut self, required: usize) -> Result<(), StateError> {
        if required <= self.capacity {
            return Ok(());
        }
        let new_capacity = required + required / 2;
        self.mmap.flush()?;
        self.file.set_len(new_capacity as u64)?;
        // SAFETY: the file was just resized and we hold &mut self, so no
        // slices into the old mapping are alive.
        #[allow(unsafe_code)]
        {
            self.mmap = unsafe { MmapMut::map_mut(&self.file)? };
        }
        self.capacity = new_capacity;
        Ok(())
    }

    /// Truncates the log to empty without touching the index.
    fn reset_log(&mut self) {
        let used_end = MMAP_HEADER_SIZE + self.write_pos;
        self.mmap[MMAP_HEADER_SIZE..used_end].fill(0);
        self.write_pos = 0;
    }

    fn value_at(&self, entry: ValueEntry) -> &[u8] {
        let start = MMAP_HEADER_SIZE + entry.offset;
        &self.mmap[start..start + entry.len]
    }

    /// Returns the path of the backing file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Returns the number of log bytes in use, live or dead.
    #[must_use]
    pub fn log_bytes(&self) -> usize {
        self.write_pos
    }

    /// Rewrites the log so it contains one put record per live key.
    ///
    /// # Errors
    ///
    /// Returns `StateError` if the file cannot grow while rewriting.
    pub fn compact(&mut self) -> Result<(), StateError> {
        let live: Vec<(Vec<u8>, Vec<u8>)> = self
            .index
            .iter()
            .map(|(k, entry)| (k.clone(), self.value_at(*entry).to_vec()))
            .collect();
        let before = self.write_pos;

        self.reset_log();
        for (key, value) in &live {
            let offset = self.append(KIND_PUT, key, value)?;
            if let Some(entry) = self.index.get_mut(key.as_slice()) {
                entry.offset = offset;
            }
        }

        tracing::debug!(
            path = %self.path.display(),
            before,
            after = self.write_pos,
            "state log compacted"
        );
        Ok(())
    }

    /// Fraction of the log occupied by dead records.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn fragmentation(&self) -> f64 {
        if self.write_pos == 0 {
            return 0.0;
        }
        let live: usize = self
            .index
            .iter()
            .map(|(k, e)| RECORD_HEADER_SIZE + k.len() + e.len)
            .sum();
        1.0 - (live as f64 / self.write_pos as f64)
    }

    fn maybe_compact(&mut self) -> Result<(), StateError> {
        if self.write_pos >= AUTO_COMPACT_MIN_BYTES && self.fragmentation() > 0.5 {
            self.compact()?;
        }
        Ok(())
    }
}

impl StateStore for MmapStateStore {
    #[inline]
    fn get(&self, key: &[u8]) -> Option<Bytes> {
        self.index
            .get(key)
            .map(|entry| Bytes::copy_from_slice(self.value_at(*entry)))
    }

    fn put(&mut self, key: &[u8], value: &[u8]) -> Result<(), StateError> {
        let offset = self.append(KIND_PUT, key, value)?;
        let entry = ValueEntry {
            offset,
            len: value.len(),
        };
        if let Some(old) = self.index.insert(key.to_vec(), entry) {
            self.size_bytes -= old.len;
            self.size_bytes += value.len();
        } else {
            self.size_bytes += key.len() + value.len();
        }
        self.maybe_compact()
    }

    fn delete(&mut self, key: &[u8]) -> Result<(), StateError> {
        if !self.index.contains_key(key) {
            return Ok(());
        }
        self.append(KIND_DELETE, key, &[])?;
        if let Some(old) = self.index.remove(key) {
            self.size_bytes -= key.len() + old.len;
        }
        self.maybe_compact()
    }

    fn prefix_scan<'a>(
        &'a self,
        prefix: &'a [u8],
    ) -> Box<dyn Iterator<Item = (Bytes, Bytes)> + 'a> {
        let upper = match prefix_successor(prefix) {
            Some(end) => Bound::Excluded(end),
            None => Bound::Unbounded,
        };
        Box::new(
            self.index
                .range::<[u8], _>((Bound::Included(prefix), upper.as_ref().map(Vec::as_slice)))
                .map(|(k, entry)| {
                    (
                        Bytes::copy_from_slice(k),
                        Bytes::copy_from_slice(self.value_at(*entry)),
                    )
                }),
        )
    }

    fn range_scan<'a>(
        &'a self,
        range: Range<&'a [u8]>,
    ) -> Box<dyn Iterator<Item = (Bytes, Bytes)> + 'a> {
        if range.start >= range.end {
            return Box::new(std::iter::empty());
        }
        Box::new(
            self.index
                .range::<[u8], _>((Bound::Included(range.start), Bound::Excluded(range.end)))
                .map(|(k, entry)| {
                    (
                        Bytes::copy_from_slice(k),
                        Bytes::copy_from_slice(self.value_at(*entry)),
                    )
                }),
        )
    }

    #[inline]
    fn contains(&self, key: &[u8]) -> bool {
        self.index.contains_key(key)
    }

    fn size_bytes(&self) -> usize {
        self.size_bytes
    }

    fn len(&self) -> usize {
        self.index.len()
    }

    fn snapshot(&self) -> StateSnapshot {
        let data = self
            .index
            .iter()
            .map(|(k, entry)| (k.clone(), self.value_at(*entry).to_vec()))
            .collect();
        StateSnapshot::new(data)
    }

    fn restore(&mut self, snapshot: StateSnapshot) -> Result<(), StateError> {
        self.clear()?;
        for (key, value) in snapshot.into_data() {
            let offset = self.append(KIND_PUT, &key, &value)?;
            self.size_bytes += key.len() + value.len();
            self.index.insert(
                key,
                ValueEntry {
                    offset,
                    len: value.len(),
                },
            );
        }
        self.flush()
    }

    fn clear(&mut self) -> Result<(), StateError> {
        self.reset_log();
        self.index.clear();
        self.size_bytes = 0;
        Ok(())
    }

    fn flush(&mut self) -> Result<(), StateError> {
        self.mmap.flush()?;
        Ok(())
    }
}

/// A decoded log record; offsets are relative to the data region.
struct Record {
    kind: u8,
    key_offset: usize,
    key_len: usize,
    value_offset: usize,
    value_len: usize,
    end: usize,
}

fn decode_record(data: &[u8], pos: usize) -> Option<Record> {
    let kind = *data.get(pos)?;
    if kind != KIND_PUT && kind != KIND_DELETE {
        return None;
    }
    let key_len = read_u32(data, pos + 1)? as usize;
    let value_len = read_u32(data, pos + 5)? as usize;
    let stored_crc = read_u32(data, pos + 9)?;

    let key_offset = pos + RECORD_HEADER_SIZE;
    let value_offset = key_offset.checked_add(key_len)?;
    let end = value_offset.checked_add(value_len)?;
    let key = data.get(key_offset..value_offset)?;
    let value = data.get(value_offset..end)?;

    let mut crc = crc32c::crc32c(&[kind]);
    crc = crc32c::crc32c_append(crc, key);
    crc = crc32c::crc32c_append(crc, value);
    (crc == stored_crc).then_some(Record {
        kind,
        key_offset,
        key_len,
        value_offset,
        value_len,
        end,
    })
}

fn read_u32(buf: &[u8], at: usize) -> Option<u32> {
    let bytes: [u8; 4] = buf.get(at..at + 4)?.try_into().ok()?;
    Some(u32::from_le_bytes(bytes))
}

fn read_u64(buf: &[u8], at: usize) -> Option<u64> {
    let bytes: [u8; 8] = buf.get(at..at + 8)?.try_into().ok()?;
    Some(u64::from_le_bytes(bytes))
}
