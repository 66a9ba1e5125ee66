//! # State Store Module
//!
//! Keyed storage for window accumulators and buffered join rows.
//!
//! Every key written by an operator has the shape
//! `operator prefix | window start | window end | group key`, encoded so that
//! byte order equals `(start, end, key)` order. Closing a window is therefore
//! one prefix scan, and a checkpoint is one flat snapshot of the store.
//!
//! ## Backends
//!
//! - **[`InMemoryStore`]**: `BTreeMap` with O(log n + k) prefix and range scans
//! - **[`MmapStateStore`]**: append-only record log in a memory-mapped file,
//!   checksummed per record and replayed on reopen
//!
//! [`StateBackend`] selects one at pipeline construction.
//!
//! ## Example
//!
//! ```rust
//! use windjoin_core::state::{StateStore, StateStoreExt, InMemoryStore};
//!
//! let mut store = InMemoryStore::new();
//!
//! store.put(b"w:0005:a", b"2").unwrap();
//! assert_eq!(store.get(b"w:0005:a").unwrap().as_ref(), b"2");
//!
//! // rkyv-typed access through StateStoreExt
//! store.put_typed(b"count", &42u64).unwrap();
//! let count: u64 = store.get_typed(b"count").unwrap().unwrap();
//! assert_eq!(count, 42);
//!
//! // Snapshots for checkpointing
//! let snapshot = store.snapshot();
//! store.delete(b"w:0005:a").unwrap();
//! assert!(store.get(b"w:0005:a").is_none());
//!
//! store.restore(snapshot).unwrap();
//! assert_eq!(store.get(b"w:0005:a").unwrap().as_ref(), b"2");
//! ```

use bytes::Bytes;
use rkyv::{
    api::high::{HighDeserializer, HighSerializer, HighValidator},
    bytecheck::CheckBytes,
    rancor::Error as RkyvError,
    ser::allocator::ArenaHandle,
    util::AlignedVec,
    Archive, Deserialize as RkyvDeserialize, Serialize as RkyvSerialize,
};
use std::collections::BTreeMap;
use std::fmt;
use std::ops::Bound;
use std::ops::Range;
use std::path::PathBuf;
use std::str::FromStr;

mod mmap;

pub use mmap::MmapStateStore;

/// Compute the lexicographic successor of a byte prefix.
///
/// Returns `None` if no successor exists (empty prefix or all bytes are 0xFF).
pub(crate) fn prefix_successor(prefix: &[u8]) -> Option<Vec<u8>> {
    if prefix.is_empty() {
        return None;
    }
    let mut successor = prefix.to_vec();
    while let Some(last) = successor.last_mut() {
        if *last < 0xFF {
            *last += 1;
            return Some(successor);
        }
        successor.pop();
    }
    None
}

/// Keyed byte store used by window and join operators.
///
/// # Thread Safety
///
/// Stores are `Send` but not `Sync`: each pipeline lane owns its stores and
/// drives them from one thread.
///
/// # Dyn Compatibility
///
/// The trait is dyn-compatible so operators can hold `Box<dyn StateStore>`.
/// Typed helpers live on [`StateStoreExt`].
pub trait StateStore: Send {
    /// Get a value by key.
    fn get(&self, key: &[u8]) -> Option<Bytes>;

    /// Store a key-value pair, overwriting any previous value.
    ///
    /// # Errors
    ///
    /// Returns `StateError` if the write fails (e.g. the backing file cannot
    /// grow).
    fn put(&mut self, key: &[u8], value: &[u8]) -> Result<(), StateError>;

    /// Delete a key. Missing keys are not an error.
    ///
    /// # Errors
    ///
    /// Returns `StateError` if the operation fails.
    fn delete(&mut self, key: &[u8]) -> Result<(), StateError>;

    /// Scan all keys with a given prefix in lexicographic order.
    fn prefix_scan<'a>(&'a self, prefix: &'a [u8])
        -> Box<dyn Iterator<Item = (Bytes, Bytes)> + 'a>;

    /// Scan keys with `start <= key < end` in lexicographic order.
    fn range_scan<'a>(
        &'a self,
        range: Range<&'a [u8]>,
    ) -> Box<dyn Iterator<Item = (Bytes, Bytes)> + 'a>;

    /// Check if a key exists.
    fn contains(&self, key: &[u8]) -> bool {
        self.get(key).is_some()
    }

    /// Approximate live size of keys and values in bytes.
    fn size_bytes(&self) -> usize;

    /// Number of live entries.
    fn len(&self) -> usize;

    /// Check if the store is empty.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Capture the current contents for a checkpoint.
    fn snapshot(&self) -> StateSnapshot;

    /// Replace the current contents with a snapshot.
    ///
    /// # Errors
    ///
    /// Returns `StateError` if a persistent backend cannot rewrite its file.
    fn restore(&mut self, snapshot: StateSnapshot) -> Result<(), StateError>;

    /// Remove all entries.
    ///
    /// # Errors
    ///
    /// Returns `StateError` if a persistent backend cannot truncate its file.
    fn clear(&mut self) -> Result<(), StateError>;

    /// Flush pending writes to durable storage. No-op for in-memory stores.
    ///
    /// # Errors
    ///
    /// Returns `StateError` if the flush operation fails.
    fn flush(&mut self) -> Result<(), StateError> {
        Ok(())
    }
}

/// Typed access on any [`StateStore`] through rkyv.
pub trait StateStoreExt: StateStore {
    /// Get a value and deserialize it.
    ///
    /// # Errors
    ///
    /// Returns `StateError::Deserialization` if the stored bytes do not
    /// validate as `T`.
    fn get_typed<T>(&self, key: &[u8]) -> Result<Option<T>, StateError>
    where
        T: Archive,
        T::Archived: for<'a> CheckBytes<HighValidator<'a, RkyvError>>
            + RkyvDeserialize<T, HighDeserializer<RkyvError>>,
    {
        match self.get(key) {
            Some(bytes) => {
                // rkyv needs an aligned buffer; store values are byte-aligned
                let mut aligned = AlignedVec::<16>::with_capacity(bytes.len());
                aligned.extend_from_slice(&bytes);
                let archived = rkyv::access::<T::Archived, RkyvError>(&aligned)
                    .map_err(|e| StateError::Deserialization(e.to_string()))?;
                let value = rkyv::deserialize::<T, RkyvError>(archived)
                    .map_err(|e| StateError::Deserialization(e.to_string()))?;
                Ok(Some(value))
            }
            None => Ok(None),
        }
    }

    /// Serialize and store a value.
    ///
    /// # Errors
    ///
    /// Returns `StateError::Serialization` if serialization fails.
    fn put_typed<T>(&mut self, key: &[u8], value: &T) -> Result<(), StateError>
    where
        T: for<'a> RkyvSerialize<HighSerializer<AlignedVec, ArenaHandle<'a>, RkyvError>>,
    {
        let bytes = rkyv::to_bytes::<RkyvError>(value)
            .map_err(|e| StateError::Serialization(e.to_string()))?;
        self.put(key, &bytes)
    }

    /// Update a value in place. Returning `None` deletes the key.
    ///
    /// # Errors
    ///
    /// Returns `StateError` if the put or delete operation fails.
    fn update<F>(&mut self, key: &[u8], f: F) -> Result<(), StateError>
    where
        F: FnOnce(Option<Bytes>) -> Option<Vec<u8>>,
    {
        let current = self.get(key);
        match f(current) {
            Some(new_value) => self.put(key, &new_value),
            None => self.delete(key),
        }
    }
}

impl<T: StateStore + ?Sized> StateStoreExt for T {}

/// Point-in-time contents of a store.
#[derive(Debug, Clone, PartialEq, Eq, Archive, RkyvSerialize, RkyvDeserialize)]
pub struct StateSnapshot {
    data: Vec<(Vec<u8>, Vec<u8>)>,
    version: u32,
}

impl StateSnapshot {
    /// Create a snapshot from key-value pairs in key order.
    #[must_use]
    pub fn new(data: Vec<(Vec<u8>, Vec<u8>)>) -> Self {
        Self { data, version: 1 }
    }

    /// Get the snapshot data.
    #[must_use]
    pub fn data(&self) -> &[(Vec<u8>, Vec<u8>)] {
        &self.data
    }

    /// Consume the snapshot, returning its entries.
    #[must_use]
    pub fn into_data(self) -> Vec<(Vec<u8>, Vec<u8>)> {
        self.data
    }

    /// Get the number of entries in the snapshot.
    #[must_use]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Check if the snapshot is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Get the approximate size in bytes.
    #[must_use]
    pub fn size_bytes(&self) -> usize {
        self.data.iter().map(|(k, v)| k.len() + v.len()).sum()
    }

    /// Serialize the snapshot with rkyv.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn to_bytes(&self) -> Result<AlignedVec, StateError> {
        rkyv::to_bytes::<RkyvError>(self).map_err(|e| StateError::Serialization(e.to_string()))
    }

    /// Deserialize a snapshot.
    ///
    /// # Errors
    ///
    /// Returns an error if the bytes are not a valid snapshot.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, StateError> {
        let mut aligned = AlignedVec::<16>::with_capacity(bytes.len());
        aligned.extend_from_slice(bytes);
        let archived = rkyv::access::<<Self as Archive>::Archived, RkyvError>(&aligned)
            .map_err(|e| StateError::Deserialization(e.to_string()))?;
        rkyv::deserialize::<Self, RkyvError>(archived)
            .map_err(|e| StateError::Deserialization(e.to_string()))
    }
}

/// In-memory state store using `BTreeMap` for sorted key access.
///
/// - **Get / Put / Delete**: O(log n)
/// - **Prefix / Range scan**: O(log n + k)
#[derive(Debug)]
pub struct InMemoryStore {
    data: BTreeMap<Vec<u8>, Bytes>,
    size_bytes: usize,
}

impl InMemoryStore {
    /// Creates a new empty in-memory store.
    #[must_use]
    pub fn new() -> Self {
        Self {
            data: BTreeMap::new(),
            size_bytes: 0,
        }
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl StateStore for InMemoryStore {
    #[inline]
    fn get(&self, key: &[u8]) -> Option<Bytes> {
        self.data.get(key).cloned()
    }

    #[inline]
    fn put(&mut self, key: &[u8], value: &[u8]) -> Result<(), StateError> {
        let value_bytes = Bytes::copy_from_slice(value);

        match self.data.entry(key.to_vec()) {
            std::collections::btree_map::Entry::Occupied(mut entry) => {
                self.size_bytes -= entry.get().len();
                self.size_bytes += value.len();
                *entry.get_mut() = value_bytes;
            }
            std::collections::btree_map::Entry::Vacant(entry) => {
                self.size_bytes += key.len() + value.len();
                entry.insert(value_bytes);
            }
        }
        Ok(())
    }

    fn delete(&mut self, key: &[u8]) -> Result<(), StateError> {
        if let Some(old_value) = self.data.remove(key) {
            self.size_bytes -= key.len() + old_value.len();
        }
        Ok(())
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
            self.data
                .range::<[u8], _>((Bound::Included(prefix), upper.as_ref().map(Vec::as_slice)))
                .map(|(k, v)| (Bytes::copy_from_slice(k), v.clone())),
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
            self.data
                .range::<[u8], _>((Bound::Included(range.start), Bound::Excluded(range.end)))
                .map(|(k, v)| (Bytes::copy_from_slice(k), v.clone())),
        )
    }

    #[inline]
    fn contains(&self, key: &[u8]) -> bool {
        self.data.contains_key(key)
    }

    fn size_bytes(&self) -> usize {
        self.size_bytes
    }

    fn len(&self) -> usize {
        self.data.len()
    }

    fn snapshot(&self) -> StateSnapshot {
        let data: Vec<(Vec<u8>, Vec<u8>)> = self
            .data
            .iter()
            .map(|(k, v)| (k.clone(), v.to_vec()))
            .collect();
        StateSnapshot::new(data)
    }

    fn restore(&mut self, snapshot: StateSnapshot) -> Result<(), StateError> {
        self.data.clear();
        self.size_bytes = 0;

        for (key, value) in snapshot.into_data() {
            self.size_bytes += key.len() + value.len();
            self.data.insert(key, Bytes::from(value));
        }
        Ok(())
    }

    fn clear(&mut self) -> Result<(), StateError> {
        self.data.clear();
        self.size_bytes = 0;
        Ok(())
    }
}

/// Which store backs an operator's keyed state.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum StateBackend {
    /// Heap-resident `BTreeMap`
    #[default]
    InMemory,
    /// Memory-mapped record log under the given directory, one file per store
    Disk(PathBuf),
}

impl StateBackend {
    /// Opens a store named `name` on this backend.
    ///
    /// Disk stores are opened at `<dir>/<name>.state` and replay whatever the
    /// file already holds.
    ///
    /// # Errors
    ///
    /// Returns `StateError` if the directory or file cannot be created.
    pub fn open(&self, name: &str) -> Result<Box<dyn StateStore>, StateError> {
        match self {
            Self::InMemory => Ok(Box::new(InMemoryStore::new())),
            Self::Disk(dir) => {
                std::fs::create_dir_all(dir)?;
                let path = dir.join(format!("{name}.state"));
                Ok(Box::new(MmapStateStore::open(&path)?))
            }
        }
    }
}

impl fmt::Display for StateBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InMemory => write!(f, "memory"),
            Self::Disk(dir) => write!(f, "disk:{}", dir.display()),
        }
    }
}

impl FromStr for StateBackend {
    type Err = String;

    /// Parses `memory` or `disk:<directory>`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.eq_ignore_ascii_case("memory") || s.eq_ignore_ascii_case("in_memory") {
            return Ok(Self::InMemory);
        }
        match s.split_once(':') {
            Some((kind, dir)) if kind.eq_ignore_ascii_case("disk") && !dir.is_empty() => {
                Ok(Self::Disk(PathBuf::from(dir)))
            }
            _ => Err(format!(
                "Unknown state backend: {s}. Expected 'memory' or 'disk:<dir>'"
            )),
        }
    }
}

/// Errors that can occur in state operations.
#[derive(Debug, thiserror::Error)]
pub enum StateError {
    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Deserialization error
    #[error("Deserialization error: {0}")]
    Deserialization(String),

    /// Corruption error
    #[error("Corruption error: {0}")]
    Corruption(String),

    /// Store capacity exceeded
    #[error("Store capacity exceeded: {0}")]
    CapacityExceeded(String),
}
