//! Persistence of completed checkpoints.
//!
//! ## File Layout
//!
//! ```text
//! {dir}/
//!   checkpoint_000001.json
//!   checkpoint_000002.json
//!   latest.txt  → "checkpoint_000002.json"
//! ```

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use super::{CheckpointError, CheckpointId, PipelineSnapshot};

const LATEST_FILE: &str = "latest.txt";

/// Trait for checkpoint persistence backends.
pub trait CheckpointStore: Send {
    /// Persists a completed snapshot and makes it the latest.
    ///
    /// # Errors
    ///
    /// Returns [`CheckpointError`] on I/O or serialization failure.
    fn save(&mut self, snapshot: &PipelineSnapshot) -> Result<(), CheckpointError>;

    /// Loads the most recent snapshot, `None` if nothing was saved.
    ///
    /// # Errors
    ///
    /// Returns [`CheckpointError`] on I/O or deserialization failure.
    fn load_latest(&self) -> Result<Option<PipelineSnapshot>, CheckpointError>;

    /// Loads a specific snapshot.
    ///
    /// # Errors
    ///
    /// Returns [`CheckpointError`] on I/O or deserialization failure.
    fn load_by_id(&self, id: CheckpointId) -> Result<Option<PipelineSnapshot>, CheckpointError>;

    /// Lists retained checkpoint IDs in ascending order.
    ///
    /// # Errors
    ///
    /// Returns [`CheckpointError`] on I/O failure.
    fn list(&self) -> Result<Vec<CheckpointId>, CheckpointError>;
}

/// Heap-resident checkpoint store.
#[derive(Debug, Default)]
pub struct InMemoryCheckpointStore {
    snapshots: BTreeMap<CheckpointId, PipelineSnapshot>,
    max_retained: usize,
}

impl InMemoryCheckpointStore {
    /// Creates a store retaining the newest `max_retained` snapshots
    /// (0 keeps everything).
    #[must_use]
    pub fn new(max_retained: usize) -> Self {
        Self {
            snapshots: BTreeMap::new(),
            max_retained,
        }
    }
}

impl CheckpointStore for InMemoryCheckpointStore {
    fn save(&mut self, snapshot: &PipelineSnapshot) -> Result<(), CheckpointError> {
        self.snapshots
            .insert(snapshot.checkpoint_id, snapshot.clone());
        if self.max_retained > 0 {
            while self.snapshots.len() > self.max_retained {
                self.snapshots.pop_first();
            }
        }
        Ok(())
    }

    fn load_latest(&self) -> Result<Option<PipelineSnapshot>, CheckpointError> {
        Ok(self.snapshots.values().next_back().cloned())
    }

    fn load_by_id(&self, id: CheckpointId) -> Result<Option<PipelineSnapshot>, CheckpointError> {
        Ok(self.snapshots.get(&id).cloned())
    }

    fn list(&self) -> Result<Vec<CheckpointId>, CheckpointError> {
        Ok(self.snapshots.keys().copied().collect())
    }
}

/// Filesystem checkpoint store.
///
/// Writes `checkpoint_{id:06}.json` through a temporary file and rename, then
/// points `latest.txt` at it (a plain file, not a symlink). Files beyond
/// `max_retained` are pruned oldest first.
#[derive(Debug)]
pub struct FileCheckpointStore {
    dir: PathBuf,
    max_retained: usize,
}

impl FileCheckpointStore {
    /// Creates a store under `dir`. The directory is created on first save.
    #[must_use]
    pub fn new(dir: impl Into<PathBuf>, max_retained: usize) -> Self {
        Self {
            dir: dir.into(),
            max_retained,
        }
    }

    /// Returns the checkpoint directory.
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn file_name(id: CheckpointId) -> String {
        format!("checkpoint_{id:06}.json")
    }

    fn parse_id(name: &str) -> Option<CheckpointId> {
        name.strip_prefix("checkpoint_")?
            .strip_suffix(".json")?
            .parse()
            .ok()
    }

    fn sorted_ids(&self) -> Result<Vec<CheckpointId>, CheckpointError> {
        if !self.dir.exists() {
            return Ok(Vec::new());
        }
        let mut ids: Vec<CheckpointId> = std::fs::read_dir(&self.dir)?
            .filter_map(Result::ok)
            .filter_map(|e| e.file_name().to_str().and_then(Self::parse_id))
            .collect();
        ids.sort_unstable();
        Ok(ids)
    }

    fn prune(&self) -> Result<usize, CheckpointError> {
        if self.max_retained == 0 {
            return Ok(0);
        }
        let ids = self.sorted_ids()?;
        let excess = ids.len().saturating_sub(self.max_retained);
        let mut removed = 0;
        for id in &ids[..excess] {
            if std::fs::remove_file(self.dir.join(Self::file_name(*id))).is_ok() {
                removed += 1;
            }
        }
        Ok(removed)
    }
}

impl CheckpointStore for FileCheckpointStore {
    fn save(&mut self, snapshot: &PipelineSnapshot) -> Result<(), CheckpointError> {
        std::fs::create_dir_all(&self.dir)?;
        let name = Self::file_name(snapshot.checkpoint_id);
        let path = self.dir.join(&name);

        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, snapshot.to_json()?)?;
        std::fs::rename(&tmp, &path)?;

        let latest_tmp = self.dir.join("latest.txt.tmp");
        std::fs::write(&latest_tmp, &name)?;
        std::fs::rename(&latest_tmp, self.dir.join(LATEST_FILE))?;

        let removed = self.prune()?;
        tracing::debug!(
            checkpoint_id = snapshot.checkpoint_id,
            path = %path.display(),
            pruned = removed,
            "checkpoint persisted"
        );
        Ok(())
    }

    fn load_latest(&self) -> Result<Option<PipelineSnapshot>, CheckpointError> {
        let latest = self.dir.join(LATEST_FILE);
        if !latest.exists() {
            return Ok(None);
        }
        let name = std::fs::read_to_string(&latest)?;
        match Self::parse_id(name.trim()) {
            Some(id) => self.load_by_id(id),
            None => Ok(None),
        }
    }

    fn load_by_id(&self, id: CheckpointId) -> Result<Option<PipelineSnapshot>, CheckpointError> {
        let path = self.dir.join(Self::file_name(id));
        if !path.exists() {
            return Ok(None);
        }
        let json = std::fs::read_to_string(&path)?;
        PipelineSnapshot::from_json(&json).map(Some)
    }

    fn list(&self) -> Result<Vec<CheckpointId>, CheckpointError> {
        self.sorted_ids()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot(id: u64) -> PipelineSnapshot {
        let mut snapshot = PipelineSnapshot {
            checkpoint_id: id,
            epoch: id,
            ..PipelineSnapshot::default()
        };
        snapshot.source_offsets.insert("left".into(), id * 10);
        snapshot
    }

    #[test]
    fn test_file_store_save_and_load_latest() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = FileCheckpointStore::new(dir.path().join("checkpoints"), 3);
        assert!(store.load_latest().unwrap().is_none());

        store.save(&snapshot(1)).unwrap();
        store.save(&snapshot(2)).unwrap();

        let latest = store.load_latest().unwrap().unwrap();
        assert_eq!(latest.checkpoint_id, 2);
        assert_eq!(latest.source_offsets["left"], 20);
        assert_eq!(
            std::fs::read_to_string(store.dir().join("latest.txt")).unwrap(),
            "checkpoint_000002.json"
        );
        assert_eq!(store.load_by_id(1).unwrap().unwrap().checkpoint_id, 1);
        assert!(store.load_by_id(9).unwrap().is_none());
    }

    #[test]
    fn test_file_store_prunes_oldest() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = FileCheckpointStore::new(dir.path(), 2);
        for id in 1..=4 {
            store.save(&snapshot(id)).unwrap();
        }
        assert_eq!(store.list().unwrap(), vec![3, 4]);
        assert_eq!(store.load_latest().unwrap().unwrap().checkpoint_id, 4);
    }

    #[test]
    fn test_file_store_reopens() {
        let dir = tempfile::tempdir().unwrap();
        {
            let mut store = FileCheckpointStore::new(dir.path(), 3);
            store.save(&snapshot(5)).unwrap();
        }
        let store = FileCheckpointStore::new(dir.path(), 3);
        assert_eq!(store.load_latest().unwrap().unwrap().epoch, 5);
    }

    #[test]
    fn test_in_memory_store_retention() {
        let mut store = InMemoryCheckpointStore::new(2);
        for id in 1..=3 {
            store.save(&snapshot(id)).unwrap();
        }
        assert_eq!(store.list().unwrap(), vec![2, 3]);
        assert!(store.load_by_id(1).unwrap().is_none());
        assert_eq!(store.load_latest().unwrap().unwrap().checkpoint_id, 3);
    }
}
