//! Loading checkpoints back for restart.

use std::collections::HashMap;
use std::fmt;

use super::{CheckpointError, CheckpointId, CheckpointStore, PipelineSnapshot};
use crate::operator::OperatorState;
use crate::state::StateSnapshot;

/// Decoded state of a checkpoint, ready to hand to operators and stores.
pub struct RecoveredState {
    /// The snapshot that was used for recovery.
    pub snapshot: PipelineSnapshot,
    /// Operator states keyed by operator ID.
    pub operator_states: HashMap<String, OperatorState>,
    /// Store contents keyed by operator ID.
    pub store_snapshots: HashMap<String, StateSnapshot>,
    /// Source replay positions keyed by source name.
    pub source_offsets: HashMap<String, u64>,
}

impl RecoveredState {
    /// Takes the state and store snapshot of one operator.
    ///
    /// # Errors
    ///
    /// Returns [`CheckpointError::RestoreFailed`] if either is missing.
    pub fn take_operator(
        &mut self,
        operator_id: &str,
    ) -> Result<(OperatorState, StateSnapshot), CheckpointError> {
        let missing = |what: &str| CheckpointError::RestoreFailed {
            operator_id: operator_id.to_string(),
            reason: format!("checkpoint {} has no {what}", self.snapshot.checkpoint_id),
        };
        let state = self
            .operator_states
            .remove(operator_id)
            .ok_or_else(|| missing("operator state"))?;
        let store = self
            .store_snapshots
            .remove(operator_id)
            .ok_or_else(|| missing("store snapshot"))?;
        Ok((state, store))
    }

    /// Returns the recorded position of a source.
    #[must_use]
    pub fn source_offset(&self, source: &str) -> Option<u64> {
        self.source_offsets.get(source).copied()
    }
}

impl fmt::Debug for RecoveredState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RecoveredState")
            .field("checkpoint_id", &self.snapshot.checkpoint_id)
            .field("epoch", &self.snapshot.epoch)
            .field("operator_count", &self.operator_states.len())
            .field("source_offsets", &self.source_offsets)
            .finish()
    }
}

/// Reads snapshots from a [`CheckpointStore`] and decodes them.
pub struct RecoveryManager<'a> {
    store: &'a dyn CheckpointStore,
}

impl<'a> RecoveryManager<'a> {
    /// Creates a recovery manager over `store`.
    #[must_use]
    pub fn new(store: &'a dyn CheckpointStore) -> Self {
        Self { store }
    }

    /// Recovers from the latest completed checkpoint.
    ///
    /// # Errors
    ///
    /// Returns [`CheckpointError::NotFound`] if no checkpoint exists, or a
    /// decoding error if the snapshot is corrupt.
    pub fn recover_latest(&self) -> Result<RecoveredState, CheckpointError> {
        let snapshot = self.store.load_latest()?.ok_or(CheckpointError::NotFound)?;
        Self::decode(snapshot)
    }

    /// Recovers from a specific checkpoint.
    ///
    /// # Errors
    ///
    /// Returns [`CheckpointError::NotFound`] if the checkpoint is not
    /// retained, or a decoding error if it is corrupt.
    pub fn recover_by_id(&self, id: CheckpointId) -> Result<RecoveredState, CheckpointError> {
        let snapshot = self.store.load_by_id(id)?.ok_or(CheckpointError::NotFound)?;
        Self::decode(snapshot)
    }

    /// Returns whether any checkpoint is available.
    ///
    /// # Errors
    ///
    /// Returns [`CheckpointError`] if the store cannot be listed.
    pub fn has_checkpoints(&self) -> Result<bool, CheckpointError> {
        Ok(!self.store.list()?.is_empty())
    }

    fn decode(snapshot: PipelineSnapshot) -> Result<RecoveredState, CheckpointError> {
        let mut operator_states = HashMap::with_capacity(snapshot.operator_states.len());
        for id in snapshot.operator_states.keys() {
            if let Some(state) = snapshot.operator_state(id)? {
                operator_states.insert(id.clone(), state);
            }
        }
        let mut store_snapshots = HashMap::with_capacity(snapshot.store_snapshots.len());
        for id in snapshot.store_snapshots.keys() {
            if let Some(store) = snapshot.store_snapshot(id)? {
                store_snapshots.insert(id.clone(), store);
            }
        }
        let source_offsets = snapshot.source_offsets.clone();
        tracing::info!(
            checkpoint_id = snapshot.checkpoint_id,
            epoch = snapshot.epoch,
            operators = operator_states.len(),
            "recovering from checkpoint"
        );
        Ok(RecoveredState {
            snapshot,
            operator_states,
            store_snapshots,
            source_offsets,
        })
    }
}

impl fmt::Debug for RecoveryManager<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RecoveryManager").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::{CheckpointConfig, CheckpointCoordinator, InMemoryCheckpointStore};

    fn complete_checkpoint(
        coordinator: &mut CheckpointCoordinator,
        store: &mut InMemoryCheckpointStore,
        offset: u64,
    ) {
        coordinator.trigger_checkpoint(0).unwrap();
        coordinator.record_source_offset("left", offset);
        let state = OperatorState {
            operator_id: "join".into(),
            data: offset.to_le_bytes().to_vec(),
        };
        let contents = StateSnapshot::new(vec![(b"jl".to_vec(), vec![u8::try_from(offset).unwrap()])]);
        assert!(coordinator.on_operator_snapshot(state, contents));
        store.save(&coordinator.finalize_checkpoint().unwrap()).unwrap();
    }

    #[test]
    fn test_recover_latest_and_by_id() {
        let mut coordinator =
            CheckpointCoordinator::new(vec!["join".into()], CheckpointConfig::default());
        let mut store = InMemoryCheckpointStore::new(0);
        complete_checkpoint(&mut coordinator, &mut store, 3);
        complete_checkpoint(&mut coordinator, &mut store, 7);

        let manager = RecoveryManager::new(&store);
        assert!(manager.has_checkpoints().unwrap());

        let mut latest = manager.recover_latest().unwrap();
        assert_eq!(latest.snapshot.checkpoint_id, 2);
        assert_eq!(latest.source_offset("left"), Some(7));
        let (state, contents) = latest.take_operator("join").unwrap();
        assert_eq!(state.data, 7u64.to_le_bytes().to_vec());
        assert_eq!(contents.data()[0].1, vec![7]);
        assert!(latest.take_operator("join").is_err());

        let first = manager.recover_by_id(1).unwrap();
        assert_eq!(first.source_offset("left"), Some(3));
        assert!(matches!(
            manager.recover_by_id(42),
            Err(CheckpointError::NotFound)
        ));
    }

    #[test]
    fn test_empty_store_has_nothing_to_recover() {
        let store = InMemoryCheckpointStore::new(3);
        let manager = RecoveryManager::new(&store);
        assert!(!manager.has_checkpoints().unwrap());
        assert!(matches!(
            manager.recover_latest(),
            Err(CheckpointError::NotFound)
        ));
    }
}
