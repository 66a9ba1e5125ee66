//! Barrier checkpointing for the window-join pipeline.
//!
//! - [`CheckpointBarrier`]: marker injected into both input lanes
//! - [`BarrierAligner`]: buffers elements at the join (the two-input fan-in)
//!   until both inputs have delivered their barrier
//! - [`CheckpointCoordinator`]: triggers checkpoints, collects operator and
//!   store snapshots, and produces a [`PipelineSnapshot`]
//! - [`CheckpointStore`]: persists completed snapshots
//! - [`RecoveryManager`]: loads a snapshot back for restart
//! - [`RestartPolicy`]: decides whether a failed run is retried
//!
//! Barriers flow through the lanes as [`StreamElement::Barrier`], so an
//! operator snapshots exactly the rows delivered before the barrier.
//!
//! [`StreamElement::Barrier`]: crate::operator::StreamElement::Barrier

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use fxhash::FxHashMap;

use crate::operator::{OperatorState, StreamElement};
use crate::state::StateSnapshot;

mod recovery;
mod restart;
mod snapshot;
mod store;

pub use recovery::{RecoveredState, RecoveryManager};
pub use restart::RestartPolicy;
pub use snapshot::{PipelineSnapshot, SerializableOperatorState};
pub use store::{CheckpointStore, FileCheckpointStore, InMemoryCheckpointStore};

/// Checkpoint identifier.
pub type CheckpointId = u64;

/// A checkpoint barrier injected into every input lane.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CheckpointBarrier {
    /// Unique identifier for this checkpoint.
    pub checkpoint_id: CheckpointId,
    /// Monotonically increasing epoch counter.
    pub epoch: u64,
    /// Timestamp when the barrier was created (millis since Unix epoch).
    pub timestamp: i64,
}

/// Delivery guarantee of the checkpointed pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CheckpointMode {
    /// Inputs are aligned at the join and sink output is committed per
    /// completed checkpoint.
    #[default]
    ExactlyOnce,
}

impl fmt::Display for CheckpointMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ExactlyOnce => write!(f, "exactly_once"),
        }
    }
}

impl FromStr for CheckpointMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "exactly_once" => Ok(Self::ExactlyOnce),
            _ => Err(format!("Unknown checkpoint mode: {s}. Expected 'exactly_once'")),
        }
    }
}

/// Configuration for checkpointing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckpointConfig {
    /// How often to trigger checkpoints. `Duration::ZERO` checkpoints after
    /// every processing round.
    pub interval: Duration,
    /// Delivery guarantee.
    pub mode: CheckpointMode,
    /// Maximum number of completed snapshots to retain.
    pub max_retained: usize,
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(10),
            mode: CheckpointMode::ExactlyOnce,
            max_retained: 3,
        }
    }
}

// ---------------------------------------------------------------------------
// BarrierAligner
// ---------------------------------------------------------------------------

/// Result of presenting a barrier to the aligner.
#[derive(Debug)]
pub enum AlignmentResult {
    /// Not all inputs have delivered their barrier yet.
    Pending,
    /// All inputs have delivered their barrier; the checkpoint can proceed.
    Aligned {
        /// The checkpoint barrier.
        barrier: CheckpointBarrier,
        /// Elements held back from already-aligned inputs, with their input
        /// index, in arrival order per input.
        buffered: Vec<(usize, StreamElement)>,
    },
}

/// Buffers elements at a fan-in node until all inputs have delivered their
/// checkpoint barrier.
///
/// For a node with a single input alignment is immediate.
#[derive(Debug)]
pub struct BarrierAligner {
    expected_inputs: usize,
    barriers_received: FxHashMap<usize, CheckpointBarrier>,
    buffered: FxHashMap<usize, VecDeque<StreamElement>>,
    current_checkpoint_id: Option<CheckpointId>,
}

impl BarrierAligner {
    /// Creates an aligner for a node with `expected_inputs` inputs.
    #[must_use]
    pub fn new(expected_inputs: usize) -> Self {
        Self {
            expected_inputs,
            barriers_received: FxHashMap::default(),
            buffered: FxHashMap::default(),
            current_checkpoint_id: None,
        }
    }

    /// Processes a barrier arriving from `input`.
    ///
    /// Returns [`AlignmentResult::Pending`] until all inputs have reported,
    /// then [`AlignmentResult::Aligned`] with the barrier and the elements
    /// buffered meanwhile. Alignment state is reset on `Aligned`.
    ///
    /// # Errors
    ///
    /// Returns [`CheckpointError::BarrierMismatch`] if the barrier belongs to
    /// a different checkpoint than the one being aligned.
    pub fn on_barrier(
        &mut self,
        input: usize,
        barrier: CheckpointBarrier,
    ) -> Result<AlignmentResult, CheckpointError> {
        if let Some(current) = self.current_checkpoint_id {
            if current != barrier.checkpoint_id {
                return Err(CheckpointError::BarrierMismatch {
                    expected: current,
                    actual: barrier.checkpoint_id,
                });
            }
        }
        self.current_checkpoint_id = Some(barrier.checkpoint_id);
        self.barriers_received.insert(input, barrier);

        if self.barriers_received.len() < self.expected_inputs {
            return Ok(AlignmentResult::Pending);
        }

        let mut inputs: Vec<usize> = self.buffered.keys().copied().collect();
        inputs.sort_unstable();
        let mut buffered = Vec::new();
        for i in inputs {
            if let Some(elements) = self.buffered.remove(&i) {
                buffered.extend(elements.into_iter().map(|e| (i, e)));
            }
        }
        self.complete_checkpoint();
        Ok(AlignmentResult::Aligned { barrier, buffered })
    }

    /// Buffers an element from `input` if that input has already delivered
    /// its barrier for the current checkpoint.
    ///
    /// Returns the element back if it should be processed normally.
    pub fn buffer_if_aligned(
        &mut self,
        input: usize,
        element: StreamElement,
    ) -> Option<StreamElement> {
        if self.barriers_received.contains_key(&input) {
            self.buffered.entry(input).or_default().push_back(element);
            None
        } else {
            Some(element)
        }
    }

    /// Returns whether `input` has already delivered its barrier.
    #[must_use]
    pub fn is_input_aligned(&self, input: usize) -> bool {
        self.barriers_received.contains_key(&input)
    }

    /// Resets alignment state, dropping any buffered elements.
    pub fn complete_checkpoint(&mut self) {
        self.barriers_received.clear();
        self.buffered.clear();
        self.current_checkpoint_id = None;
    }

    /// Returns how many barriers have been received so far.
    #[must_use]
    pub fn barriers_received_count(&self) -> usize {
        self.barriers_received.len()
    }

    /// Returns the number of elements held back.
    #[must_use]
    pub fn buffered_count(&self) -> usize {
        self.buffered.values().map(VecDeque::len).sum()
    }

    /// Returns the expected number of inputs.
    #[must_use]
    pub fn expected_inputs(&self) -> usize {
        self.expected_inputs
    }
}

// ---------------------------------------------------------------------------
// CheckpointCoordinator
// ---------------------------------------------------------------------------

/// Tracks progress of an in-flight checkpoint.
struct CheckpointProgress {
    barrier: CheckpointBarrier,
    operator_states: HashMap<String, OperatorState>,
    store_snapshots: HashMap<String, StateSnapshot>,
    source_offsets: HashMap<String, u64>,
    pending: Vec<String>,
}

/// Checkpoint coordinator.
///
/// Lifecycle:
/// 1. [`trigger_checkpoint()`](Self::trigger_checkpoint) creates a barrier;
///    the caller records source positions and injects the barrier
/// 2. each operator reports through
///    [`on_operator_snapshot()`](Self::on_operator_snapshot) when the barrier
///    reaches it
/// 3. [`finalize_checkpoint()`](Self::finalize_checkpoint) produces a
///    [`PipelineSnapshot`]
pub struct CheckpointCoordinator {
    config: CheckpointConfig,
    participants: Vec<String>,
    next_epoch: u64,
    next_checkpoint_id: CheckpointId,
    in_progress: Option<CheckpointProgress>,
    last_triggered_at: Option<i64>,
    last_completed: Option<CheckpointId>,
}

impl CheckpointCoordinator {
    /// Creates a coordinator expecting a report from each participant.
    #[must_use]
    pub fn new(participants: Vec<String>, config: CheckpointConfig) -> Self {
        Self {
            config,
            participants,
            next_epoch: 1,
            next_checkpoint_id: 1,
            in_progress: None,
            last_triggered_at: None,
            last_completed: None,
        }
    }

    /// Returns true if the interval has elapsed since the last trigger and no
    /// checkpoint is in flight.
    #[must_use]
    pub fn should_trigger(&self, now_ms: i64) -> bool {
        if self.in_progress.is_some() {
            return false;
        }
        let interval = i64::try_from(self.config.interval.as_millis()).unwrap_or(i64::MAX);
        match self.last_triggered_at {
            None => true,
            Some(last) => now_ms.saturating_sub(last) >= interval,
        }
    }

    /// Triggers a new checkpoint by creating a barrier.
    ///
    /// # Errors
    ///
    /// Returns [`CheckpointError::InProgress`] if a checkpoint is already in
    /// flight.
    pub fn trigger_checkpoint(&mut self, now_ms: i64) -> Result<CheckpointBarrier, CheckpointError> {
        if let Some(ref progress) = self.in_progress {
            return Err(CheckpointError::InProgress(progress.barrier.checkpoint_id));
        }
        let barrier = CheckpointBarrier {
            checkpoint_id: self.next_checkpoint_id,
            epoch: self.next_epoch,
            timestamp: now_ms,
        };
        self.next_checkpoint_id += 1;
        self.next_epoch += 1;
        self.last_triggered_at = Some(now_ms);
        self.in_progress = Some(CheckpointProgress {
            barrier,
            operator_states: HashMap::new(),
            store_snapshots: HashMap::new(),
            source_offsets: HashMap::new(),
            pending: self.participants.clone(),
        });
        tracing::debug!(
            checkpoint_id = barrier.checkpoint_id,
            epoch = barrier.epoch,
            "checkpoint triggered"
        );
        Ok(barrier)
    }

    /// Records a source's replay position for the in-flight checkpoint.
    pub fn record_source_offset(&mut self, source: impl Into<String>, offset: u64) {
        if let Some(ref mut progress) = self.in_progress {
            progress.source_offsets.insert(source.into(), offset);
        }
    }

    /// Records that an operator has snapshotted its state and its store.
    ///
    /// Returns `true` once every participant has reported.
    pub fn on_operator_snapshot(&mut self, state: OperatorState, store: StateSnapshot) -> bool {
        let Some(ref mut progress) = self.in_progress else {
            return false;
        };
        progress.pending.retain(|p| *p != state.operator_id);
        progress
            .store_snapshots
            .insert(state.operator_id.clone(), store);
        progress
            .operator_states
            .insert(state.operator_id.clone(), state);
        progress.pending.is_empty()
    }

    /// Finalizes the in-flight checkpoint.
    ///
    /// # Errors
    ///
    /// Returns [`CheckpointError::NoCheckpointInProgress`] if none is active,
    /// [`CheckpointError::Incomplete`] if participants have not reported, or
    /// a serialization error if a store snapshot cannot be encoded.
    pub fn finalize_checkpoint(&mut self) -> Result<PipelineSnapshot, CheckpointError> {
        let progress = self
            .in_progress
            .take()
            .ok_or(CheckpointError::NoCheckpointInProgress)?;
        if !progress.pending.is_empty() {
            let pending = progress.pending.len();
            self.in_progress = Some(progress);
            return Err(CheckpointError::Incomplete { pending });
        }

        let snapshot = PipelineSnapshot::from_parts(
            &progress.barrier,
            progress.operator_states,
            &progress.store_snapshots,
            progress.source_offsets,
        )?;
        self.last_completed = Some(snapshot.checkpoint_id);
        Ok(snapshot)
    }

    /// Abandons the in-flight checkpoint, returning its ID.
    pub fn abort_checkpoint(&mut self) -> Option<CheckpointId> {
        let progress = self.in_progress.take()?;
        tracing::debug!(
            checkpoint_id = progress.barrier.checkpoint_id,
            "checkpoint aborted"
        );
        Some(progress.barrier.checkpoint_id)
    }

    /// Continues numbering after a recovered snapshot so new checkpoints
    /// never reuse its ID or epoch.
    pub fn resume_after(&mut self, snapshot: &PipelineSnapshot) {
        self.in_progress = None;
        self.next_checkpoint_id = self.next_checkpoint_id.max(snapshot.checkpoint_id + 1);
        self.next_epoch = self.next_epoch.max(snapshot.epoch + 1);
        self.last_completed = Some(snapshot.checkpoint_id);
    }

    /// Returns whether a checkpoint is currently in flight.
    #[must_use]
    pub fn is_checkpoint_in_progress(&self) -> bool {
        self.in_progress.is_some()
    }

    /// Returns the barrier of the in-flight checkpoint.
    #[must_use]
    pub fn in_progress(&self) -> Option<&CheckpointBarrier> {
        self.in_progress.as_ref().map(|p| &p.barrier)
    }

    /// Returns the epoch the next checkpoint will carry. Output produced now
    /// belongs to it.
    #[must_use]
    pub fn current_epoch(&self) -> u64 {
        self.next_epoch
    }

    /// Returns the ID of the last completed checkpoint.
    #[must_use]
    pub fn last_completed(&self) -> Option<CheckpointId> {
        self.last_completed
    }

    /// Returns the configuration.
    #[must_use]
    pub fn config(&self) -> &CheckpointConfig {
        &self.config
    }
}

impl fmt::Debug for CheckpointCoordinator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CheckpointCoordinator")
            .field("next_epoch", &self.next_epoch)
            .field("next_checkpoint_id", &self.next_checkpoint_id)
            .field("in_progress", &self.in_progress.is_some())
            .field("participants", &self.participants)
            .finish_non_exhaustive()
    }
}

/// Errors from checkpointing and recovery.
#[derive(Debug, thiserror::Error)]
pub enum CheckpointError {
    /// A checkpoint was triggered while another is in flight.
    #[error("checkpoint already in progress: {0}")]
    InProgress(CheckpointId),

    /// Finalize was called with no checkpoint in flight.
    #[error("no checkpoint in progress")]
    NoCheckpointInProgress,

    /// Finalize was called before every participant reported.
    #[error("checkpoint incomplete: {pending} operators still pending")]
    Incomplete {
        /// Number of operators that have not reported.
        pending: usize,
    },

    /// A barrier of another checkpoint arrived during alignment.
    #[error("barrier mismatch: aligning {expected}, got {actual}")]
    BarrierMismatch {
        /// Checkpoint being aligned.
        expected: CheckpointId,
        /// Checkpoint of the arriving barrier.
        actual: CheckpointId,
    },

    /// No snapshot is available for recovery.
    #[error("checkpoint not found")]
    NotFound,

    /// A snapshot could not be encoded or decoded.
    #[error("checkpoint serialization failed: {0}")]
    Serialization(String),

    /// Checkpoint storage I/O failed.
    #[error("checkpoint I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// An operator or store failed to restore.
    #[error("restore failed for '{operator_id}': {reason}")]
    RestoreFailed {
        /// Operator that failed to restore.
        operator_id: String,
        /// Description of the failure.
        reason: String,
    },
}

impl From<serde_json::Error> for CheckpointError {
    fn from(e: serde_json::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::operator::Event;
    use crate::time::Watermark;
    use arrow_array::{Int64Array, RecordBatch};
    use std::sync::Arc;

    fn barrier(id: u64) -> CheckpointBarrier {
        CheckpointBarrier {
            checkpoint_id: id,
            epoch: id,
            timestamp: 0,
        }
    }

    fn record(v: i64) -> StreamElement {
        let array = Arc::new(Int64Array::from(vec![v]));
        let batch = RecordBatch::try_from_iter(vec![("v", array as _)]).unwrap();
        StreamElement::Record(Event::new(v, batch))
    }

    fn participants() -> Vec<String> {
        vec!["left".into(), "right".into(), "join".into()]
    }

    fn state(id: &str) -> OperatorState {
        OperatorState {
            operator_id: id.into(),
            data: vec![1, 2, 3],
        }
    }

    #[test]
    fn test_aligner_buffers_until_all_inputs_deliver() {
        let mut aligner = BarrierAligner::new(2);
        assert!(matches!(
            aligner.on_barrier(0, barrier(1)).unwrap(),
            AlignmentResult::Pending
        ));
        assert!(aligner.is_input_aligned(0));

        assert!(aligner.buffer_if_aligned(0, record(1)).is_none());
        assert!(aligner
            .buffer_if_aligned(0, StreamElement::Watermark(Watermark::new(5)))
            .is_none());
        assert!(aligner.buffer_if_aligned(1, record(2)).is_some());
        assert_eq!(aligner.buffered_count(), 2);

        let AlignmentResult::Aligned { barrier: b, buffered } =
            aligner.on_barrier(1, barrier(1)).unwrap()
        else {
            panic!("expected alignment");
        };
        assert_eq!(b.checkpoint_id, 1);
        assert_eq!(buffered.len(), 2);
        assert!(buffered.iter().all(|(input, _)| *input == 0));
        assert!(matches!(buffered[0].1, StreamElement::Record(_)));
        assert!(matches!(buffered[1].1, StreamElement::Watermark(_)));
        assert_eq!(aligner.barriers_received_count(), 0);
        assert!(!aligner.is_input_aligned(0));
    }

    #[test]
    fn test_aligner_rejects_foreign_barrier() {
        let mut aligner = BarrierAligner::new(2);
        aligner.on_barrier(0, barrier(1)).unwrap();
        assert!(matches!(
            aligner.on_barrier(1, barrier(2)),
            Err(CheckpointError::BarrierMismatch {
                expected: 1,
                actual: 2
            })
        ));
    }

    #[test]
    fn test_single_input_aligns_immediately() {
        let mut aligner = BarrierAligner::new(1);
        assert!(matches!(
            aligner.on_barrier(0, barrier(3)).unwrap(),
            AlignmentResult::Aligned { .. }
        ));
    }

    #[test]
    fn test_coordinator_lifecycle() {
        let mut coordinator = CheckpointCoordinator::new(participants(), CheckpointConfig::default());
        assert_eq!(coordinator.current_epoch(), 1);

        let b = coordinator.trigger_checkpoint(100).unwrap();
        assert_eq!((b.checkpoint_id, b.epoch), (1, 1));
        assert!(matches!(
            coordinator.trigger_checkpoint(101),
            Err(CheckpointError::InProgress(1))
        ));
        coordinator.record_source_offset("left", 4);

        assert!(!coordinator.on_operator_snapshot(state("left"), StateSnapshot::new(vec![])));
        assert!(!coordinator.on_operator_snapshot(state("right"), StateSnapshot::new(vec![])));
        assert!(matches!(
            coordinator.finalize_checkpoint(),
            Err(CheckpointError::Incomplete { pending: 1 })
        ));
        let store = StateSnapshot::new(vec![(b"k".to_vec(), b"v".to_vec())]);
        assert!(coordinator.on_operator_snapshot(state("join"), store.clone()));

        let snapshot = coordinator.finalize_checkpoint().unwrap();
        assert_eq!(snapshot.checkpoint_id, 1);
        assert_eq!(snapshot.source_offsets["left"], 4);
        assert_eq!(snapshot.store_snapshot("join").unwrap(), Some(store));
        assert_eq!(coordinator.last_completed(), Some(1));
        assert_eq!(coordinator.current_epoch(), 2);
        assert!(matches!(
            coordinator.finalize_checkpoint(),
            Err(CheckpointError::NoCheckpointInProgress)
        ));
    }

    #[test]
    fn test_interval_and_abort() {
        let config = CheckpointConfig {
            interval: Duration::from_millis(50),
            ..CheckpointConfig::default()
        };
        let mut coordinator = CheckpointCoordinator::new(participants(), config);
        assert!(coordinator.should_trigger(0));
        coordinator.trigger_checkpoint(0).unwrap();
        assert!(!coordinator.should_trigger(1_000));
        assert_eq!(coordinator.abort_checkpoint(), Some(1));
        assert!(!coordinator.should_trigger(49));
        assert!(coordinator.should_trigger(50));
    }

    #[test]
    fn test_resume_after_snapshot() {
        let mut coordinator = CheckpointCoordinator::new(participants(), CheckpointConfig::default());
        let snapshot = PipelineSnapshot {
            checkpoint_id: 7,
            epoch: 9,
            ..PipelineSnapshot::default()
        };
        coordinator.resume_after(&snapshot);
        let b = coordinator.trigger_checkpoint(0).unwrap();
        assert_eq!((b.checkpoint_id, b.epoch), (8, 10));
    }

    #[test]
    fn test_mode_parsing() {
        assert_eq!(
            "exactly-once".parse::<CheckpointMode>().unwrap(),
            CheckpointMode::ExactlyOnce
        );
        assert!("at_least_once".parse::<CheckpointMode>().is_err());
    }
}
