//! # Operator Module
//!
//! Stateful streaming operators of the window-join pipeline.
//!
//! ## Operators
//!
//! - [`window::WindowTriggerOperator`]: assigns rows to tumbling windows,
//!   accumulates them per group and emits each window once the stream
//!   watermark reaches its end
//! - [`window_join::WindowJoinOperator`]: two-input join of window results,
//!   evaluated per window once both inputs have closed it
//!
//! Single-input operators implement [`Operator`]. Keyed state lives in the
//! [`StateStore`](crate::state::StateStore) handed in through
//! [`OperatorContext`], never inside the operator, so a checkpoint is the
//! store snapshot plus the small [`OperatorState`] each operator returns.

use arrow_array::RecordBatch;
use rkyv::{
    api::high::{HighDeserializer, HighSerializer, HighValidator},
    bytecheck::CheckBytes,
    rancor::Error as RkyvError,
    ser::allocator::ArenaHandle,
    util::AlignedVec,
    Archive, Deserialize as RkyvDeserialize, Serialize as RkyvSerialize,
};
use smallvec::SmallVec;

use crate::checkpoint::CheckpointBarrier;
use crate::time::Watermark;

pub mod aggregate;
pub mod window;
pub mod window_join;

/// An event flowing through the system
#[derive(Debug, Clone)]
pub struct Event {
    /// Timestamp of the event
    pub timestamp: i64,
    /// Event payload as Arrow RecordBatch
    pub data: RecordBatch,
}

impl Event {
    /// Creates a new event.
    #[must_use]
    pub fn new(timestamp: i64, data: RecordBatch) -> Self {
        Self { timestamp, data }
    }
}

/// Output from an operator
#[derive(Debug)]
pub enum Output {
    /// Regular event output
    Event(Event),
    /// Watermark update
    Watermark(i64),
}

/// Operator outputs. Most calls emit at most a result batch and a watermark.
pub type OutputVec = SmallVec<[Output; 4]>;

/// Element of a pipeline lane, delivered in arrival order.
#[derive(Debug)]
pub enum StreamElement {
    /// A batch of rows
    Record(Event),
    /// Event-time progress of the lane
    Watermark(Watermark),
    /// Checkpoint barrier
    Barrier(CheckpointBarrier),
    /// The lane's source is exhausted
    EndOfInput,
}

impl From<Output> for StreamElement {
    fn from(output: Output) -> Self {
        match output {
            Output::Event(event) => Self::Record(event),
            Output::Watermark(timestamp) => Self::Watermark(Watermark::new(timestamp)),
        }
    }
}

/// Context provided to operators during processing
pub struct OperatorContext<'a> {
    /// Current processing time (milliseconds since epoch)
    pub processing_time: i64,
    /// Timer registration
    pub timers: &'a mut crate::time::TimerService,
    /// State store access
    pub state: &'a mut dyn crate::state::StateStore,
    /// Operator index in the chain
    pub operator_index: usize,
}

/// Trait implemented by single-input streaming operators
pub trait Operator: Send {
    /// Process an incoming batch.
    ///
    /// # Errors
    ///
    /// Returns `OperatorError` if state cannot be read or written.
    fn process(&mut self, event: &Event, ctx: &mut OperatorContext)
        -> Result<OutputVec, OperatorError>;

    /// Handle a watermark pushed from upstream.
    ///
    /// # Errors
    ///
    /// Returns `OperatorError` if closing windows fails.
    fn on_watermark(
        &mut self,
        watermark: Watermark,
        ctx: &mut OperatorContext,
    ) -> Result<OutputVec, OperatorError>;

    /// Checkpoint the operator's non-keyed state.
    ///
    /// # Errors
    ///
    /// Returns `OperatorError::SerializationFailed` if encoding fails.
    fn checkpoint(&self) -> Result<OperatorState, OperatorError>;

    /// Restore from a checkpoint.
    ///
    /// The context's state store has already been restored; operators rebuild
    /// timers and in-memory indexes from it.
    ///
    /// # Errors
    ///
    /// Returns `OperatorError` if the state belongs to another operator or
    /// cannot be decoded.
    fn restore(&mut self, state: OperatorState, ctx: &mut OperatorContext)
        -> Result<(), OperatorError>;
}

/// Serialized operator state for checkpointing
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OperatorState {
    /// Operator ID
    pub operator_id: String,
    /// Serialized state data
    pub data: Vec<u8>,
}

/// Errors that can occur in operators
#[derive(Debug, thiserror::Error)]
pub enum OperatorError {
    /// State access error
    #[error("State access failed: {0}")]
    StateAccessFailed(String),

    /// Serialization error
    #[error("Serialization failed: {0}")]
    SerializationFailed(String),

    /// Processing error
    #[error("Processing failed: {0}")]
    ProcessingFailed(String),

    /// Invalid operator configuration
    #[error("Configuration error: {0}")]
    ConfigurationError(String),
}

/// Encodes an operator checkpoint payload with rkyv.
pub(crate) fn encode_state<T>(value: &T) -> Result<Vec<u8>, OperatorError>
where
    T: for<'a> RkyvSerialize<HighSerializer<AlignedVec, ArenaHandle<'a>, RkyvError>>,
{
    rkyv::to_bytes::<RkyvError>(value)
        .map(|bytes| bytes.to_vec())
        .map_err(|e| OperatorError::SerializationFailed(e.to_string()))
}

/// Decodes an operator checkpoint payload written by [`encode_state`].
pub(crate) fn decode_state<T>(data: &[u8]) -> Result<T, OperatorError>
where
    T: Archive,
    T::Archived: for<'a> CheckBytes<HighValidator<'a, RkyvError>>
        + RkyvDeserialize<T, HighDeserializer<RkyvError>>,
{
    let mut aligned = AlignedVec::<16>::with_capacity(data.len());
    aligned.extend_from_slice(data);
    let archived = rkyv::access::<T::Archived, RkyvError>(&aligned)
        .map_err(|e| OperatorError::SerializationFailed(e.to_string()))?;
    rkyv::deserialize::<T, RkyvError>(archived)
        .map_err(|e| OperatorError::SerializationFailed(e.to_string()))
}

impl From<crate::state::StateError> for OperatorError {
    fn from(e: crate::state::StateError) -> Self {
        Self::StateAccessFailed(e.to_string())
    }
}

impl From<crate::datum::DatumError> for OperatorError {
    fn from(e: crate::datum::DatumError) -> Self {
        Self::ProcessingFailed(e.to_string())
    }
}

impl From<arrow_schema::ArrowError> for OperatorError {
    fn from(e: arrow_schema::ArrowError) -> Self {
        Self::ProcessingFailed(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use arrow_array::{Int64Array, RecordBatch};
    use std::sync::Arc;

    #[test]
    fn test_event_creation() {
        let array = Arc::new(Int64Array::from(vec![1, 2, 3]));
        let batch = RecordBatch::try_from_iter(vec![("col1", array as _)]).unwrap();

        let event = Event::new(12345, batch);

        assert_eq!(event.timestamp, 12345);
        assert_eq!(event.data.num_rows(), 3);
    }

    #[test]
    fn test_outputs_become_lane_elements() {
        let array = Arc::new(Int64Array::from(vec![7]));
        let batch = RecordBatch::try_from_iter(vec![("v", array as _)]).unwrap();

        let element: StreamElement = Output::Event(Event::new(5_000, batch)).into();
        assert!(matches!(element, StreamElement::Record(e) if e.timestamp == 5_000));
        let element: StreamElement = Output::Watermark(5_000).into();
        assert!(matches!(element, StreamElement::Watermark(w) if w.timestamp() == 5_000));
    }

    #[test]
    fn test_error_conversions() {
        let err: OperatorError = crate::state::StateError::Corruption("bad crc".into()).into();
        assert!(matches!(err, OperatorError::StateAccessFailed(_)));
        let err: OperatorError = crate::datum::DatumError::OutOfRange(u64::MAX).into();
        assert!(err.to_string().contains("Processing failed"));
    }
}
