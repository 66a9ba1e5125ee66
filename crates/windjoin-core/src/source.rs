//! Replayable sources.
//!
//! A source yields `RecordBatch`es and exposes a position token. The
//! position is recorded in every checkpoint; on restart the source is
//! seeked back to it and re-delivers exactly the batches after it.

use arrow_array::RecordBatch;
use arrow_schema::SchemaRef;

/// A source that can re-deliver its input from a recorded position.
pub trait ReplayableSource: Send {
    /// Returns the source name, used as its key in checkpoints.
    fn name(&self) -> &str;

    /// Returns the schema of the produced batches.
    fn schema(&self) -> SchemaRef;

    /// Polls the next batch. `Ok(None)` means the input is exhausted.
    ///
    /// # Errors
    ///
    /// Returns [`SourceError`] if reading fails; the pipeline restarts from
    /// the latest checkpoint.
    fn poll_batch(&mut self) -> Result<Option<RecordBatch>, SourceError>;

    /// Returns the position after the last delivered batch.
    fn position(&self) -> u64;

    /// Moves to `position` so the next poll re-delivers from there.
    ///
    /// # Errors
    ///
    /// Returns [`SourceError::InvalidPosition`] if the position is beyond
    /// the input.
    fn seek(&mut self, position: u64) -> Result<(), SourceError>;
}

/// In-memory replayable source over a fixed list of batches.
#[derive(Debug, Clone)]
pub struct VecSource {
    name: String,
    schema: SchemaRef,
    batches: Vec<RecordBatch>,
    position: usize,
}

impl VecSource {
    /// Creates a source over `batches`, which must all have `schema`.
    #[must_use]
    pub fn new(name: impl Into<String>, schema: SchemaRef, batches: Vec<RecordBatch>) -> Self {
        Self {
            name: name.into(),
            schema,
            batches,
            position: 0,
        }
    }

    /// Creates a source delivering `batch` in slices of `rows_per_batch` rows.
    #[must_use]
    pub fn sliced(name: impl Into<String>, batch: &RecordBatch, rows_per_batch: usize) -> Self {
        let step = rows_per_batch.max(1);
        let batches = (0..batch.num_rows())
            .step_by(step)
            .map(|offset| batch.slice(offset, step.min(batch.num_rows() - offset)))
            .collect();
        Self::new(name, batch.schema(), batches)
    }

    /// Returns the number of batches.
    #[must_use]
    pub fn len(&self) -> usize {
        self.batches.len()
    }

    /// Returns true if the source has no batches.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.batches.is_empty()
    }
}

impl ReplayableSource for VecSource {
    fn name(&self) -> &str {
        &self.name
    }

    fn schema(&self) -> SchemaRef {
        self.schema.clone()
    }

    fn poll_batch(&mut self) -> Result<Option<RecordBatch>, SourceError> {
        let batch = self.batches.get(self.position).cloned();
        if batch.is_some() {
            self.position += 1;
        }
        Ok(batch)
    }

    fn position(&self) -> u64 {
        self.position as u64
    }

    fn seek(&mut self, position: u64) -> Result<(), SourceError> {
        match usize::try_from(position) {
            Ok(p) if p <= self.batches.len() => {
                self.position = p;
                Ok(())
            }
            _ => Err(SourceError::InvalidPosition {
                source_name: self.name.clone(),
                position,
            }),
        }
    }
}

/// Wraps a source and fails once, when asked for the batch at `fail_at`.
///
/// The failure is not repeated after a seek, so one restart recovers.
#[derive(Debug)]
pub struct FailingSource<S> {
    inner: S,
    fail_at: u64,
    failed: bool,
}

impl<S: ReplayableSource> FailingSource<S> {
    /// Creates a source that fails when polled at position `fail_at`.
    #[must_use]
    pub fn new(inner: S, fail_at: u64) -> Self {
        Self {
            inner,
            fail_at,
            failed: false,
        }
    }

    /// Returns true once the failure has been injected.
    #[must_use]
    pub fn has_failed(&self) -> bool {
        self.failed
    }

    /// Returns the wrapped source.
    #[must_use]
    pub fn inner(&self) -> &S {
        &self.inner
    }
}

impl<S: ReplayableSource> ReplayableSource for FailingSource<S> {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn schema(&self) -> SchemaRef {
        self.inner.schema()
    }

    fn poll_batch(&mut self) -> Result<Option<RecordBatch>, SourceError> {
        if !self.failed && self.inner.position() == self.fail_at {
            self.failed = true;
            return Err(SourceError::Injected {
                source_name: self.inner.name().to_string(),
                position: self.fail_at,
            });
        }
        self.inner.poll_batch()
    }

    fn position(&self) -> u64 {
        self.inner.position()
    }

    fn seek(&mut self, position: u64) -> Result<(), SourceError> {
        self.inner.seek(position)
    }
}

/// Errors that can occur in sources.
#[derive(Debug, thiserror::Error)]
pub enum SourceError {
    /// Reading from the source failed.
    #[error("source '{source_name}' read failed: {reason}")]
    ReadFailed {
        /// Source name.
        source_name: String,
        /// Description of the failure.
        reason: String,
    },

    /// Deliberate failure of a [`FailingSource`].
    #[error("injected failure in source '{source_name}' at position {position}")]
    Injected {
        /// Source name.
        source_name: String,
        /// Position at which the failure was injected.
        position: u64,
    },

    /// Seek beyond the end of the input.
    #[error("source '{source_name}' cannot seek to {position}")]
    InvalidPosition {
        /// Source name.
        source_name: String,
        /// Requested position.
        position: u64,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use arrow_array::Int64Array;
    use std::sync::Arc;

    fn batch(n: i64) -> RecordBatch {
        let array = Arc::new(Int64Array::from((0..n).collect::<Vec<_>>()));
        RecordBatch::try_from_iter(vec![("v", array as _)]).unwrap()
    }

    #[test]
    fn test_vec_source_replays_from_position() {
        let mut source = VecSource::sliced("s", &batch(5), 2);
        assert_eq!(source.len(), 3);
        assert_eq!(source.poll_batch().unwrap().unwrap().num_rows(), 2);
        assert_eq!(source.poll_batch().unwrap().unwrap().num_rows(), 2);
        assert_eq!(source.position(), 2);
        assert_eq!(source.poll_batch().unwrap().unwrap().num_rows(), 1);
        assert!(source.poll_batch().unwrap().is_none());
        assert_eq!(source.position(), 3);

        source.seek(1).unwrap();
        assert_eq!(source.poll_batch().unwrap().unwrap().num_rows(), 2);
        assert!(source.seek(4).is_err());
    }

    #[test]
    fn test_failing_source_fails_once() {
        let mut source = FailingSource::new(VecSource::sliced("s", &batch(4), 1), 2);
        assert!(source.poll_batch().unwrap().is_some());
        assert!(source.poll_batch().unwrap().is_some());
        assert!(matches!(
            source.poll_batch(),
            Err(SourceError::Injected { position: 2, .. })
        ));
        assert!(source.has_failed());

        source.seek(0).unwrap();
        for _ in 0..4 {
            assert!(source.poll_batch().unwrap().is_some());
        }
        assert!(source.poll_batch().unwrap().is_none());
    }
}
