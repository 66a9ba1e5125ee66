//! Epoch-committing sinks.
//!
//! Join output is staged per epoch and published only when the checkpoint
//! of that epoch completes. After a failure everything staged since the last
//! commit is discarded and recomputed from the checkpoint, so each output
//! row is published exactly once.

use arrow_array::RecordBatch;

/// A sink with epoch commit semantics.
///
/// - `write()` stages a batch in the current (uncommitted) epoch
/// - `commit(epoch)` publishes everything staged; repeating a commit for an
///   epoch already published is a no-op
/// - `abort()` discards everything staged since the last commit
pub trait EpochSink: Send {
    /// Stages a batch.
    ///
    /// # Errors
    ///
    /// Returns [`SinkError::WriteFailed`] if the batch cannot be staged.
    fn write(&mut self, batch: RecordBatch) -> Result<(), SinkError>;

    /// Publishes the staged output as `epoch`.
    ///
    /// # Errors
    ///
    /// Returns [`SinkError::CommitFailed`] if publishing fails.
    fn commit(&mut self, epoch: u64) -> Result<(), SinkError>;

    /// Discards uncommitted output.
    ///
    /// # Errors
    ///
    /// Returns [`SinkError::RollbackFailed`] if the staged output cannot be
    /// dropped.
    fn abort(&mut self) -> Result<(), SinkError>;

    /// Returns the last committed epoch.
    fn last_committed_epoch(&self) -> Option<u64>;
}

/// Statistics for a sink.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SinkStats {
    /// Epochs committed.
    pub epochs_committed: u64,
    /// Aborts (one per recovery).
    pub aborts: u64,
    /// Rows published.
    pub rows_committed: u64,
    /// Rows discarded by aborts.
    pub rows_discarded: u64,
}

/// In-memory sink keeping every committed batch.
#[derive(Debug, Default)]
pub struct CollectingSink {
    staged: Vec<RecordBatch>,
    committed: Vec<RecordBatch>,
    last_committed: Option<u64>,
    stats: SinkStats,
}

impl CollectingSink {
    /// Creates an empty sink.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the committed batches in commit order.
    #[must_use]
    pub fn committed_batches(&self) -> &[RecordBatch] {
        &self.committed
    }

    /// Returns the number of committed rows.
    #[must_use]
    pub fn committed_rows(&self) -> usize {
        self.committed.iter().map(RecordBatch::num_rows).sum()
    }

    /// Returns the number of staged, uncommitted rows.
    #[must_use]
    pub fn staged_rows(&self) -> usize {
        self.staged.iter().map(RecordBatch::num_rows).sum()
    }

    /// Returns the sink statistics.
    #[must_use]
    pub fn stats(&self) -> SinkStats {
        self.stats
    }
}

impl EpochSink for CollectingSink {
    fn write(&mut self, batch: RecordBatch) -> Result<(), SinkError> {
        if batch.num_rows() > 0 {
            self.staged.push(batch);
        }
        Ok(())
    }

    fn commit(&mut self, epoch: u64) -> Result<(), SinkError> {
        if self.last_committed.is_some_and(|last| epoch <= last) {
            tracing::debug!(epoch, "epoch already committed");
            return Ok(());
        }
        let rows = self.staged_rows() as u64;
        self.committed.append(&mut self.staged);
        self.last_committed = Some(epoch);
        self.stats.epochs_committed += 1;
        self.stats.rows_committed += rows;
        Ok(())
    }

    fn abort(&mut self) -> Result<(), SinkError> {
        self.stats.rows_discarded += self.staged_rows() as u64;
        self.stats.aborts += 1;
        self.staged.clear();
        Ok(())
    }

    fn last_committed_epoch(&self) -> Option<u64> {
        self.last_committed
    }
}

/// Errors that can occur in sinks.
#[derive(Debug, thiserror::Error)]
pub enum SinkError {
    /// Write operation failed
    #[error("Write failed: {0}")]
    WriteFailed(String),

    /// Commit failed
    #[error("Commit failed: {0}")]
    CommitFailed(String),

    /// Rollback failed
    #[error("Rollback failed: {0}")]
    RollbackFailed(String),
}
