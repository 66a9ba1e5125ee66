//! Window-join pipeline driver.
//!
//! Two lanes feed one join:
//!
//! ```text
//! left source  → left lane  (WindowTriggerOperator) ─┐
//!                                                    ├→ WindowJoinOperator → EpochSink
//! right source → right lane (WindowTriggerOperator) ─┘
//! ```
//!
//! The driver is push-based and single-threaded. Each round polls one batch
//! per lane and pushes every queued [`StreamElement`] through the lane and on
//! into the join. Checkpoints inject a [`CheckpointBarrier`] at the head of
//! both lanes; each window operator snapshots when the barrier reaches it, the
//! join snapshots once the [`BarrierAligner`] has seen the barrier from both
//! lanes, and the completed snapshot commits the sink epoch.
//!
//! On a source failure the [`RestartPolicy`] decides whether the run is
//! retried: uncommitted sink output is aborted, every operator and store is
//! restored from the latest checkpoint and sources seek back to their
//! recorded positions.
//!
//! [`RestartPolicy`]: crate::checkpoint::RestartPolicy

use std::collections::VecDeque;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use arrow_schema::SchemaRef;

use crate::checkpoint::{
    AlignmentResult, BarrierAligner, CheckpointBarrier, CheckpointCoordinator, CheckpointError,
    CheckpointStore, FileCheckpointStore, InMemoryCheckpointStore, RecoveredState,
    RecoveryManager,
};
use crate::config::JobConfig;
use crate::operator::aggregate::WindowAggregation;
use crate::operator::window::{WindowTriggerConfig, WindowTriggerOperator};
use crate::operator::window_join::{JoinSide, WindowJoinConfig, WindowJoinOperator};
use crate::operator::{Event, Operator, OperatorContext, OperatorError, Output, StreamElement};
use crate::sink::{EpochSink, SinkError};
use crate::source::{ReplayableSource, SourceError};
use crate::state::{StateError, StateStore};
use crate::time::{TimeSemantics, TimerService, Watermark};

const LEFT_OPERATOR_ID: &str = "left_window";
const RIGHT_OPERATOR_ID: &str = "right_window";
const JOIN_OPERATOR_ID: &str = "window_join";

fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| i64::try_from(d.as_millis()).unwrap_or(i64::MAX))
}

/// One input of the join: a source plus how its rows are windowed.
pub struct StreamInput {
    source: Box<dyn ReplayableSource>,
    time_column: String,
    time_semantics: TimeSemantics,
    group_by: Vec<String>,
    aggregation: WindowAggregation,
}

impl StreamInput {
    /// Creates an input windowing `source` on `time_column`, buffering rows.
    #[must_use]
    pub fn new(source: impl ReplayableSource + 'static, time_column: impl Into<String>) -> Self {
        Self {
            source: Box::new(source),
            time_column: time_column.into(),
            time_semantics: TimeSemantics::Timestamp,
            group_by: Vec::new(),
            aggregation: WindowAggregation::Rows,
        }
    }

    /// Sets the time column semantics.
    #[must_use]
    pub fn with_time_semantics(mut self, semantics: TimeSemantics) -> Self {
        self.time_semantics = semantics;
        self
    }

    /// Sets the group-by columns.
    #[must_use]
    pub fn with_group_by(mut self, columns: Vec<String>) -> Self {
        self.group_by = columns;
        self
    }

    /// Sets what each window computes.
    #[must_use]
    pub fn with_aggregation(mut self, aggregation: WindowAggregation) -> Self {
        self.aggregation = aggregation;
        self
    }
}

impl std::fmt::Debug for StreamInput {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamInput")
            .field("source", &self.source.name())
            .field("time_column", &self.time_column)
            .field("group_by", &self.group_by)
            .finish_non_exhaustive()
    }
}

/// Pipeline counters.
#[derive(Debug, Clone, Default)]
pub struct PipelineMetrics {
    /// Processing rounds.
    pub rounds: u64,
    /// Source batches processed.
    pub batches_processed: u64,
    /// Checkpoints completed.
    pub checkpoints_completed: u64,
    /// Failures observed.
    pub failures: u64,
    /// Restarts performed.
    pub restarts: u64,
    /// Join rows handed to the sink.
    pub rows_emitted: u64,
    /// ID of the last completed checkpoint.
    pub last_checkpoint_id: Option<u64>,
}

impl PipelineMetrics {
    /// Resets all counters.
    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

struct Lane {
    side: JoinSide,
    source: Box<dyn ReplayableSource>,
    input_schema: SchemaRef,
    trigger_config: WindowTriggerConfig,
    trigger: WindowTriggerOperator,
    store: Box<dyn StateStore>,
    timers: TimerService,
    queue: VecDeque<StreamElement>,
    exhausted: bool,
    finished: bool,
}

impl Lane {
    fn new(
        side: JoinSide,
        operator_id: &str,
        input: StreamInput,
        config: &JobConfig,
    ) -> Result<Self, PipelineError> {
        let mut trigger_config =
            WindowTriggerConfig::new(operator_id, input.time_column, config.window.size)
                .with_offset_ms(config.window.offset_ms)
                .with_lateness(config.window.lateness)
                .with_time_semantics(input.time_semantics)
                .with_group_by(input.group_by)
                .with_aggregation(input.aggregation);
        if let Some(tz) = &config.session_time_zone {
            trigger_config = trigger_config.with_session_time_zone(tz.clone());
        }
        let input_schema = input.source.schema();
        let trigger = WindowTriggerOperator::new(trigger_config.clone(), &input_schema)?;
        Ok(Self {
            side,
            source: input.source,
            input_schema,
            trigger_config,
            trigger,
            store: config.state_backend.open(operator_id)?,
            timers: TimerService::new(),
            queue: VecDeque::new(),
            exhausted: false,
            finished: false,
        })
    }

    fn operator_id(&self) -> &str {
        &self.trigger_config.operator_id
    }

    fn is_done(&self) -> bool {
        self.finished && self.queue.is_empty()
    }

    /// Drops in-flight elements and rebuilds the operator from scratch.
    fn reset(&mut self) -> Result<(), PipelineError> {
        self.trigger = WindowTriggerOperator::new(self.trigger_config.clone(), &self.input_schema)?;
        self.timers.clear();
        self.queue.clear();
        self.exhausted = false;
        self.finished = false;
        Ok(())
    }

    fn split(&mut self) -> (&mut WindowTriggerOperator, OperatorContext<'_>) {
        let ctx = OperatorContext {
            processing_time: now_ms(),
            timers: &mut self.timers,
            state: self.store.as_mut(),
            operator_index: self.side.index(),
        };
        (&mut self.trigger, ctx)
    }
}

struct JoinNode {
    config: WindowJoinConfig,
    left_schema: SchemaRef,
    right_schema: SchemaRef,
    operator: WindowJoinOperator,
    store: Box<dyn StateStore>,
    timers: TimerService,
    aligner: BarrierAligner,
}

impl JoinNode {
    fn reset(&mut self) -> Result<(), PipelineError> {
        self.operator =
            WindowJoinOperator::new(self.config.clone(), &self.left_schema, &self.right_schema)?;
        self.timers.clear();
        self.aligner.complete_checkpoint();
        Ok(())
    }
}

/// Builder for [`WindowJoinPipeline`].
pub struct PipelineBuilder<S> {
    config: JobConfig,
    sink: S,
    left: Option<StreamInput>,
    right: Option<StreamInput>,
    keys: Vec<(String, String)>,
    checkpoint_store: Option<Box<dyn CheckpointStore>>,
}

impl<S: EpochSink> PipelineBuilder<S> {
    /// Sets the left input.
    #[must_use]
    pub fn left(mut self, input: StreamInput) -> Self {
        self.left = Some(input);
        self
    }

    /// Sets the right input.
    #[must_use]
    pub fn right(mut self, input: StreamInput) -> Self {
        self.right = Some(input);
        self
    }

    /// Adds a join key pair, naming columns of the window results.
    #[must_use]
    pub fn join_key(mut self, left: impl Into<String>, right: impl Into<String>) -> Self {
        self.keys.push((left.into(), right.into()));
        self
    }

    /// Overrides where completed checkpoints are persisted.
    #[must_use]
    pub fn checkpoint_store(mut self, store: impl CheckpointStore + 'static) -> Self {
        self.checkpoint_store = Some(Box::new(store));
        self
    }

    /// Builds the pipeline.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::Configuration`] if an input is missing or both
    /// sources share a name, and operator or state errors if an operator
    /// cannot be created for the input schemas.
    pub fn build(self) -> Result<WindowJoinPipeline<S>, PipelineError> {
        let left = self
            .left
            .ok_or_else(|| PipelineError::Configuration("left input not set".into()))?;
        let right = self
            .right
            .ok_or_else(|| PipelineError::Configuration("right input not set".into()))?;
        if left.source.name() == right.source.name() {
            return Err(PipelineError::Configuration(format!(
                "sources must have distinct names, both are '{}'",
                left.source.name()
            )));
        }

        let left = Lane::new(JoinSide::Left, LEFT_OPERATOR_ID, left, &self.config)?;
        let right = Lane::new(JoinSide::Right, RIGHT_OPERATOR_ID, right, &self.config)?;

        let mut join_config = WindowJoinConfig::builder()
            .join_type(self.config.join.join_type)
            .null_equality(self.config.join.null_equality)
            .operator_id(JOIN_OPERATOR_ID);
        for (l, r) in self.keys {
            join_config = join_config.key(l, r);
        }
        let join_config = join_config.build();
        let left_schema = left.trigger.output_schema();
        let right_schema = right.trigger.output_schema();
        let operator = WindowJoinOperator::new(join_config.clone(), &left_schema, &right_schema)?;
        let join = JoinNode {
            config: join_config,
            left_schema,
            right_schema,
            operator,
            store: self.config.state_backend.open(JOIN_OPERATOR_ID)?,
            timers: TimerService::new(),
            aligner: BarrierAligner::new(2),
        };

        let checkpoint_store = match (self.checkpoint_store, &self.config.checkpoint_dir) {
            (Some(store), _) => store,
            (None, Some(dir)) => Box::new(FileCheckpointStore::new(
                dir.clone(),
                self.config.checkpoint.max_retained,
            )) as Box<dyn CheckpointStore>,
            (None, None) => Box::new(InMemoryCheckpointStore::new(
                self.config.checkpoint.max_retained,
            )),
        };
        let coordinator = CheckpointCoordinator::new(
            vec![
                LEFT_OPERATOR_ID.to_string(),
                RIGHT_OPERATOR_ID.to_string(),
                JOIN_OPERATOR_ID.to_string(),
            ],
            self.config.checkpoint.clone(),
        );

        Ok(WindowJoinPipeline {
            config: self.config,
            left,
            right,
            join,
            sink: self.sink,
            coordinator,
            checkpoint_store,
            checkpoint_requested: false,
            restarts: 0,
            metrics: PipelineMetrics::default(),
        })
    }
}

/// Two-input windowed join with exactly-once output.
///
/// ```rust
/// use std::sync::Arc;
/// use std::time::Duration;
/// use arrow_array::{Int64Array, RecordBatch, StringArray};
/// use windjoin_core::config::JobConfig;
/// use windjoin_core::pipeline::{StreamInput, WindowJoinPipeline};
/// use windjoin_core::sink::CollectingSink;
/// use windjoin_core::source::VecSource;
///
/// let batch = |names: Vec<&str>, ts: Vec<i64>| {
///     RecordBatch::try_from_iter(vec![
///         ("name", Arc::new(StringArray::from(names)) as _),
///         ("ts", Arc::new(Int64Array::from(ts)) as _),
///     ])
///     .unwrap()
/// };
/// let left = VecSource::sliced("left", &batch(vec!["a", "b"], vec![1_000, 6_000]), 1);
/// let right = VecSource::sliced("right", &batch(vec!["b"], vec![7_000]), 1);
///
/// let config = JobConfig::builder()
///     .window_size(Duration::from_secs(5))
///     .build()
///     .unwrap();
/// let mut pipeline = WindowJoinPipeline::builder(config, CollectingSink::new())
///     .left(StreamInput::new(left, "ts"))
///     .right(StreamInput::new(right, "ts"))
///     .join_key("name", "name")
///     .build()
///     .unwrap();
/// pipeline.run().unwrap();
/// assert_eq!(pipeline.sink().committed_rows(), 1);
/// ```
pub struct WindowJoinPipeline<S> {
    config: JobConfig,
    left: Lane,
    right: Lane,
    join: JoinNode,
    sink: S,
    coordinator: CheckpointCoordinator,
    checkpoint_store: Box<dyn CheckpointStore>,
    checkpoint_requested: bool,
    restarts: u32,
    metrics: PipelineMetrics,
}

impl<S: EpochSink> WindowJoinPipeline<S> {
    /// Creates a builder.
    #[must_use]
    pub fn builder(config: JobConfig, sink: S) -> PipelineBuilder<S> {
        PipelineBuilder {
            config,
            sink,
            left: None,
            right: None,
            keys: Vec::new(),
            checkpoint_store: None,
        }
    }

    /// Returns the sink.
    #[must_use]
    pub fn sink(&self) -> &S {
        &self.sink
    }

    /// Consumes the pipeline, returning the sink.
    #[must_use]
    pub fn into_sink(self) -> S {
        self.sink
    }

    /// Returns the pipeline counters.
    #[must_use]
    pub fn metrics(&self) -> &PipelineMetrics {
        &self.metrics
    }

    /// Returns the job configuration.
    #[must_use]
    pub fn config(&self) -> &JobConfig {
        &self.config
    }

    /// Returns the schema of the join output.
    #[must_use]
    pub fn output_schema(&self) -> SchemaRef {
        self.join.operator.output_schema()
    }

    /// Returns the checkpoint store.
    #[must_use]
    pub fn checkpoint_store(&self) -> &dyn CheckpointStore {
        self.checkpoint_store.as_ref()
    }

    /// Returns the join operator.
    #[must_use]
    pub fn join_operator(&self) -> &WindowJoinOperator {
        &self.join.operator
    }

    /// Returns the window operator of one input.
    #[must_use]
    pub fn window_operator(&self, side: JoinSide) -> &WindowTriggerOperator {
        match side {
            JoinSide::Left => &self.left.trigger,
            JoinSide::Right => &self.right.trigger,
        }
    }

    /// Requests a checkpoint at the start of the next round, regardless of
    /// the interval.
    pub fn request_checkpoint(&mut self) {
        self.checkpoint_requested = true;
    }

    /// Runs both inputs to completion, restarting on source failures as the
    /// restart policy allows.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::RestartsExhausted`] once the policy gives up,
    /// or the first non-recoverable error.
    pub fn run(&mut self) -> Result<(), PipelineError> {
        loop {
            let error = match self.run_attempt() {
                Ok(()) => return Ok(()),
                Err(e) if e.is_recoverable() => e,
                Err(e) => return Err(e),
            };
            self.metrics.failures += 1;
            let Some(delay) = self.config.restart.next_delay(self.restarts) else {
                tracing::error!(
                    restarts = self.restarts,
                    error = %error,
                    "restart attempts exhausted"
                );
                self.coordinator.abort_checkpoint();
                self.sink.abort()?;
                return Err(PipelineError::RestartsExhausted {
                    attempts: self.restarts,
                    last_error: error.to_string(),
                });
            };
            self.restarts += 1;
            tracing::warn!(
                attempt = self.restarts,
                max_attempts = self.config.restart.max_attempts(),
                delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                error = %error,
                "pipeline failed, restarting from latest checkpoint"
            );
            if delay > Duration::ZERO {
                std::thread::sleep(delay);
            }
            self.recover()?;
            self.metrics.restarts += 1;
        }
    }

    fn run_attempt(&mut self) -> Result<(), PipelineError> {
        while self.step()? {}
        // publish output produced since the last checkpoint
        self.inject_barrier(now_ms())?;
        while self.step()? {}
        Ok(())
    }

    /// Runs one round: maybe injects a barrier, polls one batch per lane and
    /// drains both lanes. Returns `false` once both inputs are fully
    /// processed.
    ///
    /// # Errors
    ///
    /// Returns the first error from a source, operator, store or sink.
    pub fn step(&mut self) -> Result<bool, PipelineError> {
        if self.left.is_done() && self.right.is_done() {
            return Ok(false);
        }
        self.metrics.rounds += 1;

        let now = now_ms();
        if (self.checkpoint_requested || self.coordinator.should_trigger(now))
            && !self.coordinator.is_checkpoint_in_progress()
        {
            self.inject_barrier(now)?;
            self.checkpoint_requested = false;
        }

        for side in [JoinSide::Left, JoinSide::Right] {
            self.poll_source(side)?;
            while let Some(element) = self.lane_mut(side).queue.pop_front() {
                self.process_lane_element(side, element)?;
            }
        }
        Ok(true)
    }

    fn lane_mut(&mut self, side: JoinSide) -> &mut Lane {
        match side {
            JoinSide::Left => &mut self.left,
            JoinSide::Right => &mut self.right,
        }
    }

    fn inject_barrier(&mut self, now: i64) -> Result<(), PipelineError> {
        let barrier = self.coordinator.trigger_checkpoint(now)?;
        for lane in [&mut self.left, &mut self.right] {
            self.coordinator
                .record_source_offset(lane.source.name(), lane.source.position());
            lane.queue.push_front(StreamElement::Barrier(barrier));
        }
        Ok(())
    }

    fn poll_source(&mut self, side: JoinSide) -> Result<(), PipelineError> {
        let lane = self.lane_mut(side);
        if lane.exhausted {
            return Ok(());
        }
        match lane.source.poll_batch()? {
            Some(batch) => {
                lane.queue
                    .push_back(StreamElement::Record(Event::new(now_ms(), batch)));
                self.metrics.batches_processed += 1;
            }
            None => {
                lane.exhausted = true;
                lane.queue.push_back(StreamElement::EndOfInput);
            }
        }
        Ok(())
    }

    fn process_lane_element(
        &mut self,
        side: JoinSide,
        element: StreamElement,
    ) -> Result<(), PipelineError> {
        let lane = self.lane_mut(side);
        let outputs = match element {
            StreamElement::Record(event) => {
                let (trigger, mut ctx) = lane.split();
                trigger.process(&event, &mut ctx)?
            }
            StreamElement::Watermark(watermark) => {
                let (trigger, mut ctx) = lane.split();
                trigger.on_watermark(watermark, &mut ctx)?
            }
            StreamElement::Barrier(barrier) => {
                let state = lane.trigger.checkpoint()?;
                let snapshot = lane.store.snapshot();
                self.coordinator.on_operator_snapshot(state, snapshot);
                return self.deliver_to_join(side, StreamElement::Barrier(barrier));
            }
            StreamElement::EndOfInput => {
                let outputs = {
                    let (trigger, mut ctx) = lane.split();
                    trigger.on_watermark(Watermark::END_OF_INPUT, &mut ctx)?
                };
                lane.finished = true;
                for output in outputs {
                    self.deliver_to_join(side, output.into())?;
                }
                return self.deliver_to_join(side, StreamElement::EndOfInput);
            }
        };
        for output in outputs {
            self.deliver_to_join(side, output.into())?;
        }
        Ok(())
    }

    fn deliver_to_join(
        &mut self,
        side: JoinSide,
        element: StreamElement,
    ) -> Result<(), PipelineError> {
        let StreamElement::Barrier(barrier) = element else {
            if let Some(element) = self.join.aligner.buffer_if_aligned(side.index(), element) {
                self.apply_to_join(side, element)?;
            }
            return Ok(());
        };
        match self.join.aligner.on_barrier(side.index(), barrier)? {
            AlignmentResult::Pending => Ok(()),
            AlignmentResult::Aligned { barrier, buffered } => {
                self.complete_checkpoint(&barrier)?;
                for (input, element) in buffered {
                    let side = if input == 0 {
                        JoinSide::Left
                    } else {
                        JoinSide::Right
                    };
                    self.apply_to_join(side, element)?;
                }
                Ok(())
            }
        }
    }

    fn apply_to_join(&mut self, side: JoinSide, element: StreamElement) -> Result<(), PipelineError> {
        let join = &mut self.join;
        let mut ctx = OperatorContext {
            processing_time: now_ms(),
            timers: &mut join.timers,
            state: join.store.as_mut(),
            operator_index: 2,
        };
        let outputs = match element {
            StreamElement::Record(event) => join.operator.process_side(side, &event, &mut ctx)?,
            StreamElement::Watermark(watermark) => {
                join.operator.on_watermark(side, watermark, &mut ctx)?
            }
            StreamElement::EndOfInput | StreamElement::Barrier(_) => return Ok(()),
        };
        for output in outputs {
            if let Output::Event(event) = output {
                self.metrics.rows_emitted += event.data.num_rows() as u64;
                self.sink.write(event.data)?;
            }
        }
        Ok(())
    }

    fn complete_checkpoint(&mut self, barrier: &CheckpointBarrier) -> Result<(), PipelineError> {
        let state = self.join.operator.checkpoint()?;
        self.coordinator
            .on_operator_snapshot(state, self.join.store.snapshot());
        let snapshot = self.coordinator.finalize_checkpoint()?;
        self.checkpoint_store.save(&snapshot)?;
        self.sink.commit(snapshot.epoch)?;
        self.metrics.checkpoints_completed += 1;
        self.metrics.last_checkpoint_id = Some(snapshot.checkpoint_id);
        tracing::info!(
            checkpoint_id = barrier.checkpoint_id,
            epoch = barrier.epoch,
            left_offset = snapshot.source_offsets.get(self.left.source.name()).copied(),
            right_offset = snapshot.source_offsets.get(self.right.source.name()).copied(),
            "checkpoint completed"
        );
        Ok(())
    }

    /// Restores every operator, store and source from the latest checkpoint,
    /// or from the beginning of the input if none completed.
    fn recover(&mut self) -> Result<(), PipelineError> {
        self.coordinator.abort_checkpoint();
        self.sink.abort()?;
        self.left.reset()?;
        self.right.reset()?;
        self.join.reset()?;

        let recovered = match RecoveryManager::new(self.checkpoint_store.as_ref()).recover_latest() {
            Ok(recovered) => Some(recovered),
            Err(CheckpointError::NotFound) => None,
            Err(e) => return Err(e.into()),
        };
        let Some(mut recovered) = recovered else {
            tracing::info!("no completed checkpoint, replaying from the beginning");
            for lane in [&mut self.left, &mut self.right] {
                lane.store.clear()?;
                lane.source.seek(0)?;
            }
            self.join.store.clear()?;
            return Ok(());
        };

        for lane in [&mut self.left, &mut self.right] {
            Self::restore_lane(lane, &mut recovered)?;
        }
        let (state, snapshot) = recovered.take_operator(JOIN_OPERATOR_ID)?;
        self.join.store.restore(snapshot)?;
        let join = &mut self.join;
        let mut ctx = OperatorContext {
            processing_time: now_ms(),
            timers: &mut join.timers,
            state: join.store.as_mut(),
            operator_index: 2,
        };
        join.operator.restore(state, &mut ctx)?;
        self.coordinator.resume_after(&recovered.snapshot);
        Ok(())
    }

    fn restore_lane(lane: &mut Lane, recovered: &mut RecoveredState) -> Result<(), PipelineError> {
        let (state, snapshot) = recovered.take_operator(lane.operator_id())?;
        lane.store.restore(snapshot)?;
        let position = recovered.source_offset(lane.source.name()).unwrap_or(0);
        lane.source.seek(position)?;
        let (trigger, mut ctx) = lane.split();
        trigger.restore(state, &mut ctx)?;
        Ok(())
    }
}

impl<S> std::fmt::Debug for WindowJoinPipeline<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WindowJoinPipeline")
            .field("left", &self.left.source.name())
            .field("right", &self.right.source.name())
            .field("join_type", &self.config.join.join_type)
            .field("next_epoch", &self.coordinator.current_epoch())
            .field("metrics", &self.metrics)
            .finish_non_exhaustive()
    }
}

/// Errors from running a pipeline.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    /// A source failed.
    #[error("source error: {0}")]
    Source(#[from] SourceError),

    /// An operator failed.
    #[error("operator error: {0}")]
    Operator(#[from] OperatorError),

    /// A state store failed.
    #[error("state error: {0}")]
    State(#[from] StateError),

    /// Checkpointing or recovery failed.
    #[error("checkpoint error: {0}")]
    Checkpoint(#[from] CheckpointError),

    /// The sink failed.
    #[error("sink error: {0}")]
    Sink(#[from] SinkError),

    /// The pipeline is misconfigured.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// The restart policy gave up.
    #[error("restart attempts exhausted after {attempts} restarts: {last_error}")]
    RestartsExhausted {
        /// Restarts performed before giving up.
        attempts: u32,
        /// The failure that ended the run.
        last_error: String,
    },
}

impl PipelineError {
    /// Returns true if a restart from the latest checkpoint can recover.
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::Source(_))
    }
}
