//! # Window Operators
//!
//! Tumbling windows with an optional offset, triggered by the watermark of
//! one input stream.
//!
//! ## Window Lifecycle
//!
//! Every `(window, group)` pair moves through [`WindowPhase`]:
//!
//! - `Open`: created by the first row assigned to it; a timer is registered
//!   at `window.end`
//! - `Closed`: the stream watermark reached `window.end`; every group of the
//!   window is read from the state store and emitted once
//! - `Evicted`: immediately after emission its state is deleted. Rows that
//!   map to an evicted window are late and dropped
//!
//! ## Output
//!
//! Each closed window produces one batch. In aggregate mode the columns are
//! the group columns, `window_start`, `window_end`, `window_time`
//! (`end - 1`), then the measures. In row mode the buffered input columns come
//! first, followed by the three window columns.
//!
//! ## Example
//!
//! ```rust
//! use std::time::Duration;
//! use windjoin_core::operator::window::{TumblingWindowAssigner, WindowId};
//!
//! // 5-second windows shifted by one second
//! let assigner = TumblingWindowAssigner::new(Duration::from_secs(5), 1_000).unwrap();
//! assert_eq!(assigner.assign(5_500), WindowId::new(1_000, 6_000));
//! assert_eq!(assigner.assign(6_000), WindowId::new(6_000, 11_000));
//! ```

use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use arrow_array::RecordBatch;
use arrow_schema::{DataType, Field, Schema, SchemaRef, TimeUnit};
use rkyv::{Archive, Deserialize as RkyvDeserialize, Serialize as RkyvSerialize};

use super::aggregate::{WindowAccumulator, WindowAggregation};
use super::{
    decode_state, encode_state, Event, Operator, OperatorContext, OperatorError, OperatorState,
    Output, OutputVec,
};
use crate::datum::{encode_key, normalized_type, to_array, Datum};
use crate::state::StateStoreExt;
use crate::time::{
    BoundedLatenessGenerator, TimeAssigner, TimeAssignerMetrics, TimeError, TimeSemantics,
    TimerKey, Watermark, WatermarkGenerator,
};

/// Name of the window start column in window results.
pub const WINDOW_START_COLUMN: &str = "window_start";
/// Name of the window end column in window results.
pub const WINDOW_END_COLUMN: &str = "window_end";
/// Name of the `end - 1` column in window results.
pub const WINDOW_TIME_COLUMN: &str = "window_time";

/// State key prefix for window accumulators.
const WINDOW_STATE_PREFIX: &[u8; 2] = b"wt";

/// Window key length: start and end, 8 bytes each.
const WINDOW_KEY_SIZE: usize = 16;

/// Encodes an `i64` so that big-endian byte order equals numeric order.
#[inline]
fn ordered_bytes(value: i64) -> [u8; 8] {
    (value ^ i64::MIN).to_be_bytes()
}

#[inline]
fn from_ordered_bytes(bytes: [u8; 8]) -> i64 {
    i64::from_be_bytes(bytes) ^ i64::MIN
}

/// Unique identifier for a window instance.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Archive, RkyvSerialize,
    RkyvDeserialize,
)]
pub struct WindowId {
    /// Window start timestamp (inclusive)
    pub start: i64,
    /// Window end timestamp (exclusive)
    pub end: i64,
}

impl WindowId {
    /// Creates a new window ID.
    #[must_use]
    pub fn new(start: i64, end: i64) -> Self {
        Self { start, end }
    }

    /// Returns the window duration in milliseconds.
    #[must_use]
    pub fn duration_ms(&self) -> i64 {
        self.end - self.start
    }

    /// Returns `end - 1`, the last instant inside the window.
    #[must_use]
    pub fn window_time(&self) -> i64 {
        self.end.saturating_sub(1)
    }

    /// Converts to a timer key.
    #[inline]
    #[must_use]
    pub fn to_key(&self) -> TimerKey {
        TimerKey::from_slice(&self.to_key_inline())
    }

    /// Converts to a fixed-size key whose byte order follows `(start, end)`,
    /// negative timestamps included.
    #[inline]
    #[must_use]
    pub fn to_key_inline(&self) -> [u8; WINDOW_KEY_SIZE] {
        let mut key = [0u8; WINDOW_KEY_SIZE];
        key[..8].copy_from_slice(&ordered_bytes(self.start));
        key[8..].copy_from_slice(&ordered_bytes(self.end));
        key
    }

    /// Parses a window ID from a key produced by [`WindowId::to_key_inline`].
    ///
    /// Returns `None` if the key is not exactly 16 bytes.
    #[must_use]
    pub fn from_key(key: &[u8]) -> Option<Self> {
        if key.len() != WINDOW_KEY_SIZE {
            return None;
        }
        let start = from_ordered_bytes(key[0..8].try_into().ok()?);
        let end = from_ordered_bytes(key[8..16].try_into().ok()?);
        Some(Self { start, end })
    }
}

impl fmt::Display for WindowId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {})", self.start, self.end)
    }
}

/// Assigns event times to fixed-size, non-overlapping windows.
///
/// `start = floor((t - offset) / size) * size + offset`, using floor
/// division so negative times and offsets land in the right window. The
/// offset is normalized into `[0, size)`; `-1s` and `+4s` describe the same
/// grid for a 5-second window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TumblingWindowAssigner {
    size_ms: i64,
    offset_ms: i64,
}

impl TumblingWindowAssigner {
    /// Creates an assigner with the given window size and offset.
    ///
    /// # Errors
    ///
    /// Returns `TimeError::InvalidWindowSize` if the size is zero or does not
    /// fit in milliseconds.
    pub fn new(size: Duration, offset_ms: i64) -> Result<Self, TimeError> {
        let size_ms = i64::try_from(size.as_millis()).unwrap_or(0);
        Self::from_millis(size_ms, offset_ms)
    }

    /// Creates an assigner from a size and offset in milliseconds.
    ///
    /// # Errors
    ///
    /// Returns `TimeError::InvalidWindowSize` if `size_ms <= 0`.
    pub fn from_millis(size_ms: i64, offset_ms: i64) -> Result<Self, TimeError> {
        if size_ms <= 0 {
            return Err(TimeError::InvalidWindowSize(size_ms));
        }
        Ok(Self {
            size_ms,
            offset_ms: offset_ms.rem_euclid(size_ms),
        })
    }

    /// Returns the window size in milliseconds.
    #[must_use]
    pub fn size_ms(&self) -> i64 {
        self.size_ms
    }

    /// Returns the normalized offset in milliseconds, in `[0, size)`.
    #[must_use]
    pub fn offset_ms(&self) -> i64 {
        self.offset_ms
    }

    /// Assigns an event time to its window.
    #[inline]
    #[must_use]
    pub fn assign(&self, timestamp: i64) -> WindowId {
        let size = i128::from(self.size_ms);
        let offset = i128::from(self.offset_ms);
        let start = (i128::from(timestamp) - offset).div_euclid(size) * size + offset;
        // only reachable within one window of i64::MIN
        let start = i64::try_from(start).unwrap_or(i64::MIN);
        WindowId::new(start, start.saturating_add(self.size_ms))
    }
}

/// Lifecycle phase of a window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WindowPhase {
    /// Accepting rows
    Open,
    /// Watermark reached the end; results are being emitted
    Closed,
    /// State removed; rows for this window are late
    Evicted,
}

impl fmt::Display for WindowPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Open => write!(f, "OPEN"),
            Self::Closed => write!(f, "CLOSED"),
            Self::Evicted => write!(f, "EVICTED"),
        }
    }
}

/// Metrics for tracking late data.
#[derive(Debug, Clone, Default)]
pub struct LateDataMetrics {
    /// Rows dropped because their window was already evicted
    late_rows_dropped: u64,
    /// Batches that contained at least one late row
    batches_with_late_rows: u64,
}

impl LateDataMetrics {
    /// Creates a new metrics tracker.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the number of late rows dropped.
    #[must_use]
    pub fn late_rows_dropped(&self) -> u64 {
        self.late_rows_dropped
    }

    /// Returns the number of batches that contained late rows.
    #[must_use]
    pub fn batches_with_late_rows(&self) -> u64 {
        self.batches_with_late_rows
    }

    /// Records the late rows of one batch.
    pub fn record_dropped(&mut self, rows: u64) {
        if rows > 0 {
            self.late_rows_dropped += rows;
            self.batches_with_late_rows += 1;
        }
    }

    /// Resets all counters to zero.
    pub fn reset(&mut self) {
        self.late_rows_dropped = 0;
        self.batches_with_late_rows = 0;
    }
}

/// Metrics for tracking window close behavior.
#[derive(Debug, Clone, Default)]
pub struct WindowCloseMetrics {
    /// Total number of windows that have emitted and closed
    windows_closed_total: u64,
    /// Total result rows emitted
    rows_emitted_total: u64,
    /// Sum of close latencies in milliseconds (for computing averages)
    close_latency_sum_ms: i64,
    /// Maximum close latency observed (milliseconds)
    close_latency_max_ms: i64,
}

impl WindowCloseMetrics {
    /// Creates a new metrics tracker.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the total number of windows that have emitted and closed.
    #[must_use]
    pub fn windows_closed_total(&self) -> u64 {
        self.windows_closed_total
    }

    /// Returns the total number of result rows emitted.
    #[must_use]
    pub fn rows_emitted_total(&self) -> u64 {
        self.rows_emitted_total
    }

    /// Returns the average delay between `window_end` and emission, in
    /// processing-time milliseconds. Returns 0 if no windows have closed.
    #[must_use]
    pub fn avg_close_latency_ms(&self) -> i64 {
        if self.windows_closed_total == 0 {
            0
        } else {
            self.close_latency_sum_ms / i64::try_from(self.windows_closed_total).unwrap_or(i64::MAX)
        }
    }

    /// Returns the maximum close latency observed (milliseconds).
    #[must_use]
    pub fn max_close_latency_ms(&self) -> i64 {
        self.close_latency_max_ms
    }

    /// Records a window close event.
    ///
    /// # Arguments
    ///
    /// * `window_end` - The exclusive upper bound of the closed window
    /// * `processing_time` - The wall-clock time at which the window emitted
    /// * `rows` - Result rows emitted for the window
    pub fn record_close(&mut self, window_end: i64, processing_time: i64, rows: u64) {
        self.windows_closed_total += 1;
        self.rows_emitted_total += rows;
        let latency = processing_time.saturating_sub(window_end).max(0);
        self.close_latency_sum_ms = self.close_latency_sum_ms.saturating_add(latency);
        if latency > self.close_latency_max_ms {
            self.close_latency_max_ms = latency;
        }
    }

    /// Resets all counters to zero.
    pub fn reset(&mut self) {
        self.windows_closed_total = 0;
        self.rows_emitted_total = 0;
        self.close_latency_sum_ms = 0;
        self.close_latency_max_ms = 0;
    }
}

/// Configuration of a [`WindowTriggerOperator`].
///
/// ```rust
/// use std::time::Duration;
/// use windjoin_core::operator::aggregate::{AggregateExpr, WindowAggregation};
/// use windjoin_core::operator::window::WindowTriggerConfig;
///
/// let config = WindowTriggerConfig::new("left_window", "ts", Duration::from_secs(5))
///     .with_lateness(Duration::from_secs(1))
///     .with_group_by(vec!["name".into()])
///     .with_aggregation(WindowAggregation::Aggregate(vec![
///         AggregateExpr::count_distinct("id", "cnt"),
///     ]));
/// assert_eq!(config.size_ms, 5_000);
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WindowTriggerConfig {
    /// Operator ID for checkpointing
    pub operator_id: String,
    /// Column holding the event time
    pub time_column: String,
    /// How the time column is interpreted
    pub time_semantics: TimeSemantics,
    /// Session time zone for `TimestampLtz` columns
    pub session_time_zone: Option<String>,
    /// Window size in milliseconds
    pub size_ms: i64,
    /// Window offset in milliseconds, may be negative
    pub offset_ms: i64,
    /// Watermark lateness bound in milliseconds
    pub lateness_ms: i64,
    /// Group-by columns
    pub group_by: Vec<String>,
    /// What each window computes
    pub aggregation: WindowAggregation,
}

impl WindowTriggerConfig {
    /// Creates a configuration with zero offset, zero lateness, no grouping
    /// and no measures.
    #[must_use]
    pub fn new(
        operator_id: impl Into<String>,
        time_column: impl Into<String>,
        size: Duration,
    ) -> Self {
        Self {
            operator_id: operator_id.into(),
            time_column: time_column.into(),
            time_semantics: TimeSemantics::Timestamp,
            session_time_zone: None,
            size_ms: i64::try_from(size.as_millis()).unwrap_or(i64::MAX),
            offset_ms: 0,
            lateness_ms: 0,
            group_by: Vec::new(),
            aggregation: WindowAggregation::default(),
        }
    }

    /// Sets the window offset in milliseconds.
    #[must_use]
    pub fn with_offset_ms(mut self, offset_ms: i64) -> Self {
        self.offset_ms = offset_ms;
        self
    }

    /// Sets the watermark lateness bound.
    #[must_use]
    pub fn with_lateness(mut self, lateness: Duration) -> Self {
        self.lateness_ms = i64::try_from(lateness.as_millis()).unwrap_or(i64::MAX);
        self
    }

    /// Sets the time column semantics.
    #[must_use]
    pub fn with_time_semantics(mut self, semantics: TimeSemantics) -> Self {
        self.time_semantics = semantics;
        self
    }

    /// Sets the session time zone used for `TimestampLtz` columns.
    #[must_use]
    pub fn with_session_time_zone(mut self, time_zone: impl Into<String>) -> Self {
        self.session_time_zone = Some(time_zone.into());
        self
    }

    /// Sets the group-by columns.
    #[must_use]
    pub fn with_group_by(mut self, columns: Vec<String>) -> Self {
        self.group_by = columns;
        self
    }

    /// Sets the window computation.
    #[must_use]
    pub fn with_aggregation(mut self, aggregation: WindowAggregation) -> Self {
        self.aggregation = aggregation;
        self
    }
}

/// Accumulator of one `(window, group)` as stored in the state store.
#[derive(Debug, Clone, Archive, RkyvSerialize, RkyvDeserialize)]
struct WindowEntry {
    group: Vec<Datum>,
    accumulator: WindowAccumulator,
}

/// Non-keyed operator state captured at a checkpoint.
#[derive(Debug, Clone, Archive, RkyvSerialize, RkyvDeserialize)]
struct TriggerCheckpoint {
    max_timestamp: i64,
    watermark: i64,
    late_rows_dropped: u64,
    windows_closed: u64,
}

/// Tumbling-window operator driven by one stream's watermark.
///
/// Rows of a batch are assigned to windows and folded into per-group
/// accumulators in the state store. After the whole batch has been applied
/// the watermark is advanced to `max(event time) - lateness`, and every
/// window whose end it reached is emitted and evicted, in end order.
///
/// # State Keys
///
/// `wt | window key (16 bytes) | encoded group key`. All groups of a window
/// share one prefix, so closing a window is a single prefix scan.
pub struct WindowTriggerOperator {
    config: WindowTriggerConfig,
    assigner: TumblingWindowAssigner,
    time_assigner: TimeAssigner,
    watermark: BoundedLatenessGenerator,
    group_indices: Vec<usize>,
    /// Input column per measure (`None` for `COUNT(*)`)
    measure_indices: Vec<Option<usize>>,
    registered_windows: HashSet<WindowId>,
    /// Past the watermark but not yet fully emitted and evicted
    closing_windows: HashSet<WindowId>,
    late_data_metrics: LateDataMetrics,
    window_close_metrics: WindowCloseMetrics,
    output_schema: SchemaRef,
}

fn window_field(name: &str) -> Field {
    Field::new(name, DataType::Timestamp(TimeUnit::Millisecond, None), false)
}

fn config_error(e: impl fmt::Display) -> OperatorError {
    OperatorError::ConfigurationError(e.to_string())
}

impl WindowTriggerOperator {
    /// Creates a window operator for batches of `input_schema`.
    ///
    /// # Errors
    ///
    /// Returns `OperatorError::ConfigurationError` if the window size or
    /// lateness is invalid, the time zone is unknown, or a referenced column
    /// is missing or has an unsupported type.
    pub fn new(config: WindowTriggerConfig, input_schema: &Schema) -> Result<Self, OperatorError> {
        let assigner = TumblingWindowAssigner::from_millis(config.size_ms, config.offset_ms)
            .map_err(config_error)?;
        if config.lateness_ms < 0 {
            return Err(config_error(TimeError::InvalidLateness(config.lateness_ms)));
        }

        let mut time_assigner =
            TimeAssigner::new(config.time_column.clone(), config.time_semantics);
        if let Some(tz) = &config.session_time_zone {
            time_assigner = time_assigner
                .with_session_time_zone(tz)
                .map_err(config_error)?;
        }
        time_assigner
            .validate_schema(input_schema)
            .map_err(config_error)?;

        let mut group_indices = Vec::with_capacity(config.group_by.len());
        let mut fields = Vec::new();
        for name in &config.group_by {
            let idx = input_schema
                .index_of(name)
                .map_err(|_| config_error(format!("Group-by column not found: {name}")))?;
            group_indices.push(idx);
            if matches!(config.aggregation, WindowAggregation::Aggregate(_)) {
                let data_type = normalized_type(input_schema.field(idx).data_type())?;
                fields.push(Field::new(name, data_type, true));
            }
        }

        let mut measure_indices = Vec::new();
        match &config.aggregation {
            WindowAggregation::Aggregate(exprs) => {
                fields.push(window_field(WINDOW_START_COLUMN));
                fields.push(window_field(WINDOW_END_COLUMN));
                fields.push(window_field(WINDOW_TIME_COLUMN));
                for expr in exprs {
                    let (idx, field) = expr.resolve(input_schema)?;
                    measure_indices.push(idx);
                    fields.push(field);
                }
            }
            WindowAggregation::Rows => {
                for field in input_schema.fields() {
                    let data_type = normalized_type(field.data_type())?;
                    fields.push(Field::new(field.name(), data_type, true));
                }
                fields.push(window_field(WINDOW_START_COLUMN));
                fields.push(window_field(WINDOW_END_COLUMN));
                fields.push(window_field(WINDOW_TIME_COLUMN));
            }
        }

        let watermark = BoundedLatenessGenerator::new(config.lateness_ms);
        Ok(Self {
            config,
            assigner,
            time_assigner,
            watermark,
            group_indices,
            measure_indices,
            registered_windows: HashSet::new(),
            closing_windows: HashSet::new(),
            late_data_metrics: LateDataMetrics::new(),
            window_close_metrics: WindowCloseMetrics::new(),
            output_schema: Arc::new(Schema::new(fields)),
        })
    }

    /// Returns the schema of emitted window results.
    #[must_use]
    pub fn output_schema(&self) -> SchemaRef {
        Arc::clone(&self.output_schema)
    }

    /// Returns the window assigner.
    #[must_use]
    pub fn assigner(&self) -> &TumblingWindowAssigner {
        &self.assigner
    }

    /// Returns the operator configuration.
    #[must_use]
    pub fn config(&self) -> &WindowTriggerConfig {
        &self.config
    }

    /// Returns the current stream watermark.
    #[must_use]
    pub fn current_watermark(&self) -> Watermark {
        Watermark::new(self.watermark.current_watermark())
    }

    /// Returns the number of windows currently open.
    #[must_use]
    pub fn open_window_count(&self) -> usize {
        self.registered_windows.len()
    }

    /// Returns the phase of `window`, or `None` if no row has reached it and
    /// the watermark has not passed it.
    ///
    /// A window stays `Closed` if its emission failed part way, until the
    /// operator is restored.
    #[must_use]
    pub fn window_phase(&self, window: &WindowId) -> Option<WindowPhase> {
        if self.registered_windows.contains(window) {
            Some(WindowPhase::Open)
        } else if self.closing_windows.contains(window) {
            Some(WindowPhase::Closed)
        } else if self.current_watermark().has_reached(window.end) {
            Some(WindowPhase::Evicted)
        } else {
            None
        }
    }

    /// Returns the late data metrics.
    #[must_use]
    pub fn late_data_metrics(&self) -> &LateDataMetrics {
        &self.late_data_metrics
    }

    /// Returns the window close metrics.
    #[must_use]
    pub fn window_close_metrics(&self) -> &WindowCloseMetrics {
        &self.window_close_metrics
    }

    /// Returns counts of rows with and without a usable event time.
    #[must_use]
    pub fn time_assigner_metrics(&self) -> &TimeAssignerMetrics {
        self.time_assigner.metrics()
    }

    /// Resets the late data and window close metrics.
    pub fn reset_metrics(&mut self) {
        self.late_data_metrics.reset();
        self.window_close_metrics.reset();
    }

    fn state_prefix(window: &WindowId) -> [u8; 2 + WINDOW_KEY_SIZE] {
        let mut prefix = [0u8; 2 + WINDOW_KEY_SIZE];
        prefix[..2].copy_from_slice(WINDOW_STATE_PREFIX);
        prefix[2..].copy_from_slice(&window.to_key_inline());
        prefix
    }

    fn state_key(window: &WindowId, group: &[Datum]) -> Vec<u8> {
        let mut key = Self::state_prefix(window).to_vec();
        encode_key(group, &mut key);
        key
    }

    fn measure_inputs(
        &self,
        batch: &RecordBatch,
        row: usize,
    ) -> Result<Vec<Datum>, OperatorError> {
        match &self.config.aggregation {
            WindowAggregation::Aggregate(_) => self
                .measure_indices
                .iter()
                .map(|idx| match idx {
                    Some(i) => Datum::from_array(batch.column(*i).as_ref(), row),
                    None => Ok(Datum::Null),
                })
                .collect::<Result<_, _>>()
                .map_err(OperatorError::from),
            WindowAggregation::Rows => Ok(Datum::row_from_columns(batch.columns(), row)?),
        }
    }

    /// Folds the rows of `batch` into state and returns the largest event
    /// time seen among on-time rows.
    fn accumulate(
        &mut self,
        batch: &RecordBatch,
        ctx: &mut OperatorContext,
    ) -> Result<Option<i64>, OperatorError> {
        let times = self
            .time_assigner
            .assign(batch)
            .map_err(|e| OperatorError::ProcessingFailed(e.to_string()))?;
        let watermark = self.current_watermark();

        let mut touched: BTreeMap<Vec<u8>, (WindowId, WindowEntry)> = BTreeMap::new();
        let mut max_timestamp = None;
        let mut late_rows = 0u64;

        for (row, time) in times.into_iter().enumerate() {
            let Some(ts) = time else {
                continue;
            };
            let window = self.assigner.assign(ts);
            if watermark.has_reached(window.end) {
                late_rows += 1;
                continue;
            }
            max_timestamp = Some(max_timestamp.map_or(ts, |m: i64| m.max(ts)));

            let group = self
                .group_indices
                .iter()
                .map(|&i| Datum::from_array(batch.column(i).as_ref(), row))
                .collect::<Result<Vec<_>, _>>()?;
            let inputs = self.measure_inputs(batch, row)?;
            let key = Self::state_key(&window, &group);

            let (_, entry) = match touched.entry(key) {
                std::collections::btree_map::Entry::Occupied(e) => e.into_mut(),
                std::collections::btree_map::Entry::Vacant(e) => {
                    let accumulator = ctx
                        .state
                        .get_typed::<WindowEntry>(e.key())?
                        .map_or_else(
                            || WindowAccumulator::new(&self.config.aggregation),
                            |stored| stored.accumulator,
                        );
                    e.insert((window, WindowEntry { group, accumulator }))
                }
            };
            entry.accumulator.update(inputs)?;
        }

        for (key, (window, entry)) in &touched {
            ctx.state.put_typed(key, entry)?;
            if self.registered_windows.insert(*window) {
                ctx.timers.register_timer(window.end, Some(window.to_key()));
            }
        }

        if late_rows > 0 {
            self.late_data_metrics.record_dropped(late_rows);
            tracing::debug!(
                operator = %self.config.operator_id,
                late_rows,
                watermark = watermark.timestamp(),
                "dropped rows for evicted windows"
            );
        }
        Ok(max_timestamp)
    }

    /// Emits and evicts every open window whose end the watermark reached.
    fn close_windows(
        &mut self,
        watermark: Watermark,
        ctx: &mut OperatorContext,
        output: &mut OutputVec,
    ) -> Result<(), OperatorError> {
        for timer in ctx.timers.poll_timers(watermark.timestamp()) {
            let Some(window) = timer.key.as_deref().and_then(WindowId::from_key) else {
                continue;
            };
            if !self.registered_windows.remove(&window) {
                continue;
            }
            self.closing_windows.insert(window);
            let emitted = self.emit_window(&window, ctx)?;
            self.closing_windows.remove(&window);
            if let Some(batch) = emitted {
                output.push(Output::Event(Event::new(window.end, batch)));
            }
        }
        Ok(())
    }

    fn emit_window(
        &mut self,
        window: &WindowId,
        ctx: &mut OperatorContext,
    ) -> Result<Option<RecordBatch>, OperatorError> {
        let prefix = Self::state_prefix(window);
        let keys: Vec<_> = ctx.state.prefix_scan(&prefix).map(|(k, _)| k).collect();

        let num_fields = self.output_schema.fields().len();
        let mut columns: Vec<Vec<Datum>> = vec![Vec::new(); num_fields];
        let window_columns = [
            Datum::Timestamp(window.start),
            Datum::Timestamp(window.end),
            Datum::Timestamp(window.window_time()),
        ];
        let mut rows = 0u64;

        for key in &keys {
            let Some(entry) = ctx.state.get_typed::<WindowEntry>(key)? else {
                continue;
            };
            for values in entry.accumulator.finalize() {
                let row: Vec<Datum> = match &self.config.aggregation {
                    WindowAggregation::Aggregate(_) => entry
                        .group
                        .iter()
                        .cloned()
                        .chain(window_columns.iter().cloned())
                        .chain(values)
                        .collect(),
                    WindowAggregation::Rows => values
                        .into_iter()
                        .chain(window_columns.iter().cloned())
                        .collect(),
                };
                for (column, cell) in columns.iter_mut().zip(row) {
                    column.push(cell);
                }
                rows += 1;
            }
            ctx.state.delete(key)?;
        }

        self.window_close_metrics
            .record_close(window.end, ctx.processing_time, rows);
        tracing::debug!(
            operator = %self.config.operator_id,
            window = %window,
            groups = keys.len(),
            rows,
            "window closed"
        );
        if rows == 0 {
            return Ok(None);
        }

        let arrays = columns
            .iter()
            .zip(self.output_schema.fields())
            .map(|(values, field)| to_array(values, field.data_type()))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Some(RecordBatch::try_new(
            Arc::clone(&self.output_schema),
            arrays,
        )?))
    }
}

impl Operator for WindowTriggerOperator {
    fn process(
        &mut self,
        event: &Event,
        ctx: &mut OperatorContext,
    ) -> Result<OutputVec, OperatorError> {
        let mut output = OutputVec::new();
        let Some(max_timestamp) = self.accumulate(&event.data, ctx)? else {
            return Ok(output);
        };
        // the watermark moves only after every row of the batch is applied
        if let Some(watermark) = self.watermark.on_event(max_timestamp) {
            self.close_windows(watermark, ctx, &mut output)?;
            output.push(Output::Watermark(watermark.timestamp()));
        }
        Ok(output)
    }

    fn on_watermark(
        &mut self,
        watermark: Watermark,
        ctx: &mut OperatorContext,
    ) -> Result<OutputVec, OperatorError> {
        let mut output = OutputVec::new();
        if let Some(advanced) = self.watermark.advance_watermark(watermark.timestamp()) {
            self.close_windows(advanced, ctx, &mut output)?;
            output.push(Output::Watermark(advanced.timestamp()));
        }
        Ok(output)
    }

    fn checkpoint(&self) -> Result<OperatorState, OperatorError> {
        let checkpoint = TriggerCheckpoint {
            max_timestamp: self.watermark.max_timestamp(),
            watermark: self.watermark.current_watermark(),
            late_rows_dropped: self.late_data_metrics.late_rows_dropped,
            windows_closed: self.window_close_metrics.windows_closed_total,
        };
        Ok(OperatorState {
            operator_id: self.config.operator_id.clone(),
            data: encode_state(&checkpoint)?,
        })
    }

    fn restore(
        &mut self,
        state: OperatorState,
        ctx: &mut OperatorContext,
    ) -> Result<(), OperatorError> {
        if state.operator_id != self.config.operator_id {
            return Err(OperatorError::StateAccessFailed(format!(
                "Operator ID mismatch: expected {}, got {}",
                self.config.operator_id, state.operator_id
            )));
        }
        let checkpoint: TriggerCheckpoint = decode_state(&state.data)?;
        self.watermark
            .restore(checkpoint.max_timestamp, checkpoint.watermark);
        self.late_data_metrics.late_rows_dropped = checkpoint.late_rows_dropped;
        self.window_close_metrics.windows_closed_total = checkpoint.windows_closed;

        // open windows and their timers are derived from the restored store
        self.registered_windows.clear();
        self.closing_windows.clear();
        ctx.timers.clear();
        for (key, _) in ctx.state.prefix_scan(WINDOW_STATE_PREFIX) {
            let Some(window) = key
                .get(2..2 + WINDOW_KEY_SIZE)
                .and_then(WindowId::from_key)
            else {
                continue;
            };
            if self.registered_windows.insert(window) {
                ctx.timers.register_timer(window.end, Some(window.to_key()));
            }
        }
        tracing::debug!(
            operator = %self.config.operator_id,
            open_windows = self.registered_windows.len(),
            watermark = checkpoint.watermark,
            "window operator restored"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests;
