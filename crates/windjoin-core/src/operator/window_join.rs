//! # Window Join Operator
//!
//! Joins two streams of window results on window boundaries plus a key.
//!
//! Each input is the output of a [`WindowTriggerOperator`], so its rows carry
//! `window_start` and `window_end` columns. Rows are buffered per window in
//! the state store. A window is evaluated once, when the watermarks of both
//! inputs have reached its end; at that point both sides' result sets for the
//! window are complete and finite, so evaluation is a bounded hash join.
//!
//! ## Join Types
//!
//! - **Inner**: matched pairs only
//! - **Left / Right / Full**: matched pairs, plus unmatched rows of the
//!   preserved side(s) padded with nulls
//! - **Semi** (`EXISTS` / `IN`): each left row with at least one match, once
//! - **Anti** (`NOT EXISTS` / `NOT IN`): each left row without a match, once
//!
//! `IN` and `NOT IN` always compare with SQL `=`. `NOT IN` follows
//! three-valued logic: a left row is emitted only when the predicate is
//! true, so a null left key or a null among the right keys of the window
//! suppresses it, unless the right side of the window is empty.
//!
//! ## Null Equality
//!
//! Key comparison is a [`NullEquality`] strategy value handed to the probe:
//! `Strict` never matches a null key, `IsNotDistinct` matches null with null.
//!
//! ## State Keys
//!
//! `jl | window key | seq` and `jr | window key | seq`, where `seq` is a
//! per-side arrival counter. A window's rows on one side are one prefix scan.
//!
//! [`WindowTriggerOperator`]: super::window::WindowTriggerOperator

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use arrow_array::RecordBatch;
use arrow_schema::{DataType, Field, Schema, SchemaRef};
use bytes::Bytes;
use fxhash::FxHashMap;
use rkyv::{Archive, Deserialize as RkyvDeserialize, Serialize as RkyvSerialize};
use smallvec::SmallVec;

use super::window::{WindowId, WINDOW_END_COLUMN, WINDOW_START_COLUMN};
use super::{
    decode_state, encode_state, Event, OperatorContext, OperatorError, OperatorState, Output,
    OutputVec,
};
use crate::datum::{normalized_type, to_array, Datum};
use crate::state::{StateStore, StateStoreExt};
use crate::time::{Watermark, WatermarkTracker};

const LEFT_STATE_PREFIX: &[u8; 2] = b"jl";
const RIGHT_STATE_PREFIX: &[u8; 2] = b"jr";

/// How a semi or anti join tests for a match.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Existence {
    /// `EXISTS` / `NOT EXISTS`: correlated match under the configured
    /// null equality
    #[default]
    Exists,
    /// `IN` / `NOT IN`: SQL `=` with three-valued logic
    In,
}

/// Type of join to perform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum JoinType {
    /// Inner join - only emit matched pairs.
    #[default]
    Inner,
    /// Left outer join - emit all left rows, with right match if exists.
    Left,
    /// Right outer join - emit all right rows, with left match if exists.
    Right,
    /// Full outer join - emit all rows, with matches where they exist.
    Full,
    /// Semi join - left rows with at least one match.
    Semi(Existence),
    /// Anti join - left rows without a match.
    Anti(Existence),
}

impl JoinType {
    /// Returns true if unmatched left rows should be emitted.
    #[must_use]
    pub fn emits_unmatched_left(&self) -> bool {
        matches!(self, JoinType::Left | JoinType::Full)
    }

    /// Returns true if unmatched right rows should be emitted.
    #[must_use]
    pub fn emits_unmatched_right(&self) -> bool {
        matches!(self, JoinType::Right | JoinType::Full)
    }

    /// Returns true if output rows carry right-side columns.
    #[must_use]
    pub fn outputs_right_columns(&self) -> bool {
        !matches!(self, JoinType::Semi(_) | JoinType::Anti(_))
    }
}

impl fmt::Display for JoinType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Inner => write!(f, "inner"),
            Self::Left => write!(f, "left"),
            Self::Right => write!(f, "right"),
            Self::Full => write!(f, "full"),
            Self::Semi(Existence::Exists) => write!(f, "semi"),
            Self::Semi(Existence::In) => write!(f, "semi(in)"),
            Self::Anti(Existence::Exists) => write!(f, "anti"),
            Self::Anti(Existence::In) => write!(f, "anti(not_in)"),
        }
    }
}

impl FromStr for JoinType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_lowercase().replace([' ', '-'], "_");
        match normalized.as_str() {
            "inner" => Ok(Self::Inner),
            "left" | "left_outer" => Ok(Self::Left),
            "right" | "right_outer" => Ok(Self::Right),
            "full" | "full_outer" => Ok(Self::Full),
            "semi" | "semi(exists)" | "exists" => Ok(Self::Semi(Existence::Exists)),
            "semi(in)" | "in" => Ok(Self::Semi(Existence::In)),
            "anti" | "anti(not_exists)" | "not_exists" => Ok(Self::Anti(Existence::Exists)),
            "anti(not_in)" | "not_in" => Ok(Self::Anti(Existence::In)),
            _ => Err(format!(
                "Unknown join type: {s}. Expected inner, left, right, full, semi, semi(in), \
                 anti or anti(not_in)"
            )),
        }
    }
}

/// Key equality used when probing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum NullEquality {
    /// SQL `=`: a null key matches nothing
    #[default]
    Strict,
    /// `IS NOT DISTINCT FROM`: null matches null
    IsNotDistinct,
}

impl NullEquality {
    /// Compares two values. `None` means unknown.
    #[must_use]
    pub fn values_match(self, left: &Datum, right: &Datum) -> Option<bool> {
        match self {
            Self::Strict => left.sql_eq(right),
            Self::IsNotDistinct => Some(left == right),
        }
    }

    /// Compares two key tuples with three-valued `AND`: false if any column
    /// is false, otherwise unknown if any column is unknown.
    #[must_use]
    pub fn keys_match(self, left: &[Datum], right: &[Datum]) -> Option<bool> {
        let mut result = Some(true);
        for (l, r) in left.iter().zip(right) {
            match self.values_match(l, r) {
                Some(false) => return Some(false),
                None => result = None,
                Some(true) => {}
            }
        }
        result
    }

    /// Returns true if a key can take part in hash matching. Under `=` a
    /// null or NaN column equals nothing.
    #[inline]
    fn is_joinable(self, key: &[Datum]) -> bool {
        self == Self::IsNotDistinct || !key.iter().any(|d| d.is_null() || d.is_nan())
    }
}

impl fmt::Display for NullEquality {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Strict => write!(f, "strict"),
            Self::IsNotDistinct => write!(f, "is_not_distinct"),
        }
    }
}

impl FromStr for NullEquality {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace([' ', '-'], "_").as_str() {
            "strict" | "equals" => Ok(Self::Strict),
            "is_not_distinct" | "is_not_distinct_from" | "null_safe" => Ok(Self::IsNotDistinct),
            _ => Err(format!(
                "Unknown null equality: {s}. Expected 'strict' or 'is_not_distinct'"
            )),
        }
    }
}

/// Identifies which side of the join a row came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum JoinSide {
    /// Left side of the join.
    Left,
    /// Right side of the join.
    Right,
}

impl JoinSide {
    /// Returns the input index used for watermark tracking and barriers.
    #[must_use]
    pub fn index(self) -> usize {
        match self {
            Self::Left => 0,
            Self::Right => 1,
        }
    }

    fn state_prefix(self) -> &'static [u8; 2] {
        match self {
            Self::Left => LEFT_STATE_PREFIX,
            Self::Right => RIGHT_STATE_PREFIX,
        }
    }
}

impl fmt::Display for JoinSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Left => write!(f, "left"),
            Self::Right => write!(f, "right"),
        }
    }
}

/// Configuration for a [`WindowJoinOperator`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WindowJoinConfig {
    /// Left key columns.
    pub left_keys: Vec<String>,
    /// Right key columns, positionally paired with `left_keys`.
    pub right_keys: Vec<String>,
    /// Type of join to perform.
    pub join_type: JoinType,
    /// Key equality.
    pub null_equality: NullEquality,
    /// Window start column on both inputs.
    pub window_start_column: String,
    /// Window end column on both inputs.
    pub window_end_column: String,
    /// Operator ID for checkpointing.
    pub operator_id: String,
}

impl Default for WindowJoinConfig {
    fn default() -> Self {
        Self {
            left_keys: Vec::new(),
            right_keys: Vec::new(),
            join_type: JoinType::Inner,
            null_equality: NullEquality::Strict,
            window_start_column: WINDOW_START_COLUMN.to_string(),
            window_end_column: WINDOW_END_COLUMN.to_string(),
            operator_id: "window_join".to_string(),
        }
    }
}

impl WindowJoinConfig {
    /// Creates a builder.
    ///
    /// ```rust
    /// use windjoin_core::operator::window_join::{JoinType, NullEquality, WindowJoinConfig};
    ///
    /// let config = WindowJoinConfig::builder()
    ///     .key("name", "name")
    ///     .join_type(JoinType::Full)
    ///     .null_equality(NullEquality::IsNotDistinct)
    ///     .build();
    /// assert_eq!(config.left_keys, vec!["name".to_string()]);
    /// ```
    #[must_use]
    pub fn builder() -> WindowJoinConfigBuilder {
        WindowJoinConfigBuilder {
            config: Self::default(),
        }
    }
}

/// Builder for [`WindowJoinConfig`].
#[derive(Debug, Clone)]
pub struct WindowJoinConfigBuilder {
    config: WindowJoinConfig,
}

impl WindowJoinConfigBuilder {
    /// Adds a key column pair.
    #[must_use]
    pub fn key(mut self, left: impl Into<String>, right: impl Into<String>) -> Self {
        self.config.left_keys.push(left.into());
        self.config.right_keys.push(right.into());
        self
    }

    /// Sets the join type.
    #[must_use]
    pub fn join_type(mut self, join_type: JoinType) -> Self {
        self.config.join_type = join_type;
        self
    }

    /// Sets the key equality.
    #[must_use]
    pub fn null_equality(mut self, null_equality: NullEquality) -> Self {
        self.config.null_equality = null_equality;
        self
    }

    /// Sets the window boundary column names.
    #[must_use]
    pub fn window_columns(mut self, start: impl Into<String>, end: impl Into<String>) -> Self {
        self.config.window_start_column = start.into();
        self.config.window_end_column = end.into();
        self
    }

    /// Sets the operator ID for checkpointing.
    #[must_use]
    pub fn operator_id(mut self, id: impl Into<String>) -> Self {
        self.config.operator_id = id.into();
        self
    }

    /// Builds the configuration.
    #[must_use]
    pub fn build(self) -> WindowJoinConfig {
        self.config
    }
}

/// Metrics for tracking join operations.
#[derive(Debug, Clone, Default)]
pub struct JoinMetrics {
    /// Number of left rows buffered.
    pub left_rows: u64,
    /// Number of right rows buffered.
    pub right_rows: u64,
    /// Rows dropped because both inputs had already closed their window.
    pub late_rows: u64,
    /// Rows dropped because their window columns were null.
    pub rows_without_window: u64,
    /// Windows evaluated.
    pub windows_evaluated: u64,
    /// Number of join matches produced.
    pub matches: u64,
    /// Number of unmatched left rows emitted.
    pub unmatched_left: u64,
    /// Number of unmatched right rows emitted.
    pub unmatched_right: u64,
    /// Total rows emitted.
    pub rows_emitted: u64,
}

impl JoinMetrics {
    /// Creates new metrics.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Resets all counters.
    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

/// Non-keyed join state captured at a checkpoint.
#[derive(Debug, Clone, Archive, RkyvSerialize, RkyvDeserialize)]
struct JoinCheckpoint {
    watermarks: Vec<i64>,
    next_seq: u64,
    windows_evaluated: u64,
    rows_emitted: u64,
}

/// Result of probing one window.
struct MatchResult {
    left_keys: Vec<Vec<Datum>>,
    right_keys: Vec<Vec<Datum>>,
    /// `(left, right)` index pairs, sorted
    pairs: Vec<(usize, usize)>,
    matched_left: Vec<bool>,
    matched_right: Vec<bool>,
}

/// Resolved column positions of one input.
#[derive(Debug, Clone)]
struct SideLayout {
    key_indices: Vec<usize>,
    window_start: usize,
    window_end: usize,
    width: usize,
}

impl SideLayout {
    fn resolve(
        schema: &Schema,
        keys: &[String],
        config: &WindowJoinConfig,
        side: JoinSide,
    ) -> Result<Self, OperatorError> {
        let index_of = |name: &str| {
            schema.index_of(name).map_err(|_| {
                OperatorError::ConfigurationError(format!("{side} input has no column {name}"))
            })
        };
        Ok(Self {
            key_indices: keys
                .iter()
                .map(|k| index_of(k))
                .collect::<Result<_, _>>()?,
            window_start: index_of(&config.window_start_column)?,
            window_end: index_of(&config.window_end_column)?,
            width: schema.fields().len(),
        })
    }

    fn key(&self, row: &[Datum]) -> Vec<Datum> {
        self.key_indices
            .iter()
            .map(|&i| row.get(i).cloned().unwrap_or(Datum::Null))
            .collect()
    }
}

/// Two-input join of window results.
///
/// Unlike single-input operators it is driven per side:
/// [`process_side`](Self::process_side) buffers rows and
/// [`on_watermark`](Self::on_watermark) evaluates every window both inputs
/// have closed.
pub struct WindowJoinOperator {
    config: WindowJoinConfig,
    left: SideLayout,
    right: SideLayout,
    watermarks: WatermarkTracker,
    /// Windows with buffered rows, evaluated in `(start, end)` order
    pending_windows: BTreeSet<WindowId>,
    next_seq: u64,
    output_schema: SchemaRef,
    metrics: JoinMetrics,
}

fn output_field(field: &Field, name: String, nullable: bool) -> Result<Field, OperatorError> {
    let data_type = normalized_type(field.data_type())?;
    Ok(Field::new(name, data_type, nullable || field.is_nullable()))
}

impl WindowJoinOperator {
    /// Creates a join of inputs with the given schemas.
    ///
    /// # Errors
    ///
    /// Returns `OperatorError::ConfigurationError` if key lists differ in
    /// length, a column is missing, or paired key columns have different
    /// types.
    pub fn new(
        config: WindowJoinConfig,
        left_schema: &Schema,
        right_schema: &Schema,
    ) -> Result<Self, OperatorError> {
        if config.left_keys.len() != config.right_keys.len() {
            return Err(OperatorError::ConfigurationError(format!(
                "Key column count mismatch: {} left, {} right",
                config.left_keys.len(),
                config.right_keys.len()
            )));
        }
        let left = SideLayout::resolve(left_schema, &config.left_keys, &config, JoinSide::Left)?;
        let right =
            SideLayout::resolve(right_schema, &config.right_keys, &config, JoinSide::Right)?;

        for (&l, &r) in left.key_indices.iter().zip(&right.key_indices) {
            let lt = normalized_type(left_schema.field(l).data_type())?;
            let rt = normalized_type(right_schema.field(r).data_type())?;
            if lt != rt && lt != DataType::Null && rt != DataType::Null {
                return Err(OperatorError::ConfigurationError(format!(
                    "Key type mismatch: {} is {lt}, {} is {rt}",
                    left_schema.field(l).name(),
                    right_schema.field(r).name()
                )));
            }
        }

        let output_schema = Self::build_output_schema(&config, left_schema, right_schema)?;
        Ok(Self {
            config,
            left,
            right,
            watermarks: WatermarkTracker::new(2),
            pending_windows: BTreeSet::new(),
            next_seq: 0,
            output_schema,
            metrics: JoinMetrics::new(),
        })
    }

    /// Left columns, then right columns with duplicate names suffixed `0`,
    /// `1`, ... until unique. Semi and anti joins output left columns only.
    fn build_output_schema(
        config: &WindowJoinConfig,
        left_schema: &Schema,
        right_schema: &Schema,
    ) -> Result<SchemaRef, OperatorError> {
        let join_type = config.join_type;
        let mut names: Vec<String> = Vec::new();
        let mut fields = Vec::new();
        for field in left_schema.fields() {
            names.push(field.name().clone());
            fields.push(output_field(
                field,
                field.name().clone(),
                join_type.emits_unmatched_right(),
            )?);
        }
        if join_type.outputs_right_columns() {
            for field in right_schema.fields() {
                let mut name = field.name().clone();
                let mut suffix = 0usize;
                while names.contains(&name) {
                    name = format!("{}{suffix}", field.name());
                    suffix += 1;
                }
                names.push(name.clone());
                fields.push(output_field(
                    field,
                    name,
                    join_type.emits_unmatched_left(),
                )?);
            }
        }
        Ok(Arc::new(Schema::new(fields)))
    }

    /// Returns the output schema.
    #[must_use]
    pub fn output_schema(&self) -> SchemaRef {
        Arc::clone(&self.output_schema)
    }

    /// Returns the configuration.
    #[must_use]
    pub fn config(&self) -> &WindowJoinConfig {
        &self.config
    }

    /// Returns the join metrics.
    #[must_use]
    pub fn metrics(&self) -> &JoinMetrics {
        &self.metrics
    }

    /// Resets the join metrics.
    pub fn reset_metrics(&mut self) {
        self.metrics.reset();
    }

    /// Returns the combined watermark, `None` until both inputs have one.
    #[must_use]
    pub fn current_watermark(&self) -> Option<Watermark> {
        self.watermarks.current_watermark()
    }

    /// Returns the number of windows waiting for both inputs to close.
    #[must_use]
    pub fn pending_window_count(&self) -> usize {
        self.pending_windows.len()
    }

    fn layout(&self, side: JoinSide) -> &SideLayout {
        match side {
            JoinSide::Left => &self.left,
            JoinSide::Right => &self.right,
        }
    }

    fn window_prefix(side: JoinSide, window: &WindowId) -> [u8; 18] {
        let mut prefix = [0u8; 18];
        prefix[..2].copy_from_slice(side.state_prefix());
        prefix[2..].copy_from_slice(&window.to_key_inline());
        prefix
    }

    /// Buffers the rows of one input's window-result batch.
    ///
    /// # Errors
    ///
    /// Returns `OperatorError` if a row cannot be read or stored.
    pub fn process_side(
        &mut self,
        side: JoinSide,
        event: &Event,
        ctx: &mut OperatorContext,
    ) -> Result<OutputVec, OperatorError> {
        let batch = &event.data;
        let layout = self.layout(side).clone();
        let combined = self.current_watermark();

        for row in 0..batch.num_rows() {
            let start = Datum::from_array(batch.column(layout.window_start).as_ref(), row)?;
            let end = Datum::from_array(batch.column(layout.window_end).as_ref(), row)?;
            let (Some(start), Some(end)) = (start.as_i64(), end.as_i64()) else {
                self.metrics.rows_without_window += 1;
                continue;
            };
            let window = WindowId::new(start, end);
            if combined.is_some_and(|wm| wm.has_reached(window.end)) {
                self.metrics.late_rows += 1;
                continue;
            }

            let values = Datum::row_from_columns(batch.columns(), row)?;
            let mut key = Self::window_prefix(side, &window).to_vec();
            key.extend_from_slice(&self.next_seq.to_be_bytes());
            self.next_seq += 1;
            ctx.state.put_typed(&key, &values)?;
            self.pending_windows.insert(window);

            match side {
                JoinSide::Left => self.metrics.left_rows += 1,
                JoinSide::Right => self.metrics.right_rows += 1,
            }
        }
        Ok(OutputVec::new())
    }

    /// Advances one input's watermark and evaluates every window both inputs
    /// have closed.
    ///
    /// # Errors
    ///
    /// Returns `OperatorError` if buffered rows cannot be read or the output
    /// batch cannot be built.
    pub fn on_watermark(
        &mut self,
        side: JoinSide,
        watermark: Watermark,
        ctx: &mut OperatorContext,
    ) -> Result<OutputVec, OperatorError> {
        let mut output = OutputVec::new();
        let Some(combined) = self
            .watermarks
            .update_source(side.index(), watermark.timestamp())
        else {
            return Ok(output);
        };
        while let Some(window) = self.pending_windows.first().copied() {
            if !combined.has_reached(window.end) {
                break;
            }
            self.pending_windows.remove(&window);
            if let Some(batch) = self.evaluate_window(&window, ctx)? {
                output.push(Output::Event(Event::new(window.end, batch)));
            }
        }
        output.push(Output::Watermark(combined.timestamp()));
        Ok(output)
    }

    fn take_rows(
        side: JoinSide,
        window: &WindowId,
        state: &mut dyn StateStore,
    ) -> Result<Vec<Vec<Datum>>, OperatorError> {
        let prefix = Self::window_prefix(side, window);
        let entries: Vec<(Bytes, Bytes)> = state.prefix_scan(&prefix).collect();
        let mut rows = Vec::with_capacity(entries.len());
        for (key, value) in entries {
            rows.push(decode_state::<Vec<Datum>>(&value)?);
            state.delete(&key)?;
        }
        Ok(rows)
    }

    fn evaluate_window(
        &mut self,
        window: &WindowId,
        ctx: &mut OperatorContext,
    ) -> Result<Option<RecordBatch>, OperatorError> {
        let left_rows = Self::take_rows(JoinSide::Left, window, ctx.state)?;
        let right_rows = Self::take_rows(JoinSide::Right, window, ctx.state)?;
        self.metrics.windows_evaluated += 1;

        let rows = self.join_rows(&left_rows, &right_rows);
        tracing::debug!(
            operator = %self.config.operator_id,
            window = %window,
            left = left_rows.len(),
            right = right_rows.len(),
            emitted = rows.len(),
            join_type = %self.config.join_type,
            "window joined"
        );
        if rows.is_empty() {
            return Ok(None);
        }
        self.metrics.rows_emitted += rows.len() as u64;
        self.build_batch(&rows).map(Some)
    }

    /// Hash-matches the rows of one window: build on the smaller side, probe
    /// with the other.
    fn match_rows(
        &self,
        left: &[Vec<Datum>],
        right: &[Vec<Datum>],
        equality: NullEquality,
    ) -> MatchResult {
        let left_keys: Vec<Vec<Datum>> = left.iter().map(|r| self.left.key(r)).collect();
        let right_keys: Vec<Vec<Datum>> = right.iter().map(|r| self.right.key(r)).collect();
        let mut matched_left = vec![false; left.len()];
        let mut matched_right = vec![false; right.len()];
        let mut pairs = Vec::new();

        let build_is_left = left.len() <= right.len();
        let (build_keys, probe_keys) = if build_is_left {
            (&left_keys, &right_keys)
        } else {
            (&right_keys, &left_keys)
        };

        let mut table: FxHashMap<&[Datum], SmallVec<[usize; 4]>> = FxHashMap::default();
        for (i, key) in build_keys.iter().enumerate() {
            if equality.is_joinable(key) {
                table.entry(key.as_slice()).or_default().push(i);
            }
        }
        for (p, key) in probe_keys.iter().enumerate() {
            if !equality.is_joinable(key) {
                continue;
            }
            let Some(hits) = table.get(key.as_slice()) else {
                continue;
            };
            for &b in hits {
                let (l, r) = if build_is_left { (b, p) } else { (p, b) };
                matched_left[l] = true;
                matched_right[r] = true;
                pairs.push((l, r));
            }
        }
        pairs.sort_unstable();

        MatchResult {
            left_keys,
            right_keys,
            pairs,
            matched_left,
            matched_right,
        }
    }

    /// Evaluates the join of one window's rows.
    fn join_rows(&mut self, left: &[Vec<Datum>], right: &[Vec<Datum>]) -> Vec<Vec<Datum>> {
        let join_type = self.config.join_type;
        let equality = match join_type {
            JoinType::Semi(Existence::In) | JoinType::Anti(Existence::In) => NullEquality::Strict,
            _ => self.config.null_equality,
        };
        let m = self.match_rows(left, right, equality);
        self.metrics.matches += m.pairs.len() as u64;

        let mut out = Vec::new();
        match join_type {
            JoinType::Inner | JoinType::Left | JoinType::Right | JoinType::Full => {
                for &(l, r) in &m.pairs {
                    out.push(left[l].iter().chain(&right[r]).cloned().collect());
                }
                if join_type.emits_unmatched_left() {
                    for (row, _) in left.iter().zip(&m.matched_left).filter(|(_, m)| !**m) {
                        let mut padded = row.clone();
                        padded.resize(self.left.width + self.right.width, Datum::Null);
                        out.push(padded);
                        self.metrics.unmatched_left += 1;
                    }
                }
                if join_type.emits_unmatched_right() {
                    for (row, _) in right.iter().zip(&m.matched_right).filter(|(_, m)| !**m) {
                        let mut padded = vec![Datum::Null; self.left.width];
                        padded.extend(row.iter().cloned());
                        out.push(padded);
                        self.metrics.unmatched_right += 1;
                    }
                }
            }
            JoinType::Semi(_) => {
                for (row, _) in left.iter().zip(&m.matched_left).filter(|(_, m)| **m) {
                    out.push(row.clone());
                }
            }
            JoinType::Anti(Existence::Exists) => {
                for (row, _) in left.iter().zip(&m.matched_left).filter(|(_, m)| !**m) {
                    out.push(row.clone());
                    self.metrics.unmatched_left += 1;
                }
            }
            JoinType::Anti(Existence::In) => {
                for (i, row) in left.iter().enumerate() {
                    if Self::not_in_holds(&m, i, right.is_empty()) {
                        out.push(row.clone());
                        self.metrics.unmatched_left += 1;
                    }
                }
            }
        }
        out
    }

    /// `left_key NOT IN (right keys of the window)` under three-valued logic.
    fn not_in_holds(m: &MatchResult, left_index: usize, right_empty: bool) -> bool {
        if right_empty {
            return true;
        }
        let key = &m.left_keys[left_index];
        if m.matched_left[left_index] || key.iter().any(Datum::is_null) {
            return false;
        }
        // a comparison that is unknown makes the whole predicate unknown
        !m.right_keys
            .iter()
            .filter(|rk| rk.iter().any(Datum::is_null))
            .any(|rk| NullEquality::Strict.keys_match(key, rk).is_none())
    }

    fn build_batch(&self, rows: &[Vec<Datum>]) -> Result<RecordBatch, OperatorError> {
        let fields = self.output_schema.fields();
        let mut columns: Vec<Vec<Datum>> = vec![Vec::with_capacity(rows.len()); fields.len()];
        for row in rows {
            for (column, value) in columns.iter_mut().zip(row) {
                column.push(value.clone());
            }
        }
        let arrays = columns
            .iter()
            .zip(fields.iter())
            .map(|(values, field)| to_array(values, field.data_type()))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(RecordBatch::try_new(Arc::clone(&self.output_schema), arrays)?)
    }

    /// Checkpoints watermarks and counters. Buffered rows live in the state
    /// store.
    ///
    /// # Errors
    ///
    /// Returns `OperatorError::SerializationFailed` if encoding fails.
    pub fn checkpoint(&self) -> Result<OperatorState, OperatorError> {
        let watermarks = (0..self.watermarks.num_sources())
            .map(|i| self.watermarks.source_watermark(i).unwrap_or(i64::MIN))
            .collect();
        let checkpoint = JoinCheckpoint {
            watermarks,
            next_seq: self.next_seq,
            windows_evaluated: self.metrics.windows_evaluated,
            rows_emitted: self.metrics.rows_emitted,
        };
        Ok(OperatorState {
            operator_id: self.config.operator_id.clone(),
            data: encode_state(&checkpoint)?,
        })
    }

    /// Restores from a checkpoint. The context's store must already hold the
    /// restored snapshot; pending windows are rebuilt from it.
    ///
    /// # Errors
    ///
    /// Returns `OperatorError` if the state belongs to another operator or
    /// cannot be decoded.
    pub fn restore(
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
        let checkpoint: JoinCheckpoint = decode_state(&state.data)?;
        self.watermarks = WatermarkTracker::new(2);
        self.watermarks.restore(&checkpoint.watermarks);
        self.next_seq = checkpoint.next_seq;
        self.metrics.windows_evaluated = checkpoint.windows_evaluated;
        self.metrics.rows_emitted = checkpoint.rows_emitted;

        self.pending_windows.clear();
        for prefix in [LEFT_STATE_PREFIX, RIGHT_STATE_PREFIX] {
            for (key, _) in ctx.state.prefix_scan(prefix) {
                if let Some(window) = key.get(2..18).and_then(WindowId::from_key) {
                    self.pending_windows.insert(window);
                }
            }
        }
        tracing::debug!(
            operator = %self.config.operator_id,
            pending_windows = self.pending_windows.len(),
            "window join restored"
        );
        Ok(())
    }
}
