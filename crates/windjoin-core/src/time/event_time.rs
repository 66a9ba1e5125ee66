//! Row-level event time assignment.
//!
//! [`TimeAssigner`] reads the configured time column of every row of a
//! `RecordBatch` and produces a millisecond event time per row. Two column
//! semantics are supported:
//!
//! - [`TimeSemantics::Timestamp`]: a wall-clock timestamp without zone. Values
//!   are used as they are.
//! - [`TimeSemantics::TimestampLtz`]: an instant. Values are shifted into the
//!   session time zone so tumbling windows align to local time.
//!
//! Null or unparsable values yield `None` for that row. The batch itself only
//! fails when the column is missing or has a type that cannot carry time.
//!
//! ```rust
//! use std::sync::Arc;
//! use arrow_array::{RecordBatch, StringArray};
//! use windjoin_core::time::{TimeAssigner, TimeSemantics};
//!
//! let batch = RecordBatch::try_from_iter(vec![(
//!     "ts",
//!     Arc::new(StringArray::from(vec![Some("1970-01-01 00:00:05"), None])) as _,
//! )])
//! .unwrap();
//!
//! let mut assigner = TimeAssigner::new("ts", TimeSemantics::Timestamp);
//! assert_eq!(assigner.assign(&batch).unwrap(), vec![Some(5000), None]);
//! ```

use std::fmt;
use std::str::FromStr;

use arrow_array::timezone::Tz;
use arrow_array::{
    Array, ArrayRef, Int64Array, LargeStringArray, RecordBatch, StringArray,
    TimestampMicrosecondArray, TimestampMillisecondArray, TimestampNanosecondArray,
    TimestampSecondArray,
};
use arrow_cast::parse::string_to_datetime;
use arrow_schema::{DataType, Schema, TimeUnit};
use chrono::{DateTime, Offset, TimeZone, Utc};

use super::TimeError;

/// How the time column is interpreted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TimeSemantics {
    /// Zone-less wall-clock timestamp, used directly.
    #[default]
    Timestamp,
    /// Instant converted to wall-clock time in the session time zone.
    TimestampLtz,
}

impl fmt::Display for TimeSemantics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Timestamp => write!(f, "timestamp"),
            Self::TimestampLtz => write!(f, "timestamp_ltz"),
        }
    }
}

impl FromStr for TimeSemantics {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "timestamp" => Ok(Self::Timestamp),
            "timestamp_ltz" | "ltz" => Ok(Self::TimestampLtz),
            _ => Err(format!(
                "Unknown time semantics: {s}. Expected 'timestamp' or 'timestamp_ltz'"
            )),
        }
    }
}

/// Errors that fail a whole batch during time assignment.
#[derive(Debug, thiserror::Error)]
pub enum EventTimeError {
    /// Column not found in schema
    #[error("Time column not found: {0}")]
    ColumnNotFound(String),

    /// Column type cannot carry a timestamp
    #[error("Time column {column} has unsupported type {found}")]
    UnsupportedType {
        /// Column name
        column: String,
        /// Actual type found
        found: String,
    },
}

/// Counters for rows that could not be placed in event time.
#[derive(Debug, Clone, Default)]
pub struct TimeAssignerMetrics {
    /// Rows that received an event time
    pub rows_assigned: u64,
    /// Rows dropped because the time value was null
    pub null_times: u64,
    /// Rows dropped because the time value could not be parsed or converted
    pub unparsable_times: u64,
}

impl TimeAssignerMetrics {
    /// Total rows excluded from windowing.
    #[must_use]
    pub fn rows_dropped(&self) -> u64 {
        self.null_times + self.unparsable_times
    }

    /// Resets all counters.
    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

/// Derives per-row event time from a configured column.
#[derive(Debug)]
pub struct TimeAssigner {
    column: String,
    semantics: TimeSemantics,
    /// `None` is UTC.
    session_tz: Option<Tz>,
    cached_index: Option<usize>,
    metrics: TimeAssignerMetrics,
}

impl TimeAssigner {
    /// Creates an assigner for `column` with a UTC session time zone.
    #[must_use]
    pub fn new(column: impl Into<String>, semantics: TimeSemantics) -> Self {
        Self {
            column: column.into(),
            semantics,
            session_tz: None,
            cached_index: None,
            metrics: TimeAssignerMetrics::default(),
        }
    }

    /// Sets the session time zone (`"Asia/Shanghai"`, `"+08:00"`, `"UTC"`).
    ///
    /// # Errors
    ///
    /// Returns [`TimeError::InvalidTimeZone`] if the name cannot be parsed.
    pub fn with_session_time_zone(mut self, time_zone: &str) -> Result<Self, TimeError> {
        self.session_tz = Some(parse_time_zone(time_zone)?);
        Ok(self)
    }

    /// Returns the time column name.
    #[must_use]
    pub fn column(&self) -> &str {
        &self.column
    }

    /// Returns the configured semantics.
    #[must_use]
    pub fn semantics(&self) -> TimeSemantics {
        self.semantics
    }

    /// Returns the assignment metrics.
    #[must_use]
    pub fn metrics(&self) -> &TimeAssignerMetrics {
        &self.metrics
    }

    /// Checks that `schema` carries a usable time column.
    ///
    /// # Errors
    ///
    /// Returns an error if the column is missing or has an unsupported type.
    pub fn validate_schema(&self, schema: &Schema) -> Result<(), EventTimeError> {
        let index = schema
            .index_of(&self.column)
            .map_err(|_| EventTimeError::ColumnNotFound(self.column.clone()))?;
        match schema.field(index).data_type() {
            DataType::Timestamp(_, _) | DataType::Int64 | DataType::Utf8 | DataType::LargeUtf8 => {
                Ok(())
            }
            other => Err(self.unsupported(other)),
        }
    }

    /// Assigns an event time to every row of `batch`.
    ///
    /// # Errors
    ///
    /// Returns an error if the column is missing or has an unsupported type.
    /// Null and unparsable values are reported as `None` entries instead.
    pub fn assign(&mut self, batch: &RecordBatch) -> Result<Vec<Option<i64>>, EventTimeError> {
        let index = self.column_index(batch.schema_ref())?;
        let column = batch.column(index);
        let extracted = match column.data_type() {
            DataType::Timestamp(unit, _) => self.extract_timestamps(column, *unit),
            DataType::Int64 => {
                let array = downcast::<Int64Array>(column);
                extract(column.len(), |row| {
                    array
                        .filter(|a| a.is_valid(row))
                        .map(|a| self.instant_or_wall_clock(Some(a.value(row))))
                })
            }
            DataType::Utf8 => {
                let array = downcast::<StringArray>(column);
                extract(column.len(), |row| {
                    array
                        .filter(|a| a.is_valid(row))
                        .map(|a| self.parse_str(a.value(row)))
                })
            }
            DataType::LargeUtf8 => {
                let array = downcast::<LargeStringArray>(column);
                extract(column.len(), |row| {
                    array
                        .filter(|a| a.is_valid(row))
                        .map(|a| self.parse_str(a.value(row)))
                })
            }
            other => return Err(self.unsupported(other)),
        };
        Ok(self.record(extracted))
    }

    /// Assigns the event time of a single row.
    ///
    /// # Errors
    ///
    /// Same as [`TimeAssigner::assign`].
    pub fn assign_row(
        &mut self,
        batch: &RecordBatch,
        row: usize,
    ) -> Result<Option<i64>, EventTimeError> {
        if row >= batch.num_rows() {
            return Ok(None);
        }
        Ok(self.assign(&batch.slice(row, 1))?.pop().flatten())
    }

    fn extract_timestamps(&self, column: &ArrayRef, unit: TimeUnit) -> Vec<Option<Option<i64>>> {
        let len = column.len();
        match unit {
            TimeUnit::Second => {
                let array = downcast::<TimestampSecondArray>(column);
                extract(len, |row| {
                    array
                        .filter(|a| a.is_valid(row))
                        .map(|a| self.instant_or_wall_clock(a.value(row).checked_mul(1000)))
                })
            }
            TimeUnit::Millisecond => {
                let array = downcast::<TimestampMillisecondArray>(column);
                extract(len, |row| {
                    array
                        .filter(|a| a.is_valid(row))
                        .map(|a| self.instant_or_wall_clock(Some(a.value(row))))
                })
            }
            TimeUnit::Microsecond => {
                let array = downcast::<TimestampMicrosecondArray>(column);
                extract(len, |row| {
                    array
                        .filter(|a| a.is_valid(row))
                        .map(|a| self.instant_or_wall_clock(Some(a.value(row).div_euclid(1000))))
                })
            }
            TimeUnit::Nanosecond => {
                let array = downcast::<TimestampNanosecondArray>(column);
                extract(len, |row| {
                    array.filter(|a| a.is_valid(row)).map(|a| {
                        self.instant_or_wall_clock(Some(a.value(row).div_euclid(1_000_000)))
                    })
                })
            }
        }
    }

    /// Folds extracted values into the metrics: outer `None` is a null,
    /// inner `None` a parse failure.
    fn record(&mut self, extracted: Vec<Option<Option<i64>>>) -> Vec<Option<i64>> {
        let mut dropped = 0usize;
        let times: Vec<Option<i64>> = extracted
            .into_iter()
            .map(|value| match value {
                None => {
                    self.metrics.null_times += 1;
                    dropped += 1;
                    None
                }
                Some(None) => {
                    self.metrics.unparsable_times += 1;
                    dropped += 1;
                    None
                }
                Some(Some(ts)) => {
                    self.metrics.rows_assigned += 1;
                    Some(ts)
                }
            })
            .collect();
        if dropped > 0 {
            tracing::debug!(
                column = %self.column,
                dropped,
                "rows without event time excluded from windowing"
            );
        }
        times
    }

    fn instant_or_wall_clock(&self, millis: Option<i64>) -> Option<i64> {
        match self.semantics {
            TimeSemantics::Timestamp => millis,
            TimeSemantics::TimestampLtz => millis.and_then(|instant| self.localize(instant)),
        }
    }

    fn parse_str(&self, value: &str) -> Option<i64> {
        match self.semantics {
            TimeSemantics::Timestamp => string_to_datetime(&Utc, value)
                .ok()
                .map(|dt| dt.timestamp_millis()),
            TimeSemantics::TimestampLtz => match &self.session_tz {
                Some(tz) => string_to_datetime(tz, value)
                    .ok()
                    .and_then(|dt| self.localize(dt.timestamp_millis())),
                None => string_to_datetime(&Utc, value)
                    .ok()
                    .map(|dt| dt.timestamp_millis()),
            },
        }
    }

    /// Shifts an instant into wall-clock milliseconds of the session zone.
    fn localize(&self, instant: i64) -> Option<i64> {
        let Some(tz) = &self.session_tz else {
            return Some(instant);
        };
        let utc = DateTime::from_timestamp_millis(instant)?;
        let offset_secs = tz
            .offset_from_utc_datetime(&utc.naive_utc())
            .fix()
            .local_minus_utc();
        instant.checked_add(i64::from(offset_secs) * 1000)
    }

    fn column_index(&mut self, schema: &Schema) -> Result<usize, EventTimeError> {
        if let Some(idx) = self.cached_index {
            if schema.fields().get(idx).is_some_and(|f| f.name() == &self.column) {
                return Ok(idx);
            }
        }
        let idx = schema
            .index_of(&self.column)
            .map_err(|_| EventTimeError::ColumnNotFound(self.column.clone()))?;
        self.cached_index = Some(idx);
        Ok(idx)
    }

    fn unsupported(&self, data_type: &DataType) -> EventTimeError {
        EventTimeError::UnsupportedType {
            column: self.column.clone(),
            found: data_type.to_string(),
        }
    }
}

/// Parses a session time zone name or fixed offset.
///
/// # Errors
///
/// Returns [`TimeError::InvalidTimeZone`] for unknown names.
pub(crate) fn parse_time_zone(name: &str) -> Result<Tz, TimeError> {
    let normalized = if name.eq_ignore_ascii_case("utc") || name.eq_ignore_ascii_case("z") {
        "+00:00"
    } else {
        name
    };
    Tz::from_str(normalized).map_err(|e| TimeError::InvalidTimeZone(format!("{name}: {e}")))
}

/// Runs `f` for every row index.
fn extract<F>(len: usize, f: F) -> Vec<Option<Option<i64>>>
where
    F: Fn(usize) -> Option<Option<i64>>,
{
    (0..len).map(f).collect()
}

fn downcast<T: 'static>(column: &ArrayRef) -> Option<&T> {
    column.as_any().downcast_ref::<T>()
}
