//! # Window Aggregation
//!
//! Per-window, per-group accumulators for the window trigger.
//!
//! A window either computes measures ([`WindowAggregation::Aggregate`]) or
//! keeps its rows for row-preserving output ([`WindowAggregation::Rows`]).
//! Both are held in a [`WindowAccumulator`], which is archived with rkyv into
//! the state store between batches.
//!
//! All measures except `COUNT(*)` skip null inputs. `SUM`, `MIN` and `MAX`
//! over no non-null input finalize to null; the counts finalize to zero.
//!
//! ```rust
//! use windjoin_core::datum::Datum;
//! use windjoin_core::operator::aggregate::{AggregateExpr, WindowAccumulator, WindowAggregation};
//!
//! let aggregation = WindowAggregation::Aggregate(vec![
//!     AggregateExpr::count_distinct("id", "cnt"),
//! ]);
//! let mut acc = WindowAccumulator::new(&aggregation);
//! for value in [Datum::from(1_i64), Datum::from(1_i64), Datum::Null, Datum::from(2_i64)] {
//!     acc.update(vec![value])?;
//! }
//! assert_eq!(acc.finalize(), vec![vec![Datum::from(2_i64)]]);
//! # Ok::<(), windjoin_core::operator::OperatorError>(())
//! ```

use std::fmt;
use std::str::FromStr;

use arrow_schema::{DataType, Field, Schema};
use rkyv::{Archive, Deserialize as RkyvDeserialize, Serialize as RkyvSerialize};

use super::OperatorError;
use crate::datum::{normalized_type, Datum};

/// Aggregate function of a window measure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AggregateFunction {
    /// `COUNT(DISTINCT col)`
    CountDistinct,
    /// `COUNT(col)`
    Count,
    /// `COUNT(*)`
    CountStar,
    /// `SUM(col)`
    Sum,
    /// `MIN(col)`
    Min,
    /// `MAX(col)`
    Max,
}

impl AggregateFunction {
    /// Returns true if the function reads an input column.
    #[must_use]
    pub fn needs_column(self) -> bool {
        !matches!(self, Self::CountStar)
    }

    /// Returns the output type for an input column of `input` type.
    ///
    /// # Errors
    ///
    /// Returns `OperatorError::ConfigurationError` if the input type is not
    /// supported by the function.
    pub fn output_type(self, input: Option<&DataType>) -> Result<DataType, OperatorError> {
        match (self, input) {
            (Self::CountDistinct | Self::Count | Self::CountStar, _) => Ok(DataType::Int64),
            (Self::Sum, Some(dt)) => match normalized_type(dt)? {
                t @ (DataType::Int64 | DataType::Float64) => Ok(t),
                other => Err(OperatorError::ConfigurationError(format!(
                    "SUM is not defined for {other}"
                ))),
            },
            (Self::Min | Self::Max, Some(dt)) => Ok(normalized_type(dt)?),
            (_, None) => Err(OperatorError::ConfigurationError(format!(
                "{self} requires an input column"
            ))),
        }
    }
}

impl fmt::Display for AggregateFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::CountDistinct => "count_distinct",
            Self::Count => "count",
            Self::CountStar => "count_star",
            Self::Sum => "sum",
            Self::Min => "min",
            Self::Max => "max",
        };
        f.write_str(name)
    }
}

impl FromStr for AggregateFunction {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().replace(' ', "_").as_str() {
            "count_distinct" | "distinct_count" => Ok(Self::CountDistinct),
            "count" => Ok(Self::Count),
            "count_star" | "count(*)" => Ok(Self::CountStar),
            "sum" => Ok(Self::Sum),
            "min" => Ok(Self::Min),
            "max" => Ok(Self::Max),
            _ => Err(format!("Unknown aggregate function: {s}")),
        }
    }
}

/// One measure of a window aggregation: `function(column) AS alias`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AggregateExpr {
    /// Aggregate function
    pub function: AggregateFunction,
    /// Input column, `None` for `COUNT(*)`
    pub column: Option<String>,
    /// Output column name
    pub alias: String,
}

impl AggregateExpr {
    /// Creates a measure.
    #[must_use]
    pub fn new(
        function: AggregateFunction,
        column: Option<String>,
        alias: impl Into<String>,
    ) -> Self {
        Self {
            function,
            column,
            alias: alias.into(),
        }
    }

    /// `COUNT(DISTINCT column) AS alias`
    #[must_use]
    pub fn count_distinct(column: impl Into<String>, alias: impl Into<String>) -> Self {
        Self::new(AggregateFunction::CountDistinct, Some(column.into()), alias)
    }

    /// `COUNT(column) AS alias`
    #[must_use]
    pub fn count(column: impl Into<String>, alias: impl Into<String>) -> Self {
        Self::new(AggregateFunction::Count, Some(column.into()), alias)
    }

    /// `COUNT(*) AS alias`
    #[must_use]
    pub fn count_star(alias: impl Into<String>) -> Self {
        Self::new(AggregateFunction::CountStar, None, alias)
    }

    /// `SUM(column) AS alias`
    #[must_use]
    pub fn sum(column: impl Into<String>, alias: impl Into<String>) -> Self {
        Self::new(AggregateFunction::Sum, Some(column.into()), alias)
    }

    /// `MIN(column) AS alias`
    #[must_use]
    pub fn min(column: impl Into<String>, alias: impl Into<String>) -> Self {
        Self::new(AggregateFunction::Min, Some(column.into()), alias)
    }

    /// `MAX(column) AS alias`
    #[must_use]
    pub fn max(column: impl Into<String>, alias: impl Into<String>) -> Self {
        Self::new(AggregateFunction::Max, Some(column.into()), alias)
    }

    /// Resolves the input column index and the output field against `schema`.
    ///
    /// # Errors
    ///
    /// Returns `OperatorError::ConfigurationError` if the column is missing or
    /// its type is not supported by the function.
    pub fn resolve(&self, schema: &Schema) -> Result<(Option<usize>, Field), OperatorError> {
        let index = match (&self.column, self.function.needs_column()) {
            (Some(name), true) => Some(schema.index_of(name).map_err(|_| {
                OperatorError::ConfigurationError(format!(
                    "Aggregate input column not found: {name}"
                ))
            })?),
            _ => None,
        };
        let input_type = index.map(|i| schema.field(i).data_type());
        let output_type = self.function.output_type(input_type)?;
        let nullable = matches!(
            self.function,
            AggregateFunction::Sum | AggregateFunction::Min | AggregateFunction::Max
        );
        Ok((index, Field::new(&self.alias, output_type, nullable)))
    }
}

/// What a window computes per group.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WindowAggregation {
    /// Measures, one output row per group and window
    Aggregate(Vec<AggregateExpr>),
    /// Buffered rows, emitted in arrival order with the window columns
    Rows,
}

impl Default for WindowAggregation {
    fn default() -> Self {
        Self::Aggregate(Vec::new())
    }
}

/// Running state of one measure.
#[derive(Debug, Clone, Archive, RkyvSerialize, RkyvDeserialize)]
pub enum AggregateState {
    /// Sorted distinct non-null values
    Distinct(Vec<Datum>),
    /// Non-null count
    Count(i64),
    /// Row count, nulls included
    CountAll(i64),
    /// Running sum
    Sum(Option<Datum>),
    /// Running minimum
    Min(Option<Datum>),
    /// Running maximum
    Max(Option<Datum>),
}

impl AggregateState {
    /// Creates the empty state for `function`.
    #[must_use]
    pub fn new(function: AggregateFunction) -> Self {
        match function {
            AggregateFunction::CountDistinct => Self::Distinct(Vec::new()),
            AggregateFunction::Count => Self::Count(0),
            AggregateFunction::CountStar => Self::CountAll(0),
            AggregateFunction::Sum => Self::Sum(None),
            AggregateFunction::Min => Self::Min(None),
            AggregateFunction::Max => Self::Max(None),
        }
    }

    /// Folds one input value into the state. Nulls only reach `COUNT(*)`.
    ///
    /// # Errors
    ///
    /// Returns `OperatorError::ProcessingFailed` if an integer `SUM`
    /// overflows.
    pub fn update(&mut self, value: Datum) -> Result<(), OperatorError> {
        if value.is_null() && !matches!(self, Self::CountAll(_)) {
            return Ok(());
        }
        match self {
            Self::Distinct(values) => {
                if let Err(pos) = values.binary_search(&value) {
                    values.insert(pos, value);
                }
            }
            Self::Count(n) | Self::CountAll(n) => *n += 1,
            Self::Sum(acc) => {
                let sum = match (acc.take(), value) {
                    (None, v) => v,
                    (Some(Datum::Int64(a)), Datum::Int64(b)) => {
                        Datum::Int64(a.checked_add(b).ok_or_else(|| {
                            OperatorError::ProcessingFailed(format!("SUM overflow: {a} + {b}"))
                        })?)
                    }
                    (Some(Datum::Float64(a)), Datum::Float64(b)) => Datum::Float64(a + b),
                    // mixed types do not occur within one column
                    (Some(current), _) => current,
                };
                *acc = Some(sum);
            }
            Self::Min(acc) => {
                if acc.as_ref().map_or(true, |current| value < *current) {
                    *acc = Some(value);
                }
            }
            Self::Max(acc) => {
                if acc.as_ref().map_or(true, |current| value > *current) {
                    *acc = Some(value);
                }
            }
        }
        Ok(())
    }

    /// Returns the measure value.
    #[must_use]
    pub fn finalize(&self) -> Datum {
        match self {
            Self::Distinct(values) => {
                Datum::Int64(i64::try_from(values.len()).unwrap_or(i64::MAX))
            }
            Self::Count(n) | Self::CountAll(n) => Datum::Int64(*n),
            Self::Sum(acc) | Self::Min(acc) | Self::Max(acc) => {
                acc.clone().unwrap_or(Datum::Null)
            }
        }
    }
}

/// Accumulator of one `(window, group)` pair.
#[derive(Debug, Clone, Archive, RkyvSerialize, RkyvDeserialize)]
pub enum WindowAccumulator {
    /// One state per measure, in measure order
    Aggregates(Vec<AggregateState>),
    /// Buffered rows in arrival order
    Rows(Vec<Vec<Datum>>),
}

impl WindowAccumulator {
    /// Creates an empty accumulator for `aggregation`.
    #[must_use]
    pub fn new(aggregation: &WindowAggregation) -> Self {
        match aggregation {
            WindowAggregation::Aggregate(exprs) => Self::Aggregates(
                exprs
                    .iter()
                    .map(|e| AggregateState::new(e.function))
                    .collect(),
            ),
            WindowAggregation::Rows => Self::Rows(Vec::new()),
        }
    }

    /// Applies one row.
    ///
    /// For measures, `inputs` holds one value per measure (ignored for
    /// `COUNT(*)`). For row buffers, `inputs` is the full row.
    ///
    /// # Errors
    ///
    /// Returns the error of the first measure that fails to update.
    pub fn update(&mut self, inputs: Vec<Datum>) -> Result<(), OperatorError> {
        match self {
            Self::Aggregates(states) => {
                for (state, value) in states.iter_mut().zip(inputs) {
                    state.update(value)?;
                }
            }
            Self::Rows(rows) => rows.push(inputs),
        }
        Ok(())
    }

    /// Returns the output rows of this accumulator: one row of measures, or
    /// every buffered row.
    #[must_use]
    pub fn finalize(&self) -> Vec<Vec<Datum>> {
        match self {
            Self::Aggregates(states) => vec![states.iter().map(AggregateState::finalize).collect()],
            Self::Rows(rows) => rows.clone(),
        }
    }

    /// Returns the number of rows a row buffer holds, 0 for measures.
    #[must_use]
    pub fn buffered_rows(&self) -> usize {
        match self {
            Self::Aggregates(_) => 0,
            Self::Rows(rows) => rows.len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::{InMemoryStore, StateStoreExt};
    use arrow_schema::TimeUnit;

    fn measures(exprs: Vec<AggregateExpr>) -> WindowAccumulator {
        WindowAccumulator::new(&WindowAggregation::Aggregate(exprs))
    }

    #[test]
    fn test_count_distinct_skips_nulls() {
        let mut acc = measures(vec![AggregateExpr::count_distinct("name", "cnt")]);
        for v in [Datum::from("b"), Datum::from("b"), Datum::Null, Datum::from("c")] {
            acc.update(vec![v]).unwrap();
        }
        assert_eq!(acc.finalize(), vec![vec![Datum::Int64(2)]]);
    }

    #[test]
    fn test_count_star_counts_null_rows() {
        let mut acc = measures(vec![
            AggregateExpr::count("v", "c"),
            AggregateExpr::count_star("all"),
        ]);
        acc.update(vec![Datum::from(1_i64), Datum::Null]).unwrap();
        acc.update(vec![Datum::Null, Datum::Null]).unwrap();
        assert_eq!(acc.finalize(), vec![vec![Datum::Int64(1), Datum::Int64(2)]]);
    }

    #[test]
    fn test_sum_min_max() {
        let mut acc = measures(vec![
            AggregateExpr::sum("v", "s"),
            AggregateExpr::min("v", "lo"),
            AggregateExpr::max("v", "hi"),
        ]);
        for v in [5_i64, -3, 9] {
            acc.update(vec![Datum::from(v); 3]).unwrap();
        }
        acc.update(vec![Datum::Null; 3]).unwrap();
        assert_eq!(
            acc.finalize(),
            vec![vec![Datum::Int64(11), Datum::Int64(-3), Datum::Int64(9)]]
        );
    }

    #[test]
    fn test_integer_sum_overflow_is_an_error() {
        let mut acc = measures(vec![AggregateExpr::sum("v", "s")]);
        acc.update(vec![Datum::from(i64::MAX - 1)]).unwrap();
        acc.update(vec![Datum::from(1_i64)]).unwrap();
        let err = acc.update(vec![Datum::from(1_i64)]).unwrap_err();
        assert!(matches!(err, OperatorError::ProcessingFailed(_)));

        let mut acc = measures(vec![AggregateExpr::sum("v", "s")]);
        acc.update(vec![Datum::from(i64::MIN)]).unwrap();
        assert!(acc.update(vec![Datum::from(-1_i64)]).is_err());
    }

    #[test]
    fn test_empty_measures_finalize() {
        let mut acc = measures(vec![
            AggregateExpr::sum("v", "s"),
            AggregateExpr::max("v", "hi"),
            AggregateExpr::count("v", "c"),
        ]);
        acc.update(vec![Datum::Null; 3]).unwrap();
        assert_eq!(
            acc.finalize(),
            vec![vec![Datum::Null, Datum::Null, Datum::Int64(0)]]
        );
    }

    #[test]
    fn test_float_sum() {
        let mut acc = measures(vec![AggregateExpr::sum("v", "s")]);
        acc.update(vec![Datum::from(1.5)]).unwrap();
        acc.update(vec![Datum::from(2.25)]).unwrap();
        assert_eq!(acc.finalize(), vec![vec![Datum::Float64(3.75)]]);
    }

    #[test]
    fn test_rows_keep_arrival_order() {
        let mut acc = WindowAccumulator::new(&WindowAggregation::Rows);
        acc.update(vec![Datum::from("z"), Datum::from(1_i64)]).unwrap();
        acc.update(vec![Datum::from("a"), Datum::Null]).unwrap();
        assert_eq!(acc.buffered_rows(), 2);
        assert_eq!(
            acc.finalize(),
            vec![
                vec![Datum::from("z"), Datum::from(1_i64)],
                vec![Datum::from("a"), Datum::Null],
            ]
        );
    }

    #[test]
    fn test_accumulator_survives_state_store() {
        let mut acc = measures(vec![AggregateExpr::count_distinct("id", "cnt")]);
        acc.update(vec![Datum::from(7_i64)]).unwrap();
        acc.update(vec![Datum::from(8_i64)]).unwrap();

        let mut store = InMemoryStore::new();
        store.put_typed(b"acc", &acc).unwrap();
        let mut restored: WindowAccumulator = store.get_typed(b"acc").unwrap().unwrap();
        restored.update(vec![Datum::from(7_i64)]).unwrap();
        assert_eq!(restored.finalize(), vec![vec![Datum::Int64(2)]]);
    }

    #[test]
    fn test_resolve_output_fields() {
        let schema = Schema::new(vec![
            Field::new("name", DataType::LargeUtf8, true),
            Field::new("v", DataType::Int32, true),
            Field::new("ts", DataType::Timestamp(TimeUnit::Microsecond, None), true),
        ]);
        let (idx, field) = AggregateExpr::count_distinct("name", "cnt")
            .resolve(&schema)
            .unwrap();
        assert_eq!(idx, Some(0));
        assert_eq!(field.data_type(), &DataType::Int64);
        assert!(!field.is_nullable());

        let (_, field) = AggregateExpr::sum("v", "s").resolve(&schema).unwrap();
        assert_eq!(field.data_type(), &DataType::Int64);
        assert!(field.is_nullable());

        let (_, field) = AggregateExpr::max("ts", "last").resolve(&schema).unwrap();
        assert_eq!(
            field.data_type(),
            &DataType::Timestamp(TimeUnit::Millisecond, None)
        );

        let (idx, _) = AggregateExpr::count_star("n").resolve(&schema).unwrap();
        assert_eq!(idx, None);

        assert!(AggregateExpr::sum("name", "s").resolve(&schema).is_err());
        assert!(AggregateExpr::min("missing", "m").resolve(&schema).is_err());
    }

    #[test]
    fn test_function_from_str() {
        assert_eq!(
            "COUNT DISTINCT".parse::<AggregateFunction>().unwrap(),
            AggregateFunction::CountDistinct
        );
        assert_eq!("max".parse::<AggregateFunction>().unwrap(), AggregateFunction::Max);
        assert!("median".parse::<AggregateFunction>().is_err());
        assert_eq!(AggregateFunction::CountStar.to_string(), "count_star");
    }
}
