//! Scalar cell values.
//!
//! Operators keep group keys, join keys, accumulators and buffered rows as
//! [`Datum`] values rather than Arrow arrays, so they can be serialized with
//! rkyv into the state store and compared without downcasting. Arrow types
//! are normalised on the way in: every signed integer and the small unsigned
//! ones become `Int64`, `Float32` becomes `Float64`, `LargeUtf8` becomes
//! `Utf8`, and timestamps of any unit become millisecond `Timestamp`s.

use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use arrow_array::cast::AsArray;
use arrow_array::types::{
    Date32Type, Float32Type, Float64Type, Int16Type, Int32Type, Int64Type, Int8Type,
    TimestampMicrosecondType, TimestampMillisecondType, TimestampNanosecondType,
    TimestampSecondType, UInt16Type, UInt32Type, UInt64Type, UInt8Type,
};
use arrow_array::{
    Array, ArrayRef, BooleanArray, Float64Array, Int64Array, NullArray, StringArray,
    TimestampMillisecondArray,
};
use arrow_schema::{DataType, TimeUnit};
use rkyv::{Archive, Deserialize as RkyvDeserialize, Serialize as RkyvSerialize};

const MILLIS_PER_DAY: i64 = 86_400_000;

/// One cell value.
#[derive(Debug, Clone, Archive, RkyvSerialize, RkyvDeserialize)]
#[rkyv(derive(Debug))]
pub enum Datum {
    /// SQL NULL
    Null,
    /// Boolean value
    Boolean(bool),
    /// Any integer column, widened
    Int64(i64),
    /// Any floating point column, widened
    Float64(f64),
    /// UTF-8 string
    Utf8(String),
    /// Timestamp or date, milliseconds since epoch
    Timestamp(i64),
}

impl Datum {
    /// Returns true for [`Datum::Null`].
    #[inline]
    #[must_use]
    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    /// Returns true for a NaN float.
    #[inline]
    #[must_use]
    pub fn is_nan(&self) -> bool {
        matches!(self, Self::Float64(f) if f.is_nan())
    }

    /// SQL `=`: `None` (unknown) if either side is null. Floats compare as
    /// IEEE values, so NaN equals nothing and `0.0 = -0.0`.
    #[must_use]
    #[allow(clippy::float_cmp)]
    pub fn sql_eq(&self, other: &Self) -> Option<bool> {
        match (self, other) {
            (Self::Null, _) | (_, Self::Null) => None,
            (Self::Float64(a), Self::Float64(b)) => Some(a == b),
            _ => Some(self == other),
        }
    }

    /// Returns the integer payload of `Int64` and `Timestamp` values.
    #[must_use]
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Int64(v) | Self::Timestamp(v) => Some(*v),
            _ => None,
        }
    }

    /// Returns the string payload of `Utf8` values.
    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Utf8(s) => Some(s),
            _ => None,
        }
    }

    fn rank(&self) -> u8 {
        match self {
            Self::Null => 0,
            Self::Boolean(_) => 1,
            Self::Int64(_) => 2,
            Self::Float64(_) => 3,
            Self::Utf8(_) => 4,
            Self::Timestamp(_) => 5,
        }
    }

    /// Reads the value at `row` of `array`.
    ///
    /// # Errors
    ///
    /// Returns [`DatumError::UnsupportedType`] for types without a `Datum`
    /// representation and [`DatumError::OutOfRange`] for `UInt64` values
    /// above `i64::MAX`.
    pub fn from_array(array: &dyn Array, row: usize) -> Result<Self, DatumError> {
        if array.is_null(row) {
            return Ok(Self::Null);
        }
        let datum = match array.data_type() {
            DataType::Null => Self::Null,
            DataType::Boolean => Self::Boolean(array.as_boolean().value(row)),
            DataType::Int8 => Self::Int64(i64::from(array.as_primitive::<Int8Type>().value(row))),
            DataType::Int16 => {
                Self::Int64(i64::from(array.as_primitive::<Int16Type>().value(row)))
            }
            DataType::Int32 => {
                Self::Int64(i64::from(array.as_primitive::<Int32Type>().value(row)))
            }
            DataType::Int64 => Self::Int64(array.as_primitive::<Int64Type>().value(row)),
            DataType::UInt8 => {
                Self::Int64(i64::from(array.as_primitive::<UInt8Type>().value(row)))
            }
            DataType::UInt16 => {
                Self::Int64(i64::from(array.as_primitive::<UInt16Type>().value(row)))
            }
            DataType::UInt32 => {
                Self::Int64(i64::from(array.as_primitive::<UInt32Type>().value(row)))
            }
            DataType::UInt64 => {
                let value = array.as_primitive::<UInt64Type>().value(row);
                Self::Int64(i64::try_from(value).map_err(|_| DatumError::OutOfRange(value))?)
            }
            DataType::Float32 => {
                Self::Float64(f64::from(array.as_primitive::<Float32Type>().value(row)))
            }
            DataType::Float64 => Self::Float64(array.as_primitive::<Float64Type>().value(row)),
            DataType::Utf8 => Self::Utf8(array.as_string::<i32>().value(row).to_string()),
            DataType::LargeUtf8 => Self::Utf8(array.as_string::<i64>().value(row).to_string()),
            DataType::Date32 => Self::Timestamp(
                i64::from(array.as_primitive::<Date32Type>().value(row)) * MILLIS_PER_DAY,
            ),
            DataType::Timestamp(unit, _) => Self::Timestamp(match unit {
                TimeUnit::Second => array
                    .as_primitive::<TimestampSecondType>()
                    .value(row)
                    .saturating_mul(1000),
                TimeUnit::Millisecond => array.as_primitive::<TimestampMillisecondType>().value(row),
                TimeUnit::Microsecond => array
                    .as_primitive::<TimestampMicrosecondType>()
                    .value(row)
                    .div_euclid(1000),
                TimeUnit::Nanosecond => array
                    .as_primitive::<TimestampNanosecondType>()
                    .value(row)
                    .div_euclid(1_000_000),
            }),
            other => return Err(DatumError::UnsupportedType(other.to_string())),
        };
        Ok(datum)
    }

    /// Reads one row of several columns.
    ///
    /// # Errors
    ///
    /// Propagates [`Datum::from_array`] errors.
    pub fn row_from_columns(columns: &[ArrayRef], row: usize) -> Result<Vec<Self>, DatumError> {
        columns
            .iter()
            .map(|column| Self::from_array(column.as_ref(), row))
            .collect()
    }
}

/// Returns the Arrow type that [`to_array`] produces for values read from a
/// column of `data_type`.
///
/// # Errors
///
/// Returns [`DatumError::UnsupportedType`] for types `Datum` cannot hold.
pub fn normalized_type(data_type: &DataType) -> Result<DataType, DatumError> {
    match data_type {
        DataType::Null => Ok(DataType::Null),
        DataType::Boolean => Ok(DataType::Boolean),
        DataType::Int8
        | DataType::Int16
        | DataType::Int32
        | DataType::Int64
        | DataType::UInt8
        | DataType::UInt16
        | DataType::UInt32
        | DataType::UInt64 => Ok(DataType::Int64),
        DataType::Float32 | DataType::Float64 => Ok(DataType::Float64),
        DataType::Utf8 | DataType::LargeUtf8 => Ok(DataType::Utf8),
        DataType::Date32 => Ok(DataType::Timestamp(TimeUnit::Millisecond, None)),
        DataType::Timestamp(_, tz) => Ok(DataType::Timestamp(TimeUnit::Millisecond, tz.clone())),
        other => Err(DatumError::UnsupportedType(other.to_string())),
    }
}

/// Builds an Arrow array of a normalized type from datums.
///
/// # Errors
///
/// Returns [`DatumError::TypeMismatch`] if a non-null value does not match
/// `data_type`, or [`DatumError::UnsupportedType`] for non-normalized types.
pub fn to_array(values: &[Datum], data_type: &DataType) -> Result<ArrayRef, DatumError> {
    let mismatch = |found: &Datum| DatumError::TypeMismatch {
        expected: data_type.to_string(),
        found: format!("{found:?}"),
    };
    let array: ArrayRef = match data_type {
        DataType::Null => Arc::new(NullArray::new(values.len())),
        DataType::Boolean => Arc::new(
            values
                .iter()
                .map(|v| match v {
                    Datum::Null => Ok(None),
                    Datum::Boolean(b) => Ok(Some(*b)),
                    other => Err(mismatch(other)),
                })
                .collect::<Result<BooleanArray, _>>()?,
        ),
        DataType::Int64 => Arc::new(
            values
                .iter()
                .map(|v| match v {
                    Datum::Null => Ok(None),
                    Datum::Int64(i) => Ok(Some(*i)),
                    other => Err(mismatch(other)),
                })
                .collect::<Result<Int64Array, _>>()?,
        ),
        DataType::Float64 => Arc::new(
            values
                .iter()
                .map(|v| match v {
                    Datum::Null => Ok(None),
                    Datum::Float64(f) => Ok(Some(*f)),
                    other => Err(mismatch(other)),
                })
                .collect::<Result<Float64Array, _>>()?,
        ),
        DataType::Utf8 => Arc::new(
            values
                .iter()
                .map(|v| match v {
                    Datum::Null => Ok(None),
                    Datum::Utf8(s) => Ok(Some(s.as_str())),
                    other => Err(mismatch(other)),
                })
                .collect::<Result<StringArray, _>>()?,
        ),
        DataType::Timestamp(TimeUnit::Millisecond, tz) => Arc::new(
            values
                .iter()
                .map(|v| match v {
                    Datum::Null => Ok(None),
                    Datum::Timestamp(t) => Ok(Some(*t)),
                    other => Err(mismatch(other)),
                })
                .collect::<Result<TimestampMillisecondArray, _>>()?
                .with_timezone_opt(tz.clone()),
        ),
        other => return Err(DatumError::UnsupportedType(other.to_string())),
    };
    Ok(array)
}

/// Folds `-0.0` into `0.0` and every NaN into one value, so grouping and
/// hashing see a single identity for each.
#[inline]
fn canonical(f: f64) -> f64 {
    if f.is_nan() {
        f64::NAN
    } else if f == 0.0 {
        0.0
    } else {
        f
    }
}

/// Appends an order-preserving binary encoding of `values` to `out`.
///
/// Equal tuples encode to equal bytes and byte order follows [`Datum`]
/// order, so encoded keys can be used as state-store key suffixes.
pub fn encode_key(values: &[Datum], out: &mut Vec<u8>) {
    for value in values {
        out.push(value.rank());
        match value {
            Datum::Null => {}
            Datum::Boolean(b) => out.push(u8::from(*b)),
            Datum::Int64(v) | Datum::Timestamp(v) => {
                out.extend_from_slice(&(*v ^ i64::MIN).to_be_bytes());
            }
            Datum::Float64(f) => {
                let bits = canonical(*f).to_bits();
                let ordered = if bits >> 63 == 1 { !bits } else { bits | (1 << 63) };
                out.extend_from_slice(&ordered.to_be_bytes());
            }
            Datum::Utf8(s) => {
                // 0x00 escaped as 0x00 0xFF, terminated by 0x00 0x01
                for byte in s.as_bytes() {
                    out.push(*byte);
                    if *byte == 0 {
                        out.push(0xFF);
                    }
                }
                out.extend_from_slice(&[0x00, 0x01]);
            }
        }
    }
}

impl PartialEq for Datum {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Datum {}

impl PartialOrd for Datum {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Datum {
    /// Nulls first, then by type, then by value. Floats use `total_cmp` after
    /// folding signed zeros and NaN payloads, with NaN sorting last.
    fn cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (Self::Boolean(a), Self::Boolean(b)) => a.cmp(b),
            (Self::Int64(a), Self::Int64(b)) | (Self::Timestamp(a), Self::Timestamp(b)) => {
                a.cmp(b)
            }
            (Self::Float64(a), Self::Float64(b)) => canonical(*a).total_cmp(&canonical(*b)),
            (Self::Utf8(a), Self::Utf8(b)) => a.cmp(b),
            _ => self.rank().cmp(&other.rank()),
        }
    }
}

impl Hash for Datum {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.rank().hash(state);
        match self {
            Self::Null => {}
            Self::Boolean(b) => b.hash(state),
            Self::Int64(v) | Self::Timestamp(v) => v.hash(state),
            Self::Float64(f) => canonical(*f).to_bits().hash(state),
            Self::Utf8(s) => s.hash(state),
        }
    }
}

impl fmt::Display for Datum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Null => write!(f, "NULL"),
            Self::Boolean(b) => write!(f, "{b}"),
            Self::Int64(v) => write!(f, "{v}"),
            Self::Float64(v) => write!(f, "{v}"),
            Self::Utf8(s) => write!(f, "{s}"),
            Self::Timestamp(t) => write!(f, "{t}ms"),
        }
    }
}

impl From<i64> for Datum {
    fn from(value: i64) -> Self {
        Self::Int64(value)
    }
}

impl From<f64> for Datum {
    fn from(value: f64) -> Self {
        Self::Float64(value)
    }
}

impl From<bool> for Datum {
    fn from(value: bool) -> Self {
        Self::Boolean(value)
    }
}

impl From<&str> for Datum {
    fn from(value: &str) -> Self {
        Self::Utf8(value.to_string())
    }
}

impl From<String> for Datum {
    fn from(value: String) -> Self {
        Self::Utf8(value)
    }
}

impl<T: Into<Datum>> From<Option<T>> for Datum {
    fn from(value: Option<T>) -> Self {
        value.map_or(Self::Null, Into::into)
    }
}

/// Errors converting between Arrow and [`Datum`].
#[derive(Debug, thiserror::Error)]
pub enum DatumError {
    /// Arrow type has no datum representation
    #[error("Unsupported column type: {0}")]
    UnsupportedType(String),

    /// Value does not fit the target column type
    #[error("Type mismatch: expected {expected}, found {found}")]
    TypeMismatch {
        /// Target Arrow type
        expected: String,
        /// Offending value
        found: String,
    },

    /// Unsigned value too large for Int64
    #[error("Value out of range for Int64: {0}")]
    OutOfRange(u64),
}

#[cfg(test)]
mod tests {
    use super::*;
    use arrow_array::{Int32Array, LargeStringArray, TimestampMicrosecondArray};
    use std::collections::HashSet;

    #[test]
    fn test_from_array_normalizes_types() {
        let ints = Int32Array::from(vec![Some(7), None]);
        assert_eq!(Datum::from_array(&ints, 0).unwrap(), Datum::Int64(7));
        assert!(Datum::from_array(&ints, 1).unwrap().is_null());

        let strings = LargeStringArray::from(vec!["a"]);
        assert_eq!(Datum::from_array(&strings, 0).unwrap(), Datum::from("a"));

        let micros = TimestampMicrosecondArray::from(vec![5_000_500]);
        assert_eq!(Datum::from_array(&micros, 0).unwrap(), Datum::Timestamp(5000));

        let unsupported = arrow_array::BinaryArray::from(vec![b"x".as_slice()]);
        assert!(Datum::from_array(&unsupported, 0).is_err());
    }

    #[test]
    fn test_to_array_round_trips_normalized_type() {
        let values = vec![Datum::from("x"), Datum::Null, Datum::from("y")];
        let array = to_array(&values, &DataType::Utf8).unwrap();
        assert_eq!(array.len(), 3);
        assert!(array.is_null(1));
        assert_eq!(Datum::from_array(array.as_ref(), 2).unwrap(), Datum::from("y"));

        let err = to_array(&[Datum::Int64(1)], &DataType::Utf8);
        assert!(matches!(err, Err(DatumError::TypeMismatch { .. })));
        assert_eq!(normalized_type(&DataType::Int16).unwrap(), DataType::Int64);
    }

    #[test]
    fn test_sql_eq_is_unknown_for_nulls() {
        assert_eq!(Datum::Int64(1).sql_eq(&Datum::Int64(1)), Some(true));
        assert_eq!(Datum::Int64(1).sql_eq(&Datum::Int64(2)), Some(false));
        assert_eq!(Datum::Null.sql_eq(&Datum::Int64(2)), None);
        assert_eq!(Datum::Null.sql_eq(&Datum::Null), None);
        // structural equality treats nulls as equal
        assert_eq!(Datum::Null, Datum::Null);
    }

    #[test]
    fn test_float_keys_fold_signed_zero_and_nan() {
        let zero = Datum::Float64(0.0);
        let neg_zero = Datum::Float64(-0.0);
        let nan = Datum::Float64(f64::NAN);
        let other_nan = Datum::Float64(-f64::NAN);

        assert_eq!(zero.sql_eq(&neg_zero), Some(true));
        assert_eq!(nan.sql_eq(&nan), Some(false));
        assert_eq!(nan.sql_eq(&Datum::Float64(1.0)), Some(false));

        // one group each
        assert_eq!(zero, neg_zero);
        assert_eq!(nan, other_nan);
        let set: HashSet<Datum> = [zero.clone(), neg_zero.clone(), nan.clone(), other_nan]
            .into_iter()
            .collect();
        assert_eq!(set.len(), 2);
        assert!(Datum::Float64(f64::INFINITY) < nan);

        let (mut a, mut b) = (Vec::new(), Vec::new());
        encode_key(&[zero], &mut a);
        encode_key(&[neg_zero], &mut b);
        assert_eq!(a, b);
    }

    #[test]
    fn test_hash_consistent_with_eq() {
        let set: HashSet<Datum> = [Datum::from("a"), Datum::from("a"), Datum::Float64(1.5)]
            .into_iter()
            .collect();
        assert_eq!(set.len(), 2);
        assert!(set.contains(&Datum::Float64(1.5)));
    }

    #[test]
    fn test_encode_key_preserves_order() {
        let mut tuples = vec![
            vec![Datum::Int64(-5)],
            vec![Datum::Null],
            vec![Datum::Int64(3)],
            vec![Datum::Float64(-0.5)],
            vec![Datum::Float64(2.0)],
            vec![Datum::from("ab")],
            vec![Datum::from("a")],
            vec![Datum::from("a\0b")],
        ];
        let mut encoded: Vec<(Vec<u8>, Vec<Datum>)> = tuples
            .iter()
            .map(|t| {
                let mut buf = Vec::new();
                encode_key(t, &mut buf);
                (buf, t.clone())
            })
            .collect();
        encoded.sort();
        tuples.sort();
        let by_bytes: Vec<_> = encoded.into_iter().map(|(_, t)| t).collect();
        assert_eq!(by_bytes, tuples);
    }

    #[test]
    fn test_rkyv_round_trip() {
        let row = vec![Datum::from("b"), Datum::Null, Datum::Float64(0.25)];
        let bytes = rkyv::to_bytes::<rkyv::rancor::Error>(&row).unwrap();
        let back: Vec<Datum> = rkyv::from_bytes::<Vec<Datum>, rkyv::rancor::Error>(&bytes).unwrap();
        assert_eq!(back, row);
    }
}
