//! Runtime value types for column data and aggregation state.

use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};

use rkyv::{Archive, Deserialize, Serialize};
use serde::{Deserialize as SerdeDeserialize, Serialize as SerdeSerialize};

/// Logical type of a column.
///
/// Every column shard holds values of exactly one of these types. Aggregation
/// state may additionally carry [`Value::Bytes`], which never appears in a column.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Archive, Serialize, Deserialize, SerdeSerialize, SerdeDeserialize,
)]
pub enum ColumnType {
    /// 64-bit signed integers.
    Long,
    /// 64-bit floating point.
    Double,
    /// UTF-8 strings.
    String,
}

impl fmt::Display for ColumnType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ColumnType::Long => f.write_str("long"),
            ColumnType::Double => f.write_str("double"),
            ColumnType::String => f.write_str("string"),
        }
    }
}

/// A single decoded value.
#[derive(Debug, Clone, PartialEq, Archive, Serialize, Deserialize, SerdeSerialize, SerdeDeserialize)]
pub enum Value {
    /// Absent value (empty groups, empty min/max).
    Null,
    /// 64-bit signed integer.
    Long(i64),
    /// 64-bit floating point.
    Double(f64),
    /// UTF-8 string.
    String(String),
    /// Opaque binary state, e.g. a serialized quantile sketch.
    Bytes(Vec<u8>),
}

impl Value {
    /// Check if this value is null.
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// The column type this value belongs to, if it can live in a column.
    pub fn column_type(&self) -> Option<ColumnType> {
        match self {
            Value::Long(_) => Some(ColumnType::Long),
            Value::Double(_) => Some(ColumnType::Double),
            Value::String(_) => Some(ColumnType::String),
            Value::Null | Value::Bytes(_) => None,
        }
    }

    /// Try to get as i64.
    pub fn as_long(&self) -> Option<i64> {
        match self {
            Value::Long(v) => Some(*v),
            _ => None,
        }
    }

    /// Try to get as f64. Longs are widened.
    pub fn as_double(&self) -> Option<f64> {
        match self {
            Value::Double(v) => Some(*v),
            Value::Long(v) => Some(*v as f64),
            _ => None,
        }
    }

    /// Try to get as string reference.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    /// Try to get as bytes reference.
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Value::Bytes(b) => Some(b),
            _ => None,
        }
    }

    /// Total order used by min/max and filters.
    ///
    /// Null sorts first. Longs and doubles compare numerically. Values of
    /// unrelated types compare by type rank so the order stays total.
    pub fn total_cmp(&self, other: &Value) -> Ordering {
        match (self, other) {
            (Value::Long(a), Value::Long(b)) => a.cmp(b),
            (Value::Double(a), Value::Double(b)) => a.total_cmp(b),
            (Value::Long(a), Value::Double(b)) => (*a as f64).total_cmp(b),
            (Value::Double(a), Value::Long(b)) => a.total_cmp(&(*b as f64)),
            (Value::String(a), Value::String(b)) => a.cmp(b),
            (Value::Bytes(a), Value::Bytes(b)) => a.cmp(b),
            (a, b) => a.type_rank().cmp(&b.type_rank()),
        }
    }

    fn type_rank(&self) -> u8 {
        match self {
            Value::Null => 0,
            Value::Long(_) | Value::Double(_) => 1,
            Value::String(_) => 2,
            Value::Bytes(_) => 3,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => f.write_str("null"),
            Value::Long(v) => write!(f, "{v}"),
            Value::Double(v) => write!(f, "{v}"),
            Value::String(s) => f.write_str(s),
            Value::Bytes(b) => write!(f, "<{} bytes>", b.len()),
        }
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Long(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Double(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::String(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::String(v)
    }
}

/// Hashable view of a [`Value`].
///
/// Doubles are compared by bit pattern, so `0.0` and `-0.0` are distinct keys
/// and `NaN` equals itself. Used for dictionary lookups and group keys.
#[derive(Debug, Clone)]
pub struct ValueKey(pub Value);

impl ValueKey {
    /// Borrow the wrapped value.
    pub fn value(&self) -> &Value {
        &self.0
    }

    /// Unwrap into the value.
    pub fn into_value(self) -> Value {
        self.0
    }
}

impl PartialEq for ValueKey {
    fn eq(&self, other: &Self) -> bool {
        match (&self.0, &other.0) {
            (Value::Double(a), Value::Double(b)) => a.to_bits() == b.to_bits(),
            (a, b) => a == b,
        }
    }
}

impl Eq for ValueKey {}

impl Hash for ValueKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        std::mem::discriminant(&self.0).hash(state);
        match &self.0 {
            Value::Null => {}
            Value::Long(v) => v.hash(state),
            Value::Double(v) => v.to_bits().hash(state),
            Value::String(s) => s.hash(state),
            Value::Bytes(b) => b.hash(state),
        }
    }
}

impl From<Value> for ValueKey {
    fn from(v: Value) -> Self {
        ValueKey(v)
    }
}
