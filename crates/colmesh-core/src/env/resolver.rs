//! Typed access to columns of an execution environment.

use std::marker::PhantomData;
use std::sync::Arc;

use colmesh_proto::{ColumnType, Value};

use super::ExecutionEnvironment;
use crate::error::Error;
use crate::storage::ColumnShard;

/// Rust types a column can be read as.
pub trait ColumnValueType: Sized + Send + Sync + 'static {
    const COLUMN_TYPE: ColumnType;

    /// Convert a resolved value. `None` for a value of another type.
    fn from_value(value: Value) -> Option<Self>;
}

impl ColumnValueType for i64 {
    const COLUMN_TYPE: ColumnType = ColumnType::Long;

    fn from_value(value: Value) -> Option<Self> {
        value.as_long()
    }
}

impl ColumnValueType for f64 {
    const COLUMN_TYPE: ColumnType = ColumnType::Double;

    fn from_value(value: Value) -> Option<Self> {
        match value {
            Value::Double(d) => Some(d),
            _ => None,
        }
    }
}

impl ColumnValueType for String {
    const COLUMN_TYPE: ColumnType = ColumnType::String;

    fn from_value(value: Value) -> Option<Self> {
        match value {
            Value::String(s) => Some(s),
            _ => None,
        }
    }
}

/// A column shard known to hold values of type `T`.
pub struct QueryableColumnShard<T> {
    shard: Arc<ColumnShard>,
    _marker: PhantomData<fn() -> T>,
}

impl<T> Clone for QueryableColumnShard<T> {
    fn clone(&self) -> Self {
        Self {
            shard: self.shard.clone(),
            _marker: PhantomData,
        }
    }
}

impl<T: ColumnValueType> QueryableColumnShard<T> {
    /// Wrap a shard, checking its type.
    pub fn new(shard: Arc<ColumnShard>) -> Result<Self, Error> {
        if shard.column_type() != T::COLUMN_TYPE {
            return Err(Error::TypeMismatch {
                column: shard.name().to_string(),
                expected: T::COLUMN_TYPE.to_string(),
                actual: shard.column_type().to_string(),
            });
        }
        Ok(Self {
            shard,
            _marker: PhantomData,
        })
    }

    pub fn name(&self) -> &str {
        self.shard.name()
    }

    pub fn first_row_id(&self) -> u64 {
        self.shard.first_row_id()
    }

    pub fn len(&self) -> u64 {
        self.shard.len()
    }

    pub fn is_empty(&self) -> bool {
        self.shard.is_empty()
    }

    fn convert(&self, value: Value) -> Result<T, Error> {
        let actual = crate::storage::describe_type(&value);
        T::from_value(value).ok_or_else(|| Error::TypeMismatch {
            column: self.shard.name().to_string(),
            expected: T::COLUMN_TYPE.to_string(),
            actual,
        })
    }

    /// Value at a row id.
    pub fn get(&self, row_id: u64) -> Result<T, Error> {
        self.convert(self.shard.resolve(row_id)?)
    }

    /// Values of `[from, to)`, in row-id order.
    pub fn values(&self, from: u64, to: u64) -> Result<Vec<T>, Error> {
        self.shard
            .resolve_range(from, to)?
            .into_iter()
            .map(|v| self.convert(v))
            .collect()
    }

    pub fn shard(&self) -> &Arc<ColumnShard> {
        &self.shard
    }
}

/// Resolves column names to typed column shards.
pub trait ColumnResolver<T: ColumnValueType> {
    /// `Ok(None)` when no such column is visible.
    fn resolve(&self, name: &str) -> Result<Option<QueryableColumnShard<T>>, Error>;
}

impl<T: ColumnValueType> ColumnResolver<T> for ExecutionEnvironment {
    fn resolve(&self, name: &str) -> Result<Option<QueryableColumnShard<T>>, Error> {
        match self.column(name)? {
            Some(shard) => QueryableColumnShard::new(shard).map(Some),
            None => Ok(None),
        }
    }
}
