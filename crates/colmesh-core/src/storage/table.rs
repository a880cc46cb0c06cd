//! Table shard metadata.

use std::collections::BTreeMap;

use colmesh_proto::{ColumnType, ShardId};
use rkyv::{Archive, Deserialize, Serialize};

/// Metadata of one table shard: identity, row count and persisted columns.
///
/// Column data itself is obtained through the column cache and shard storage.
#[derive(Debug, Clone, PartialEq, Archive, Serialize, Deserialize)]
pub struct TableShard {
    id: ShardId,
    row_count: u64,
    columns: BTreeMap<String, ColumnType>,
}

impl TableShard {
    /// Create a shard without columns.
    pub fn new(id: ShardId, row_count: u64) -> Self {
        Self {
            id,
            row_count,
            columns: BTreeMap::new(),
        }
    }

    /// Add a persisted column.
    pub fn with_column(mut self, name: impl Into<String>, column_type: ColumnType) -> Self {
        self.columns.insert(name.into(), column_type);
        self
    }

    pub(crate) fn add_column(&mut self, name: impl Into<String>, column_type: ColumnType) {
        self.columns.insert(name.into(), column_type);
    }

    pub fn id(&self) -> &ShardId {
        &self.id
    }

    pub fn table(&self) -> &str {
        &self.id.table
    }

    pub fn first_row_id(&self) -> u64 {
        self.id.first_row_id
    }

    pub fn row_count(&self) -> u64 {
        self.row_count
    }

    /// One past the last row id.
    pub fn end_row_id(&self) -> u64 {
        self.id.first_row_id.saturating_add(self.row_count)
    }

    /// Type of a persisted column.
    pub fn column_type(&self, name: &str) -> Option<ColumnType> {
        self.columns.get(name).copied()
    }

    pub fn has_column(&self, name: &str) -> bool {
        self.columns.contains_key(name)
    }

    /// Persisted columns and their types, by name.
    pub fn columns(&self) -> impl Iterator<Item = (&str, ColumnType)> {
        self.columns.iter().map(|(k, v)| (k.as_str(), *v))
    }
}
