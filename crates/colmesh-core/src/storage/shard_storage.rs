//! Persisted column shard storage.

use std::collections::{BTreeMap, HashMap};

use colmesh_proto::ShardId;
use parking_lot::RwLock;

use super::column::ColumnShard;
use super::table::TableShard;
use crate::error::Error;

/// Source of persisted table shards and their columns.
///
/// The column cache falls back to this on a miss.
pub trait ShardStorage: Send + Sync {
    /// Every stored shard of a table, ordered by first row id.
    fn shards_of(&self, table: &str) -> Result<Vec<TableShard>, Error>;

    /// Metadata of one shard.
    fn table_shard(&self, id: &ShardId) -> Result<Option<TableShard>, Error>;

    /// Load one persisted column of a shard.
    fn load_column(&self, id: &ShardId, column: &str) -> Result<Option<ColumnShard>, Error>;

    /// Store a column, creating the shard on first use.
    ///
    /// The column must cover exactly the shard's row range.
    fn store_column(&self, id: &ShardId, column: &ColumnShard) -> Result<(), Error>;

    /// Drop a shard and its columns. Returns whether it existed.
    fn remove_shard(&self, id: &ShardId) -> Result<bool, Error>;
}

/// Check a column against the shard it is stored in, returning the updated metadata.
pub(crate) fn admit_column(
    id: &ShardId,
    existing: Option<TableShard>,
    column: &ColumnShard,
) -> Result<TableShard, Error> {
    if column.first_row_id() != id.first_row_id {
        return Err(Error::InvalidShard(format!(
            "column '{}' starts at row {} but shard {} starts at row {}",
            column.name(),
            column.first_row_id(),
            id,
            id.first_row_id
        )));
    }

    let mut shard = existing.unwrap_or_else(|| TableShard::new(id.clone(), column.len()));
    if shard.row_count() != column.len() {
        return Err(Error::InvalidShard(format!(
            "column '{}' has {} rows but shard {} has {}",
            column.name(),
            column.len(),
            id,
            shard.row_count()
        )));
    }
    shard.add_column(column.name(), column.column_type());
    Ok(shard)
}

struct StoredShard {
    meta: TableShard,
    columns: HashMap<String, ColumnShard>,
}

/// In-memory shard storage.
#[derive(Default)]
pub struct MemoryShardStorage {
    shards: RwLock<BTreeMap<ShardId, StoredShard>>,
}

impl MemoryShardStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ShardStorage for MemoryShardStorage {
    fn shards_of(&self, table: &str) -> Result<Vec<TableShard>, Error> {
        Ok(self
            .shards
            .read()
            .values()
            .filter(|s| s.meta.table() == table)
            .map(|s| s.meta.clone())
            .collect())
    }

    fn table_shard(&self, id: &ShardId) -> Result<Option<TableShard>, Error> {
        Ok(self.shards.read().get(id).map(|s| s.meta.clone()))
    }

    fn load_column(&self, id: &ShardId, column: &str) -> Result<Option<ColumnShard>, Error> {
        Ok(self
            .shards
            .read()
            .get(id)
            .and_then(|s| s.columns.get(column).cloned()))
    }

    fn store_column(&self, id: &ShardId, column: &ColumnShard) -> Result<(), Error> {
        let mut shards = self.shards.write();
        let existing = shards.get(id).map(|s| s.meta.clone());
        let meta = admit_column(id, existing, column)?;

        let entry = shards.entry(id.clone()).or_insert_with(|| StoredShard {
            meta: meta.clone(),
            columns: HashMap::new(),
        });
        entry.meta = meta;
        entry.columns.insert(column.name().to_string(), column.clone());
        Ok(())
    }

    fn remove_shard(&self, id: &ShardId) -> Result<bool, Error> {
        Ok(self.shards.write().remove(id).is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::ConstantColumnShard;
    use colmesh_proto::{ColumnType, Value};

    fn constant(name: &str, first: u64, len: u64) -> ColumnShard {
        ColumnShard::Constant(ConstantColumnShard::new(name, first, len, Value::Long(1)).unwrap())
    }

    #[test]
    fn test_store_and_load() {
        let storage = MemoryShardStorage::new();
        let id = ShardId::new("t", 100);
        storage.store_column(&id, &constant("x", 100, 10)).unwrap();
        storage.store_column(&id, &constant("y", 100, 10)).unwrap();
        storage
            .store_column(&ShardId::new("t", 0), &constant("x", 0, 100))
            .unwrap();
        storage
            .store_column(&ShardId::new("u", 0), &constant("x", 0, 1))
            .unwrap();

        let shards = storage.shards_of("t").unwrap();
        assert_eq!(shards.len(), 2);
        assert_eq!(shards[0].first_row_id(), 0);
        assert_eq!(shards[1].column_type("y"), Some(ColumnType::Long));

        assert!(storage.load_column(&id, "x").unwrap().is_some());
        assert!(storage.load_column(&id, "z").unwrap().is_none());
        assert!(storage.remove_shard(&id).unwrap());
        assert!(!storage.remove_shard(&id).unwrap());
        assert!(storage.table_shard(&id).unwrap().is_none());
    }

    #[test]
    fn test_store_rejects_misaligned_columns() {
        let storage = MemoryShardStorage::new();
        let id = ShardId::new("t", 100);
        assert!(storage.store_column(&id, &constant("x", 0, 10)).is_err());

        storage.store_column(&id, &constant("x", 100, 10)).unwrap();
        assert!(storage.store_column(&id, &constant("y", 100, 11)).is_err());
    }
}
