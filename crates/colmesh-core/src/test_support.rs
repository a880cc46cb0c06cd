//! Fixtures for tests of this crate and of crates built on it.
//!
//! Compiled for `cfg(test)` and with the `test-support` feature.

use std::sync::Arc;

use colmesh_proto::{ColumnType, ShardId, Value};

use crate::cache::ColumnShardCache;
use crate::env::{ColumnSource, ExecutionEnvironment};
use crate::storage::{ColumnShard, ColumnShardBuilder, ConstantColumnShard, MemoryShardStorage, ShardStorage};

/// Table of [`people_storage`].
pub const PEOPLE: &str = "people";

/// Build a standard column from values.
pub fn column(name: &str, column_type: ColumnType, first_row_id: u64, values: Vec<Value>) -> ColumnShard {
    let mut builder = ColumnShardBuilder::new(name, column_type, first_row_id).with_page_size(2);
    for value in values {
        if let Err(e) = builder.push(value) {
            panic!("fixture column '{}': {}", name, e);
        }
    }
    match builder.build_shard() {
        Ok(shard) => shard,
        Err(e) => panic!("fixture column '{}': {}", name, e),
    }
}

fn store(storage: &dyn ShardStorage, id: &ShardId, column: ColumnShard) {
    if let Err(e) = storage.store_column(id, &column) {
        panic!("storing fixture column '{}' in {}: {}", column.name(), id, e);
    }
}

/// One shard `people@0` with five rows.
///
/// | row | name | age | city |
/// |-----|------|-----|------|
/// | 0   | ann  | 30  | oslo |
/// | 1   | bob  | 25  | rome |
/// | 2   | cy   | 41  | oslo |
/// | 3   | dan  | 22  | rome |
/// | 4   | ed   | 35  | rome |
pub fn people_storage() -> Arc<MemoryShardStorage> {
    let storage = Arc::new(MemoryShardStorage::new());
    let id = ShardId::new(PEOPLE, 0);
    let strings = |v: &[&str]| -> Vec<Value> { v.iter().map(|s| Value::from(*s)).collect() };

    store(
        storage.as_ref(),
        &id,
        column("name", ColumnType::String, 0, strings(&["ann", "bob", "cy", "dan", "ed"])),
    );
    store(
        storage.as_ref(),
        &id,
        column("age", ColumnType::Long, 0, [30, 25, 41, 22, 35].into_iter().map(Value::Long).collect()),
    );
    store(
        storage.as_ref(),
        &id,
        column("city", ColumnType::String, 0, strings(&["oslo", "rome", "oslo", "rome", "rome"])),
    );
    storage
}

/// Execution environment over [`people_storage`] with a private cache.
pub fn people_env(query_id: u64) -> ExecutionEnvironment {
    let storage = people_storage();
    let shard = match storage.table_shard(&ShardId::new(PEOPLE, 0)) {
        Ok(Some(shard)) => shard,
        other => panic!("people fixture shard missing: {:?}", other.map(|s| s.is_some())),
    };
    ExecutionEnvironment::new(
        query_id,
        Arc::new(shard),
        ColumnSource::new(Arc::new(ColumnShardCache::new(1 << 20)), storage),
    )
}

/// Store `column` as a constant in one shard per `(first_row_id, len)` range.
pub fn constant_shards(
    storage: &dyn ShardStorage,
    table: &str,
    column: &str,
    ranges: &[(u64, u64)],
    value: Value,
) -> Vec<ShardId> {
    ranges
        .iter()
        .map(|(first, len)| {
            let id = ShardId::new(table, *first);
            let shard = match ConstantColumnShard::new(column, *first, *len, value.clone()) {
                Ok(shard) => shard,
                Err(e) => panic!("fixture constant column '{}': {}", column, e),
            };
            store(storage, &id, ColumnShard::Constant(shard));
            id
        })
        .collect()
}
