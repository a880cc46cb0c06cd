//! Per-query execution environment.
//!
//! An [`ExecutionEnvironment`] gives the steps of one query on one table shard
//! a consistent view of columns: persisted columns are resolved through the
//! column cache (falling back to shard storage) and pinned for the lifetime
//! of the environment; temporary columns are versioned by a
//! [`ColumnVersionManager`] and only their published versions are visible.

mod resolver;
mod version;

pub use resolver::{ColumnResolver, ColumnValueType, QueryableColumnShard};
pub use version::ColumnVersionManager;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use colmesh_proto::{ColumnType, ShardId};
use parking_lot::Mutex;
use tracing::debug;

use crate::cache::ColumnShardCache;
use crate::error::Error;
use crate::storage::{ColumnShard, ShardStorage, TableShard};

/// Where persisted columns come from: the shared cache, then storage.
#[derive(Clone)]
pub struct ColumnSource {
    cache: Arc<ColumnShardCache>,
    storage: Arc<dyn ShardStorage>,
}

impl ColumnSource {
    pub fn new(cache: Arc<ColumnShardCache>, storage: Arc<dyn ShardStorage>) -> Self {
        Self { cache, storage }
    }

    /// Load a persisted column, populating the cache on a miss.
    pub fn load(&self, shard: &ShardId, column: &str) -> Result<Option<Arc<ColumnShard>>, Error> {
        self.cache
            .get_or_load(shard.clone(), column.to_string(), || {
                debug!(shard = %shard, column, "Column cache miss, loading from storage");
                self.storage.load_column(shard, column)
            })
    }

    pub fn cache(&self) -> &Arc<ColumnShardCache> {
        &self.cache
    }

    pub fn storage(&self) -> &Arc<dyn ShardStorage> {
        &self.storage
    }
}

/// Column view of one query on one table shard.
pub struct ExecutionEnvironment {
    query_id: u64,
    shard: Arc<TableShard>,
    source: ColumnSource,
    pinned: Mutex<HashMap<String, Arc<ColumnShard>>>,
    versions: ColumnVersionManager,
    released: AtomicBool,
}

impl ExecutionEnvironment {
    pub fn new(query_id: u64, shard: Arc<TableShard>, source: ColumnSource) -> Self {
        Self {
            query_id,
            shard,
            source,
            pinned: Mutex::new(HashMap::new()),
            versions: ColumnVersionManager::new(),
            released: AtomicBool::new(false),
        }
    }

    pub fn query_id(&self) -> u64 {
        self.query_id
    }

    pub fn table_shard(&self) -> &Arc<TableShard> {
        &self.shard
    }

    fn ensure_live(&self) -> Result<(), Error> {
        if self.released.load(Ordering::Acquire) {
            return Err(Error::InvalidShard(format!(
                "execution environment of query {} on {} was released",
                self.query_id,
                self.shard.id()
            )));
        }
        Ok(())
    }

    /// Resolve a column by name.
    ///
    /// Temporary columns shadow nothing: their names never collide with
    /// persisted ones. A temporary column without a published version
    /// resolves to `None`.
    pub fn column(&self, name: &str) -> Result<Option<Arc<ColumnShard>>, Error> {
        self.ensure_live()?;

        if self.versions.contains(name) {
            return Ok(self.versions.published(name));
        }
        if !self.shard.has_column(name) {
            return Ok(None);
        }

        if let Some(pinned) = self.pinned.lock().get(name) {
            return Ok(Some(pinned.clone()));
        }

        let loaded = self.source.load(self.shard.id(), name)?.ok_or_else(|| {
            Error::InvalidShard(format!(
                "column '{}' of {} is missing from storage",
                name,
                self.shard.id()
            ))
        })?;
        // another step may have pinned it meanwhile; keep the first
        let pinned = self
            .pinned
            .lock()
            .entry(name.to_string())
            .or_insert(loaded)
            .clone();
        Ok(Some(pinned))
    }

    /// Type of a persisted or temporary column.
    pub fn column_type(&self, name: &str) -> Option<ColumnType> {
        self.versions
            .column_type(name)
            .or_else(|| self.shard.column_type(name))
    }

    pub fn is_temporary(&self, name: &str) -> bool {
        self.versions.contains(name)
    }

    fn check_temporary(&self, shard: &ColumnShard) -> Result<(), Error> {
        self.ensure_live()?;
        if self.shard.has_column(shard.name()) {
            return Err(Error::InvalidShard(format!(
                "temporary column '{}' would shadow a persisted column",
                shard.name()
            )));
        }
        Ok(())
    }

    /// Record a partially computed version of a temporary column.
    pub fn store_temporary_draft(&self, shard: ColumnShard) -> Result<usize, Error> {
        self.check_temporary(&shard)?;
        let name = shard.name().to_string();
        let version = self.versions.store_draft(shard)?;
        debug!(query_id = self.query_id, column = %name, version, "Stored temporary draft");
        Ok(version)
    }

    /// Record the final version of a temporary column and make it visible.
    pub fn publish_temporary(&self, shard: ColumnShard) -> Result<usize, Error> {
        self.check_temporary(&shard)?;
        let name = shard.name().to_string();
        let version = self.versions.publish(shard)?;
        debug!(query_id = self.query_id, column = %name, version, "Published temporary column");
        Ok(version)
    }

    /// Wait until a temporary column is published, for consumers attaching
    /// while the column is still being computed.
    pub fn wait_for_published(&self, name: &str, timeout: Duration) -> Result<Arc<ColumnShard>, Error> {
        self.ensure_live()?;
        self.versions
            .wait_for_published(name, timeout)
            .ok_or_else(|| Error::Timeout(name.to_string()))
    }

    pub fn versions(&self) -> &ColumnVersionManager {
        &self.versions
    }

    /// Names of persisted columns pinned by this environment.
    pub fn pinned_columns(&self) -> Vec<String> {
        let mut names: Vec<String> = self.pinned.lock().keys().cloned().collect();
        names.sort();
        names
    }

    /// Drop all pinned columns and temporary versions.
    pub fn release(&self) {
        if self.released.swap(true, Ordering::AcqRel) {
            return;
        }
        let pinned = {
            let mut pinned = self.pinned.lock();
            let count = pinned.len();
            pinned.clear();
            count
        };
        let temporaries = self.versions.clear();
        debug!(
            query_id = self.query_id,
            shard = %self.shard.id(),
            pinned,
            temporaries,
            "Released execution environment"
        );
    }

    pub fn is_released(&self) -> bool {
        self.released.load(Ordering::Acquire)
    }
}

impl Drop for ExecutionEnvironment {
    fn drop(&mut self) {
        self.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{ColumnShardBuilder, ConstantColumnShard, MemoryShardStorage};
    use colmesh_proto::Value;

    fn fixture() -> (Arc<ColumnShardCache>, Arc<MemoryShardStorage>, Arc<TableShard>) {
        let storage = Arc::new(MemoryShardStorage::new());
        let id = ShardId::new("people", 0);
        let mut builder = ColumnShardBuilder::new("age", ColumnType::Long, 0);
        builder.extend([30i64, 41, 25].into_iter().map(Value::Long)).unwrap();
        storage.store_column(&id, &builder.build_shard().unwrap()).unwrap();
        let shard = Arc::new(storage.table_shard(&id).unwrap().unwrap());
        (Arc::new(ColumnShardCache::new(1 << 20)), storage, shard)
    }

    #[test]
    fn test_persisted_column_is_pinned_and_cached() {
        let (cache, storage, shard) = fixture();
        let env = ExecutionEnvironment::new(1, shard, ColumnSource::new(cache.clone(), storage));

        let age = env.column("age").unwrap().unwrap();
        assert_eq!(age.resolve(1).unwrap(), Value::Long(41));
        assert_eq!(env.pinned_columns(), vec!["age".to_string()]);
        assert!(cache.contains(&ShardId::new("people", 0), "age"));
        assert!(env.column("missing").unwrap().is_none());

        // evicting from the cache does not affect the pinned handle
        cache.clear();
        let again = env.column("age").unwrap().unwrap();
        assert!(Arc::ptr_eq(&age, &again));
    }

    #[test]
    fn test_temporary_columns_are_versioned() {
        let (cache, storage, shard) = fixture();
        let env = ExecutionEnvironment::new(1, shard, ColumnSource::new(cache, storage));

        let draft = ConstantColumnShard::new("tmp", 0, 3, Value::Long(0)).unwrap();
        env.store_temporary_draft(ColumnShard::Constant(draft)).unwrap();
        assert!(env.column("tmp").unwrap().is_none());
        assert!(env.is_temporary("tmp"));

        let mut builder = ColumnShardBuilder::new("tmp", ColumnType::Long, 0);
        builder.extend([1i64, 2, 3].into_iter().map(Value::Long)).unwrap();
        env.publish_temporary(builder.build_shard().unwrap()).unwrap();

        let tmp = env.column("tmp").unwrap().unwrap();
        assert_eq!(tmp.resolve(2).unwrap(), Value::Long(3));
        assert_eq!(env.column_type("tmp"), Some(ColumnType::Long));
    }

    #[test]
    fn test_temporary_cannot_shadow_persisted() {
        let (cache, storage, shard) = fixture();
        let env = ExecutionEnvironment::new(1, shard, ColumnSource::new(cache, storage));
        let shadow = ConstantColumnShard::new("age", 0, 3, Value::Long(0)).unwrap();
        assert!(env.publish_temporary(ColumnShard::Constant(shadow)).is_err());
    }

    #[test]
    fn test_release_drops_everything() {
        let (cache, storage, shard) = fixture();
        let env = ExecutionEnvironment::new(1, shard, ColumnSource::new(cache, storage));
        env.column("age").unwrap();
        env.publish_temporary(ColumnShard::Constant(
            ConstantColumnShard::new("tmp", 0, 3, Value::Long(0)).unwrap(),
        ))
        .unwrap();

        env.release();
        assert!(env.is_released());
        assert!(env.pinned_columns().is_empty());
        assert_eq!(env.versions().version_count("tmp"), 0);
        assert!(env.column("age").is_err());
        env.release();
    }

    #[test]
    fn test_missing_storage_column_is_an_error() {
        let (cache, storage, _) = fixture();
        let shard = Arc::new(
            TableShard::new(ShardId::new("people", 0), 3).with_column("ghost", ColumnType::Long),
        );
        let env = ExecutionEnvironment::new(1, shard, ColumnSource::new(cache, storage));
        assert!(matches!(env.column("ghost"), Err(Error::InvalidShard(_))));
    }
}
