//! Shards loaded on this node, with load/unload notifications.

use std::collections::BTreeMap;
use std::sync::Arc;

use colmesh_proto::ShardId;
use parking_lot::RwLock;
use tracing::info;

use super::shard_storage::ShardStorage;
use super::table::TableShard;
use crate::error::Error;

/// Receives shard load and unload events.
pub trait ShardEventListener: Send + Sync {
    /// A shard became available on this node.
    fn shard_loaded(&self, shard: &TableShard);

    /// A shard stopped being served by this node.
    fn shard_unloaded(&self, shard: &ShardId);
}

/// Registry of the table shards this node serves.
#[derive(Default)]
pub struct ShardCatalog {
    shards: RwLock<BTreeMap<ShardId, Arc<TableShard>>>,
    listeners: RwLock<Vec<Arc<dyn ShardEventListener>>>,
}

impl ShardCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe to load/unload events.
    pub fn register_listener(&self, listener: Arc<dyn ShardEventListener>) {
        self.listeners.write().push(listener);
    }

    /// Start serving a shard, replacing any previous metadata for it.
    pub fn load(&self, shard: TableShard) -> Arc<TableShard> {
        let shard = Arc::new(shard);
        self.shards.write().insert(shard.id().clone(), shard.clone());
        info!(shard = %shard.id(), rows = shard.row_count(), "Shard loaded");

        for listener in self.listeners.read().iter() {
            listener.shard_loaded(&shard);
        }
        shard
    }

    /// Stop serving a shard. Returns whether it was loaded.
    pub fn unload(&self, id: &ShardId) -> bool {
        let removed = self.shards.write().remove(id).is_some();
        if removed {
            info!(shard = %id, "Shard unloaded");
            for listener in self.listeners.read().iter() {
                listener.shard_unloaded(id);
            }
        }
        removed
    }

    /// Load every stored shard of a table. Returns how many were loaded.
    pub fn load_table(&self, storage: &dyn ShardStorage, table: &str) -> Result<usize, Error> {
        let shards = storage.shards_of(table)?;
        let count = shards.len();
        for shard in shards {
            self.load(shard);
        }
        Ok(count)
    }

    pub fn get(&self, id: &ShardId) -> Option<Arc<TableShard>> {
        self.shards.read().get(id).cloned()
    }

    /// Loaded shards of a table, in row order.
    pub fn shards_of(&self, table: &str) -> Vec<Arc<TableShard>> {
        self.shards
            .read()
            .values()
            .filter(|s| s.table() == table)
            .cloned()
            .collect()
    }

    /// All loaded shards.
    pub fn all(&self) -> Vec<Arc<TableShard>> {
        self.shards.read().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.shards.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.shards.read().is_empty()
    }
}
