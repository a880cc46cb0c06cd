//! Which nodes serve which table shards.

use std::collections::BTreeMap;
use std::sync::Arc;

use colmesh_core::storage::{ShardEventListener, TableShard};
use colmesh_proto::ShardId;
use parking_lot::RwLock;
use tracing::{debug, info};

/// A change to the shard placement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MembershipEvent {
    /// A node started serving a shard.
    ShardAdded { shard: ShardId, node: String },
    /// A node stopped serving a shard.
    ShardRemoved { shard: ShardId, node: String },
}

/// Receives placement changes.
pub trait MembershipListener: Send + Sync {
    fn on_event(&self, event: &MembershipEvent);
}

/// Cluster-wide registry: table -> shard -> replica addresses.
///
/// Replicas of a shard keep the order in which they announced it; the
/// coordinator tries them in that order.
#[derive(Default)]
pub struct ClusterMembership {
    tables: RwLock<BTreeMap<String, BTreeMap<ShardId, Vec<String>>>>,
    listeners: RwLock<Vec<Arc<dyn MembershipListener>>>,
}

impl ClusterMembership {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe to placement changes.
    pub fn subscribe(&self, listener: Arc<dyn MembershipListener>) {
        self.listeners.write().push(listener);
    }

    /// Record that `node` serves `shard`. Returns false if it was already known.
    pub fn shard_loaded(&self, shard: &ShardId, node: &str) -> bool {
        let added = {
            let mut tables = self.tables.write();
            let replicas = tables
                .entry(shard.table.clone())
                .or_default()
                .entry(shard.clone())
                .or_default();
            if replicas.iter().any(|r| r == node) {
                false
            } else {
                replicas.push(node.to_string());
                true
            }
        };

        if added {
            debug!(shard = %shard, node, "Replica added");
            self.notify(MembershipEvent::ShardAdded {
                shard: shard.clone(),
                node: node.to_string(),
            });
        }
        added
    }

    /// Record that `node` no longer serves `shard`. Returns whether it did.
    pub fn shard_unloaded(&self, shard: &ShardId, node: &str) -> bool {
        let removed = {
            let mut tables = self.tables.write();
            let Some(shards) = tables.get_mut(&shard.table) else {
                return false;
            };
            let Some(replicas) = shards.get_mut(shard) else {
                return false;
            };
            let before = replicas.len();
            replicas.retain(|r| r != node);
            let removed = replicas.len() != before;
            if replicas.is_empty() {
                shards.remove(shard);
            }
            if shards.is_empty() {
                tables.remove(&shard.table);
            }
            removed
        };

        if removed {
            debug!(shard = %shard, node, "Replica removed");
            self.notify(MembershipEvent::ShardRemoved {
                shard: shard.clone(),
                node: node.to_string(),
            });
        }
        removed
    }

    /// Forget every shard of a node. Returns how many placements were dropped.
    pub fn remove_node(&self, node: &str) -> usize {
        let served: Vec<ShardId> = self
            .tables
            .read()
            .values()
            .flat_map(|shards| shards.iter())
            .filter(|(_, replicas)| replicas.iter().any(|r| r == node))
            .map(|(shard, _)| shard.clone())
            .collect();

        let removed = served.iter().filter(|s| self.shard_unloaded(s, node)).count();
        if removed > 0 {
            info!(node, shards = removed, "Node removed from membership");
        }
        removed
    }

    /// Shards of a table with their replicas, ordered by first row id.
    pub fn shards_of(&self, table: &str) -> Vec<(ShardId, Vec<String>)> {
        self.tables
            .read()
            .get(table)
            .map(|shards| shards.iter().map(|(s, r)| (s.clone(), r.clone())).collect())
            .unwrap_or_default()
    }

    /// Replica addresses of one shard.
    pub fn replicas(&self, shard: &ShardId) -> Vec<String> {
        self.tables
            .read()
            .get(&shard.table)
            .and_then(|shards| shards.get(shard))
            .cloned()
            .unwrap_or_default()
    }

    /// Every node that serves at least one shard.
    pub fn nodes(&self) -> Vec<String> {
        let mut nodes: Vec<String> = self
            .tables
            .read()
            .values()
            .flat_map(|shards| shards.values().flatten().cloned())
            .collect();
        nodes.sort();
        nodes.dedup();
        nodes
    }

    pub fn tables(&self) -> Vec<String> {
        self.tables.read().keys().cloned().collect()
    }

    fn notify(&self, event: MembershipEvent) {
        for listener in self.listeners.read().iter() {
            listener.on_event(&event);
        }
    }
}

/// Publishes the shards a node loads and unloads into the membership.
///
/// Registered on the node's shard catalog.
pub struct MembershipPublisher {
    membership: Arc<ClusterMembership>,
    address: String,
}

impl MembershipPublisher {
    pub fn new(membership: Arc<ClusterMembership>, address: impl Into<String>) -> Self {
        Self {
            membership,
            address: address.into(),
        }
    }
}

impl ShardEventListener for MembershipPublisher {
    fn shard_loaded(&self, shard: &TableShard) {
        self.membership.shard_loaded(shard.id(), &self.address);
    }

    fn shard_unloaded(&self, shard: &ShardId) {
        self.membership.shard_unloaded(shard, &self.address);
    }
}
