//! The remote node interface and its in-process implementation.

use std::sync::Arc;

use async_trait::async_trait;
use colmesh_proto::{RemotePlan, ShardResult};
use dashmap::DashMap;
use tracing::debug;

use crate::error::ClusterError;
use crate::service::NodeService;

/// What a node answered to an execute request.
#[derive(Debug, Clone, PartialEq)]
pub enum ExecuteReply {
    /// One result per requested shard.
    Executed(Vec<ShardResult>),
    /// The node serves no shard of the plan's table.
    NoShards,
}

/// A node that runs plans on its local shards.
#[async_trait]
pub trait RemoteNode: Send + Sync {
    /// Address the node was reached at.
    fn address(&self) -> &str;

    /// Run `plan` on the shards with the given first row ids; all local
    /// shards of the table when `shards` is empty.
    async fn execute(&self, plan: &RemotePlan, shards: &[u64]) -> Result<ExecuteReply, ClusterError>;

    /// Cancel a running query. Returns whether the node was running it.
    async fn cancel(&self, query_id: u64) -> Result<bool, ClusterError>;
}

/// Hands out a [`RemoteNode`] per address.
pub trait NodeConnector: Send + Sync {
    fn connect(&self, address: &str) -> Result<Arc<dyn RemoteNode>, ClusterError>;
}

/// In-process registry of node services.
///
/// Stands in for the network when every node of a cluster lives in the same
/// process.
#[derive(Default)]
pub struct LocalDispatch {
    nodes: DashMap<String, Arc<NodeService>>,
}

impl LocalDispatch {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make a service reachable at `address`, replacing any previous one.
    pub fn register(&self, address: impl Into<String>, service: Arc<NodeService>) {
        let address = address.into();
        debug!(address = %address, "Registered local node");
        self.nodes.insert(address, service);
    }

    /// Make an address unreachable. Returns whether it was registered.
    pub fn unregister(&self, address: &str) -> bool {
        self.nodes.remove(address).is_some()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}

impl NodeConnector for LocalDispatch {
    fn connect(&self, address: &str) -> Result<Arc<dyn RemoteNode>, ClusterError> {
        let service = self
            .nodes
            .get(address)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| ClusterError::Network(format!("no node registered at {}", address)))?;
        Ok(Arc::new(LocalNode {
            address: address.to_string(),
            service,
        }))
    }
}

/// A node service called directly.
pub struct LocalNode {
    address: String,
    service: Arc<NodeService>,
}

impl LocalNode {
    pub fn new(address: impl Into<String>, service: Arc<NodeService>) -> Self {
        Self {
            address: address.into(),
            service,
        }
    }
}

#[async_trait]
impl RemoteNode for LocalNode {
    fn address(&self) -> &str {
        &self.address
    }

    async fn execute(&self, plan: &RemotePlan, shards: &[u64]) -> Result<ExecuteReply, ClusterError> {
        Ok(self.service.execute(plan.clone(), shards.to_vec()).await)
    }

    async fn cancel(&self, query_id: u64) -> Result<bool, ClusterError> {
        Ok(self.service.cancel(query_id))
    }
}
