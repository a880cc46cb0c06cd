//! Composition root: assembles a node from its configuration.

use std::sync::Arc;

use colmesh_cluster::{
    ClusterMembership, FanOutCoordinator, LocalDispatch, MembershipPublisher, NngConnector, NodeConnector,
    NodeService,
};
use colmesh_core::env::ColumnSource;
use colmesh_core::storage::{ShardCatalog, ShardStorage};
use colmesh_core::{ColumnShardCache, ExecutionMetrics, MemoryShardStorage, SledShardStorage, SledStorageConfig};
use colmesh_proto::{QueryResult, RemotePlan, ShardId};
use tracing::info;

use crate::config::{Profile, ServerConfig};
use crate::error::Error;
use crate::handler::RequestHandler;

/// Membership and dispatch shared by test-profile nodes of one process.
#[derive(Default, Clone)]
pub struct InProcessCluster {
    pub membership: Arc<ClusterMembership>,
    pub dispatch: Arc<LocalDispatch>,
}

impl InProcessCluster {
    pub fn new() -> Self {
        Self::default()
    }
}

/// A fully wired node: shard storage, column cache, catalog, plan service,
/// request handler and fan-out coordinator.
pub struct Node {
    config: ServerConfig,
    storage: Arc<dyn ShardStorage>,
    cache: Arc<ColumnShardCache>,
    service: Arc<NodeService>,
    handler: Arc<RequestHandler>,
    coordinator: FanOutCoordinator,
}

impl Node {
    /// Assemble a node for the configured profile.
    ///
    /// A test-profile node gets a cluster of its own; use
    /// [`Node::join_in_process`] to put several into one cluster.
    pub fn build(config: ServerConfig) -> Result<Self, Error> {
        match config.profile {
            Profile::Normal => {
                let storage = open_storage(&config)?;
                let connector = Arc::new(NngConnector::new(config.cluster.request_timeout));
                Self::assemble(config, storage, Arc::new(ClusterMembership::new()), connector)
            }
            Profile::Test => Self::join_in_process(config, &InProcessCluster::new()),
            Profile::Tool => Err(Error::Config("the tool profile does not run a node".to_string())),
        }
    }

    /// Assemble a test-profile node reachable through `cluster`'s dispatch.
    pub fn join_in_process(config: ServerConfig, cluster: &InProcessCluster) -> Result<Self, Error> {
        let storage: Arc<dyn ShardStorage> = Arc::new(MemoryShardStorage::new());
        let node = Self::assemble(config, storage, cluster.membership.clone(), cluster.dispatch.clone())?;
        cluster
            .dispatch
            .register(node.config.advertise_address(), node.service.clone());
        Ok(node)
    }

    fn assemble(
        config: ServerConfig,
        storage: Arc<dyn ShardStorage>,
        membership: Arc<ClusterMembership>,
        connector: Arc<dyn NodeConnector>,
    ) -> Result<Self, Error> {
        let address = config.advertise_address().to_string();
        let cache = Arc::new(ColumnShardCache::new(config.cache.max_bytes));

        let catalog = Arc::new(ShardCatalog::new());
        catalog.register_listener(cache.clone());
        catalog.register_listener(Arc::new(MembershipPublisher::new(membership.clone(), address.clone())));

        for placement in &config.placements {
            membership.shard_loaded(&placement.shard, &placement.node);
        }
        for table in &config.tables {
            let loaded = catalog.load_table(storage.as_ref(), table)?;
            info!(table = %table, shards = loaded, "Loaded table");
        }

        let service = Arc::new(
            NodeService::new(
                address.clone(),
                catalog,
                ColumnSource::new(cache.clone(), storage.clone()),
                Arc::new(ExecutionMetrics::new()),
            )
            .with_plan_config(config.plan.clone()),
        );
        let handler = Arc::new(RequestHandler::new(service.clone()));
        let coordinator = FanOutCoordinator::new(config.cluster.clone(), membership, connector);

        info!(
            profile = ?config.profile,
            node_id = config.cluster.node_id,
            address = %address,
            cache_bytes = config.cache.max_bytes,
            "Node assembled"
        );

        Ok(Self {
            config,
            storage,
            cache,
            service,
            handler,
            coordinator,
        })
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn storage(&self) -> &Arc<dyn ShardStorage> {
        &self.storage
    }

    pub fn cache(&self) -> &Arc<ColumnShardCache> {
        &self.cache
    }

    pub fn service(&self) -> &Arc<NodeService> {
        &self.service
    }

    pub fn handler(&self) -> Arc<RequestHandler> {
        self.handler.clone()
    }

    pub fn coordinator(&self) -> &FanOutCoordinator {
        &self.coordinator
    }

    /// Start serving every stored shard of a table. Returns how many were loaded.
    pub fn load_table(&self, table: &str) -> Result<usize, Error> {
        Ok(self.service.catalog().load_table(self.storage.as_ref(), table)?)
    }

    /// Stop serving a shard.
    pub fn unload_shard(&self, shard: &ShardId) -> bool {
        self.service.catalog().unload(shard)
    }

    /// Run a plan across the cluster this node belongs to.
    pub async fn query(&self, plan: &RemotePlan) -> Result<QueryResult, Error> {
        Ok(self.coordinator.execute(plan).await?)
    }
}

/// One stored shard, as reported by the tool profile.
#[derive(Debug, Clone, PartialEq)]
pub struct ShardSummary {
    pub shard: ShardId,
    pub rows: u64,
    pub columns: Vec<String>,
}

/// Open the configured storage and describe the stored shards of `tables`.
pub fn inspect(config: &ServerConfig) -> Result<Vec<ShardSummary>, Error> {
    let storage = open_storage(config)?;
    let mut summaries = Vec::new();
    for table in &config.tables {
        for shard in storage.shards_of(table)? {
            summaries.push(ShardSummary {
                shard: shard.id().clone(),
                rows: shard.row_count(),
                columns: shard.columns().map(|(name, _)| name.to_string()).collect(),
            });
        }
    }
    Ok(summaries)
}

fn open_storage(config: &ServerConfig) -> Result<Arc<dyn ShardStorage>, Error> {
    let storage = SledShardStorage::open(&SledStorageConfig::new(&config.data_path))?;
    info!(data_path = %config.data_path.display(), "Opened shard storage");
    Ok(Arc::new(storage))
}

#[cfg(test)]
mod tests {
    use super::*;
    use colmesh_core::test_support::constant_shards;
    use colmesh_proto::{AggregateFunction, AggregationSpec, Value};

    fn test_config(address: &str) -> ServerConfig {
        ServerConfig::new("./unused")
            .without_tcp()
            .with_profile(Profile::Test)
            .with_cluster(colmesh_cluster::ClusterConfig::default().with_advertise_addr(address))
    }

    #[tokio::test]
    async fn test_in_process_nodes_answer_one_query() {
        let cluster = InProcessCluster::new();
        let a = Node::join_in_process(test_config("a"), &cluster).unwrap();
        let b = Node::join_in_process(test_config("b"), &cluster).unwrap();
        constant_shards(a.storage().as_ref(), "t", "x", &[(0, 100), (100, 100)], Value::Long(5));
        constant_shards(b.storage().as_ref(), "t", "x", &[(200, 50)], Value::Long(5));
        assert_eq!(a.load_table("t").unwrap(), 2);
        assert_eq!(b.load_table("t").unwrap(), 1);

        let plan = RemotePlan::new(1, "t").aggregate(AggregationSpec::over(AggregateFunction::Sum, "x", "total"));
        let result = b.query(&plan).await.unwrap();
        assert_eq!(result.groups[0].values, vec![Value::Long(1250)]);
        assert_eq!(cluster.dispatch.len(), 2);
    }

    #[tokio::test]
    async fn test_unload_drops_shard_from_cluster() {
        let cluster = InProcessCluster::new();
        let a = Node::join_in_process(test_config("a"), &cluster).unwrap();
        let ids = constant_shards(a.storage().as_ref(), "t", "x", &[(0, 10)], Value::Long(1));
        a.load_table("t").unwrap();
        assert_eq!(cluster.membership.replicas(&ids[0]), vec!["a"]);

        assert!(a.unload_shard(&ids[0]));
        assert!(cluster.membership.replicas(&ids[0]).is_empty());
        let plan = RemotePlan::new(2, "t").aggregate(AggregationSpec::count("n"));
        assert_eq!(a.query(&plan).await.unwrap().groups[0].values, vec![Value::Long(0)]);
    }

    #[test]
    fn test_tool_profile_does_not_build_node() {
        let config = test_config("a").with_profile(Profile::Tool);
        assert!(matches!(Node::build(config), Err(Error::Config(_))));
    }

    #[test]
    fn test_inspect_reports_stored_shards() {
        let dir = tempfile::tempdir().unwrap();
        {
            let storage = SledShardStorage::open(&SledStorageConfig::new(dir.path())).unwrap();
            constant_shards(&storage, "t", "x", &[(0, 10), (10, 5)], Value::Long(1));
            storage.flush().unwrap();
        }

        let config = ServerConfig::new(dir.path()).with_profile(Profile::Tool).with_table("t");
        let summaries = inspect(&config).unwrap();
        assert_eq!(summaries.len(), 2);
        assert_eq!(summaries[1].shard, ShardId::new("t", 10));
        assert_eq!(summaries[1].rows, 5);
        assert_eq!(summaries[1].columns, vec!["x"]);
    }
}
