//! Fan-out across in-process nodes that announce their shards through the
//! catalog.

use std::sync::Arc;

use colmesh_cluster::{
    ClusterConfig, ClusterError, ClusterMembership, FanOutCoordinator, LocalDispatch, MembershipPublisher, NodeService,
};
use colmesh_core::env::ColumnSource;
use colmesh_core::storage::{ShardCatalog, ShardStorage};
use colmesh_core::test_support::column;
use colmesh_core::{ColumnShardCache, ExecutionMetrics, MemoryShardStorage};
use colmesh_proto::{
    AggregateFunction, AggregationSpec, ColumnType, CompareOp, RemotePlan, RowFilter, ShardId, Value,
};

const SALES: &str = "sales";

fn sales_shard(first: u64, regions: &[&str], amounts: &[i64]) -> Arc<MemoryShardStorage> {
    let storage = Arc::new(MemoryShardStorage::new());
    let id = ShardId::new(SALES, first);
    storage
        .store_column(
            &id,
            &column("region", ColumnType::String, first, regions.iter().map(|r| Value::from(*r)).collect()),
        )
        .unwrap();
    storage
        .store_column(
            &id,
            &column("amount", ColumnType::Long, first, amounts.iter().map(|a| Value::Long(*a)).collect()),
        )
        .unwrap();
    storage
}

struct Cluster {
    membership: Arc<ClusterMembership>,
    dispatch: Arc<LocalDispatch>,
}

impl Cluster {
    fn new() -> Self {
        Self {
            membership: Arc::new(ClusterMembership::new()),
            dispatch: Arc::new(LocalDispatch::new()),
        }
    }

    fn start_node(&self, address: &str, storage: Arc<MemoryShardStorage>) -> Arc<NodeService> {
        let catalog = Arc::new(ShardCatalog::new());
        catalog.register_listener(Arc::new(MembershipPublisher::new(self.membership.clone(), address)));
        catalog.load_table(storage.as_ref(), SALES).unwrap();

        let service = Arc::new(NodeService::new(
            address,
            catalog,
            ColumnSource::new(Arc::new(ColumnShardCache::new(1 << 20)), storage),
            Arc::new(ExecutionMetrics::new()),
        ));
        self.dispatch.register(address, service.clone());
        service
    }

    fn coordinator(&self) -> FanOutCoordinator {
        FanOutCoordinator::new(ClusterConfig::default(), self.membership.clone(), self.dispatch.clone())
    }
}

fn totals_plan(query_id: u64) -> RemotePlan {
    RemotePlan::new(query_id, SALES)
        .group_by("region")
        .aggregate(AggregationSpec::over(AggregateFunction::Sum, "amount", "total"))
        .aggregate(AggregationSpec::count("orders"))
}

fn groups(result: &colmesh_proto::QueryResult) -> Vec<(Value, Vec<Value>)> {
    result.groups.iter().map(|g| (g.group.clone(), g.values.clone())).collect()
}

#[tokio::test]
async fn test_grouped_aggregation_across_nodes() {
    let cluster = Cluster::new();
    cluster.start_node("a", sales_shard(0, &["n", "s", "n", "s"], &[10, 20, 30, 40]));
    cluster.start_node("b", sales_shard(4, &["n", "w", "s"], &[5, 7, 9]));

    let result = cluster.coordinator().execute(&totals_plan(1)).await.unwrap();
    assert_eq!(
        groups(&result),
        vec![
            (Value::from("n"), vec![Value::Long(45), Value::Long(3)]),
            (Value::from("s"), vec![Value::Long(69), Value::Long(3)]),
            (Value::from("w"), vec![Value::Long(7), Value::Long(1)]),
        ]
    );
    assert_eq!(result.shards, vec![ShardId::new(SALES, 0), ShardId::new(SALES, 4)]);
}

#[tokio::test]
async fn test_filtered_projection_keeps_row_order() {
    let cluster = Cluster::new();
    cluster.start_node("b", sales_shard(4, &["n", "w", "s"], &[5, 7, 9]));
    cluster.start_node("a", sales_shard(0, &["n", "s", "n", "s"], &[10, 20, 30, 40]));

    let plan = RemotePlan::new(2, SALES)
        .filter(RowFilter::new("region", CompareOp::Eq, "n"))
        .with_projection(vec!["amount".into()]);
    let result = cluster.coordinator().execute(&plan).await.unwrap();

    let amount = result.column("amount").unwrap();
    assert_eq!(amount.row_ids, vec![0, 2, 4]);
    assert_eq!(amount.values, vec![Value::Long(10), Value::Long(30), Value::Long(5)]);
}

#[tokio::test]
async fn test_unloaded_shard_is_served_by_other_replica() {
    let cluster = Cluster::new();
    cluster.start_node("a", sales_shard(0, &["n", "s", "n", "s"], &[10, 20, 30, 40]));
    let b = cluster.start_node("b", sales_shard(4, &["n", "w", "s"], &[5, 7, 9]));
    let c = cluster.start_node("c", sales_shard(4, &["n", "w", "s"], &[5, 7, 9]));
    assert_eq!(cluster.membership.replicas(&ShardId::new(SALES, 4)), vec!["b", "c"]);

    assert!(b.catalog().unload(&ShardId::new(SALES, 4)));
    assert_eq!(cluster.membership.replicas(&ShardId::new(SALES, 4)), vec!["c"]);

    let result = cluster.coordinator().execute(&totals_plan(3)).await.unwrap();
    assert_eq!(result.groups.len(), 3);
    assert_eq!(c.metrics().plans(colmesh_core::PlanOutcome::Completed), 1);
    assert_eq!(b.metrics().plans(colmesh_core::PlanOutcome::Completed), 0);
}

#[tokio::test]
async fn test_node_that_went_away_fails_its_shards() {
    let cluster = Cluster::new();
    cluster.start_node("a", sales_shard(0, &["n", "s", "n", "s"], &[10, 20, 30, 40]));
    cluster.start_node("b", sales_shard(4, &["n", "w", "s"], &[5, 7, 9]));
    assert!(cluster.dispatch.unregister("b"));

    match cluster.coordinator().execute(&totals_plan(4)).await {
        Err(ClusterError::PartialFailure { failed }) => assert_eq!(failed, vec![ShardId::new(SALES, 4)]),
        other => panic!("unexpected result {:?}", other),
    }

    assert_eq!(cluster.membership.remove_node("b"), 1);
    assert!(cluster.coordinator().execute(&totals_plan(5)).await.is_ok());
}

#[tokio::test]
async fn test_table_without_shards_yields_empty_result() {
    let cluster = Cluster::new();
    cluster.start_node("a", sales_shard(0, &["n"], &[1]));

    let plan = RemotePlan::new(6, "returns").aggregate(AggregationSpec::count("n"));
    let result = cluster.coordinator().execute(&plan).await.unwrap();
    assert!(result.shards.is_empty());
    assert_eq!(result.groups[0].values, vec![Value::Long(0)]);
    assert_eq!(cluster.coordinator().cancel(6).await, 0);
}
