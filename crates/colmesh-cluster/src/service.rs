//! Node-side execution of remote plans.

use std::sync::Arc;
use std::time::{Duration, Instant};

use colmesh_core::env::{ColumnSource, ExecutionEnvironment};
use colmesh_core::storage::{ShardCatalog, TableShard};
use colmesh_core::{
    CancellationToken, Error as CoreError, PlanBuilder, PlanConfig, PlanOutcome,
    SharedExecutionMetrics,
};
use colmesh_proto::{FailureKind, RemotePlan, ShardId, ShardResult};
use dashmap::DashMap;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::remote::ExecuteReply;

struct RunningQuery {
    token: CancellationToken,
    callers: usize,
}

/// Runs remote plans over the shards this node serves.
///
/// Every shard gets its own execution environment and plan, run on the
/// blocking pool, so shards of one request execute in parallel.
pub struct NodeService {
    address: String,
    catalog: Arc<ShardCatalog>,
    source: ColumnSource,
    plan_config: PlanConfig,
    metrics: SharedExecutionMetrics,
    running: DashMap<u64, RunningQuery>,
}

impl NodeService {
    pub fn new(
        address: impl Into<String>,
        catalog: Arc<ShardCatalog>,
        source: ColumnSource,
        metrics: SharedExecutionMetrics,
    ) -> Self {
        Self {
            address: address.into(),
            catalog,
            source,
            plan_config: PlanConfig::default(),
            metrics,
            running: DashMap::new(),
        }
    }

    pub fn with_plan_config(mut self, config: PlanConfig) -> Self {
        self.plan_config = config;
        self
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn catalog(&self) -> &Arc<ShardCatalog> {
        &self.catalog
    }

    pub fn source(&self) -> &ColumnSource {
        &self.source
    }

    pub fn metrics(&self) -> &SharedExecutionMetrics {
        &self.metrics
    }

    /// Execution and cache metrics in the Prometheus text format.
    pub fn metrics_text(&self) -> String {
        self.metrics.to_prometheus(Some(self.source.cache().stats()))
    }

    /// Ids of the queries currently executing here.
    pub fn running_queries(&self) -> Vec<u64> {
        let mut ids: Vec<u64> = self.running.iter().map(|e| *e.key()).collect();
        ids.sort_unstable();
        ids
    }

    /// Run a plan on the listed shards (by first row id), or on every local
    /// shard of the table when the list is empty.
    pub async fn execute(&self, plan: RemotePlan, shards: Vec<u64>) -> ExecuteReply {
        let local = self.catalog.shards_of(&plan.table);
        if local.is_empty() {
            debug!(query_id = plan.query_id, table = %plan.table, node = %self.address, "No local shards of table");
            for _ in 0..shards.len().max(1) {
                self.metrics.record_plan(&plan.table, PlanOutcome::NoShard, Duration::ZERO);
            }
            return ExecuteReply::NoShards;
        }

        let targets: Vec<(ShardId, Option<Arc<TableShard>>)> = if shards.is_empty() {
            local.into_iter().map(|s| (s.id().clone(), Some(s))).collect()
        } else {
            let mut firsts = shards;
            firsts.sort_unstable();
            firsts.dedup();
            firsts
                .into_iter()
                .map(|first| {
                    let id = ShardId::new(plan.table.clone(), first);
                    let shard = self.catalog.get(&id);
                    (id, shard)
                })
                .collect()
        };

        let guard = self.begin(plan.query_id);
        let plan = Arc::new(plan);
        info!(
            query_id = plan.query_id,
            table = %plan.table,
            shards = targets.len(),
            node = %self.address,
            "Executing remote plan"
        );

        let mut pending: Vec<(ShardId, Option<JoinHandle<ShardResult>>)> = Vec::with_capacity(targets.len());
        for (id, shard) in targets {
            let Some(shard) = shard else {
                self.metrics.record_plan(&plan.table, PlanOutcome::NoShard, Duration::ZERO);
                pending.push((id, None));
                continue;
            };
            let run = ShardRun {
                plan: plan.clone(),
                shard,
                source: self.source.clone(),
                config: self.plan_config.clone(),
                cancel: guard.token.clone(),
                metrics: self.metrics.clone(),
            };
            pending.push((id, Some(tokio::task::spawn_blocking(move || run.execute()))));
        }

        let mut results = Vec::with_capacity(pending.len());
        for (id, handle) in pending {
            let result = match handle {
                None => ShardResult::no_shard(id),
                Some(handle) => match handle.await {
                    Ok(result) => result,
                    Err(e) => {
                        error!(shard = %id, error = %e, "Shard task failed");
                        ShardResult::failed(id, FailureKind::Internal, e.to_string())
                    }
                },
            };
            results.push(result);
        }
        drop(guard);

        ExecuteReply::Executed(results)
    }

    /// Cancel a running query. Returns whether it was running here.
    pub fn cancel(&self, query_id: u64) -> bool {
        match self.running.get(&query_id) {
            Some(query) => {
                query.token.cancel();
                info!(query_id, node = %self.address, "Query cancelled");
                true
            }
            None => false,
        }
    }

    fn begin(&self, query_id: u64) -> RunningGuard<'_> {
        let token = {
            let mut query = self.running.entry(query_id).or_insert_with(|| RunningQuery {
                token: CancellationToken::new(),
                callers: 0,
            });
            query.callers += 1;
            query.token.clone()
        };
        RunningGuard {
            running: &self.running,
            query_id,
            token,
        }
    }
}

/// Keeps a query registered for cancellation while a request runs it.
struct RunningGuard<'a> {
    running: &'a DashMap<u64, RunningQuery>,
    query_id: u64,
    token: CancellationToken,
}

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.running.remove_if_mut(&self.query_id, |_, query| {
            query.callers -= 1;
            query.callers == 0
        });
    }
}

/// One plan on one shard.
struct ShardRun {
    plan: Arc<RemotePlan>,
    shard: Arc<TableShard>,
    source: ColumnSource,
    config: PlanConfig,
    cancel: CancellationToken,
    metrics: SharedExecutionMetrics,
}

impl ShardRun {
    fn execute(self) -> ShardResult {
        let started = Instant::now();
        let id = self.shard.id().clone();
        let env = Arc::new(ExecutionEnvironment::new(self.plan.query_id, self.shard, self.source));

        let result = PlanBuilder::build(&self.plan, env.clone(), &self.config)
            .map_err(|e| (FailureKind::PlanBuild, PlanOutcome::BuildFailed, e))
            .and_then(|plan| {
                plan.execute(&self.cancel).map_err(|e| match e {
                    CoreError::Cancelled => (FailureKind::Cancelled, PlanOutcome::Cancelled, e),
                    e => (FailureKind::PlanExecution, PlanOutcome::ExecutionFailed, e),
                })
            });
        env.release();

        let elapsed = started.elapsed();
        match result {
            Ok(payload) => {
                let rows = payload.columns.first().map_or(0, |c| c.row_ids.len());
                self.metrics.record_plan(&id.table, PlanOutcome::Completed, elapsed);
                self.metrics.record_output(rows as u64, payload.groups.len() as u64);
                debug!(
                    query_id = self.plan.query_id,
                    shard = %id,
                    rows,
                    groups = payload.groups.len(),
                    elapsed_us = elapsed.as_micros() as u64,
                    "Shard plan completed"
                );
                ShardResult::completed(id, payload)
            }
            Err((kind, outcome, e)) => {
                self.metrics.record_plan(&id.table, outcome, elapsed);
                warn!(query_id = self.plan.query_id, shard = %id, ?kind, error = %e, "Shard plan failed");
                ShardResult::failed(id, kind, e.to_string())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use colmesh_core::test_support::{people_storage, PEOPLE};
    use colmesh_core::{ColumnShardCache, ExecutionMetrics};
    use colmesh_proto::{AggregationSpec, CompareOp, RowFilter, ShardOutcome, Value};

    fn people_service() -> NodeService {
        let storage = people_storage();
        let catalog = Arc::new(ShardCatalog::new());
        catalog.load_table(storage.as_ref(), PEOPLE).unwrap();
        NodeService::new(
            "n1:9100",
            catalog,
            ColumnSource::new(Arc::new(ColumnShardCache::new(1 << 20)), storage),
            Arc::new(ExecutionMetrics::new()),
        )
    }

    fn executed(reply: ExecuteReply) -> Vec<ShardResult> {
        match reply {
            ExecuteReply::Executed(results) => results,
            other => panic!("unexpected reply {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_executes_every_local_shard() {
        let service = people_service();
        let plan = RemotePlan::new(1, PEOPLE)
            .filter(RowFilter::new("age", CompareOp::Lt, 30i64))
            .with_projection(vec!["name".into()]);

        let results = executed(service.execute(plan, vec![]).await);
        assert_eq!(results.len(), 1);
        match &results[0].outcome {
            ShardOutcome::Completed(payload) => {
                assert_eq!(payload.columns[0].values, vec![Value::from("bob"), Value::from("dan")]);
            }
            other => panic!("unexpected outcome {:?}", other),
        }
        assert_eq!(service.metrics().plans(PlanOutcome::Completed), 1);
        assert_eq!(service.metrics().rows_returned(), 2);
        assert!(service.running_queries().is_empty());
    }

    #[tokio::test]
    async fn test_unknown_shard_and_unknown_table() {
        let service = people_service();
        let plan = RemotePlan::new(1, PEOPLE).aggregate(AggregationSpec::count("n"));

        let results = executed(service.execute(plan, vec![0, 500, 0]).await);
        assert_eq!(results.len(), 2);
        assert!(matches!(results[0].outcome, ShardOutcome::Completed(_)));
        assert_eq!(results[1], ShardResult::no_shard(ShardId::new(PEOPLE, 500)));

        let other = RemotePlan::new(2, "orders").aggregate(AggregationSpec::count("n"));
        assert_eq!(service.execute(other, vec![]).await, ExecuteReply::NoShards);
    }

    #[tokio::test]
    async fn test_build_failure_is_reported_per_shard() {
        let service = people_service();
        let plan = RemotePlan::new(1, PEOPLE).with_projection(vec!["salary".into()]);

        let results = executed(service.execute(plan, vec![]).await);
        match &results[0].outcome {
            ShardOutcome::Failed { kind, .. } => assert_eq!(*kind, FailureKind::PlanBuild),
            other => panic!("unexpected outcome {:?}", other),
        }
        assert_eq!(service.metrics().plans(PlanOutcome::BuildFailed), 1);
    }

    #[tokio::test]
    async fn test_cancel_reaches_running_query() {
        let service = people_service();
        assert!(!service.cancel(9));

        // a concurrent request of the same query keeps it registered
        let guard = service.begin(9);
        assert!(service.cancel(9));

        let plan = RemotePlan::new(9, PEOPLE).with_projection(vec!["name".into()]);
        let results = executed(service.execute(plan, vec![]).await);
        match &results[0].outcome {
            ShardOutcome::Failed { kind, .. } => assert_eq!(*kind, FailureKind::Cancelled),
            other => panic!("unexpected outcome {:?}", other),
        }
        assert_eq!(service.running_queries(), vec![9]);

        drop(guard);
        assert!(service.running_queries().is_empty());
    }
}
