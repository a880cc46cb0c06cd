//! Fanning a plan out to the nodes holding a table's shards.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Instant;

use colmesh_proto::{FailureKind, QueryResult, RemotePlan, ShardId, ShardOutcome, ShardResult};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use super::membership::ClusterMembership;
use super::merge::ResultMerger;
use crate::config::ClusterConfig;
use crate::error::ClusterError;
use crate::remote::{ExecuteReply, NodeConnector};

/// Why a shard attempt did not produce a payload.
#[derive(Debug, Clone, PartialEq)]
enum Miss {
    /// The node does not hold the shard. Not an error on its own.
    Absent(String),
    /// Worth trying on another replica.
    Retry(String),
    /// Every replica would fail the same way.
    Fatal(FailureKind, String),
}

/// Executes plans across the cluster and merges the results.
pub struct FanOutCoordinator {
    config: ClusterConfig,
    membership: Arc<ClusterMembership>,
    connector: Arc<dyn NodeConnector>,
}

impl FanOutCoordinator {
    pub fn new(config: ClusterConfig, membership: Arc<ClusterMembership>, connector: Arc<dyn NodeConnector>) -> Self {
        Self {
            config,
            membership,
            connector,
        }
    }

    pub fn membership(&self) -> &Arc<ClusterMembership> {
        &self.membership
    }

    /// Run a plan on every shard of its table.
    ///
    /// Each shard goes to its first replica; a shard that fails there is
    /// retried on the next replica when retries are enabled. A shard that
    /// every replica reports as not held contributes nothing. Shards that
    /// cannot be completed anywhere fail the query with
    /// [`ClusterError::PartialFailure`] after the query is cancelled on every
    /// node contacted.
    pub async fn execute(&self, plan: &RemotePlan) -> Result<QueryResult, ClusterError> {
        let started = Instant::now();
        let placement: BTreeMap<ShardId, Vec<String>> = self.membership.shards_of(&plan.table).into_iter().collect();
        info!(
            query_id = plan.query_id,
            table = %plan.table,
            shards = placement.len(),
            "Fanning out plan"
        );

        let plan_arc = Arc::new(plan.clone());
        let mut merger = ResultMerger::new(plan);
        let mut attempts: BTreeMap<ShardId, usize> = placement.keys().map(|s| (s.clone(), 0)).collect();
        let mut pending: BTreeSet<ShardId> = placement.keys().cloned().collect();
        // First real failure per shard; absent replies never land here.
        let mut errors: BTreeMap<ShardId, Miss> = BTreeMap::new();
        let mut failed: BTreeMap<ShardId, Miss> = BTreeMap::new();
        let mut absent: BTreeSet<ShardId> = BTreeSet::new();
        let mut contacted: BTreeSet<String> = BTreeSet::new();

        while !pending.is_empty() {
            let mut by_node: BTreeMap<String, Vec<ShardId>> = BTreeMap::new();
            for shard in std::mem::take(&mut pending) {
                let replica = placement
                    .get(&shard)
                    .and_then(|replicas| replicas.get(attempts.get(&shard).copied().unwrap_or(0)))
                    .cloned();
                match replica {
                    Some(node) => by_node.entry(node).or_default().push(shard),
                    None => {
                        failed.insert(shard, Miss::Retry("no replica left".to_string()));
                    }
                }
            }

            let mut calls = JoinSet::new();
            for (node, shards) in by_node {
                contacted.insert(node.clone());
                let connector = self.connector.clone();
                let plan = plan_arc.clone();
                let timeout = self.config.request_timeout;
                calls.spawn(async move {
                    let firsts: Vec<u64> = shards.iter().map(|s| s.first_row_id).collect();
                    let mut timed_out = false;
                    let reply = match connector.connect(&node) {
                        Ok(remote) => match tokio::time::timeout(timeout, remote.execute(&plan, &firsts)).await {
                            Ok(reply) => reply,
                            Err(_) => {
                                timed_out = true;
                                Err(ClusterError::Network(format!("{} timed out after {:?}", node, timeout)))
                            }
                        },
                        Err(e) => Err(e),
                    };
                    (node, shards, reply, timed_out)
                });
            }

            let mut misses: Vec<(ShardId, Miss)> = Vec::new();
            let mut stalled: BTreeSet<String> = BTreeSet::new();
            let mut dispatch_error = None;
            while let Some(joined) = calls.join_next().await {
                let (node, shards, reply, timed_out) = match joined {
                    Ok(call) => call,
                    Err(e) => {
                        dispatch_error = Some(ClusterError::Network(format!("dispatch task failed: {}", e)));
                        continue;
                    }
                };
                if timed_out {
                    stalled.insert(node.clone());
                }
                for (shard, outcome) in sort_reply(&node, shards, reply) {
                    match outcome {
                        Ok(payload) => {
                            debug!(query_id = plan.query_id, shard = %shard, node = %node, "Shard completed");
                            merger.add(shard, payload);
                        }
                        Err(miss @ Miss::Absent(_)) => {
                            debug!(query_id = plan.query_id, shard = %shard, node = %node, reason = ?miss, "Shard not held");
                            misses.push((shard, miss));
                        }
                        Err(miss) => {
                            warn!(query_id = plan.query_id, shard = %shard, node = %node, reason = ?miss, "Shard attempt failed");
                            misses.push((shard, miss));
                        }
                    }
                }
            }

            if let Some(e) = dispatch_error {
                self.cancel_on(plan.query_id, &contacted).await;
                return Err(e);
            }
            if !stalled.is_empty() {
                self.cancel_on(plan.query_id, &stalled).await;
            }

            for (shard, miss) in misses {
                if merger.contains(&shard) {
                    continue;
                }
                let next = attempts.get(&shard).copied().unwrap_or(0) + 1;
                let has_next = next < placement.get(&shard).map_or(0, |r| r.len());
                let retry = match &miss {
                    Miss::Absent(_) => has_next,
                    Miss::Retry(_) => self.config.retry_on_replicas && has_next,
                    Miss::Fatal(..) => false,
                };
                if !matches!(miss, Miss::Absent(_)) {
                    errors.entry(shard.clone()).or_insert(miss);
                }
                if retry {
                    attempts.insert(shard.clone(), next);
                    pending.insert(shard);
                } else {
                    match errors.remove(&shard) {
                        Some(error) => {
                            failed.insert(shard, error);
                        }
                        None => {
                            absent.insert(shard);
                        }
                    }
                }
            }
        }

        if !failed.is_empty() {
            self.cancel_on(plan.query_id, &contacted).await;
            if failed
                .values()
                .any(|m| matches!(m, Miss::Fatal(FailureKind::Cancelled, _)))
            {
                return Err(ClusterError::Cancelled);
            }
            for (shard, miss) in &failed {
                warn!(query_id = plan.query_id, shard = %shard, reason = ?miss, "Shard failed on every replica");
            }
            return Err(ClusterError::PartialFailure {
                failed: failed.into_keys().collect(),
            });
        }

        let result = merger.finish()?;
        info!(
            query_id = plan.query_id,
            shards = result.shards.len(),
            absent = absent.len(),
            groups = result.groups.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Query merged"
        );
        Ok(result)
    }

    /// Ask every node serving any shard to stop a query. Returns how many
    /// nodes were running it.
    pub async fn cancel(&self, query_id: u64) -> usize {
        let nodes: BTreeSet<String> = self.membership.nodes().into_iter().collect();
        self.cancel_on(query_id, &nodes).await
    }

    async fn cancel_on(&self, query_id: u64, nodes: &BTreeSet<String>) -> usize {
        let mut found = 0;
        for node in nodes {
            let cancelled = match self.connector.connect(node) {
                Ok(remote) => tokio::time::timeout(self.config.request_timeout, remote.cancel(query_id)).await,
                Err(e) => Ok(Err(e)),
            };
            match cancelled {
                Ok(Ok(true)) => found += 1,
                Ok(Ok(false)) => {}
                Ok(Err(e)) => debug!(query_id, node = %node, error = %e, "Cancel not delivered"),
                Err(_) => debug!(query_id, node = %node, "Cancel timed out"),
            }
        }
        found
    }
}

/// Split one node's reply into per-shard payloads or misses.
///
/// Shards the node did not report on count as misses.
fn sort_reply(
    node: &str,
    shards: Vec<ShardId>,
    reply: Result<ExecuteReply, ClusterError>,
) -> Vec<(ShardId, Result<colmesh_proto::ShardPayload, Miss>)> {
    let mut results: Vec<ShardResult> = match reply {
        Ok(ExecuteReply::Executed(results)) => results,
        Ok(ExecuteReply::NoShards) => {
            return shards
                .into_iter()
                .map(|s| (s, Err(Miss::Absent(format!("{} serves no shard of the table", node)))))
                .collect();
        }
        Err(e) => {
            let reason = e.to_string();
            return shards.into_iter().map(|s| (s, Err(Miss::Retry(reason.clone())))).collect();
        }
    };

    shards
        .into_iter()
        .map(|shard| {
            let outcome = match results.iter().position(|r| r.shard == shard) {
                None => Err(Miss::Retry(format!("{} did not report the shard", node))),
                Some(i) => match results.swap_remove(i).outcome {
                    ShardOutcome::Completed(payload) => Ok(payload),
                    ShardOutcome::NoShard => Err(Miss::Absent(format!("{} does not serve the shard", node))),
                    ShardOutcome::Failed { kind, message } => match kind {
                        FailureKind::PlanBuild | FailureKind::Cancelled => Err(Miss::Fatal(kind, message)),
                        FailureKind::PlanExecution | FailureKind::Internal => Err(Miss::Retry(message)),
                    },
                },
            };
            (shard, outcome)
        })
        .collect()
}
