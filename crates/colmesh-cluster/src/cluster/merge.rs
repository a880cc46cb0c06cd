//! Combining shard payloads into one query result.

use std::collections::{BTreeMap, HashMap};

use colmesh_core::aggregate;
use colmesh_proto::{
    ColumnData, ColumnSegment, GroupRow, IntermediaryResult, QueryResult, RemotePlan, ShardId,
    ShardPayload, Value, ValueKey,
};
use tracing::warn;

use crate::error::ClusterError;

struct GroupState {
    group: Value,
    states: Vec<IntermediaryResult>,
    error: Option<String>,
}

/// Accumulates shard payloads of one query.
///
/// Column segments are concatenated by first row id. Intermediaries are
/// merged per group key as they arrive, so arrival order does not matter; a
/// merge failure poisons that group only.
pub struct ResultMerger<'a> {
    plan: &'a RemotePlan,
    segments: BTreeMap<String, Vec<ColumnSegment>>,
    groups: HashMap<ValueKey, GroupState>,
    shards: Vec<ShardId>,
}

impl<'a> ResultMerger<'a> {
    pub fn new(plan: &'a RemotePlan) -> Self {
        Self {
            plan,
            segments: BTreeMap::new(),
            groups: HashMap::new(),
            shards: Vec::new(),
        }
    }

    /// Shards added so far.
    pub fn shards(&self) -> &[ShardId] {
        &self.shards
    }

    /// Whether a shard's payload was already added.
    pub fn contains(&self, shard: &ShardId) -> bool {
        self.shards.contains(shard)
    }

    /// Add one shard's payload. A shard added twice is ignored.
    pub fn add(&mut self, shard: ShardId, payload: ShardPayload) {
        if self.contains(&shard) {
            return;
        }

        for segment in payload.columns {
            self.segments.entry(segment.column.clone()).or_default().push(segment);
        }

        for group in payload.groups {
            let key = ValueKey(group.group.clone());
            match self.groups.get_mut(&key) {
                None => {
                    let error = (group.results.len() != self.plan.aggregations.len()).then(|| {
                        format!(
                            "shard {} sent {} aggregation states, expected {}",
                            shard,
                            group.results.len(),
                            self.plan.aggregations.len()
                        )
                    });
                    self.groups.insert(
                        key,
                        GroupState {
                            group: group.group,
                            states: if error.is_some() { Vec::new() } else { group.results },
                            error,
                        },
                    );
                }
                Some(state) => merge_group(self.plan, &shard, state, group.results),
            }
        }

        self.shards.push(shard);
    }

    /// Build the final result.
    ///
    /// An ungrouped aggregation that received no groups still yields one
    /// `Null` group holding the values of empty aggregations.
    pub fn finish(self) -> Result<QueryResult, ClusterError> {
        let mut segments = self.segments;
        let mut columns = Vec::with_capacity(self.plan.projection.len());
        for name in &self.plan.projection {
            let mut parts = segments.remove(name).unwrap_or_default();
            parts.sort_by_key(|s| s.first_row_id);
            let mut column = ColumnData {
                name: name.clone(),
                row_ids: Vec::new(),
                values: Vec::new(),
            };
            for part in parts {
                column.row_ids.extend(part.row_ids);
                column.values.extend(part.values);
            }
            columns.push(column);
        }
        if let Some(limit) = self.plan.limit.filter(|_| !self.plan.is_aggregating()) {
            for column in &mut columns {
                column.row_ids.truncate(limit as usize);
                column.values.truncate(limit as usize);
            }
        }

        let mut groups: Vec<GroupRow> = self
            .groups
            .into_values()
            .map(|state| finalize_group(self.plan, state))
            .collect();
        groups.sort_by(|a, b| a.group.total_cmp(&b.group));

        if groups.is_empty() && self.plan.is_aggregating() && self.plan.group_by.is_none() {
            let mut values = Vec::with_capacity(self.plan.aggregations.len());
            for spec in &self.plan.aggregations {
                values.push(aggregate::create(spec)?.calculate());
            }
            groups.push(GroupRow {
                group: Value::Null,
                values,
                error: None,
            });
        }

        let mut shards = self.shards;
        shards.sort();
        Ok(QueryResult {
            columns,
            groups,
            shards,
        })
    }
}

fn merge_group(plan: &RemotePlan, shard: &ShardId, state: &mut GroupState, results: Vec<IntermediaryResult>) {
    if state.error.is_some() {
        return;
    }
    if results.len() != plan.aggregations.len() {
        poison(
            state,
            format!(
                "shard {} sent {} aggregation states, expected {}",
                shard,
                results.len(),
                plan.aggregations.len()
            ),
        );
        return;
    }

    let merged: Result<Vec<IntermediaryResult>, String> = plan
        .aggregations
        .iter()
        .zip(&state.states)
        .zip(&results)
        .map(|((spec, current), incoming)| {
            aggregate::merge_intermediaries(spec, current, incoming)
                .map_err(|e| format!("{}: {}", spec.output, e))
        })
        .collect();
    match merged {
        Ok(merged) => state.states = merged,
        Err(error) => poison(state, error),
    }
}

fn poison(state: &mut GroupState, error: String) {
    warn!(group = %state.group, error = %error, "Group merge failed");
    state.states.clear();
    state.error = Some(error);
}

fn finalize_group(plan: &RemotePlan, state: GroupState) -> GroupRow {
    if let Some(error) = state.error {
        return GroupRow {
            group: state.group,
            values: Vec::new(),
            error: Some(error),
        };
    }

    let mut values = Vec::with_capacity(state.states.len());
    for (spec, intermediary) in plan.aggregations.iter().zip(&state.states) {
        match aggregate::finalize(spec, intermediary) {
            Ok(value) => values.push(value),
            Err(e) => {
                warn!(group = %state.group, output = %spec.output, error = %e, "Group finalize failed");
                return GroupRow {
                    group: state.group,
                    values: Vec::new(),
                    error: Some(format!("{}: {}", spec.output, e)),
                };
            }
        }
    }
    GroupRow {
        group: state.group,
        values,
        error: None,
    }
}
