//! Shard-level and merged query results.

use rkyv::{Archive, Deserialize, Serialize};
use serde::{Deserialize as SerdeDeserialize, Serialize as SerdeSerialize};

use crate::intermediary::IntermediaryResult;
use crate::shard::ShardId;
use crate::value::Value;

/// Values of one column for the rows a shard selected, in row-id order.
#[derive(Debug, Clone, PartialEq, Archive, Serialize, Deserialize, SerdeSerialize, SerdeDeserialize)]
pub struct ColumnSegment {
    /// Column name.
    pub column: String,
    /// First row id of the originating shard.
    pub first_row_id: u64,
    /// Row ids, ascending, parallel to `values`.
    pub row_ids: Vec<u64>,
    pub values: Vec<Value>,
}

/// Intermediary results of every aggregation for one group.
#[derive(Debug, Clone, PartialEq, Archive, Serialize, Deserialize, SerdeSerialize, SerdeDeserialize)]
pub struct GroupIntermediaries {
    /// Group key; `Null` when the plan has no grouping.
    pub group: Value,
    /// One result per aggregation, in plan order.
    pub results: Vec<IntermediaryResult>,
}

/// Output of executing a plan on one shard.
#[derive(Debug, Clone, Default, PartialEq, Archive, Serialize, Deserialize, SerdeSerialize, SerdeDeserialize)]
pub struct ShardPayload {
    pub columns: Vec<ColumnSegment>,
    pub groups: Vec<GroupIntermediaries>,
}

/// Why a shard could not contribute.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Archive, Serialize, Deserialize, SerdeSerialize, SerdeDeserialize,
)]
pub enum FailureKind {
    /// The plan could not be wired for this shard.
    PlanBuild,
    /// A step failed while running.
    PlanExecution,
    /// The query was cancelled.
    Cancelled,
    /// Anything else (storage, join failures).
    Internal,
}

/// Outcome of one shard.
#[derive(Debug, Clone, PartialEq, Archive, Serialize, Deserialize, SerdeSerialize, SerdeDeserialize)]
pub enum ShardOutcome {
    /// The plan ran to completion.
    Completed(ShardPayload),
    /// The node does not (or no longer) hold this shard.
    NoShard,
    /// The shard failed.
    Failed { kind: FailureKind, message: String },
}

/// Result for one shard as reported by a node.
#[derive(Debug, Clone, PartialEq, Archive, Serialize, Deserialize, SerdeSerialize, SerdeDeserialize)]
pub struct ShardResult {
    pub shard: ShardId,
    pub outcome: ShardOutcome,
}

impl ShardResult {
    /// A completed shard.
    pub fn completed(shard: ShardId, payload: ShardPayload) -> Self {
        Self {
            shard,
            outcome: ShardOutcome::Completed(payload),
        }
    }

    /// A shard the node does not hold.
    pub fn no_shard(shard: ShardId) -> Self {
        Self {
            shard,
            outcome: ShardOutcome::NoShard,
        }
    }

    /// A failed shard.
    pub fn failed(shard: ShardId, kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            shard,
            outcome: ShardOutcome::Failed {
                kind,
                message: message.into(),
            },
        }
    }
}

/// Merged values of one column across all shards.
#[derive(Debug, Clone, PartialEq, SerdeSerialize, SerdeDeserialize)]
pub struct ColumnData {
    pub name: String,
    pub row_ids: Vec<u64>,
    pub values: Vec<Value>,
}

/// Final aggregate values of one group.
#[derive(Debug, Clone, PartialEq, SerdeSerialize, SerdeDeserialize)]
pub struct GroupRow {
    pub group: Value,
    /// One value per aggregation, in plan order. Empty if `error` is set.
    pub values: Vec<Value>,
    /// Merge failure confined to this group.
    pub error: Option<String>,
}

/// Final result of a fanned-out query.
#[derive(Debug, Clone, Default, PartialEq, SerdeSerialize, SerdeDeserialize)]
pub struct QueryResult {
    pub columns: Vec<ColumnData>,
    pub groups: Vec<GroupRow>,
    /// Shards that contributed.
    pub shards: Vec<ShardId>,
}

impl QueryResult {
    /// Look up a merged column.
    pub fn column(&self, name: &str) -> Option<&ColumnData> {
        self.columns.iter().find(|c| c.name == name)
    }

    /// Look up a group by key.
    pub fn group(&self, key: &Value) -> Option<&GroupRow> {
        self.groups.iter().find(|g| &g.group == key)
    }
}
