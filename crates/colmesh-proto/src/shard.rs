//! Table shard identity.

use std::fmt;

use rkyv::{Archive, Deserialize, Serialize};
use serde::{Deserialize as SerdeDeserialize, Serialize as SerdeSerialize};

/// Cluster-wide identity of one table shard.
///
/// Shards of one table cover disjoint row-id ranges, so the first row id is
/// unique within a table.
#[derive(
    Debug,
    Clone,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Archive,
    Serialize,
    Deserialize,
    SerdeSerialize,
    SerdeDeserialize,
)]
pub struct ShardId {
    /// Table name.
    pub table: String,
    /// First row id held by the shard.
    pub first_row_id: u64,
}

impl ShardId {
    /// Create a shard id.
    pub fn new(table: impl Into<String>, first_row_id: u64) -> Self {
        Self {
            table: table.into(),
            first_row_id,
        }
    }
}

impl fmt::Display for ShardId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.table, self.first_row_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shard_ids_order_by_table_then_row() {
        let mut ids = vec![
            ShardId::new("b", 0),
            ShardId::new("a", 200),
            ShardId::new("a", 100),
        ];
        ids.sort();
        assert_eq!(ids[0], ShardId::new("a", 100));
        assert_eq!(ids[2], ShardId::new("b", 0));
        assert_eq!(ids[1].to_string(), "a@200");
    }
}
