//! Error types for colmesh-cluster.

use colmesh_proto::ShardId;
use thiserror::Error;

/// Errors that can occur while dispatching plans across the cluster.
#[derive(Debug, Error)]
pub enum ClusterError {
    /// A node could not be reached or did not answer in time.
    #[error("Network error: {0}")]
    Network(String),

    /// A message could not be encoded or decoded.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// The execution core failed.
    #[error("Core error: {0}")]
    Core(#[from] colmesh_core::Error),

    /// Some shards failed on every replica tried.
    #[error("{} shard(s) failed: {}", failed.len(), describe(failed))]
    PartialFailure { failed: Vec<ShardId> },

    /// The query was cancelled.
    #[error("Query cancelled")]
    Cancelled,
}

fn describe(shards: &[ShardId]) -> String {
    shards
        .iter()
        .map(|s| s.to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

impl From<colmesh_proto::Error> for ClusterError {
    fn from(err: colmesh_proto::Error) -> Self {
        ClusterError::Serialization(err.to_string())
    }
}

impl From<nng::Error> for ClusterError {
    fn from(err: nng::Error) -> Self {
        ClusterError::Network(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_failure_names_shards() {
        let err = ClusterError::PartialFailure {
            failed: vec![ShardId::new("t", 0), ShardId::new("t", 100)],
        };
        assert_eq!(err.to_string(), "2 shard(s) failed: t@0, t@100");
    }
}
