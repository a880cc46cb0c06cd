//! Server error types.

use thiserror::Error;

/// Server errors.
#[derive(Debug, Error)]
pub enum Error {
    /// Execution core error.
    #[error("core error: {0}")]
    Core(#[from] colmesh_core::Error),

    /// Fan-out or remote node error.
    #[error("cluster error: {0}")]
    Cluster(#[from] colmesh_cluster::ClusterError),

    /// Protocol error.
    #[error("protocol error: {0}")]
    Protocol(#[from] colmesh_proto::Error),

    /// Transport error.
    #[error("transport error: {0}")]
    Transport(String),

    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(String),

    /// IO error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}
