//! Distributed execution of colmesh plans.
//!
//! A [`FanOutCoordinator`] looks up which nodes serve the shards of a table in
//! [`ClusterMembership`], sends each node the plan together with the shards it
//! should run it on, and merges the returned shard payloads into one
//! [`QueryResult`](colmesh_proto::QueryResult).
//!
//! Nodes are reached through a [`NodeConnector`]: [`NngConnector`] talks to
//! remote processes, [`LocalDispatch`] calls in-process [`NodeService`]s.
//!
//! ```ignore
//! use colmesh_cluster::{ClusterConfig, ClusterMembership, FanOutCoordinator, NngConnector};
//!
//! let config = ClusterConfig::default();
//! let membership = Arc::new(ClusterMembership::new());
//! membership.shard_loaded(&ShardId::new("events", 0), "10.0.0.2:9100");
//!
//! let connector = Arc::new(NngConnector::new(config.request_timeout));
//! let coordinator = FanOutCoordinator::new(config, membership, connector);
//! let result = coordinator.execute(&plan).await?;
//! ```

pub mod cluster;
pub mod config;
pub mod error;
pub mod network;
pub mod remote;
pub mod service;

pub use cluster::{
    ClusterMembership, FanOutCoordinator, MembershipEvent, MembershipListener, MembershipPublisher, ResultMerger,
};
pub use config::ClusterConfig;
pub use error::ClusterError;
pub use network::{NngConnector, NngRemoteNode};
pub use remote::{ExecuteReply, LocalDispatch, LocalNode, NodeConnector, RemoteNode};
pub use service::NodeService;
