//! colmesh node server.
//!
//! Assembles a node (shard storage, column cache, plan service, fan-out
//! coordinator) from a [`ServerConfig`] and serves node requests over NNG.

pub mod config;
pub mod error;
pub mod handler;
pub mod node;
pub mod transport;

pub use config::{Args, Profile, ServerConfig, ShardPlacement};
pub use error::Error;
pub use handler::RequestHandler;
pub use node::{inspect, InProcessCluster, Node, ShardSummary};
pub use transport::{create_transport, Transport, TransportStats};
