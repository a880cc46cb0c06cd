//! Configuration for cluster dispatch.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Default time a coordinator waits for one node to answer.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Configuration of a node's place in the cluster.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClusterConfig {
    /// This node's unique ID.
    pub node_id: u64,

    /// Address other nodes use to reach this node.
    pub advertise_addr: String,

    /// How long to wait for a node to answer one request.
    #[serde(with = "duration_millis")]
    pub request_timeout: Duration,

    /// Whether shards that fail on one replica are retried on the others.
    pub retry_on_replicas: bool,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            node_id: 1,
            advertise_addr: "127.0.0.1:9100".to_string(),
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            retry_on_replicas: true,
        }
    }
}

impl ClusterConfig {
    /// Create a new configuration with the given node ID.
    pub fn new(node_id: u64) -> Self {
        Self {
            node_id,
            ..Default::default()
        }
    }

    /// Set the node ID.
    pub fn with_node_id(mut self, node_id: u64) -> Self {
        self.node_id = node_id;
        self
    }

    /// Set the advertise address.
    pub fn with_advertise_addr(mut self, addr: impl Into<String>) -> Self {
        self.advertise_addr = addr.into();
        self
    }

    /// Set the per-request timeout.
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Enable or disable retrying failed shards on other replicas.
    pub fn with_retry_on_replicas(mut self, retry: bool) -> Self {
        self.retry_on_replicas = retry;
        self
    }
}

mod duration_millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}
