//! Server configuration.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use clap::{Parser, ValueEnum};
use colmesh_cluster::ClusterConfig;
use colmesh_core::{CacheConfig, PlanConfig};
use colmesh_proto::ShardId;

use crate::error::Error;

/// Default TCP address for the server.
pub const DEFAULT_TCP_ADDRESS: &str = "tcp://0.0.0.0:9100";

/// Default address other nodes reach this one at.
pub const DEFAULT_ADVERTISE_ADDRESS: &str = "127.0.0.1:9100";

/// Default request timeout in seconds.
pub const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 30;

/// Default maximum message size (64 MB).
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 64 * 1024 * 1024;

/// Default column cache budget in megabytes.
pub const DEFAULT_CACHE_MB: usize = 512;

fn default_transport_workers() -> usize {
    std::thread::available_parallelism()
        .map(|count| count.get())
        .unwrap_or(4)
        .max(1)
}

/// Which implementations the node is assembled from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum Profile {
    /// Sled shard storage, NNG transport to peers.
    #[default]
    Normal,
    /// Memory shard storage, in-process dispatch. No sockets.
    Test,
    /// Storage only, for inspecting a data directory.
    Tool,
}

/// A shard served by a peer, e.g. `events@1000=10.0.0.2:9100`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShardPlacement {
    pub shard: ShardId,
    pub node: String,
}

impl FromStr for ShardPlacement {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || Error::Config(format!("invalid shard placement '{}', expected table@first_row=address", s));
        let (shard, node) = s.split_once('=').ok_or_else(invalid)?;
        let (table, first) = shard.rsplit_once('@').ok_or_else(invalid)?;
        let first_row_id = first.parse::<u64>().map_err(|_| invalid())?;
        if table.is_empty() || node.is_empty() {
            return Err(invalid());
        }
        Ok(Self {
            shard: ShardId::new(table, first_row_id),
            node: node.to_string(),
        })
    }
}

/// colmesh server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// TCP address to bind to (e.g., "tcp://0.0.0.0:9100").
    pub tcp_address: Option<String>,

    /// IPC address to bind to (e.g., "ipc:///tmp/colmesh.sock").
    pub ipc_address: Option<String>,

    /// Path to the shard storage directory.
    pub data_path: PathBuf,

    /// Request timeout duration.
    pub request_timeout: Duration,

    /// Maximum message size in bytes.
    pub max_message_size: usize,

    /// Number of transport worker loops (AsyncContext instances).
    pub transport_workers: usize,

    pub profile: Profile,

    pub cache: CacheConfig,

    pub plan: PlanConfig,

    /// Tables whose stored shards are loaded at startup.
    pub tables: Vec<String>,

    /// Shards served by peers.
    pub placements: Vec<ShardPlacement>,

    pub cluster: ClusterConfig,
}

impl ServerConfig {
    /// Create a new server configuration with the given data path.
    pub fn new(data_path: impl Into<PathBuf>) -> Self {
        Self {
            tcp_address: Some(DEFAULT_TCP_ADDRESS.to_string()),
            ipc_address: None,
            data_path: data_path.into(),
            request_timeout: Duration::from_secs(DEFAULT_REQUEST_TIMEOUT_SECS),
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
            transport_workers: default_transport_workers(),
            profile: Profile::Normal,
            cache: CacheConfig::new(DEFAULT_CACHE_MB * 1024 * 1024),
            plan: PlanConfig::default(),
            tables: Vec::new(),
            placements: Vec::new(),
            cluster: ClusterConfig::default().with_advertise_addr(DEFAULT_ADVERTISE_ADDRESS),
        }
    }

    /// Set the TCP address.
    pub fn with_tcp_address(mut self, address: impl Into<String>) -> Self {
        self.tcp_address = Some(address.into());
        self
    }

    /// Disable TCP transport.
    pub fn without_tcp(mut self) -> Self {
        self.tcp_address = None;
        self
    }

    /// Set the IPC address.
    pub fn with_ipc_address(mut self, address: impl Into<String>) -> Self {
        self.ipc_address = Some(address.into());
        self
    }

    /// Set the request timeout.
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self.cluster = self.cluster.with_request_timeout(timeout);
        self
    }

    /// Set the maximum message size.
    pub fn with_max_message_size(mut self, size: usize) -> Self {
        self.max_message_size = size;
        self
    }

    /// Set the number of transport worker loops.
    pub fn with_transport_workers(mut self, workers: usize) -> Self {
        self.transport_workers = workers.max(1);
        self
    }

    pub fn with_profile(mut self, profile: Profile) -> Self {
        self.profile = profile;
        self
    }

    /// Set the column cache budget.
    pub fn with_cache_bytes(mut self, max_bytes: usize) -> Self {
        self.cache = CacheConfig::new(max_bytes);
        self
    }

    pub fn with_plan_config(mut self, plan: PlanConfig) -> Self {
        self.plan = plan;
        self
    }

    /// Load a table's stored shards at startup.
    pub fn with_table(mut self, table: impl Into<String>) -> Self {
        self.tables.push(table.into());
        self
    }

    /// Announce a shard served by a peer.
    pub fn with_placement(mut self, placement: ShardPlacement) -> Self {
        self.placements.push(placement);
        self
    }

    pub fn with_cluster(mut self, cluster: ClusterConfig) -> Self {
        self.cluster = cluster;
        self
    }

    /// Address this node announces for its shards.
    pub fn advertise_address(&self) -> &str {
        &self.cluster.advertise_addr
    }

    /// Check if at least one transport is configured.
    pub fn has_transport(&self) -> bool {
        self.tcp_address.is_some() || self.ipc_address.is_some()
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self::new("./data")
    }
}

/// Command-line arguments for the server.
#[derive(Parser, Debug)]
#[command(name = "colmesh-server")]
#[command(version, about = "colmesh node server", long_about = None)]
pub struct Args {
    /// Path to the shard storage directory.
    #[arg(short, long, default_value = "./data")]
    pub data_path: PathBuf,

    /// Which implementations to run with.
    #[arg(long, value_enum, default_value_t = Profile::Normal)]
    pub profile: Profile,

    /// TCP address to bind to.
    #[arg(long, default_value = DEFAULT_TCP_ADDRESS)]
    pub tcp: String,

    /// IPC address to bind to (optional).
    #[arg(long)]
    pub ipc: Option<String>,

    /// Disable TCP transport (requires --ipc to be set).
    #[arg(long)]
    pub no_tcp: bool,

    /// Node id within the cluster.
    #[arg(long, default_value_t = 1)]
    pub node_id: u64,

    /// Address peers reach this node at.
    #[arg(long, default_value = DEFAULT_ADVERTISE_ADDRESS)]
    pub advertise: String,

    /// Request timeout in seconds.
    #[arg(long, default_value_t = DEFAULT_REQUEST_TIMEOUT_SECS)]
    pub timeout: u64,

    /// Maximum message size in megabytes.
    #[arg(long, default_value_t = 64)]
    pub max_message_mb: usize,

    /// Transport worker loops (0 = auto).
    #[arg(long, default_value_t = 0)]
    pub workers: usize,

    /// Column cache budget in megabytes.
    #[arg(long, default_value_t = DEFAULT_CACHE_MB)]
    pub cache_mb: usize,

    /// Row ids per batch pushed between plan steps.
    #[arg(long, default_value_t = 4096)]
    pub batch_size: usize,

    /// Table to load at startup (repeatable).
    #[arg(long = "table")]
    pub tables: Vec<String>,

    /// Shard served by a peer, as table@first_row=address (repeatable).
    #[arg(long = "shard")]
    pub shards: Vec<String>,

    /// Do not retry failed shards on other replicas.
    #[arg(long)]
    pub no_retry: bool,

    /// Run the JSON plan in this file across the cluster, print the result and exit.
    #[arg(long)]
    pub plan: Option<PathBuf>,
}

impl Args {
    /// Convert command-line arguments to server configuration.
    pub fn into_config(self) -> Result<ServerConfig, Error> {
        let tcp_address = if self.no_tcp { None } else { Some(self.tcp) };
        let transport_workers = if self.workers == 0 {
            default_transport_workers()
        } else {
            self.workers.max(1)
        };
        let placements = self
            .shards
            .iter()
            .map(|s| s.parse::<ShardPlacement>())
            .collect::<Result<Vec<_>, _>>()?;
        let request_timeout = Duration::from_secs(self.timeout);

        Ok(ServerConfig {
            tcp_address,
            ipc_address: self.ipc,
            data_path: self.data_path,
            request_timeout,
            max_message_size: self.max_message_mb * 1024 * 1024,
            transport_workers,
            profile: self.profile,
            cache: CacheConfig::new(self.cache_mb * 1024 * 1024),
            plan: PlanConfig::default().with_batch_size(self.batch_size),
            tables: self.tables,
            placements,
            cluster: ClusterConfig::new(self.node_id)
                .with_advertise_addr(self.advertise)
                .with_request_timeout(request_timeout)
                .with_retry_on_replicas(!self.no_retry),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = ServerConfig::default();
        assert_eq!(config.tcp_address, Some(DEFAULT_TCP_ADDRESS.to_string()));
        assert!(config.ipc_address.is_none());
        assert_eq!(config.data_path, PathBuf::from("./data"));
        assert_eq!(config.profile, Profile::Normal);
        assert_eq!(config.advertise_address(), DEFAULT_ADVERTISE_ADDRESS);
        assert_eq!(config.cache.max_bytes, 512 * 1024 * 1024);
        assert!(config.has_transport());
    }

    #[test]
    fn test_config_builder() {
        let config = ServerConfig::new("/var/lib/colmesh")
            .with_tcp_address("tcp://127.0.0.1:8080")
            .with_ipc_address("ipc:///tmp/colmesh.sock")
            .with_request_timeout(Duration::from_secs(60))
            .with_profile(Profile::Test)
            .with_table("events");

        assert_eq!(config.tcp_address, Some("tcp://127.0.0.1:8080".to_string()));
        assert_eq!(config.ipc_address, Some("ipc:///tmp/colmesh.sock".to_string()));
        assert_eq!(config.request_timeout, Duration::from_secs(60));
        assert_eq!(config.cluster.request_timeout, Duration::from_secs(60));
        assert_eq!(config.tables, vec!["events"]);
    }

    #[test]
    fn test_no_transport() {
        let config = ServerConfig::new("./data").without_tcp();
        assert!(!config.has_transport());
    }

    #[test]
    fn test_parse_placement() {
        let placement: ShardPlacement = "events@1000=10.0.0.2:9100".parse().unwrap();
        assert_eq!(placement.shard, ShardId::new("events", 1000));
        assert_eq!(placement.node, "10.0.0.2:9100");

        for bad in ["events@x=a:1", "events=a:1", "events@0", "@0=a:1", "events@0="] {
            assert!(bad.parse::<ShardPlacement>().is_err(), "{bad}");
        }
    }

    #[test]
    fn test_args_into_config() {
        let args = Args::parse_from([
            "colmesh-server",
            "--profile",
            "test",
            "--no-tcp",
            "--table",
            "events",
            "--shard",
            "events@500=peer:9100",
            "--cache-mb",
            "8",
            "--no-retry",
        ]);
        let config = args.into_config().unwrap();
        assert_eq!(config.profile, Profile::Test);
        assert!(config.tcp_address.is_none());
        assert_eq!(config.cache.max_bytes, 8 * 1024 * 1024);
        assert_eq!(config.placements[0].shard, ShardId::new("events", 500));
        assert!(!config.cluster.retry_on_replicas);
    }
}
