//! colmesh core - columnar storage, column cache and plan execution.
//!
//! This crate runs one remote plan against one table shard: it resolves
//! dictionary-encoded columns through a shared [`ColumnShardCache`], keeps
//! them pinned in a per-query [`ExecutionEnvironment`], and pushes row ids,
//! column values and partial aggregation state between the steps of an
//! [`ExecutionPlan`].

#[cfg(feature = "mimalloc")]
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

pub mod aggregate;
pub mod cache;
pub mod config;
pub mod env;
pub mod error;
pub mod metrics;
pub mod plan;
pub mod storage;

#[cfg(any(test, feature = "test-support"))]
pub mod test_support;

pub use aggregate::{AggregationFunction, QuantileSketch};
pub use cache::{CacheSize, CacheStats, ColumnShardCache, CountingCache};
pub use config::{CacheConfig, PlanConfig};
pub use env::{
    ColumnResolver, ColumnSource, ColumnValueType, ColumnVersionManager, ExecutionEnvironment,
    QueryableColumnShard,
};
pub use error::Error;
pub use plan::{CancellationToken, ExecutionPlan, PlanBuilder};
pub use storage::{
    ColumnShard, ColumnShardBuilder, MemoryShardStorage, ShardCatalog, ShardEventListener,
    ShardStorage, SledShardStorage, SledStorageConfig, TableShard,
};

// Metrics exports
pub use metrics::{ExecutionMetrics, Histogram, PlanOutcome, SharedExecutionMetrics};

/// Re-export protocol types.
pub use colmesh_proto as proto;
