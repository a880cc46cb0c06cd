//! Execution metrics of a node.
//!
//! Counts shard plans by outcome and table, tracks plan latency in a
//! bucketed [`Histogram`], and renders everything, together with the column
//! cache counters, in the Prometheus text format.

mod histogram;
mod registry;

pub use histogram::Histogram;
pub use registry::{ExecutionMetrics, PlanOutcome, SharedExecutionMetrics};
