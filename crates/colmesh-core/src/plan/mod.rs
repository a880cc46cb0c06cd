//! Step-based execution of a remote plan on one table shard.
//!
//! A plan is a small directed graph of [`Step`]s. Every step declares the
//! [`PortKind`]s it needs as input and the one it produces; the
//! [`PlanBuilder`] wires producers to consumers and rejects graphs with a
//! missing input, and the [`ExecutionPlan`] runs the steps cooperatively on
//! the calling thread.
//!
//! Values of one column always flow in ascending row-id order. There is no
//! ordering between independent columns; steps that need several columns of
//! the same rows receive the row ids and resolve the columns themselves.

mod builder;
mod collector;
mod derive;
mod executor;
mod filter;
mod group;
mod source;
mod values;

pub use builder::PlanBuilder;
pub use collector::ResultCollector;
pub use derive::MaterializeColumn;
pub use executor::ExecutionPlan;
pub use filter::RowIdFilter;
pub use group::{AggregateGroups, GroupRows};
pub use source::RowIdSource;
pub use values::ResolveColumnValues;

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use colmesh_proto::{GroupIntermediaries, ShardPayload, Value};

use crate::env::ExecutionEnvironment;
use crate::error::Error;
use crate::storage::ColumnShard;

/// Shared flag telling running plans to stop.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    cancelled: Arc<AtomicBool>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }
}

/// Kinds of data flowing between steps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum PortKind {
    /// Ascending batches of row ids.
    RowIds,
    /// A temporary column was published.
    ColumnBuilt,
    /// Values of one column for a batch of rows.
    ColumnValues,
    /// Row ids split by group key.
    GroupedRowIds,
    /// Intermediary aggregation results per group.
    GroupIntermediaries,
}

/// One message from a step to its consumers.
#[derive(Debug, Clone)]
pub enum StepOutput {
    RowIds(Vec<u64>),
    ColumnBuilt(String),
    ColumnValues {
        column: String,
        row_ids: Vec<u64>,
        values: Vec<Value>,
    },
    GroupedRowIds(Vec<(Value, Vec<u64>)>),
    GroupIntermediaries(Vec<GroupIntermediaries>),
}

impl StepOutput {
    pub fn kind(&self) -> PortKind {
        match self {
            StepOutput::RowIds(_) => PortKind::RowIds,
            StepOutput::ColumnBuilt(_) => PortKind::ColumnBuilt,
            StepOutput::ColumnValues { .. } => PortKind::ColumnValues,
            StepOutput::GroupedRowIds(_) => PortKind::GroupedRowIds,
            StepOutput::GroupIntermediaries(_) => PortKind::GroupIntermediaries,
        }
    }
}

/// Result of running a step whose inputs are exhausted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Progress {
    /// Call again; the step has more to emit.
    More,
    /// The step is finished.
    Done,
}

/// A node of the execution graph.
pub trait Step: Send {
    /// Name used in logs and failures.
    fn name(&self) -> &str;

    /// Ports that must be connected for the step to work.
    fn inputs(&self) -> Vec<PortKind>;

    /// Port this step produces into; `None` for the result sink.
    fn output(&self) -> Option<PortKind>;

    /// Handle one message from a producer.
    fn on_input(&mut self, input: StepOutput, out: &mut Vec<StepOutput>) -> Result<(), Error>;

    /// Called once every producer is done and the inbox is drained.
    fn run(&mut self, out: &mut Vec<StepOutput>) -> Result<Progress, Error>;

    /// Whether the step still wants input. A sink that has seen enough
    /// returns false and lets its producers skip their work.
    fn is_active(&self) -> bool {
        true
    }

    /// Result of a sink step after execution.
    fn take_payload(&mut self) -> Option<ShardPayload> {
        None
    }
}

/// Holds back inputs until every temporary column they depend on is published.
#[derive(Debug, Default)]
pub(crate) struct ColumnGate {
    awaiting: BTreeSet<String>,
    pending: Vec<StepOutput>,
}

impl ColumnGate {
    /// Gate on the temporary columns among `columns`.
    pub(crate) fn new<'a>(columns: impl IntoIterator<Item = &'a str>, derived: &BTreeSet<String>) -> Self {
        Self {
            awaiting: columns
                .into_iter()
                .filter(|c| derived.contains(*c))
                .map(str::to_string)
                .collect(),
            pending: Vec::new(),
        }
    }

    pub(crate) fn needs_column_built(&self) -> bool {
        !self.awaiting.is_empty()
    }

    pub(crate) fn is_open(&self) -> bool {
        self.awaiting.is_empty()
    }

    /// Offer a message. Returns the messages that may be processed now.
    pub(crate) fn offer(&mut self, input: StepOutput) -> Vec<StepOutput> {
        match input {
            StepOutput::ColumnBuilt(name) => {
                self.awaiting.remove(&name);
                if self.awaiting.is_empty() {
                    std::mem::take(&mut self.pending)
                } else {
                    Vec::new()
                }
            }
            other if self.awaiting.is_empty() => vec![other],
            other => {
                self.pending.push(other);
                Vec::new()
            }
        }
    }

    /// Fail if input is still held back once producers are done.
    pub(crate) fn ensure_drained(&self, step: &str) -> Result<(), Error> {
        if self.pending.is_empty() {
            return Ok(());
        }
        Err(Error::InvalidShard(format!(
            "step '{}' still waits for columns {:?}",
            step, self.awaiting
        )))
    }
}

/// Resolve a column that must exist at run time.
pub(crate) fn require_column(env: &ExecutionEnvironment, name: &str) -> Result<Arc<ColumnShard>, Error> {
    env.column(name)?.ok_or_else(|| {
        Error::InvalidShard(format!(
            "column '{}' is not available on {}",
            name,
            env.table_shard().id()
        ))
    })
}
