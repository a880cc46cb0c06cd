//! Core error types.

use thiserror::Error;

/// Execution core errors.
#[derive(Debug, Error)]
pub enum Error {
    /// The plan could not be wired (unknown column, missing input, bad function spec).
    #[error("plan build failed: {0}")]
    PlanBuild(String),

    /// A step failed while the plan was running.
    #[error("plan execution failed in step '{step}': {source}")]
    PlanExecution {
        step: String,
        #[source]
        source: Box<Error>,
    },

    /// The query was cancelled.
    #[error("query cancelled")]
    Cancelled,

    /// Row id outside the shard's range.
    #[error("row id {row_id} outside [{first}, {end})")]
    RowIdOutOfRange { row_id: u64, first: u64, end: u64 },

    /// Attempt to move a page that does not allow it.
    #[error("page of column '{column}' starting at row {first_row_id} is not adjustable")]
    PageNotAdjustable { column: String, first_row_id: u64 },

    /// A column shard violates its structural invariants.
    #[error("invalid column shard: {0}")]
    InvalidShard(String),

    /// Column resolved with the wrong value type.
    #[error("column '{column}' has type {actual}, expected {expected}")]
    TypeMismatch {
        column: String,
        expected: String,
        actual: String,
    },

    /// Insert into a sealed dictionary.
    #[error("dictionary is sealed")]
    DictionarySealed,

    /// Aggregation state cannot be combined or decoded.
    #[error("incompatible aggregation state: {0}")]
    IncompatibleState(String),

    /// Decimal accumulation left the representable range.
    #[error("numeric overflow: {0}")]
    Overflow(String),

    /// Temporary column did not get published in time.
    #[error("timed out waiting for column '{0}'")]
    Timeout(String),

    /// Storage layer error.
    #[error("storage error: {0}")]
    Storage(#[from] sled::Error),

    /// Protocol error.
    #[error("protocol error: {0}")]
    Protocol(#[from] colmesh_proto::Error),

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Deserialization error.
    #[error("deserialization error: {0}")]
    Deserialization(String),
}

impl Error {
    /// Wrap a step failure.
    pub fn in_step(step: impl Into<String>, source: Error) -> Self {
        match source {
            // cancellation is not a step failure
            Error::Cancelled => Error::Cancelled,
            other => Error::PlanExecution {
                step: step.into(),
                source: Box::new(other),
            },
        }
    }
}
