//! colmesh protocol types and serialization.
//!
//! This crate defines the data and wire types shared by colmesh nodes, using
//! rkyv for zero-copy serialization.
//!
//! # Modules
//!
//! - [`value`] - Runtime values and column types
//! - [`shard`] - Table shard identity
//! - [`plan`] - Remote plans handed to the execution core
//! - [`intermediary`] - Partial aggregation state
//! - [`result`] - Per-shard and merged results
//! - [`message`] - Node request/response messages
//! - [`framing`] - Length-prefixed framing
//! - [`error`] - Protocol error types

pub mod error;
pub mod framing;
pub mod intermediary;
pub mod message;
pub mod plan;
pub mod result;
pub mod shard;
pub mod value;

pub use error::Error;

pub use intermediary::IntermediaryResult;
pub use message::{error_codes, NodeOperation, NodeRequest, NodeResponse, NodeResponsePayload};
pub use plan::{
    AggregateFunction, AggregationSpec, ArithmeticOp, CompareOp, DerivedColumn, RemotePlan,
    RowFilter,
};
pub use result::{
    ColumnData, ColumnSegment, FailureKind, GroupIntermediaries, GroupRow, QueryResult,
    ShardOutcome, ShardPayload, ShardResult,
};
pub use shard::ShardId;
pub use value::{ColumnType, Value, ValueKey};

/// Protocol version for wire compatibility.
///
/// Carried in every request. Bump when the message layout changes.
pub const PROTOCOL_VERSION: u32 = 1;
