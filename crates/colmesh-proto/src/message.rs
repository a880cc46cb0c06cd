//! Node request and response messages.

use rkyv::{Archive, Deserialize, Serialize};
use serde::{Deserialize as SerdeDeserialize, Serialize as SerdeSerialize};

use crate::framing::{decode_frame, encode_frame};
use crate::plan::RemotePlan;
use crate::result::ShardResult;
use crate::{Error, PROTOCOL_VERSION};

/// Error codes carried by [`NodeResponsePayload::Error`].
pub mod error_codes {
    /// Unspecified server-side failure.
    pub const INTERNAL: u32 = 1;
    /// The request could not be decoded.
    pub const BAD_REQUEST: u32 = 2;
    /// The peer uses a different protocol version.
    pub const VERSION_MISMATCH: u32 = 3;
}

/// A request sent to a node.
#[derive(Debug, Clone, PartialEq, Archive, Serialize, Deserialize, SerdeSerialize, SerdeDeserialize)]
pub struct NodeRequest {
    /// Correlation id.
    pub id: u64,
    /// Sender's protocol version.
    pub protocol_version: u32,
    pub operation: NodeOperation,
}

/// Operations a node performs.
#[derive(Debug, Clone, PartialEq, Archive, Serialize, Deserialize, SerdeSerialize, SerdeDeserialize)]
pub enum NodeOperation {
    /// Run a plan on the listed shards (by first row id) of the plan's table.
    /// An empty list means every local shard of the table.
    Execute { plan: RemotePlan, shards: Vec<u64> },
    /// Stop a running query.
    Cancel { query_id: u64 },
    /// Liveness check.
    Ping,
    /// Execution and cache metrics in the Prometheus text format.
    Metrics,
}

/// A node's answer.
#[derive(Debug, Clone, PartialEq, Archive, Serialize, Deserialize, SerdeSerialize, SerdeDeserialize)]
pub struct NodeResponse {
    /// Id of the request being answered.
    pub id: u64,
    pub payload: NodeResponsePayload,
}

/// Response payloads.
#[derive(Debug, Clone, PartialEq, Archive, Serialize, Deserialize, SerdeSerialize, SerdeDeserialize)]
pub enum NodeResponsePayload {
    /// Per-shard results of an `Execute`.
    Executed(Vec<ShardResult>),
    /// The node serves no shard of the table.
    NoShards { table: String },
    /// Answer to `Cancel`; `found` is false if the query was not running.
    Cancelled { query_id: u64, found: bool },
    /// Answer to `Ping`.
    Pong,
    /// Answer to `Metrics`.
    Metrics(String),
    /// The request failed as a whole.
    Error { code: u32, message: String },
}

impl NodeRequest {
    /// Request execution of a plan.
    pub fn execute(id: u64, plan: RemotePlan, shards: Vec<u64>) -> Self {
        Self {
            id,
            protocol_version: PROTOCOL_VERSION,
            operation: NodeOperation::Execute { plan, shards },
        }
    }

    /// Request cancellation of a query.
    pub fn cancel(id: u64, query_id: u64) -> Self {
        Self {
            id,
            protocol_version: PROTOCOL_VERSION,
            operation: NodeOperation::Cancel { query_id },
        }
    }

    /// Ping request.
    pub fn ping(id: u64) -> Self {
        Self {
            id,
            protocol_version: PROTOCOL_VERSION,
            operation: NodeOperation::Ping,
        }
    }

    /// Metrics request.
    pub fn metrics(id: u64) -> Self {
        Self {
            id,
            protocol_version: PROTOCOL_VERSION,
            operation: NodeOperation::Metrics,
        }
    }

    /// Serialize into a framed buffer.
    pub fn to_frame(&self) -> Result<Vec<u8>, Error> {
        let payload = rkyv::to_bytes::<rkyv::rancor::Error>(self)
            .map_err(|e| Error::Serialization(format!("failed to serialize request: {}", e)))?;
        encode_frame(&payload)
    }

    /// Decode a framed buffer.
    pub fn from_frame(frame: &[u8]) -> Result<Self, Error> {
        let payload = decode_frame(frame)?;
        // rkyv needs an aligned buffer for validation.
        let mut aligned: rkyv::util::AlignedVec<16> = rkyv::util::AlignedVec::new();
        aligned.extend_from_slice(payload);
        let request = rkyv::from_bytes::<Self, rkyv::rancor::Error>(&aligned)
            .map_err(|e| Error::Deserialization(format!("failed to deserialize request: {}", e)))?;

        if request.protocol_version != PROTOCOL_VERSION {
            return Err(Error::VersionMismatch {
                expected: PROTOCOL_VERSION,
                actual: request.protocol_version,
            });
        }
        Ok(request)
    }
}

impl NodeResponse {
    /// Create a response.
    pub fn new(id: u64, payload: NodeResponsePayload) -> Self {
        Self { id, payload }
    }

    /// Create an error response.
    pub fn error(id: u64, code: u32, message: impl Into<String>) -> Self {
        Self {
            id,
            payload: NodeResponsePayload::Error {
                code,
                message: message.into(),
            },
        }
    }

    /// Whether the payload is an error.
    pub fn is_error(&self) -> bool {
        matches!(self.payload, NodeResponsePayload::Error { .. })
    }

    /// Serialize into a framed buffer.
    pub fn to_frame(&self) -> Result<Vec<u8>, Error> {
        let payload = rkyv::to_bytes::<rkyv::rancor::Error>(self)
            .map_err(|e| Error::Serialization(format!("failed to serialize response: {}", e)))?;
        encode_frame(&payload)
    }

    /// Decode a framed buffer.
    pub fn from_frame(frame: &[u8]) -> Result<Self, Error> {
        let payload = decode_frame(frame)?;
        let mut aligned: rkyv::util::AlignedVec<16> = rkyv::util::AlignedVec::new();
        aligned.extend_from_slice(payload);
        rkyv::from_bytes::<Self, rkyv::rancor::Error>(&aligned)
            .map_err(|e| Error::Deserialization(format!("failed to deserialize response: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::intermediary::IntermediaryResult;
    use crate::plan::{AggregateFunction, AggregationSpec};
    use crate::result::{GroupIntermediaries, ShardPayload};
    use crate::shard::ShardId;
    use crate::value::Value;

    #[test]
    fn test_execute_request_over_frame() {
        let plan = RemotePlan::new(9, "events").aggregate(AggregationSpec::count("n"));
        let request = NodeRequest::execute(1, plan.clone(), vec![0, 100]);

        let decoded = NodeRequest::from_frame(&request.to_frame().unwrap()).unwrap();
        assert_eq!(decoded, request);
        match decoded.operation {
            NodeOperation::Execute { plan: p, shards } => {
                assert_eq!(p, plan);
                assert_eq!(shards, vec![0, 100]);
            }
            other => panic!("unexpected operation {:?}", other),
        }
    }

    #[test]
    fn test_version_mismatch_rejected() {
        let mut request = NodeRequest::ping(3);
        request.protocol_version = PROTOCOL_VERSION + 1;
        let frame = request.to_frame().unwrap();
        assert!(matches!(
            NodeRequest::from_frame(&frame),
            Err(Error::VersionMismatch { .. })
        ));
    }

    #[test]
    fn test_response_with_intermediaries() {
        let mut state = IntermediaryResult::new(AggregateFunction::Count, 1);
        state.push_value(Value::Long(250));
        let payload = ShardPayload {
            columns: vec![],
            groups: vec![GroupIntermediaries {
                group: Value::Null,
                results: vec![state],
            }],
        };
        let response = NodeResponse::new(
            5,
            NodeResponsePayload::Executed(vec![ShardResult::completed(ShardId::new("t", 0), payload)]),
        );

        let decoded = NodeResponse::from_frame(&response.to_frame().unwrap()).unwrap();
        assert_eq!(decoded, response);
        assert!(!decoded.is_error());
    }

    #[test]
    fn test_garbage_is_rejected() {
        assert!(NodeResponse::from_frame(b"garbage").is_err());
        assert!(NodeRequest::from_frame(&encode_frame(b"garbage").unwrap()).is_err());
    }
}
