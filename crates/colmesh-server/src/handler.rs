//! Request handler for node requests.

use std::sync::Arc;

use colmesh_cluster::{ExecuteReply, NodeService};
use colmesh_proto::{NodeOperation, NodeRequest, NodeResponse, NodeResponsePayload};

/// Dispatches decoded node requests to the local [`NodeService`].
pub struct RequestHandler {
    service: Arc<NodeService>,
}

impl RequestHandler {
    /// Create a handler over the given service.
    pub fn new(service: Arc<NodeService>) -> Self {
        Self { service }
    }

    pub fn service(&self) -> &Arc<NodeService> {
        &self.service
    }

    /// Handle a request and return a response.
    pub async fn handle(&self, request: NodeRequest) -> NodeResponse {
        let id = request.id;
        let payload = match request.operation {
            NodeOperation::Execute { plan, shards } => {
                let table = plan.table.clone();
                match self.service.execute(plan, shards).await {
                    ExecuteReply::Executed(results) => NodeResponsePayload::Executed(results),
                    ExecuteReply::NoShards => NodeResponsePayload::NoShards { table },
                }
            }
            NodeOperation::Cancel { query_id } => NodeResponsePayload::Cancelled {
                query_id,
                found: self.service.cancel(query_id),
            },
            NodeOperation::Ping => NodeResponsePayload::Pong,
            NodeOperation::Metrics => NodeResponsePayload::Metrics(self.service.metrics_text()),
        };
        NodeResponse::new(id, payload)
    }
}
