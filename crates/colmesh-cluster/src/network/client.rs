//! NNG-based remote node client.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use nng::options::{Options, RecvTimeout, SendTimeout};
use nng::{Protocol, Socket};
use tracing::warn;

use colmesh_proto::{NodeRequest, NodeResponse, NodeResponsePayload, RemotePlan};

use crate::error::ClusterError;
use crate::remote::{ExecuteReply, NodeConnector, RemoteNode};

/// Opens NNG request sockets to node addresses.
pub struct NngConnector {
    timeout: Duration,
    next_id: Arc<AtomicU64>,
}

impl NngConnector {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            next_id: Arc::new(AtomicU64::new(1)),
        }
    }
}

impl NodeConnector for NngConnector {
    fn connect(&self, address: &str) -> Result<Arc<dyn RemoteNode>, ClusterError> {
        Ok(Arc::new(NngRemoteNode {
            address: address.to_string(),
            timeout: self.timeout,
            next_id: self.next_id.clone(),
        }))
    }
}

/// A node reached over an NNG REQ socket.
///
/// Each request dials its own socket on the blocking pool.
pub struct NngRemoteNode {
    address: String,
    timeout: Duration,
    next_id: Arc<AtomicU64>,
}

impl NngRemoteNode {
    /// Dial URL of the node; bare `host:port` addresses use TCP.
    fn url(&self) -> String {
        if self.address.contains("://") {
            self.address.clone()
        } else {
            format!("tcp://{}", self.address)
        }
    }

    fn send_sync(url: &str, timeout: Duration, frame: &[u8]) -> Result<Vec<u8>, ClusterError> {
        let socket = Socket::new(Protocol::Req0)
            .map_err(|e| ClusterError::Network(format!("Failed to create socket: {}", e)))?;
        socket
            .set_opt::<SendTimeout>(Some(timeout))
            .map_err(|e| ClusterError::Network(format!("Failed to set send timeout: {}", e)))?;
        socket
            .set_opt::<RecvTimeout>(Some(timeout))
            .map_err(|e| ClusterError::Network(format!("Failed to set recv timeout: {}", e)))?;
        socket
            .dial(url)
            .map_err(|e| ClusterError::Network(format!("Failed to connect to {}: {}", url, e)))?;

        socket
            .send(nng::Message::from(frame))
            .map_err(|(_, e)| ClusterError::Network(format!("Send to {} failed: {}", url, e)))?;
        let reply = socket
            .recv()
            .map_err(|e| ClusterError::Network(format!("Recv from {} failed: {}", url, e)))?;
        Ok(reply.as_slice().to_vec())
    }

    async fn call(&self, request: NodeRequest) -> Result<NodeResponsePayload, ClusterError> {
        let frame = request.to_frame()?;
        let url = self.url();
        let timeout = self.timeout;

        let reply = tokio::task::spawn_blocking(move || Self::send_sync(&url, timeout, &frame))
            .await
            .map_err(|e| ClusterError::Network(format!("Task join failed: {}", e)))??;

        let response = NodeResponse::from_frame(&reply)?;
        if response.id != request.id {
            return Err(ClusterError::Network(format!(
                "{} answered request {} with id {}",
                self.address, request.id, response.id
            )));
        }
        match response.payload {
            NodeResponsePayload::Error { code, message } => {
                warn!(address = %self.address, code, error = %message, "Node rejected request");
                Err(ClusterError::Network(format!(
                    "{} failed request {} ({}): {}",
                    self.address, request.id, code, message
                )))
            }
            payload => Ok(payload),
        }
    }

    fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }
}

fn unexpected(address: &str, payload: &NodeResponsePayload) -> ClusterError {
    ClusterError::Network(format!("{} sent unexpected response {:?}", address, payload))
}

#[async_trait]
impl RemoteNode for NngRemoteNode {
    fn address(&self) -> &str {
        &self.address
    }

    async fn execute(&self, plan: &RemotePlan, shards: &[u64]) -> Result<ExecuteReply, ClusterError> {
        let request = NodeRequest::execute(self.next_id(), plan.clone(), shards.to_vec());
        match self.call(request).await? {
            NodeResponsePayload::Executed(results) => Ok(ExecuteReply::Executed(results)),
            NodeResponsePayload::NoShards { .. } => Ok(ExecuteReply::NoShards),
            other => Err(unexpected(&self.address, &other)),
        }
    }

    async fn cancel(&self, query_id: u64) -> Result<bool, ClusterError> {
        match self.call(NodeRequest::cancel(self.next_id(), query_id)).await? {
            NodeResponsePayload::Cancelled { found, .. } => Ok(found),
            other => Err(unexpected(&self.address, &other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_node_url() {
        let connector = NngConnector::new(Duration::from_secs(1));
        let node = NngRemoteNode {
            address: "192.168.1.10:9100".to_string(),
            timeout: Duration::from_secs(1),
            next_id: connector.next_id.clone(),
        };
        assert_eq!(node.url(), "tcp://192.168.1.10:9100");

        let ipc = NngRemoteNode {
            address: "ipc:///tmp/colmesh.sock".to_string(),
            ..node
        };
        assert_eq!(ipc.url(), "ipc:///tmp/colmesh.sock");
    }

    #[tokio::test]
    async fn test_unreachable_node_is_a_network_error() {
        let connector = NngConnector::new(Duration::from_millis(200));
        let node = connector.connect("ipc:///nonexistent/colmesh-test.sock").unwrap();
        let result = node.cancel(1).await;
        assert!(matches!(result, Err(ClusterError::Network(_))));
    }
}
