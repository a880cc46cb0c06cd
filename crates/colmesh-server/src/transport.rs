//! NNG REP transport for node requests.
//!
//! Worker threads share one REP socket. Each owns a current-thread runtime
//! and an [`AsyncContext`], answers one request at a time through the
//! [`RequestHandler`] and checks a stop flag between receives.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use async_nng::AsyncContext;
use nng::options::{Options, RecvMaxSize};
use nng::{Message, Protocol, Socket};
use tracing::{debug, error, info, warn};

use colmesh_proto::{error_codes, NodeOperation, NodeRequest, NodeResponse};

use crate::config::ServerConfig;
use crate::error::Error;
use crate::handler::RequestHandler;

/// How long a worker waits for a message before looking at the stop flag.
const RECEIVE_POLL: Duration = Duration::from_secs(1);

/// Request counters of a transport.
#[derive(Debug, Default)]
pub struct TransportStats {
    answered: AtomicU64,
    rejected: AtomicU64,
    bytes_in: AtomicU64,
    bytes_out: AtomicU64,
}

impl TransportStats {
    fn count(&self, ok: bool, received: usize, sent: usize) {
        let counter = if ok { &self.answered } else { &self.rejected };
        counter.fetch_add(1, Ordering::Relaxed);
        self.bytes_in.fetch_add(received as u64, Ordering::Relaxed);
        self.bytes_out.fetch_add(sent as u64, Ordering::Relaxed);
    }

    /// Requests answered with a non-error payload.
    pub fn successful_requests(&self) -> u64 {
        self.answered.load(Ordering::Relaxed)
    }

    /// Requests rejected or answered with an error payload.
    pub fn failed_requests(&self) -> u64 {
        self.rejected.load(Ordering::Relaxed)
    }

    pub fn total_requests(&self) -> u64 {
        self.successful_requests() + self.failed_requests()
    }

    pub fn bytes_received(&self) -> u64 {
        self.bytes_in.load(Ordering::Relaxed)
    }

    pub fn bytes_sent(&self) -> u64 {
        self.bytes_out.load(Ordering::Relaxed)
    }
}

/// A framed answer to one message.
struct Answer {
    frame: Vec<u8>,
    ok: bool,
    operation: &'static str,
}

fn operation_name(operation: &NodeOperation) -> &'static str {
    match operation {
        NodeOperation::Execute { .. } => "execute",
        NodeOperation::Cancel { .. } => "cancel",
        NodeOperation::Ping => "ping",
        NodeOperation::Metrics => "metrics",
    }
}

/// Turns raw request bytes into framed responses.
struct Responder {
    handler: Arc<RequestHandler>,
    max_message_size: usize,
}

impl Responder {
    fn new(handler: Arc<RequestHandler>, max_message_size: usize) -> Self {
        Self {
            handler,
            max_message_size,
        }
    }

    async fn answer(&self, data: &[u8]) -> Answer {
        let (operation, response) = match self.decode(data) {
            Ok(request) => {
                let operation = operation_name(&request.operation);
                debug!(request_id = request.id, operation, "Handling request");
                (operation, self.handler.handle(request).await)
            }
            Err(rejection) => {
                warn!(error = %rejection, bytes = data.len(), "Rejected request");
                ("undecodable", rejection)
            }
        };

        let ok = !response.is_error();
        let frame = response.to_frame().unwrap_or_else(|e| {
            error!(request_id = response.id, error = %e, "Failed to encode response");
            NodeResponse::error(response.id, error_codes::INTERNAL, e.to_string())
                .to_frame()
                .unwrap_or_default()
        });
        Answer { frame, ok, operation }
    }

    /// Decode a request, or build the error response for it. A request that
    /// cannot be decoded is answered under id 0.
    fn decode(&self, data: &[u8]) -> Result<NodeRequest, NodeResponse> {
        if data.len() > self.max_message_size {
            let message = format!("message of {} bytes exceeds {} bytes", data.len(), self.max_message_size);
            return Err(NodeResponse::error(0, error_codes::BAD_REQUEST, message));
        }
        NodeRequest::from_frame(data).map_err(|e| {
            let code = match e {
                colmesh_proto::Error::VersionMismatch { .. } => error_codes::VERSION_MISMATCH,
                _ => error_codes::BAD_REQUEST,
            };
            NodeResponse::error(0, code, e.to_string())
        })
    }
}

/// A REP socket listening on the configured addresses.
pub struct Transport {
    socket: Socket,
    responder: Arc<Responder>,
    stats: Arc<TransportStats>,
    workers: usize,
    slow_after: Duration,
    started: Instant,
}

impl Transport {
    pub fn new(config: &ServerConfig, handler: Arc<RequestHandler>) -> Result<Self, Error> {
        let socket = Socket::new(Protocol::Rep0).map_err(|e| Error::Transport(format!("cannot open socket: {}", e)))?;
        socket
            .set_opt::<RecvMaxSize>(config.max_message_size)
            .map_err(|e| Error::Transport(format!("cannot limit message size: {}", e)))?;

        for address in config.tcp_address.iter().chain(config.ipc_address.iter()) {
            socket
                .listen(address)
                .map_err(|e| Error::Transport(format!("failed to listen on {}: {}", address, e)))?;
            info!(address = %address, "Listening");
        }

        Ok(Self {
            socket,
            responder: Arc::new(Responder::new(handler, config.max_message_size)),
            stats: Arc::new(TransportStats::default()),
            workers: config.transport_workers.max(1),
            slow_after: config.request_timeout,
            started: Instant::now(),
        })
    }

    pub fn stats(&self) -> &TransportStats {
        &self.stats
    }

    /// Serve until `shutdown` fires, then wait for every worker to stop.
    pub async fn run_until_shutdown(&self, mut shutdown: tokio::sync::broadcast::Receiver<()>) -> Result<(), Error> {
        let stop = Arc::new(AtomicBool::new(false));
        let handles = (0..self.workers)
            .map(|worker_id| self.spawn_worker(worker_id, stop.clone()))
            .collect::<Result<Vec<_>, _>>()?;
        info!(workers = self.workers, "Transport ready");

        let _ = shutdown.recv().await;
        stop.store(true, Ordering::SeqCst);
        let _ = tokio::task::spawn_blocking(move || {
            for handle in handles {
                let _ = handle.join();
            }
        })
        .await;

        info!(
            answered = self.stats.successful_requests(),
            rejected = self.stats.failed_requests(),
            uptime_secs = self.started.elapsed().as_secs(),
            "Transport stopped"
        );
        Ok(())
    }

    fn spawn_worker(&self, worker_id: usize, stop: Arc<AtomicBool>) -> Result<JoinHandle<()>, Error> {
        let socket = self.socket.clone();
        let responder = self.responder.clone();
        let stats = self.stats.clone();
        let slow_after = self.slow_after;

        thread::Builder::new()
            .name(format!("colmesh-transport-{}", worker_id))
            .spawn(move || {
                // plan execution inside the handler runs on this runtime's blocking pool
                match tokio::runtime::Builder::new_current_thread().enable_all().build() {
                    Ok(runtime) => runtime.block_on(serve(worker_id, socket, responder, stats, slow_after, stop)),
                    Err(e) => error!(worker_id, error = %e, "Cannot start worker runtime"),
                }
            })
            .map_err(|e| Error::Transport(format!("cannot spawn worker {}: {}", worker_id, e)))
    }
}

async fn serve(
    worker_id: usize,
    socket: Socket,
    responder: Arc<Responder>,
    stats: Arc<TransportStats>,
    slow_after: Duration,
    stop: Arc<AtomicBool>,
) {
    let mut ctx = match AsyncContext::try_from(&socket) {
        Ok(ctx) => ctx,
        Err(e) => {
            error!(worker_id, error = %e, "Cannot open socket context");
            return;
        }
    };

    while !stop.load(Ordering::SeqCst) {
        let message = match ctx.receive(Some(RECEIVE_POLL)).await {
            Ok(message) => message,
            Err(nng::Error::TimedOut) => continue,
            Err(e) => {
                error!(worker_id, error = %e, "Receive failed");
                continue;
            }
        };

        let started = Instant::now();
        let answer = responder.answer(message.as_slice()).await;
        let elapsed = started.elapsed();

        let sent = answer.frame.len();
        match ctx.send(Message::from(answer.frame.as_slice()), None).await {
            Ok(()) => stats.count(answer.ok, message.len(), sent),
            Err((_, e)) => {
                error!(worker_id, operation = answer.operation, error = %e, "Send failed");
                stats.count(false, message.len(), 0);
            }
        }
        if elapsed > slow_after {
            warn!(
                worker_id,
                operation = answer.operation,
                elapsed_ms = elapsed.as_millis() as u64,
                "Slow request"
            );
        }
    }
    debug!(worker_id, "Transport worker stopped");
}

/// Create a transport that listens on the configured addresses.
pub fn create_transport(config: &ServerConfig, handler: Arc<RequestHandler>) -> Result<Transport, Error> {
    if !config.has_transport() {
        return Err(Error::Config("no transport configured (need TCP or IPC address)".to_string()));
    }
    Transport::new(config, handler)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Profile;
    use crate::node::Node;
    use colmesh_proto::framing::MAX_FRAME_SIZE;
    use colmesh_proto::{NodeResponsePayload, PROTOCOL_VERSION};

    fn test_handler() -> Arc<RequestHandler> {
        let config = ServerConfig::new("./unused").without_tcp().with_profile(Profile::Test);
        Node::build(config).unwrap().handler()
    }

    #[test]
    fn test_transport_creation() {
        let dir = tempfile::tempdir().unwrap();
        let ipc_path = format!("ipc://{}", dir.path().join("colmesh.sock").display());
        let config = ServerConfig::new(dir.path())
            .without_tcp()
            .with_ipc_address(ipc_path)
            .with_max_message_size(MAX_FRAME_SIZE);

        match Transport::new(&config, test_handler()) {
            Ok(_) => {}
            Err(Error::Transport(msg)) if msg.contains("Permission denied") => {}
            Err(err) => panic!("transport creation failed: {err}"),
        }
    }

    #[test]
    fn test_transport_requires_address() {
        let config = ServerConfig::new("/tmp/test").without_tcp();
        assert!(matches!(create_transport(&config, test_handler()), Err(Error::Config(_))));
    }

    #[tokio::test]
    async fn test_answer_ping() {
        let responder = Responder::new(test_handler(), MAX_FRAME_SIZE);
        let framed = NodeRequest::ping(42).to_frame().unwrap();

        let Answer { frame: response_bytes, ok: is_success, operation } = responder.answer(&framed).await;
        assert_eq!(operation, "ping");
        assert!(is_success);
        let response = NodeResponse::from_frame(&response_bytes).unwrap();
        assert_eq!(response.id, 42);
        assert_eq!(response.payload, NodeResponsePayload::Pong);
    }

    #[tokio::test]
    async fn test_answer_undecodable_message() {
        let responder = Responder::new(test_handler(), MAX_FRAME_SIZE);
        let Answer { frame: response_bytes, ok: is_success, .. } = responder.answer(b"invalid data").await;
        assert!(!is_success);
        match NodeResponse::from_frame(&response_bytes).unwrap().payload {
            NodeResponsePayload::Error { code, .. } => assert_eq!(code, error_codes::BAD_REQUEST),
            other => panic!("unexpected payload {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_version_mismatch_is_reported() {
        let responder = Responder::new(test_handler(), MAX_FRAME_SIZE);
        let mut request = NodeRequest::ping(5);
        request.protocol_version = PROTOCOL_VERSION + 1;

        let Answer { frame: response_bytes, ok: is_success, .. } = responder.answer(&request.to_frame().unwrap()).await;
        assert!(!is_success);
        match NodeResponse::from_frame(&response_bytes).unwrap().payload {
            NodeResponsePayload::Error { code, .. } => assert_eq!(code, error_codes::VERSION_MISMATCH),
            other => panic!("unexpected payload {:?}", other),
        }
    }

    #[test]
    fn test_stats_split_answers_from_rejections() {
        let stats = TransportStats::default();
        stats.count(true, 10, 20);
        stats.count(false, 5, 0);
        assert_eq!(stats.total_requests(), 2);
        assert_eq!(stats.successful_requests(), 1);
        assert_eq!(stats.failed_requests(), 1);
        assert_eq!(stats.bytes_received(), 15);
        assert_eq!(stats.bytes_sent(), 20);
    }

    #[tokio::test]
    async fn test_oversized_message_is_rejected() {
        let responder = Responder::new(test_handler(), 16);
        let framed = NodeRequest::ping(1).to_frame().unwrap();
        assert!(framed.len() > 16);
        let answer = responder.answer(&framed).await;
        assert!(!answer.ok);
        match NodeResponse::from_frame(&answer.frame).unwrap().payload {
            NodeResponsePayload::Error { code, .. } => assert_eq!(code, error_codes::BAD_REQUEST),
            other => panic!("unexpected payload {:?}", other),
        }
    }
}
