//! Streaming receiver: embedded HTTPS server that reassembles each POST body under a size
//! limit and hands it to the transport.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use futures::FutureExt;
use grouphttp_core::{AssemblyError, InboundAssembly, PeerEndpoint};
use http_body_util::{BodyExt, Full};
use hyper::body::{Body, Incoming};
use hyper::header::CONTENT_LENGTH;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_rustls::TlsAcceptor;

use crate::transport::{HttpTransport, SENDER_HEADER};

/// Per-request failure, mapped to an HTTP status.
#[derive(Debug, thiserror::Error)]
pub enum ReceiveError {
    #[error("bad request: {0}")]
    BadRequest(String),
    #[error("payload too large: {length} > {max}")]
    PayloadTooLarge { length: u64, max: usize },
    #[error("internal error: {0}")]
    Internal(String),
}

impl ReceiveError {
    pub fn status(&self) -> StatusCode {
        match self {
            ReceiveError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ReceiveError::PayloadTooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
            ReceiveError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Response body; internal detail stays in the log.
    fn public_message(&self) -> String {
        match self {
            ReceiveError::Internal(_) => "internal error".to_string(),
            other => other.to_string(),
        }
    }
}

impl From<AssemblyError> for ReceiveError {
    fn from(e: AssemblyError) -> Self {
        match e {
            AssemblyError::TooLarge { length, max } => ReceiveError::PayloadTooLarge { length, max },
            other => ReceiveError::Internal(other.to_string()),
        }
    }
}

/// Holds one in-flight slot; released on drop.
struct InFlight(Arc<AtomicUsize>);

impl InFlight {
    fn enter(counter: &Arc<AtomicUsize>) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(counter.clone())
    }
}

impl Drop for InFlight {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Request handler bound to one transport.
#[derive(Clone)]
pub struct Receiver {
    transport: HttpTransport,
    service_path: Arc<str>,
    max_content_length: usize,
    in_flight: Arc<AtomicUsize>,
}

impl Receiver {
    pub fn new(transport: HttpTransport, service_path: &str, max_content_length: usize) -> Self {
        let path = if service_path.is_empty() { "/" } else { service_path };
        Self {
            transport,
            service_path: Arc::from(path),
            max_content_length,
            in_flight: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Route and process one request. Generic over the body so tests can pass in-memory bodies.
    pub async fn handle<B>(&self, req: Request<B>) -> Response<Full<Bytes>>
    where
        B: Body<Data = Bytes> + Unpin,
        B::Error: std::fmt::Display,
    {
        let _slot = InFlight::enter(&self.in_flight);
        if req.uri().path() != &*self.service_path {
            return plain(StatusCode::NOT_FOUND, "not found");
        }
        if req.method() != Method::POST {
            return plain(StatusCode::METHOD_NOT_ALLOWED, "method not allowed");
        }
        match self.receive(req).await {
            Ok(()) => plain(StatusCode::OK, ""),
            Err(e) => {
                match &e {
                    ReceiveError::Internal(detail) => tracing::error!("receiver fault: {}", detail),
                    other => tracing::debug!("rejected request: {}", other),
                }
                plain(e.status(), &e.public_message())
            }
        }
    }

    async fn receive<B>(&self, req: Request<B>) -> Result<(), ReceiveError>
    where
        B: Body<Data = Bytes> + Unpin,
        B::Error: std::fmt::Display,
    {
        let sender = sender_of(&req)?;
        let declared = declared_length(&req)?;
        let mut assembly = InboundAssembly::new(sender, declared, self.max_content_length)?;

        let mut body = req.into_body();
        while let Some(frame) = body.frame().await {
            let frame = frame.map_err(|e| ReceiveError::Internal(format!("reading body: {}", e)))?;
            if let Ok(data) = frame.into_data() {
                assembly.push(&data)?;
            }
        }

        let payload = assembly.finish();
        let sender = assembly.sender().clone();
        tracing::trace!("received {} bytes from {}", payload.len(), sender);
        let transport = &self.transport;
        std::panic::catch_unwind(AssertUnwindSafe(|| transport.receive(sender, payload)))
            .map_err(|_| ReceiveError::Internal("message handler panicked".to_string()))
    }
}

fn sender_of<B>(req: &Request<B>) -> Result<PeerEndpoint, ReceiveError> {
    let value = req
        .headers()
        .get(SENDER_HEADER)
        .ok_or_else(|| ReceiveError::BadRequest(format!("missing {} header", SENDER_HEADER)))?;
    let s = value
        .to_str()
        .map_err(|_| ReceiveError::BadRequest(format!("{} is not text", SENDER_HEADER)))?;
    s.parse::<PeerEndpoint>()
        .map_err(|e| ReceiveError::BadRequest(format!("{} '{}': {}", SENDER_HEADER, s, e)))
}

fn declared_length<B>(req: &Request<B>) -> Result<Option<u64>, ReceiveError> {
    match req.headers().get(CONTENT_LENGTH) {
        None => Ok(None),
        Some(v) => v
            .to_str()
            .ok()
            .and_then(|s| s.trim().parse::<u64>().ok())
            .map(Some)
            .ok_or_else(|| ReceiveError::BadRequest("invalid Content-Length".to_string())),
    }
}

fn plain(status: StatusCode, body: &str) -> Response<Full<Bytes>> {
    let mut resp = Response::new(Full::new(Bytes::from(body.to_string())));
    *resp.status_mut() = status;
    resp
}

/// Listening HTTPS server. Aborted on drop.
pub struct ReceiverServer {
    local_addr: SocketAddr,
    receiver: Receiver,
    task: JoinHandle<()>,
}

impl ReceiverServer {
    /// Bind `addr` and start accepting. Connections speak HTTP/1.1 or HTTP/2 (ALPN).
    pub async fn bind(
        addr: SocketAddr,
        tls: rustls::ServerConfig,
        receiver: Receiver,
    ) -> std::io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        let acceptor = TlsAcceptor::from(Arc::new(tls));
        let task = tokio::spawn(accept_loop(listener, acceptor, receiver.clone()));
        tracing::info!("receiver listening on {}", local_addr);
        Ok(Self {
            local_addr,
            receiver,
            task,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Requests currently being processed.
    pub fn in_flight(&self) -> usize {
        self.receiver.in_flight()
    }

    /// Stop accepting. Connections already accepted finish on their own.
    pub fn shutdown(&self) {
        self.task.abort();
    }
}

impl Drop for ReceiverServer {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn accept_loop(listener: TcpListener, acceptor: TlsAcceptor, receiver: Receiver) {
    loop {
        let (tcp, peer) = match listener.accept().await {
            Ok(conn) => conn,
            Err(e) => {
                tracing::warn!("accept failed: {}", e);
                tokio::time::sleep(std::time::Duration::from_millis(50)).await;
                continue;
            }
        };
        let acceptor = acceptor.clone();
        let receiver = receiver.clone();
        tokio::spawn(async move {
            let tls = match acceptor.accept(tcp).await {
                Ok(s) => s,
                Err(e) => {
                    tracing::debug!("tls handshake with {} failed: {}", peer, e);
                    return;
                }
            };
            let service = service_fn(move |req: Request<Incoming>| {
                let receiver = receiver.clone();
                async move { Ok::<_, Infallible>(receiver.handle(req).await) }
            });
            let builder = auto::Builder::new(TokioExecutor::new());
            let conn = builder.serve_connection(TokioIo::new(tls), service);
            match AssertUnwindSafe(conn).catch_unwind().await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => tracing::debug!("connection from {} ended: {}", peer, e),
                Err(_) => tracing::error!("connection handler for {} panicked", peer),
            }
        });
    }
}
