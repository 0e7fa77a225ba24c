//! Pluggable asynchronous HTTPS client.
//!
//! Lifecycle: `configure` (optional, once) → `start` → `new_request`/`send` → `close`.
//! Requests are pure builders; `send` spawns the call on the runtime captured at `start`
//! and returns immediately. Completion carries a [`SendResult`] with a classified failure.

pub mod http1;
pub mod reqwest_backend;

use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;
use std::str::FromStr;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use std::time::Duration;

use futures::future::BoxFuture;
use grouphttp_core::{parse_timeout, ContentSource, Properties};
use serde::Deserialize;
use tokio::runtime::Handle;
use tokio::sync::oneshot;
use url::Url;

use crate::tls::{self, Identity, TlsError};

pub use http1::Http1Client;
pub use reqwest_backend::ReqwestClient;

pub const KEY_STORE: &str = "ssl.key-store";
pub const KEY_STORE_PASSWORD: &str = "ssl.key-store-password";
pub const KEY_PASSWORD: &str = "ssl.key-password";
pub const TRUST_STORE: &str = "ssl.trust-store";
pub const TRUST_STORE_PASSWORD: &str = "ssl.trust-store-password";
pub const CONNECT_TIMEOUT: &str = "connect-timeout";
pub const RESPONSE_TIMEOUT: &str = "response-timeout";

/// Upper bound on handshake, upload and response when no `response-timeout` is set.
pub const DEFAULT_RESPONSE_TIMEOUT: Duration = Duration::from_secs(30);

/// Client backend selector.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClientKind {
    /// Multiplexed HTTP/2 (HTTP/1.1 fallback) via reqwest.
    #[default]
    Reqwest,
    /// One HTTP/1.1 request per connection.
    Http1,
}

impl FromStr for ClientKind {
    type Err = ClientError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "reqwest" | "http2" => Ok(ClientKind::Reqwest),
            "http1" => Ok(ClientKind::Http1),
            _ => Err(ClientError::Configuration(format!(
                "unknown client implementation '{}'",
                s
            ))),
        }
    }
}

/// Create an unstarted client of the given kind.
pub fn new_client(kind: ClientKind) -> Arc<dyn HttpClient> {
    match kind {
        ClientKind::Reqwest => Arc::new(ReqwestClient::new()),
        ClientKind::Http1 => Arc::new(Http1Client::new()),
    }
}

/// Options recognized by `configure`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientOptions {
    pub key_store: Option<String>,
    pub key_store_password: Option<String>,
    /// Defaults to the key store password.
    pub key_password: Option<String>,
    pub trust_store: Option<String>,
    pub trust_store_password: Option<String>,
    pub connect_timeout: Option<Duration>,
    /// Bound on everything after the TCP connect; `DEFAULT_RESPONSE_TIMEOUT` when unset.
    pub response_timeout: Option<Duration>,
    /// Base directory for `classpath:` locations.
    pub resource_root: PathBuf,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            key_store: None,
            key_store_password: None,
            key_password: None,
            trust_store: None,
            trust_store_password: None,
            connect_timeout: None,
            response_timeout: None,
            resource_root: PathBuf::from("resources"),
        }
    }
}

impl ClientOptions {
    pub fn from_properties(props: &Properties) -> Result<Self, ClientError> {
        let get = |k: &str| props.get(k).filter(|v| !v.is_empty()).map(str::to_string);
        let timeout = |k: &str| match props.get(k) {
            Some(v) if !v.is_empty() => parse_timeout(v)
                .map(Some)
                .map_err(|e| ClientError::Configuration(format!("{}: {}", k, e))),
            _ => Ok(None),
        };
        let connect_timeout = timeout(CONNECT_TIMEOUT)?;
        let response_timeout = timeout(RESPONSE_TIMEOUT)?;
        Ok(Self {
            key_store: get(KEY_STORE),
            key_store_password: get(KEY_STORE_PASSWORD),
            key_password: get(KEY_PASSWORD),
            trust_store: get(TRUST_STORE),
            trust_store_password: get(TRUST_STORE_PASSWORD),
            connect_timeout,
            response_timeout,
            ..Self::default()
        })
    }

    /// Key store passwords; the key password defaults to the store password.
    pub fn key_passwords(&self) -> tls::KeyPasswords<'_> {
        tls::KeyPasswords::new(self.key_store_password.as_deref(), self.key_password.as_deref())
    }
}

/// Client contract shared by all backends. Safe for concurrent use.
pub trait HttpClient: Send + Sync {
    /// Load TLS material named by `options`. At most once, before `start`.
    fn configure(&self, options: &ClientOptions) -> Result<(), ClientError>;

    /// Build the TLS context and the backend. Must run inside a tokio runtime.
    fn start(&self) -> Result<(), ClientError>;

    /// Request builder bound to `url`. No I/O.
    fn new_request(&self, url: &str) -> Result<Request, ClientError>;

    /// Release resources. Idempotent; later `new_request` calls fail with `NotStarted`.
    fn close(&self) -> Result<(), ClientError>;

    fn is_started(&self) -> bool;
}

/// Performs one request. Implemented by each backend.
pub(crate) trait Execute: Send + Sync {
    fn execute(&self, parts: RequestParts) -> BoxFuture<'static, SendResult>;
}

/// TLS material loaded by `configure`.
#[derive(Clone, Default)]
pub(crate) struct TlsMaterial {
    pub identity: Option<Identity>,
    pub roots: Option<rustls::RootCertStore>,
    pub connect_timeout: Option<Duration>,
    pub response_timeout: Option<Duration>,
}

impl TlsMaterial {
    fn load(options: &ClientOptions) -> Result<Self, ClientError> {
        let identity = options
            .key_store
            .as_deref()
            .map(|loc| tls::load_identity(loc, &options.resource_root, options.key_passwords()))
            .transpose()?;
        let roots = options
            .trust_store
            .as_deref()
            .map(|loc| tls::load_roots(loc, &options.resource_root, options.trust_store_password.as_deref()))
            .transpose()?;
        Ok(Self {
            identity,
            roots,
            connect_timeout: options.connect_timeout,
            response_timeout: options.response_timeout,
        })
    }

    pub fn response_timeout(&self) -> Duration {
        self.response_timeout.unwrap_or(DEFAULT_RESPONSE_TIMEOUT)
    }

    pub fn client_config(&self, alpn: &[&[u8]]) -> Result<rustls::ClientConfig, ClientError> {
        let roots = self.roots.clone().unwrap_or_else(tls::default_roots);
        Ok(tls::client_config(self.identity.as_ref(), roots, alpn)?)
    }
}

enum State {
    Created { material: Option<TlsMaterial> },
    Started { exec: Arc<dyn Execute>, runtime: Handle },
    Closed,
}

/// State machine shared by the backends.
pub(crate) struct Lifecycle {
    state: Mutex<State>,
}

impl Lifecycle {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State::Created { material: None }),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn configure(&self, options: &ClientOptions) -> Result<(), ClientError> {
        let mut state = self.lock();
        match &mut *state {
            State::Created { material: Some(_) } => Err(ClientError::AlreadyConfigured),
            State::Created { material } => {
                *material = Some(TlsMaterial::load(options)?);
                Ok(())
            }
            State::Started { .. } => Err(ClientError::AlreadyStarted),
            State::Closed => Err(ClientError::Closed),
        }
    }

    pub fn start(
        &self,
        build: impl FnOnce(&TlsMaterial) -> Result<Arc<dyn Execute>, ClientError>,
    ) -> Result<(), ClientError> {
        let mut state = self.lock();
        let material = match &*state {
            State::Created { material } => material.clone().unwrap_or_default(),
            State::Started { .. } => return Err(ClientError::AlreadyStarted),
            State::Closed => return Err(ClientError::Closed),
        };
        let runtime = Handle::try_current().map_err(|_| ClientError::NoRuntime)?;
        let exec = build(&material)?;
        *state = State::Started { exec, runtime };
        Ok(())
    }

    pub fn new_request(&self, url: &str) -> Result<Request, ClientError> {
        let state = self.lock();
        match &*state {
            State::Started { exec, runtime } => {
                let url = Url::parse(url).map_err(|e| ClientError::InvalidUrl(format!("{}: {}", url, e)))?;
                Ok(Request {
                    exec: exec.clone(),
                    runtime: runtime.clone(),
                    parts: RequestParts {
                        url,
                        method: "GET".to_string(),
                        headers: Vec::new(),
                        content: None,
                    },
                })
            }
            _ => Err(ClientError::NotStarted),
        }
    }

    pub fn close(&self) {
        *self.lock() = State::Closed;
    }

    pub fn is_started(&self) -> bool {
        matches!(&*self.lock(), State::Started { .. })
    }
}

/// Request data handed to a backend.
pub struct RequestParts {
    pub url: Url,
    pub method: String,
    pub headers: Vec<(String, String)>,
    pub content: Option<Arc<dyn ContentSource>>,
}

/// Per-call request builder.
pub struct Request {
    exec: Arc<dyn Execute>,
    runtime: Handle,
    parts: RequestParts,
}

impl Request {
    pub fn method(mut self, name: &str) -> Self {
        self.parts.method = name.to_string();
        self
    }

    pub fn header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.parts.headers.push((name.to_string(), value.into()));
        self
    }

    pub fn content(mut self, content: Arc<dyn ContentSource>) -> Self {
        self.parts.content = Some(content);
        self
    }

    pub fn url(&self) -> &Url {
        &self.parts.url
    }

    /// Start the call; the handle resolves when it completes.
    pub fn send(self) -> SendHandle {
        let (tx, rx) = oneshot::channel();
        self.send_with(move |result| {
            let _ = tx.send(result);
        });
        SendHandle { rx }
    }

    /// Start the call; `listener` runs on a runtime worker when it completes.
    pub fn send_with(self, listener: impl FnOnce(SendResult) + Send + 'static) {
        let fut = self.exec.execute(self.parts);
        self.runtime.spawn(async move {
            listener(fut.await);
        });
    }
}

/// Completion of one `send`.
pub struct SendHandle {
    rx: oneshot::Receiver<SendResult>,
}

impl SendHandle {
    pub(crate) fn from_receiver(rx: oneshot::Receiver<SendResult>) -> Self {
        Self { rx }
    }
}

impl Future for SendHandle {
    type Output = SendResult;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<SendResult> {
        Pin::new(&mut self.rx).poll(cx).map(|r| {
            r.unwrap_or_else(|_| SendResult::failed(SendError::Other("request task dropped".into())))
        })
    }
}

/// Response metadata. The body is not read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Response {
    pub status: u16,
}

#[derive(Debug, Clone)]
pub struct SendResult {
    pub failure: Option<SendError>,
    pub response: Option<Response>,
}

impl SendResult {
    pub fn completed(status: u16) -> Self {
        Self {
            failure: None,
            response: Some(Response { status }),
        }
    }

    pub fn failed(err: SendError) -> Self {
        Self {
            failure: Some(err),
            response: None,
        }
    }

    pub fn is_failed(&self) -> bool {
        self.failure.is_some()
    }
}

/// Classified send failure.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SendError {
    /// Refused, unreachable, or name resolution failed. Expected while peers come and go.
    #[error("connect failed: {0}")]
    Connect(String),
    #[error("timed out: {0}")]
    Timeout(String),
    /// TLS, protocol and everything else.
    #[error("{0}")]
    Other(String),
}

/// Classify an error by walking its source chain. Unrecognized chains are `Other`.
pub(crate) fn classify(err: &(dyn std::error::Error + 'static)) -> SendError {
    classify_chain(err).unwrap_or_else(|| SendError::Other(chain_message(err)))
}

/// `None` when nothing in the chain is recognized.
pub(crate) fn classify_chain(err: &(dyn std::error::Error + 'static)) -> Option<SendError> {
    let detail = || chain_message(err);
    let mut cur: Option<&(dyn std::error::Error + 'static)> = Some(err);
    while let Some(e) = cur {
        if e.is::<rustls::Error>() {
            return Some(SendError::Other(detail()));
        }
        if e.is::<tokio::time::error::Elapsed>() {
            return Some(SendError::Timeout(detail()));
        }
        if let Some(io) = e.downcast_ref::<std::io::Error>() {
            if let Some(class) = IoClass::of(io) {
                return Some(class.into_error(detail()));
            }
        }
        cur = e.source();
    }
    None
}

enum IoClass {
    Connect,
    Timeout,
    Tls,
}

impl IoClass {
    fn of(err: &std::io::Error) -> Option<Self> {
        use std::io::ErrorKind;
        if err.get_ref().is_some_and(|inner| inner.is::<rustls::Error>()) {
            return Some(IoClass::Tls);
        }
        match err.kind() {
            ErrorKind::ConnectionRefused
            | ErrorKind::HostUnreachable
            | ErrorKind::NetworkUnreachable
            | ErrorKind::AddrNotAvailable => Some(IoClass::Connect),
            ErrorKind::TimedOut => Some(IoClass::Timeout),
            _ => None,
        }
    }

    fn into_error(self, detail: String) -> SendError {
        match self {
            IoClass::Connect => SendError::Connect(detail),
            IoClass::Timeout => SendError::Timeout(detail),
            IoClass::Tls => SendError::Other(detail),
        }
    }
}

/// `outer: inner: innermost`
pub(crate) fn chain_message(err: &(dyn std::error::Error + 'static)) -> String {
    let mut out = err.to_string();
    let mut cur = err.source();
    while let Some(e) = cur {
        let s = e.to_string();
        if !out.contains(&s) {
            out.push_str(": ");
            out.push_str(&s);
        }
        cur = e.source();
    }
    out
}

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("configuration error: {0}")]
    Configuration(String),
    #[error(transparent)]
    Tls(#[from] TlsError),
    #[error("client already configured")]
    AlreadyConfigured,
    #[error("client already started")]
    AlreadyStarted,
    #[error("client not started")]
    NotStarted,
    #[error("client closed")]
    Closed,
    #[error("client must be started inside a tokio runtime")]
    NoRuntime,
    #[error("invalid url {0}")]
    InvalidUrl(String),
    #[error("backend: {0}")]
    Backend(String),
}

impl ClientError {
    /// Configuration-class errors: bad options or unusable TLS material.
    pub fn is_configuration(&self) -> bool {
        matches!(self, ClientError::Configuration(_) | ClientError::Tls(_))
    }
}
