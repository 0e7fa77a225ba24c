//! Transport node: turns "send to member X" into an HTTPS POST and delivers inbound bodies upward.
//!
//! Lifecycle: Created → Configured → Started → Closed. Sends never block on the network;
//! each completion is classified and logged, and counted in [`TransportStats`].

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::time::{Duration, Instant};

use bytes::Bytes;
use futures::future::BoxFuture;
use grouphttp_core::{
    BytesContent, ContentError, ExpiringSet, NodeId, PeerEndpoint, MESSAGE_CONTENT_TYPE,
};
use tokio::runtime::Handle;
use tokio::sync::oneshot;

use crate::client::{
    new_client, ClientError, ClientKind, ClientOptions, HttpClient, SendError, SendHandle,
    SendResult,
};
use crate::config::{validate_service_path, Config, ConfigError};

/// Header carrying the sender's endpoint string.
pub const SENDER_HEADER: &str = "X-Sender";

/// Receives inbound message bodies.
pub trait UpHandler: Send + Sync {
    fn up(&self, sender: PeerEndpoint, payload: Bytes);
}

/// Single-address discovery used on a physical-address cache miss.
pub trait AddressLookup: Send + Sync {
    fn fetch(&self, node: NodeId, timeout: Duration) -> BoxFuture<'static, Option<PeerEndpoint>>;
}

/// Transport capability, independent of any membership framework.
pub trait Transport {
    fn start(&self) -> Result<(), TransportError>;
    fn stop(&self);
    fn send_unicast(
        &self,
        dest: &PeerEndpoint,
        data: &[u8],
        offset: usize,
        length: usize,
    ) -> Result<(), TransportError>;
    fn send_multicast(&self, data: &[u8], offset: usize, length: usize) -> Result<(), TransportError>;
    /// False: multicast is one unicast per member.
    fn supports_multicast(&self) -> bool;
    fn physical_address(&self, node: NodeId) -> impl Future<Output = Option<PeerEndpoint>> + Send;
}

#[derive(Debug, Clone)]
pub struct TransportSettings {
    /// Advertised endpoint, sent as `X-Sender`.
    pub local_endpoint: PeerEndpoint,
    pub service_path: String,
    pub client_kind: ClientKind,
    pub client_options: ClientOptions,
    pub who_has_timeout: Duration,
    pub fetch_timeout: Duration,
}

impl TransportSettings {
    pub fn new(local_endpoint: PeerEndpoint) -> Self {
        Self {
            local_endpoint,
            service_path: "/jgroups".to_string(),
            client_kind: ClientKind::default(),
            client_options: ClientOptions::default(),
            who_has_timeout: grouphttp_core::who_has::DEFAULT_WHO_HAS_TIMEOUT,
            fetch_timeout: Duration::from_millis(3000),
        }
    }

    pub fn from_config(cfg: &Config) -> Result<Self, ConfigError> {
        Ok(Self {
            local_endpoint: cfg.external_endpoint()?,
            service_path: cfg.service_path.clone(),
            client_kind: cfg.client.implementation,
            client_options: cfg.client_options()?,
            who_has_timeout: cfg.discovery.who_has_cache_timeout,
            fetch_timeout: cfg.discovery.fetch_timeout,
        })
    }

    /// `https://<ip-or-[ipv6]>[:port]<service_path>`
    pub fn service_url(&self, dest: &PeerEndpoint) -> String {
        format!("https://{}{}", dest.url_authority(), self.service_path)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeState {
    Created,
    Configured,
    Started,
    Closed,
}

enum Lifecycle {
    Created,
    Configured(Arc<TransportSettings>),
    Started {
        settings: Arc<TransportSettings>,
        client: Arc<dyn HttpClient>,
        runtime: Handle,
    },
    Closed,
}

/// Send and receive counters.
#[derive(Debug, Default)]
pub struct TransportStats {
    messages_sent: AtomicU64,
    send_completed: AtomicU64,
    connect_failures: AtomicU64,
    timeout_failures: AtomicU64,
    other_failures: AtomicU64,
    messages_received: AtomicU64,
    bytes_received: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub messages_sent: u64,
    pub send_completed: u64,
    pub connect_failures: u64,
    pub timeout_failures: u64,
    pub other_failures: u64,
    pub messages_received: u64,
    pub bytes_received: u64,
}

impl TransportStats {
    fn record(&self, result: &SendResult) {
        let counter = match &result.failure {
            None => &self.send_completed,
            Some(SendError::Connect(_)) => &self.connect_failures,
            Some(SendError::Timeout(_)) => &self.timeout_failures,
            Some(SendError::Other(_)) => &self.other_failures,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            messages_sent: self.messages_sent.load(Ordering::Relaxed),
            send_completed: self.send_completed.load(Ordering::Relaxed),
            connect_failures: self.connect_failures.load(Ordering::Relaxed),
            timeout_failures: self.timeout_failures.load(Ordering::Relaxed),
            other_failures: self.other_failures.load(Ordering::Relaxed),
            messages_received: self.messages_received.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
        }
    }
}

/// HTTPS transport node. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct HttpTransport {
    inner: Arc<Inner>,
}

struct Inner {
    local_id: NodeId,
    lifecycle: Mutex<Lifecycle>,
    client_override: Option<Arc<dyn HttpClient>>,
    addresses: Mutex<HashMap<NodeId, PeerEndpoint>>,
    who_has: Mutex<ExpiringSet<NodeId>>,
    members: Mutex<Vec<NodeId>>,
    up: RwLock<Option<Arc<dyn UpHandler>>>,
    lookup: RwLock<Option<Arc<dyn AddressLookup>>>,
    stats: Arc<TransportStats>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

impl HttpTransport {
    pub fn new(local_id: NodeId) -> Self {
        Self::build(local_id, None)
    }

    /// Use `client` instead of creating one from the configured kind.
    pub fn with_client(local_id: NodeId, client: Arc<dyn HttpClient>) -> Self {
        Self::build(local_id, Some(client))
    }

    fn build(local_id: NodeId, client_override: Option<Arc<dyn HttpClient>>) -> Self {
        Self {
            inner: Arc::new(Inner {
                local_id,
                lifecycle: Mutex::new(Lifecycle::Created),
                client_override,
                addresses: Mutex::new(HashMap::new()),
                who_has: Mutex::new(ExpiringSet::new(
                    grouphttp_core::who_has::DEFAULT_WHO_HAS_TIMEOUT,
                )),
                members: Mutex::new(Vec::new()),
                up: RwLock::new(None),
                lookup: RwLock::new(None),
                stats: Arc::new(TransportStats::default()),
            }),
        }
    }

    pub fn local_id(&self) -> NodeId {
        self.inner.local_id
    }

    pub fn state(&self) -> NodeState {
        match &*lock(&self.inner.lifecycle) {
            Lifecycle::Created => NodeState::Created,
            Lifecycle::Configured(_) => NodeState::Configured,
            Lifecycle::Started { .. } => NodeState::Started,
            Lifecycle::Closed => NodeState::Closed,
        }
    }

    /// Validate and store settings. Allowed until `start`.
    pub fn configure(&self, settings: TransportSettings) -> Result<(), TransportError> {
        validate_service_path(&settings.service_path)?;
        if settings.local_endpoint.port() == 0 {
            return Err(TransportError::Configuration(format!(
                "local endpoint {} has no port",
                settings.local_endpoint
            )));
        }
        let mut lifecycle = lock(&self.inner.lifecycle);
        match &*lifecycle {
            Lifecycle::Created | Lifecycle::Configured(_) => {}
            Lifecycle::Started { .. } => return Err(TransportError::AlreadyStarted),
            Lifecycle::Closed => return Err(TransportError::Closed),
        }
        *lock(&self.inner.who_has) = ExpiringSet::new(settings.who_has_timeout);
        *lifecycle = Lifecycle::Configured(Arc::new(settings));
        Ok(())
    }

    pub fn settings(&self) -> Option<Arc<TransportSettings>> {
        match &*lock(&self.inner.lifecycle) {
            Lifecycle::Configured(s) | Lifecycle::Started { settings: s, .. } => Some(s.clone()),
            _ => None,
        }
    }

    pub fn local_endpoint(&self) -> Option<PeerEndpoint> {
        self.settings().map(|s| s.local_endpoint.clone())
    }

    pub fn set_up_handler(&self, handler: Arc<dyn UpHandler>) {
        *self.inner.up.write().unwrap_or_else(|e| e.into_inner()) = Some(handler);
    }

    pub fn set_address_lookup(&self, lookup: Arc<dyn AddressLookup>) {
        *self.inner.lookup.write().unwrap_or_else(|e| e.into_inner()) = Some(lookup);
    }

    fn started(&self) -> Result<(Arc<TransportSettings>, Arc<dyn HttpClient>, Handle), TransportError> {
        match &*lock(&self.inner.lifecycle) {
            Lifecycle::Started {
                settings,
                client,
                runtime,
            } => Ok((settings.clone(), client.clone(), runtime.clone())),
            _ => Err(TransportError::NotStarted),
        }
    }

    /// Start the client. On failure the node is closed and a close error, if any, is
    /// attached to the start error.
    pub fn start(&self) -> Result<(), TransportError> {
        let mut lifecycle = lock(&self.inner.lifecycle);
        let settings = match &*lifecycle {
            Lifecycle::Configured(s) => s.clone(),
            Lifecycle::Created => return Err(TransportError::NotConfigured),
            Lifecycle::Started { .. } => return Err(TransportError::AlreadyStarted),
            Lifecycle::Closed => return Err(TransportError::Closed),
        };
        let client = self
            .inner
            .client_override
            .clone()
            .unwrap_or_else(|| new_client(settings.client_kind));
        let started = client
            .configure(&settings.client_options)
            .and_then(|_| client.start())
            .and_then(|_| Handle::try_current().map_err(|_| ClientError::NoRuntime));
        match started {
            Ok(runtime) => {
                tracing::info!(
                    "transport {} started on {} ({:?} client)",
                    self.inner.local_id,
                    settings.local_endpoint,
                    settings.client_kind
                );
                *lifecycle = Lifecycle::Started {
                    settings,
                    client,
                    runtime,
                };
                Ok(())
            }
            Err(source) => {
                let suppressed = client.close().err();
                *lifecycle = Lifecycle::Closed;
                Err(TransportError::Start { source, suppressed })
            }
        }
    }

    /// Close the client. Safe to call repeatedly; in-flight sends are not cancelled.
    pub fn destroy(&self) {
        let previous = std::mem::replace(&mut *lock(&self.inner.lifecycle), Lifecycle::Closed);
        if let Lifecycle::Started { client, .. } = previous {
            if let Err(e) = client.close() {
                tracing::warn!("closing client failed: {}", e);
            }
            tracing::info!("transport {} closed", self.inner.local_id);
        }
    }

    /// Send with a custom completion listener. The slice is copied before this returns.
    pub fn send_unicast_with(
        &self,
        dest: &PeerEndpoint,
        data: &[u8],
        offset: usize,
        length: usize,
        listener: impl FnOnce(SendResult) + Send + 'static,
    ) -> Result<(), TransportError> {
        let (settings, client, _) = self.started()?;
        let content = BytesContent::new(MESSAGE_CONTENT_TYPE, data, offset, length)?;
        let request = client
            .new_request(&settings.service_url(dest))?
            .method("POST")
            .header(SENDER_HEADER, settings.local_endpoint.to_string())
            .content(Arc::new(content));
        let stats = self.inner.stats.clone();
        stats.messages_sent.fetch_add(1, Ordering::Relaxed);
        request.send_with(move |result| {
            stats.record(&result);
            listener(result);
        });
        Ok(())
    }

    /// Like `send_unicast`, and also returns the completion.
    pub fn send_unicast_tracked(
        &self,
        dest: &PeerEndpoint,
        data: &[u8],
        offset: usize,
        length: usize,
    ) -> Result<SendHandle, TransportError> {
        let (tx, rx) = oneshot::channel();
        let d = dest.clone();
        self.send_unicast_with(dest, data, offset, length, move |result| {
            log_completion(&d, &result);
            let _ = tx.send(result);
        })?;
        Ok(SendHandle::from_receiver(rx))
    }

    /// Tracked unicast to every other member with a cached address. Members without one
    /// are skipped.
    pub fn send_to_members_tracked(&self, data: &[u8]) -> Result<Vec<(NodeId, SendHandle)>, TransportError> {
        self.started()?;
        let local = self.inner.local_id;
        let mut handles = Vec::new();
        for member in self.members().into_iter().filter(|m| *m != local) {
            match self.cached_address(&member) {
                Some(ep) => match self.send_unicast_tracked(&ep, data, 0, data.len()) {
                    Ok(handle) => handles.push((member, handle)),
                    Err(e) => tracing::debug!("send to {} skipped: {}", member, e),
                },
                None => tracing::debug!("send to {} skipped: address unknown", member),
            }
        }
        Ok(handles)
    }

    fn send_bytes(&self, dest: &PeerEndpoint, data: &[u8]) -> Result<(), TransportError> {
        let d = dest.clone();
        self.send_unicast_with(dest, data, 0, data.len(), move |result| {
            log_completion(&d, &result)
        })
    }

    pub fn add_physical_address(&self, node: NodeId, endpoint: PeerEndpoint) {
        lock(&self.inner.who_has).remove(&node);
        let previous = lock(&self.inner.addresses).insert(node, endpoint.clone());
        if previous.as_ref() != Some(&endpoint) {
            tracing::debug!("{} is at {}", node, endpoint);
        }
    }

    pub fn remove_physical_address(&self, node: &NodeId) -> Option<PeerEndpoint> {
        lock(&self.inner.addresses).remove(node)
    }

    pub fn cached_address(&self, node: &NodeId) -> Option<PeerEndpoint> {
        lock(&self.inner.addresses).get(node).cloned()
    }

    pub fn set_members(&self, members: Vec<NodeId>) {
        *lock(&self.inner.members) = members;
    }

    pub fn members(&self) -> Vec<NodeId> {
        lock(&self.inner.members).clone()
    }

    /// Inbound body from the receiver.
    pub fn receive(&self, sender: PeerEndpoint, payload: Bytes) {
        let stats = &self.inner.stats;
        stats.messages_received.fetch_add(1, Ordering::Relaxed);
        stats
            .bytes_received
            .fetch_add(payload.len() as u64, Ordering::Relaxed);
        let handler = self
            .inner
            .up
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        match handler {
            Some(h) => h.up(sender, payload),
            None => tracing::debug!("dropping {} bytes from {}: no handler", payload.len(), sender),
        }
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.inner.stats.snapshot()
    }

    async fn lookup_address(&self, node: NodeId) -> Option<PeerEndpoint> {
        if let Some(ep) = self.cached_address(&node) {
            return Some(ep);
        }
        let lookup = self
            .inner
            .lookup
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        let Some(lookup) = lookup else {
            tracing::debug!("no address lookup registered for {}", node);
            return None;
        };
        {
            let now = Instant::now();
            let mut who_has = lock(&self.inner.who_has);
            who_has.purge(now);
            if !who_has.add_if_absent(node, now) {
                tracing::trace!("lookup for {} already pending", node);
                return None;
            }
        }
        let timeout = self
            .settings()
            .map(|s| s.fetch_timeout)
            .unwrap_or(Duration::from_millis(3000));
        let found = lookup.fetch(node, timeout).await;
        match &found {
            Some(ep) => self.add_physical_address(node, ep.clone()),
            None => tracing::debug!("no physical address found for {}", node),
        }
        found
    }
}

impl Transport for HttpTransport {
    fn start(&self) -> Result<(), TransportError> {
        HttpTransport::start(self)
    }

    fn stop(&self) {
        self.destroy()
    }

    fn send_unicast(
        &self,
        dest: &PeerEndpoint,
        data: &[u8],
        offset: usize,
        length: usize,
    ) -> Result<(), TransportError> {
        let d = dest.clone();
        self.send_unicast_with(dest, data, offset, length, move |result| {
            log_completion(&d, &result)
        })
    }

    /// One unicast per member other than self. Members without a cached address are
    /// looked up first, off the caller's thread.
    fn send_multicast(&self, data: &[u8], offset: usize, length: usize) -> Result<(), TransportError> {
        let (_, _, runtime) = self.started()?;
        let payload = BytesContent::new(MESSAGE_CONTENT_TYPE, data, offset, length)?
            .bytes()
            .clone();
        let local = self.inner.local_id;
        for member in self.members().into_iter().filter(|m| *m != local) {
            match self.cached_address(&member) {
                Some(ep) => {
                    if let Err(e) = self.send_bytes(&ep, &payload) {
                        tracing::debug!("multicast to {} skipped: {}", member, e);
                    }
                }
                None => {
                    let this = self.clone();
                    let payload = payload.clone();
                    runtime.spawn(async move {
                        match this.lookup_address(member).await {
                            Some(ep) => {
                                if let Err(e) = this.send_bytes(&ep, &payload) {
                                    tracing::debug!("multicast to {} skipped: {}", member, e);
                                }
                            }
                            None => tracing::debug!("multicast to {} dropped: address unknown", member),
                        }
                    });
                }
            }
        }
        Ok(())
    }

    fn supports_multicast(&self) -> bool {
        false
    }

    fn physical_address(&self, node: NodeId) -> impl Future<Output = Option<PeerEndpoint>> + Send {
        let this = self.clone();
        async move { this.lookup_address(node).await }
    }
}

/// Success at debug; expected network failures at info; everything else at warn.
fn log_completion(dest: &PeerEndpoint, result: &SendResult) {
    match &result.failure {
        None => tracing::debug!(
            "sent to {}: status {}",
            dest,
            result.response.map(|r| r.status).unwrap_or_default()
        ),
        Some(SendError::Connect(d)) => tracing::info!("cannot connect to {}: {}", dest, d),
        Some(SendError::Timeout(d)) => tracing::info!("send to {} timed out: {}", dest, d),
        Some(SendError::Other(d)) => tracing::warn!("send to {} failed: {}", dest, d),
    }
}

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("configuration error: {0}")]
    Configuration(String),
    #[error("transport not configured")]
    NotConfigured,
    #[error("transport not started")]
    NotStarted,
    #[error("transport already started")]
    AlreadyStarted,
    #[error("transport closed")]
    Closed,
    /// `suppressed` is the failure of the cleanup close, if it failed too.
    #[error("transport start failed: {source}")]
    Start {
        #[source]
        source: ClientError,
        suppressed: Option<ClientError>,
    },
    #[error(transparent)]
    Client(#[from] ClientError),
    #[error(transparent)]
    Content(#[from] ContentError),
}

impl From<ConfigError> for TransportError {
    fn from(e: ConfigError) -> Self {
        TransportError::Configuration(e.to_string())
    }
}
