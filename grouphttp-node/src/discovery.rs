//! Discovery over the transport: probes every known candidate endpoint with a
//! `DiscoveryRequest`, answers probes, and folds responses into the candidate cache
//! and the transport's physical-address cache.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock, Weak};
use std::time::Duration;

use futures::future::BoxFuture;
use futures::FutureExt;
use grouphttp_core::wire::encode_frame;
use grouphttp_core::{
    CandidateSet, EndpointSpec, FrameEncodeError, HostPart, Message, NodeId, PeerEndpoint, PingData,
};
use tokio::sync::mpsc;

use crate::client::SendError;
use crate::config::Config;
use crate::transport::{AddressLookup, HttpTransport, TransportError};

/// Discovery capability, independent of any membership framework.
pub trait Discovery {
    /// Probe all candidates; answers arrive on `responses`.
    fn find_members(
        &self,
        known: &[NodeId],
        initial: bool,
        responses: Responses,
    ) -> Result<(), DiscoveryError>;
    fn on_discovery_response(&self, data: PingData);
    /// Physical address of one member, or `None` if nobody answers within `timeout`.
    fn fetch(&self, node: NodeId, timeout: Duration) -> impl Future<Output = Option<PeerEndpoint>> + Send;
    /// False: the seed list never changes; only the dynamic cache does.
    fn is_dynamic(&self) -> bool;
}

/// Extra probe targets supplied from outside (e.g. a persistent member cache).
pub trait CandidateSource: Send + Sync {
    fn candidates(&self) -> Vec<PeerEndpoint>;
}

impl CandidateSource for Vec<PeerEndpoint> {
    fn candidates(&self) -> Vec<PeerEndpoint> {
        self.clone()
    }
}

/// Sink for discovery responses. Dropping the receiver unregisters the sink.
#[derive(Debug, Clone)]
pub struct Responses {
    tx: mpsc::UnboundedSender<PingData>,
}

impl Responses {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<PingData>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    fn deliver(&self, data: PingData) -> bool {
        self.tx.send(data).is_ok()
    }

    fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

#[derive(Debug, Clone)]
pub struct PingSettings {
    pub cluster: String,
    /// Logical name carried in ping data.
    pub name: Option<String>,
    pub max_dynamic_hosts: usize,
    pub max_members_in_discovery_request: usize,
    pub separate_task_per_request: bool,
}

impl PingSettings {
    pub fn new(cluster: impl Into<String>) -> Self {
        Self {
            cluster: cluster.into(),
            name: None,
            max_dynamic_hosts: grouphttp_core::candidates::DEFAULT_MAX_DYNAMIC_HOSTS,
            max_members_in_discovery_request: 500,
            separate_task_per_request: false,
        }
    }

    pub fn from_config(cfg: &Config) -> Self {
        Self {
            cluster: cfg.cluster_name.clone(),
            name: None,
            max_dynamic_hosts: cfg.discovery.max_dynamic_hosts,
            max_members_in_discovery_request: cfg.discovery.max_members_in_discovery_request,
            separate_task_per_request: cfg.discovery.async_discovery_use_separate_task_per_request,
        }
    }
}

/// HTTP ping discovery. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct HttpPing {
    inner: Arc<PingInner>,
}

struct PingInner {
    settings: PingSettings,
    transport: HttpTransport,
    candidates: Mutex<CandidateSet>,
    persistent: RwLock<Option<Arc<dyn CandidateSource>>>,
    sinks: Mutex<Vec<Responses>>,
    coordinator: AtomicBool,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

impl HttpPing {
    /// Create discovery over `transport` and register it as the transport's address lookup.
    pub fn new(settings: PingSettings, seeds: Vec<PeerEndpoint>, transport: HttpTransport) -> Self {
        let candidates = CandidateSet::new(seeds, settings.max_dynamic_hosts);
        let inner = Arc::new(PingInner {
            settings,
            transport: transport.clone(),
            candidates: Mutex::new(candidates),
            persistent: RwLock::new(None),
            sinks: Mutex::new(Vec::new()),
            coordinator: AtomicBool::new(false),
        });
        transport.set_address_lookup(Arc::new(WeakLookup(Arc::downgrade(&inner))));
        Self { inner }
    }

    pub fn set_persistent_source(&self, source: Arc<dyn CandidateSource>) {
        *self.inner.persistent.write().unwrap_or_else(|e| e.into_inner()) = Some(source);
    }

    pub fn set_coordinator(&self, coordinator: bool) {
        self.inner.coordinator.store(coordinator, Ordering::Relaxed);
    }

    pub fn seeds(&self) -> Vec<PeerEndpoint> {
        lock(&self.inner.candidates).seeds().to_vec()
    }

    /// Learned endpoints, in insertion order.
    pub fn dynamic_host_list(&self) -> Vec<PeerEndpoint> {
        lock(&self.inner.candidates).dynamic().iter().cloned().collect()
    }

    pub fn clear_dynamic_host_list(&self) {
        lock(&self.inner.candidates).clear_dynamic();
    }

    /// Current probe targets, local endpoint excluded.
    pub fn candidates(&self) -> Vec<PeerEndpoint> {
        let external = self
            .inner
            .persistent
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
            .map(|s| s.candidates())
            .unwrap_or_default();
        let local = self.inner.transport.local_endpoint();
        lock(&self.inner.candidates)
            .candidates(&external)
            .into_iter()
            .filter(|e| Some(e) != local.as_ref())
            .collect()
    }

    /// Add a non-seed endpoint to the dynamic cache. No-op when known or full.
    fn learn(&self, endpoint: &PeerEndpoint) {
        if Some(endpoint) == self.inner.transport.local_endpoint().as_ref() {
            return;
        }
        if lock(&self.inner.candidates).learn(endpoint.clone()) {
            tracing::debug!("learned candidate {}", endpoint);
        }
    }

    pub fn on_view_change(&self, endpoints: &[PeerEndpoint]) {
        for ep in endpoints {
            self.learn(ep);
        }
    }

    pub fn on_add_physical_address(&self, endpoint: &PeerEndpoint) {
        self.learn(endpoint);
    }

    fn local_ping(&self, initial: bool, members: Option<Vec<NodeId>>) -> Result<PingData, DiscoveryError> {
        let physical = self
            .inner
            .transport
            .local_endpoint()
            .ok_or(DiscoveryError::NotConfigured)?;
        Ok(PingData {
            sender: self.inner.transport.local_id(),
            cluster: self.inner.settings.cluster.clone(),
            physical,
            coordinator: self.inner.coordinator.load(Ordering::Relaxed),
            initial,
            members,
            name: self.inner.settings.name.clone(),
        })
    }

    fn register(&self, responses: Responses) {
        let mut sinks = lock(&self.inner.sinks);
        sinks.retain(|s| !s.is_closed());
        sinks.push(responses);
    }

    fn send_request(&self, data: PingData) -> Result<(), DiscoveryError> {
        let frame = Arc::new(encode_frame(&Message::DiscoveryRequest(data))?);
        let targets = self.candidates();
        tracing::debug!("sending discovery request to {} candidates", targets.len());
        let spawn = self.inner.settings.separate_task_per_request;
        for target in targets {
            let transport = self.inner.transport.clone();
            let frame = frame.clone();
            match tokio::runtime::Handle::try_current() {
                Ok(rt) if spawn => {
                    rt.spawn(async move { probe(&transport, target, &frame) });
                }
                _ => probe(&transport, target, &frame),
            }
        }
        Ok(())
    }

    /// Ask the candidates for `node` only and wait for its answer.
    async fn fetch_address(&self, node: NodeId, timeout: Duration) -> Option<PeerEndpoint> {
        let (sink, mut rx) = Responses::channel();
        let sent = self.local_ping(false, Some(vec![node])).and_then(|data| {
            self.register(sink);
            self.send_request(data)
        });
        if let Err(e) = sent {
            tracing::trace!("fetch {}: {}", node, e);
            return None;
        }
        let wait = async {
            while let Some(d) = rx.recv().await {
                if d.sender == node {
                    return Some(d.physical);
                }
            }
            None
        };
        tokio::time::timeout(timeout, wait).await.ok().flatten()
    }

    /// Record the requester and answer it if the request is addressed to us.
    pub fn on_discovery_request(&self, data: PingData) {
        let local_id = self.inner.transport.local_id();
        if data.cluster != self.inner.settings.cluster {
            tracing::debug!(
                "ignoring discovery request from {} for cluster {}",
                data.physical,
                data.cluster
            );
            return;
        }
        if data.sender == local_id {
            return;
        }
        self.learn(&data.physical);
        self.inner
            .transport
            .add_physical_address(data.sender, data.physical.clone());
        if !data.addressed_to(&local_id) {
            return;
        }
        let reply = self
            .local_ping(false, None)
            .and_then(|d| Ok(encode_frame(&Message::DiscoveryResponse(d))?));
        match reply {
            Ok(frame) => probe(&self.inner.transport, data.physical, &frame),
            Err(e) => tracing::trace!("cannot answer discovery request: {}", e),
        }
    }
}

/// Send one probe or answer; failures are logged at trace and otherwise ignored.
fn probe(transport: &HttpTransport, target: PeerEndpoint, frame: &[u8]) {
    let to = target.clone();
    let sent = transport.send_unicast_with(&target, frame, 0, frame.len(), move |result| {
        if let Some(source) = result.failure {
            tracing::trace!("{}", DiscoveryError::Probe { target: to, source });
        }
    });
    if let Err(e) = sent {
        tracing::trace!("{}", DiscoveryError::Transport(e));
    }
}

impl Discovery for HttpPing {
    fn find_members(
        &self,
        known: &[NodeId],
        initial: bool,
        responses: Responses,
    ) -> Result<(), DiscoveryError> {
        let members = (known.len() <= self.inner.settings.max_members_in_discovery_request)
            .then(|| known.to_vec());
        let data = self.local_ping(initial, members)?;
        self.register(responses);
        self.send_request(data)
    }

    fn on_discovery_response(&self, data: PingData) {
        if data.cluster != self.inner.settings.cluster || data.sender == self.inner.transport.local_id() {
            return;
        }
        self.learn(&data.physical);
        self.inner
            .transport
            .add_physical_address(data.sender, data.physical.clone());
        lock(&self.inner.sinks).retain(|s| s.deliver(data.clone()));
    }

    fn fetch(&self, node: NodeId, timeout: Duration) -> impl Future<Output = Option<PeerEndpoint>> + Send {
        let this = self.clone();
        async move { this.fetch_address(node, timeout).await }
    }

    fn is_dynamic(&self) -> bool {
        false
    }
}

/// Address lookup that does not keep discovery alive.
struct WeakLookup(Weak<PingInner>);

impl AddressLookup for WeakLookup {
    fn fetch(&self, node: NodeId, timeout: Duration) -> BoxFuture<'static, Option<PeerEndpoint>> {
        match self.0.upgrade() {
            Some(inner) => async move { HttpPing { inner }.fetch_address(node, timeout).await }.boxed(),
            None => futures::future::ready(None).boxed(),
        }
    }
}

/// Parse a comma separated seed list. Host names are resolved (every address is kept);
/// a missing port means `default_port`. Bad entries are logged and skipped.
pub async fn resolve_initial_hosts(list: &str, default_port: u16) -> Vec<PeerEndpoint> {
    let mut out = Vec::new();
    for entry in list.split(',').map(str::trim).filter(|e| !e.is_empty()) {
        let spec = match EndpointSpec::parse(entry) {
            Ok(s) => s,
            Err(e) => {
                tracing::warn!("skipping initial host '{}': {}", entry, e);
                continue;
            }
        };
        let port = if spec.port == 0 { default_port } else { spec.port };
        match spec.host {
            HostPart::Ip { ip, scope_id } => {
                let mut ep = PeerEndpoint::new(ip, port).with_scope_id(scope_id);
                if let Some(h) = spec.hostname {
                    ep = ep.with_hostname(h);
                }
                out.push(ep);
            }
            HostPart::Name(name) => match tokio::net::lookup_host((name.as_str(), port)).await {
                Ok(addrs) => {
                    let label = spec.hostname.unwrap_or_else(|| name.clone());
                    out.extend(addrs.map(|a| {
                        let ep = PeerEndpoint::new(a.ip(), port).with_hostname(label.clone());
                        match a {
                            std::net::SocketAddr::V6(v6) => ep.with_scope_id(v6.scope_id()),
                            _ => ep,
                        }
                    }));
                }
                Err(e) => tracing::warn!("skipping initial host '{}': {}", entry, e),
            },
        }
    }
    out
}

#[derive(Debug, thiserror::Error)]
pub enum DiscoveryError {
    #[error("local endpoint unknown: transport not configured")]
    NotConfigured,
    #[error("encode discovery message: {0}")]
    Encode(#[from] FrameEncodeError),
    #[error("discovery send: {0}")]
    Transport(#[from] TransportError),
    #[error("discovery probe to {target} failed: {source}")]
    Probe {
        target: PeerEndpoint,
        source: SendError,
    },
}
