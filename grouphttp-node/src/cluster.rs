//! Cluster adapter: wires a transport, discovery and a receiver into one node with a
//! minimal membership (every node that has answered or probed us, until it leaves).

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use bytes::Bytes;
use futures::future::join_all;
use grouphttp_core::wire::{decode_frame, encode_frame};
use grouphttp_core::{FrameDecodeError, FrameEncodeError, Message, NodeId, PeerEndpoint, PingData};
use tokio::runtime::Handle;
use tokio::sync::{mpsc, oneshot};

use crate::client::SendHandle;
use crate::config::{Config, ConfigError};
use crate::discovery::{resolve_initial_hosts, Discovery, DiscoveryError, HttpPing, PingSettings, Responses};
use crate::server::{Receiver, ReceiverServer};
use crate::tls::{self, TlsError};
use crate::transport::{HttpTransport, Transport, TransportError, TransportSettings, UpHandler};

/// Upper bound on waiting for leave announcements in `disconnect`.
pub const LEAVE_WAIT: Duration = Duration::from_secs(2);

/// Application payload delivered by a peer.
#[derive(Debug, Clone)]
pub struct Delivered {
    pub sender: NodeId,
    /// Endpoint the sender advertised in `X-Sender`.
    pub endpoint: PeerEndpoint,
    pub payload: Bytes,
}

/// A running node. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct Cluster {
    inner: Arc<ClusterInner>,
}

struct ClusterInner {
    config: Config,
    transport: HttpTransport,
    ping: HttpPing,
    server: ReceiverServer,
    members: Mutex<BTreeMap<NodeId, PeerEndpoint>>,
    deliver: mpsc::UnboundedSender<Delivered>,
    connected: AtomicBool,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

impl Cluster {
    /// Bind the receiver, start the transport and return the node with its delivery queue.
    /// An `external_addr` port of 0 is replaced by the bound port.
    pub async fn start(config: Config) -> Result<(Self, mpsc::UnboundedReceiver<Delivered>), ClusterError> {
        config.validate()?;
        let key_store = config
            .server
            .key_store
            .as_deref()
            .ok_or(ClusterError::MissingServerKeyStore)?;
        let passwords = tls::KeyPasswords::new(
            config.server.key_store_password.as_deref(),
            config.server.key_password.as_deref(),
        );
        let identity = tls::load_identity(key_store, &config.resource_root, passwords)?;
        let server_tls = tls::server_config(&identity)?;

        let transport = HttpTransport::new(NodeId::random());
        let receiver = Receiver::new(transport.clone(), &config.service_path, config.max_content_length()?);
        let server = ReceiverServer::bind(config.bind_addr, server_tls, receiver)
            .await
            .map_err(|source| ClusterError::Bind {
                addr: config.bind_addr,
                source,
            })?;

        let mut settings = TransportSettings::from_config(&config)?;
        if settings.local_endpoint.port() == 0 {
            settings.local_endpoint = with_port(&settings.local_endpoint, server.local_addr().port());
        }
        let local = settings.local_endpoint.clone();
        transport.configure(settings)?;

        let seeds = resolve_initial_hosts(&config.discovery.initial_ping_addresses, local.port()).await;
        let ping = HttpPing::new(PingSettings::from_config(&config), seeds, transport.clone());

        let (deliver, rx) = mpsc::unbounded_channel();
        let mut members = BTreeMap::new();
        members.insert(transport.local_id(), local);
        let inner = Arc::new(ClusterInner {
            config,
            transport: transport.clone(),
            ping,
            server,
            members: Mutex::new(members),
            deliver,
            connected: AtomicBool::new(false),
        });
        transport.set_up_handler(Arc::new(Dispatch(Arc::downgrade(&inner))));
        let cluster = Self { inner };
        cluster.publish_view();
        transport.start()?;
        Ok((cluster, rx))
    }

    pub fn local_id(&self) -> NodeId {
        self.inner.transport.local_id()
    }

    pub fn local_endpoint(&self) -> Option<PeerEndpoint> {
        self.inner.transport.local_endpoint()
    }

    pub fn transport(&self) -> &HttpTransport {
        &self.inner.transport
    }

    pub fn discovery(&self) -> &HttpPing {
        &self.inner.ping
    }

    pub fn server(&self) -> &ReceiverServer {
        &self.inner.server
    }

    /// Current members, including this node, in id order.
    pub fn members(&self) -> Vec<NodeId> {
        lock(&self.inner.members).keys().copied().collect()
    }

    /// Probe every candidate once and collect answers for `discovery.join_timeout`.
    /// Runs on a dedicated `grouphttp-connect` thread; returns the number of peers that
    /// answered. Only the first call joins.
    pub async fn connect(&self) -> Result<usize, ClusterError> {
        if self.inner.connected.swap(true, Ordering::SeqCst) {
            return Err(ClusterError::AlreadyConnected);
        }
        let (tx, rx) = oneshot::channel();
        let this = self.clone();
        let runtime = Handle::current();
        std::thread::Builder::new()
            .name("grouphttp-connect".into())
            .spawn(move || {
                let _ = tx.send(runtime.block_on(this.join()));
            })
            .map_err(|e| ClusterError::ConnectThread(e.to_string()))?;
        let result = rx
            .await
            .unwrap_or_else(|_| Err(ClusterError::ConnectThread("connect thread exited".into())));
        if let Err(e) = &result {
            self.on_connect_error(e);
        }
        result
    }

    async fn join(&self) -> Result<usize, ClusterError> {
        let (responses, mut rx) = Responses::channel();
        // Empty member list: every node in the cluster answers.
        self.inner.ping.find_members(&[], true, responses)?;
        let timeout = self.inner.config.discovery.join_timeout;
        let mut answered = Vec::new();
        let collect = async {
            while let Some(data) = rx.recv().await {
                if !answered.contains(&data.sender) {
                    answered.push(data.sender);
                }
            }
        };
        let _ = tokio::time::timeout(timeout, collect).await;
        tracing::info!(
            "{} joined {} ({} peers answered)",
            self.local_id(),
            self.inner.config.cluster_name,
            answered.len()
        );
        Ok(answered.len())
    }

    fn on_connect_error(&self, err: &ClusterError) {
        tracing::warn!("{} failed to join {}: {}", self.local_id(), self.inner.config.cluster_name, err);
    }

    /// Send `payload` to one member. The returned handle completes with the send outcome.
    pub async fn send(&self, dest: NodeId, payload: &[u8]) -> Result<SendHandle, ClusterError> {
        let endpoint = self
            .inner
            .transport
            .physical_address(dest)
            .await
            .ok_or(ClusterError::UnknownMember(dest))?;
        let frame = encode_frame(&Message::Data {
            sender: self.local_id(),
            payload: payload.to_vec(),
        })?;
        Ok(self
            .inner
            .transport
            .send_unicast_tracked(&endpoint, &frame, 0, frame.len())?)
    }

    /// Send `payload` to every other member.
    pub fn broadcast(&self, payload: &[u8]) -> Result<(), ClusterError> {
        let frame = encode_frame(&Message::Data {
            sender: self.local_id(),
            payload: payload.to_vec(),
        })?;
        self.inner.transport.send_multicast(&frame, 0, frame.len())?;
        Ok(())
    }

    /// Announce departure, stop the receiver and close the transport. Waits up to
    /// `LEAVE_WAIT` for the announcements to complete.
    pub async fn disconnect(&self) {
        self.announce_leave().await;
        self.inner.server.shutdown();
        self.inner.transport.destroy();
    }

    async fn announce_leave(&self) {
        let frame = match encode_frame(&Message::Leave {
            sender: self.local_id(),
        }) {
            Ok(frame) => frame,
            Err(e) => {
                tracing::debug!("leave not announced: {}", e);
                return;
            }
        };
        let handles = match self.inner.transport.send_to_members_tracked(&frame) {
            Ok(handles) => handles,
            Err(e) => {
                tracing::debug!("leave not announced: {}", e);
                return;
            }
        };
        let sends = join_all(
            handles
                .into_iter()
                .map(|(member, handle)| async move { (member, handle.await) }),
        );
        match tokio::time::timeout(LEAVE_WAIT, sends).await {
            Ok(results) => {
                for (member, result) in results {
                    if let Some(e) = result.failure {
                        tracing::debug!("leave not delivered to {}: {}", member, e);
                    }
                }
            }
            Err(_) => tracing::debug!("leave announcements still pending after {:?}", LEAVE_WAIT),
        }
    }

    fn add_member(&self, data: &PingData) {
        let added = lock(&self.inner.members)
            .insert(data.sender, data.physical.clone())
            .is_none();
        if added {
            tracing::info!("{} joined the view of {}", data.sender, self.local_id());
            self.publish_view();
        }
    }

    fn remove_member(&self, node: NodeId) {
        if lock(&self.inner.members).remove(&node).is_some() {
            self.inner.transport.remove_physical_address(&node);
            tracing::info!("{} left the view of {}", node, self.local_id());
            self.publish_view();
        }
    }

    /// Push the member list to the transport and discovery; the smallest id coordinates.
    fn publish_view(&self) {
        let (ids, endpoints): (Vec<NodeId>, Vec<PeerEndpoint>) = lock(&self.inner.members)
            .iter()
            .map(|(id, ep)| (*id, ep.clone()))
            .unzip();
        self.inner
            .ping
            .set_coordinator(ids.first() == Some(&self.local_id()));
        self.inner.ping.on_view_change(&endpoints);
        self.inner.transport.set_members(ids);
    }

    fn dispatch(&self, endpoint: PeerEndpoint, body: Bytes) -> Result<(), FrameDecodeError> {
        let (message, _) = decode_frame(&body)?;
        match message {
            Message::DiscoveryRequest(data) => {
                if data.cluster == self.inner.config.cluster_name && data.sender != self.local_id() {
                    self.add_member(&data);
                }
                self.inner.ping.on_discovery_request(data);
            }
            Message::DiscoveryResponse(data) => {
                if data.cluster == self.inner.config.cluster_name && data.sender != self.local_id() {
                    self.add_member(&data);
                }
                self.inner.ping.on_discovery_response(data);
            }
            Message::Data { sender, payload } => {
                let delivered = Delivered {
                    sender,
                    endpoint,
                    payload: Bytes::from(payload),
                };
                if self.inner.deliver.send(delivered).is_err() {
                    tracing::debug!("dropping message from {}: no consumer", sender);
                }
            }
            Message::Leave { sender } => self.remove_member(sender),
        }
        Ok(())
    }
}

/// Upward handler that does not keep the cluster alive.
struct Dispatch(Weak<ClusterInner>);

impl UpHandler for Dispatch {
    fn up(&self, sender: PeerEndpoint, payload: Bytes) {
        let Some(inner) = self.0.upgrade() else {
            return;
        };
        if let Err(e) = (Cluster { inner }).dispatch(sender.clone(), payload) {
            tracing::warn!("undecodable message from {}: {}", sender, e);
        }
    }
}

fn with_port(ep: &PeerEndpoint, port: u16) -> PeerEndpoint {
    let out = PeerEndpoint::new(ep.ip(), port).with_scope_id(ep.scope_id());
    match ep.hostname() {
        Some(h) => out.with_hostname(h),
        None => out,
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ClusterError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("server.key_store is required")]
    MissingServerKeyStore,
    #[error(transparent)]
    Tls(#[from] TlsError),
    #[error("cannot bind {addr}: {source}")]
    Bind {
        addr: std::net::SocketAddr,
        #[source]
        source: std::io::Error,
    },
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Discovery(#[from] DiscoveryError),
    #[error("encode message: {0}")]
    Encode(#[from] FrameEncodeError),
    #[error("no physical address for {0}")]
    UnknownMember(NodeId),
    #[error("already connected")]
    AlreadyConnected,
    #[error("connect thread: {0}")]
    ConnectThread(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn with_port_keeps_hostname() {
        let ep: PeerEndpoint = "localhost/127.0.0.1:0".parse().unwrap();
        let out = with_port(&ep, 7801);
        assert_eq!(out.port(), 7801);
        assert_eq!(out.hostname(), Some("localhost"));
        assert_eq!(out.to_string(), "localhost/127.0.0.1:7801");
    }

    #[tokio::test]
    async fn start_requires_server_key_store() {
        let mut config = Config::default();
        config.bind_addr = "127.0.0.1:0".parse().unwrap();
        let err = Cluster::start(config).await.err().unwrap();
        assert!(matches!(err, ClusterError::MissingServerKeyStore), "{}", err);
    }
}
