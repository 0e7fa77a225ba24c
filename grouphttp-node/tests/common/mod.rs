#![allow(dead_code)]

use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use grouphttp_core::{NodeId, PeerEndpoint};
use grouphttp_node::client::ClientOptions;
use grouphttp_node::config::Config;
use grouphttp_node::server::{Receiver, ReceiverServer};
use grouphttp_node::tls;
use grouphttp_node::transport::{HttpTransport, TransportSettings, UpHandler};

pub fn fixtures() -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("tests/fixtures")
}

/// Loopback node config trusting the fixture CA; the port is picked at bind time.
pub fn node_config(cluster: &str, seeds: &str) -> Config {
    let mut c = Config::default();
    c.cluster_name = cluster.to_string();
    c.bind_addr = "127.0.0.1:0".parse().unwrap();
    c.external_addr = "localhost/127.0.0.1:0".to_string();
    c.resource_root = fixtures();
    c.server.key_store = Some("classpath:node.pem".to_string());
    c.client.trust_store = Some("classpath:ca.pem".to_string());
    c.discovery.initial_ping_addresses = seeds.to_string();
    c.discovery.join_timeout = Duration::from_millis(1500);
    c
}

pub fn trusting_options() -> ClientOptions {
    ClientOptions {
        trust_store: Some("classpath:ca.pem".to_string()),
        resource_root: fixtures(),
        ..ClientOptions::default()
    }
}

/// Collects everything delivered upward.
#[derive(Default)]
pub struct Sink(pub Mutex<Vec<(PeerEndpoint, Bytes)>>);

impl Sink {
    pub fn len(&self) -> usize {
        self.0.lock().unwrap().len()
    }
}

impl UpHandler for Sink {
    fn up(&self, sender: PeerEndpoint, payload: Bytes) {
        self.0.lock().unwrap().push((sender, payload));
    }
}

/// Bare receiver on loopback backed by a transport that only collects.
pub async fn receiving_node(max: usize) -> (ReceiverServer, Arc<Sink>) {
    let transport = HttpTransport::new(NodeId::random());
    let sink = Arc::new(Sink::default());
    transport.set_up_handler(sink.clone());
    let identity = tls::load_identity("classpath:node.pem", &fixtures(), tls::KeyPasswords::default()).unwrap();
    let server_tls = tls::server_config(&identity).unwrap();
    let server = ReceiverServer::bind(
        "127.0.0.1:0".parse().unwrap(),
        server_tls,
        Receiver::new(transport, "/jgroups", max),
    )
    .await
    .unwrap();
    (server, sink)
}

/// Started sending transport advertising `localhost/127.0.0.1:<port>`.
pub fn sending_transport(port: u16) -> HttpTransport {
    let transport = HttpTransport::new(NodeId::random());
    let local: PeerEndpoint = format!("localhost/127.0.0.1:{}", port).parse().unwrap();
    let mut settings = TransportSettings::new(local);
    settings.client_options = trusting_options();
    transport.configure(settings).unwrap();
    transport.start().unwrap();
    transport
}

pub fn endpoint_of(server: &ReceiverServer) -> PeerEndpoint {
    format!("127.0.0.1:{}", server.local_addr().port()).parse().unwrap()
}

/// A loopback port that was free a moment ago.
pub fn free_port() -> u16 {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().port()
}

/// A loopback port with nothing listening on it.
pub fn dead_endpoint() -> PeerEndpoint {
    format!("127.0.0.1:{}", free_port()).parse().unwrap()
}

/// `node_config` bound to a fixed loopback port.
pub fn node_config_on(cluster: &str, port: u16, seeds: &str) -> Config {
    let mut c = node_config(cluster, seeds);
    c.bind_addr = format!("127.0.0.1:{}", port).parse().unwrap();
    c.external_addr = format!("localhost/127.0.0.1:{}", port);
    c
}

/// A loopback listener that accepts connections and never answers.
pub async fn silent_endpoint() -> (PeerEndpoint, tokio::task::JoinHandle<()>) {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let task = tokio::spawn(async move {
        let mut held = Vec::new();
        while let Ok((stream, _)) = listener.accept().await {
            held.push(stream);
        }
    });
    (format!("127.0.0.1:{}", port).parse().unwrap(), task)
}

/// Poll `cond` every 20 ms for up to five seconds.
pub async fn eventually(mut cond: impl FnMut() -> bool) -> bool {
    for _ in 0..250 {
        if cond() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    cond()
}
