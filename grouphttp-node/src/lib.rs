//! grouphttp node: HTTPS point-to-point transport, HTTP ping discovery and the
//! streaming receiver, plus a small cluster adapter tying them together.

pub mod client;
pub mod cluster;
pub mod config;
pub mod discovery;
pub mod server;
pub mod tls;
pub mod transport;

pub use cluster::{Cluster, ClusterError, Delivered};
pub use config::{Config, ConfigError};
pub use discovery::{Discovery, HttpPing};
pub use transport::{HttpTransport, Transport};
