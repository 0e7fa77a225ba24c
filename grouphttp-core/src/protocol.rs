//! Cluster messages carried as transport payloads: discovery exchange, application data, leave.

use serde::{Deserialize, Serialize};

use crate::endpoint::PeerEndpoint;
use crate::identity::NodeId;

/// Current envelope version, written after the length prefix of every frame.
pub const PROTOCOL_VERSION: u8 = 1;

/// What a member says about itself in discovery requests and responses.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PingData {
    pub sender: NodeId,
    pub cluster: String,
    #[serde(with = "crate::wire::endpoint_serde")]
    pub physical: PeerEndpoint,
    /// Sender believes it is the coordinator of its view.
    pub coordinator: bool,
    /// Request sent during the initial join round.
    pub initial: bool,
    /// Members the requester is looking for. `None` or empty asks every receiver to answer.
    pub members: Option<Vec<NodeId>>,
    /// Logical name for logs.
    pub name: Option<String>,
}

impl PingData {
    /// Whether `local` should answer a request carrying this data.
    pub fn addressed_to(&self, local: &NodeId) -> bool {
        match &self.members {
            None => true,
            Some(m) if m.is_empty() => true,
            Some(m) => m.contains(local),
        }
    }
}

/// All message types. Encoding is bincode inside a versioned frame (see wire module).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Message {
    /// Discovery probe: identify yourself.
    DiscoveryRequest(PingData),
    /// Answer to a probe.
    DiscoveryResponse(PingData),
    /// Application payload.
    Data { sender: NodeId, payload: Vec<u8> },
    /// Graceful leave.
    Leave { sender: NodeId },
}

impl Message {
    pub fn sender(&self) -> NodeId {
        match self {
            Message::DiscoveryRequest(d) | Message::DiscoveryResponse(d) => d.sender,
            Message::Data { sender, .. } | Message::Leave { sender } => *sender,
        }
    }
}
