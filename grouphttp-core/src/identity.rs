//! Logical member identity: a cluster-wide node ID independent of network location.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Logical address of a cluster member (a random v4 UUID). Used as the key for
/// physical-address lookups and as the sender of protocol messages. Binary formats
/// carry the 16 raw bytes; human-readable ones the hyphenated form.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(Uuid);

impl NodeId {
    pub fn random() -> Self {
        NodeId(Uuid::new_v4())
    }

    pub fn from_bytes(bytes: [u8; 16]) -> Self {
        NodeId(Uuid::from_bytes(bytes))
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        self.0.as_bytes()
    }
}

impl std::fmt::Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0.hyphenated())
    }
}

impl std::str::FromStr for NodeId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(NodeId)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn random_ids_differ() {
        assert_ne!(NodeId::random(), NodeId::random());
    }

    #[test]
    fn display_parses_back() {
        let id = NodeId::random();
        let parsed: NodeId = id.to_string().parse().unwrap();
        assert_eq!(parsed, id);
    }

    #[test]
    fn bincode_carries_raw_bytes() {
        let id = NodeId::from_bytes([7u8; 16]);
        let bytes = bincode::serialize(&id).unwrap();
        assert_eq!(bytes.len(), 8 + 16);
        assert_eq!(&bytes[8..], id.as_bytes());
        let back: NodeId = bincode::deserialize(&bytes).unwrap();
        assert_eq!(back, id);
    }
}
