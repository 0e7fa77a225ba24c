//! Framing: length-prefix (4 bytes LE) + version byte + bincode payload.
//! Endpoints inside messages go through the address codec, tagged by [`AddressFormat`].

use crate::endpoint::{CodecError, PeerEndpoint};
use crate::protocol::{Message, PROTOCOL_VERSION};

const LEN_SIZE: usize = 4;
const VERSION_SIZE: usize = 1;
const MAX_FRAME_LEN: u32 = 16 * 1024 * 1024; // 16 MiB

/// Serialization formats for endpoints embedded in messages. The tag is written before the bytes;
/// new formats get new tags and old tags stay decodable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum AddressFormat {
    /// Hostname + IP + scope + port, big-endian (see `endpoint`).
    HostV1 = 1,
}

impl AddressFormat {
    /// Format used for encoding.
    pub const CURRENT: AddressFormat = AddressFormat::HostV1;

    pub fn tag(self) -> u8 {
        self as u8
    }

    pub fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            1 => Some(AddressFormat::HostV1),
            _ => None,
        }
    }

    pub fn encode(self, endpoint: &PeerEndpoint) -> Vec<u8> {
        match self {
            AddressFormat::HostV1 => endpoint.to_bytes(),
        }
    }

    pub fn decode(self, bytes: &[u8]) -> Result<PeerEndpoint, CodecError> {
        match self {
            AddressFormat::HostV1 => PeerEndpoint::from_bytes(bytes),
        }
    }
}

/// Serde adapter: `(tag, codec bytes)`.
pub mod endpoint_serde {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    use super::AddressFormat;
    use crate::endpoint::PeerEndpoint;

    pub fn serialize<S: Serializer>(ep: &PeerEndpoint, serializer: S) -> Result<S::Ok, S::Error> {
        let format = AddressFormat::CURRENT;
        (format.tag(), format.encode(ep)).serialize(serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<PeerEndpoint, D::Error> {
        let (tag, bytes): (u8, Vec<u8>) = Deserialize::deserialize(d)?;
        let format = AddressFormat::from_tag(tag)
            .ok_or_else(|| serde::de::Error::custom(format!("unknown address format {}", tag)))?;
        format.decode(&bytes).map_err(serde::de::Error::custom)
    }
}

/// Encode a message into a single frame.
pub fn encode_frame(msg: &Message) -> Result<Vec<u8>, FrameEncodeError> {
    let payload = bincode::serialize(msg).map_err(FrameEncodeError::Encode)?;
    let len = (VERSION_SIZE + payload.len()) as u64;
    if len > MAX_FRAME_LEN as u64 {
        return Err(FrameEncodeError::TooLarge);
    }
    let mut out = Vec::with_capacity(LEN_SIZE + len as usize);
    out.extend_from_slice(&(len as u32).to_le_bytes());
    out.push(PROTOCOL_VERSION);
    out.extend_from_slice(&payload);
    Ok(out)
}

/// Error encoding a message into a frame (bincode or size limit).
#[derive(Debug, thiserror::Error)]
pub enum FrameEncodeError {
    #[error("encode error: {0}")]
    Encode(#[from] bincode::Error),
    #[error("frame too large")]
    TooLarge,
}

/// Decode one frame from the front of `bytes`. Returns the message and the number of bytes consumed.
/// Call with partial buffer; returns error if not enough bytes (caller should try again after more data).
pub fn decode_frame(bytes: &[u8]) -> Result<(Message, usize), FrameDecodeError> {
    if bytes.len() < LEN_SIZE {
        return Err(FrameDecodeError::NeedMore);
    }
    let len = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
    if len > MAX_FRAME_LEN {
        return Err(FrameDecodeError::TooLarge);
    }
    let len = len as usize;
    if len < VERSION_SIZE {
        return Err(FrameDecodeError::Empty);
    }
    if bytes.len() < LEN_SIZE + len {
        return Err(FrameDecodeError::NeedMore);
    }
    let version = bytes[LEN_SIZE];
    if version != PROTOCOL_VERSION {
        return Err(FrameDecodeError::UnsupportedVersion(version));
    }
    let body = &bytes[LEN_SIZE + VERSION_SIZE..LEN_SIZE + len];
    let msg: Message = bincode::deserialize(body).map_err(FrameDecodeError::Decode)?;
    Ok((msg, LEN_SIZE + len))
}

/// Error decoding a frame.
#[derive(Debug, thiserror::Error)]
pub enum FrameDecodeError {
    #[error("need more bytes")]
    NeedMore,
    #[error("frame too large")]
    TooLarge,
    #[error("empty frame")]
    Empty,
    #[error("unsupported protocol version {0}")]
    UnsupportedVersion(u8),
    #[error("decode error: {0}")]
    Decode(#[from] bincode::Error),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::NodeId;
    use crate::protocol::PingData;

    fn sample_ping() -> Message {
        Message::DiscoveryRequest(PingData {
            sender: NodeId::random(),
            cluster: "demo".into(),
            physical: "node-a/[fe80::1%3]:7800".parse().unwrap(),
            coordinator: true,
            initial: false,
            members: Some(vec![NodeId::random()]),
            name: Some("a".into()),
        })
    }

    #[test]
    fn ping_keeps_endpoint_detail() {
        let msg = sample_ping();
        let frame = encode_frame(&msg).unwrap();
        let (decoded, n) = decode_frame(&frame).unwrap();
        assert_eq!(n, frame.len());
        assert_eq!(decoded, msg);
        match decoded {
            Message::DiscoveryRequest(d) => {
                assert_eq!(d.physical.hostname(), Some("node-a"));
                assert_eq!(d.physical.scope_id(), 3);
            }
            other => panic!("expected DiscoveryRequest, got {:?}", other),
        }
    }

    #[test]
    fn partial_read_need_more() {
        let frame = encode_frame(&sample_ping()).unwrap();
        assert!(matches!(
            decode_frame(&frame[..2]),
            Err(FrameDecodeError::NeedMore)
        ));
        assert!(matches!(
            decode_frame(&frame[..frame.len() - 1]),
            Err(FrameDecodeError::NeedMore)
        ));
    }

    #[test]
    fn multiple_messages() {
        let a = sample_ping();
        let b = Message::Data {
            sender: NodeId::random(),
            payload: b"hello".to_vec(),
        };
        let mut buf = encode_frame(&a).unwrap();
        let fa_len = buf.len();
        buf.extend_from_slice(&encode_frame(&b).unwrap());
        let (m1, n1) = decode_frame(&buf).unwrap();
        assert_eq!(n1, fa_len);
        let (m2, n2) = decode_frame(&buf[n1..]).unwrap();
        assert_eq!(n1 + n2, buf.len());
        assert_eq!(m1, a);
        assert_eq!(m2, b);
    }

    #[test]
    fn rejects_unknown_version() {
        let mut frame = encode_frame(&sample_ping()).unwrap();
        frame[LEN_SIZE] = 99;
        assert!(matches!(
            decode_frame(&frame),
            Err(FrameDecodeError::UnsupportedVersion(99))
        ));
    }

    #[test]
    fn address_format_table() {
        assert_eq!(AddressFormat::from_tag(AddressFormat::CURRENT.tag()), Some(AddressFormat::HostV1));
        assert_eq!(AddressFormat::from_tag(0), None);
        let ep: PeerEndpoint = "localhost/99.88.77.66:123".parse().unwrap();
        let bytes = AddressFormat::HostV1.encode(&ep);
        let back = AddressFormat::HostV1.decode(&bytes).unwrap();
        assert_eq!(back.hostname(), Some("localhost"));
        assert_eq!(back, ep);
    }

    #[test]
    fn unknown_address_tag_fails_decode() {
        let msg = sample_ping();
        let frame = encode_frame(&msg).unwrap();
        // NodeId is a UUID byte string, len(u64) + 16 bytes; the endpoint tag follows.
        let tag_pos = LEN_SIZE + VERSION_SIZE + 4 + 8 + 16 + 8 + "demo".len();
        assert_eq!(frame[tag_pos], AddressFormat::HostV1.tag());
        let mut bad = frame.clone();
        bad[tag_pos] = 200;
        assert!(matches!(decode_frame(&bad), Err(FrameDecodeError::Decode(_))));
    }
}
