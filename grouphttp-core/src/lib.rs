//! grouphttp core: types and state machines for HTTP-transported cluster messaging.
//! Host-driven: no I/O; the node crate owns sockets, TLS and timers.

pub mod assembly;
pub mod candidates;
pub mod content;
pub mod duration;
pub mod endpoint;
pub mod identity;
pub mod props;
pub mod protocol;
pub mod size;
pub mod who_has;
pub mod wire;

pub use assembly::{AssemblyError, InboundAssembly};
pub use candidates::{CandidateSet, DynamicHosts};
pub use content::{content_length, BytesContent, ContentError, ContentSource, MESSAGE_CONTENT_TYPE};
pub use duration::{parse_timeout, DurationParseError};
pub use endpoint::{AddressParseError, CodecError, EndpointSpec, HostPart, PeerEndpoint};
pub use identity::NodeId;
pub use props::Properties;
pub use protocol::{Message, PingData, PROTOCOL_VERSION};
pub use size::{SizeParseError, SizeUnit, SizeValue};
pub use who_has::ExpiringSet;
pub use wire::{decode_frame, encode_frame, AddressFormat, FrameDecodeError, FrameEncodeError};
