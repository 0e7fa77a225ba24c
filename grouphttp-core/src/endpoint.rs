//! Peer endpoints: string form `[hostname/]ip[:port]` and the binary address codec.
//!
//! Binary layout (big-endian):
//! `hostNameLength:i32 (0 = absent) | UTF-16 code units | addressLength:u8 (4 or 16) |
//! address bytes | scopeId:i32 (IPv6 only) | port:u16`.

use std::hash::{Hash, Hasher};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV6};
use std::str::FromStr;

use bytes::{Buf, BufMut};

const IPV4_SIZE: u8 = 4;
const IPV6_SIZE: u8 = 16;

/// Concrete network location of a cluster member.
///
/// `hostname` is advisory (logging, display) and takes no part in equality or hashing:
/// two endpoints are equal when their IP and port are equal.
#[derive(Debug, Clone)]
pub struct PeerEndpoint {
    hostname: Option<String>,
    ip: IpAddr,
    scope_id: u32,
    port: u16,
}

impl PeerEndpoint {
    pub fn new(ip: IpAddr, port: u16) -> Self {
        Self {
            hostname: None,
            ip,
            scope_id: 0,
            port,
        }
    }

    pub fn with_hostname(mut self, hostname: impl Into<String>) -> Self {
        let h = hostname.into();
        self.hostname = if h.is_empty() { None } else { Some(h) };
        self
    }

    /// IPv6 scope (interface) id. Ignored for IPv4 addresses.
    pub fn with_scope_id(mut self, scope_id: u32) -> Self {
        if self.ip.is_ipv6() {
            self.scope_id = scope_id;
        }
        self
    }

    pub fn hostname(&self) -> Option<&str> {
        self.hostname.as_deref()
    }

    pub fn ip(&self) -> IpAddr {
        self.ip
    }

    pub fn scope_id(&self) -> u32 {
        self.scope_id
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Raw address bytes: 4 for IPv4, 16 for IPv6.
    pub fn ip_bytes(&self) -> Vec<u8> {
        match self.ip {
            IpAddr::V4(v4) => v4.octets().to_vec(),
            IpAddr::V6(v6) => v6.octets().to_vec(),
        }
    }

    pub fn socket_addr(&self) -> SocketAddr {
        match self.ip {
            IpAddr::V4(v4) => SocketAddr::new(IpAddr::V4(v4), self.port),
            IpAddr::V6(v6) => SocketAddr::V6(SocketAddrV6::new(v6, self.port, 0, self.scope_id)),
        }
    }

    /// URL authority: `ip[:port]`, IPv6 literals bracketed. Port 0 is omitted.
    ///
    /// The IPv6 scope id is not emitted: `url::Url` rejects RFC 6874 zone identifiers
    /// (`[fe80::1%25eth0]`), so scoped link-local peers are addressed through the
    /// default interface. `socket_addr` keeps the scope.
    pub fn url_authority(&self) -> String {
        let host = match self.ip {
            IpAddr::V4(v4) => v4.to_string(),
            IpAddr::V6(v6) => format!("[{}]", v6),
        };
        if self.port == 0 {
            host
        } else {
            format!("{}:{}", host, self.port)
        }
    }

    /// Number of bytes `encode` writes for this endpoint.
    pub fn encoded_len(&self) -> usize {
        let host_units = self
            .hostname
            .as_deref()
            .map(|h| h.encode_utf16().count())
            .unwrap_or(0);
        let addr = match self.ip {
            IpAddr::V4(_) => IPV4_SIZE as usize,
            IpAddr::V6(_) => IPV6_SIZE as usize + 4,
        };
        4 + host_units * 2 + 1 + addr + 2
    }

    /// Write the binary form into `out`.
    pub fn encode<B: BufMut>(&self, out: &mut B) {
        match self.hostname.as_deref() {
            None => out.put_i32(0),
            Some(h) => {
                let units: Vec<u16> = h.encode_utf16().collect();
                out.put_i32(units.len() as i32);
                for u in units {
                    out.put_u16(u);
                }
            }
        }
        match self.ip {
            IpAddr::V4(v4) => {
                out.put_u8(IPV4_SIZE);
                out.put_slice(&v4.octets());
            }
            IpAddr::V6(v6) => {
                out.put_u8(IPV6_SIZE);
                out.put_slice(&v6.octets());
                out.put_i32(self.scope_id as i32);
            }
        }
        out.put_u16(self.port);
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.encoded_len());
        self.encode(&mut out);
        out
    }

    /// Read one endpoint from the front of `input`, advancing it.
    pub fn decode<B: Buf>(input: &mut B) -> Result<Self, CodecError> {
        need(input, 4)?;
        let host_len = input.get_i32();
        if host_len < 0 {
            return Err(CodecError::InvalidHostnameLength(host_len));
        }
        let hostname = if host_len == 0 {
            None
        } else {
            need(input, host_len as usize * 2)?;
            let units: Vec<u16> = (0..host_len).map(|_| input.get_u16()).collect();
            Some(String::from_utf16(&units).map_err(|_| CodecError::InvalidHostname)?)
        };

        need(input, 1)?;
        let addr_len = input.get_u8();
        let (ip, scope_id) = match addr_len {
            0 => return Err(CodecError::MissingAddress),
            IPV4_SIZE => {
                need(input, 4)?;
                let mut a = [0u8; 4];
                input.copy_to_slice(&mut a);
                (IpAddr::V4(Ipv4Addr::from(a)), 0)
            }
            IPV6_SIZE => {
                need(input, 16 + 4)?;
                let mut a = [0u8; 16];
                input.copy_to_slice(&mut a);
                let scope = input.get_i32() as u32;
                (IpAddr::V6(Ipv6Addr::from(a)), scope)
            }
            n => return Err(CodecError::InvalidAddressLength(n)),
        };

        need(input, 2)?;
        let port = input.get_u16();
        Ok(Self {
            hostname,
            ip,
            scope_id,
            port,
        })
    }

    pub fn from_bytes(mut bytes: &[u8]) -> Result<Self, CodecError> {
        Self::decode(&mut bytes)
    }
}

fn need<B: Buf>(input: &B, n: usize) -> Result<(), CodecError> {
    if input.remaining() < n {
        Err(CodecError::Truncated)
    } else {
        Ok(())
    }
}

impl PartialEq for PeerEndpoint {
    fn eq(&self, other: &Self) -> bool {
        self.ip == other.ip && self.port == other.port
    }
}

impl Eq for PeerEndpoint {}

impl Hash for PeerEndpoint {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.ip.hash(state);
        self.port.hash(state);
    }
}

/// Canonical string form, e.g. `localhost/127.0.0.1:7800` or `[fe80::1%2]:7800`.
impl std::fmt::Display for PeerEndpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if let Some(h) = &self.hostname {
            write!(f, "{}/", h)?;
        }
        match self.ip {
            IpAddr::V4(v4) => write!(f, "{}", v4)?,
            IpAddr::V6(v6) if self.scope_id != 0 => write!(f, "[{}%{}]", v6, self.scope_id)?,
            IpAddr::V6(v6) => write!(f, "[{}]", v6)?,
        }
        write!(f, ":{}", self.port)
    }
}

/// Parses an endpoint whose address part is an IP literal. Host names that need
/// resolution are rejected; use [`EndpointSpec`] for those.
impl FromStr for PeerEndpoint {
    type Err = AddressParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let spec = EndpointSpec::parse(s)?;
        match spec.host {
            HostPart::Ip { ip, scope_id } => {
                let mut ep = PeerEndpoint::new(ip, spec.port).with_scope_id(scope_id);
                if let Some(h) = spec.hostname {
                    ep = ep.with_hostname(h);
                }
                Ok(ep)
            }
            HostPart::Name(name) => Err(AddressParseError::NotLiteral(name)),
        }
    }
}

/// Address part of a parsed endpoint string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostPart {
    Ip { ip: IpAddr, scope_id: u32 },
    /// Needs name resolution by the host.
    Name(String),
}

/// Parsed, not yet resolved, endpoint string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndpointSpec {
    pub hostname: Option<String>,
    pub host: HostPart,
    pub port: u16,
}

impl EndpointSpec {
    /// Parse `[hostname/]host[:port]`. A missing port means 0.
    /// IPv6 literals may be bracketed (`[::1]:7800`); unbracketed IPv6 carries no port.
    pub fn parse(s: &str) -> Result<Self, AddressParseError> {
        let s = s.trim();
        if s.is_empty() {
            return Err(AddressParseError::Empty);
        }
        let (hostname, rest) = match s.find('/') {
            Some(idx) => {
                let h = &s[..idx];
                let h = if h.is_empty() { None } else { Some(h.to_string()) };
                (h, &s[idx + 1..])
            }
            None => (None, s),
        };
        if rest.is_empty() {
            return Err(AddressParseError::Empty);
        }

        let (addr, port) = if let Some(inner) = rest.strip_prefix('[') {
            let close = inner
                .find(']')
                .ok_or_else(|| AddressParseError::InvalidAddress(rest.to_string()))?;
            let after = &inner[close + 1..];
            let port = if after.is_empty() {
                0
            } else {
                let p = after
                    .strip_prefix(':')
                    .ok_or_else(|| AddressParseError::InvalidAddress(rest.to_string()))?;
                parse_port(p)?
            };
            (&inner[..close], port)
        } else if rest.matches(':').count() > 1 {
            (rest, 0)
        } else if let Some((a, p)) = rest.rsplit_once(':') {
            (a, parse_port(p)?)
        } else {
            (rest, 0)
        };
        if addr.is_empty() {
            return Err(AddressParseError::Empty);
        }

        let host = parse_host(addr)?;
        Ok(Self {
            hostname,
            host,
            port,
        })
    }
}

fn parse_port(p: &str) -> Result<u16, AddressParseError> {
    p.parse::<u16>()
        .map_err(|_| AddressParseError::InvalidPort(p.to_string()))
}

fn parse_host(addr: &str) -> Result<HostPart, AddressParseError> {
    let (ip_part, scope) = match addr.split_once('%') {
        Some((ip, scope)) => (ip, Some(scope)),
        None => (addr, None),
    };
    match ip_part.parse::<IpAddr>() {
        Ok(ip) => {
            let scope_id = match (ip, scope) {
                (_, None) => 0,
                (IpAddr::V6(_), Some(s)) => s
                    .parse::<u32>()
                    .map_err(|_| AddressParseError::InvalidScope(s.to_string()))?,
                (IpAddr::V4(_), Some(s)) => return Err(AddressParseError::InvalidScope(s.to_string())),
            };
            Ok(HostPart::Ip { ip, scope_id })
        }
        Err(_) if scope.is_none() && !addr.contains(':') => Ok(HostPart::Name(addr.to_string())),
        Err(_) => Err(AddressParseError::InvalidAddress(addr.to_string())),
    }
}

/// Error parsing an endpoint string.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AddressParseError {
    #[error("empty address")]
    Empty,
    #[error("invalid port: '{0}'")]
    InvalidPort(String),
    #[error("invalid address: '{0}'")]
    InvalidAddress(String),
    #[error("invalid IPv6 scope id: '{0}'")]
    InvalidScope(String),
    #[error("'{0}' is not an IP literal")]
    NotLiteral(String),
}

/// Error decoding the binary address form.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CodecError {
    #[error("truncated address")]
    Truncated,
    #[error("invalid hostname length {0}")]
    InvalidHostnameLength(i32),
    #[error("hostname is not valid UTF-16")]
    InvalidHostname,
    #[error("address is missing")]
    MissingAddress,
    #[error("length has to be 4 or 16 bytes (was {0} bytes)")]
    InvalidAddressLength(u8),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_hostname_ip_port() {
        let ep: PeerEndpoint = "localhost/99.88.77.66:123".parse().unwrap();
        assert_eq!(ep.hostname(), Some("localhost"));
        assert_eq!(ep.ip_bytes(), vec![99, 88, 77, 66]);
        assert_eq!(ep.port(), 123);
    }

    #[test]
    fn parse_hostname_ip_without_port() {
        let ep: PeerEndpoint = "localhost/99.88.77.66".parse().unwrap();
        assert_eq!(ep.hostname(), Some("localhost"));
        assert_eq!(ep.port(), 0);
    }

    #[test]
    fn parse_plain_ip_port() {
        let ep: PeerEndpoint = "192.168.1.5:7800".parse().unwrap();
        assert_eq!(ep.hostname(), None);
        assert_eq!(ep.ip(), "192.168.1.5".parse::<IpAddr>().unwrap());
        assert_eq!(ep.port(), 7800);
    }

    #[test]
    fn parse_empty_hostname_segment() {
        let ep: PeerEndpoint = "/10.0.0.1:80".parse().unwrap();
        assert_eq!(ep.hostname(), None);
        assert_eq!(ep.port(), 80);
    }

    #[test]
    fn parse_bracketed_ipv6_with_scope() {
        let ep: PeerEndpoint = "node-a/[fe80::1%3]:7800".parse().unwrap();
        assert_eq!(ep.hostname(), Some("node-a"));
        assert_eq!(ep.ip(), "fe80::1".parse::<IpAddr>().unwrap());
        assert_eq!(ep.scope_id(), 3);
        assert_eq!(ep.port(), 7800);
    }

    #[test]
    fn parse_unbracketed_ipv6_has_no_port() {
        let ep: PeerEndpoint = "::1".parse().unwrap();
        assert_eq!(ep.ip(), IpAddr::V6(Ipv6Addr::LOCALHOST));
        assert_eq!(ep.port(), 0);
    }

    #[test]
    fn host_name_is_not_a_literal() {
        let err = "localhost:1234".parse::<PeerEndpoint>().unwrap_err();
        assert_eq!(err, AddressParseError::NotLiteral("localhost".into()));
        let spec = EndpointSpec::parse("localhost:1234").unwrap();
        assert_eq!(spec.host, HostPart::Name("localhost".into()));
        assert_eq!(spec.port, 1234);
    }

    #[test]
    fn parse_rejects_bad_port() {
        assert!(matches!(
            "1.2.3.4:99999".parse::<PeerEndpoint>(),
            Err(AddressParseError::InvalidPort(_))
        ));
        assert!(matches!("".parse::<PeerEndpoint>(), Err(AddressParseError::Empty)));
    }

    #[test]
    fn display_is_canonical() {
        let ep = PeerEndpoint::new("127.0.0.1".parse().unwrap(), 7800).with_hostname("localhost");
        assert_eq!(ep.to_string(), "localhost/127.0.0.1:7800");
        let v6 = PeerEndpoint::new("fe80::1".parse().unwrap(), 7800).with_scope_id(2);
        assert_eq!(v6.to_string(), "[fe80::1%2]:7800");
        let back: PeerEndpoint = v6.to_string().parse().unwrap();
        assert_eq!(back.scope_id(), 2);
    }

    #[test]
    fn string_then_codec_roundtrip() {
        let ep: PeerEndpoint = "localhost/99.88.77.66:123".parse().unwrap();
        let decoded = PeerEndpoint::from_bytes(&ep.to_bytes()).unwrap();
        assert_eq!(decoded.hostname(), Some("localhost"));
        assert_eq!(decoded.ip_bytes(), ep.ip_bytes());
        assert_eq!(decoded.port(), 123);
        let again: PeerEndpoint = decoded.to_string().parse().unwrap();
        assert_eq!(again.hostname(), Some("localhost"));
        assert_eq!(again, ep);
    }

    #[test]
    fn codec_keeps_ipv6_scope_and_full_port_range() {
        let ep = PeerEndpoint::new("fe80::abcd".parse().unwrap(), 65535)
            .with_hostname("höst")
            .with_scope_id(7);
        let bytes = ep.to_bytes();
        assert_eq!(bytes.len(), ep.encoded_len());
        let decoded = PeerEndpoint::from_bytes(&bytes).unwrap();
        assert_eq!(decoded.hostname(), Some("höst"));
        assert_eq!(decoded.scope_id(), 7);
        assert_eq!(decoded.port(), 65535);
        assert_eq!(decoded.ip_bytes(), ep.ip_bytes());
    }

    #[test]
    fn codec_layout_without_hostname() {
        let ep: PeerEndpoint = "10.1.2.3:258".parse().unwrap();
        assert_eq!(ep.to_bytes(), vec![0, 0, 0, 0, 4, 10, 1, 2, 3, 1, 2]);
    }

    #[test]
    fn decode_rejects_bad_input() {
        assert_eq!(PeerEndpoint::from_bytes(&[0, 0]), Err(CodecError::Truncated));
        assert_eq!(
            PeerEndpoint::from_bytes(&[0, 0, 0, 0, 5, 1, 2, 3, 4, 5, 0, 1]),
            Err(CodecError::InvalidAddressLength(5))
        );
        assert_eq!(
            PeerEndpoint::from_bytes(&[0, 0, 0, 0, 0, 0, 1]),
            Err(CodecError::MissingAddress)
        );
        assert_eq!(
            PeerEndpoint::from_bytes(&[0, 0, 0, 0, 4, 1, 2]),
            Err(CodecError::Truncated)
        );
    }

    #[test]
    fn equality_ignores_hostname() {
        let a: PeerEndpoint = "a/10.0.0.1:1".parse().unwrap();
        let b: PeerEndpoint = "b/10.0.0.1:1".parse().unwrap();
        let c: PeerEndpoint = "a/10.0.0.1:2".parse().unwrap();
        assert_eq!(a, b);
        assert_ne!(a, c);
        let set: std::collections::HashSet<_> = [a, b, c].into_iter().collect();
        assert_eq!(set.len(), 2);
    }

    #[test]
    fn url_authority_brackets_ipv6() {
        let v4: PeerEndpoint = "10.0.0.1:8443".parse().unwrap();
        assert_eq!(v4.url_authority(), "10.0.0.1:8443");
        let v6: PeerEndpoint = "[::1]:8443".parse().unwrap();
        assert_eq!(v6.url_authority(), "[::1]:8443");
    }

    #[test]
    fn scoped_ipv6_keeps_scope_off_the_url() {
        let ep: PeerEndpoint = "[fe80::1%3]:7801".parse().unwrap();
        assert_eq!(ep.scope_id(), 3);
        assert_eq!(ep.url_authority(), "[fe80::1]:7801");
        match ep.socket_addr() {
            SocketAddr::V6(v6) => assert_eq!(v6.scope_id(), 3),
            other => panic!("unexpected {}", other),
        }
    }
}
