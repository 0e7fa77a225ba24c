//! Load config from file and environment.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use grouphttp_core::{parse_timeout, PeerEndpoint, Properties, SizeValue};
use serde::{Deserialize, Deserializer};

use crate::client::{ClientError, ClientKind, ClientOptions};

/// Node configuration. File: ~/.config/grouphttp/config.toml or /etc/grouphttp/config.toml.
/// Env overrides: GROUPHTTP_CLUSTER_NAME, GROUPHTTP_BIND_ADDR, GROUPHTTP_EXTERNAL_ADDR,
/// GROUPHTTP_SERVICE_PATH, GROUPHTTP_INITIAL_PING_ADDRESSES, GROUPHTTP_CLIENT_IMPLEMENTATION,
/// GROUPHTTP_SERVER_KEY_STORE.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Cluster to join (default "grouphttp").
    #[serde(default = "default_cluster_name")]
    pub cluster_name: String,
    /// Local HTTPS listen address (default 0.0.0.0:7800).
    #[serde(default = "default_bind_addr")]
    pub bind_addr: SocketAddr,
    /// Endpoint advertised to peers and sent as X-Sender (default 127.0.0.1:7800).
    #[serde(default = "default_external_addr")]
    pub external_addr: String,
    /// URL path of the receiver (default "/jgroups").
    #[serde(default = "default_service_path")]
    pub service_path: String,
    /// Largest accepted message body (default 500k).
    #[serde(default = "default_max_content_size", deserialize_with = "de_size")]
    pub max_content_size: SizeValue,
    /// Directory that `classpath:` locations resolve against (default "resources").
    #[serde(default = "default_resource_root")]
    pub resource_root: PathBuf,
    #[serde(default)]
    pub client: ClientSection,
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub discovery: DiscoverySection,
}

/// Outbound HTTP client.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ClientSection {
    #[serde(default)]
    pub implementation: ClientKind,
    /// `key=value` list; explicit fields below win over it.
    #[serde(default)]
    pub properties: Option<String>,
    #[serde(default = "default_properties_separator")]
    pub properties_separator: String,
    pub key_store: Option<String>,
    pub key_store_password: Option<String>,
    pub key_password: Option<String>,
    pub trust_store: Option<String>,
    pub trust_store_password: Option<String>,
    #[serde(default, deserialize_with = "de_opt_timeout")]
    pub connect_timeout: Option<Duration>,
    /// Bound on handshake, upload and response of one send.
    #[serde(default, deserialize_with = "de_opt_timeout")]
    pub response_timeout: Option<Duration>,
}

/// Inbound HTTPS receiver.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServerSection {
    /// PEM file with certificate chain and private key, or a PKCS#12 archive.
    pub key_store: Option<String>,
    pub key_store_password: Option<String>,
    /// Defaults to `key_store_password`.
    pub key_password: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DiscoverySection {
    /// Comma separated `[hostname/]host[:port]` seeds.
    #[serde(default)]
    pub initial_ping_addresses: String,
    #[serde(default = "default_max_dynamic_hosts")]
    pub max_dynamic_hosts: usize,
    #[serde(default = "default_max_members_in_discovery_request")]
    pub max_members_in_discovery_request: usize,
    #[serde(default)]
    pub async_discovery_use_separate_task_per_request: bool,
    #[serde(default = "default_who_has_cache_timeout", deserialize_with = "de_timeout")]
    pub who_has_cache_timeout: Duration,
    #[serde(default = "default_fetch_timeout", deserialize_with = "de_timeout")]
    pub fetch_timeout: Duration,
    #[serde(default = "default_join_timeout", deserialize_with = "de_timeout")]
    pub join_timeout: Duration,
}

fn default_cluster_name() -> String {
    "grouphttp".to_string()
}
fn default_bind_addr() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 7800))
}
fn default_external_addr() -> String {
    "127.0.0.1:7800".to_string()
}
fn default_service_path() -> String {
    "/jgroups".to_string()
}
fn default_max_content_size() -> SizeValue {
    SizeValue::new(500, grouphttp_core::SizeUnit::Kilo)
}
fn default_resource_root() -> PathBuf {
    PathBuf::from("resources")
}
fn default_properties_separator() -> String {
    ",".to_string()
}
fn default_max_dynamic_hosts() -> usize {
    grouphttp_core::candidates::DEFAULT_MAX_DYNAMIC_HOSTS
}
fn default_max_members_in_discovery_request() -> usize {
    500
}
fn default_who_has_cache_timeout() -> Duration {
    grouphttp_core::who_has::DEFAULT_WHO_HAS_TIMEOUT
}
fn default_fetch_timeout() -> Duration {
    Duration::from_millis(3000)
}
fn default_join_timeout() -> Duration {
    Duration::from_millis(3000)
}

impl Default for Config {
    fn default() -> Self {
        Self {
            cluster_name: default_cluster_name(),
            bind_addr: default_bind_addr(),
            external_addr: default_external_addr(),
            service_path: default_service_path(),
            max_content_size: default_max_content_size(),
            resource_root: default_resource_root(),
            client: ClientSection::default(),
            server: ServerSection::default(),
            discovery: DiscoverySection::default(),
        }
    }
}

impl Default for ClientSection {
    fn default() -> Self {
        Self {
            implementation: ClientKind::default(),
            properties: None,
            properties_separator: default_properties_separator(),
            key_store: None,
            key_store_password: None,
            key_password: None,
            trust_store: None,
            trust_store_password: None,
            connect_timeout: None,
            response_timeout: None,
        }
    }
}

impl Default for DiscoverySection {
    fn default() -> Self {
        Self {
            initial_ping_addresses: String::new(),
            max_dynamic_hosts: default_max_dynamic_hosts(),
            max_members_in_discovery_request: default_max_members_in_discovery_request(),
            async_discovery_use_separate_task_per_request: false,
            who_has_cache_timeout: default_who_has_cache_timeout(),
            fetch_timeout: default_fetch_timeout(),
            join_timeout: default_join_timeout(),
        }
    }
}

impl Config {
    pub fn from_toml_str(s: &str) -> Result<Self, ConfigError> {
        let c: Config = toml::from_str(s).map_err(|e| ConfigError::Parse {
            origin: "<string>".into(),
            source: e,
        })?;
        c.validate()?;
        Ok(c)
    }

    /// Check every value that serde cannot check on its own.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.cluster_name.is_empty() {
            return Err(ConfigError::Invalid("cluster_name must not be empty".into()));
        }
        validate_service_path(&self.service_path)?;
        self.max_content_length()?;
        self.external_endpoint()?;
        if self.discovery.max_dynamic_hosts == 0 {
            return Err(ConfigError::Invalid("discovery.max_dynamic_hosts must be > 0".into()));
        }
        self.client_options()?;
        Ok(())
    }

    /// `max_content_size` in bytes. Must be positive and fit in a u32.
    pub fn max_content_length(&self) -> Result<usize, ConfigError> {
        let n = self.max_content_size.singles();
        if n <= 0 || n > u32::MAX as i64 {
            return Err(ConfigError::Invalid(format!(
                "max_content_size {} out of range 1..={}",
                self.max_content_size,
                u32::MAX
            )));
        }
        Ok(n as usize)
    }

    /// Advertised endpoint. Must be an IP literal.
    pub fn external_endpoint(&self) -> Result<PeerEndpoint, ConfigError> {
        self.external_addr
            .parse::<PeerEndpoint>()
            .map_err(|e| ConfigError::Invalid(format!("external_addr '{}': {}", self.external_addr, e)))
    }

    /// Client options: the properties string first, then explicit fields.
    pub fn client_options(&self) -> Result<ClientOptions, ConfigError> {
        let c = &self.client;
        let mut opts = match &c.properties {
            Some(p) => ClientOptions::from_properties(&Properties::parse(p, &c.properties_separator))?,
            None => ClientOptions::default(),
        };
        opts.resource_root = self.resource_root.clone();
        let overrides = [
            (&c.key_store, &mut opts.key_store),
            (&c.key_store_password, &mut opts.key_store_password),
            (&c.key_password, &mut opts.key_password),
            (&c.trust_store, &mut opts.trust_store),
            (&c.trust_store_password, &mut opts.trust_store_password),
        ];
        for (src, dst) in overrides {
            if src.is_some() {
                *dst = src.clone();
            }
        }
        if c.connect_timeout.is_some() {
            opts.connect_timeout = c.connect_timeout;
        }
        if c.response_timeout.is_some() {
            opts.response_timeout = c.response_timeout;
        }
        Ok(opts)
    }

    /// Apply `GROUPHTTP_*` overrides from `var`, then validate again.
    pub fn apply_env(&mut self, var: impl Fn(&str) -> Option<String>) -> Result<(), ConfigError> {
        if let Some(s) = var("GROUPHTTP_CLUSTER_NAME") {
            self.cluster_name = s;
        }
        if let Some(s) = var("GROUPHTTP_BIND_ADDR") {
            self.bind_addr = s.parse().map_err(|_| ConfigError::Env {
                var: "GROUPHTTP_BIND_ADDR",
                value: s.clone(),
            })?;
        }
        if let Some(s) = var("GROUPHTTP_EXTERNAL_ADDR") {
            self.external_addr = s;
        }
        if let Some(s) = var("GROUPHTTP_SERVICE_PATH") {
            self.service_path = s;
        }
        if let Some(s) = var("GROUPHTTP_INITIAL_PING_ADDRESSES") {
            self.discovery.initial_ping_addresses = s;
        }
        if let Some(s) = var("GROUPHTTP_CLIENT_IMPLEMENTATION") {
            self.client.implementation = s.parse().map_err(|_| ConfigError::Env {
                var: "GROUPHTTP_CLIENT_IMPLEMENTATION",
                value: s.clone(),
            })?;
        }
        if let Some(s) = var("GROUPHTTP_SERVER_KEY_STORE") {
            self.server.key_store = Some(s);
        }
        self.validate()
    }
}

/// Service path is empty or absolute.
pub fn validate_service_path(path: &str) -> Result<(), ConfigError> {
    if path.is_empty() || path.starts_with('/') {
        Ok(())
    } else {
        Err(ConfigError::Invalid(format!(
            "service_path '{}' must be empty or start with '/'",
            path
        )))
    }
}

/// Load config: `explicit` path if given, else the first existing default path, else defaults.
/// Env vars are applied last.
pub fn load(explicit: Option<&Path>) -> Result<Config, ConfigError> {
    let mut c = match explicit {
        Some(p) => load_file(p)?,
        None => match config_paths().into_iter().find(|p| p.exists()) {
            Some(p) => load_file(&p)?,
            None => Config::default(),
        },
    };
    c.apply_env(|k| std::env::var(k).ok())?;
    Ok(c)
}

fn config_paths() -> Vec<PathBuf> {
    let home = std::env::var_os("HOME").map(PathBuf::from);
    let mut out = Vec::new();
    if let Some(h) = home {
        out.push(h.join(".config/grouphttp/config.toml"));
    }
    out.push(PathBuf::from("/etc/grouphttp/config.toml"));
    out
}

fn load_file(path: &Path) -> Result<Config, ConfigError> {
    let s = std::fs::read_to_string(path).map_err(|e| ConfigError::Io {
        path: path.to_path_buf(),
        source: e,
    })?;
    let c: Config = toml::from_str(&s).map_err(|e| ConfigError::Parse {
        origin: path.display().to_string(),
        source: e,
    })?;
    c.validate()?;
    Ok(c)
}

fn de_size<'de, D: Deserializer<'de>>(d: D) -> Result<SizeValue, D::Error> {
    let lit = SizeOrNumber::deserialize(d)?;
    match lit {
        SizeOrNumber::Number(n) => Ok(SizeValue::new(n, grouphttp_core::SizeUnit::Single)),
        SizeOrNumber::Text(s) => s.parse().map_err(serde::de::Error::custom),
    }
}

fn de_timeout<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
    match TimeoutLiteral::deserialize(d)? {
        TimeoutLiteral::Millis(ms) => Ok(Duration::from_millis(ms)),
        TimeoutLiteral::Text(s) => parse_timeout(&s).map_err(serde::de::Error::custom),
    }
}

fn de_opt_timeout<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Duration>, D::Error> {
    de_timeout(d).map(Some)
}

#[derive(Deserialize)]
#[serde(untagged)]
enum SizeOrNumber {
    Number(i64),
    Text(String),
}

/// Timeouts accept a millisecond count or an ISO-8601 string.
#[derive(Deserialize)]
#[serde(untagged)]
enum TimeoutLiteral {
    Millis(u64),
    Text(String),
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("cannot read {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("cannot parse config {origin}: {source}")]
    Parse {
        origin: String,
        source: toml::de::Error,
    },
    #[error("invalid {var}: '{value}'")]
    Env { var: &'static str, value: String },
    #[error("invalid configuration: {0}")]
    Invalid(String),
    #[error(transparent)]
    Client(#[from] ClientError),
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;

    #[test]
    fn defaults() {
        let c = Config::from_toml_str("").unwrap();
        assert_eq!(c.cluster_name, "grouphttp");
        assert_eq!(c.service_path, "/jgroups");
        assert_eq!(c.max_content_length().unwrap(), 500_000);
        assert_eq!(c.bind_addr.port(), 7800);
        assert_eq!(c.discovery.max_dynamic_hosts, 2000);
        assert_eq!(c.discovery.max_members_in_discovery_request, 500);
        assert_eq!(c.discovery.who_has_cache_timeout, Duration::from_millis(2000));
        assert_eq!(c.client.implementation, ClientKind::Reqwest);
        assert_eq!(c.external_endpoint().unwrap().port(), 7800);
    }

    #[test]
    fn full_file() {
        let c = Config::from_toml_str(
            r#"
            cluster_name = "demo"
            bind_addr = "127.0.0.1:9000"
            external_addr = "node-a/127.0.0.1:9000"
            service_path = ""
            max_content_size = "2m"

            [client]
            implementation = "http1"
            properties = "ssl.trust-store=classpath:ca.pem, connect-timeout=PT2S"
            key_password = "secret"
            response_timeout = "PT10S"

            [server]
            key_store = "classpath:node.p12"
            key_store_password = "changeit"

            [discovery]
            initial_ping_addresses = "127.0.0.1:9001, peer/127.0.0.1:9002"
            async_discovery_use_separate_task_per_request = true
            who_has_cache_timeout = 500
            fetch_timeout = "PT1.5S"
            "#,
        )
        .unwrap();
        assert_eq!(c.max_content_length().unwrap(), 2_000_000);
        assert_eq!(c.client.implementation, ClientKind::Http1);
        assert_eq!(c.external_endpoint().unwrap().hostname(), Some("node-a"));
        assert_eq!(c.discovery.who_has_cache_timeout, Duration::from_millis(500));
        assert_eq!(c.discovery.fetch_timeout, Duration::from_millis(1500));
        let opts = c.client_options().unwrap();
        assert_eq!(opts.trust_store.as_deref(), Some("classpath:ca.pem"));
        assert_eq!(opts.connect_timeout, Some(Duration::from_secs(2)));
        assert_eq!(opts.key_password.as_deref(), Some("secret"));
        assert_eq!(opts.response_timeout, Some(Duration::from_secs(10)));
        assert_eq!(c.server.key_store_password.as_deref(), Some("changeit"));
    }

    #[test]
    fn rejects_bad_values() {
        assert!(Config::from_toml_str("service_path = \"jgroups\"").is_err());
        assert!(Config::from_toml_str("max_content_size = \"5g\"").is_err());
        assert!(Config::from_toml_str("max_content_size = \"0\"").is_err());
        assert!(Config::from_toml_str("external_addr = \"some-host:1\"").is_err());
        assert!(Config::from_toml_str("unknown = 1").is_err());
        assert!(Config::from_toml_str("[client]\nconnect_timeout = \"soon\"").is_err());
        assert!(Config::from_toml_str("[client]\nproperties = \"connect-timeout=soon\"").is_err());
    }

    #[test]
    fn env_overrides() {
        let env: HashMap<&str, &str> = [
            ("GROUPHTTP_CLUSTER_NAME", "other"),
            ("GROUPHTTP_INITIAL_PING_ADDRESSES", "127.0.0.1:7801"),
            ("GROUPHTTP_CLIENT_IMPLEMENTATION", "http1"),
        ]
        .into_iter()
        .collect();
        let mut c = Config::default();
        c.apply_env(|k| env.get(k).map(|v| v.to_string())).unwrap();
        assert_eq!(c.cluster_name, "other");
        assert_eq!(c.discovery.initial_ping_addresses, "127.0.0.1:7801");
        assert_eq!(c.client.implementation, ClientKind::Http1);

        let mut c = Config::default();
        let err = c
            .apply_env(|k| (k == "GROUPHTTP_BIND_ADDR").then(|| "nope".to_string()))
            .unwrap_err();
        assert!(matches!(err, ConfigError::Env { .. }));
    }

    #[test]
    fn load_explicit_file() {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        writeln!(f, "cluster_name = \"from-file\"").unwrap();
        let c = load_file(f.path()).unwrap();
        assert_eq!(c.cluster_name, "from-file");
        assert!(matches!(
            load_file(Path::new("/nonexistent/grouphttp.toml")),
            Err(ConfigError::Io { .. })
        ));
    }
}
