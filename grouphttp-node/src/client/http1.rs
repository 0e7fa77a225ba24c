//! Minimal fallback backend: one HTTP/1.1 request per TLS connection, `Connection: close`.
//! The request always carries a declared length; undeclared content is drained once to count it.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use futures::FutureExt;
use grouphttp_core::content_length;
use rustls::pki_types::ServerName;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use url::{Host, Url};

use super::{
    classify, ClientError, ClientOptions, Execute, HttpClient, Lifecycle, Request, RequestParts,
    SendError, SendResult, TlsMaterial,
};
use crate::tls::ALPN_HTTP11;

const MAX_HEAD: usize = 16 * 1024;
const MAX_HEADERS: usize = 64;

pub struct Http1Client {
    lifecycle: Lifecycle,
}

impl Http1Client {
    pub fn new() -> Self {
        Self {
            lifecycle: Lifecycle::new(),
        }
    }
}

impl Default for Http1Client {
    fn default() -> Self {
        Self::new()
    }
}

impl HttpClient for Http1Client {
    fn configure(&self, options: &ClientOptions) -> Result<(), ClientError> {
        self.lifecycle.configure(options)
    }

    fn start(&self) -> Result<(), ClientError> {
        self.lifecycle.start(|material| {
            let exec: Arc<dyn Execute> = Arc::new(Http1Exec::build(material)?);
            Ok(exec)
        })
    }

    fn new_request(&self, url: &str) -> Result<Request, ClientError> {
        self.lifecycle.new_request(url)
    }

    fn close(&self) -> Result<(), ClientError> {
        self.lifecycle.close();
        Ok(())
    }

    fn is_started(&self) -> bool {
        self.lifecycle.is_started()
    }
}

#[derive(Clone)]
struct Http1Exec {
    connector: TlsConnector,
    connect_timeout: Option<Duration>,
    response_timeout: Duration,
}

impl Http1Exec {
    fn build(material: &TlsMaterial) -> Result<Self, ClientError> {
        let tls = material.client_config(&[ALPN_HTTP11])?;
        Ok(Self {
            connector: TlsConnector::from(Arc::new(tls)),
            connect_timeout: material.connect_timeout,
            response_timeout: material.response_timeout(),
        })
    }

    async fn call(self, parts: RequestParts) -> Result<u16, SendError> {
        if parts.url.scheme() != "https" {
            return Err(SendError::Other(format!("unsupported scheme in {}", parts.url)));
        }
        let (addrs, server_name) = resolve(&parts.url).await?;

        let connect = connect_any(addrs);
        let tcp = match self.connect_timeout {
            Some(t) => tokio::time::timeout(t, connect)
                .await
                .map_err(|e| SendError::Timeout(format!("connect to {}: {}", parts.url, e)))??,
            None => connect.await?,
        };
        let _ = tcp.set_nodelay(true);
        let exchange = self.exchange(tcp, server_name, &parts);
        tokio::time::timeout(self.response_timeout, exchange)
            .await
            .map_err(|_| {
                SendError::Timeout(format!(
                    "no response from {} within {:?}",
                    parts.url, self.response_timeout
                ))
            })?
    }

    /// Handshake, upload and status line over an established connection.
    async fn exchange(&self, tcp: TcpStream, server_name: ServerName<'static>, parts: &RequestParts) -> Result<u16, SendError> {
        let mut stream = self
            .connector
            .connect(server_name, tcp)
            .await
            .map_err(|e| SendError::Other(format!("tls handshake with {}: {}", parts.url, classify(&e))))?;

        let head = request_head(parts)?;
        stream.write_all(head.as_bytes()).await.map_err(|e| classify(&e))?;
        if let Some(content) = &parts.content {
            for chunk in content.chunks() {
                stream.write_all(&chunk).await.map_err(|e| classify(&e))?;
            }
        }
        stream.flush().await.map_err(|e| classify(&e))?;

        read_status(&mut stream).await
    }
}

impl Execute for Http1Exec {
    fn execute(&self, parts: RequestParts) -> BoxFuture<'static, SendResult> {
        let this = self.clone();
        async move {
            match this.call(parts).await {
                Ok(status) => SendResult::completed(status),
                Err(e) => SendResult::failed(e),
            }
        }
        .boxed()
    }
}

async fn resolve(url: &Url) -> Result<(Vec<SocketAddr>, ServerName<'static>), SendError> {
    let port = url.port_or_known_default().unwrap_or(443);
    match url.host() {
        Some(Host::Ipv4(ip)) => Ok((vec![SocketAddr::from((ip, port))], ServerName::from(std::net::IpAddr::V4(ip)))),
        Some(Host::Ipv6(ip)) => Ok((vec![SocketAddr::from((ip, port))], ServerName::from(std::net::IpAddr::V6(ip)))),
        Some(Host::Domain(name)) => {
            let addrs: Vec<SocketAddr> = tokio::net::lookup_host((name, port))
                .await
                .map_err(|e| SendError::Connect(format!("resolve {}: {}", name, e)))?
                .collect();
            let server_name = ServerName::try_from(name.to_string())
                .map_err(|e| SendError::Other(format!("server name {}: {}", name, e)))?;
            Ok((addrs, server_name))
        }
        None => Err(SendError::Other(format!("no host in {}", url))),
    }
}

/// First address that accepts. The last failure is reported.
async fn connect_any(addrs: Vec<SocketAddr>) -> Result<TcpStream, SendError> {
    let mut last = SendError::Connect("no addresses".to_string());
    for addr in addrs {
        match TcpStream::connect(addr).await {
            Ok(s) => return Ok(s),
            Err(e) => {
                last = match classify(&e) {
                    SendError::Other(d) => SendError::Connect(format!("{}: {}", addr, d)),
                    classified => classified,
                }
            }
        }
    }
    Err(last)
}

fn request_head(parts: &RequestParts) -> Result<String, SendError> {
    let path = match parts.url.query() {
        Some(q) => format!("{}?{}", parts.url.path(), q),
        None => parts.url.path().to_string(),
    };
    let authority = match parts.url.port() {
        Some(p) => format!("{}:{}", parts.url.host_str().unwrap_or_default(), p),
        None => parts.url.host_str().unwrap_or_default().to_string(),
    };
    let mut head = format!(
        "{} {} HTTP/1.1\r\nHost: {}\r\nConnection: close\r\n",
        parts.method, path, authority
    );
    for (name, value) in &parts.headers {
        if value.contains(['\r', '\n']) || name.contains(['\r', '\n', ':']) {
            return Err(SendError::Other(format!("invalid header {}", name)));
        }
        head.push_str(&format!("{}: {}\r\n", name, value));
    }
    match &parts.content {
        Some(content) => {
            let len = content_length(content.as_ref()).map_err(|e| SendError::Other(e.to_string()))?;
            head.push_str(&format!(
                "Content-Type: {}\r\nContent-Length: {}\r\n",
                content.content_type(),
                len
            ));
        }
        None => head.push_str("Content-Length: 0\r\n"),
    }
    head.push_str("\r\n");
    Ok(head)
}

/// Read until the response head parses; return its status code. The body is not read.
async fn read_status<S: tokio::io::AsyncRead + Unpin>(stream: &mut S) -> Result<u16, SendError> {
    let mut buf = Vec::with_capacity(1024);
    let mut chunk = [0u8; 1024];
    loop {
        let n = stream.read(&mut chunk).await.map_err(|e| classify(&e))?;
        if n == 0 {
            return Err(SendError::Other("connection closed before response".to_string()));
        }
        buf.extend_from_slice(&chunk[..n]);
        let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
        let mut resp = httparse::Response::new(&mut headers);
        match resp.parse(&buf) {
            Ok(httparse::Status::Complete(_)) => {
                return resp
                    .code
                    .ok_or_else(|| SendError::Other("response without status".to_string()));
            }
            Ok(httparse::Status::Partial) if buf.len() < MAX_HEAD => continue,
            Ok(httparse::Status::Partial) => {
                return Err(SendError::Other("response head too large".to_string()))
            }
            Err(e) => return Err(SendError::Other(format!("bad response: {}", e))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use grouphttp_core::content::ChunkedContent;

    fn parts(url: &str) -> RequestParts {
        RequestParts {
            url: Url::parse(url).unwrap(),
            method: "POST".into(),
            headers: vec![("X-Sender".into(), "127.0.0.1:7800".into())],
            content: Some(Arc::new(ChunkedContent::new(
                "application/x-jgroups-message",
                vec![Bytes::from_static(b"ab"), Bytes::from_static(b"c")],
            ))),
        }
    }

    #[test]
    fn head_counts_undeclared_length() {
        let head = request_head(&parts("https://[::1]:7800/jgroups")).unwrap();
        assert!(head.starts_with("POST /jgroups HTTP/1.1\r\nHost: [::1]:7800\r\n"));
        assert!(head.contains("X-Sender: 127.0.0.1:7800\r\n"));
        assert!(head.contains("Content-Length: 3\r\n"));
        assert!(head.ends_with("\r\n\r\n"));
    }

    #[test]
    fn head_rejects_header_injection() {
        let mut p = parts("https://127.0.0.1:7800/jgroups");
        p.headers.push(("X-Evil".into(), "a\r\nHost: b".into()));
        assert!(request_head(&p).is_err());
    }

    #[tokio::test]
    async fn status_from_split_head() {
        let (mut client, mut server) = tokio::io::duplex(64);
        tokio::spawn(async move {
            server.write_all(b"HTTP/1.1 413 Payload").await.unwrap();
            server.write_all(b" Too Large\r\nContent-Length: 0\r\n\r\n").await.unwrap();
        });
        assert_eq!(read_status(&mut client).await.unwrap(), 413);
    }

    #[tokio::test]
    async fn refused_connect_is_classified() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        let err = connect_any(vec![addr]).await.unwrap_err();
        assert!(matches!(err, SendError::Connect(_)), "{:?}", err);
    }
}
