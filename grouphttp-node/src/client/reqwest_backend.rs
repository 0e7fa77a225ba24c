//! HTTP/2 backend on reqwest: one multiplexed connection per peer, HTTP/1.1 fallback via ALPN.

use std::sync::Arc;

use bytes::Bytes;
use futures::future::BoxFuture;
use futures::FutureExt;
use grouphttp_core::content_length;
use reqwest::header::{CONTENT_LENGTH, CONTENT_TYPE};

use super::{
    classify_chain, chain_message, ClientError, ClientOptions, Execute, HttpClient, Lifecycle,
    Request, RequestParts, SendError, SendResult, TlsMaterial,
};
use crate::tls::{ALPN_H2, ALPN_HTTP11};

pub struct ReqwestClient {
    lifecycle: Lifecycle,
}

impl ReqwestClient {
    pub fn new() -> Self {
        Self {
            lifecycle: Lifecycle::new(),
        }
    }
}

impl Default for ReqwestClient {
    fn default() -> Self {
        Self::new()
    }
}

impl HttpClient for ReqwestClient {
    fn configure(&self, options: &ClientOptions) -> Result<(), ClientError> {
        self.lifecycle.configure(options)
    }

    fn start(&self) -> Result<(), ClientError> {
        self.lifecycle.start(|material| {
            let exec: Arc<dyn Execute> = Arc::new(ReqwestExec::build(material)?);
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

struct ReqwestExec {
    client: reqwest::Client,
}

impl ReqwestExec {
    fn build(material: &TlsMaterial) -> Result<Self, ClientError> {
        let tls = material.client_config(&[ALPN_H2, ALPN_HTTP11])?;
        let mut builder = reqwest::Client::builder()
            .use_preconfigured_tls(tls)
            .timeout(material.response_timeout());
        if let Some(t) = material.connect_timeout {
            builder = builder.connect_timeout(t);
        }
        let client = builder
            .build()
            .map_err(|e| ClientError::Backend(chain_message(&e)))?;
        Ok(Self { client })
    }

    async fn call(client: reqwest::Client, parts: RequestParts) -> SendResult {
        let method = match reqwest::Method::from_bytes(parts.method.as_bytes()) {
            Ok(m) => m,
            Err(e) => return SendResult::failed(SendError::Other(e.to_string())),
        };
        let mut req = client.request(method, parts.url);
        for (name, value) in &parts.headers {
            req = req.header(name.as_str(), value.as_str());
        }
        if let Some(content) = parts.content {
            let len = match content_length(content.as_ref()) {
                Ok(len) => len,
                Err(e) => return SendResult::failed(SendError::Other(e.to_string())),
            };
            let chunks: Vec<Bytes> = content.chunks().collect();
            let stream = futures::stream::iter(chunks.into_iter().map(Ok::<_, std::io::Error>));
            req = req
                .header(CONTENT_TYPE, content.content_type())
                .header(CONTENT_LENGTH, len)
                .body(reqwest::Body::wrap_stream(stream));
        }
        match req.send().await {
            Ok(resp) => SendResult::completed(resp.status().as_u16()),
            Err(e) => SendResult::failed(classify_reqwest(&e)),
        }
    }
}

impl Execute for ReqwestExec {
    fn execute(&self, parts: RequestParts) -> BoxFuture<'static, SendResult> {
        Self::call(self.client.clone(), parts).boxed()
    }
}

/// Chain first; reqwest's own flags cover connect errors with no recognizable io error (DNS).
fn classify_reqwest(err: &reqwest::Error) -> SendError {
    classify_chain(err).unwrap_or_else(|| {
        let detail = chain_message(err);
        if err.is_timeout() {
            SendError::Timeout(detail)
        } else if err.is_connect() {
            SendError::Connect(detail)
        } else {
            SendError::Other(detail)
        }
    })
}
