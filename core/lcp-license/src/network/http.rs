//! reqwest-backed network client.

use super::{FetchRequest, FetchResponse, Method, NetworkClient};
use crate::error::{LcpError, LcpResult};
use async_trait::async_trait;
use reqwest::Client;
use std::time::Duration;
use tracing::debug;

/// Default upper bound for requests without their own timeout.
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);

/// [`NetworkClient`] over HTTP(S).
#[derive(Debug, Clone)]
pub struct HttpNetwork {
    client: Client,
}

impl HttpNetwork {
    /// Creates a client with rustls and a default timeout.
    pub fn new() -> LcpResult<Self> {
        let client = Client::builder()
            .timeout(DEFAULT_TIMEOUT)
            .user_agent(concat!("lcp-license/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| LcpError::Network(format!("failed to create HTTP client: {e}")))?;
        Ok(Self { client })
    }

    /// Wraps an existing reqwest client.
    pub fn with_client(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl NetworkClient for HttpNetwork {
    async fn fetch(&self, request: FetchRequest) -> LcpResult<FetchResponse> {
        debug!("{} {}", request.method, request.url);

        let mut builder = match request.method {
            Method::Get => self.client.get(&request.url),
            Method::Post => self.client.post(&request.url),
            Method::Put => self.client.put(&request.url),
        };
        if !request.params.is_empty() {
            builder = builder.query(&request.params);
        }
        for (name, value) in &request.headers {
            builder = builder.header(name, value);
        }
        if let Some(timeout) = request.timeout {
            builder = builder.timeout(timeout);
        }

        let response = builder
            .send()
            .await
            .map_err(|e| LcpError::Network(format!("{} {} failed: {e}", request.method, request.url)))?;

        let status = response.status().as_u16();
        let body = response
            .bytes()
            .await
            .map_err(|e| LcpError::Network(format!("failed to read response body: {e}")))?
            .to_vec();

        debug!("{} {} -> {status} ({} bytes)", request.method, request.url, body.len());
        Ok(FetchResponse { status, body })
    }
}
