//! Network collaborator.
//!
//! The engine talks to the status server, the revocation authority and the
//! registration endpoints through [`NetworkClient`]. Non-2xx responses are
//! returned as-is; only transport failures are errors.

#[cfg(feature = "online")]
mod http;

#[cfg(feature = "online")]
pub use http::HttpNetwork;

use crate::error::{LcpError, LcpResult};
use async_trait::async_trait;
use std::time::Duration;

/// HTTP method of a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
    Get,
    Post,
    Put,
}

impl std::fmt::Display for Method {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Get => "GET",
            Self::Post => "POST",
            Self::Put => "PUT",
        })
    }
}

/// An outgoing request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchRequest {
    pub url: String,
    pub method: Method,
    /// Query parameters.
    pub params: Vec<(String, String)>,
    pub headers: Vec<(String, String)>,
    /// Upper bound for the whole exchange.
    pub timeout: Option<Duration>,
}

impl FetchRequest {
    /// Creates a GET request.
    pub fn get(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            method: Method::Get,
            params: Vec::new(),
            headers: Vec::new(),
            timeout: None,
        }
    }

    /// Creates a request with the given method.
    pub fn new(method: Method, url: impl Into<String>) -> Self {
        Self {
            method,
            ..Self::get(url)
        }
    }

    pub fn with_params<K, V>(mut self, params: impl IntoIterator<Item = (K, V)>) -> Self
    where
        K: Into<String>,
        V: Into<String>,
    {
        self.params
            .extend(params.into_iter().map(|(k, v)| (k.into(), v.into())));
        self
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// A response received from the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchResponse {
    /// HTTP status code.
    pub status: u16,
    pub body: Vec<u8>,
}

impl FetchResponse {
    /// Returns true for 2xx status codes.
    #[must_use]
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// Performs HTTP requests on behalf of the engine.
#[async_trait]
pub trait NetworkClient: Send + Sync {
    /// Sends the request and returns the response, whatever its status.
    ///
    /// Returns [`LcpError::Network`] on transport failures.
    async fn fetch(&self, request: FetchRequest) -> LcpResult<FetchResponse>;
}

/// Sends `request`, enforcing its timeout on top of the client's own.
pub(crate) async fn fetch_with_timeout(
    network: &dyn NetworkClient,
    request: FetchRequest,
) -> LcpResult<FetchResponse> {
    match request.timeout {
        Some(timeout) => {
            let url = request.url.clone();
            tokio::time::timeout(timeout, network.fetch(request))
                .await
                .map_err(|_| LcpError::Network(format!("request to {url} timed out")))?
        }
        None => network.fetch(request).await,
    }
}

/// Sends `request` and returns the body of a 2xx response.
pub(crate) async fn fetch_success(
    network: &dyn NetworkClient,
    request: FetchRequest,
) -> LcpResult<Vec<u8>> {
    let url = request.url.clone();
    let response = fetch_with_timeout(network, request).await?;
    if !response.is_success() {
        return Err(LcpError::Network(format!(
            "unexpected HTTP {} from {url}",
            response.status
        )));
    }
    Ok(response.body)
}
