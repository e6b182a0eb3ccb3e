//! Certificate Revocation List cache.
//!
//! The CRL is downloaded from the revocation authority and kept in the
//! [`KeyValueStore`]. A cached list younger than the configured max age is
//! served without network access. An older one triggers a download; if that
//! fails the stale list is still served.

use crate::config::LcpConfig;
use crate::error::{LcpError, LcpResult};
use crate::network::{fetch_success, FetchRequest, NetworkClient};
use crate::store::KeyValueStore;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use chrono::{DateTime, Utc};
use futures::future::{self, BoxFuture, FutureExt, Shared};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Store key of the cached list.
pub const CRL_STORE_KEY: &str = "lcp.crl";

const PEM_HEADER: &str = "-----BEGIN X509 CRL-----";
const PEM_FOOTER: &str = "-----END X509 CRL-----";

/// A downloaded revocation list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RevocationList {
    /// PEM-encoded CRL.
    pub pem: String,
    pub fetched_at: DateTime<Utc>,
}

impl RevocationList {
    /// Builds a list from the body served by the revocation authority.
    ///
    /// DER bodies are wrapped as PEM, PEM bodies are kept as-is.
    pub fn from_response(body: &[u8], fetched_at: DateTime<Utc>) -> Self {
        let pem = match std::str::from_utf8(body) {
            Ok(text) if text.trim_start().starts_with(PEM_HEADER) => text.trim().to_string(),
            _ => format!("{PEM_HEADER}{}{PEM_FOOTER}", BASE64.encode(body)),
        };
        Self { pem, fetched_at }
    }

    /// Returns true if the list is younger than `max_age` at `now`.
    #[must_use]
    pub fn is_fresh(&self, now: DateTime<Utc>, max_age: chrono::Duration) -> bool {
        now.signed_duration_since(self.fetched_at) < max_age
    }
}

type SharedFetch = Shared<BoxFuture<'static, Result<RevocationList, String>>>;

/// Cached access to the CRL.
pub struct RevocationCache {
    network: Arc<dyn NetworkClient>,
    store: Arc<dyn KeyValueStore>,
    url: String,
    max_age: chrono::Duration,
    timeout: Duration,
    in_flight: Mutex<Option<SharedFetch>>,
}

impl RevocationCache {
    pub fn new(
        network: Arc<dyn NetworkClient>,
        store: Arc<dyn KeyValueStore>,
        config: &LcpConfig,
    ) -> Self {
        Self {
            network,
            store,
            url: config.crl_url.clone(),
            max_age: chrono::Duration::seconds(config.crl_max_age_secs),
            timeout: config.crl_timeout(),
            in_flight: Mutex::new(None),
        }
    }

    /// Returns the PEM of the CRL, downloading it if the cache is stale.
    ///
    /// # Errors
    ///
    /// Returns [`LcpError::CrlFetching`] if the download fails and nothing is
    /// cached.
    pub async fn get(&self) -> LcpResult<String> {
        self.list().await.map(|list| list.pem)
    }

    /// Same as [`get`](Self::get), returning the whole list.
    pub async fn list(&self) -> LcpResult<RevocationList> {
        let cached = self.cached();
        if let Some(list) = &cached {
            if list.is_fresh(Utc::now(), self.max_age) {
                debug!("using cached CRL from {}", list.fetched_at);
                return Ok(list.clone());
            }
        }

        match self.shared_fetch(false).await {
            Ok(list) => Ok(list),
            Err(reason) => match cached {
                Some(stale) => {
                    warn!("CRL refresh failed, using list from {}: {reason}", stale.fetched_at);
                    Ok(stale)
                }
                None => Err(LcpError::CrlFetching(reason)),
            },
        }
    }

    /// Downloads the CRL regardless of the cache age.
    pub async fn refresh(&self) -> LcpResult<RevocationList> {
        self.shared_fetch(true).await.map_err(LcpError::CrlFetching)
    }

    /// Returns the cached list, if any.
    pub fn cached(&self) -> Option<RevocationList> {
        match self.store.get(CRL_STORE_KEY) {
            Ok(Some(json)) => match serde_json::from_str(&json) {
                Ok(list) => Some(list),
                Err(e) => {
                    warn!("ignoring unreadable cached CRL: {e}");
                    None
                }
            },
            Ok(None) => None,
            Err(e) => {
                warn!("failed to read cached CRL: {e}");
                None
            }
        }
    }

    /// Joins the download in progress or starts a new one.
    ///
    /// Unless `force` is set, a list cached by a download that completed
    /// since the caller looked is returned instead of downloading again.
    fn shared_fetch(&self, force: bool) -> SharedFetch {
        let mut slot = self.in_flight.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(fetch) = slot.as_ref() {
            if fetch.peek().is_none() {
                return fetch.clone();
            }
        }
        if !force {
            if let Some(list) = self.cached().filter(|l| l.is_fresh(Utc::now(), self.max_age)) {
                debug!("CRL was refreshed at {}", list.fetched_at);
                return future::ready(Ok::<_, String>(list)).boxed().shared();
            }
        }

        let fetch = download(
            Arc::clone(&self.network),
            Arc::clone(&self.store),
            self.url.clone(),
            self.timeout,
        )
        .boxed()
        .shared();
        *slot = Some(fetch.clone());
        fetch
    }
}

impl std::fmt::Debug for RevocationCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RevocationCache")
            .field("url", &self.url)
            .field("max_age", &self.max_age)
            .finish_non_exhaustive()
    }
}

async fn download(
    network: Arc<dyn NetworkClient>,
    store: Arc<dyn KeyValueStore>,
    url: String,
    timeout: Duration,
) -> Result<RevocationList, String> {
    debug!("downloading CRL from {url}");
    let body = fetch_success(network.as_ref(), FetchRequest::get(&url).with_timeout(timeout))
        .await
        .map_err(|e| e.to_string())?;
    if body.is_empty() {
        return Err(format!("empty CRL served by {url}"));
    }

    let list = RevocationList::from_response(&body, Utc::now());
    match serde_json::to_string(&list) {
        Ok(json) => {
            if let Err(e) = store.set(CRL_STORE_KEY, &json) {
                warn!("failed to cache CRL: {e}");
            }
        }
        Err(e) => warn!("failed to serialize CRL: {e}"),
    }

    info!("CRL refreshed from {url}");
    Ok(list)
}
