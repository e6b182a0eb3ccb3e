//! Device identity and registration.
//!
//! Each install gets a random identifier, generated once and persisted. The
//! license server is told about the device through the status document's
//! `register` link, at most once per license.

use crate::config::LcpConfig;
use crate::document::{LicenseDocument, Link};
use crate::error::LcpResult;
use crate::lock::KeyedLock;
use crate::network::{fetch_success, FetchRequest, Method, NetworkClient};
use crate::store::{DeviceRepository, KeyValueStore};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Store key of the device identifier.
pub const DEVICE_ID_KEY: &str = "lcp.device_id";

/// Result of a registration attempt. Registration never fails validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistrationOutcome {
    /// The device was already registered for this license.
    AlreadyRegistered,
    /// The server accepted the device; carries the response body, usually an
    /// updated Status Document.
    Registered(Vec<u8>),
    /// The registration failed.
    NotRegistered(String),
}

impl RegistrationOutcome {
    /// Returns true if the device is known to the server.
    #[must_use]
    pub fn is_registered(&self) -> bool {
        !matches!(self, Self::NotRegistered(_))
    }
}

/// Identity of this device towards license servers.
pub struct DeviceService {
    network: Arc<dyn NetworkClient>,
    repository: Arc<dyn DeviceRepository>,
    store: Arc<dyn KeyValueStore>,
    name: String,
    timeout: Duration,
    id: Mutex<Option<String>>,
    locks: KeyedLock,
}

impl DeviceService {
    pub fn new(
        network: Arc<dyn NetworkClient>,
        repository: Arc<dyn DeviceRepository>,
        store: Arc<dyn KeyValueStore>,
        config: &LcpConfig,
    ) -> Self {
        Self {
            network,
            repository,
            store,
            name: config.device_name.clone().unwrap_or_else(get_hostname),
            timeout: config.registration_timeout(),
            id: Mutex::new(None),
            locks: KeyedLock::new(),
        }
    }

    /// Returns the device identifier, generating and persisting it on first
    /// use.
    pub fn id(&self) -> LcpResult<String> {
        let mut cached = self.id.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(id) = cached.as_ref() {
            return Ok(id.clone());
        }

        let id = match self.store.get(DEVICE_ID_KEY)? {
            Some(id) => id,
            None => {
                let id = Uuid::new_v4().to_string();
                self.store.set(DEVICE_ID_KEY, &id)?;
                info!("generated device id {id}");
                id
            }
        };
        *cached = Some(id.clone());
        Ok(id)
    }

    /// Returns the device name shown to license servers.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Parameters identifying the device in server requests.
    pub fn as_query_parameters(&self) -> LcpResult<Vec<(String, String)>> {
        Ok(vec![
            ("id".to_string(), self.id()?),
            ("name".to_string(), self.name.clone()),
        ])
    }

    /// Returns true if the device is recorded as registered for the license.
    pub fn is_registered(&self, license_id: &str) -> LcpResult<bool> {
        self.repository.is_device_registered(license_id)
    }

    /// Registers the device through `link` unless already done for this
    /// license.
    ///
    /// Concurrent calls for the same license are serialized, so the server
    /// sees at most one request.
    pub async fn register_if_needed(
        &self,
        license: &LicenseDocument,
        link: &Link,
    ) -> RegistrationOutcome {
        let _guard = self.locks.lock(license.id()).await;

        match self.repository.is_device_registered(license.id()) {
            Ok(true) => {
                debug!("device already registered for license {}", license.id());
                return RegistrationOutcome::AlreadyRegistered;
            }
            Ok(false) => {}
            Err(e) => {
                warn!("failed to read registration of license {}: {e}", license.id());
                return RegistrationOutcome::NotRegistered(e.to_string());
            }
        }

        match self.register(link).await {
            Ok(body) => {
                if let Err(e) = self.repository.register_device(license.id()) {
                    warn!("failed to record registration of license {}: {e}", license.id());
                }
                info!("device registered for license {}", license.id());
                RegistrationOutcome::Registered(body)
            }
            Err(e) => {
                warn!("device registration failed for license {}: {e}", license.id());
                RegistrationOutcome::NotRegistered(e.to_string())
            }
        }
    }

    async fn register(&self, link: &Link) -> LcpResult<Vec<u8>> {
        let params = self.as_query_parameters()?;
        let pairs: Vec<(&str, &str)> = params
            .iter()
            .map(|(k, v)| (k.as_str(), v.as_str()))
            .collect();
        let url = link.url(&pairs)?;

        let request = FetchRequest::new(Method::Post, url).with_timeout(self.timeout);
        fetch_success(self.network.as_ref(), request).await
    }
}

impl std::fmt::Debug for DeviceService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceService")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

/// Gets the machine hostname.
fn get_hostname() -> String {
    hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "unknown".to_string())
}
