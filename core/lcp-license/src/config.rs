//! Engine configuration.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Default revocation authority.
pub const DEFAULT_CRL_URL: &str = "http://crl.edrlab.telesec.de/rl/EDRLab_CA.crl";

/// A cached CRL is fresh for this long (7 days).
pub const CRL_MAX_AGE_SECS: i64 = 7 * 24 * 60 * 60;

/// Encryption profiles the engine accepts.
pub const SUPPORTED_PROFILES: &[&str] = &[
    "http://readium.org/lcp/basic-profile",
    "http://readium.org/lcp/profile-1.0",
    "http://readium.org/lcp/profile-2.0",
    "http://readium.org/lcp/profile-2.1",
    "http://readium.org/lcp/profile-2.2",
    "http://readium.org/lcp/profile-2.3",
    "http://readium.org/lcp/profile-2.4",
    "http://readium.org/lcp/profile-2.5",
    "http://readium.org/lcp/profile-2.6",
    "http://readium.org/lcp/profile-2.7",
    "http://readium.org/lcp/profile-2.8",
    "http://readium.org/lcp/profile-2.9",
];

/// Configuration for the validation engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LcpConfig {
    /// URL of the certificate revocation list.
    pub crl_url: String,
    /// Age after which the cached CRL is refreshed (seconds).
    pub crl_max_age_secs: i64,
    /// Timeout for the CRL download (ms).
    pub crl_timeout_ms: u64,
    /// Timeout for the status document fetch (ms).
    pub status_timeout_ms: u64,
    /// Timeout for the refreshed license fetch (ms).
    pub license_timeout_ms: u64,
    /// Timeout for device registration, renew and return (ms).
    pub registration_timeout_ms: u64,
    /// Fail validation when the status document can't be fetched.
    pub require_status: bool,
    /// Fail validation when no CRL is available, even a stale one.
    pub require_crl: bool,
    /// Accepted encryption profiles.
    pub supported_profiles: Vec<String>,
    /// Device name sent on registration, defaults to the host name.
    pub device_name: Option<String>,
}

impl Default for LcpConfig {
    fn default() -> Self {
        Self {
            crl_url: DEFAULT_CRL_URL.to_string(),
            crl_max_age_secs: CRL_MAX_AGE_SECS,
            crl_timeout_ms: 30_000,
            status_timeout_ms: 5_000,
            license_timeout_ms: 5_000,
            registration_timeout_ms: 30_000,
            require_status: false,
            require_crl: true,
            supported_profiles: SUPPORTED_PROFILES.iter().map(|p| p.to_string()).collect(),
            device_name: None,
        }
    }
}

impl LcpConfig {
    pub fn crl_timeout(&self) -> Duration {
        Duration::from_millis(self.crl_timeout_ms)
    }

    pub fn status_timeout(&self) -> Duration {
        Duration::from_millis(self.status_timeout_ms)
    }

    pub fn license_timeout(&self) -> Duration {
        Duration::from_millis(self.license_timeout_ms)
    }

    pub fn registration_timeout(&self) -> Duration {
        Duration::from_millis(self.registration_timeout_ms)
    }

    /// Returns true if licenses with this encryption profile can be opened.
    pub fn supports_profile(&self, profile: &str) -> bool {
        self.supported_profiles.iter().any(|p| p == profile)
    }
}
