//! Error types for the LCP engine.

use chrono::{DateTime, Utc};
use thiserror::Error;

/// LCP-specific errors.
///
/// Every validation attempt ends either with a usable license or with exactly
/// one of these, suitable for display to the user.
#[derive(Debug, Error)]
pub enum LcpError {
    // ── License status ───────────────────────────────────────────
    /// The license starts in the future.
    #[error("this license starts on {start}")]
    NotStarted { start: DateTime<Utc> },

    /// The license end date is in the past.
    #[error("this license expired on {end}")]
    Expired { end: DateTime<Utc> },

    /// The provider revoked the license.
    #[error("this license was revoked by its provider on {date}, it was registered by {devices_count} device(s)")]
    Revoked {
        date: DateTime<Utc>,
        devices_count: usize,
    },

    /// The loan was returned.
    #[error("this license has been returned on {date}")]
    Returned { date: DateTime<Utc> },

    /// The license was cancelled.
    #[error("this license was cancelled on {date}")]
    Cancelled { date: DateTime<Utc> },

    // ── Integrity (provider) ─────────────────────────────────────
    /// Certificate has been revoked in the CRL.
    #[error("certificate has been revoked in the CRL")]
    CertificateRevoked,

    /// Certificate has not been signed by the CA.
    #[error("certificate has not been signed by CA")]
    InvalidCertificateSignature,

    /// License has been issued by an expired certificate.
    #[error("license has been issued by an expired certificate")]
    InvalidLicenseSignatureDate,

    /// License signature does not match.
    #[error("license signature does not match")]
    InvalidLicenseSignature,

    /// User key check invalid.
    #[error("user key check invalid")]
    InvalidUserKeyCheck,

    // ── Decryption (provider) ────────────────────────────────────
    /// Unable to decrypt the content key with the user key.
    #[error("unable to decrypt encrypted content key from user key")]
    ContentKeyDecryptError,

    /// Unable to decrypt content with the content key.
    #[error("unable to decrypt encrypted content from content key")]
    ContentDecryptError,

    // ── Passphrase ───────────────────────────────────────────────
    /// No passphrase could unlock the license and the user did not provide one.
    #[error("passphrase is not available")]
    PassphraseRequired,

    /// The provider rejected the license while checking passphrases.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    // ── Network ──────────────────────────────────────────────────
    /// A mandatory document could not be fetched and nothing is cached.
    #[error("network unavailable: {0}")]
    NetworkUnavailable(String),

    /// A network request failed.
    #[error("network error: {0}")]
    Network(String),

    /// The certificate revocation list can't be retrieved.
    #[error("can't retrieve the certificate revocation list: {0}")]
    CrlFetching(String),

    // ── Parsing ──────────────────────────────────────────────────
    /// The JSON is malformed and can't be parsed.
    #[error("malformed JSON: {0}")]
    MalformedJson(String),

    /// The JSON is not a valid License Document.
    #[error("invalid license document: {0}")]
    InvalidLicenseDocument(String),

    /// The JSON is not a valid Status Document.
    #[error("invalid status document: {0}")]
    InvalidStatusDocument(String),

    /// A link is missing or its URL is invalid.
    #[error("invalid link '{rel}': {reason}")]
    InvalidLink { rel: String, reason: String },

    /// The license profile is not supported.
    #[error("license profile not supported: {0}")]
    LicenseProfileNotSupported(String),

    // ── Loan interactions ────────────────────────────────────────
    /// The interaction is not available with this license.
    #[error("this interaction is not available")]
    LicenseInteractionNotAvailable,

    /// The publication could not be renewed.
    #[error("publication could not be renewed properly")]
    RenewFailed,

    /// Incorrect renewal period.
    #[error("incorrect renewal period, your publication could not be renewed")]
    InvalidRenewalPeriod { max_renew_date: Option<DateTime<Utc>> },

    /// The publication could not be returned.
    #[error("publication could not be returned properly")]
    ReturnFailed,

    /// The publication has already been returned or is expired.
    #[error("publication has already been returned before or is expired")]
    AlreadyReturnedOrExpired,

    /// An unexpected error occurred on the licensing server.
    #[error("an unexpected error has occurred on the server (HTTP {0})")]
    UnexpectedServerError(u16),

    // ── Local resources ──────────────────────────────────────────
    /// Can't read or write the license container.
    #[error("license container error: {0}")]
    Container(String),

    /// Storage error.
    #[error("storage error: {0}")]
    Storage(String),

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// An unknown low-level error was reported.
    #[error("unknown LCP error: {0}")]
    Unknown(String),
}

impl LcpError {
    /// Maps a Decryption Provider error code to its failure kind.
    ///
    /// Codes 11 (out of date) and 121 (invalid context) have no recovery path
    /// and surface as [`LcpError::Unknown`], like any unlisted code.
    #[must_use]
    pub fn from_provider_code(code: i32, message: &str) -> Self {
        match code {
            101 => Self::CertificateRevoked,
            102 => Self::InvalidCertificateSignature,
            111 => Self::InvalidLicenseSignatureDate,
            112 => Self::InvalidLicenseSignature,
            131 => Self::ContentKeyDecryptError,
            141 => Self::InvalidUserKeyCheck,
            151 => Self::ContentDecryptError,
            _ => Self::Unknown(format!("provider error {code}: {message}")),
        }
    }

    /// Returns true if this error comes from the license status or dates.
    #[must_use]
    pub fn is_status_error(&self) -> bool {
        matches!(
            self,
            Self::NotStarted { .. }
                | Self::Expired { .. }
                | Self::Revoked { .. }
                | Self::Returned { .. }
                | Self::Cancelled { .. }
        )
    }

    /// Returns true if the license signature or certificate chain is untrusted.
    #[must_use]
    pub fn is_integrity_error(&self) -> bool {
        matches!(
            self,
            Self::CertificateRevoked
                | Self::InvalidCertificateSignature
                | Self::InvalidLicenseSignatureDate
                | Self::InvalidLicenseSignature
                | Self::InvalidUserKeyCheck
        )
    }

    /// Returns true if trying again later may succeed.
    ///
    /// Provider failures are never retryable.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::NetworkUnavailable(_) | Self::Network(_) | Self::CrlFetching(_)
        )
    }
}

/// Result type for LCP operations.
pub type LcpResult<T> = Result<T, LcpError>;
