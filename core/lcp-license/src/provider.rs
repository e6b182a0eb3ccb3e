//! Decryption Provider seam.
//!
//! Signature checks, certificate chain validation and content key unwrapping
//! are performed by a native LCP library. The engine only sees the fixed
//! interface below, so its logic runs the same against a fake provider.

use crate::error::LcpError;
use std::any::Any;

/// Error reported by the provider, carrying its native code.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderError {
    pub code: i32,
    pub message: String,
}

impl ProviderError {
    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

impl std::fmt::Display for ProviderError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "provider error {}: {}", self.code, self.message)
    }
}

impl std::error::Error for ProviderError {}

impl From<ProviderError> for LcpError {
    fn from(err: ProviderError) -> Self {
        LcpError::from_provider_code(err.code, &err.message)
    }
}

/// Opaque provider handle bound to one verified (license, passphrase) pair.
///
/// Each provider wraps its own native type inside this. It is never
/// serialized and is dropped with the license owning it.
pub struct DecryptionContext(Box<dyn Any + Send + Sync>);

impl DecryptionContext {
    /// Wraps a provider-specific context.
    pub fn new<T: Any + Send + Sync + 'static>(inner: T) -> Self {
        Self(Box::new(inner))
    }

    /// Borrows back the provider-specific context.
    pub fn downcast_ref<T: Any + Send + Sync + 'static>(&self) -> Option<&T> {
        self.0.downcast_ref::<T>()
    }
}

impl std::fmt::Debug for DecryptionContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("DecryptionContext([REDACTED])")
    }
}

/// Native LCP operations.
///
/// Calls may block; the engine runs them on the blocking thread pool.
pub trait DecryptionProvider: Send + Sync {
    /// Verifies the license signature and certificate chain against the CRL,
    /// then unwraps the content key with the hashed passphrase.
    fn create_context(
        &self,
        license_json: &str,
        hashed_passphrase: &str,
        crl_pem: Option<&str>,
    ) -> Result<DecryptionContext, ProviderError>;

    /// Decrypts publication bytes with a context created by this provider.
    fn decrypt(&self, context: &DecryptionContext, data: &[u8]) -> Result<Vec<u8>, ProviderError>;

    /// Returns the first candidate, in order, that matches the license's user
    /// key check, or `None` if none does.
    fn find_valid_passphrase(
        &self,
        license_json: &str,
        candidates: &[String],
    ) -> Result<Option<String>, ProviderError>;
}

/// Runs a provider call on the blocking thread pool.
pub(crate) async fn run_blocking<T, F>(call: F) -> Result<T, LcpError>
where
    F: FnOnce() -> Result<T, LcpError> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(call)
        .await
        .map_err(|e| LcpError::Unknown(format!("provider task failed: {e}")))?
}
