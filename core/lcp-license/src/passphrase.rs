//! Passphrase resolution.
//!
//! A license is unlocked with the SHA-256 hash of the user's passphrase.
//! Hashes accepted before are tried first: the one stored for this license,
//! then those of the same user, then every other one. Only when none
//! matches is the caller's [`Authenticator`] asked.

use crate::document::LicenseDocument;
use crate::error::{LcpError, LcpResult};
use crate::provider::{run_blocking, DecryptionProvider};
use crate::store::{PassphraseEntry, PassphraseRepository};
use async_trait::async_trait;
use sha2::{Digest, Sha256};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Why the authenticator is being asked for a passphrase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AuthenticationReason {
    /// No stored passphrase unlocks the license.
    PassphraseNotFound,
    /// The passphrase entered last time was wrong.
    InvalidPassphrase,
}

/// Asks the user for the clear passphrase of a license.
#[async_trait]
pub trait Authenticator: Send + Sync {
    /// Returns the clear passphrase, or `None` if the user cancelled.
    async fn retrieve_passphrase(
        &self,
        license: &LicenseDocument,
        reason: AuthenticationReason,
        allow_interaction: bool,
    ) -> Option<String>;
}

/// Hashes a clear passphrase as expected by the provider.
#[must_use]
pub fn hash_passphrase(clear: &str) -> String {
    hex::encode(Sha256::digest(clear.as_bytes()))
}

/// Returns true if `value` looks like an already hashed passphrase.
#[must_use]
pub fn is_hashed_passphrase(value: &str) -> bool {
    value.len() == 64 && value.bytes().all(|b| b.is_ascii_hexdigit())
}

/// Hashes to try for a passphrase typed by the user.
///
/// Some providers hand out the hash itself, so a 64-character hex input is
/// also tried verbatim.
#[must_use]
pub fn candidate_hashes(clear: &str) -> Vec<String> {
    let mut candidates = vec![hash_passphrase(clear)];
    if is_hashed_passphrase(clear) && candidates[0] != clear {
        candidates.push(clear.to_string());
    }
    candidates
}

/// Removes duplicates, keeping the first occurrence of each value.
#[must_use]
pub fn dedup_candidates<I>(candidates: I) -> Vec<String>
where
    I: IntoIterator<Item = String>,
{
    let mut seen = HashSet::new();
    candidates
        .into_iter()
        .filter(|c| seen.insert(c.clone()))
        .collect()
}

/// Finds the passphrase able to unlock a license.
pub struct PassphraseResolver {
    provider: Arc<dyn DecryptionProvider>,
    repository: Arc<dyn PassphraseRepository>,
}

impl PassphraseResolver {
    pub fn new(
        provider: Arc<dyn DecryptionProvider>,
        repository: Arc<dyn PassphraseRepository>,
    ) -> Self {
        Self {
            provider,
            repository,
        }
    }

    /// Stored passphrases worth trying for `license`, most specific first.
    pub fn candidates(&self, license: &LicenseDocument) -> LcpResult<Vec<String>> {
        let mut all = Vec::new();
        if let Some(passphrase) = self.repository.passphrase(license.id())? {
            all.push(passphrase);
        }
        if let Some(user_id) = license.user().id.as_deref() {
            all.extend(self.repository.passphrases_for_user(user_id)?);
        }
        all.extend(self.repository.all_passphrases()?);
        Ok(dedup_candidates(all))
    }

    /// Returns the hashed passphrase unlocking `license`.
    ///
    /// # Errors
    ///
    /// Returns [`LcpError::PassphraseRequired`] if no stored passphrase
    /// matches and the authenticator is missing, not allowed to interact or
    /// declines. Returns [`LcpError::InvalidRequest`] if the provider
    /// rejects the license.
    pub async fn resolve(
        &self,
        license: &LicenseDocument,
        authenticator: Option<&dyn Authenticator>,
        allow_interaction: bool,
    ) -> LcpResult<String> {
        let candidates = self.candidates(license)?;
        if !candidates.is_empty() {
            debug!("trying {} stored passphrase(s) for license {}", candidates.len(), license.id());
            if let Some(found) = self.find_valid(license, candidates).await? {
                self.remember(license, &found);
                return Ok(found);
            }
        }

        let Some(authenticator) = authenticator.filter(|_| allow_interaction) else {
            return Err(LcpError::PassphraseRequired);
        };

        let mut reason = AuthenticationReason::PassphraseNotFound;
        loop {
            let Some(clear) = authenticator
                .retrieve_passphrase(license, reason, allow_interaction)
                .await
            else {
                info!("passphrase request cancelled for license {}", license.id());
                return Err(LcpError::PassphraseRequired);
            };

            if let Some(found) = self.find_valid(license, candidate_hashes(&clear)).await? {
                self.remember(license, &found);
                return Ok(found);
            }
            debug!("wrong passphrase for license {}", license.id());
            reason = AuthenticationReason::InvalidPassphrase;
        }
    }

    async fn find_valid(
        &self,
        license: &LicenseDocument,
        candidates: Vec<String>,
    ) -> LcpResult<Option<String>> {
        let provider = Arc::clone(&self.provider);
        let json = license.json().to_string();
        run_blocking(move || {
            provider
                .find_valid_passphrase(&json, &candidates)
                .map_err(|e| LcpError::InvalidRequest(e.to_string()))
        })
        .await
    }

    fn remember(&self, license: &LicenseDocument, passphrase: &str) {
        let entry = PassphraseEntry {
            license_id: license.id().to_string(),
            provider: license.provider().to_string(),
            user_id: license.user().id.clone(),
            passphrase: passphrase.to_string(),
        };
        if let Err(e) = self.repository.add_passphrase(&entry) {
            warn!("failed to store passphrase of license {}: {e}", license.id());
        }
    }
}

impl std::fmt::Debug for PassphraseResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PassphraseResolver").finish_non_exhaustive()
    }
}
