//! Entry point of the engine.
//!
//! [`LicenseService`] wires the collaborators together, serializes
//! validations of the same license and keeps the license container and the
//! repository in sync with the newest license.

use crate::config::LcpConfig;
use crate::container::{LicenseContainer, ZipContainer};
use crate::crl::RevocationCache;
use crate::device::DeviceService;
use crate::document::{media_type, LicenseDocument};
use crate::error::{LcpError, LcpResult};
use crate::license::License;
use crate::lock::KeyedLock;
use crate::network::{fetch_success, FetchRequest, NetworkClient};
use crate::passphrase::{Authenticator, PassphraseResolver};
use crate::provider::DecryptionProvider;
use crate::store::{DeviceRepository, KeyValueStore, LicenseRepository, PassphraseRepository};
use crate::validation::{Interaction, LicenseValidator, ValidationState};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};

/// The persistence collaborators.
#[derive(Clone)]
pub struct Repositories {
    pub licenses: Arc<dyn LicenseRepository>,
    pub passphrases: Arc<dyn PassphraseRepository>,
    pub devices: Arc<dyn DeviceRepository>,
    pub values: Arc<dyn KeyValueStore>,
}

impl Repositories {
    /// Uses one store for every repository.
    pub fn shared<S>(store: Arc<S>) -> Self
    where
        S: LicenseRepository + PassphraseRepository + DeviceRepository + KeyValueStore + 'static,
    {
        Self {
            licenses: store.clone(),
            passphrases: store.clone(),
            devices: store.clone(),
            values: store,
        }
    }
}

/// A publication downloaded from a `.lcpl` file.
#[derive(Debug)]
pub struct AcquiredPublication {
    /// Where the publication was written.
    pub path: PathBuf,
    pub suggested_filename: String,
    pub license: LicenseDocument,
}

/// Opens licenses and acquires publications.
pub struct LicenseService {
    validator: Arc<LicenseValidator>,
    crl: Arc<RevocationCache>,
    licenses: Arc<dyn LicenseRepository>,
    network: Arc<dyn NetworkClient>,
    locks: Arc<KeyedLock>,
}

impl LicenseService {
    pub fn new(
        config: LcpConfig,
        provider: Arc<dyn DecryptionProvider>,
        network: Arc<dyn NetworkClient>,
        repositories: Repositories,
    ) -> Self {
        let crl = Arc::new(RevocationCache::new(
            Arc::clone(&network),
            Arc::clone(&repositories.values),
            &config,
        ));
        let device = Arc::new(DeviceService::new(
            Arc::clone(&network),
            repositories.devices,
            repositories.values,
            &config,
        ));
        let passphrases = Arc::new(PassphraseResolver::new(
            Arc::clone(&provider),
            repositories.passphrases,
        ));
        let validator = Arc::new(LicenseValidator::new(
            config,
            provider,
            Arc::clone(&network),
            Arc::clone(&crl),
            device,
            passphrases,
        ));

        Self {
            validator,
            crl,
            licenses: repositories.licenses,
            network,
            locks: Arc::new(KeyedLock::new()),
        }
    }

    pub fn validator(&self) -> &Arc<LicenseValidator> {
        &self.validator
    }

    pub fn crl(&self) -> &Arc<RevocationCache> {
        &self.crl
    }

    pub fn device(&self) -> &Arc<DeviceService> {
        self.validator.device()
    }

    pub fn licenses(&self) -> &Arc<dyn LicenseRepository> {
        &self.licenses
    }

    /// Parses the license of a container without validating it.
    pub fn retrieve_license_document(
        &self,
        container: &dyn LicenseContainer,
    ) -> LcpResult<LicenseDocument> {
        LicenseDocument::parse(&container.read()?)
    }

    /// Validates the license of a container.
    ///
    /// Validations of the same license id run one at a time. When the
    /// license was refreshed from its status document, the container is
    /// rewritten with the new one. The returned [`License`] keeps the
    /// container to do the same after a renewal or a return.
    pub async fn retrieve_license(
        &self,
        container: Arc<dyn LicenseContainer>,
        authenticator: Option<&dyn Authenticator>,
        allow_interaction: bool,
    ) -> LcpResult<License> {
        let data = container.read()?;
        let id = LicenseDocument::parse(&data)?.id().to_string();
        let _guard = self.locks.lock(&id).await;

        let interaction = Interaction {
            authenticator,
            allow_interaction,
        };
        let documents = self
            .validator
            .validate(ValidationState::start(data.clone()), interaction, |license| {
                persist_license(self.licenses.as_ref(), container.as_ref(), &data, license);
            })
            .await?;

        Ok(License::new(
            documents,
            Arc::clone(&self.validator),
            Arc::clone(&self.licenses),
            container,
            Arc::clone(&self.locks),
        ))
    }

    /// Downloads the publication of a `.lcpl` license into `destination`.
    ///
    /// The license is written into the downloaded archive, so the file can
    /// be opened with a [`ZipContainer`]. Plain PDF downloads are left as
    /// served.
    pub async fn acquire_publication(
        &self,
        lcpl: &[u8],
        destination: &Path,
    ) -> LcpResult<AcquiredPublication> {
        let license = LicenseDocument::parse(lcpl)?;
        let link = license.publication_link().clone();

        let body = fetch_success(self.network.as_ref(), FetchRequest::get(link.url(&[])?)).await?;
        if let Some(expected) = link.hash.as_deref() {
            if !digest_matches(&body, expected) {
                return Err(LcpError::Network(
                    "digest mismatch: download looks corrupted".to_string(),
                ));
            }
        }

        let extension = extension_for(link.media_type.as_deref());
        let suggested_filename = format!("{}.{extension}", license.id());
        tokio::fs::create_dir_all(destination)
            .await
            .map_err(|e| LcpError::Container(format!("can't create {}: {e}", destination.display())))?;
        let path = destination.join(&suggested_filename);
        tokio::fs::write(&path, &body)
            .await
            .map_err(|e| LcpError::Container(format!("can't write {}: {e}", path.display())))?;

        if extension != "pdf" {
            let container = ZipContainer::new(&path);
            if let Err(e) = container.write(&license) {
                let _ = tokio::fs::remove_file(&path).await;
                return Err(e);
            }
        }

        info!("publication of license {} saved to {}", license.id(), path.display());
        Ok(AcquiredPublication {
            path,
            suggested_filename,
            license,
        })
    }
}

impl std::fmt::Debug for LicenseService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LicenseService")
            .field("validator", &self.validator)
            .finish_non_exhaustive()
    }
}

/// Records a validated license and writes it back to its container when it
/// differs from `previous`. Failures are logged only.
pub(crate) fn persist_license(
    licenses: &dyn LicenseRepository,
    container: &dyn LicenseContainer,
    previous: &[u8],
    license: &LicenseDocument,
) {
    if let Err(e) = licenses.add_license(license) {
        warn!("failed to store license {}: {e}", license.id());
    }
    if license.as_bytes() != previous {
        match container.write(license) {
            Ok(()) => info!("license {} updated in its container", license.id()),
            Err(e) => warn!("failed to update license container: {e}"),
        }
    }
}

/// Checks a SHA-256 digest given as base64 (44 chars) or hex (64 chars).
#[must_use]
pub fn digest_matches(data: &[u8], expected: &str) -> bool {
    let actual = Sha256::digest(data);
    match expected.len() {
        44 => BASE64
            .decode(expected)
            .is_ok_and(|decoded| decoded.as_slice() == actual.as_slice()),
        64 => hex::decode(expected).is_ok_and(|decoded| decoded.as_slice() == actual.as_slice()),
        _ => false,
    }
}

fn extension_for(media: Option<&str>) -> &'static str {
    let essence = media
        .and_then(|m| m.split(';').next())
        .map(|m| m.trim().to_ascii_lowercase());
    match essence.as_deref() {
        Some(media_type::PDF) => "pdf",
        Some(media_type::LCP_PDF) => "lcpdf",
        Some(media_type::LCP_AUDIOBOOK) => "lcpa",
        Some(media_type::AUDIOBOOK) => "audiobook",
        _ => "epub",
    }
}
