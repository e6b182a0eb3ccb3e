//! License validation state machine.
//!
//! A validation attempt walks through the states below, one [`step`] at a
//! time, until it reaches [`ValidationState::Valid`] or
//! [`ValidationState::Failed`]:
//!
//! ```text
//! Start -> FetchingStatus -> CheckingLicenseStatus -> CheckingLicenseDates
//!   ^                                |
//!   +------- FetchingLicense <-------+
//!
//! CheckingLicenseDates -> RequestingPassphrase -> CreatingContext
//!   -> [RegisteringDevice] -> Valid
//! ```
//!
//! Any state may end in `Failed`. The license is refreshed from the status
//! document at most once per attempt.
//!
//! [`step`]: LicenseValidator::step

use crate::config::LcpConfig;
use crate::crl::RevocationCache;
use crate::device::{DeviceService, RegistrationOutcome};
use crate::document::{media_type, rel, EventType, LicenseDocument, Link, Status, StatusDocument};
use crate::error::{LcpError, LcpResult};
use crate::network::{fetch_success, FetchRequest, NetworkClient};
use crate::passphrase::{Authenticator, PassphraseResolver};
use crate::provider::{run_blocking, DecryptionContext, DecryptionProvider};
use chrono::Utc;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Everything produced by a successful validation.
#[derive(Debug)]
pub struct ValidatedDocuments {
    /// The newest license, after any refresh.
    pub license: LicenseDocument,
    pub status: Option<StatusDocument>,
    pub context: DecryptionContext,
    /// Outcome of the device registration, if one was needed.
    pub registration: Option<RegistrationOutcome>,
}

/// A state of the validation.
pub enum ValidationState {
    Start {
        data: Vec<u8>,
        status: Option<StatusDocument>,
        refreshed: bool,
    },
    FetchingStatus {
        license: LicenseDocument,
    },
    CheckingLicenseStatus {
        license: LicenseDocument,
        status: Option<StatusDocument>,
        refreshed: bool,
    },
    FetchingLicense {
        license: LicenseDocument,
        status: StatusDocument,
    },
    CheckingLicenseDates {
        license: LicenseDocument,
        status: Option<StatusDocument>,
    },
    RequestingPassphrase {
        license: LicenseDocument,
        status: Option<StatusDocument>,
    },
    CreatingContext {
        license: LicenseDocument,
        status: Option<StatusDocument>,
        passphrase: String,
    },
    RegisteringDevice {
        documents: ValidatedDocuments,
        link: Link,
    },
    Valid(ValidatedDocuments),
    Failed(LcpError),
}

impl ValidationState {
    /// Initial state for raw license bytes.
    pub fn start(data: Vec<u8>) -> Self {
        Self::Start {
            data,
            status: None,
            refreshed: false,
        }
    }

    /// Initial state when the status document is already known.
    pub fn start_with_status(data: Vec<u8>, status: StatusDocument) -> Self {
        Self::Start {
            data,
            status: Some(status),
            refreshed: false,
        }
    }

    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::Start { .. } => "Start",
            Self::FetchingStatus { .. } => "FetchingStatus",
            Self::CheckingLicenseStatus { .. } => "CheckingLicenseStatus",
            Self::FetchingLicense { .. } => "FetchingLicense",
            Self::CheckingLicenseDates { .. } => "CheckingLicenseDates",
            Self::RequestingPassphrase { .. } => "RequestingPassphrase",
            Self::CreatingContext { .. } => "CreatingContext",
            Self::RegisteringDevice { .. } => "RegisteringDevice",
            Self::Valid(_) => "Valid",
            Self::Failed(_) => "Failed",
        }
    }

    /// Returns true for `Valid` and `Failed`.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Valid(_) | Self::Failed(_))
    }
}

impl std::fmt::Debug for ValidationState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Failed(error) => write!(f, "Failed({error})"),
            other => f.write_str(other.name()),
        }
    }
}

/// How the user may be involved in a validation.
#[derive(Clone, Copy, Default)]
pub struct Interaction<'a> {
    pub authenticator: Option<&'a dyn Authenticator>,
    pub allow_interaction: bool,
}

impl<'a> Interaction<'a> {
    /// No authenticator: only stored passphrases are tried.
    pub fn none() -> Self {
        Self::default()
    }

    pub fn with(authenticator: &'a dyn Authenticator, allow_interaction: bool) -> Self {
        Self {
            authenticator: Some(authenticator),
            allow_interaction,
        }
    }
}

/// Drives validation attempts.
pub struct LicenseValidator {
    config: LcpConfig,
    provider: Arc<dyn DecryptionProvider>,
    network: Arc<dyn NetworkClient>,
    crl: Arc<RevocationCache>,
    device: Arc<DeviceService>,
    passphrases: Arc<PassphraseResolver>,
}

impl LicenseValidator {
    pub fn new(
        config: LcpConfig,
        provider: Arc<dyn DecryptionProvider>,
        network: Arc<dyn NetworkClient>,
        crl: Arc<RevocationCache>,
        device: Arc<DeviceService>,
        passphrases: Arc<PassphraseResolver>,
    ) -> Self {
        Self {
            config,
            provider,
            network,
            crl,
            device,
            passphrases,
        }
    }

    pub fn config(&self) -> &LcpConfig {
        &self.config
    }

    pub fn provider(&self) -> &Arc<dyn DecryptionProvider> {
        &self.provider
    }

    pub fn network(&self) -> &Arc<dyn NetworkClient> {
        &self.network
    }

    pub fn device(&self) -> &Arc<DeviceService> {
        &self.device
    }

    /// Runs a validation from `initial` to its end.
    ///
    /// `on_validated` is called once with the final license before this
    /// returns successfully; it is not called on failure.
    pub async fn validate<F>(
        &self,
        initial: ValidationState,
        interaction: Interaction<'_>,
        on_validated: F,
    ) -> LcpResult<ValidatedDocuments>
    where
        F: FnOnce(&LicenseDocument) + Send,
    {
        let mut state = initial;
        loop {
            state = match state {
                ValidationState::Valid(documents) => {
                    info!("license {} validated", documents.license.id());
                    on_validated(&documents.license);
                    return Ok(documents);
                }
                ValidationState::Failed(error) => {
                    warn!("license validation failed: {error}");
                    return Err(error);
                }
                state => {
                    let from = state.name();
                    let next = self.step(state, interaction).await;
                    debug!("validation: {from} -> {next:?}");
                    next
                }
            };
        }
    }

    /// Performs one transition. Terminal states are returned unchanged.
    pub async fn step(&self, state: ValidationState, interaction: Interaction<'_>) -> ValidationState {
        match state {
            ValidationState::Start {
                data,
                status,
                refreshed,
            } => {
                let license = match LicenseDocument::parse(&data) {
                    Ok(license) => license,
                    Err(e) => return ValidationState::Failed(e),
                };
                let profile = &license.encryption().profile;
                if !self.config.supports_profile(profile) {
                    return ValidationState::Failed(LcpError::LicenseProfileNotSupported(
                        profile.clone(),
                    ));
                }
                match status {
                    Some(status) => ValidationState::CheckingLicenseStatus {
                        license,
                        status: Some(status),
                        refreshed,
                    },
                    None => ValidationState::FetchingStatus { license },
                }
            }

            ValidationState::FetchingStatus { license } => match self.fetch_status(&license).await {
                Ok(status) => ValidationState::CheckingLicenseStatus {
                    license,
                    status,
                    refreshed: false,
                },
                Err(e @ LcpError::InvalidLink { .. }) if self.config.require_status => {
                    ValidationState::Failed(e)
                }
                Err(e) if self.config.require_status => {
                    ValidationState::Failed(LcpError::NetworkUnavailable(e.to_string()))
                }
                Err(e) => {
                    warn!("continuing without status document: {e}");
                    ValidationState::CheckingLicenseStatus {
                        license,
                        status: None,
                        refreshed: false,
                    }
                }
            },

            ValidationState::CheckingLicenseStatus {
                license,
                status,
                refreshed,
            } => {
                if let Some(error) = status.as_ref().and_then(|s| status_error(&license, s)) {
                    return ValidationState::Failed(error);
                }
                match status {
                    Some(status) if !refreshed && needs_refresh(&license, &status) => {
                        ValidationState::FetchingLicense { license, status }
                    }
                    status => ValidationState::CheckingLicenseDates { license, status },
                }
            }

            ValidationState::FetchingLicense { license, status } => {
                match self.fetch_license(&license, &status).await {
                    Ok(data) => ValidationState::Start {
                        data,
                        status: Some(status),
                        refreshed: true,
                    },
                    Err(e) => {
                        warn!("keeping current license {}: {e}", license.id());
                        ValidationState::CheckingLicenseDates {
                            license,
                            status: Some(status),
                        }
                    }
                }
            }

            ValidationState::CheckingLicenseDates { license, status } => {
                let now = Utc::now();
                let rights = license.rights();
                if let Some(end) = rights.end.filter(|end| *end < now) {
                    return ValidationState::Failed(LcpError::Expired { end });
                }
                if let Some(start) = rights.start.filter(|start| *start > now) {
                    return ValidationState::Failed(LcpError::NotStarted { start });
                }
                ValidationState::RequestingPassphrase { license, status }
            }

            ValidationState::RequestingPassphrase { license, status } => {
                match self
                    .passphrases
                    .resolve(&license, interaction.authenticator, interaction.allow_interaction)
                    .await
                {
                    Ok(passphrase) => ValidationState::CreatingContext {
                        license,
                        status,
                        passphrase,
                    },
                    Err(e) => ValidationState::Failed(e),
                }
            }

            ValidationState::CreatingContext {
                license,
                status,
                passphrase,
            } => {
                let crl = match self.crl.get().await {
                    Ok(pem) => Some(pem),
                    Err(e) if self.config.require_crl => return ValidationState::Failed(e),
                    Err(e) => {
                        warn!("creating context without CRL: {e}");
                        None
                    }
                };

                let provider = Arc::clone(&self.provider);
                let json = license.json().to_string();
                let context = run_blocking(move || {
                    provider
                        .create_context(&json, &passphrase, crl.as_deref())
                        .map_err(LcpError::from)
                })
                .await;

                match context {
                    Ok(context) => {
                        let register = status
                            .as_ref()
                            .and_then(|s| s.link(rel::REGISTER, None))
                            .cloned();
                        let documents = ValidatedDocuments {
                            license,
                            status,
                            context,
                            registration: None,
                        };
                        match register {
                            Some(link) => ValidationState::RegisteringDevice { documents, link },
                            None => ValidationState::Valid(documents),
                        }
                    }
                    Err(e) => ValidationState::Failed(e),
                }
            }

            ValidationState::RegisteringDevice {
                mut documents,
                link,
            } => {
                let outcome = self.device.register_if_needed(&documents.license, &link).await;
                if let RegistrationOutcome::Registered(body) = &outcome {
                    if !body.is_empty() {
                        match StatusDocument::parse(body) {
                            Ok(status) => documents.status = Some(status),
                            Err(e) => debug!("registration response is not a status document: {e}"),
                        }
                    }
                }
                documents.registration = Some(outcome);
                ValidationState::Valid(documents)
            }

            terminal @ (ValidationState::Valid(_) | ValidationState::Failed(_)) => terminal,
        }
    }

    /// Fetches the status document, or `None` if the license has no status
    /// link.
    async fn fetch_status(&self, license: &LicenseDocument) -> LcpResult<Option<StatusDocument>> {
        let Some(link) = license.link(rel::STATUS, Some(media_type::LCP_STATUS)) else {
            debug!("license {} has no status link", license.id());
            return Ok(None);
        };
        let request = FetchRequest::get(link.url(&[])?).with_timeout(self.config.status_timeout());
        let body = fetch_success(self.network.as_ref(), request).await?;
        StatusDocument::parse(&body).map(Some)
    }

    /// Fetches the license announced by the status document.
    async fn fetch_license(
        &self,
        current: &LicenseDocument,
        status: &StatusDocument,
    ) -> LcpResult<Vec<u8>> {
        let url = status.url(rel::LICENSE, Some(media_type::LCP_LICENSE), &[])?;
        let request = FetchRequest::get(url).with_timeout(self.config.license_timeout());
        let body = fetch_success(self.network.as_ref(), request).await?;

        let fresh = LicenseDocument::parse(&body)?;
        if fresh.id() != current.id() {
            return Err(LcpError::InvalidLicenseDocument(format!(
                "refreshed license has id {} instead of {}",
                fresh.id(),
                current.id()
            )));
        }
        info!("license {} refreshed (updated {})", fresh.id(), fresh.updated());
        Ok(body)
    }
}

impl std::fmt::Debug for LicenseValidator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LicenseValidator")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

/// Returns the failure a status forbidding decryption stands for.
#[must_use]
pub fn status_error(license: &LicenseDocument, status: &StatusDocument) -> Option<LcpError> {
    let date = status.status_updated();
    match status.status() {
        Status::Ready | Status::Active => None,
        Status::Revoked => Some(LcpError::Revoked {
            date,
            devices_count: status.event_count(EventType::Register),
        }),
        Status::Returned => Some(LcpError::Returned { date }),
        Status::Cancelled => Some(LcpError::Cancelled { date }),
        Status::Expired => Some(LcpError::Expired {
            end: license.rights().end.unwrap_or(date),
        }),
    }
}

fn needs_refresh(license: &LicenseDocument, status: &StatusDocument) -> bool {
    license.updated() < status.license_updated() && status.link(rel::LICENSE, None).is_some()
}
