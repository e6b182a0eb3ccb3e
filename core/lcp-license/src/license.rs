//! A validated, decryptable license.

use crate::container::LicenseContainer;
use crate::device::RegistrationOutcome;
use crate::document::{media_type, rel, LicenseDocument, Link, StatusDocument};
use crate::error::{LcpError, LcpResult};
use crate::network::{fetch_success, fetch_with_timeout, FetchRequest, Method};
use crate::lock::KeyedLock;
use crate::provider::{run_blocking, DecryptionContext};
use crate::service::persist_license;
use crate::store::LicenseRepository;
use crate::validation::{status_error, Interaction, LicenseValidator, ValidatedDocuments, ValidationState};
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard};
use tracing::{info, warn};

/// Callbacks used while renewing a loan.
#[async_trait]
pub trait RenewListener: Send + Sync {
    /// Returns the end date to request, at most `max_end` when known.
    /// `None` lets the server pick.
    async fn preferred_end_date(&self, max_end: Option<DateTime<Utc>>) -> Option<DateTime<Utc>>;

    /// Shows the renewal web page and returns once the user is done.
    async fn open_web_page(&self, url: &str);
}

struct LicenseState {
    license: LicenseDocument,
    status: Option<StatusDocument>,
    context: Arc<DecryptionContext>,
}

/// A license that passed validation.
///
/// Owns the decryption context. Renewing or returning the loan re-validates
/// the license against the new status document, under the same per-license
/// lock as [`LicenseService::retrieve_license`](crate::LicenseService::retrieve_license),
/// and writes a changed license back to its container.
pub struct License {
    state: RwLock<LicenseState>,
    registration: Option<RegistrationOutcome>,
    validator: Arc<LicenseValidator>,
    licenses: Arc<dyn LicenseRepository>,
    container: Arc<dyn LicenseContainer>,
    locks: Arc<KeyedLock>,
}

impl License {
    pub(crate) fn new(
        documents: ValidatedDocuments,
        validator: Arc<LicenseValidator>,
        licenses: Arc<dyn LicenseRepository>,
        container: Arc<dyn LicenseContainer>,
        locks: Arc<KeyedLock>,
    ) -> Self {
        Self {
            state: RwLock::new(LicenseState {
                license: documents.license,
                status: documents.status,
                context: Arc::new(documents.context),
            }),
            registration: documents.registration,
            validator,
            licenses,
            container,
            locks,
        }
    }

    fn state(&self) -> RwLockReadGuard<'_, LicenseState> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    /// Returns the current License Document.
    pub fn license(&self) -> LicenseDocument {
        self.state().license.clone()
    }

    /// Returns the current Status Document, if one was fetched.
    pub fn status(&self) -> Option<StatusDocument> {
        self.state().status.clone()
    }

    /// Outcome of the device registration done during validation.
    pub fn registration(&self) -> Option<&RegistrationOutcome> {
        self.registration.as_ref()
    }

    /// Decrypts publication data.
    ///
    /// # Errors
    ///
    /// Fails if the status now forbids decryption, or with the provider's
    /// decryption error.
    pub async fn decrypt(&self, data: &[u8]) -> LcpResult<Vec<u8>> {
        let context = {
            let state = self.state();
            if let Some(error) = state.status.as_ref().and_then(|s| status_error(&state.license, s)) {
                return Err(error);
            }
            Arc::clone(&state.context)
        };
        if data.is_empty() {
            return Ok(Vec::new());
        }

        let provider = Arc::clone(self.validator.provider());
        let data = data.to_vec();
        run_blocking(move || provider.decrypt(&context, &data).map_err(LcpError::from)).await
    }

    // ── Rights ───────────────────────────────────────────────────

    /// Characters left to copy, `None` when unlimited.
    pub fn copies_left(&self) -> LcpResult<Option<i64>> {
        self.licenses.copies_left(self.state().license.id())
    }

    /// Pages left to print, `None` when unlimited.
    pub fn prints_left(&self) -> LcpResult<Option<i64>> {
        self.licenses.prints_left(self.state().license.id())
    }

    /// Returns true if `text` can be copied without exceeding the quota.
    pub fn can_copy(&self, text: &str) -> LcpResult<bool> {
        let len = text.chars().count() as i64;
        Ok(self.copies_left()?.is_none_or(|left| left >= len))
    }

    /// Consumes the copy quota for `text`. Returns false, consuming nothing,
    /// if not enough is left.
    pub fn copy(&self, text: &str) -> LcpResult<bool> {
        let len = text.chars().count() as i64;
        self.licenses.try_copy(len, self.state().license.id())
    }

    /// Returns true if `pages` pages can be printed.
    pub fn can_print(&self, pages: i64) -> LcpResult<bool> {
        Ok(self.prints_left()?.is_none_or(|left| left >= pages))
    }

    /// Consumes the print quota for `pages` pages.
    pub fn print(&self, pages: i64) -> LcpResult<bool> {
        self.licenses.try_print(pages, self.state().license.id())
    }

    // ── Loan ─────────────────────────────────────────────────────

    /// Returns true if the status document offers a renewal.
    pub fn can_renew_loan(&self) -> bool {
        self.state()
            .status
            .as_ref()
            .is_some_and(|s| s.link(rel::RENEW, None).is_some())
    }

    /// Latest end date a renewal can reach.
    pub fn max_renew_date(&self) -> Option<DateTime<Utc>> {
        self.state().status.as_ref().and_then(StatusDocument::potential_end)
    }

    /// Returns true if the status document offers to return the publication.
    pub fn can_return_publication(&self) -> bool {
        self.state()
            .status
            .as_ref()
            .is_some_and(|s| s.link(rel::RETURN, None).is_some())
    }

    /// Renews the loan and returns the new end date.
    ///
    /// With `prefers_web_page`, an HTML renew link is preferred over the
    /// programmatic one.
    pub async fn renew_loan(
        &self,
        listener: &dyn RenewListener,
        prefers_web_page: bool,
    ) -> LcpResult<Option<DateTime<Utc>>> {
        let link = self
            .renew_link(prefers_web_page)
            .ok_or(LcpError::LicenseInteractionNotAvailable)?;

        let data = if link.is_html() {
            self.renew_with_web_page(&link, listener).await?
        } else {
            self.renew_programmatically(&link, listener).await?
        };

        self.apply_status(&data).await?;
        let end = self.state().license.rights().end;
        info!("loan renewed until {end:?}");
        Ok(end)
    }

    /// Returns the publication to its provider.
    pub async fn return_publication(&self) -> LcpResult<()> {
        let link = self
            .state()
            .status
            .as_ref()
            .and_then(|s| s.link(rel::RETURN, None).cloned())
            .ok_or(LcpError::LicenseInteractionNotAvailable)?;
        let url = self.device_url(&link, None)?;

        let data = self
            .put(url, |status| match status {
                400 => LcpError::ReturnFailed,
                403 => LcpError::AlreadyReturnedOrExpired,
                other => LcpError::UnexpectedServerError(other),
            })
            .await?;

        self.apply_status(&data).await?;
        info!("publication returned");
        Ok(())
    }

    fn renew_link(&self, prefers_web_page: bool) -> Option<Link> {
        let state = self.state();
        let status = state.status.as_ref()?;

        let types: [&str; 3] = if prefers_web_page {
            [media_type::HTML, media_type::XHTML, media_type::LCP_STATUS]
        } else {
            [media_type::LCP_STATUS, media_type::HTML, media_type::XHTML]
        };
        types
            .iter()
            .find_map(|t| {
                status
                    .links()
                    .iter()
                    .find(|l| l.has_rel(rel::RENEW) && l.has_media_type(t))
            })
            .or_else(|| status.link_without_type(rel::RENEW))
            .cloned()
    }

    async fn renew_programmatically(
        &self,
        link: &Link,
        listener: &dyn RenewListener,
    ) -> LcpResult<Vec<u8>> {
        let max_renew_date = self.max_renew_date();
        let end = if link.template_parameters().iter().any(|p| p == "end") {
            listener.preferred_end_date(max_renew_date).await
        } else {
            None
        };
        let url = self.device_url(link, end)?;

        self.put(url, |status| match status {
            400 => LcpError::RenewFailed,
            403 => LcpError::InvalidRenewalPeriod { max_renew_date },
            other => LcpError::UnexpectedServerError(other),
        })
        .await
    }

    async fn renew_with_web_page(
        &self,
        link: &Link,
        listener: &dyn RenewListener,
    ) -> LcpResult<Vec<u8>> {
        listener.open_web_page(&link.url(&[])?).await;

        let status_url = self
            .state()
            .license
            .url(rel::STATUS, Some(media_type::LCP_STATUS), &[])
            .map_err(|_| LcpError::LicenseInteractionNotAvailable)?;
        let request = FetchRequest::get(status_url)
            .with_header("Accept", media_type::LCP_STATUS)
            .with_timeout(self.validator.config().status_timeout());
        fetch_success(self.validator.network().as_ref(), request).await
    }

    fn device_url(&self, link: &Link, end: Option<DateTime<Utc>>) -> LcpResult<String> {
        let mut params = self.validator.device().as_query_parameters()?;
        if let Some(end) = end {
            params.push(("end".to_string(), end.to_rfc3339_opts(SecondsFormat::Secs, true)));
        }
        let pairs: Vec<(&str, &str)> = params
            .iter()
            .map(|(k, v)| (k.as_str(), v.as_str()))
            .collect();
        link.url(&pairs)
    }

    async fn put(&self, url: String, on_error: impl FnOnce(u16) -> LcpError) -> LcpResult<Vec<u8>> {
        let request =
            FetchRequest::new(Method::Put, url).with_timeout(self.validator.config().registration_timeout());
        let response = fetch_with_timeout(self.validator.network().as_ref(), request).await?;
        if !response.is_success() {
            return Err(on_error(response.status));
        }
        Ok(response.body)
    }

    /// Re-validates the license against a new status document.
    ///
    /// On success the documents and context are replaced. Otherwise only
    /// the status is kept, which blocks decryption if the license is no
    /// longer usable.
    async fn apply_status(&self, data: &[u8]) -> LcpResult<()> {
        let status = StatusDocument::parse(data)?;
        let (id, license_data) = {
            let state = self.state();
            (state.license.id().to_string(), state.license.as_bytes().to_vec())
        };
        let _guard = self.locks.lock(&id).await;

        let result = self
            .validator
            .validate(
                ValidationState::start_with_status(license_data.clone(), status.clone()),
                Interaction::none(),
                |license| {
                    persist_license(
                        self.licenses.as_ref(),
                        self.container.as_ref(),
                        &license_data,
                        license,
                    );
                },
            )
            .await;

        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        match result {
            Ok(documents) => {
                state.license = documents.license;
                state.status = documents.status;
                state.context = Arc::new(documents.context);
            }
            Err(e) => {
                warn!("license {id} is no longer valid: {e}");
                state.status = Some(status);
            }
        }
        Ok(())
    }
}

impl std::fmt::Debug for License {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state();
        f.debug_struct("License")
            .field("id", &state.license.id())
            .field("status", &state.status.as_ref().map(StatusDocument::status))
            .finish_non_exhaustive()
    }
}
