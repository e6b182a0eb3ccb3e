//! Command handlers for the `lcp` tool.
//!
//! Each handler returns a serializable report; `main` prints it as text or
//! JSON. The tool keeps its state (device id, cached CRL, rights counters) in
//! the same SQLite store an embedding reader would use.

use anyhow::{bail, Context as _, Result};
use chrono::{DateTime, Utc};
use lcp_license::document::{media_type, rel};
use lcp_license::{
    DecryptionContext, DecryptionProvider, DeviceService, FetchRequest, HttpNetwork, LcpConfig,
    LcplFile, LicenseContainer, LicenseDocument, LicenseService, NetworkClient, ProviderError,
    Repositories, RevocationCache, StatusDocument, ZipContainer,
};
use lcp_store::SqliteStore;
use serde::Serialize;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};

/// Name of the database file inside the data directory.
pub const DATABASE_FILE: &str = "lcp.sqlite";

/// Default location of the configuration file.
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("lcp").join("config.json"))
}

/// Default location of the data directory.
pub fn default_data_dir() -> Option<PathBuf> {
    dirs::data_dir().map(|dir| dir.join("lcp"))
}

/// Loads the engine configuration.
///
/// An explicit path must exist. Without one, the default file is used when
/// present, otherwise the built-in defaults.
pub fn load_config(path: Option<&Path>) -> Result<LcpConfig> {
    let path = match path {
        Some(path) => path.to_path_buf(),
        None => match default_config_path().filter(|p| p.exists()) {
            Some(path) => path,
            None => return Ok(LcpConfig::default()),
        },
    };
    let data = std::fs::read_to_string(&path)
        .with_context(|| format!("failed to read config {}", path.display()))?;
    let config = serde_json::from_str(&data)
        .with_context(|| format!("invalid config {}", path.display()))?;
    debug!("loaded config from {}", path.display());
    Ok(config)
}

/// Shared state of a command run.
pub struct Session {
    pub config: LcpConfig,
    pub store: Arc<SqliteStore>,
    pub network: Arc<dyn NetworkClient>,
}

impl Session {
    /// Opens the store in `data_dir`, creating the directory if needed.
    pub fn open(config: LcpConfig, data_dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(data_dir)
            .with_context(|| format!("failed to create {}", data_dir.display()))?;
        let store = SqliteStore::open(data_dir.join(DATABASE_FILE))?;
        let network = HttpNetwork::new()?;
        Ok(Self {
            config,
            store: Arc::new(store),
            network: Arc::new(network),
        })
    }

    fn device(&self) -> DeviceService {
        DeviceService::new(
            Arc::clone(&self.network),
            self.store.clone(),
            self.store.clone(),
            &self.config,
        )
    }

    fn revocation_cache(&self) -> RevocationCache {
        RevocationCache::new(Arc::clone(&self.network), self.store.clone(), &self.config)
    }

    fn service(&self) -> LicenseService {
        LicenseService::new(
            self.config.clone(),
            Arc::new(NoDecryption),
            Arc::clone(&self.network),
            Repositories::shared(Arc::clone(&self.store)),
        )
    }
}

/// Stands in for the native library; the tool never opens a license.
struct NoDecryption;

impl NoDecryption {
    fn unavailable() -> ProviderError {
        ProviderError::new(0, "no decryption library is linked into the lcp tool")
    }
}

impl DecryptionProvider for NoDecryption {
    fn create_context(
        &self,
        _license_json: &str,
        _hashed_passphrase: &str,
        _crl_pem: Option<&str>,
    ) -> Result<DecryptionContext, ProviderError> {
        Err(Self::unavailable())
    }

    fn decrypt(&self, _context: &DecryptionContext, _data: &[u8]) -> Result<Vec<u8>, ProviderError> {
        Err(Self::unavailable())
    }

    fn find_valid_passphrase(
        &self,
        _license_json: &str,
        _candidates: &[String],
    ) -> Result<Option<String>, ProviderError> {
        Err(Self::unavailable())
    }
}

/// Reads a bare `.lcpl` file, or the license embedded in a publication.
fn read_license(path: &Path) -> Result<LicenseDocument> {
    let is_lcpl = path
        .extension()
        .is_some_and(|e| e.eq_ignore_ascii_case("lcpl"));
    let container: Box<dyn LicenseContainer> = if is_lcpl {
        Box::new(LcplFile::new(path))
    } else {
        Box::new(ZipContainer::new(path))
    };
    let data = container
        .read()
        .with_context(|| format!("failed to read {}", path.display()))?;
    LicenseDocument::parse(&data).with_context(|| format!("invalid license {}", path.display()))
}

fn or_dash<T: fmt::Display>(value: &Option<T>) -> String {
    value
        .as_ref()
        .map_or_else(|| "-".to_string(), ToString::to_string)
}

fn quota(value: &Option<i64>) -> String {
    value.map_or_else(|| "unlimited".to_string(), |v| v.to_string())
}

// ── inspect ──────────────────────────────────────────────────────

/// Static description of a license file.
#[derive(Debug, Clone, Serialize)]
pub struct LicenseReport {
    pub id: String,
    pub provider: String,
    pub issued: DateTime<Utc>,
    pub updated: DateTime<Utc>,
    pub user_id: Option<String>,
    pub profile: String,
    pub profile_supported: bool,
    pub hint: String,
    pub start: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
    pub copy: Option<i64>,
    pub print: Option<i64>,
    pub publication: String,
    pub status_url: Option<String>,
}

/// Describes a license without contacting any server.
pub fn inspect(config: &LcpConfig, path: &Path) -> Result<LicenseReport> {
    let license = read_license(path)?;
    let rights = license.rights();
    let profile = license.encryption().profile.clone();
    Ok(LicenseReport {
        id: license.id().to_string(),
        provider: license.provider().to_string(),
        issued: license.issued(),
        updated: license.updated(),
        user_id: license.user().id.clone(),
        profile_supported: config.supports_profile(&profile),
        profile,
        hint: license.encryption().user_key.text_hint.clone(),
        start: rights.start,
        end: rights.end,
        copy: rights.copy,
        print: rights.print,
        publication: license.publication_link().href.clone(),
        status_url: license.link(rel::STATUS, None).map(|l| l.href.clone()),
    })
}

impl fmt::Display for LicenseReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "License   {}", self.id)?;
        writeln!(f, "Provider  {}", self.provider)?;
        writeln!(f, "User      {}", or_dash(&self.user_id))?;
        writeln!(f, "Issued    {}", self.issued)?;
        writeln!(f, "Updated   {}", self.updated)?;
        let support = if self.profile_supported { "" } else { " (unsupported)" };
        writeln!(f, "Profile   {}{support}", self.profile)?;
        writeln!(f, "Hint      {}", self.hint)?;
        writeln!(f, "Start     {}", or_dash(&self.start))?;
        writeln!(f, "End       {}", or_dash(&self.end))?;
        writeln!(f, "Copy      {}", quota(&self.copy))?;
        writeln!(f, "Print     {}", quota(&self.print))?;
        writeln!(f, "Content   {}", self.publication)?;
        write!(f, "Status    {}", or_dash(&self.status_url))
    }
}

// ── status ───────────────────────────────────────────────────────

/// Live status of a license.
#[derive(Debug, Clone, Serialize)]
pub struct StatusReport {
    pub id: String,
    pub status: String,
    pub message: String,
    pub license_updated: DateTime<Utc>,
    pub status_updated: DateTime<Utc>,
    /// True when the server holds a newer license than the file.
    pub newer_license: bool,
    pub potential_end: Option<DateTime<Utc>>,
    pub devices: usize,
    pub actions: Vec<String>,
}

/// Fetches the Status Document of a license.
pub async fn status(session: &Session, path: &Path) -> Result<StatusReport> {
    let license = read_license(path)?;
    let url = license
        .url(rel::STATUS, Some(media_type::LCP_STATUS), &[])
        .context("license has no status document")?;

    info!("fetching status of {}", license.id());
    let request = FetchRequest::get(url.clone())
        .with_header("Accept", media_type::LCP_STATUS)
        .with_timeout(session.config.status_timeout());
    let response = session.network.fetch(request).await?;
    if !response.is_success() {
        bail!("status server answered HTTP {} for {url}", response.status);
    }
    let status = StatusDocument::parse(&response.body)?;

    let actions = [rel::REGISTER, rel::RENEW, rel::RETURN]
        .into_iter()
        .filter(|r| status.link(r, None).is_some())
        .map(str::to_string)
        .collect();
    Ok(StatusReport {
        id: status.id().to_string(),
        status: status.status().to_string(),
        message: status.message().to_string(),
        license_updated: status.license_updated(),
        status_updated: status.status_updated(),
        newer_license: license.updated() < status.license_updated(),
        potential_end: status.potential_end(),
        devices: status.event_count(lcp_license::document::EventType::Register),
        actions,
    })
}

impl fmt::Display for StatusReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "License   {}", self.id)?;
        writeln!(f, "Status    {} ({})", self.status, self.message)?;
        writeln!(f, "Changed   {}", self.status_updated)?;
        let newer = if self.newer_license { " (newer than file)" } else { "" };
        writeln!(f, "Latest    {}{newer}", self.license_updated)?;
        writeln!(f, "Renew to  {}", or_dash(&self.potential_end))?;
        writeln!(f, "Devices   {}", self.devices)?;
        if self.actions.is_empty() {
            write!(f, "Actions   -")
        } else {
            write!(f, "Actions   {}", self.actions.join(", "))
        }
    }
}

// ── crl ──────────────────────────────────────────────────────────

/// State of the cached CRL.
#[derive(Debug, Clone, Serialize)]
pub struct CrlReport {
    pub url: String,
    pub fetched_at: DateTime<Utc>,
    pub fresh: bool,
    pub size: usize,
}

/// Returns the cached CRL, downloading it when stale or when `refresh` is set.
pub async fn crl(session: &Session, refresh: bool) -> Result<CrlReport> {
    let cache = session.revocation_cache();
    let list = if refresh {
        cache.refresh().await?
    } else {
        cache.list().await?
    };
    let max_age = chrono::Duration::seconds(session.config.crl_max_age_secs);
    Ok(CrlReport {
        url: session.config.crl_url.clone(),
        fresh: list.is_fresh(Utc::now(), max_age),
        fetched_at: list.fetched_at,
        size: list.pem.len(),
    })
}

impl fmt::Display for CrlReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Source    {}", self.url)?;
        let state = if self.fresh { "fresh" } else { "stale" };
        writeln!(f, "Fetched   {} ({state})", self.fetched_at)?;
        write!(f, "Size      {} bytes (PEM)", self.size)
    }
}

// ── device ───────────────────────────────────────────────────────

/// Identity sent to license servers.
#[derive(Debug, Clone, Serialize)]
pub struct DeviceReport {
    pub id: String,
    pub name: String,
    /// Registration state for the license given on the command line.
    pub registered: Option<bool>,
}

/// Shows the device identity, and its registration for a license.
pub fn device(session: &Session, license: Option<&Path>) -> Result<DeviceReport> {
    let device = session.device();
    let registered = match license {
        Some(path) => Some(device.is_registered(read_license(path)?.id())?),
        None => None,
    };
    Ok(DeviceReport {
        id: device.id()?,
        name: device.name().to_string(),
        registered,
    })
}

impl fmt::Display for DeviceReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Device    {}", self.id)?;
        write!(f, "Name      {}", self.name)?;
        if let Some(registered) = self.registered {
            write!(f, "\nRegistered {}", if registered { "yes" } else { "no" })?;
        }
        Ok(())
    }
}

// ── rights ───────────────────────────────────────────────────────

/// Remaining rights of a license on this device.
#[derive(Debug, Clone, Serialize)]
pub struct RightsReport {
    pub id: String,
    /// False until the license was opened once with this store.
    pub tracked: bool,
    pub copies_left: Option<i64>,
    pub prints_left: Option<i64>,
    pub end: Option<DateTime<Utc>>,
}

/// Reports the rights counters of a license.
pub fn rights(session: &Session, path: &Path) -> Result<RightsReport> {
    use lcp_license::LicenseRepository;

    let license = read_license(path)?;
    let id = license.id().to_string();
    if !session.store.has_license(&id)? {
        let rights = license.rights();
        return Ok(RightsReport {
            id,
            tracked: false,
            copies_left: rights.copy,
            prints_left: rights.print,
            end: rights.end,
        });
    }
    Ok(RightsReport {
        copies_left: session.store.copies_left(&id)?,
        prints_left: session.store.prints_left(&id)?,
        end: session.store.license_end(&id)?,
        tracked: true,
        id,
    })
}

impl fmt::Display for RightsReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "License   {}", self.id)?;
        writeln!(f, "Copy      {}", quota(&self.copies_left))?;
        writeln!(f, "Print     {}", quota(&self.prints_left))?;
        write!(f, "End       {}", or_dash(&self.end))?;
        if !self.tracked {
            write!(f, "\n(never opened on this device, showing granted rights)")?;
        }
        Ok(())
    }
}

// ── acquire ──────────────────────────────────────────────────────

/// A downloaded publication.
#[derive(Debug, Clone, Serialize)]
pub struct AcquireReport {
    pub id: String,
    pub path: PathBuf,
    pub size: u64,
}

/// Downloads the publication of a `.lcpl` file into `destination`.
pub async fn acquire(session: &Session, lcpl: &Path, destination: &Path) -> Result<AcquireReport> {
    let data = std::fs::read(lcpl).with_context(|| format!("failed to read {}", lcpl.display()))?;
    let acquired = session.service().acquire_publication(&data, destination).await?;
    let size = std::fs::metadata(&acquired.path)
        .with_context(|| format!("failed to stat {}", acquired.path.display()))?
        .len();
    Ok(AcquireReport {
        id: acquired.license.id().to_string(),
        path: acquired.path,
        size,
    })
}

impl fmt::Display for AcquireReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Saved publication of {} to {} ({} bytes)",
            self.id,
            self.path.display(),
            self.size
        )
    }
}
