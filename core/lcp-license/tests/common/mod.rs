//! Shared test helpers for LCP engine tests.

#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use lcp_license::{
    hash_passphrase, AuthenticationReason, Authenticator, DecryptionContext, DecryptionProvider,
    FetchRequest, FetchResponse, LcpConfig, LcpError, LcpResult, LicenseDocument, LicenseService,
    MemoryStore, NetworkClient, ProviderError, Repositories,
};
use serde_json::{json, Value};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

pub const LICENSE_ID: &str = "ef15e740-697f-11e3-949a-0800200c9a66";
pub const PROVIDER: &str = "https://www.imaginaryebookretailer.com";
pub const USER_ID: &str = "d9f298a7-7f34-49e7-8aae-4378ecb1d597";
pub const PASSPHRASE: &str = "correct horse battery staple";

pub const CRL_URL: &str = "https://crl.example.com/ca.crl";
pub const STATUS_URL: &str = "https://lsd.example.com/licenses/ef15e740/status";
pub const FRESH_LICENSE_URL: &str = "https://lcp.example.com/licenses/ef15e740";
pub const REGISTER_URL: &str = "https://lsd.example.com/licenses/ef15e740/register";
pub const RENEW_URL: &str = "https://lsd.example.com/licenses/ef15e740/renew";
pub const RETURN_URL: &str = "https://lsd.example.com/licenses/ef15e740/return";
pub const PUBLICATION_URL: &str = "https://cdn.example.com/books/ef15e740.epub";

/// DER bytes served as the CRL.
pub const CRL_DER: &[u8] = b"\x30\x82\x01\x0a fake crl";

/// Builds a zip archive from `(name, content)` entries, storing the first
/// one uncompressed like an EPUB `mimetype`.
pub fn zip_archive(entries: &[(&str, &str)]) -> Vec<u8> {
    use std::io::Write;
    use zip::write::SimpleFileOptions;

    let mut zip = zip::ZipWriter::new(std::io::Cursor::new(Vec::new()));
    for (i, (name, content)) in entries.iter().enumerate() {
        let method = if i == 0 {
            zip::CompressionMethod::Stored
        } else {
            zip::CompressionMethod::Deflated
        };
        zip.start_file(*name, SimpleFileOptions::default().compression_method(method))
            .unwrap();
        zip.write_all(content.as_bytes()).unwrap();
    }
    zip.finish().unwrap().into_inner()
}

/// A minimal EPUB without license.
pub fn epub_archive() -> Vec<u8> {
    zip_archive(&[
        ("mimetype", "application/epub+zip"),
        ("META-INF/container.xml", "<container/>"),
        ("OEBPS/chapter1.xhtml", "<html>encrypted chapter</html>"),
    ])
}

/// Reads one entry of a zip archive.
pub fn zip_entry(path: &std::path::Path, name: &str) -> Option<Vec<u8>> {
    use std::io::Read;

    let mut archive = zip::ZipArchive::new(std::fs::File::open(path).unwrap()).unwrap();
    let mut file = archive.by_name(name).ok()?;
    let mut data = Vec::new();
    file.read_to_end(&mut data).unwrap();
    Some(data)
}

/// Entry names of a zip archive, in order.
pub fn zip_names(path: &std::path::Path) -> Vec<String> {
    let archive = zip::ZipArchive::new(std::fs::File::open(path).unwrap()).unwrap();
    archive.file_names().map(str::to_string).collect()
}

/// The hash unlocking licenses built by [`LicenseBuilder`].
pub fn valid_hash() -> String {
    hash_passphrase(PASSPHRASE)
}

// ── Documents ────────────────────────────────────────────────────

/// Builds License Document JSON.
#[derive(Debug, Clone)]
pub struct LicenseBuilder {
    pub id: String,
    pub issued: DateTime<Utc>,
    pub updated: Option<DateTime<Utc>>,
    pub user_id: Option<String>,
    pub key_check: String,
    pub profile: String,
    pub start: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
    pub copy: Option<i64>,
    pub print: Option<i64>,
    pub status_link: bool,
    pub publication_hash: Option<String>,
    pub publication_type: String,
}

impl Default for LicenseBuilder {
    fn default() -> Self {
        Self {
            id: LICENSE_ID.to_string(),
            issued: Utc::now() - Duration::days(30),
            updated: None,
            user_id: Some(USER_ID.to_string()),
            key_check: valid_hash(),
            profile: "http://readium.org/lcp/basic-profile".to_string(),
            start: None,
            end: None,
            copy: None,
            print: None,
            status_link: true,
            publication_hash: None,
            publication_type: "application/epub+zip".to_string(),
        }
    }
}

impl LicenseBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn updated(mut self, updated: DateTime<Utc>) -> Self {
        self.updated = Some(updated);
        self
    }

    pub fn end(mut self, end: DateTime<Utc>) -> Self {
        self.end = Some(end);
        self
    }

    pub fn start(mut self, start: DateTime<Utc>) -> Self {
        self.start = Some(start);
        self
    }

    pub fn copy(mut self, copy: i64) -> Self {
        self.copy = Some(copy);
        self
    }

    pub fn print(mut self, print: i64) -> Self {
        self.print = Some(print);
        self
    }

    pub fn key_check(mut self, key_check: impl Into<String>) -> Self {
        self.key_check = key_check.into();
        self
    }

    pub fn profile(mut self, profile: impl Into<String>) -> Self {
        self.profile = profile.into();
        self
    }

    pub fn without_status(mut self) -> Self {
        self.status_link = false;
        self
    }

    pub fn without_user(mut self) -> Self {
        self.user_id = None;
        self
    }

    pub fn value(&self) -> Value {
        let mut links = vec![
            json!({"rel": "hint", "href": "https://www.imaginaryebookretailer.com/lcp/hint", "type": "text/html"}),
            json!({"rel": "publication", "href": PUBLICATION_URL, "type": self.publication_type, "length": 2_595_328}),
        ];
        if let Some(hash) = &self.publication_hash {
            links[1]["hash"] = json!(hash);
        }
        if self.status_link {
            links.push(json!({
                "rel": "status",
                "href": STATUS_URL,
                "type": "application/vnd.readium.license.status.v1.0+json"
            }));
        }

        let mut rights = serde_json::Map::new();
        if let Some(print) = self.print {
            rights.insert("print".into(), json!(print));
        }
        if let Some(copy) = self.copy {
            rights.insert("copy".into(), json!(copy));
        }
        if let Some(start) = self.start {
            rights.insert("start".into(), json!(start));
        }
        if let Some(end) = self.end {
            rights.insert("end".into(), json!(end));
        }

        let mut license = json!({
            "id": self.id,
            "issued": self.issued,
            "provider": PROVIDER,
            "encryption": {
                "profile": self.profile,
                "content_key": {
                    "algorithm": "http://www.w3.org/2001/04/xmlenc#aes256-cbc",
                    "encrypted_value": "/k8RpXqf4E2WEunCp76E8PjhS051NXwAXeTD1ioazYxCRGvHLAck/KQ3cCh5JxDmCK0nRLyAxs1X0aA3z55boQ=="
                },
                "user_key": {
                    "algorithm": "http://www.w3.org/2001/04/xmlenc#sha256",
                    "text_hint": "Enter your email address",
                    "key_check": self.key_check
                }
            },
            "links": links,
            "rights": rights,
            "signature": {
                "algorithm": "http://www.w3.org/2001/04/xmldsig-more#ecdsa-sha256",
                "certificate": "MIIDEjCCAfqgAwIBAgIBATANBgkqhkiG9w0BAQsFADBB",
                "value": "q/3IInic9c/EaJHyG1Kkqk5v1zlJNsiQBmxz4lykhyD3dA2jg2ZzrOenYU9GxP/xhe5H5Kt2WaJ/hnt8+GWrEx1QOwnNEij5CmIpZ63yRNKnFS5rSRnDMYmQT/fkUYco7BUi7MPPU6OFf4+kaToNWl8m/ZlMxDcS3BZnVhSEKzUNQn1f2y3sUcXjes7wHbImDc6dRthbL/E+assh5HEqakrDuA4lM8XNfukEYQJnivqhqMLOGM33RnS5nZKrPPK/c2F/vGjJffSrlX3W3Jlds0/MZ6wtVeKIugR06c56V6+qKsnMLAQJaeOxxBXmbFdAEyplP9irn4D9tQZKqbbMIw=="
            }
        });
        if let Some(updated) = self.updated {
            license["updated"] = json!(updated);
        }
        if let Some(user_id) = &self.user_id {
            license["user"] = json!({"id": user_id, "email": "EnCt2b8c6d2afd94ae4ed201b27049d8ce1afe31a90ceb6d8ce", "encrypted": ["email"]});
        }
        license
    }

    pub fn json(&self) -> String {
        self.value().to_string()
    }

    pub fn bytes(&self) -> Vec<u8> {
        self.json().into_bytes()
    }

    pub fn document(&self) -> LicenseDocument {
        LicenseDocument::parse(&self.bytes()).expect("valid license")
    }
}

/// Builds Status Document JSON.
#[derive(Debug, Clone)]
pub struct StatusBuilder {
    pub id: String,
    pub status: String,
    pub license_updated: DateTime<Utc>,
    pub status_updated: DateTime<Utc>,
    pub license_link: bool,
    pub register_link: bool,
    pub renew_links: Vec<Value>,
    pub return_link: bool,
    pub potential_end: Option<DateTime<Utc>>,
    pub register_events: usize,
}

impl Default for StatusBuilder {
    fn default() -> Self {
        let now = Utc::now();
        Self {
            id: LICENSE_ID.to_string(),
            status: "active".to_string(),
            license_updated: now - Duration::days(60),
            status_updated: now - Duration::days(1),
            license_link: true,
            register_link: false,
            renew_links: Vec::new(),
            return_link: false,
            potential_end: None,
            register_events: 0,
        }
    }
}

impl StatusBuilder {
    pub fn new(status: &str) -> Self {
        Self {
            status: status.to_string(),
            ..Self::default()
        }
    }

    /// Announces a license newer than `issued`.
    pub fn license_updated(mut self, date: DateTime<Utc>) -> Self {
        self.license_updated = date;
        self
    }

    pub fn with_register(mut self) -> Self {
        self.register_link = true;
        self
    }

    pub fn with_return(mut self) -> Self {
        self.return_link = true;
        self
    }

    pub fn with_renew(mut self, templated: bool) -> Self {
        let href = if templated {
            format!("{RENEW_URL}{{?end,id,name}}")
        } else {
            RENEW_URL.to_string()
        };
        self.renew_links.push(json!({
            "rel": "renew",
            "href": href,
            "type": "application/vnd.readium.license.status.v1.0+json",
            "templated": templated
        }));
        self
    }

    pub fn with_renew_page(mut self, url: &str) -> Self {
        self.renew_links
            .push(json!({"rel": "renew", "href": url, "type": "text/html"}));
        self
    }

    pub fn potential_end(mut self, end: DateTime<Utc>) -> Self {
        self.potential_end = Some(end);
        self
    }

    pub fn register_events(mut self, count: usize) -> Self {
        self.register_events = count;
        self
    }

    pub fn value(&self) -> Value {
        let mut links = Vec::new();
        if self.license_link {
            links.push(json!({
                "rel": "license",
                "href": FRESH_LICENSE_URL,
                "type": "application/vnd.readium.lcp.license.v1.0+json"
            }));
        }
        if self.register_link {
            links.push(json!({
                "rel": "register",
                "href": format!("{REGISTER_URL}{{?id,name}}"),
                "type": "application/vnd.readium.license.status.v1.0+json",
                "templated": true
            }));
        }
        links.extend(self.renew_links.iter().cloned());
        if self.return_link {
            links.push(json!({
                "rel": "return",
                "href": format!("{RETURN_URL}{{?id,name}}"),
                "type": "application/vnd.readium.license.status.v1.0+json",
                "templated": true
            }));
        }

        let events: Vec<Value> = (0..self.register_events)
            .map(|i| {
                json!({
                    "type": "register",
                    "name": format!("device {i}"),
                    "id": format!("device-{i}"),
                    "timestamp": self.status_updated
                })
            })
            .collect();

        let mut status = json!({
            "id": self.id,
            "status": self.status,
            "message": format!("The license is {}", self.status),
            "updated": {
                "license": self.license_updated,
                "status": self.status_updated
            },
            "links": links,
            "events": events
        });
        if let Some(end) = self.potential_end {
            status["potential_rights"] = json!({ "end": end });
        }
        status
    }

    pub fn bytes(&self) -> Vec<u8> {
        self.value().to_string().into_bytes()
    }
}

// ── Decryption provider ──────────────────────────────────────────

/// Context created by [`FakeProvider`].
#[derive(Debug)]
pub struct FakeContext {
    pub hash: String,
}

/// Accepts the passphrase hash equal to the license's `key_check`.
///
/// Decryption flips every byte.
#[derive(Debug, Default)]
pub struct FakeProvider {
    find_calls: AtomicUsize,
    context_calls: AtomicUsize,
    decrypt_calls: AtomicUsize,
    context_error: Mutex<Option<i32>>,
    find_error: Mutex<Option<i32>>,
    crls: Mutex<Vec<Option<String>>>,
    checked: Mutex<Vec<Vec<String>>>,
    context_delay: Mutex<Option<std::time::Duration>>,
    inside_context: AtomicUsize,
    max_inside_context: AtomicUsize,
}

impl FakeProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes `create_context` fail with this native code.
    pub fn fail_context_with(&self, code: i32) {
        *self.context_error.lock().unwrap() = Some(code);
    }

    /// Makes `find_valid_passphrase` fail with this native code.
    pub fn fail_find_with(&self, code: i32) {
        *self.find_error.lock().unwrap() = Some(code);
    }

    /// Makes `create_context` block for `delay`.
    pub fn set_context_delay(&self, delay: std::time::Duration) {
        *self.context_delay.lock().unwrap() = Some(delay);
    }

    /// Most `create_context` calls seen running at the same time.
    pub fn max_concurrent_contexts(&self) -> usize {
        self.max_inside_context.load(Ordering::SeqCst)
    }

    pub fn find_calls(&self) -> usize {
        self.find_calls.load(Ordering::SeqCst)
    }

    pub fn context_calls(&self) -> usize {
        self.context_calls.load(Ordering::SeqCst)
    }

    pub fn decrypt_calls(&self) -> usize {
        self.decrypt_calls.load(Ordering::SeqCst)
    }

    /// CRLs received by `create_context`, in call order.
    pub fn crls(&self) -> Vec<Option<String>> {
        self.crls.lock().unwrap().clone()
    }

    /// Candidate lists received by `find_valid_passphrase`, in call order.
    pub fn checked(&self) -> Vec<Vec<String>> {
        self.checked.lock().unwrap().clone()
    }

    fn key_check(json: &str) -> Result<String, ProviderError> {
        let value: Value =
            serde_json::from_str(json).map_err(|e| ProviderError::new(11, e.to_string()))?;
        value["encryption"]["user_key"]["key_check"]
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| ProviderError::new(11, "missing key_check"))
    }
}

impl DecryptionProvider for FakeProvider {
    fn create_context(
        &self,
        license_json: &str,
        hashed_passphrase: &str,
        crl_pem: Option<&str>,
    ) -> Result<DecryptionContext, ProviderError> {
        self.context_calls.fetch_add(1, Ordering::SeqCst);
        self.crls.lock().unwrap().push(crl_pem.map(str::to_string));
        let delay = *self.context_delay.lock().unwrap();
        if let Some(delay) = delay {
            let inside = self.inside_context.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_inside_context.fetch_max(inside, Ordering::SeqCst);
            std::thread::sleep(delay);
            self.inside_context.fetch_sub(1, Ordering::SeqCst);
        }
        if let Some(code) = *self.context_error.lock().unwrap() {
            return Err(ProviderError::new(code, "forced failure"));
        }
        if Self::key_check(license_json)? != hashed_passphrase {
            return Err(ProviderError::new(141, "user key check invalid"));
        }
        Ok(DecryptionContext::new(FakeContext {
            hash: hashed_passphrase.to_string(),
        }))
    }

    fn decrypt(&self, context: &DecryptionContext, data: &[u8]) -> Result<Vec<u8>, ProviderError> {
        self.decrypt_calls.fetch_add(1, Ordering::SeqCst);
        context
            .downcast_ref::<FakeContext>()
            .ok_or_else(|| ProviderError::new(121, "foreign context"))?;
        Ok(data.iter().map(|b| !b).collect())
    }

    fn find_valid_passphrase(
        &self,
        license_json: &str,
        candidates: &[String],
    ) -> Result<Option<String>, ProviderError> {
        self.find_calls.fetch_add(1, Ordering::SeqCst);
        self.checked.lock().unwrap().push(candidates.to_vec());
        if let Some(code) = *self.find_error.lock().unwrap() {
            return Err(ProviderError::new(code, "license rejected"));
        }
        let key_check = Self::key_check(license_json)?;
        Ok(candidates.iter().find(|c| **c == key_check).cloned())
    }
}

/// "Encrypts" bytes the way [`FakeProvider`] decrypts them.
pub fn fake_encrypt(data: &[u8]) -> Vec<u8> {
    data.iter().map(|b| !b).collect()
}

// ── Network ──────────────────────────────────────────────────────

#[derive(Debug, Clone)]
enum Reply {
    Response(u16, Vec<u8>),
    Offline,
}

/// Serves canned responses by URL, ignoring the query string.
///
/// Unknown URLs fail like an unreachable host. The last reply of a route is
/// repeated once the others were consumed.
#[derive(Debug, Default)]
pub struct FakeNetwork {
    routes: Mutex<HashMap<String, VecDeque<Reply>>>,
    requests: Mutex<Vec<FetchRequest>>,
    delay: Mutex<Option<std::time::Duration>>,
}

impl FakeNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    fn push(&self, url: &str, reply: Reply) {
        self.routes
            .lock()
            .unwrap()
            .entry(url.to_string())
            .or_default()
            .push_back(reply);
    }

    pub fn respond(&self, url: &str, status: u16, body: impl Into<Vec<u8>>) {
        self.push(url, Reply::Response(status, body.into()));
    }

    pub fn ok(&self, url: &str, body: impl Into<Vec<u8>>) {
        self.respond(url, 200, body);
    }

    pub fn offline(&self, url: &str) {
        self.push(url, Reply::Offline);
    }

    /// Drops the pending replies of `url`, then serves this one.
    pub fn replace(&self, url: &str, status: u16, body: impl Into<Vec<u8>>) {
        self.routes.lock().unwrap().remove(url);
        self.respond(url, status, body);
    }

    /// Delays every response.
    pub fn set_delay(&self, delay: std::time::Duration) {
        *self.delay.lock().unwrap() = Some(delay);
    }

    pub fn requests(&self) -> Vec<FetchRequest> {
        self.requests.lock().unwrap().clone()
    }

    /// Number of requests sent to `url`, query string ignored.
    pub fn count(&self, url: &str) -> usize {
        self.requests
            .lock()
            .unwrap()
            .iter()
            .filter(|r| base_url(&r.url) == url)
            .count()
    }

    pub fn last_request(&self, url: &str) -> Option<FetchRequest> {
        self.requests
            .lock()
            .unwrap()
            .iter()
            .rev()
            .find(|r| base_url(&r.url) == url)
            .cloned()
    }
}

fn base_url(url: &str) -> &str {
    url.split('?').next().unwrap_or(url)
}

#[async_trait]
impl NetworkClient for FakeNetwork {
    async fn fetch(&self, request: FetchRequest) -> LcpResult<FetchResponse> {
        self.requests.lock().unwrap().push(request.clone());
        let delay = *self.delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let reply = {
            let mut routes = self.routes.lock().unwrap();
            routes.get_mut(base_url(&request.url)).and_then(|queue| {
                if queue.len() > 1 {
                    queue.pop_front()
                } else {
                    queue.front().cloned()
                }
            })
        };

        match reply {
            Some(Reply::Response(status, body)) => Ok(FetchResponse { status, body }),
            Some(Reply::Offline) | None => Err(LcpError::Network(format!(
                "{} {} unreachable",
                request.method, request.url
            ))),
        }
    }
}

// ── Authenticator ────────────────────────────────────────────────

/// Answers passphrase requests from a script, then declines.
#[derive(Debug, Default)]
pub struct FakeAuthenticator {
    answers: Mutex<VecDeque<String>>,
    reasons: Mutex<Vec<AuthenticationReason>>,
}

impl FakeAuthenticator {
    pub fn new(answers: &[&str]) -> Self {
        Self {
            answers: Mutex::new(answers.iter().map(|a| a.to_string()).collect()),
            reasons: Mutex::new(Vec::new()),
        }
    }

    pub fn calls(&self) -> usize {
        self.reasons.lock().unwrap().len()
    }

    pub fn reasons(&self) -> Vec<AuthenticationReason> {
        self.reasons.lock().unwrap().clone()
    }
}

#[async_trait]
impl Authenticator for FakeAuthenticator {
    async fn retrieve_passphrase(
        &self,
        _license: &LicenseDocument,
        reason: AuthenticationReason,
        _allow_interaction: bool,
    ) -> Option<String> {
        self.reasons.lock().unwrap().push(reason);
        self.answers.lock().unwrap().pop_front()
    }
}

// ── Harness ──────────────────────────────────────────────────────

/// Fakes wired into a [`LicenseService`].
pub struct Harness {
    pub provider: Arc<FakeProvider>,
    pub network: Arc<FakeNetwork>,
    pub store: Arc<MemoryStore>,
    pub config: LcpConfig,
}

impl Harness {
    /// A harness whose network only serves the CRL.
    pub fn new() -> Self {
        let network = Arc::new(FakeNetwork::new());
        network.ok(CRL_URL, CRL_DER);
        Self::with_network(network)
    }

    /// A harness whose network serves nothing.
    pub fn offline() -> Self {
        Self::with_network(Arc::new(FakeNetwork::new()))
    }

    fn with_network(network: Arc<FakeNetwork>) -> Self {
        Self {
            provider: Arc::new(FakeProvider::new()),
            network,
            store: Arc::new(MemoryStore::new()),
            config: LcpConfig {
                crl_url: CRL_URL.to_string(),
                device_name: Some("test device".to_string()),
                ..LcpConfig::default()
            },
        }
    }

    pub fn service(&self) -> LicenseService {
        LicenseService::new(
            self.config.clone(),
            self.provider.clone(),
            self.network.clone(),
            Repositories::shared(self.store.clone()),
        )
    }

    /// Stores the valid passphrase for the default license.
    pub fn remember_passphrase(&self) {
        use lcp_license::{PassphraseEntry, PassphraseRepository};
        self.store
            .add_passphrase(&PassphraseEntry {
                license_id: LICENSE_ID.to_string(),
                provider: PROVIDER.to_string(),
                user_id: Some(USER_ID.to_string()),
                passphrase: valid_hash(),
            })
            .unwrap();
    }
}

/// Installs a test subscriber so `tracing` output shows on failures.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("lcp_license=debug")
        .with_test_writer()
        .try_init();
}
