//! License Document model.
//!
//! A License Document is the signed JSON describing the usage rights and the
//! encrypted content key of one publication. The original bytes are kept
//! verbatim: the signature covers them, so the document is never
//! re-serialized and parsed fields are never mutated. A refreshed license is
//! a new `LicenseDocument`.

use super::link::{find_link, rel, Link};
use crate::error::{LcpError, LcpResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Encryption parameters of a license.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Encryption {
    /// Encryption profile identifier.
    pub profile: String,
    pub content_key: ContentKey,
    pub user_key: UserKey,
}

/// The content key, encrypted with the user key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContentKey {
    pub algorithm: String,
    pub encrypted_value: String,
}

/// User key parameters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserKey {
    pub algorithm: String,
    /// Hint shown to the user when asking for the passphrase.
    #[serde(default)]
    pub text_hint: String,
    /// Value used to check that a passphrase hash is the right one.
    pub key_check: String,
}

/// The user the license was issued to.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    /// Names of the fields encrypted with the user key.
    #[serde(default)]
    pub encrypted: Vec<String>,
}

/// Usage rights.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rights {
    /// Number of pages allowed to be printed, unlimited when absent.
    #[serde(default)]
    pub print: Option<i64>,
    /// Number of characters allowed to be copied, unlimited when absent.
    #[serde(default)]
    pub copy: Option<i64>,
    #[serde(default)]
    pub start: Option<DateTime<Utc>>,
    #[serde(default)]
    pub end: Option<DateTime<Utc>>,
}

/// License signature.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Signature {
    pub algorithm: String,
    pub certificate: String,
    pub value: String,
}

#[derive(Debug, Clone, Deserialize)]
struct LicenseFields {
    id: String,
    issued: DateTime<Utc>,
    #[serde(default)]
    updated: Option<DateTime<Utc>>,
    provider: String,
    encryption: Encryption,
    links: Vec<Link>,
    #[serde(default)]
    user: User,
    #[serde(default)]
    rights: Rights,
    signature: Signature,
}

/// A parsed, immutable License Document.
#[derive(Debug, Clone)]
pub struct LicenseDocument {
    json: String,
    fields: LicenseFields,
    publication: usize,
}

impl LicenseDocument {
    /// Parses a License Document from its raw bytes.
    ///
    /// # Errors
    ///
    /// Returns [`LcpError::MalformedJson`] if the bytes are not JSON and
    /// [`LcpError::InvalidLicenseDocument`] if required fields are missing.
    pub fn parse(data: &[u8]) -> LcpResult<Self> {
        let json = String::from_utf8(data.to_vec())
            .map_err(|e| LcpError::MalformedJson(format!("license is not UTF-8: {e}")))?;

        let value: serde_json::Value =
            serde_json::from_str(&json).map_err(|e| LcpError::MalformedJson(e.to_string()))?;

        let fields: LicenseFields = serde_json::from_value(value)
            .map_err(|e| LcpError::InvalidLicenseDocument(e.to_string()))?;

        let publication = fields
            .links
            .iter()
            .position(|l| l.has_rel(rel::PUBLICATION))
            .ok_or_else(|| {
                LcpError::InvalidLicenseDocument("missing publication link".to_string())
            })?;

        Ok(Self {
            json,
            fields,
            publication,
        })
    }

    /// Returns the original JSON, byte-for-byte.
    #[must_use]
    pub fn json(&self) -> &str {
        &self.json
    }

    /// Returns the original bytes.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        self.json.as_bytes()
    }

    #[must_use]
    pub fn id(&self) -> &str {
        &self.fields.id
    }

    /// Returns the license provider identifier (a URI).
    #[must_use]
    pub fn provider(&self) -> &str {
        &self.fields.provider
    }

    #[must_use]
    pub fn issued(&self) -> DateTime<Utc> {
        self.fields.issued
    }

    /// Returns the last update date, or the issue date if never updated.
    #[must_use]
    pub fn updated(&self) -> DateTime<Utc> {
        self.fields.updated.unwrap_or(self.fields.issued)
    }

    #[must_use]
    pub fn encryption(&self) -> &Encryption {
        &self.fields.encryption
    }

    #[must_use]
    pub fn user(&self) -> &User {
        &self.fields.user
    }

    #[must_use]
    pub fn rights(&self) -> &Rights {
        &self.fields.rights
    }

    #[must_use]
    pub fn signature(&self) -> &Signature {
        &self.fields.signature
    }

    #[must_use]
    pub fn links(&self) -> &[Link] {
        &self.fields.links
    }

    /// Returns the passphrase hint.
    #[must_use]
    pub fn hint(&self) -> &str {
        &self.fields.encryption.user_key.text_hint
    }

    /// Finds a link by relation, preferring `preferred_type` when given.
    #[must_use]
    pub fn link(&self, rel: &str, preferred_type: Option<&str>) -> Option<&Link> {
        find_link(&self.fields.links, rel, preferred_type)
    }

    /// Returns the publication link.
    #[must_use]
    pub fn publication_link(&self) -> &Link {
        &self.fields.links[self.publication]
    }

    /// Builds the URL of the link with `rel`.
    pub fn url(
        &self,
        rel: &str,
        preferred_type: Option<&str>,
        params: &[(&str, &str)],
    ) -> LcpResult<String> {
        self.link(rel, preferred_type)
            .ok_or_else(|| LcpError::InvalidLink {
                rel: rel.to_string(),
                reason: "no such link".to_string(),
            })?
            .url(params)
    }
}

impl PartialEq for LicenseDocument {
    fn eq(&self, other: &Self) -> bool {
        self.json == other.json
    }
}

impl Eq for LicenseDocument {}
