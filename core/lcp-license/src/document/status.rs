//! Status Document model.
//!
//! The Status Document is fetched from the license's `status` link and
//! gives the live status of the license, its renew/return actions and the
//! date of the latest License Document.

use super::link::{find_link, Link};
use crate::error::{LcpError, LcpResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Live status of a license.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    /// Issued, not yet registered by any device.
    Ready,
    /// Registered by at least one device.
    Active,
    /// Revoked by the provider.
    Revoked,
    /// Returned by the user.
    Returned,
    /// Cancelled before being registered.
    Cancelled,
    /// Reached its end date.
    Expired,
}

impl Status {
    /// Returns true if this status forbids decrypting the publication,
    /// whatever the local rights say.
    #[must_use]
    pub fn blocks_decryption(&self) -> bool {
        matches!(
            self,
            Self::Revoked | Self::Returned | Self::Cancelled | Self::Expired
        )
    }
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Ready => "ready",
            Self::Active => "active",
            Self::Revoked => "revoked",
            Self::Returned => "returned",
            Self::Cancelled => "cancelled",
            Self::Expired => "expired",
        };
        f.write_str(s)
    }
}

/// Kind of a status event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventType {
    Register,
    Renew,
    Return,
    Revoke,
    Cancel,
    #[serde(other)]
    Other,
}

/// An event in the license history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    #[serde(rename = "type")]
    pub kind: EventType,
    /// Name of the device that triggered the event.
    #[serde(default)]
    pub name: Option<String>,
    /// Identifier of the device that triggered the event.
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub timestamp: Option<DateTime<Utc>>,
}

/// Update dates carried by a Status Document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Updated {
    /// Date of the latest License Document.
    pub license: DateTime<Utc>,
    /// Date of the latest status change.
    pub status: DateTime<Utc>,
}

/// Rights the license could get through a renewal.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PotentialRights {
    #[serde(default)]
    pub end: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Deserialize)]
struct StatusFields {
    id: String,
    status: Status,
    #[serde(default)]
    message: String,
    updated: Updated,
    #[serde(default)]
    links: Vec<Link>,
    #[serde(default)]
    potential_rights: Option<PotentialRights>,
    #[serde(default)]
    events: Vec<Event>,
}

/// A parsed, immutable Status Document.
#[derive(Debug, Clone)]
pub struct StatusDocument {
    json: String,
    fields: StatusFields,
}

impl StatusDocument {
    /// Parses a Status Document from its raw bytes.
    pub fn parse(data: &[u8]) -> LcpResult<Self> {
        let json = String::from_utf8(data.to_vec())
            .map_err(|e| LcpError::MalformedJson(format!("status is not UTF-8: {e}")))?;

        let value: serde_json::Value =
            serde_json::from_str(&json).map_err(|e| LcpError::MalformedJson(e.to_string()))?;

        let fields: StatusFields = serde_json::from_value(value)
            .map_err(|e| LcpError::InvalidStatusDocument(e.to_string()))?;

        Ok(Self { json, fields })
    }

    /// Returns the original JSON.
    #[must_use]
    pub fn json(&self) -> &str {
        &self.json
    }

    /// Returns the identifier of the license this status describes.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.fields.id
    }

    #[must_use]
    pub fn status(&self) -> Status {
        self.fields.status
    }

    /// Returns the human-readable message of the server.
    #[must_use]
    pub fn message(&self) -> &str {
        &self.fields.message
    }

    /// Returns the date of the latest License Document.
    #[must_use]
    pub fn license_updated(&self) -> DateTime<Utc> {
        self.fields.updated.license
    }

    /// Returns the date of the latest status change.
    #[must_use]
    pub fn status_updated(&self) -> DateTime<Utc> {
        self.fields.updated.status
    }

    #[must_use]
    pub fn links(&self) -> &[Link] {
        &self.fields.links
    }

    /// Returns the end date a renewal could reach.
    #[must_use]
    pub fn potential_end(&self) -> Option<DateTime<Utc>> {
        self.fields.potential_rights.as_ref().and_then(|r| r.end)
    }

    #[must_use]
    pub fn events(&self) -> &[Event] {
        &self.fields.events
    }

    /// Counts the events of the given kind.
    #[must_use]
    pub fn event_count(&self, kind: EventType) -> usize {
        self.fields.events.iter().filter(|e| e.kind == kind).count()
    }

    /// Finds a link by relation, preferring `preferred_type` when given.
    #[must_use]
    pub fn link(&self, rel: &str, preferred_type: Option<&str>) -> Option<&Link> {
        find_link(&self.fields.links, rel, preferred_type)
    }

    /// Finds the first link with `rel` that declares no media type.
    #[must_use]
    pub fn link_without_type(&self, rel: &str) -> Option<&Link> {
        self.fields
            .links
            .iter()
            .find(|l| l.has_rel(rel) && l.media_type.is_none())
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
