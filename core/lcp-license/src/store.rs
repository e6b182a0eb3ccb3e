//! Persistence collaborators.
//!
//! The engine never owns a storage engine: repositories are injected as trait
//! objects. [`MemoryStore`] implements all of them in memory; the
//! `lcp-store` crate provides a SQLite implementation.

use crate::document::LicenseDocument;
use crate::error::LcpResult;
use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, MutexGuard, PoisonError};

/// Rights consumption per license id.
pub trait LicenseRepository: Send + Sync {
    /// Records a validated license. Counters are initialized from its rights
    /// the first time; later calls only refresh the stored dates.
    fn add_license(&self, license: &LicenseDocument) -> LcpResult<()>;

    /// Characters left to copy, `None` when unlimited.
    fn copies_left(&self, license_id: &str) -> LcpResult<Option<i64>>;

    /// Pages left to print, `None` when unlimited.
    fn prints_left(&self, license_id: &str) -> LcpResult<Option<i64>>;

    /// Consumes `quantity` characters if enough are left.
    fn try_copy(&self, quantity: i64, license_id: &str) -> LcpResult<bool>;

    /// Consumes `quantity` pages if enough are left.
    fn try_print(&self, quantity: i64, license_id: &str) -> LcpResult<bool>;
}

/// Device registration record per license id.
pub trait DeviceRepository: Send + Sync {
    fn is_device_registered(&self, license_id: &str) -> LcpResult<bool>;

    fn register_device(&self, license_id: &str) -> LcpResult<()>;
}

/// A passphrase hash accepted for a license.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PassphraseEntry {
    pub license_id: String,
    pub provider: String,
    pub user_id: Option<String>,
    /// SHA-256 hash, hex encoded.
    pub passphrase: String,
}

/// Accepted passphrase hashes.
pub trait PassphraseRepository: Send + Sync {
    /// The passphrase stored for this license.
    fn passphrase(&self, license_id: &str) -> LcpResult<Option<String>>;

    /// Passphrases stored for any license of this user.
    fn passphrases_for_user(&self, user_id: &str) -> LcpResult<Vec<String>>;

    /// Every stored passphrase.
    fn all_passphrases(&self) -> LcpResult<Vec<String>>;

    /// Stores an accepted passphrase, replacing any previous one for the
    /// same license.
    fn add_passphrase(&self, entry: &PassphraseEntry) -> LcpResult<()>;
}

/// Small string key-value store (device id, CRL cache).
pub trait KeyValueStore: Send + Sync {
    fn get(&self, key: &str) -> LcpResult<Option<String>>;

    fn set(&self, key: &str, value: &str) -> LcpResult<()>;
}

/// Applies a consumption request to a counter.
///
/// Returns the new counter value, or `None` if the request is refused.
/// An absent counter is unlimited and never changes.
pub fn consume(left: Option<i64>, quantity: i64) -> Option<Option<i64>> {
    if quantity < 0 {
        return None;
    }
    match left {
        None => Some(None),
        Some(left) if left >= quantity => Some(Some(left - quantity)),
        Some(_) => None,
    }
}

#[derive(Debug, Clone)]
struct LicenseRecord {
    end: Option<DateTime<Utc>>,
    copies_left: Option<i64>,
    prints_left: Option<i64>,
}

#[derive(Debug, Default)]
struct MemoryState {
    licenses: HashMap<String, LicenseRecord>,
    registered: HashSet<String>,
    passphrases: Vec<PassphraseEntry>,
    values: HashMap<String, String>,
}

/// In-memory implementation of every repository.
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Returns the stored end date of a license.
    pub fn license_end(&self, license_id: &str) -> Option<DateTime<Utc>> {
        self.state().licenses.get(license_id).and_then(|r| r.end)
    }

    /// Returns the number of licenses recorded.
    pub fn license_count(&self) -> usize {
        self.state().licenses.len()
    }
}

impl LicenseRepository for MemoryStore {
    fn add_license(&self, license: &LicenseDocument) -> LcpResult<()> {
        let mut state = self.state();
        match state.licenses.get_mut(license.id()) {
            Some(record) => {
                record.end = license.rights().end;
            }
            None => {
                state.licenses.insert(
                    license.id().to_string(),
                    LicenseRecord {
                        end: license.rights().end,
                        copies_left: license.rights().copy,
                        prints_left: license.rights().print,
                    },
                );
            }
        }
        Ok(())
    }

    fn copies_left(&self, license_id: &str) -> LcpResult<Option<i64>> {
        Ok(self
            .state()
            .licenses
            .get(license_id)
            .and_then(|r| r.copies_left))
    }

    fn prints_left(&self, license_id: &str) -> LcpResult<Option<i64>> {
        Ok(self
            .state()
            .licenses
            .get(license_id)
            .and_then(|r| r.prints_left))
    }

    fn try_copy(&self, quantity: i64, license_id: &str) -> LcpResult<bool> {
        let mut state = self.state();
        let Some(record) = state.licenses.get_mut(license_id) else {
            return Ok(consume(None, quantity).is_some());
        };
        match consume(record.copies_left, quantity) {
            Some(left) => {
                record.copies_left = left;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn try_print(&self, quantity: i64, license_id: &str) -> LcpResult<bool> {
        let mut state = self.state();
        let Some(record) = state.licenses.get_mut(license_id) else {
            return Ok(consume(None, quantity).is_some());
        };
        match consume(record.prints_left, quantity) {
            Some(left) => {
                record.prints_left = left;
                Ok(true)
            }
            None => Ok(false),
        }
    }
}

impl DeviceRepository for MemoryStore {
    fn is_device_registered(&self, license_id: &str) -> LcpResult<bool> {
        Ok(self.state().registered.contains(license_id))
    }

    fn register_device(&self, license_id: &str) -> LcpResult<()> {
        self.state().registered.insert(license_id.to_string());
        Ok(())
    }
}

impl PassphraseRepository for MemoryStore {
    fn passphrase(&self, license_id: &str) -> LcpResult<Option<String>> {
        Ok(self
            .state()
            .passphrases
            .iter()
            .find(|e| e.license_id == license_id)
            .map(|e| e.passphrase.clone()))
    }

    fn passphrases_for_user(&self, user_id: &str) -> LcpResult<Vec<String>> {
        Ok(self
            .state()
            .passphrases
            .iter()
            .filter(|e| e.user_id.as_deref() == Some(user_id))
            .map(|e| e.passphrase.clone())
            .collect())
    }

    fn all_passphrases(&self) -> LcpResult<Vec<String>> {
        Ok(self
            .state()
            .passphrases
            .iter()
            .map(|e| e.passphrase.clone())
            .collect())
    }

    fn add_passphrase(&self, entry: &PassphraseEntry) -> LcpResult<()> {
        let mut state = self.state();
        state.passphrases.retain(|e| e.license_id != entry.license_id);
        state.passphrases.push(entry.clone());
        Ok(())
    }
}

impl KeyValueStore for MemoryStore {
    fn get(&self, key: &str) -> LcpResult<Option<String>> {
        Ok(self.state().values.get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> LcpResult<()> {
        self.state()
            .values
            .insert(key.to_string(), value.to_string());
        Ok(())
    }
}
