//! SQLite persistence for the LCP license engine.
//!
//! [`SqliteStore`] implements every repository trait of `lcp-license` over a
//! single database file:
//!
//! - `licenses`: rights counters and dates of validated licenses
//! - `registered_devices`: licenses this device registered for
//! - `passphrases`: accepted passphrase hashes, one per license
//! - `settings`: small values such as the device id and the cached CRL
//!
//! The connection is shared behind a mutex, so every operation is atomic
//! with respect to the others.

use chrono::{DateTime, SecondsFormat, Utc};
use lcp_license::{
    consume, DeviceRepository, KeyValueStore, LcpError, LcpResult, LicenseDocument,
    LicenseRepository, PassphraseEntry, PassphraseRepository,
};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::debug;

/// Which rights counter an operation applies to.
#[derive(Debug, Clone, Copy)]
enum Counter {
    Copy,
    Print,
}

impl Counter {
    fn column(self) -> &'static str {
        match self {
            Self::Copy => "copies_left",
            Self::Print => "prints_left",
        }
    }
}

/// Persistent store for license state backed by SQLite.
#[derive(Clone)]
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    /// Opens (or creates) a store at the given path.
    pub fn open(path: impl AsRef<Path>) -> LcpResult<Self> {
        let path = path.as_ref();
        let conn = Connection::open(path).map_err(|e| {
            LcpError::Storage(format!("failed to open {}: {e}", path.display()))
        })?;
        debug!("opened license store at {}", path.display());
        Self::with_connection(conn)
    }

    /// Opens an in-memory store (for testing).
    pub fn open_in_memory() -> LcpResult<Self> {
        let conn = Connection::open_in_memory()
            .map_err(|e| LcpError::Storage(format!("failed to open in-memory store: {e}")))?;
        Self::with_connection(conn)
    }

    fn with_connection(conn: Connection) -> LcpResult<Self> {
        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        store.init_schema()?;
        Ok(store)
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn init_schema(&self) -> LcpResult<()> {
        self.conn()
            .execute_batch(
                "
                CREATE TABLE IF NOT EXISTS licenses (
                    id TEXT PRIMARY KEY,
                    provider TEXT NOT NULL,
                    issued TEXT NOT NULL,
                    updated TEXT NOT NULL,
                    end_date TEXT,
                    copies_left INTEGER,
                    prints_left INTEGER
                );

                CREATE TABLE IF NOT EXISTS registered_devices (
                    license_id TEXT PRIMARY KEY,
                    registered_at TEXT NOT NULL
                );

                CREATE TABLE IF NOT EXISTS passphrases (
                    license_id TEXT PRIMARY KEY,
                    provider TEXT NOT NULL,
                    user_id TEXT,
                    passphrase TEXT NOT NULL
                );

                CREATE INDEX IF NOT EXISTS passphrases_user ON passphrases (user_id);

                CREATE TABLE IF NOT EXISTS settings (
                    key TEXT PRIMARY KEY,
                    value TEXT NOT NULL
                );
                ",
            )
            .map_err(|e| LcpError::Storage(format!("failed to init schema: {e}")))
    }

    /// Returns the stored end date of a license.
    pub fn license_end(&self, license_id: &str) -> LcpResult<Option<DateTime<Utc>>> {
        let end: Option<Option<String>> = self
            .conn()
            .query_row(
                "SELECT end_date FROM licenses WHERE id = ?1",
                params![license_id],
                |row| row.get(0),
            )
            .optional()
            .map_err(|e| LcpError::Storage(format!("failed to read license end: {e}")))?;

        end.flatten()
            .map(|s| {
                DateTime::parse_from_rfc3339(&s)
                    .map(|d| d.with_timezone(&Utc))
                    .map_err(|e| LcpError::Storage(format!("invalid end date {s}: {e}")))
            })
            .transpose()
    }

    /// Returns true once a license was recorded.
    pub fn has_license(&self, license_id: &str) -> LcpResult<bool> {
        let count: i64 = self
            .conn()
            .query_row(
                "SELECT COUNT(*) FROM licenses WHERE id = ?1",
                params![license_id],
                |row| row.get(0),
            )
            .map_err(|e| LcpError::Storage(format!("failed to read license: {e}")))?;
        Ok(count > 0)
    }

    /// Returns the number of licenses recorded.
    pub fn license_count(&self) -> LcpResult<usize> {
        let count: i64 = self
            .conn()
            .query_row("SELECT COUNT(*) FROM licenses", [], |row| row.get(0))
            .map_err(|e| LcpError::Storage(format!("failed to count licenses: {e}")))?;
        Ok(count as usize)
    }

    fn counter(&self, counter: Counter, license_id: &str) -> LcpResult<Option<i64>> {
        let sql = format!("SELECT {} FROM licenses WHERE id = ?1", counter.column());
        let left: Option<Option<i64>> = self
            .conn()
            .query_row(&sql, params![license_id], |row| row.get(0))
            .optional()
            .map_err(|e| LcpError::Storage(format!("failed to read {}: {e}", counter.column())))?;
        Ok(left.flatten())
    }

    fn try_consume(&self, counter: Counter, quantity: i64, license_id: &str) -> LcpResult<bool> {
        let conn = self.conn();
        let select = format!("SELECT {} FROM licenses WHERE id = ?1", counter.column());
        let left: Option<Option<i64>> = conn
            .query_row(&select, params![license_id], |row| row.get(0))
            .optional()
            .map_err(|e| LcpError::Storage(format!("failed to read {}: {e}", counter.column())))?;

        let Some(left) = left else {
            // Unknown license: nothing restricts it.
            return Ok(consume(None, quantity).is_some());
        };
        let Some(new_left) = consume(left, quantity) else {
            return Ok(false);
        };
        if let Some(new_left) = new_left {
            let update = format!("UPDATE licenses SET {} = ?1 WHERE id = ?2", counter.column());
            conn.execute(&update, params![new_left, license_id])
                .map_err(|e| {
                    LcpError::Storage(format!("failed to update {}: {e}", counter.column()))
                })?;
        }
        Ok(true)
    }
}

impl std::fmt::Debug for SqliteStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteStore").finish_non_exhaustive()
    }
}

fn timestamp(date: DateTime<Utc>) -> String {
    date.to_rfc3339_opts(SecondsFormat::Millis, true)
}

impl LicenseRepository for SqliteStore {
    fn add_license(&self, license: &LicenseDocument) -> LcpResult<()> {
        let rights = license.rights();
        self.conn()
            .execute(
                "INSERT INTO licenses (id, provider, issued, updated, end_date, copies_left, prints_left)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                 ON CONFLICT(id) DO UPDATE SET updated = excluded.updated, end_date = excluded.end_date",
                params![
                    license.id(),
                    license.provider(),
                    timestamp(license.issued()),
                    timestamp(license.updated()),
                    rights.end.map(timestamp),
                    rights.copy,
                    rights.print,
                ],
            )
            .map_err(|e| LcpError::Storage(format!("failed to save license: {e}")))?;
        Ok(())
    }

    fn copies_left(&self, license_id: &str) -> LcpResult<Option<i64>> {
        self.counter(Counter::Copy, license_id)
    }

    fn prints_left(&self, license_id: &str) -> LcpResult<Option<i64>> {
        self.counter(Counter::Print, license_id)
    }

    fn try_copy(&self, quantity: i64, license_id: &str) -> LcpResult<bool> {
        self.try_consume(Counter::Copy, quantity, license_id)
    }

    fn try_print(&self, quantity: i64, license_id: &str) -> LcpResult<bool> {
        self.try_consume(Counter::Print, quantity, license_id)
    }
}

impl DeviceRepository for SqliteStore {
    fn is_device_registered(&self, license_id: &str) -> LcpResult<bool> {
        let count: i64 = self
            .conn()
            .query_row(
                "SELECT COUNT(*) FROM registered_devices WHERE license_id = ?1",
                params![license_id],
                |row| row.get(0),
            )
            .map_err(|e| LcpError::Storage(format!("failed to read registration: {e}")))?;
        Ok(count > 0)
    }

    fn register_device(&self, license_id: &str) -> LcpResult<()> {
        self.conn()
            .execute(
                "INSERT OR IGNORE INTO registered_devices (license_id, registered_at) VALUES (?1, ?2)",
                params![license_id, timestamp(Utc::now())],
            )
            .map_err(|e| LcpError::Storage(format!("failed to save registration: {e}")))?;
        Ok(())
    }
}

impl PassphraseRepository for SqliteStore {
    fn passphrase(&self, license_id: &str) -> LcpResult<Option<String>> {
        self.conn()
            .query_row(
                "SELECT passphrase FROM passphrases WHERE license_id = ?1",
                params![license_id],
                |row| row.get(0),
            )
            .optional()
            .map_err(|e| LcpError::Storage(format!("failed to read passphrase: {e}")))
    }

    fn passphrases_for_user(&self, user_id: &str) -> LcpResult<Vec<String>> {
        let conn = self.conn();
        let mut stmt = conn
            .prepare("SELECT passphrase FROM passphrases WHERE user_id = ?1 ORDER BY rowid")
            .map_err(|e| LcpError::Storage(format!("failed to prepare passphrase query: {e}")))?;
        let rows = stmt
            .query_map(params![user_id], |row| row.get(0))
            .map_err(|e| LcpError::Storage(format!("failed to query passphrases: {e}")))?;
        rows.collect::<Result<Vec<String>, _>>()
            .map_err(|e| LcpError::Storage(format!("failed to read passphrase row: {e}")))
    }

    fn all_passphrases(&self) -> LcpResult<Vec<String>> {
        let conn = self.conn();
        let mut stmt = conn
            .prepare("SELECT passphrase FROM passphrases ORDER BY rowid")
            .map_err(|e| LcpError::Storage(format!("failed to prepare passphrase query: {e}")))?;
        let rows = stmt
            .query_map([], |row| row.get(0))
            .map_err(|e| LcpError::Storage(format!("failed to query passphrases: {e}")))?;
        rows.collect::<Result<Vec<String>, _>>()
            .map_err(|e| LcpError::Storage(format!("failed to read passphrase row: {e}")))
    }

    fn add_passphrase(&self, entry: &PassphraseEntry) -> LcpResult<()> {
        self.conn()
            .execute(
                "INSERT OR REPLACE INTO passphrases (license_id, provider, user_id, passphrase)
                 VALUES (?1, ?2, ?3, ?4)",
                params![entry.license_id, entry.provider, entry.user_id, entry.passphrase],
            )
            .map_err(|e| LcpError::Storage(format!("failed to save passphrase: {e}")))?;
        Ok(())
    }
}

impl KeyValueStore for SqliteStore {
    fn get(&self, key: &str) -> LcpResult<Option<String>> {
        self.conn()
            .query_row(
                "SELECT value FROM settings WHERE key = ?1",
                params![key],
                |row| row.get(0),
            )
            .optional()
            .map_err(|e| LcpError::Storage(format!("failed to read setting {key}: {e}")))
    }

    fn set(&self, key: &str, value: &str) -> LcpResult<()> {
        self.conn()
            .execute(
                "INSERT OR REPLACE INTO settings (key, value) VALUES (?1, ?2)",
                params![key, value],
            )
            .map_err(|e| LcpError::Storage(format!("failed to save setting {key}: {e}")))?;
        Ok(())
    }
}
