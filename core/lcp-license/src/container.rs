//! Where a license is stored next to its publication.

use crate::document::LicenseDocument;
use crate::error::{LcpError, LcpResult};
use std::fs::File;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};
use tracing::debug;
use zip::write::SimpleFileOptions;
use zip::{ZipArchive, ZipWriter};

/// License location inside an EPUB.
pub const EPUB_LICENSE_ENTRY: &str = "META-INF/license.lcpl";
/// License location inside packaged PDF and audiobook publications.
pub const PACKAGE_LICENSE_ENTRY: &str = "license.lcpl";

/// Read/write access to the license of a publication.
pub trait LicenseContainer: Send + Sync {
    /// Returns the raw license bytes.
    fn read(&self) -> LcpResult<Vec<u8>>;

    /// Replaces the stored license.
    fn write(&self, license: &LicenseDocument) -> LcpResult<()>;
}

/// A standalone `.lcpl` license file.
#[derive(Debug, Clone)]
pub struct LcplFile {
    path: PathBuf,
}

impl LcplFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl LicenseContainer for LcplFile {
    fn read(&self) -> LcpResult<Vec<u8>> {
        std::fs::read(&self.path)
            .map_err(|e| LcpError::Container(format!("can't read {}: {e}", self.path.display())))
    }

    fn write(&self, license: &LicenseDocument) -> LcpResult<()> {
        std::fs::write(&self.path, license.as_bytes())
            .map_err(|e| LcpError::Container(format!("can't write {}: {e}", self.path.display())))
    }
}

/// The license embedded in a zipped publication (EPUB, LCP PDF,
/// audiobook).
#[derive(Debug, Clone)]
pub struct ZipContainer {
    path: PathBuf,
    entry: String,
}

impl ZipContainer {
    /// Picks the license entry from the file extension: `.lcpdf`, `.lcpa`
    /// and `.audiobook` keep it at the root, anything else under `META-INF`.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let extension = path
            .extension()
            .and_then(|e| e.to_str())
            .map(str::to_ascii_lowercase);
        let entry = match extension.as_deref() {
            Some("lcpdf" | "lcpa" | "audiobook") => PACKAGE_LICENSE_ENTRY,
            _ => EPUB_LICENSE_ENTRY,
        };
        Self::with_entry(path, entry)
    }

    pub fn with_entry(path: impl Into<PathBuf>, entry: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            entry: entry.into(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn entry(&self) -> &str {
        &self.entry
    }

    fn error(&self, action: &str, e: impl std::fmt::Display) -> LcpError {
        LcpError::Container(format!("can't {action} {}: {e}", self.path.display()))
    }

    fn open(&self) -> LcpResult<ZipArchive<File>> {
        let file = File::open(&self.path).map_err(|e| self.error("read", e))?;
        ZipArchive::new(file).map_err(|e| self.error("read", e))
    }

    /// Copies every other entry untouched, then appends the license.
    fn rewrite(&self, target: &Path, license: &[u8]) -> LcpResult<()> {
        let mut archive = self.open()?;
        let file = File::create(target).map_err(|e| self.error("write", e))?;
        let mut zip = ZipWriter::new(file);

        for i in 0..archive.len() {
            let entry = archive.by_index_raw(i).map_err(|e| self.error("read", e))?;
            if entry.name() == self.entry {
                continue;
            }
            zip.raw_copy_file(entry).map_err(|e| self.error("write", e))?;
        }

        let options =
            SimpleFileOptions::default().compression_method(zip::CompressionMethod::Deflated);
        zip.start_file(self.entry.as_str(), options)
            .map_err(|e| self.error("write", e))?;
        zip.write_all(license).map_err(|e| self.error("write", e))?;
        zip.finish().map_err(|e| self.error("write", e))?;
        Ok(())
    }
}

impl LicenseContainer for ZipContainer {
    fn read(&self) -> LcpResult<Vec<u8>> {
        let mut archive = self.open()?;
        let mut file = archive.by_name(&self.entry).map_err(|e| {
            LcpError::Container(format!("no {} in {}: {e}", self.entry, self.path.display()))
        })?;
        let mut data = Vec::new();
        file.read_to_end(&mut data).map_err(|e| self.error("read", e))?;
        Ok(data)
    }

    fn write(&self, license: &LicenseDocument) -> LcpResult<()> {
        let mut name = self.path.file_name().unwrap_or_default().to_os_string();
        name.push(".tmp");
        let tmp = self.path.with_file_name(name);

        if let Err(e) = self.rewrite(&tmp, license.as_bytes()) {
            let _ = std::fs::remove_file(&tmp);
            return Err(e);
        }
        std::fs::rename(&tmp, &self.path).map_err(|e| self.error("write", e))?;
        debug!("license written to {} in {}", self.entry, self.path.display());
        Ok(())
    }
}

/// A license held in memory.
#[derive(Debug, Default)]
pub struct MemoryContainer {
    data: Mutex<Vec<u8>>,
}

impl MemoryContainer {
    pub fn new(data: impl Into<Vec<u8>>) -> Self {
        Self {
            data: Mutex::new(data.into()),
        }
    }

    /// Returns the bytes currently stored.
    pub fn data(&self) -> Vec<u8> {
        self.data.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }
}

impl LicenseContainer for MemoryContainer {
    fn read(&self) -> LcpResult<Vec<u8>> {
        let data = self.data();
        if data.is_empty() {
            return Err(LcpError::Container("no license in container".to_string()));
        }
        Ok(data)
    }

    fn write(&self, license: &LicenseDocument) -> LcpResult<()> {
        *self.data.lock().unwrap_or_else(PoisonError::into_inner) = license.as_bytes().to_vec();
        Ok(())
    }
}
