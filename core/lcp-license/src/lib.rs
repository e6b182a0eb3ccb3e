//! LCP license acquisition and validation.
//!
//! This crate decides whether a protected publication may be opened:
//! - License and Status Document parsing
//! - Status refresh from the license server, with offline fallback
//! - Certificate revocation list caching
//! - Passphrase resolution from local history, then from the user
//! - Device registration and loan renew/return
//! - Copy and print rights consumption
//!
//! # Design Principles
//!
//! - **No crypto here**: signatures, certificate chains and key unwrapping
//!   are delegated to a [`DecryptionProvider`]
//! - **Injected collaborators**: network and storage are traits, with an
//!   in-memory store and an optional reqwest client (`online` feature)
//! - **Offline tolerant**: status and CRL failures fall back to the last
//!   known data unless configured otherwise
//! - **Explicit state machine**: every validation ends in `Valid` or a
//!   specific [`LcpError`]
//!
//! # Example
//!
//! ```ignore
//! let service = LicenseService::new(config, provider, network, Repositories::shared(store));
//! let license = service
//!     .retrieve_license(Arc::new(ZipContainer::new("book.epub")), Some(&authenticator), true)
//!     .await?;
//! let clear = license.decrypt(&resource).await?;
//! ```

mod config;
mod container;
mod crl;
mod device;
pub mod document;
mod error;
mod license;
mod lock;
pub mod network;
mod passphrase;
mod provider;
mod service;
mod store;
mod validation;

pub use config::{LcpConfig, CRL_MAX_AGE_SECS, DEFAULT_CRL_URL, SUPPORTED_PROFILES};
pub use container::{
    LcplFile, LicenseContainer, MemoryContainer, ZipContainer, EPUB_LICENSE_ENTRY,
    PACKAGE_LICENSE_ENTRY,
};
pub use crl::{RevocationCache, RevocationList, CRL_STORE_KEY};
pub use device::{DeviceService, RegistrationOutcome, DEVICE_ID_KEY};
pub use document::{LicenseDocument, Link, Status, StatusDocument};
pub use error::{LcpError, LcpResult};
pub use license::{License, RenewListener};
pub use lock::{KeyedGuard, KeyedLock};
pub use network::{FetchRequest, FetchResponse, Method, NetworkClient};
pub use passphrase::{
    candidate_hashes, dedup_candidates, hash_passphrase, is_hashed_passphrase, AuthenticationReason,
    Authenticator, PassphraseResolver,
};
pub use provider::{DecryptionContext, DecryptionProvider, ProviderError};
pub use service::{digest_matches, AcquiredPublication, LicenseService, Repositories};
pub use store::{
    consume, DeviceRepository, KeyValueStore, LicenseRepository, MemoryStore, PassphraseEntry,
    PassphraseRepository,
};
pub use validation::{status_error, Interaction, LicenseValidator, ValidatedDocuments, ValidationState};

#[cfg(feature = "online")]
pub use network::HttpNetwork;
