//! License and Status Document models.

pub mod license;
pub mod link;
pub mod status;

pub use license::{ContentKey, Encryption, LicenseDocument, Rights, Signature, User, UserKey};
pub use link::{media_type, rel, Link};
pub use status::{Event, EventType, PotentialRights, Status, StatusDocument, Updated};
