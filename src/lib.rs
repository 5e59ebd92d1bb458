//! CalDAV synchronization core: a library crate, no binary surface.
//! See `SPEC_FULL.md` for the module layout and `DESIGN.md` for how each
//! part is grounded.

pub mod calendar;
pub mod config;
pub mod credentials;

pub use calendar::{SyncEngine, SyncError, SyncResult};
pub use config::{ConfigError, ConflictPolicyConfig, SyncCoreConfig};
pub use credentials::{Credential, CredentialError, CredentialStore, StaticCredentialStore};
