//! Shared data model for the plugin daemon.
//!
//! This crate has no I/O and no async runtime dependency; it exists so every
//! other crate in the workspace (proto, session, security, runtime, manager,
//! cluster, storage, server) can agree on the same identifier, manifest,
//! permission, and error types without depending on each other.

mod access;
mod declaration;
mod error;
mod identifier;

pub use access::PluginAccessType;
pub use declaration::{
    Architecture, ModelPermission, PermissionMatrix, PluginCategory, PluginDeclaration,
    RunnerHints, StoragePermission,
};
pub use error::DaemonError;
pub use identifier::{IdentifierParseError, PluginUniqueIdentifier, MIN_CHECKSUM_LEN};
