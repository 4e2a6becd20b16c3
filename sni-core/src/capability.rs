//! Device capabilities.
//!
//! A driver advertises a fixed set of capabilities; callers check the set
//! before using an optional operation.

use serde::{Deserialize, Serialize};

use crate::error::{SniError, SniResult};

/// One class of operation a device may or may not support.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Capability {
    ReadMemory,
    WriteMemory,
    ExecuteAsm,
    ResetSystem,
    ResetToMenu,
    PauseUnpause,
    PauseToggle,
    ReadDirectory,
    MakeDirectory,
    RemoveFile,
    RenameFile,
    PutFile,
    GetFile,
    BootFile,
}

/// Memory access only.
pub const MEMORY: &[Capability] = &[Capability::ReadMemory, Capability::WriteMemory];

/// Every filesystem operation.
pub const FILESYSTEM: &[Capability] = &[
    Capability::ReadDirectory,
    Capability::MakeDirectory,
    Capability::RemoveFile,
    Capability::RenameFile,
    Capability::PutFile,
    Capability::GetFile,
    Capability::BootFile,
];

/// Check that every requested capability is advertised.
///
/// Fails with the first missing capability.
pub fn check_capabilities(requested: &[Capability], advertised: &[Capability]) -> SniResult<()> {
    match requested.iter().find(|cap| !advertised.contains(cap)) {
        Some(missing) => Err(SniError::MissingCapability(*missing)),
        None => Ok(()),
    }
}
