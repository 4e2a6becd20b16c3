//! Device trait - a live connection to one SNES backend.

use std::io::{Read, Write};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::capability::Capability;
use crate::error::{SniError, SniResult};
use crate::mapping::AddressSpace;
use crate::memory::{MemoryReadRequest, MemoryReadResponse, MemoryWriteRequest, MemoryWriteResponse};

/// Reports `(bytes_done, bytes_total)` during a file transfer.
pub type ProgressReport<'a> = &'a mut dyn FnMut(u32, u32);

/// Reports the total size of a file before its contents arrive.
pub type SizeReceived<'a> = &'a mut dyn FnMut(u32);

/// Optional point in time by which an operation must finish.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Deadline(Option<Instant>);

impl Deadline {
    /// No deadline.
    pub fn none() -> Self {
        Self(None)
    }

    pub fn after(timeout: Duration) -> Self {
        Self(Some(Instant::now() + timeout))
    }

    pub fn at(instant: Instant) -> Self {
        Self(Some(instant))
    }

    pub fn is_expired(&self) -> bool {
        matches!(self.0, Some(at) if Instant::now() >= at)
    }

    /// Fails with `Timeout` once the deadline has passed.
    pub fn check(&self) -> SniResult<()> {
        if self.is_expired() {
            Err(SniError::Timeout)
        } else {
            Ok(())
        }
    }

    /// Time left, capped at `fallback`; fails once expired.
    ///
    /// Socket timeouts must be non-zero, so a deadline that is about to expire
    /// still yields at least one millisecond.
    pub fn remaining_or(&self, fallback: Duration) -> SniResult<Duration> {
        match self.0 {
            None => Ok(fallback),
            Some(at) => {
                let left = at
                    .checked_duration_since(Instant::now())
                    .ok_or(SniError::Timeout)?;
                Ok(left.min(fallback).max(Duration::from_millis(1)))
            }
        }
    }
}

/// Kind of a directory entry on a device filesystem.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DirEntryKind {
    Directory,
    File,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirEntry {
    pub name: String,
    pub kind: DirEntryKind,
}

/// A live connection to a backend.
///
/// Memory requests handed to a device are already expressed in its
/// `native_address_space`. Optional operations default to failing with the
/// capability they need, so a backend only implements what it advertises.
pub trait Device: Send + Sync {
    /// Whether the underlying transport is known to be dead.
    fn is_closed(&self) -> bool;

    /// Release the transport. Closing twice is harmless.
    fn close(&self) -> SniResult<()>;

    /// Space this device's memory operations are expressed in.
    fn native_address_space(&self) -> AddressSpace;

    /// Space callers are advised to use with this device.
    fn default_address_space(&self) -> AddressSpace {
        AddressSpace::SnesABus
    }

    /// Name the backend reported for itself during its handshake.
    fn client_name(&self) -> Option<String> {
        None
    }

    fn multi_read(
        &self,
        deadline: Deadline,
        reads: &[MemoryReadRequest],
    ) -> SniResult<Vec<MemoryReadResponse>>;

    fn multi_write(
        &self,
        deadline: Deadline,
        writes: &[MemoryWriteRequest],
    ) -> SniResult<Vec<MemoryWriteResponse>>;

    fn reset_system(&self, _deadline: Deadline) -> SniResult<()> {
        Err(SniError::MissingCapability(Capability::ResetSystem))
    }

    fn reset_to_menu(&self, _deadline: Deadline) -> SniResult<()> {
        Err(SniError::MissingCapability(Capability::ResetToMenu))
    }

    /// Set the paused state; returns the state now in effect.
    fn pause_unpause(&self, _deadline: Deadline, _paused: bool) -> SniResult<bool> {
        Err(SniError::MissingCapability(Capability::PauseUnpause))
    }

    fn pause_toggle(&self, _deadline: Deadline) -> SniResult<()> {
        Err(SniError::MissingCapability(Capability::PauseToggle))
    }

    fn read_directory(&self, _deadline: Deadline, _path: &str) -> SniResult<Vec<DirEntry>> {
        Err(SniError::MissingCapability(Capability::ReadDirectory))
    }

    fn make_directory(&self, _deadline: Deadline, _path: &str) -> SniResult<()> {
        Err(SniError::MissingCapability(Capability::MakeDirectory))
    }

    fn remove_file(&self, _deadline: Deadline, _path: &str) -> SniResult<()> {
        Err(SniError::MissingCapability(Capability::RemoveFile))
    }

    fn rename_file(&self, _deadline: Deadline, _path: &str, _new_name: &str) -> SniResult<()> {
        Err(SniError::MissingCapability(Capability::RenameFile))
    }

    /// Stream `size` bytes from `reader` into `path`; returns bytes written.
    fn put_file(
        &self,
        _deadline: Deadline,
        _path: &str,
        _size: u32,
        _reader: &mut dyn Read,
        _progress: Option<ProgressReport<'_>>,
    ) -> SniResult<u32> {
        Err(SniError::MissingCapability(Capability::PutFile))
    }

    /// Stream `path` into `writer`; returns the file size.
    fn get_file(
        &self,
        _deadline: Deadline,
        _path: &str,
        _writer: &mut dyn Write,
        _size_received: Option<SizeReceived<'_>>,
        _progress: Option<ProgressReport<'_>>,
    ) -> SniResult<u32> {
        Err(SniError::MissingCapability(Capability::GetFile))
    }

    /// Boot `path` as the running program.
    fn boot_file(&self, _deadline: Deadline, _path: &str) -> SniResult<()> {
        Err(SniError::MissingCapability(Capability::BootFile))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_deadline_none_never_expires() {
        let d = Deadline::none();
        assert!(d.check().is_ok());
        assert_eq!(
            d.remaining_or(Duration::from_secs(3)).unwrap(),
            Duration::from_secs(3)
        );
    }

    #[test]
    fn test_deadline_expired() {
        let d = Deadline::at(Instant::now() - Duration::from_millis(5));
        assert!(d.is_expired());
        assert!(matches!(d.check(), Err(SniError::Timeout)));
        assert!(matches!(
            d.remaining_or(Duration::from_secs(1)),
            Err(SniError::Timeout)
        ));
    }

    #[test]
    fn test_deadline_caps_remaining() {
        let d = Deadline::after(Duration::from_secs(60));
        let left = d.remaining_or(Duration::from_millis(250)).unwrap();
        assert_eq!(left, Duration::from_millis(250));
    }
}
