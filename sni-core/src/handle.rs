//! Auto-reconnecting device handle.
//!
//! Callers never hold a raw device across calls. Every operation resolves the
//! device through the container, opening it if needed, so a backend that
//! dropped is noticed and reopened on the next call.

use std::io::{Read, Write};
use std::sync::Arc;

use crate::capability::{check_capabilities, Capability};
use crate::container::DeviceContainer;
use crate::device::{Deadline, DirEntry, Device, ProgressReport, SizeReceived};
use crate::error::{SniError, SniResult};
use crate::locator::DeviceLocator;
use crate::memory::{
    reads_to_space, writes_to_space, MemoryReadRequest, MemoryReadResponse, MemoryWriteRequest,
    MemoryWriteResponse,
};

/// What happens to a device after an operation completes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenPolicy {
    /// Leave the connection open for the next call.
    KeepOpen,
    /// Close the connection after every call.
    UseOnce,
}

/// Handle through which callers use a device without managing its connection.
///
/// Dropping a handle never closes the device; other handles for the same key
/// may still be using it.
#[derive(Clone)]
pub struct DeviceHandle {
    container: DeviceContainer,
    locator: DeviceLocator,
    key: String,
    capabilities: Arc<[Capability]>,
    policy: OpenPolicy,
}

impl DeviceHandle {
    pub fn new(
        container: DeviceContainer,
        locator: DeviceLocator,
        key: String,
        capabilities: &[Capability],
        policy: OpenPolicy,
    ) -> Self {
        Self {
            container,
            locator,
            key,
            capabilities: capabilities.into(),
            policy,
        }
    }

    pub fn locator(&self) -> &DeviceLocator {
        &self.locator
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn capabilities(&self) -> &[Capability] {
        &self.capabilities
    }

    pub fn has_capabilities(&self, requested: &[Capability]) -> SniResult<()> {
        check_capabilities(requested, &self.capabilities)
    }

    /// Resolve the live device, run `op` on it, then apply the open policy.
    ///
    /// A device that failed with a transport error or closed itself during
    /// `op` is evicted so the next call reopens it.
    pub fn use_device<T>(
        &self,
        deadline: Deadline,
        op: impl FnOnce(&dyn Device) -> SniResult<T>,
    ) -> SniResult<T> {
        deadline.check()?;
        let device = self.container.get_or_open_device(&self.key, &self.locator, deadline)?;

        let result = op(device.as_ref());

        let dead = match &result {
            Err(e) if e.is_transport() => true,
            _ => device.is_closed(),
        };
        if dead {
            log::info!("{}: device '{}' disconnected", self.locator.scheme(), self.key);
            self.container.close_device(&self.key, &device);
        } else if self.policy == OpenPolicy::UseOnce {
            self.container.close_device(&self.key, &device);
        }

        result
    }

    /// Read a batch of memory ranges; responses match requests one-to-one.
    pub fn multi_read(
        &self,
        deadline: Deadline,
        reads: &[MemoryReadRequest],
    ) -> SniResult<Vec<MemoryReadResponse>> {
        self.has_capabilities(&[Capability::ReadMemory])?;
        if reads.is_empty() {
            return Ok(vec![]);
        }

        self.use_device(deadline, |device| {
            let native = reads_to_space(reads, device.native_address_space())?;
            let responses = device.multi_read(deadline, &native)?;
            if responses.len() != reads.len() {
                return Err(SniError::Protocol(format!(
                    "expected {} read responses, got {}",
                    reads.len(),
                    responses.len()
                )));
            }
            Ok(reads
                .iter()
                .zip(responses)
                .map(|(request, response)| MemoryReadResponse {
                    request_address: request.address,
                    ..response
                })
                .collect())
        })
    }

    /// Write a batch of memory ranges; responses match requests one-to-one.
    pub fn multi_write(
        &self,
        deadline: Deadline,
        writes: &[MemoryWriteRequest],
    ) -> SniResult<Vec<MemoryWriteResponse>> {
        self.has_capabilities(&[Capability::WriteMemory])?;
        if writes.is_empty() {
            return Ok(vec![]);
        }

        self.use_device(deadline, |device| {
            let native = writes_to_space(writes, device.native_address_space())?;
            let responses = device.multi_write(deadline, &native)?;
            if responses.len() != writes.len() {
                return Err(SniError::Protocol(format!(
                    "expected {} write responses, got {}",
                    writes.len(),
                    responses.len()
                )));
            }
            Ok(writes
                .iter()
                .zip(responses)
                .map(|(request, response)| MemoryWriteResponse {
                    request_address: request.address,
                    ..response
                })
                .collect())
        })
    }

    pub fn reset_system(&self, deadline: Deadline) -> SniResult<()> {
        self.has_capabilities(&[Capability::ResetSystem])?;
        self.use_device(deadline, |d| d.reset_system(deadline))
    }

    pub fn reset_to_menu(&self, deadline: Deadline) -> SniResult<()> {
        self.has_capabilities(&[Capability::ResetToMenu])?;
        self.use_device(deadline, |d| d.reset_to_menu(deadline))
    }

    pub fn pause_unpause(&self, deadline: Deadline, paused: bool) -> SniResult<bool> {
        self.has_capabilities(&[Capability::PauseUnpause])?;
        self.use_device(deadline, |d| d.pause_unpause(deadline, paused))
    }

    pub fn pause_toggle(&self, deadline: Deadline) -> SniResult<()> {
        self.has_capabilities(&[Capability::PauseToggle])?;
        self.use_device(deadline, |d| d.pause_toggle(deadline))
    }

    pub fn read_directory(&self, deadline: Deadline, path: &str) -> SniResult<Vec<DirEntry>> {
        self.has_capabilities(&[Capability::ReadDirectory])?;
        self.use_device(deadline, |d| d.read_directory(deadline, path))
    }

    pub fn make_directory(&self, deadline: Deadline, path: &str) -> SniResult<()> {
        self.has_capabilities(&[Capability::MakeDirectory])?;
        self.use_device(deadline, |d| d.make_directory(deadline, path))
    }

    pub fn remove_file(&self, deadline: Deadline, path: &str) -> SniResult<()> {
        self.has_capabilities(&[Capability::RemoveFile])?;
        self.use_device(deadline, |d| d.remove_file(deadline, path))
    }

    pub fn rename_file(&self, deadline: Deadline, path: &str, new_name: &str) -> SniResult<()> {
        self.has_capabilities(&[Capability::RenameFile])?;
        self.use_device(deadline, |d| d.rename_file(deadline, path, new_name))
    }

    pub fn put_file(
        &self,
        deadline: Deadline,
        path: &str,
        size: u32,
        reader: &mut dyn Read,
        progress: Option<ProgressReport<'_>>,
    ) -> SniResult<u32> {
        self.has_capabilities(&[Capability::PutFile])?;
        self.use_device(deadline, |d| d.put_file(deadline, path, size, reader, progress))
    }

    pub fn get_file(
        &self,
        deadline: Deadline,
        path: &str,
        writer: &mut dyn Write,
        size_received: Option<SizeReceived<'_>>,
        progress: Option<ProgressReport<'_>>,
    ) -> SniResult<u32> {
        self.has_capabilities(&[Capability::GetFile])?;
        self.use_device(deadline, |d| {
            d.get_file(deadline, path, writer, size_received, progress)
        })
    }

    pub fn boot_file(&self, deadline: Deadline, path: &str) -> SniResult<()> {
        self.has_capabilities(&[Capability::BootFile])?;
        self.use_device(deadline, |d| d.boot_file(deadline, path))
    }
}
