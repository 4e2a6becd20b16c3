//! Mock driver: an in-process SNES for exercising the stack without hardware.

mod device;
mod filesystem;

use std::sync::Arc;

pub use device::{MockDevice, SharedFilesystem, FRAME, FRAME_COUNTER, MEMORY_SIZE};
pub use filesystem::MemoryFilesystem;

use crate::capability::Capability;
use crate::container::DeviceContainer;
use crate::device::Device;
use crate::driver::Driver;
use crate::error::SniResult;
use crate::handle::{DeviceHandle, OpenPolicy};
use crate::locator::{DeviceDescriptor, DeviceLocator};
use crate::mapping::AddressSpace;

pub const DRIVER_NAME: &str = "mock";

const CAPABILITIES: &[Capability] = &[
    Capability::ReadMemory,
    Capability::WriteMemory,
    Capability::ResetSystem,
    Capability::ResetToMenu,
    Capability::PauseUnpause,
    Capability::PauseToggle,
    Capability::ReadDirectory,
    Capability::MakeDirectory,
    Capability::RemoveFile,
    Capability::RenameFile,
    Capability::PutFile,
    Capability::GetFile,
    Capability::BootFile,
];

pub struct MockDriver {
    container: DeviceContainer,
    fs: SharedFilesystem,
}

impl Default for MockDriver {
    fn default() -> Self {
        Self::new(MemoryFilesystem::new())
    }
}

impl MockDriver {
    /// Create a driver whose devices share `fs` as their card storage.
    pub fn new(fs: MemoryFilesystem) -> Self {
        let fs: SharedFilesystem = Arc::new(std::sync::Mutex::new(fs));
        let container = {
            let fs = Arc::clone(&fs);
            DeviceContainer::new(move |_, _| {
                Ok(Arc::new(MockDevice::open(Arc::clone(&fs))?) as Arc<dyn Device>)
            })
        };
        Self { container, fs }
    }

    /// The single locator this driver answers to.
    pub fn locator() -> DeviceLocator {
        DeviceLocator::with_opaque(DRIVER_NAME, "mock")
    }

    pub fn filesystem(&self) -> SharedFilesystem {
        Arc::clone(&self.fs)
    }

    /// Live device for `locator`, if one is open. Lets tests cut the
    /// connection underneath a handle.
    pub fn live_device(&self, locator: &DeviceLocator) -> Option<Arc<dyn Device>> {
        self.container.get_device(&self.device_key(locator))
    }
}

impl Driver for MockDriver {
    fn name(&self) -> &'static str {
        DRIVER_NAME
    }

    fn kind(&self) -> &'static str {
        "mock"
    }

    fn display_name(&self) -> &'static str {
        "Mock Device"
    }

    fn display_description(&self) -> &'static str {
        "Connect to a mock SNES device for testing"
    }

    fn display_order(&self) -> i32 {
        1000
    }

    fn capabilities(&self) -> &'static [Capability] {
        CAPABILITIES
    }

    fn detect(&self) -> SniResult<Vec<DeviceDescriptor>> {
        Ok(vec![DeviceDescriptor {
            locator: Self::locator(),
            display_name: "Mock".to_string(),
            kind: self.kind().to_string(),
            capabilities: CAPABILITIES.to_vec(),
            default_address_space: AddressSpace::SnesABus,
        }])
    }

    fn device_key(&self, locator: &DeviceLocator) -> String {
        locator.target().to_string()
    }

    fn device(&self, locator: &DeviceLocator) -> DeviceHandle {
        DeviceHandle::new(
            self.container.clone(),
            locator.clone(),
            self.device_key(locator),
            CAPABILITIES,
            OpenPolicy::KeepOpen,
        )
    }

    fn disconnect_all(&self) {
        self.container.disconnect_all(DRIVER_NAME);
    }
}
