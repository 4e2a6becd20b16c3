//! Driver contract - one implementation per backend kind.

use serde::Serialize;

use crate::capability::{check_capabilities, Capability};
use crate::error::SniResult;
use crate::handle::DeviceHandle;
use crate::locator::{DeviceDescriptor, DeviceLocator};

/// A backend kind: static metadata, detection, and device acquisition.
pub trait Driver: Send + Sync {
    /// Registry name; also the scheme of every locator this driver owns.
    fn name(&self) -> &'static str;

    fn kind(&self) -> &'static str;

    fn display_name(&self) -> &'static str;

    fn display_description(&self) -> &'static str;

    /// Lower values sort first when drivers are listed.
    fn display_order(&self) -> i32;

    /// Fixed capability list advertised by every device of this driver.
    fn capabilities(&self) -> &'static [Capability];

    fn has_capabilities(&self, requested: &[Capability]) -> SniResult<()> {
        check_capabilities(requested, self.capabilities())
    }

    /// Best-effort enumeration of reachable devices.
    ///
    /// Failed attempts are logged and left out of the result; they never fail
    /// the whole call.
    fn detect(&self) -> SniResult<Vec<DeviceDescriptor>>;

    /// Normalized container key for a locator.
    fn device_key(&self, locator: &DeviceLocator) -> String;

    /// Handle for the device at `locator`. Never performs I/O.
    fn device(&self, locator: &DeviceLocator) -> DeviceHandle;

    /// Close every known device, tolerating individual close errors.
    fn disconnect_all(&self);
}

/// Serializable driver summary for listings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DriverInfo {
    pub name: String,
    pub kind: String,
    pub display_name: String,
    pub display_description: String,
    pub display_order: i32,
    pub capabilities: Vec<Capability>,
}

impl DriverInfo {
    pub fn of(driver: &dyn Driver) -> Self {
        Self {
            name: driver.name().to_string(),
            kind: driver.kind().to_string(),
            display_name: driver.display_name().to_string(),
            display_description: driver.display_description().to_string(),
            display_order: driver.display_order(),
            capabilities: driver.capabilities().to_vec(),
        }
    }
}
