//! RetroArch driver: emulators reached through the UDP network command port.

mod client;

use std::sync::Arc;
use std::thread;
use std::time::Duration;

pub use client::{RaSocket, RaVersion, RetroArchDevice, DEFAULT_TIMEOUT, MAX_READ_SIZE};

use crate::capability::Capability;
use crate::config::RetroArchConfig;
use crate::container::DeviceContainer;
use crate::device::{Deadline, Device};
use crate::driver::Driver;
use crate::error::{SniError, SniResult};
use crate::handle::{DeviceHandle, OpenPolicy};
use crate::locator::{DeviceDescriptor, DeviceLocator};
use crate::mapping::AddressSpace;

pub const DRIVER_NAME: &str = "ra";

/// How long detection waits for each instance to answer `VERSION`.
const DETECT_TIMEOUT: Duration = Duration::from_millis(250);

const CAPABILITIES: &[Capability] = &[
    Capability::ReadMemory,
    Capability::WriteMemory,
    Capability::ResetSystem,
    Capability::PauseToggle,
];

pub struct RetroArchDriver {
    hosts: Vec<String>,
    detect_log: bool,
    container: DeviceContainer,
}

impl RetroArchDriver {
    pub fn new(config: &RetroArchConfig) -> Self {
        let container = DeviceContainer::new(|locator, deadline| {
            let host = locator
                .host()
                .ok_or_else(|| SniError::InvalidLocator(locator.to_string()))?;
            let device = RetroArchDevice::connect(host, deadline).map_err(|e| {
                log::debug!("retroarch: open {}: {}", host, e);
                match e {
                    SniError::Timeout => e,
                    e => SniError::NoDevice(format!("{}: {}", locator, e)),
                }
            })?;
            Ok(Arc::new(device) as Arc<dyn Device>)
        });
        Self {
            hosts: config.hosts.clone(),
            detect_log: config.detect_log,
            container,
        }
    }

    /// Ask one configured host for its version; `None` if nothing answered.
    fn identify(&self, index: usize, host: &str) -> Option<DeviceDescriptor> {
        let result = RaSocket::connect(host)
            .and_then(|socket| socket.version(Deadline::after(DETECT_TIMEOUT)));
        match result {
            Ok(version) => Some(DeviceDescriptor {
                locator: DeviceLocator::with_host(DRIVER_NAME, host),
                display_name: format!("RetroArch v{} at {}", version, host),
                kind: self.kind().to_string(),
                capabilities: CAPABILITIES.to_vec(),
                default_address_space: AddressSpace::SnesABus,
            }),
            Err(e) => {
                if self.detect_log {
                    log::info!("retroarch: detect: detector[{}] {}: {}", index, host, e);
                } else {
                    log::debug!("retroarch: detect: detector[{}] {}: {}", index, host, e);
                }
                None
            }
        }
    }
}

impl Driver for RetroArchDriver {
    fn name(&self) -> &'static str {
        DRIVER_NAME
    }

    fn kind(&self) -> &'static str {
        "retroarch"
    }

    fn display_name(&self) -> &'static str {
        "RetroArch"
    }

    fn display_description(&self) -> &'static str {
        "Connect to a RetroArch emulator"
    }

    fn display_order(&self) -> i32 {
        1
    }

    fn capabilities(&self) -> &'static [Capability] {
        CAPABILITIES
    }

    /// Asks every configured host concurrently.
    fn detect(&self) -> SniResult<Vec<DeviceDescriptor>> {
        let found: Vec<DeviceDescriptor> = thread::scope(|scope| {
            let asks: Vec<_> = self
                .hosts
                .iter()
                .enumerate()
                .map(|(i, host)| scope.spawn(move || self.identify(i, host)))
                .collect();
            asks
                .into_iter()
                .filter_map(|a| a.join().ok().flatten())
                .collect()
        });
        Ok(found)
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
