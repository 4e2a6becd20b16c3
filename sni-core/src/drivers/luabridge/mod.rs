//! Lua bridge driver: emulator Lua scripts connect to us over TCP.
//!
//! Server mode. Each accepted script is a container entry keyed by its
//! remote endpoint. The driver cannot dial out, so a locator for a script
//! that is not connected finds nothing.

mod device;

use std::net::{SocketAddr, TcpStream};
use std::sync::Arc;
use std::thread;

pub use device::{LuaBridgeDevice, DEFAULT_TIMEOUT};

use crate::capability::Capability;
use crate::container::DeviceContainer;
use crate::device::{Deadline, Device};
use crate::driver::Driver;
use crate::error::SniResult;
use crate::handle::{DeviceHandle, OpenPolicy};
use crate::locator::{DeviceDescriptor, DeviceLocator};
use crate::mapping::AddressSpace;

pub const DRIVER_NAME: &str = "luabridge";

const CAPABILITIES: &[Capability] = &[
    Capability::ReadMemory,
    Capability::WriteMemory,
    Capability::ResetSystem,
    Capability::PauseUnpause,
];

pub struct LuaBridgeDriver {
    container: DeviceContainer,
}

impl Default for LuaBridgeDriver {
    fn default() -> Self {
        Self::new()
    }
}

impl LuaBridgeDriver {
    pub fn new() -> Self {
        Self {
            container: DeviceContainer::accept_only(),
        }
    }

    /// Take ownership of a freshly accepted connection.
    ///
    /// The handshake runs on its own thread so a silent peer cannot stall
    /// the accept loop.
    pub fn accept(&self, stream: TcpStream, peer: SocketAddr) {
        let container = self.container.clone();
        let spawned = thread::Builder::new()
            .name(format!("luabridge-{}", peer))
            .spawn(move || {
                let key = peer.to_string();
                let deadline = Deadline::after(DEFAULT_TIMEOUT);
                match LuaBridgeDevice::handshake(stream, key.clone(), container.downgrade(), deadline) {
                    Ok(device) => {
                        let device = Arc::new(device);
                        if let Err(e) = container.put_device(&key, device.clone()) {
                            log::warn!("luabridge: {}: {}", key, e);
                            return;
                        }
                        if let Err(e) = device.watch() {
                            log::warn!("luabridge: {}: cannot watch connection: {}", key, e);
                        }
                    }
                    Err(e) => log::warn!("luabridge: {}: handshake failed: {}", key, e),
                }
            });
        if let Err(e) = spawned {
            log::warn!("luabridge: {}: {}", peer, e);
        }
    }

    fn descriptor(&self, key: &str, device: &dyn Device) -> DeviceDescriptor {
        let name = device.client_name().unwrap_or_else(|| "Lua bridge".to_string());
        DeviceDescriptor {
            locator: DeviceLocator::with_host(DRIVER_NAME, key),
            display_name: format!("{} at {}", name, key),
            kind: self.kind().to_string(),
            capabilities: CAPABILITIES.to_vec(),
            default_address_space: AddressSpace::SnesABus,
        }
    }
}

impl Driver for LuaBridgeDriver {
    fn name(&self) -> &'static str {
        DRIVER_NAME
    }

    fn kind(&self) -> &'static str {
        "luabridge"
    }

    fn display_name(&self) -> &'static str {
        "Lua Bridge"
    }

    fn display_description(&self) -> &'static str {
        "Connect to emulators running the Lua bridge script"
    }

    fn display_order(&self) -> i32 {
        3
    }

    fn capabilities(&self) -> &'static [Capability] {
        CAPABILITIES
    }

    /// Lists the scripts currently connected; performs no I/O.
    fn detect(&self) -> SniResult<Vec<DeviceDescriptor>> {
        let mut keys = self.container.all_device_keys();
        keys.sort();
        Ok(keys
            .iter()
            .filter_map(|key| {
                let device = self.container.get_device(key)?;
                (!device.is_closed()).then(|| self.descriptor(key, device.as_ref()))
            })
            .collect())
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
