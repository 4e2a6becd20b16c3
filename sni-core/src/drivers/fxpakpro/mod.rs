//! FX Pak Pro (SD2SNES) flash cart over its USB serial port.

mod device;
#[cfg(test)]
mod fake;
pub mod protocol;

use std::sync::Arc;
use std::thread;
use std::time::Duration;

pub use device::{FxPakProDevice, Port};

use crate::capability::Capability;
use crate::config::FxPakProConfig;
use crate::container::DeviceContainer;
use crate::device::{Deadline, Device};
use crate::driver::Driver;
use crate::error::{SniError, SniResult};
use crate::handle::{DeviceHandle, OpenPolicy};
use crate::locator::{DeviceDescriptor, DeviceLocator};
use crate::mapping::AddressSpace;

pub const DRIVER_NAME: &str = "fxpakpro";

/// How long detection waits for each port to answer INFO.
const DETECT_TIMEOUT: Duration = Duration::from_secs(1);

const CAPABILITIES: &[Capability] = &[
    Capability::ReadMemory,
    Capability::WriteMemory,
    Capability::ResetSystem,
    Capability::ResetToMenu,
    Capability::ReadDirectory,
    Capability::MakeDirectory,
    Capability::RemoveFile,
    Capability::RenameFile,
    Capability::PutFile,
    Capability::GetFile,
    Capability::BootFile,
];

/// Opens the cart behind a port path within a deadline.
pub type Connect = Arc<dyn Fn(&str, Deadline) -> SniResult<FxPakProDevice> + Send + Sync>;

pub struct FxPakProDriver {
    ports: Vec<String>,
    policy: OpenPolicy,
    connect: Connect,
    container: DeviceContainer,
}

/// Serial device nodes the cart usually shows up as.
pub fn default_ports() -> Vec<String> {
    let prefix = if cfg!(target_os = "macos") {
        "cu.usbmodem"
    } else if cfg!(target_os = "linux") {
        "ttyACM"
    } else {
        return vec![];
    };
    let Ok(entries) = std::fs::read_dir("/dev") else {
        return vec![];
    };
    let mut ports: Vec<String> = entries
        .filter_map(|e| e.ok())
        .filter_map(|e| {
            let name = e.file_name().into_string().ok()?;
            name.starts_with(prefix).then(|| format!("/dev/{}", name))
        })
        .collect();
    ports.sort();
    ports
}

impl FxPakProDriver {
    pub fn new(config: &FxPakProConfig) -> Self {
        Self::with_connect(config, Arc::new(FxPakProDevice::open))
    }

    pub fn with_connect(config: &FxPakProConfig, connect: Connect) -> Self {
        let container = {
            let connect = Arc::clone(&connect);
            DeviceContainer::new(move |locator, deadline| {
                let path = locator
                    .opaque()
                    .ok_or_else(|| SniError::InvalidLocator(locator.to_string()))?;
                let device = connect(path, deadline).map_err(|e| {
                    log::debug!("fxpakpro: open {}: {}", path, e);
                    match e {
                        SniError::Timeout => e,
                        e => SniError::NoDevice(format!("{}: {}", locator, e)),
                    }
                })?;
                Ok(Arc::new(device) as Arc<dyn Device>)
            })
        };
        let policy = if config.release_port {
            OpenPolicy::UseOnce
        } else {
            OpenPolicy::KeepOpen
        };
        Self {
            ports: config.ports.clone(),
            policy,
            connect,
            container,
        }
    }

    pub fn locator(path: &str) -> DeviceLocator {
        DeviceLocator::with_opaque(DRIVER_NAME, path)
    }

    fn candidates(&self) -> Vec<String> {
        if self.ports.is_empty() {
            default_ports()
        } else {
            self.ports.clone()
        }
    }

    fn descriptor(&self, path: &str, device: &dyn Device) -> DeviceDescriptor {
        let name = device.client_name().unwrap_or_else(|| "FX Pak Pro".to_string());
        DeviceDescriptor {
            locator: Self::locator(path),
            display_name: format!("{} at {}", name, path),
            kind: self.kind().to_string(),
            capabilities: CAPABILITIES.to_vec(),
            default_address_space: AddressSpace::FxPakPro,
        }
    }

    /// Identify the cart at `path` without disturbing an open connection.
    fn identify(&self, path: &str) -> Option<DeviceDescriptor> {
        if let Some(device) = self.container.get_device(path) {
            if !device.is_closed() {
                return Some(self.descriptor(path, device.as_ref()));
            }
        }
        match (self.connect)(path, Deadline::after(DETECT_TIMEOUT)) {
            Ok(device) => Some(self.descriptor(path, &device)),
            Err(e) => {
                log::debug!("fxpakpro: detect: {}: {}", path, e);
                None
            }
        }
    }
}

impl Driver for FxPakProDriver {
    fn name(&self) -> &'static str {
        DRIVER_NAME
    }

    fn kind(&self) -> &'static str {
        "fxpakpro"
    }

    fn display_name(&self) -> &'static str {
        "FX Pak Pro"
    }

    fn display_description(&self) -> &'static str {
        "Connect to an FX Pak Pro or SD2SNES via USB"
    }

    fn display_order(&self) -> i32 {
        0
    }

    fn capabilities(&self) -> &'static [Capability] {
        CAPABILITIES
    }

    /// Asks every candidate port at once; each has `DETECT_TIMEOUT` to answer.
    fn detect(&self) -> SniResult<Vec<DeviceDescriptor>> {
        let candidates = self.candidates();
        let found: Vec<DeviceDescriptor> = thread::scope(|scope| {
            let asks: Vec<_> = candidates
                .iter()
                .map(|path| scope.spawn(move || self.identify(path)))
                .collect();
            asks.into_iter()
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
            self.policy,
        )
    }

    fn disconnect_all(&self) {
        self.container.disconnect_all(DRIVER_NAME);
    }
}

#[cfg(test)]
mod tests {
    use std::time::Instant;

    use super::fake::{FakeCart, VERSION_STRING};
    use super::protocol::Opcode;
    use super::*;
    use crate::device::DirEntryKind;
    use crate::drivers::mock::MemoryFilesystem;
    use crate::mapping::AddressTuple;
    use crate::memory::{MemoryReadRequest, MemoryWriteRequest};

    const PORT: &str = "/dev/ttyACM9";
    const OTHER_PORT: &str = "/dev/ttyACM8";

    /// Driver whose ports are served by in-process carts.
    fn driver_with(carts: Vec<(&'static str, FakeCart)>, release_port: bool) -> FxPakProDriver {
        let config = FxPakProConfig {
            ports: carts.iter().map(|(path, _)| path.to_string()).collect(),
            release_port,
            ..Default::default()
        };
        FxPakProDriver::with_connect(
            &config,
            Arc::new(move |path: &str, deadline: Deadline| {
                let (_, cart) = carts
                    .iter()
                    .find(|(p, _)| *p == path)
                    .ok_or_else(|| SniError::NoDevice(path.to_string()))?;
                FxPakProDevice::with_port(path, Box::new(cart.clone()), deadline)
            }),
        )
    }

    fn driver_for(cart: &FakeCart, release_port: bool) -> FxPakProDriver {
        driver_with(vec![(PORT, cart.clone())], release_port)
    }

    fn files() -> MemoryFilesystem {
        MemoryFilesystem::with_files([("/roms/alttp.sfc", vec![1u8, 2, 3])])
    }

    fn deadline() -> Deadline {
        Deadline::after(Duration::from_secs(5))
    }

    #[test]
    fn test_detect_identifies_cart() {
        let cart = FakeCart::new(files());
        let driver = driver_for(&cart, false);
        let found = driver.detect().unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].locator.to_string(), "fxpakpro:/dev/ttyACM9");
        assert_eq!(
            found[0].display_name,
            format!("FX Pak Pro {} at {}", VERSION_STRING, PORT)
        );
        assert_eq!(found[0].default_address_space, AddressSpace::FxPakPro);
    }

    #[test]
    fn test_vector_reads_and_writes() {
        let cart = FakeCart::new(files());
        let driver = driver_for(&cart, false);
        let handle = driver.device(&FxPakProDriver::locator(PORT));

        let big: Vec<u8> = (0..600).map(|i| i as u8).collect();
        handle
            .multi_write(
                deadline(),
                &[
                    MemoryWriteRequest::new(AddressTuple::pak(0xF50000), big.clone()),
                    MemoryWriteRequest::new(AddressTuple::bus(0x7E1000), vec![0xAA]),
                ],
            )
            .unwrap();
        assert_eq!(cart.state.lock().unwrap().memory[0xF51000], 0xAA);

        let rsp = handle
            .multi_read(
                deadline(),
                &[
                    MemoryReadRequest::new(AddressTuple::bus(0x7E1000), 1),
                    MemoryReadRequest::new(AddressTuple::pak(0xF50000), 600),
                ],
            )
            .unwrap();
        assert_eq!(rsp[0].data, vec![0xAA]);
        assert_eq!(rsp[0].request_address, AddressTuple::bus(0x7E1000));
        assert_eq!(rsp[1].data, big);
    }

    #[test]
    fn test_many_ranges_split_commands() {
        let cart = FakeCart::new(files());
        let driver = driver_for(&cart, false);
        let handle = driver.device(&FxPakProDriver::locator(PORT));

        let reads: Vec<MemoryReadRequest> = (0..10)
            .map(|i| MemoryReadRequest::new(AddressTuple::pak(0xF50000 + i * 16), 2))
            .collect();
        let rsp = handle.multi_read(deadline(), &reads).unwrap();
        assert_eq!(rsp.len(), 10);
        let vgets = cart.commands().iter().filter(|&&c| c == Opcode::VGet).count();
        assert_eq!(vgets, 2);
    }

    #[test]
    fn test_filesystem_commands() {
        let cart = FakeCart::new(files());
        let driver = driver_for(&cart, false);
        let handle = driver.device(&FxPakProDriver::locator(PORT));

        handle.make_directory(deadline(), "/saves").unwrap();
        let mut listing = handle.read_directory(deadline(), "/").unwrap();
        listing.sort_by(|a, b| a.name.cmp(&b.name));
        let names: Vec<_> = listing.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, vec!["roms", "saves"]);
        assert!(listing.iter().all(|e| e.kind == DirEntryKind::Directory));

        let upload: Vec<u8> = (0..1300).map(|i| (i % 251) as u8).collect();
        let mut reports = vec![];
        let sent = handle
            .put_file(
                deadline(),
                "/saves/game.srm",
                upload.len() as u32,
                &mut upload.as_slice(),
                Some(&mut |done: u32, _total: u32| reports.push(done)),
            )
            .unwrap();
        assert_eq!(sent, 1300);
        assert_eq!(reports, vec![512, 1024, 1300]);

        handle.rename_file(deadline(), "/saves/game.srm", "old.srm").unwrap();
        let mut download = vec![];
        let mut announced = 0;
        handle
            .get_file(
                deadline(),
                "/saves/old.srm",
                &mut download,
                Some(&mut |size: u32| announced = size),
                None,
            )
            .unwrap();
        assert_eq!(announced, 1300);
        assert_eq!(download, upload);

        handle.boot_file(deadline(), "/roms/alttp.sfc").unwrap();
        assert_eq!(cart.state.lock().unwrap().booted.as_deref(), Some("/roms/alttp.sfc"));
        handle.remove_file(deadline(), "/saves/old.srm").unwrap();
        handle.reset_to_menu(deadline()).unwrap();
        assert_eq!(cart.commands().last(), Some(&Opcode::MenuReset));
    }

    #[test]
    fn test_long_listing_spans_blocks() {
        let names: Vec<(String, Vec<u8>)> = (0..30)
            .map(|i| (format!("/roms/{:040}.sfc", i), vec![0u8]))
            .collect();
        let cart = FakeCart::new(MemoryFilesystem::with_files(names));
        let driver = driver_for(&cart, false);
        let handle = driver.device(&FxPakProDriver::locator(PORT));

        let listing = handle.read_directory(deadline(), "/roms").unwrap();
        assert_eq!(listing.len(), 30);
        assert!(listing.iter().all(|e| e.kind == DirEntryKind::File));
    }

    #[test]
    fn test_cart_error_keeps_connection() {
        let cart = FakeCart::new(files());
        let driver = driver_for(&cart, false);
        let handle = driver.device(&FxPakProDriver::locator(PORT));

        let err = handle.remove_file(deadline(), "/missing").unwrap_err();
        assert!(matches!(err, SniError::Protocol(_)), "{err}");
        handle.make_directory(deadline(), "/after").unwrap();
        let infos = cart.commands().iter().filter(|&&c| c == Opcode::Info).count();
        assert_eq!(infos, 1);
    }

    #[test]
    fn test_unplug_closes_device() {
        let cart = FakeCart::new(files());
        let driver = driver_for(&cart, false);
        let handle = driver.device(&FxPakProDriver::locator(PORT));
        handle.make_directory(deadline(), "/a").unwrap();

        cart.state.lock().unwrap().hangup_after = Some(0);
        let err = handle.make_directory(deadline(), "/b").unwrap_err();
        assert!(err.is_transport(), "{err}");

        // plugged back in: the handle reopens and handshakes again
        cart.state.lock().unwrap().hangup_after = None;
        handle.make_directory(deadline(), "/c").unwrap();
        let infos = cart.commands().iter().filter(|&&c| c == Opcode::Info).count();
        assert_eq!(infos, 2);
    }

    #[test]
    fn test_release_port_reopens_each_call() {
        let cart = FakeCart::new(files());
        let driver = driver_for(&cart, true);
        let handle = driver.device(&FxPakProDriver::locator(PORT));

        handle.make_directory(deadline(), "/a").unwrap();
        handle.make_directory(deadline(), "/b").unwrap();
        let infos = cart.commands().iter().filter(|&&c| c == Opcode::Info).count();
        assert_eq!(infos, 2);
        assert!(driver.detect().unwrap().len() == 1);
    }

    #[test]
    fn test_unknown_port_is_no_device() {
        let cart = FakeCart::new(files());
        let driver = driver_for(&cart, false);
        let handle = driver.device(&FxPakProDriver::locator("/dev/ttyACM0"));
        assert!(matches!(
            handle.reset_system(deadline()),
            Err(SniError::NoDevice(_))
        ));
    }

    #[test]
    fn test_silent_port_does_not_stall_detect() {
        let silent = FakeCart::new(files());
        silent.state.lock().unwrap().silent = true;
        let driver = driver_with(
            vec![(OTHER_PORT, silent), (PORT, FakeCart::new(files()))],
            false,
        );

        let started = Instant::now();
        let found = driver.detect().unwrap();
        assert!(started.elapsed() < DETECT_TIMEOUT * 3, "{:?}", started.elapsed());
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].locator.to_string(), "fxpakpro:/dev/ttyACM9");
    }

    #[test]
    fn test_open_of_silent_port_times_out() {
        let cart = FakeCart::new(files());
        cart.state.lock().unwrap().silent = true;
        let driver = driver_for(&cart, false);
        let handle = driver.device(&FxPakProDriver::locator(PORT));

        let started = Instant::now();
        let err = handle
            .make_directory(Deadline::after(Duration::from_millis(100)), "/a")
            .unwrap_err();
        assert!(matches!(err, SniError::Timeout), "{err}");
        assert!(started.elapsed() < Duration::from_millis(600));
    }

    #[test]
    fn test_stalled_cart_times_out_and_reconnects() {
        let cart = FakeCart::new(files());
        let driver = driver_for(&cart, false);
        let handle = driver.device(&FxPakProDriver::locator(PORT));
        handle.make_directory(deadline(), "/a").unwrap();

        cart.state.lock().unwrap().silent = true;
        let started = Instant::now();
        let err = handle
            .read_directory(Deadline::after(Duration::from_millis(100)), "/")
            .unwrap_err();
        assert!(matches!(err, SniError::Timeout), "{err}");
        assert!(started.elapsed() < Duration::from_millis(600));

        cart.state.lock().unwrap().silent = false;
        handle.make_directory(deadline(), "/b").unwrap();
        let infos = cart.commands().iter().filter(|&&c| c == Opcode::Info).count();
        assert_eq!(infos, 2);
    }

    #[test]
    fn test_failed_upload_source_keeps_stream_framed() {
        let cart = FakeCart::new(files());
        let driver = driver_for(&cart, false);
        let handle = driver.device(&FxPakProDriver::locator(PORT));

        let mut short = &[7u8; 600][..];
        let err = handle
            .put_file(deadline(), "/short.bin", 1300, &mut short, None)
            .unwrap_err();
        assert!(matches!(err, SniError::Stream(_)), "{err}");

        // same connection, still in step with the cart
        handle.make_directory(deadline(), "/after").unwrap();
        let infos = cart.commands().iter().filter(|&&c| c == Opcode::Info).count();
        assert_eq!(infos, 1);
    }

    #[test]
    fn test_wide_pak_address_is_rejected() {
        let cart = FakeCart::new(files());
        let driver = driver_for(&cart, false);
        let handle = driver.device(&FxPakProDriver::locator(PORT));

        let err = handle
            .multi_write(
                deadline(),
                &[MemoryWriteRequest::new(
                    AddressTuple::new(0x100_0000, AddressSpace::Raw),
                    vec![0xEE],
                )],
            )
            .unwrap_err();
        assert!(matches!(err, SniError::UnmappedAddress(0x100_0000)), "{err}");
        assert_eq!(cart.state.lock().unwrap().memory[0], 0);
        assert!(!cart.commands().contains(&Opcode::VPut));
    }
}
