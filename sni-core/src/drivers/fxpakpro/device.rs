//! FX Pak Pro reached through its USB CDC serial port.

use std::io::{self, Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use serialport::SerialPort;

use super::protocol::{CartInfo, Transport, Usb2Snes, IO_TIMEOUT};
use crate::device::{Deadline, DirEntry, Device, ProgressReport, SizeReceived};
use crate::error::{SniError, SniResult};
use crate::mapping::AddressSpace;
use crate::memory::{MemoryReadRequest, MemoryReadResponse, MemoryWriteRequest, MemoryWriteResponse};

/// The cart ignores the line rate; any value opens the port.
const BAUD_RATE: u32 = 115_200;

/// Byte stream to the cart.
pub trait Port: Transport + Send {}

impl<T: Transport + Send> Port for T {}

impl Transport for dyn SerialPort {
    fn set_timeout(&mut self, timeout: Duration) -> io::Result<()> {
        SerialPort::set_timeout(self, timeout).map_err(io::Error::from)
    }
}

pub struct FxPakProDevice {
    path: String,
    info: CartInfo,
    usb: Mutex<Usb2Snes<Box<dyn Port>>>,
    closed: AtomicBool,
}

impl FxPakProDevice {
    /// Open the serial port at `path` and identify the cart within `deadline`.
    pub fn open(path: &str, deadline: Deadline) -> SniResult<Self> {
        let port = serialport::new(path, BAUD_RATE)
            .timeout(deadline.remaining_or(IO_TIMEOUT)?)
            .open()
            .map_err(io::Error::from)?;
        Self::with_port(path, Box::new(port), deadline)
    }

    /// Identify the cart behind an already open port.
    pub fn with_port(path: &str, port: Box<dyn Port>, deadline: Deadline) -> SniResult<Self> {
        let mut usb = Usb2Snes::new(port);
        let info = usb.info(deadline)?;
        log::info!(
            "fxpakpro: {} is firmware {} ({:#x})",
            path,
            info.version_string,
            info.firmware_version
        );
        Ok(Self {
            path: path.to_string(),
            info,
            usb: Mutex::new(usb),
            closed: AtomicBool::new(false),
        })
    }

    pub fn info(&self) -> &CartInfo {
        &self.info
    }

    /// Run one conversation; a broken one leaves the stream unframed, so
    /// the device closes itself.
    fn with_usb<T>(&self, f: impl FnOnce(&mut Usb2Snes<Box<dyn Port>>) -> SniResult<T>) -> SniResult<T> {
        if self.is_closed() {
            return Err(SniError::Closed);
        }
        let mut usb = self.usb.lock().map_err(|_| SniError::LockPoisoned)?;
        let result = f(&mut usb);
        if let Err(e) = &result {
            if e.is_transport() || matches!(e, SniError::Timeout) {
                log::info!("fxpakpro: {}: {}", self.path, e);
                self.closed.store(true, Ordering::SeqCst);
            }
        }
        result
    }
}

impl Device for FxPakProDevice {
    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn close(&self) -> SniResult<()> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn native_address_space(&self) -> AddressSpace {
        AddressSpace::FxPakPro
    }

    fn client_name(&self) -> Option<String> {
        Some(format!("FX Pak Pro {}", self.info.version_string))
    }

    fn multi_read(
        &self,
        deadline: Deadline,
        reads: &[MemoryReadRequest],
    ) -> SniResult<Vec<MemoryReadResponse>> {
        let ranges: Vec<(u32, usize)> = reads.iter().map(|r| (r.address.address, r.size)).collect();
        let data = self.with_usb(|usb| usb.vget(deadline, &ranges))?;
        Ok(reads
            .iter()
            .zip(data)
            .map(|(read, data)| MemoryReadResponse {
                request_address: read.address,
                device_address: read.address,
                data,
            })
            .collect())
    }

    fn multi_write(
        &self,
        deadline: Deadline,
        writes: &[MemoryWriteRequest],
    ) -> SniResult<Vec<MemoryWriteResponse>> {
        let ranges: Vec<(u32, &[u8])> = writes
            .iter()
            .map(|w| (w.address.address, w.data.as_slice()))
            .collect();
        self.with_usb(|usb| usb.vput(deadline, &ranges))?;
        Ok(writes
            .iter()
            .map(|w| MemoryWriteResponse {
                request_address: w.address,
                device_address: w.address,
                size: w.data.len(),
            })
            .collect())
    }

    fn reset_system(&self, deadline: Deadline) -> SniResult<()> {
        self.with_usb(|usb| usb.reset(deadline))
    }

    fn reset_to_menu(&self, deadline: Deadline) -> SniResult<()> {
        self.with_usb(|usb| usb.menu_reset(deadline))
    }

    fn read_directory(&self, deadline: Deadline, path: &str) -> SniResult<Vec<DirEntry>> {
        self.with_usb(|usb| usb.list(deadline, path))
    }

    fn make_directory(&self, deadline: Deadline, path: &str) -> SniResult<()> {
        self.with_usb(|usb| usb.mkdir(deadline, path))
    }

    fn remove_file(&self, deadline: Deadline, path: &str) -> SniResult<()> {
        self.with_usb(|usb| usb.rm(deadline, path))
    }

    fn rename_file(&self, deadline: Deadline, path: &str, new_name: &str) -> SniResult<()> {
        self.with_usb(|usb| usb.mv(deadline, path, new_name))
    }

    fn put_file(
        &self,
        deadline: Deadline,
        path: &str,
        size: u32,
        reader: &mut dyn Read,
        progress: Option<ProgressReport<'_>>,
    ) -> SniResult<u32> {
        self.with_usb(|usb| usb.put_file(deadline, path, size, reader, progress))
    }

    fn get_file(
        &self,
        deadline: Deadline,
        path: &str,
        writer: &mut dyn Write,
        size_received: Option<SizeReceived<'_>>,
        progress: Option<ProgressReport<'_>>,
    ) -> SniResult<u32> {
        self.with_usb(|usb| usb.get_file(deadline, path, writer, size_received, progress))
    }

    fn boot_file(&self, deadline: Deadline, path: &str) -> SniResult<()> {
        self.with_usb(|usb| usb.boot(deadline, path))
    }
}
