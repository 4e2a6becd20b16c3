//! ConnectorLib driver: trackers and broadcast tools (EmoTracker, Crowd
//! Control) connect to us over TCP.
//!
//! The protocol gives a client no way to choose a console, so every memory
//! request is forwarded to the one downstream device the operator assigns
//! with `set_downstream_device`. Without one, memory requests fail with
//! `NoDownstream`.

pub mod protocol;

use std::io::{BufRead, BufReader, Write};
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::thread;
use std::time::Duration;

use crate::capability::{Capability, MEMORY};
use crate::container::{DeviceContainer, WeakDeviceContainer};
use crate::device::{Deadline, Device};
use crate::driver::Driver;
use crate::error::{SniError, SniResult};
use crate::handle::{DeviceHandle, OpenPolicy};
use crate::locator::{DeviceDescriptor, DeviceLocator};
use crate::mapping::AddressSpace;
use crate::memory::{MemoryReadRequest, MemoryReadResponse, MemoryWriteRequest, MemoryWriteResponse};
use protocol::{Envelope, Reply};

pub const DRIVER_NAME: &str = "connectorlib";

/// Time allowed for each forwarded request.
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

type Downstream = Arc<RwLock<Option<DeviceHandle>>>;

fn downstream_of(downstream: &Downstream) -> SniResult<DeviceHandle> {
    downstream
        .read()
        .map_err(|_| SniError::LockPoisoned)?
        .clone()
        .ok_or(SniError::NoDownstream)
}

/// A connected client. Memory operations on it go to the downstream device.
pub struct ConnectorLibDevice {
    key: String,
    client_name: Mutex<Option<String>>,
    stream: TcpStream,
    downstream: Downstream,
    closed: AtomicBool,
    container: WeakDeviceContainer,
}

impl ConnectorLibDevice {
    fn set_client_name(&self, name: &str) {
        if let Ok(mut n) = self.client_name.lock() {
            *n = Some(name.to_string());
        }
    }

    /// Answer the client's requests until it hangs up.
    fn serve(self: Arc<Self>, stream: TcpStream) {
        let mut writer = match stream.try_clone() {
            Ok(w) => w,
            Err(e) => {
                log::warn!("connectorlib: {}: {}", self.key, e);
                let _ = self.close();
                return;
            }
        };
        let mut reader = BufReader::new(stream);
        let mut line = String::new();

        loop {
            line.clear();
            match reader.read_line(&mut line) {
                Ok(0) => break,
                Ok(_) => {}
                Err(e) => {
                    if !self.is_closed() {
                        log::debug!("connectorlib: {}: {}", self.key, e);
                    }
                    break;
                }
            }
            if line.trim().is_empty() {
                continue;
            }

            let reply = self.answer(line.trim());
            let sent = serde_json::to_string(&reply)
                .map_err(SniError::from)
                .and_then(|json| {
                    writer.write_all(json.as_bytes())?;
                    writer.write_all(b"\n")?;
                    Ok(())
                });
            if let Err(e) = sent {
                log::debug!("connectorlib: {}: {}", self.key, e);
                break;
            }
        }

        let _ = self.close();
    }

    fn answer(&self, line: &str) -> Reply {
        let envelope: Envelope = match serde_json::from_str(line) {
            Ok(env) => env,
            Err(e) => return Reply::error(None, &SniError::from(e)),
        };
        if let protocol::Request::Hello { name } = &envelope.request {
            log::info!("connectorlib: {} says hello as '{}'", self.key, name);
            self.set_client_name(name);
        }

        let downstream = self.downstream.read().ok().and_then(|d| d.clone());
        let deadline = Deadline::after(REQUEST_TIMEOUT);
        match protocol::forward(downstream.as_ref(), &envelope.request, deadline) {
            Ok(reply) => Reply {
                id: envelope.id,
                ..reply
            },
            Err(e) => Reply::error(envelope.id, &e),
        }
    }
}

impl Device for ConnectorLibDevice {
    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn close(&self) -> SniResult<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let _ = self.stream.shutdown(Shutdown::Both);
        self.container.delete_device_if_same(&self.key, self);
        log::info!("connectorlib: {} disconnected", self.key);
        Ok(())
    }

    fn native_address_space(&self) -> AddressSpace {
        AddressSpace::SnesABus
    }

    fn client_name(&self) -> Option<String> {
        self.client_name.lock().ok()?.clone()
    }

    fn multi_read(
        &self,
        deadline: Deadline,
        reads: &[MemoryReadRequest],
    ) -> SniResult<Vec<MemoryReadResponse>> {
        downstream_of(&self.downstream)?.multi_read(deadline, reads)
    }

    fn multi_write(
        &self,
        deadline: Deadline,
        writes: &[MemoryWriteRequest],
    ) -> SniResult<Vec<MemoryWriteResponse>> {
        downstream_of(&self.downstream)?.multi_write(deadline, writes)
    }
}

pub struct ConnectorLibDriver {
    container: DeviceContainer,
    downstream: Downstream,
}

impl Default for ConnectorLibDriver {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectorLibDriver {
    pub fn new() -> Self {
        Self {
            container: DeviceContainer::accept_only(),
            downstream: Arc::new(RwLock::new(None)),
        }
    }

    /// Route every client's memory requests to `device`; `None` unassigns.
    pub fn set_downstream_device(&self, device: Option<DeviceHandle>) -> SniResult<()> {
        if let Some(d) = &device {
            log::info!("connectorlib: downstream device is now {}", d.locator());
        }
        *self.downstream.write().map_err(|_| SniError::LockPoisoned)? = device;
        Ok(())
    }

    pub fn downstream_device(&self) -> Option<DeviceHandle> {
        self.downstream.read().ok()?.clone()
    }

    /// Register an accepted client and serve it on its own thread.
    pub fn accept(&self, stream: TcpStream, peer: SocketAddr) {
        let key = peer.to_string();
        let device = match stream.try_clone() {
            Ok(control) => Arc::new(ConnectorLibDevice {
                key: key.clone(),
                client_name: Mutex::new(None),
                stream: control,
                downstream: Arc::clone(&self.downstream),
                closed: AtomicBool::new(false),
                container: self.container.downgrade(),
            }),
            Err(e) => {
                log::warn!("connectorlib: {}: {}", key, e);
                return;
            }
        };
        if let Err(e) = self.container.put_device(&key, device.clone()) {
            log::warn!("connectorlib: {}: {}", key, e);
            return;
        }
        log::info!("connectorlib: {} connected", key);

        let serving = Arc::clone(&device);
        let spawned = thread::Builder::new()
            .name(format!("connectorlib-{}", key))
            .spawn(move || serving.serve(stream));
        if let Err(e) = spawned {
            log::warn!("connectorlib: {}: {}", key, e);
            let _ = device.close();
        }
    }
}

impl Driver for ConnectorLibDriver {
    fn name(&self) -> &'static str {
        DRIVER_NAME
    }

    fn kind(&self) -> &'static str {
        "connectorlib"
    }

    fn display_name(&self) -> &'static str {
        "ConnectorLib"
    }

    fn display_description(&self) -> &'static str {
        "Crowd Control / EmoTracker"
    }

    fn display_order(&self) -> i32 {
        2
    }

    fn capabilities(&self) -> &'static [Capability] {
        MEMORY
    }

    /// Lists connected clients; performs no I/O.
    fn detect(&self) -> SniResult<Vec<DeviceDescriptor>> {
        let mut keys = self.container.all_device_keys();
        keys.sort();
        Ok(keys
            .iter()
            .filter_map(|key| {
                let device = self.container.get_device(key)?;
                if device.is_closed() {
                    return None;
                }
                Some(DeviceDescriptor {
                    locator: DeviceLocator::with_host(DRIVER_NAME, key.as_str()),
                    display_name: device
                        .client_name()
                        .unwrap_or_else(|| format!("ConnectorLib client at {}", key)),
                    kind: self.kind().to_string(),
                    capabilities: MEMORY.to_vec(),
                    default_address_space: AddressSpace::SnesABus,
                })
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
            MEMORY,
            OpenPolicy::KeepOpen,
        )
    }

    fn disconnect_all(&self) {
        self.container.disconnect_all(DRIVER_NAME);
    }
}
