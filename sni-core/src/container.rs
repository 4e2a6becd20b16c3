//! Device container - keyed registry of live devices for one driver.
//!
//! The map lock is only ever held to read or mutate the map, never across
//! backend I/O. Opens of the same key are serialized by a per-key gate so two
//! callers racing on one key never both open a connection.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock, TryLockError, Weak};
use std::thread;
use std::time::Duration;

use crate::device::{Deadline, Device};
use crate::error::{SniError, SniResult};
use crate::locator::DeviceLocator;

/// Establishes a new backend connection for a locator within the deadline.
pub type DeviceOpener =
    dyn Fn(&DeviceLocator, Deadline) -> SniResult<Arc<dyn Device>> + Send + Sync;

/// How often a caller blocked behind another open re-checks its deadline.
const GATE_POLL: Duration = Duration::from_millis(2);

struct ContainerInner {
    devices: RwLock<HashMap<String, Arc<dyn Device>>>,
    open_gates: Mutex<HashMap<String, Arc<Mutex<()>>>>,
    opener: Box<DeviceOpener>,
}

/// Concurrency-safe map from device key to live device.
///
/// Clone is cheap (just clones the Arc).
#[derive(Clone)]
pub struct DeviceContainer {
    inner: Arc<ContainerInner>,
}

/// Non-owning reference held by devices that remove themselves on disconnect.
#[derive(Clone)]
pub struct WeakDeviceContainer {
    inner: Weak<ContainerInner>,
}

impl DeviceContainer {
    /// Create a container that opens missing devices with `opener`.
    pub fn new<F>(opener: F) -> Self
    where
        F: Fn(&DeviceLocator, Deadline) -> SniResult<Arc<dyn Device>> + Send + Sync + 'static,
    {
        Self {
            inner: Arc::new(ContainerInner {
                devices: RwLock::new(HashMap::new()),
                open_gates: Mutex::new(HashMap::new()),
                opener: Box::new(opener),
            }),
        }
    }

    /// Create a container for a server-mode driver.
    ///
    /// Such drivers cannot originate connections; devices only appear here
    /// when a peer connects and is inserted with `put_device`.
    pub fn accept_only() -> Self {
        Self::new(|locator, _| Err(SniError::NoDevice(locator.to_string())))
    }

    pub fn downgrade(&self) -> WeakDeviceContainer {
        WeakDeviceContainer {
            inner: Arc::downgrade(&self.inner),
        }
    }

    pub fn get_device(&self, key: &str) -> Option<Arc<dyn Device>> {
        let devices = self.inner.devices.read().ok()?;
        devices.get(key).cloned()
    }

    /// Insert a device, closing any device it replaces.
    pub fn put_device(&self, key: &str, device: Arc<dyn Device>) -> SniResult<()> {
        let replaced = {
            let mut devices = self.inner.devices.write().map_err(|_| SniError::LockPoisoned)?;
            devices.insert(key.to_string(), device)
        };
        if let Some(old) = replaced {
            log::debug!("device '{}' replaced; closing previous connection", key);
            let _ = old.close();
        }
        Ok(())
    }

    /// Remove a device. Removing an absent key is a no-op.
    pub fn delete_device(&self, key: &str) -> Option<Arc<dyn Device>> {
        let mut devices = self.inner.devices.write().ok()?;
        devices.remove(key)
    }

    /// Remove `key` only if it still maps to `device`.
    ///
    /// Keeps a stale handle from evicting a connection opened after it.
    pub fn delete_device_if_same(&self, key: &str, device: &Arc<dyn Device>) -> bool {
        let Ok(mut devices) = self.inner.devices.write() else {
            return false;
        };
        match devices.get(key) {
            Some(current) if same_device(current, device) => {
                devices.remove(key);
                true
            }
            _ => false,
        }
    }

    pub fn all_device_keys(&self) -> Vec<String> {
        match self.inner.devices.read() {
            Ok(devices) => devices.keys().cloned().collect(),
            Err(_) => vec![],
        }
    }

    pub fn len(&self) -> usize {
        self.inner.devices.read().map(|d| d.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Return the live device for `key`, opening one if none exists.
    ///
    /// A device that reports itself closed is evicted and reopened. If the
    /// opener fails nothing is inserted, so the next call retries from scratch.
    /// Waiting behind another caller's open of the same key counts against
    /// `deadline`, and the opener gets whatever is left of it.
    pub fn get_or_open_device(
        &self,
        key: &str,
        locator: &DeviceLocator,
        deadline: Deadline,
    ) -> SniResult<Arc<dyn Device>> {
        if let Some(device) = self.live_device(key) {
            return Ok(device);
        }

        let gate = self.open_gate(key)?;
        let result = self.open_behind_gate(&gate, key, locator, deadline);
        self.release_gate(key, gate);
        result
    }

    fn open_behind_gate(
        &self,
        gate: &Mutex<()>,
        key: &str,
        locator: &DeviceLocator,
        deadline: Deadline,
    ) -> SniResult<Arc<dyn Device>> {
        let _opening = loop {
            match gate.try_lock() {
                Ok(guard) => break guard,
                Err(TryLockError::WouldBlock) => {
                    deadline.check()?;
                    thread::sleep(GATE_POLL);
                }
                Err(TryLockError::Poisoned(_)) => return Err(SniError::LockPoisoned),
            }
        };

        // another caller may have finished opening while we waited on the gate
        if let Some(device) = self.live_device(key) {
            return Ok(device);
        }

        deadline.check()?;
        let device = (self.inner.opener)(locator, deadline)?;
        log::debug!("opened device '{}' for {}", key, locator);

        let mut devices = self.inner.devices.write().map_err(|_| SniError::LockPoisoned)?;
        devices.insert(key.to_string(), Arc::clone(&device));
        Ok(device)
    }

    /// Evict `device` from `key` (if still current) and close it.
    pub fn close_device(&self, key: &str, device: &Arc<dyn Device>) {
        self.delete_device_if_same(key, device);
        if let Err(e) = device.close() {
            log::debug!("closing device '{}': {}", key, e);
        }
    }

    /// Close and remove every device, tolerating individual close errors.
    pub fn disconnect_all(&self, driver_name: &str) {
        for key in self.all_device_keys() {
            if let Some(device) = self.delete_device(&key) {
                log::info!("{}: disconnecting device '{}'", driver_name, key);
                if let Err(e) = device.close() {
                    log::warn!("{}: closing device '{}': {}", driver_name, key, e);
                }
            }
        }
    }

    fn live_device(&self, key: &str) -> Option<Arc<dyn Device>> {
        let device = self.get_device(key)?;
        if device.is_closed() {
            self.delete_device_if_same(key, &device);
            return None;
        }
        Some(device)
    }

    fn open_gate(&self, key: &str) -> SniResult<Arc<Mutex<()>>> {
        let mut gates = self
            .inner
            .open_gates
            .lock()
            .map_err(|_| SniError::LockPoisoned)?;
        Ok(Arc::clone(gates.entry(key.to_string()).or_default()))
    }

    /// Drop our reference to a gate, removing it once nobody else holds one.
    ///
    /// New waiters can only clone a gate under the map lock, so the count
    /// checked here cannot grow behind our back.
    fn release_gate(&self, key: &str, gate: Arc<Mutex<()>>) {
        let Ok(mut gates) = self.inner.open_gates.lock() else {
            return;
        };
        let unused = gates
            .get(key)
            .is_some_and(|g| Arc::ptr_eq(g, &gate) && Arc::strong_count(g) == 2);
        if unused {
            gates.remove(key);
        }
    }

    #[cfg(test)]
    fn open_gate_count(&self) -> usize {
        self.inner.open_gates.lock().map(|g| g.len()).unwrap_or(0)
    }
}

impl WeakDeviceContainer {
    /// Remove `key` if the container still exists.
    pub fn delete_device(&self, key: &str) {
        if let Some(inner) = self.inner.upgrade() {
            DeviceContainer { inner }.delete_device(key);
        }
    }

    /// Remove `key` only while it still maps to `device`.
    ///
    /// Used by devices deleting themselves, which only have `&self`, so the
    /// comparison is by address.
    pub fn delete_device_if_same(&self, key: &str, device: &dyn Device) -> bool {
        let Some(inner) = self.inner.upgrade() else {
            return false;
        };
        let Ok(mut devices) = inner.devices.write() else {
            return false;
        };
        match devices.get(key) {
            Some(current) if std::ptr::addr_eq(Arc::as_ptr(current), device) => {
                devices.remove(key);
                true
            }
            _ => false,
        }
    }
}

fn same_device(a: &Arc<dyn Device>, b: &Arc<dyn Device>) -> bool {
    std::ptr::addr_eq(Arc::as_ptr(a), Arc::as_ptr(b))
}
