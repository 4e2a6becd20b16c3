//! Driver registry - process-scoped map of driver name to driver.
//!
//! Constructed once at startup and passed to whatever needs it. Drivers may
//! register late (server-mode drivers register only once their listener is
//! bound) and stay invisible until they do.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use crate::driver::{Driver, DriverInfo};
use crate::error::{SniError, SniResult};
use crate::handle::DeviceHandle;
use crate::locator::DeviceLocator;

/// Clone is cheap (just clones the Arc).
#[derive(Clone, Default)]
pub struct DriverRegistry {
    drivers: Arc<RwLock<HashMap<String, Arc<dyn Driver>>>>,
}

impl DriverRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace the driver registered under its name.
    pub fn register(&self, driver: Arc<dyn Driver>) -> SniResult<()> {
        let name = driver.name();
        let mut drivers = self.drivers.write().map_err(|_| SniError::LockPoisoned)?;
        if drivers.insert(name.to_string(), driver).is_some() {
            log::debug!("driver '{}' replaced", name);
        } else {
            log::info!("registered driver '{}'", name);
        }
        Ok(())
    }

    pub fn unregister(&self, name: &str) -> Option<Arc<dyn Driver>> {
        let mut drivers = self.drivers.write().ok()?;
        drivers.remove(name)
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Driver>> {
        let drivers = self.drivers.read().ok()?;
        drivers.get(name).cloned()
    }

    /// Every driver, sorted by display order then name.
    pub fn all_drivers(&self) -> Vec<Arc<dyn Driver>> {
        let mut all: Vec<_> = match self.drivers.read() {
            Ok(drivers) => drivers.values().cloned().collect(),
            Err(_) => return vec![],
        };
        all.sort_by(|a, b| {
            a.display_order()
                .cmp(&b.display_order())
                .then_with(|| a.name().cmp(b.name()))
        });
        all
    }

    pub fn driver_infos(&self) -> Vec<DriverInfo> {
        self.all_drivers()
            .iter()
            .map(|d| DriverInfo::of(d.as_ref()))
            .collect()
    }

    /// Driver owning `locator`, found by its scheme.
    pub fn driver_for(&self, locator: &DeviceLocator) -> SniResult<Arc<dyn Driver>> {
        self.get(locator.scheme())
            .ok_or_else(|| SniError::DriverNotFound(locator.scheme().to_string()))
    }

    /// Handle for `locator` from whichever driver owns it.
    pub fn device(&self, locator: &DeviceLocator) -> SniResult<DeviceHandle> {
        Ok(self.driver_for(locator)?.device(locator))
    }
}
