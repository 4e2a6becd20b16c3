//! SNES device abstraction core
//!
//! This crate gives front ends one way to talk to many SNES backends:
//! - Drivers for emulators (RetroArch, Lua bridge scripts), trackers
//!   (connectorlib) and hardware (FX Pak Pro), plus an in-process mock
//! - Address translation between the FX Pak Pro, SNES A-bus and raw spaces
//! - A device container per driver that opens devices lazily and evicts
//!   them when their transport dies
//!
//! # Architecture
//!
//! - `Device` trait: one live connection; every operation takes a `Deadline`
//! - `DeviceContainer`: keyed live devices with a one-open-per-key gate
//! - `DeviceHandle`: capability-checked, address-translating device access
//! - `Driver` trait: detection and handle creation for one backend
//! - `DriverRegistry`: the set of drivers currently available

pub mod capability;
pub mod config;
pub mod container;
pub mod device;
pub mod driver;
pub mod drivers;
pub mod error;
pub mod handle;
pub mod locator;
pub mod mapping;
pub mod memory;
pub mod registry;
pub mod task;

pub use capability::Capability;
pub use config::Config;
pub use container::DeviceContainer;
pub use device::{Deadline, DirEntry, DirEntryKind, Device};
pub use driver::{Driver, DriverInfo};
pub use drivers::{init, Drivers};
pub use error::{SniError, SniResult};
pub use handle::{DeviceHandle, OpenPolicy};
pub use locator::{DeviceDescriptor, DeviceLocator};
pub use mapping::{AddressSpace, AddressTuple};
pub use memory::{MemoryReadRequest, MemoryReadResponse, MemoryWriteRequest, MemoryWriteResponse};
pub use registry::DriverRegistry;
