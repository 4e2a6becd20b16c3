//! Address spaces and translation between them.
//!
//! - `FxPakPro`: flat space a flash cart exposes over USB
//! - `SnesABus`: canonical address as seen by the SNES CPU
//! - `Raw`: backend-native, passed through untouched

pub mod lorom;

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{SniError, SniResult};

/// Every SNES space is 24 bits wide; nothing maps at or above this.
pub const ADDRESS_LIMIT: u32 = 0x100_0000;

/// Address space an address is expressed in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AddressSpace {
    FxPakPro,
    SnesABus,
    Raw,
}

impl fmt::Display for AddressSpace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            AddressSpace::FxPakPro => "pak",
            AddressSpace::SnesABus => "bus",
            AddressSpace::Raw => "raw",
        };
        f.write_str(name)
    }
}

/// An address tagged with its space.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AddressTuple {
    pub address: u32,
    pub space: AddressSpace,
}

impl AddressTuple {
    pub fn new(address: u32, space: AddressSpace) -> Self {
        Self { address, space }
    }

    pub fn bus(address: u32) -> Self {
        Self::new(address, AddressSpace::SnesABus)
    }

    pub fn pak(address: u32) -> Self {
        Self::new(address, AddressSpace::FxPakPro)
    }

    /// Re-express this address in `space`.
    pub fn to_space(self, space: AddressSpace) -> SniResult<AddressTuple> {
        Ok(AddressTuple::new(translate(self.address, self.space, space)?, space))
    }
}

impl fmt::Display for AddressTuple {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:${:06X}", self.space, self.address)
    }
}

/// Fail unless `size` bytes starting at `address` fit in 24 bits.
pub fn check_span(address: u32, size: usize) -> SniResult<()> {
    let end = u64::from(address) + size as u64;
    if address >= ADDRESS_LIMIT || end > u64::from(ADDRESS_LIMIT) {
        return Err(SniError::UnmappedAddress(address));
    }
    Ok(())
}

/// Translate `address` from one space to another.
///
/// Only raw addresses may exceed 24 bits on the way in; they are the
/// backend's business.
pub fn translate(address: u32, from: AddressSpace, to: AddressSpace) -> SniResult<u32> {
    if from != AddressSpace::Raw && address >= ADDRESS_LIMIT {
        return Err(SniError::UnmappedAddress(address));
    }
    match (from, to) {
        (AddressSpace::FxPakPro, AddressSpace::SnesABus) => Ok(lorom::pak_to_bus(address)),
        (AddressSpace::SnesABus, AddressSpace::FxPakPro) => lorom::bus_to_pak(address),
        _ => Ok(address),
    }
}
