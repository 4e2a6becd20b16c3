//! Memory request and response types.
//!
//! Requests travel in ordered batches. A response batch always has one entry
//! per request, in request order.

use serde::{Deserialize, Serialize};

use crate::error::SniResult;
use crate::mapping::{AddressSpace, AddressTuple};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemoryReadRequest {
    pub address: AddressTuple,
    pub size: usize,
}

impl MemoryReadRequest {
    pub fn new(address: AddressTuple, size: usize) -> Self {
        Self { address, size }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemoryReadResponse {
    /// Address exactly as the caller requested it.
    pub request_address: AddressTuple,
    /// Address the device actually read from.
    pub device_address: AddressTuple,
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemoryWriteRequest {
    pub address: AddressTuple,
    pub data: Vec<u8>,
}

impl MemoryWriteRequest {
    pub fn new(address: AddressTuple, data: impl Into<Vec<u8>>) -> Self {
        Self {
            address,
            data: data.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemoryWriteResponse {
    pub request_address: AddressTuple,
    pub device_address: AddressTuple,
    pub size: usize,
}

/// Re-express every read in the device's native space.
pub(crate) fn reads_to_space(
    reads: &[MemoryReadRequest],
    space: AddressSpace,
) -> SniResult<Vec<MemoryReadRequest>> {
    reads
        .iter()
        .map(|r| Ok(MemoryReadRequest::new(r.address.to_space(space)?, r.size)))
        .collect()
}

/// Re-express every write in the device's native space.
pub(crate) fn writes_to_space(
    writes: &[MemoryWriteRequest],
    space: AddressSpace,
) -> SniResult<Vec<MemoryWriteRequest>> {
    writes
        .iter()
        .map(|w| Ok(MemoryWriteRequest::new(w.address.to_space(space)?, w.data.clone())))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reads_to_space_preserves_order() {
        let reads = vec![
            MemoryReadRequest::new(AddressTuple::bus(0x7E0010), 2),
            MemoryReadRequest::new(AddressTuple::pak(0x000000), 4),
            MemoryReadRequest::new(AddressTuple::bus(0x80FFC0), 0x20),
        ];
        let native = reads_to_space(&reads, AddressSpace::FxPakPro).unwrap();
        assert_eq!(native.len(), 3);
        assert_eq!(native[0].address, AddressTuple::pak(0xF50010));
        assert_eq!(native[1].address, AddressTuple::pak(0x000000));
        assert_eq!(native[2].address, AddressTuple::pak(0x007FC0));
        assert_eq!(native[2].size, 0x20);
    }

    #[test]
    fn test_unmapped_write_fails_whole_batch() {
        let writes = vec![
            MemoryWriteRequest::new(AddressTuple::bus(0x7E0000), vec![1]),
            MemoryWriteRequest::new(AddressTuple::bus(0x002100), vec![2]),
        ];
        assert!(writes_to_space(&writes, AddressSpace::FxPakPro).is_err());
    }
}
