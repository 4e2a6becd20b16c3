//! Newline-delimited JSON spoken by connectorlib clients.
//!
//! ```text
//! -> {"id":1,"type":"hello","name":"EmoTracker"}
//! <- {"id":1,"ok":true,"name":"sni"}
//! -> {"id":2,"type":"read","address":8257552,"size":2}
//! <- {"id":2,"ok":true,"data":[0,7]}
//! -> {"id":3,"type":"write","address":8257552,"data":[1]}
//! <- {"id":3,"ok":true,"size":1}
//! ```
//!
//! Addresses are SNES bus addresses.

use serde::{Deserialize, Serialize};

use crate::device::Deadline;
use crate::error::{SniError, SniResult};
use crate::handle::DeviceHandle;
use crate::mapping::AddressTuple;
use crate::memory::{MemoryReadRequest, MemoryWriteRequest};

/// Name sent back in `hello` replies.
pub const SERVER_NAME: &str = "sni";

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Request {
    Hello { name: String },
    Read { address: u32, size: usize },
    Write { address: u32, data: Vec<u8> },
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct Envelope {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<u64>,
    #[serde(flatten)]
    pub request: Request,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct Reply {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<u64>,
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Vec<u8>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Reply {
    pub fn error(id: Option<u64>, error: &SniError) -> Self {
        Self {
            id,
            ok: false,
            error: Some(error.to_string()),
            ..Default::default()
        }
    }
}

/// Execute one memory request against `downstream`.
pub fn forward(
    downstream: Option<&DeviceHandle>,
    request: &Request,
    deadline: Deadline,
) -> SniResult<Reply> {
    match request {
        Request::Hello { .. } => Ok(Reply {
            ok: true,
            name: Some(SERVER_NAME.to_string()),
            ..Default::default()
        }),
        Request::Read { address, size } => {
            let handle = downstream.ok_or(SniError::NoDownstream)?;
            let mut rsps = handle.multi_read(
                deadline,
                &[MemoryReadRequest::new(AddressTuple::bus(*address), *size)],
            )?;
            let rsp = rsps
                .pop()
                .ok_or_else(|| SniError::Protocol("empty read response".to_string()))?;
            Ok(Reply {
                ok: true,
                data: Some(rsp.data),
                ..Default::default()
            })
        }
        Request::Write { address, data } => {
            let handle = downstream.ok_or(SniError::NoDownstream)?;
            let mut rsps = handle.multi_write(
                deadline,
                &[MemoryWriteRequest::new(AddressTuple::bus(*address), data.clone())],
            )?;
            let rsp = rsps
                .pop()
                .ok_or_else(|| SniError::Protocol("empty write response".to_string()))?;
            Ok(Reply {
                ok: true,
                size: Some(rsp.size),
                ..Default::default()
            })
        }
    }
}
