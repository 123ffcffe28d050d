//! Observe sub-protocol codec.
//!
//! Request body, repeated per key:
//!
//! ```text
//! ┌──────────┬───────────┬─────────────┐
//! │ vb (u16) │ klen (u16)│ key (klen)  │
//! └──────────┴───────────┴─────────────┘
//! ```
//!
//! Response body, repeated per key:
//!
//! ```text
//! ┌──────────┬───────────┬─────────────┬─────────────┬───────────┐
//! │ vb (u16) │ klen (u16)│ key (klen)  │ status (u8) │ cas (u64) │
//! └──────────┴───────────┴─────────────┴─────────────┴───────────┘
//! ```
//!
//! All integers are big-endian.

use super::SetId;
use crate::error::{ProtocolError, Result};
use crate::types::{Cas, ServerIndex, VbucketId};
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Per-key state reported by one server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ObserveStatus {
    /// In memory, not yet on disk.
    Found,
    /// In memory and on disk.
    Persisted,
    /// Unknown to the server.
    NotFound,
    /// Deleted in memory, deletion not yet on disk.
    LogicallyDeleted,
}

impl ObserveStatus {
    /// Wire value.
    pub fn as_u8(self) -> u8 {
        match self {
            ObserveStatus::Found => 0x00,
            ObserveStatus::Persisted => 0x01,
            ObserveStatus::NotFound => 0x80,
            ObserveStatus::LogicallyDeleted => 0x81,
        }
    }

    /// Parse a wire value.
    pub fn from_u8(value: u8) -> Result<Self> {
        match value {
            0x00 => Ok(ObserveStatus::Found),
            0x01 => Ok(ObserveStatus::Persisted),
            0x80 => Ok(ObserveStatus::NotFound),
            0x81 => Ok(ObserveStatus::LogicallyDeleted),
            other => Err(ProtocolError::MalformedResponse(format!(
                "unknown observe status 0x{:02x}",
                other
            ))
            .into()),
        }
    }
}

/// One key's entry in an observe response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObserveResult {
    pub vbucket: VbucketId,
    pub key: Bytes,
    pub status: ObserveStatus,
    pub cas: Cas,
}

/// One observe packet bound for one server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObserveRequest {
    /// Durability set the packet belongs to.
    pub set: SetId,
    pub server: ServerIndex,
    /// Encoded request body.
    pub body: Bytes,
}

impl ObserveRequest {
    /// Decode the keys carried by this request.
    pub fn keys(&self) -> Result<Vec<(VbucketId, Bytes)>> {
        decode_request(&self.body)
    }
}

fn truncated(what: &str) -> crate::error::Error {
    ProtocolError::MalformedResponse(format!("truncated observe {}", what)).into()
}

/// Encode a request body.
pub fn encode_request<'a>(keys: impl IntoIterator<Item = (VbucketId, &'a [u8])>) -> Bytes {
    let mut buf = BytesMut::new();
    for (vbucket, key) in keys {
        buf.put_u16(vbucket);
        buf.put_u16(key.len() as u16);
        buf.put_slice(key);
    }
    buf.freeze()
}

/// Decode a request body.
pub fn decode_request(body: &[u8]) -> Result<Vec<(VbucketId, Bytes)>> {
    let mut buf = body;
    let mut keys = Vec::new();
    while buf.has_remaining() {
        if buf.remaining() < 4 {
            return Err(truncated("request header"));
        }
        let vbucket = buf.get_u16();
        let len = buf.get_u16() as usize;
        if buf.remaining() < len {
            return Err(truncated("request key"));
        }
        keys.push((vbucket, buf.copy_to_bytes(len)));
    }
    Ok(keys)
}

/// Encode a response body.
pub fn encode_response(results: &[ObserveResult]) -> Bytes {
    let mut buf = BytesMut::new();
    for result in results {
        buf.put_u16(result.vbucket);
        buf.put_u16(result.key.len() as u16);
        buf.put_slice(&result.key);
        buf.put_u8(result.status.as_u8());
        buf.put_u64(result.cas);
    }
    buf.freeze()
}

/// Decode a response body.
pub fn decode_response(body: &[u8]) -> Result<Vec<ObserveResult>> {
    let mut buf = body;
    let mut results = Vec::new();
    while buf.has_remaining() {
        if buf.remaining() < 4 {
            return Err(truncated("response header"));
        }
        let vbucket = buf.get_u16();
        let len = buf.get_u16() as usize;
        if buf.remaining() < len + 9 {
            return Err(truncated("response entry"));
        }
        let key = buf.copy_to_bytes(len);
        let status = ObserveStatus::from_u8(buf.get_u8())?;
        let cas = buf.get_u64();
        results.push(ObserveResult {
            vbucket,
            key,
            status,
            cas,
        });
    }
    Ok(results)
}
