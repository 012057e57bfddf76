//! Typed protocol payloads.
//!
//! Every plaintext the client sends starts with a [`MsgType`] uvarint in a
//! fixed 3-byte frame, followed by the MessagePack encoding of the inner
//! value: a [`Request`] for `Req`, the session id string for `Confirm` and
//! `KeepAlive`. Server responses are a bare MessagePack [`Response`] with no
//! type prefix.

pub mod varint;

use crate::error::{LanscoutError, Result};
use serde::{Deserialize, Serialize};
use serde::de::DeserializeOwned;

pub use varint::MAX_VARINT_LEN16;

/// Message types of the discovery handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MsgType {
    /// First phase: the client asks for a session.
    Req = 0,
    /// Second phase: the client confirms the session id it was handed.
    Confirm = 1,
    /// Steady state: the client refreshes its session TTL.
    KeepAlive = 2,
}

impl TryFrom<u64> for MsgType {
    type Error = LanscoutError;

    /// Maps a decoded uvarint back to a message type.
    fn try_from(v: u64) -> Result<Self> {
        match v {
            0 => Ok(MsgType::Req),
            1 => Ok(MsgType::Confirm),
            2 => Ok(MsgType::KeepAlive),
            other => Err(LanscoutError::Protocol(format!("protocol error ({})", other))),
        }
    }
}

/// Request is sent by the client and carries the client address, its session
/// id (empty on the very first attempt) and an application payload.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Request {
    pub ip: String,
    pub id: String,
    #[serde(with = "serde_bytes")]
    pub data: Vec<u8>,
}

/// Response is sent by the server: the session id, the arrival sequence
/// number, the peer address the server observed, and an application payload.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Response {
    pub id: String,
    pub seq: u16,
    pub ip: String,
    #[serde(with = "serde_bytes")]
    pub data: Vec<u8>,
}

/// Encodes a typed payload: a 3-byte uvarint frame with the message type,
/// then the MessagePack body.
pub fn encode_typed<T: Serialize>(typ: MsgType, val: &T) -> Result<Vec<u8>> {
    let mut buf = vec![0u8; MAX_VARINT_LEN16];
    varint::put_uvarint(&mut buf, typ as u64);
    let body = rmp_serde::to_vec_named(val)?;
    buf.extend_from_slice(&body);
    Ok(buf)
}

/// Splits a typed payload into its message type and body.
pub fn decode_typed(buf: &[u8]) -> Result<(MsgType, &[u8])> {
    if buf.len() < MAX_VARINT_LEN16 {
        return Err(LanscoutError::Protocol("insufficient data".to_string()));
    }
    let (typ, _) = varint::uvarint(&buf[..MAX_VARINT_LEN16])
        .ok_or_else(|| LanscoutError::Protocol("invalid package type".to_string()))?;
    Ok((MsgType::try_from(typ)?, &buf[MAX_VARINT_LEN16..]))
}

/// Decodes a MessagePack body into the expected inner value.
pub fn decode_body<T: DeserializeOwned>(buf: &[u8]) -> Result<T> {
    Ok(rmp_serde::from_slice(buf)?)
}
