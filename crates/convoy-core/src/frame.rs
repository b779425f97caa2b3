//! Typed length-prefixed frames exchanged on the ship↔offshore link.
//!
//! Wire layout of one frame:
//!
//! ```text
//! | type (1 byte) | payload length (4 bytes, big-endian) | payload |
//! ```
//!
//! A zero-length payload is valid. JSON-bearing frame types carry a compact
//! UTF-8 JSON document with no whitespace between tokens. Frames are strictly
//! ordered on the link; every write is flushed so the peer never stalls on
//! buffered data.

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::FrameError;
use crate::headers::HeaderTable;

/// Hard cap on a single frame payload. A peer announcing more is treated as
/// corrupt and the link is dropped.
pub const MAX_PAYLOAD: usize = 64 * 1024 * 1024;

/// Chunk size used when slicing bodies and tunnel reads into frames.
pub const CHUNK_SIZE: usize = 32 * 1024;

/// The fourteen frame types of the link protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameType {
    RequestStart = 1,
    RequestBodyChunk = 2,
    RequestEnd = 3,
    ResponseStart = 4,
    ResponseBodyChunk = 5,
    ResponseEnd = 6,
    ConnectOpen = 10,
    ConnectOpenResult = 11,
    ConnectDataC2S = 12,
    ConnectDataS2C = 13,
    ConnectClose = 14,
}

impl FrameType {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(Self::RequestStart),
            2 => Some(Self::RequestBodyChunk),
            3 => Some(Self::RequestEnd),
            4 => Some(Self::ResponseStart),
            5 => Some(Self::ResponseBodyChunk),
            6 => Some(Self::ResponseEnd),
            10 => Some(Self::ConnectOpen),
            11 => Some(Self::ConnectOpenResult),
            12 => Some(Self::ConnectDataC2S),
            13 => Some(Self::ConnectDataS2C),
            14 => Some(Self::ConnectClose),
            _ => None,
        }
    }
}

/// Write one frame and flush it.
pub async fn write_frame<W>(w: &mut W, ty: FrameType, payload: &[u8]) -> Result<(), FrameError>
where
    W: AsyncWrite + Unpin,
{
    let mut header = [0u8; 5];
    header[0] = ty as u8;
    header[1..].copy_from_slice(&(payload.len() as u32).to_be_bytes());
    w.write_all(&header).await?;
    if !payload.is_empty() {
        w.write_all(payload).await?;
    }
    w.flush().await?;
    Ok(())
}

/// Read exactly one frame. The stream closing mid-frame (or before the
/// header) is reported as [`FrameError::UnexpectedEof`].
pub async fn read_frame<R>(r: &mut R) -> Result<(FrameType, Bytes), FrameError>
where
    R: AsyncRead + Unpin,
{
    let mut header = [0u8; 5];
    r.read_exact(&mut header).await.map_err(eof_as_frame_error)?;
    let ty = FrameType::from_u8(header[0]).ok_or(FrameError::UnknownType(header[0]))?;
    let len = u32::from_be_bytes([header[1], header[2], header[3], header[4]]) as usize;
    if len > MAX_PAYLOAD {
        return Err(FrameError::PayloadTooLarge {
            len,
            max: MAX_PAYLOAD,
        });
    }
    let mut payload = vec![0u8; len];
    if len > 0 {
        r.read_exact(&mut payload).await.map_err(eof_as_frame_error)?;
    }
    Ok((ty, payload.into()))
}

/// Serialize `value` as compact JSON and write it as one frame.
pub async fn write_json_frame<W, T>(w: &mut W, ty: FrameType, value: &T) -> Result<(), FrameError>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let payload = serde_json::to_vec(value)?;
    write_frame(w, ty, &payload).await
}

/// Decode the JSON payload of a frame.
pub fn decode_json<T: DeserializeOwned>(payload: &[u8]) -> Result<T, FrameError> {
    Ok(serde_json::from_slice(payload)?)
}

fn eof_as_frame_error(err: std::io::Error) -> FrameError {
    if err.kind() == std::io::ErrorKind::UnexpectedEof {
        FrameError::UnexpectedEof
    } else {
        FrameError::Io(err)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// JSON payloads
// ─────────────────────────────────────────────────────────────────────────────

/// Payload of `RequestStart`: one browser request, headers already stripped
/// of hop-by-hop entries and the target rewritten to an absolute URL.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestHead {
    pub method: String,
    pub absolute_url: String,
    pub header: HeaderTable,
}

/// Payload of `ResponseStart`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponseHead {
    /// Tolerates both a JSON number and a stringified number on the wire.
    #[serde(deserialize_with = "status_code_from_any")]
    pub status_code: u16,
    pub status: String,
    pub header: HeaderTable,
}

/// Payload of `ConnectOpen`: the `host:port` the offshore peer should reach.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectRequest {
    pub host: String,
}

/// Payload of `ConnectOpenResult`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectReply {
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

fn status_code_from_any<'de, D>(deserializer: D) -> Result<u16, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Number(u16),
        Text(String),
    }
    match Raw::deserialize(deserializer)? {
        Raw::Number(code) => Ok(code),
        Raw::Text(text) => text.trim().parse().map_err(serde::de::Error::custom),
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
