//! Tunnel framing.
//!
//! Each WebSocket message is one frame: `[1-byte type][payload]`.
//!
//! Frame types:
//! - `0x01`: control message (CBOR-encoded [`ControlMessage`])
//! - `0x02`: data (opaque tunnel bytes)

use std::io::Cursor;

use crate::error::{TunnelError, TunnelResult};
use crate::messages::ControlMessage;

pub const FRAME_CONTROL: u8 = 0x01;
pub const FRAME_DATA: u8 = 0x02;

/// Largest frame accepted from the gateway (1 MiB).
pub const MAX_FRAME_SIZE: usize = 1_048_576;

/// A decoded frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Control(ControlMessage),
    Data(Vec<u8>),
}

/// Encode a serializable value as CBOR.
pub fn cbor_encode<T: serde::Serialize>(value: &T) -> TunnelResult<Vec<u8>> {
    let mut out = Vec::new();
    ciborium::into_writer(value, &mut out)?;
    Ok(out)
}

/// Decode a CBOR payload into a typed value.
pub fn cbor_decode<T: serde::de::DeserializeOwned>(data: &[u8]) -> TunnelResult<T> {
    let value: T = ciborium::from_reader(Cursor::new(data))?;
    Ok(value)
}

/// Build a control frame.
pub fn control_frame(msg: &ControlMessage) -> TunnelResult<Vec<u8>> {
    let payload = cbor_encode(msg)?;
    let mut frame = Vec::with_capacity(1 + payload.len());
    frame.push(FRAME_CONTROL);
    frame.extend(payload);
    Ok(frame)
}

/// Build a data frame around opaque tunnel bytes.
pub fn data_frame(data: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(1 + data.len());
    frame.push(FRAME_DATA);
    frame.extend_from_slice(data);
    frame
}

/// Decode a frame received from the wire.
pub fn decode_frame(frame: &[u8]) -> TunnelResult<Frame> {
    if frame.len() > MAX_FRAME_SIZE {
        return Err(TunnelError::Codec(format!(
            "frame too large: {} bytes (max {MAX_FRAME_SIZE})",
            frame.len()
        )));
    }
    let (&kind, payload) = frame
        .split_first()
        .ok_or_else(|| TunnelError::Codec("empty frame".into()))?;

    match kind {
        FRAME_CONTROL => Ok(Frame::Control(cbor_decode(payload)?)),
        FRAME_DATA => Ok(Frame::Data(payload.to_vec())),
        other => Err(TunnelError::Codec(format!("unknown frame type: 0x{other:02x}"))),
    }
}
