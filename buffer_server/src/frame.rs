//! Frames exchanged with the buffer server.
//!
//! On the wire every frame is `[len:u32 BE][body]`. A payload body is
//! `[message_type:u8 = 1][partition:i32 BE][payload]`; the payload is opaque
//! and handed to the stream codec untouched.

use bytes::{BufMut, Bytes, BytesMut};

/// Smallest valid payload body: the type byte plus the partition.
pub const PAYLOAD_HEADER_LEN: usize = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageType {
    Payload = 1,
}

impl MessageType {
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            1 => Some(MessageType::Payload),
            _ => None,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("empty frame")]
    Empty,

    #[error("unknown message type {0}")]
    UnknownMessageType(u8),

    #[error("payload frame of {0} bytes is shorter than its header")]
    TooShort(usize),

    #[error("codec rejected payload: {0:#}")]
    Codec(anyhow::Error),
}

#[derive(Debug, PartialEq, Eq)]
pub struct PayloadFrame<'a> {
    pub partition: i32,
    pub payload: &'a [u8],
}

pub fn parse_frame(body: &[u8]) -> Result<PayloadFrame<'_>, FrameError> {
    let Some(&type_byte) = body.first() else {
        return Err(FrameError::Empty);
    };
    match MessageType::from_byte(type_byte) {
        Some(MessageType::Payload) => {}
        None => return Err(FrameError::UnknownMessageType(type_byte)),
    }
    if body.len() < PAYLOAD_HEADER_LEN {
        return Err(FrameError::TooShort(body.len()));
    }
    let partition = i32::from_be_bytes([body[1], body[2], body[3], body[4]]);
    Ok(PayloadFrame {
        partition,
        payload: &body[PAYLOAD_HEADER_LEN..],
    })
}

/// Builds a payload body (without the length prefix).
pub fn payload_frame(partition: i32, payload: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(PAYLOAD_HEADER_LEN + payload.len());
    buf.put_u8(MessageType::Payload as u8);
    buf.put_i32(partition);
    buf.put_slice(payload);
    buf.freeze()
}

/// Prepends the wire length prefix to a frame body.
pub fn length_prefixed(body: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(4 + body.len());
    buf.put_u32(body.len() as u32);
    buf.put_slice(body);
    buf.freeze()
}
