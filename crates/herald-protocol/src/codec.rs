//! Codec for encoding and decoding Herald events.
//!
//! Clients pick one of two encodings at handshake time:
//!
//! - JSON, carried in WebSocket text messages
//! - MessagePack with a 4-byte big-endian length prefix, carried in binary
//!   messages

use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::str::FromStr;
use thiserror::Error;

/// Maximum frame size (1 MiB).
pub const MAX_FRAME_SIZE: usize = 1024 * 1024;

/// Length prefix size in bytes.
pub const LENGTH_PREFIX_SIZE: usize = 4;

/// Protocol errors that can occur during encoding/decoding.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Frame exceeds maximum size.
    #[error("Frame size {0} exceeds maximum {MAX_FRAME_SIZE}")]
    FrameTooLarge(usize),

    /// Not enough data to decode frame.
    #[error("Incomplete frame: need {0} more bytes")]
    Incomplete(usize),

    /// MessagePack encoding error.
    #[error("Encoding error: {0}")]
    Encode(#[from] rmp_serde::encode::Error),

    /// MessagePack decoding error.
    #[error("Decoding error: {0}")]
    Decode(#[from] rmp_serde::decode::Error),

    /// JSON error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// The frame kind does not match the negotiated encoding.
    #[error("Expected {expected} frame")]
    WrongEncoding { expected: &'static str },

    /// Invalid event data.
    #[error("Invalid event: {0}")]
    Invalid(String),
}

/// Wire encoding negotiated for a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Encoding {
    #[default]
    Json,
    MessagePack,
}

impl Encoding {
    /// Get the encoding name.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Encoding::Json => "json",
            Encoding::MessagePack => "msgpack",
        }
    }
}

impl FromStr for Encoding {
    type Err = &'static str;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "json" => Ok(Encoding::Json),
            "msgpack" | "messagepack" => Ok(Encoding::MessagePack),
            _ => Err("Unknown encoding"),
        }
    }
}

/// An encoded frame ready to be written to a WebSocket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WireFrame {
    Text(String),
    Binary(Bytes),
}

impl WireFrame {
    /// Size of the frame in bytes.
    #[must_use]
    pub fn len(&self) -> usize {
        match self {
            WireFrame::Text(text) => text.len(),
            WireFrame::Binary(data) => data.len(),
        }
    }

    /// Whether the frame is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Encode a value as a length-prefixed MessagePack frame.
///
/// The encoded format is:
/// - 4 bytes: Big-endian length prefix
/// - N bytes: MessagePack-encoded value (named fields)
///
/// # Errors
///
/// Returns an error if the frame is too large or encoding fails.
pub fn encode<T: Serialize>(value: &T) -> Result<Bytes, ProtocolError> {
    let mut buf = BytesMut::new();
    encode_into(value, &mut buf)?;
    Ok(buf.freeze())
}

/// Encode a value into an existing buffer.
///
/// # Errors
///
/// Returns an error if the frame is too large or encoding fails.
pub fn encode_into<T: Serialize>(value: &T, buf: &mut BytesMut) -> Result<(), ProtocolError> {
    let payload = rmp_serde::to_vec_named(value)?;

    if payload.len() > MAX_FRAME_SIZE {
        return Err(ProtocolError::FrameTooLarge(payload.len()));
    }

    buf.reserve(LENGTH_PREFIX_SIZE + payload.len());
    buf.put_u32(payload.len() as u32);
    buf.extend_from_slice(&payload);

    Ok(())
}

/// Decode a length-prefixed MessagePack frame.
///
/// # Errors
///
/// Returns an error if the data is incomplete, too large, or invalid.
pub fn decode<T: DeserializeOwned>(data: &[u8]) -> Result<T, ProtocolError> {
    if data.len() < LENGTH_PREFIX_SIZE {
        return Err(ProtocolError::Incomplete(LENGTH_PREFIX_SIZE - data.len()));
    }

    let length = u32::from_be_bytes([data[0], data[1], data[2], data[3]]) as usize;

    if length > MAX_FRAME_SIZE {
        return Err(ProtocolError::FrameTooLarge(length));
    }

    let total_size = LENGTH_PREFIX_SIZE + length;
    if data.len() < total_size {
        return Err(ProtocolError::Incomplete(total_size - data.len()));
    }

    Ok(rmp_serde::from_slice(&data[LENGTH_PREFIX_SIZE..total_size])?)
}

/// Try to decode a frame from a buffer, advancing it if successful.
///
/// Returns `Ok(Some(value))` if a complete frame was decoded,
/// `Ok(None)` if more data is needed, or `Err` on protocol error.
///
/// # Errors
///
/// Returns an error if the frame is too large or invalid.
pub fn decode_from<T: DeserializeOwned>(buf: &mut BytesMut) -> Result<Option<T>, ProtocolError> {
    if buf.len() < LENGTH_PREFIX_SIZE {
        return Ok(None);
    }

    let length = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;

    if length > MAX_FRAME_SIZE {
        return Err(ProtocolError::FrameTooLarge(length));
    }

    let total_size = LENGTH_PREFIX_SIZE + length;
    if buf.len() < total_size {
        return Ok(None);
    }

    buf.advance(LENGTH_PREFIX_SIZE);
    let payload = buf.split_to(length);
    Ok(Some(rmp_serde::from_slice(&payload)?))
}

/// Per-connection codec bound to the negotiated [`Encoding`].
#[derive(Debug, Default)]
pub struct FrameCodec {
    encoding: Encoding,
    read_buffer: BytesMut,
}

impl FrameCodec {
    /// Create a codec for the given encoding.
    #[must_use]
    pub fn new(encoding: Encoding) -> Self {
        Self {
            encoding,
            read_buffer: BytesMut::new(),
        }
    }

    /// The negotiated encoding.
    #[must_use]
    pub fn encoding(&self) -> Encoding {
        self.encoding
    }

    /// Encode a value into a wire frame.
    ///
    /// # Errors
    ///
    /// Returns an error if encoding fails.
    pub fn encode<T: Serialize>(&self, value: &T) -> Result<WireFrame, ProtocolError> {
        match self.encoding {
            Encoding::Json => {
                let text = serde_json::to_string(value)?;
                if text.len() > MAX_FRAME_SIZE {
                    return Err(ProtocolError::FrameTooLarge(text.len()));
                }
                Ok(WireFrame::Text(text))
            }
            Encoding::MessagePack => Ok(WireFrame::Binary(encode(value)?)),
        }
    }

    /// Decode a JSON text frame.
    ///
    /// # Errors
    ///
    /// Returns an error if the connection negotiated MessagePack or the text
    /// is not a valid event.
    pub fn decode_text<T: DeserializeOwned>(&self, text: &str) -> Result<T, ProtocolError> {
        if self.encoding != Encoding::Json {
            return Err(ProtocolError::WrongEncoding { expected: "binary" });
        }
        if text.len() > MAX_FRAME_SIZE {
            return Err(ProtocolError::FrameTooLarge(text.len()));
        }
        Ok(serde_json::from_str(text)?)
    }

    /// Feed a binary frame and decode every complete value it completes.
    ///
    /// A MessagePack value may span several WebSocket messages; partial data
    /// stays buffered until the rest arrives.
    ///
    /// # Errors
    ///
    /// Returns an error if the connection negotiated JSON or the data is
    /// invalid. The buffer is cleared on error.
    pub fn decode_binary<T: DeserializeOwned>(
        &mut self,
        data: &[u8],
    ) -> Result<Vec<T>, ProtocolError> {
        if self.encoding != Encoding::MessagePack {
            return Err(ProtocolError::WrongEncoding { expected: "text" });
        }

        self.read_buffer.extend_from_slice(data);
        let mut values = Vec::new();
        loop {
            match decode_from(&mut self.read_buffer) {
                Ok(Some(value)) => values.push(value),
                Ok(None) => return Ok(values),
                Err(e) => {
                    self.read_buffer.clear();
                    return Err(e);
                }
            }
        }
    }
}
