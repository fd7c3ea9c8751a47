//! Frame decoding.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Largest accepted text frame, in UTF-16 code units as counted by browsers.
pub const MAX_TEXT_FRAME_CHARS: usize = 1_048_576;

/// Largest accepted binary frame, preamble included.
pub const MAX_BINARY_FRAME_BYTES: usize = 2_097_152;

/// Size of the binary length preamble: a `u16` header length and a `u32` payload length.
pub const PREAMBLE_LEN: usize = 6;

/// One inbound unit from a client connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Text(String),
    Binary(Bytes),
}

impl Frame {
    /// Length as the size limits measure it.
    pub fn len(&self) -> usize {
        match self {
            Frame::Text(text) => text_len(text),
            Frame::Binary(bytes) => bytes.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        match self {
            Frame::Text(text) => text.is_empty(),
            Frame::Binary(bytes) => bytes.is_empty(),
        }
    }
}

/// JSON metadata of a message. Fields beyond the routing triple are kept
/// verbatim in `fields`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageHeader {
    pub namespace: String,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(rename = "requestId")]
    pub request_id: String,
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

impl MessageHeader {
    pub fn new(
        namespace: impl Into<String>,
        kind: impl Into<String>,
        request_id: impl Into<String>,
    ) -> Self {
        Self {
            namespace: namespace.into(),
            kind: kind.into(),
            request_id: request_id.into(),
            fields: Map::new(),
        }
    }

    /// Add a message-specific field.
    pub fn with_field(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.fields.insert(name.into(), value.into());
        self
    }
}

/// A successfully decoded frame.
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedMessage {
    pub header: MessageHeader,
    /// Payload of a binary frame. Shares memory with the frame it came from.
    pub binary_data: Option<Bytes>,
}

impl ParsedMessage {
    pub fn namespace(&self) -> &str {
        &self.header.namespace
    }

    pub fn kind(&self) -> &str {
        &self.header.kind
    }

    pub fn request_id(&self) -> &str {
        &self.header.request_id
    }

    pub fn field(&self, name: &str) -> Option<&Value> {
        self.header.fields.get(name)
    }

    pub fn str_field(&self, name: &str) -> Option<&str> {
        self.field(name).and_then(Value::as_str)
    }
}

/// Why a frame was rejected.
#[derive(Debug, thiserror::Error)]
pub enum InvalidFrame {
    #[error("text frame of {length} characters exceeds {MAX_TEXT_FRAME_CHARS}")]
    TextTooLong { length: usize },

    #[error("binary frame of {length} bytes exceeds {MAX_BINARY_FRAME_BYTES}")]
    FrameTooLarge { length: usize },

    #[error("binary frame of {length} bytes is shorter than the preamble")]
    Truncated { length: usize },

    #[error("declared frame length {declared} does not match actual length {actual}")]
    LengthMismatch { declared: u64, actual: usize },

    #[error("malformed header: {0}")]
    Header(#[from] serde_json::Error),
}

/// Decode one raw frame into a typed message.
///
/// Text frames are parsed as a JSON header. Binary frames must satisfy
/// `6 + H + D == len` exactly and stay within [`MAX_BINARY_FRAME_BYTES`].
pub fn read_message(frame: &Frame) -> Result<ParsedMessage, InvalidFrame> {
    match frame {
        Frame::Text(text) => read_text(text),
        Frame::Binary(bytes) => read_binary(bytes),
    }
}

fn read_text(text: &str) -> Result<ParsedMessage, InvalidFrame> {
    // UTF-8 never uses fewer bytes than UTF-16 code units.
    if text.len() > MAX_TEXT_FRAME_CHARS {
        let length = text_len(text);
        if length > MAX_TEXT_FRAME_CHARS {
            return Err(InvalidFrame::TextTooLong { length });
        }
    }

    let header = serde_json::from_str(text)?;
    Ok(ParsedMessage {
        header,
        binary_data: None,
    })
}

fn read_binary(bytes: &Bytes) -> Result<ParsedMessage, InvalidFrame> {
    let length = bytes.len();
    if length > MAX_BINARY_FRAME_BYTES {
        return Err(InvalidFrame::FrameTooLarge { length });
    }
    if length < PREAMBLE_LEN {
        return Err(InvalidFrame::Truncated { length });
    }

    let header_len = u16::from_be_bytes([bytes[0], bytes[1]]) as usize;
    let data_len = u32::from_be_bytes([bytes[2], bytes[3], bytes[4], bytes[5]]) as usize;

    let declared = (PREAMBLE_LEN + header_len) as u64 + data_len as u64;
    if declared != length as u64 {
        return Err(InvalidFrame::LengthMismatch {
            declared,
            actual: length,
        });
    }

    let header_end = PREAMBLE_LEN + header_len;
    let header = serde_json::from_slice(&bytes[PREAMBLE_LEN..header_end])?;

    Ok(ParsedMessage {
        header,
        binary_data: Some(bytes.slice(header_end..)),
    })
}

fn text_len(text: &str) -> usize {
    text.encode_utf16().count()
}
