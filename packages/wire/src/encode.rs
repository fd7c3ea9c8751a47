//! Frame encoding for outbound messages.

use bytes::{BufMut, Bytes, BytesMut};

use crate::frame::{MAX_BINARY_FRAME_BYTES, MessageHeader, PREAMBLE_LEN};

#[derive(Debug, thiserror::Error)]
pub enum EncodeError {
    #[error("header of {0} bytes does not fit the 16-bit length field")]
    HeaderTooLong(usize),

    #[error("frame of {0} bytes exceeds {MAX_BINARY_FRAME_BYTES}")]
    FrameTooLarge(usize),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Serialize a header as a text frame.
pub fn encode_text_frame(header: &MessageHeader) -> Result<String, EncodeError> {
    Ok(serde_json::to_string(header)?)
}

/// Build a binary frame: big-endian `u16` header length, `u32` payload
/// length, the JSON header, then the payload.
pub fn encode_binary_frame(header: &MessageHeader, payload: &[u8]) -> Result<Bytes, EncodeError> {
    let header = serde_json::to_vec(header)?;
    let header_len =
        u16::try_from(header.len()).map_err(|_| EncodeError::HeaderTooLong(header.len()))?;

    let total = PREAMBLE_LEN + header.len() + payload.len();
    if total > MAX_BINARY_FRAME_BYTES {
        return Err(EncodeError::FrameTooLarge(total));
    }

    let mut buf = BytesMut::with_capacity(total);
    buf.put_u16(header_len);
    buf.put_u32(payload.len() as u32);
    buf.put_slice(&header);
    buf.put_slice(payload);
    Ok(buf.freeze())
}

#[cfg(test)]
mod tests {
    #![allow(clippy::disallowed_methods)]

    use super::*;
    use crate::{Frame, read_message};

    #[test]
    fn encoded_binary_frame_is_readable() {
        let header = MessageHeader::new("files", "fileData", "r2").with_field("targetId", "t9");
        let frame = encode_binary_frame(&header, b"hello").unwrap();
        let message = read_message(&Frame::Binary(frame)).unwrap();
        assert_eq!(message.header, header);
        assert_eq!(message.binary_data.as_deref(), Some(&b"hello"[..]));
    }

    #[test]
    fn oversized_payload_is_refused() {
        let header = MessageHeader::new("files", "fileData", "r3");
        let payload = vec![0u8; MAX_BINARY_FRAME_BYTES];
        assert!(matches!(
            encode_binary_frame(&header, &payload),
            Err(EncodeError::FrameTooLarge(_))
        ));
    }

    #[test]
    fn oversized_header_is_refused() {
        let header =
            MessageHeader::new("files", "fileData", "r4").with_field("pad", "x".repeat(70_000));
        assert!(matches!(
            encode_binary_frame(&header, b""),
            Err(EncodeError::HeaderTooLong(_))
        ));
    }

    #[test]
    fn text_frame_uses_wire_field_names() {
        let header = MessageHeader::new("db", "get", "r5").with_field("data", 1);
        let text = encode_text_frame(&header).unwrap();
        let value: serde_json::Value = serde_json::from_str(&text).unwrap();
        assert_eq!(
            value,
            serde_json::json!({"namespace": "db", "type": "get", "requestId": "r5", "data": 1})
        );
    }
}
