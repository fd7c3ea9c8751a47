//! Client wire protocol for the realtime gateway.
//!
//! One socket carries two kinds of frame:
//!
//! - text frames holding a JSON message header
//! - binary frames holding a JSON header plus a raw payload
//!
//! Binary layout (all integers big-endian):
//!
//! ```text
//! offset  size  meaning
//! 0       2     H, header length in bytes
//! 2       4     D, payload length in bytes
//! 6       H     UTF-8 JSON header
//! 6+H     D     raw payload
//! ```
//!
//! [`read_message`] never panics on hostile input; every failure is an
//! [`InvalidFrame`] which the gateway drops without answering.

mod dispatch;
mod encode;
mod frame;

pub use dispatch::{ClientMessage, DispatchError};
pub use encode::{EncodeError, encode_binary_frame, encode_text_frame};
pub use frame::{
    Frame, InvalidFrame, MAX_BINARY_FRAME_BYTES, MAX_TEXT_FRAME_CHARS, MessageHeader,
    ParsedMessage, PREAMBLE_LEN, read_message,
};
