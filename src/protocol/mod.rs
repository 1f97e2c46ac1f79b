//! Protocol module - netstring framing for the byte stream.
//!
//! This layer turns a continuous byte stream into discrete payloads:
//! - netstring encode/decode over raw bytes
//! - a frame buffer for accumulating partial transport reads

pub mod netstring;

mod frame_buffer;

pub use frame_buffer::{FrameBuffer, DEFAULT_MAX_FRAME_SIZE};
pub use netstring::{decode, encode, Decoded, SEPARATOR, TERMINATOR};
