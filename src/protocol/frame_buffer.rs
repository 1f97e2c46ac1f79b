//! Frame buffer for accumulating partial reads.
//!
//! Uses `bytes::BytesMut` for zero-copy buffer management. Incoming chunks
//! are appended as they arrive from the transport; complete payloads are
//! split off and frozen, and any trailing partial frame stays buffered for
//! the next push.
//!
//! # Example
//!
//! ```
//! use proofwire::protocol::FrameBuffer;
//!
//! let mut buffer = FrameBuffer::new();
//! let payloads = buffer.push(b"5:hello,5:wor").unwrap();
//! assert_eq!(payloads.len(), 1);
//! assert_eq!(&payloads[0][..], b"hello");
//!
//! let payloads = buffer.push(b"ld,").unwrap();
//! assert_eq!(&payloads[0][..], b"world");
//! assert!(buffer.is_empty());
//! ```

use bytes::{Buf, Bytes, BytesMut};

use super::netstring::{self, Scan};
use crate::error::{ProofwireError, Result};

/// Default maximum payload size (64 MiB).
pub const DEFAULT_MAX_FRAME_SIZE: usize = 64 * 1024 * 1024;

/// Buffer for accumulating incoming bytes and extracting complete payloads.
pub struct FrameBuffer {
    /// Accumulated bytes from transport reads.
    buffer: BytesMut,
    /// Maximum allowed payload size.
    max_frame_size: usize,
}

impl FrameBuffer {
    /// Create a new frame buffer with the default size limit.
    pub fn new() -> Self {
        Self::with_max_frame_size(DEFAULT_MAX_FRAME_SIZE)
    }

    /// Create a new frame buffer with a custom maximum payload size.
    pub fn with_max_frame_size(max_frame_size: usize) -> Self {
        Self {
            buffer: BytesMut::with_capacity(64 * 1024),
            max_frame_size,
        }
    }

    /// Push data into the buffer and extract all complete payloads.
    ///
    /// Returns every payload completed by this chunk, in stream order; an
    /// empty vector means more input is needed. Partial frames are retained
    /// internally, never discarded.
    ///
    /// # Errors
    ///
    /// [`ProofwireError::MalformedFrame`] if the stream violates the
    /// framing grammar, or [`ProofwireError::FrameTooLarge`] as soon as a
    /// declared length exceeds the configured maximum (the body need not
    /// have arrived yet). Both are fatal to the stream.
    pub fn push(&mut self, data: &[u8]) -> Result<Vec<Bytes>> {
        self.buffer.extend_from_slice(data);

        let mut payloads = Vec::new();
        while let Some(payload) = self.try_extract_one()? {
            payloads.push(payload);
        }
        Ok(payloads)
    }

    /// Try to extract a single payload from the buffer.
    fn try_extract_one(&mut self) -> Result<Option<Bytes>> {
        match netstring::scan(&self.buffer)? {
            Scan::Incomplete { declared } => {
                if let Some(len) = declared {
                    if len > self.max_frame_size {
                        return Err(ProofwireError::FrameTooLarge(len));
                    }
                }
                Ok(None)
            }
            Scan::Frame { start, len, end } => {
                if len > self.max_frame_size {
                    return Err(ProofwireError::FrameTooLarge(len));
                }
                // Consume the whole frame, then trim to the payload.
                let mut frame = self.buffer.split_to(end);
                frame.advance(start);
                frame.truncate(len);
                Ok(Some(frame.freeze()))
            }
        }
    }

    /// Get the number of buffered bytes.
    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    /// Check if the buffer is empty.
    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    /// Discard all buffered bytes.
    pub fn clear(&mut self) {
        self.buffer.clear();
    }
}

impl Default for FrameBuffer {
    fn default() -> Self {
        Self::new()
    }
}
