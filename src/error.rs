//! Error types for proofwire.

use serde_json::Value;
use thiserror::Error;

/// Main error type for all proofwire operations.
#[derive(Debug, Error)]
pub enum ProofwireError {
    /// I/O error on the underlying transport.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// The byte stream violates the length-prefix grammar. Fatal to the
    /// connection; the framing layer never attempts recovery.
    #[error("malformed frame: unexpected byte 0x{byte:02x} at offset {offset}")]
    MalformedFrame { byte: u8, offset: usize },

    /// A frame declared a payload larger than the configured maximum.
    #[error("frame payload of {0} bytes exceeds the configured maximum")]
    FrameTooLarge(usize),

    /// Protocol error (reply with neither `result` nor `error`, missing
    /// envelope members, etc.).
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Well-formed error reply from the server, routed to its caller.
    #[error("server error {code}: {message}")]
    Rpc {
        code: i64,
        message: String,
        data: Option<Value>,
    },

    /// Operation on a closed queue.
    #[error("queue closed")]
    QueueClosed,

    /// The outbound send queue is full.
    #[error("send queue full")]
    SendQueueFull,

    /// Connection closed before the operation could complete.
    #[error("connection closed")]
    ConnectionClosed,
}

/// Result type alias using ProofwireError.
pub type Result<T> = std::result::Result<T, ProofwireError>;
