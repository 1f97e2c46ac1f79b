//! Collaborator seams for traffic the correlation layer cannot route.
//!
//! Unroutable replies and protocol violations are surfaced here, never
//! silently dropped. The observer seam exists for history/display
//! collaborators and carries no protocol semantics.

use serde_json::Value;

use super::envelope::RpcError;

/// Process-wide sink for replies and violations that cannot be routed to a
/// pending request. Implementations must not block.
pub trait DiagnosticSink: Send + Sync {
    /// A reply whose id matches no pending request (or that carries no id).
    fn unrouted_reply(&self, id: Option<u64>, payload: &Value);

    /// A decoded message that is structurally unusable: neither `result`
    /// nor `error`, not an object, or missing required members.
    fn protocol_violation(&self, detail: &str, payload: &Value);

    /// An error reply arrived for a request that registered no failure
    /// continuation.
    fn unexpected_error(&self, id: u64, error: &RpcError);
}

/// Default sink reporting through `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogSink;

impl DiagnosticSink for LogSink {
    fn unrouted_reply(&self, id: Option<u64>, payload: &Value) {
        tracing::warn!(?id, %payload, "reply matches no pending request");
    }

    fn protocol_violation(&self, detail: &str, payload: &Value) {
        tracing::error!(detail, %payload, "protocol violation");
    }

    fn unexpected_error(&self, id: u64, error: &RpcError) {
        tracing::error!(
            id,
            code = error.code,
            message = %error.message,
            "error reply for a request with no failure continuation"
        );
    }
}

/// Read-only observer of every sent and received payload, for history and
/// display collaborators.
pub trait TrafficObserver: Send + Sync {
    /// Called with each serialized message just before it is framed.
    fn sent(&self, payload: &[u8]);

    /// Called with each decoded payload before it is dispatched.
    fn received(&self, payload: &[u8]);
}
