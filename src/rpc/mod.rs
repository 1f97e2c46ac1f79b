//! RPC module - request/response correlation over the framed stream.
//!
//! Provides:
//! - [`JsonRpcConnection`] - id assignment, pending-continuation routing,
//!   and session-state threading
//! - [`DiagnosticSink`] / [`TrafficObserver`] - collaborator seams for
//!   unroutable traffic and payload observation

mod connection;
mod diagnostics;
mod envelope;

pub use connection::{FailureFn, JsonRpcConnection, SuccessFn};
pub use diagnostics::{DiagnosticSink, LogSink, TrafficObserver};
pub use envelope::{Request, RpcError, JSONRPC_VERSION, STATE_KEY};
