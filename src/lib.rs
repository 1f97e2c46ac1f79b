//! # proofwire
//!
//! Rust client runtime for driving a long-lived, stateful
//! analysis/verification backend over a netstring-framed JSON-RPC
//! connection.
//!
//! The server keeps all session state behind an opaque token: every call
//! carries the last-observed token, every result may issue a replacement.
//! This crate provides the pieces that make such sessions practical:
//!
//! - **Framing** ([`protocol`]): netstring encode/decode over raw bytes,
//!   with incremental buffering for pipelined multi-frame reads
//! - **Correlation** ([`rpc`]): request-id assignment, routing of each
//!   reply to its registered continuation, and session-state threading
//! - **Replay cache** ([`cache`]): a concurrent, validated tree memoizing
//!   "apply this command sequence to this state", so restarted or
//!   repeated sessions skip already-seen transitions
//! - **Keyed queue** ([`queue`]): FIFO channels demultiplexed by key, for
//!   routing values to per-channel waiters over one connection
//!
//! ## Example
//!
//! ```ignore
//! use proofwire::Client;
//! use serde_json::{json, Map};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let client = Client::connect_tcp("127.0.0.1:36681").await?;
//!
//!     let mut params = Map::new();
//!     params.insert("file".to_string(), json!("Primes.cry"));
//!     client.call("load module", params).await?;
//!
//!     // The session token advanced; later calls build on the loaded
//!     // module without re-sending it.
//!     let answer = client.call("visible names", Map::new()).await?;
//!     println!("{}", answer);
//!     Ok(())
//! }
//! ```

pub mod cache;
pub mod error;
pub mod protocol;
pub mod queue;
pub mod rpc;

mod client;

pub use cache::{CacheNode, CacheTree};
pub use client::{Client, ClientBuilder, DEFAULT_SEND_QUEUE_CAPACITY};
pub use error::{ProofwireError, Result};
pub use queue::MultiQueue;
pub use rpc::{
    DiagnosticSink, FailureFn, JsonRpcConnection, LogSink, RpcError, SuccessFn, TrafficObserver,
};
