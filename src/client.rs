//! Client builder and runtime loop.
//!
//! The [`ClientBuilder`] configures limits and collaborator seams, then
//! `start()` wires a transport to the correlation layer:
//! 1. Spawn the writer task draining framed messages from a channel
//! 2. Spawn the reader task feeding transport bytes through the frame
//!    buffer into reply dispatch
//! 3. Hand back a [`Client`] whose `call`/`notify`/`send_with` go through
//!    the shared [`JsonRpcConnection`]
//!
//! # Example
//!
//! ```ignore
//! use proofwire::Client;
//! use serde_json::{json, Map};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let client = Client::connect_tcp("127.0.0.1:8080").await?;
//!
//!     let mut params = Map::new();
//!     params.insert("file".to_string(), json!("Primes.cry"));
//!     let answer = client.call("load module", params).await?;
//!     println!("loaded: {}", answer);
//!     Ok(())
//! }
//! ```

use std::sync::{Arc, Mutex};

use bytes::Bytes;
use serde_json::{Map, Value};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::error::{ProofwireError, Result};
use crate::protocol::{FrameBuffer, DEFAULT_MAX_FRAME_SIZE};
use crate::rpc::{
    DiagnosticSink, FailureFn, JsonRpcConnection, LogSink, SuccessFn, TrafficObserver,
};

/// Default capacity of the outbound send queue.
pub const DEFAULT_SEND_QUEUE_CAPACITY: usize = 1024;

/// Builder for configuring and starting a client.
pub struct ClientBuilder {
    max_frame_size: usize,
    send_queue_capacity: usize,
    diagnostics: Arc<dyn DiagnosticSink>,
    observer: Option<Arc<dyn TrafficObserver>>,
}

impl ClientBuilder {
    /// Create a builder with default limits and a `tracing`-backed
    /// diagnostics sink.
    pub fn new() -> Self {
        Self {
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            send_queue_capacity: DEFAULT_SEND_QUEUE_CAPACITY,
            diagnostics: Arc::new(LogSink),
            observer: None,
        }
    }

    /// Set the maximum accepted reply payload size.
    pub fn max_frame_size(mut self, limit: usize) -> Self {
        self.max_frame_size = limit;
        self
    }

    /// Set the outbound send queue capacity.
    ///
    /// `send_with`/`notify` fail with `SendQueueFull` rather than block
    /// when the queue is at capacity.
    pub fn send_queue_capacity(mut self, capacity: usize) -> Self {
        self.send_queue_capacity = capacity;
        self
    }

    /// Replace the sink receiving unroutable replies and protocol
    /// violations.
    pub fn diagnostics(mut self, sink: Arc<dyn DiagnosticSink>) -> Self {
        self.diagnostics = sink;
        self
    }

    /// Attach a read-only observer of every sent and received payload.
    pub fn observer(mut self, observer: Arc<dyn TrafficObserver>) -> Self {
        self.observer = Some(observer);
        self
    }

    /// Start the runtime over an arbitrary transport.
    pub fn start<R, W>(self, reader: R, writer: W) -> Client
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (outbound_tx, outbound_rx) = mpsc::channel(self.send_queue_capacity);
        let conn = Arc::new(JsonRpcConnection::new(
            outbound_tx,
            self.diagnostics,
            self.observer,
        ));

        let writer_task = tokio::spawn(async move {
            let result = write_loop(outbound_rx, writer).await;
            if let Err(e) = &result {
                tracing::error!("write loop error: {}", e);
            }
            result
        });

        let reader_task = {
            let conn = conn.clone();
            let max_frame_size = self.max_frame_size;
            tokio::spawn(async move {
                let result = read_loop(reader, &conn, max_frame_size).await;
                if let Err(e) = &result {
                    tracing::error!("read loop error: {}", e);
                }
                // Whatever ended the loop, nothing will resolve the
                // outstanding requests now.
                conn.fail_all_pending();
                result
            })
        };

        Client {
            conn,
            reader_task,
            _writer_task: writer_task,
        }
    }

    /// Connect to a server listening on a TCP address and start the
    /// runtime over the stream.
    pub async fn connect_tcp<A>(self, addr: A) -> Result<Client>
    where
        A: tokio::net::ToSocketAddrs,
    {
        let stream = tokio::net::TcpStream::connect(addr).await?;
        let (reader, writer) = stream.into_split();
        Ok(self.start(reader, writer))
    }
}

impl Default for ClientBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// A running client.
///
/// Cheap to share by reference; all request methods take `&self`. The
/// spawned reader and writer tasks live until the transport closes.
pub struct Client {
    /// The correlation layer, shared with the reader task.
    conn: Arc<JsonRpcConnection>,
    /// Reader task handle; resolves when the connection is done.
    reader_task: JoinHandle<Result<()>>,
    /// Writer task handle.
    _writer_task: JoinHandle<Result<()>>,
}

impl Client {
    /// Create a new client builder.
    pub fn builder() -> ClientBuilder {
        ClientBuilder::new()
    }

    /// Connect with default configuration.
    pub async fn connect_tcp<A>(addr: A) -> Result<Client>
    where
        A: tokio::net::ToSocketAddrs,
    {
        ClientBuilder::new().connect_tcp(addr).await
    }

    /// Call a method and await its answer.
    ///
    /// Returns the reply's `answer` member, or the routed
    /// [`ProofwireError::Rpc`] for an error reply. If the connection dies
    /// before the reply arrives, fails with `ConnectionClosed`.
    pub async fn call(&self, method: &str, params: Map<String, Value>) -> Result<Value> {
        let (tx, rx) = oneshot::channel();
        // The success and failure continuations race for the same sender;
        // whichever fires takes it.
        let tx = Arc::new(Mutex::new(Some(tx)));
        let tx_ok = tx.clone();
        let on_success: SuccessFn = Box::new(move |answer| {
            if let Some(tx) = tx_ok.lock().expect("call sender lock poisoned").take() {
                let _ = tx.send(Ok(answer));
            }
        });
        let on_failure: FailureFn = Box::new(move |error| {
            if let Some(tx) = tx.lock().expect("call sender lock poisoned").take() {
                let _ = tx.send(Err(error.into()));
            }
        });

        self.conn
            .send_with(method, params, on_success, Some(on_failure))?;
        rx.await.map_err(|_| ProofwireError::ConnectionClosed)?
    }

    /// Register explicit continuations for a call. See
    /// [`JsonRpcConnection::send_with`].
    pub fn send_with(
        &self,
        method: &str,
        params: Map<String, Value>,
        on_success: SuccessFn,
        on_failure: Option<FailureFn>,
    ) -> Result<u64> {
        self.conn.send_with(method, params, on_success, on_failure)
    }

    /// Send a notification; the server will not reply.
    pub fn notify(&self, method: &str, params: Map<String, Value>) -> Result<()> {
        self.conn.notify(method, params)
    }

    /// Snapshot of the current session state token.
    pub fn state_token(&self) -> Value {
        self.conn.state_token()
    }

    /// Number of requests still awaiting a reply.
    pub fn pending_count(&self) -> usize {
        self.conn.pending_count()
    }

    /// Wait until the connection closes (EOF or fatal framing error).
    ///
    /// This consumes the client and returns the read loop's outcome.
    pub async fn wait_closed(self) -> Result<()> {
        match self.reader_task.await {
            Ok(result) => result,
            Err(e) => Err(ProofwireError::Protocol(format!(
                "reader task failed: {}",
                e
            ))),
        }
    }
}

/// Main read loop - drains the transport and dispatches replies.
///
/// Exactly one reader feeds the decode loop; dispatch fans out to the
/// continuations registered under each reply's id.
async fn read_loop<R: AsyncRead + Unpin>(
    mut reader: R,
    conn: &JsonRpcConnection,
    max_frame_size: usize,
) -> Result<()> {
    let mut frames = FrameBuffer::with_max_frame_size(max_frame_size);
    let mut buf = vec![0u8; 64 * 1024];

    loop {
        let n = match reader.read(&mut buf).await {
            Ok(0) => return Ok(()), // Connection closed
            Ok(n) => n,
            Err(e) => return Err(ProofwireError::Io(e)),
        };

        // A framing error here is fatal; the caller decides whether to
        // reconnect.
        for payload in frames.push(&buf[..n])? {
            conn.dispatch(&payload);
        }
    }
}

/// Writer loop - drains framed messages and writes them to the transport.
async fn write_loop<W: AsyncWrite + Unpin>(
    mut rx: mpsc::Receiver<Bytes>,
    mut writer: W,
) -> Result<()> {
    while let Some(frame) = rx.recv().await {
        writer.write_all(&frame).await?;
        // Drain whatever queued up behind it before paying for a flush.
        while let Ok(next) = rx.try_recv() {
            writer.write_all(&next).await?;
        }
        writer.flush().await?;
    }
    Ok(())
}
