//! Request/response correlation and session-state threading.
//!
//! The connection owns three pieces of shared state: a monotonically
//! increasing request-id source, the map of pending continuations, and the
//! session state token. Every outbound call carries the last-observed
//! token under the reserved `state` params member; every inbound result
//! may carry a replacement, which overwrites the stored token before the
//! caller's continuation runs. The server stays logically stateless
//! between calls while the client reconstructs one linear session.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use serde_json::{Map, Value};
use tokio::sync::mpsc;

use crate::error::{ProofwireError, Result};
use crate::protocol::netstring;
use crate::rpc::diagnostics::{DiagnosticSink, TrafficObserver};
use crate::rpc::envelope::{Request, RpcError, STATE_KEY};

/// Success continuation: consumes the `answer` member of a result reply.
pub type SuccessFn = Box<dyn FnOnce(Value) + Send>;

/// Failure continuation: consumes a well-formed `error` reply.
pub type FailureFn = Box<dyn FnOnce(RpcError) + Send>;

/// Continuations registered under one request id. Resolved and removed
/// exactly once, through either path, when the reply arrives.
struct Pending {
    on_success: SuccessFn,
    on_failure: Option<FailureFn>,
}

/// The correlation layer of one logical connection.
///
/// Cheap to share behind an `Arc`; all methods take `&self`. Entries in
/// the pending map are removed only by a reply or by
/// [`fail_all_pending`](Self::fail_all_pending) at teardown, so a request
/// whose reply never arrives stays registered for the life of the
/// connection.
pub struct JsonRpcConnection {
    /// Request-id source; ids are unique for the connection lifetime.
    next_id: AtomicU64,
    /// Pending continuations by request id.
    pending: Mutex<HashMap<u64, Pending>>,
    /// Last-observed session state token. `Value::Null` until the server
    /// issues one.
    state: Mutex<Value>,
    /// Framed outbound messages, drained by the writer task.
    outbound: mpsc::Sender<Bytes>,
    /// Sink for unroutable traffic.
    diagnostics: Arc<dyn DiagnosticSink>,
    /// Optional read-only payload observer.
    observer: Option<Arc<dyn TrafficObserver>>,
}

impl JsonRpcConnection {
    /// Create a connection that frames messages into `outbound`.
    pub fn new(
        outbound: mpsc::Sender<Bytes>,
        diagnostics: Arc<dyn DiagnosticSink>,
        observer: Option<Arc<dyn TrafficObserver>>,
    ) -> Self {
        Self {
            next_id: AtomicU64::new(0),
            pending: Mutex::new(HashMap::new()),
            state: Mutex::new(Value::Null),
            outbound,
            diagnostics,
            observer,
        }
    }

    /// Send a call, registering continuations under a fresh id.
    ///
    /// The current state token is merged into `params` under the reserved
    /// `state` member. Never blocks: the framed message is handed to the
    /// writer channel, with [`ProofwireError::SendQueueFull`] if the
    /// channel is at capacity. Returns the id assigned to the call.
    pub fn send_with(
        &self,
        method: &str,
        params: Map<String, Value>,
        on_success: SuccessFn,
        on_failure: Option<FailureFn>,
    ) -> Result<u64> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let frame = self.encode_message(Some(id), method, params)?;

        self.pending_lock().insert(
            id,
            Pending {
                on_success,
                on_failure,
            },
        );

        if let Err(e) = self.outbound.try_send(frame) {
            self.pending_lock().remove(&id);
            return Err(match e {
                mpsc::error::TrySendError::Full(_) => ProofwireError::SendQueueFull,
                mpsc::error::TrySendError::Closed(_) => ProofwireError::ConnectionClosed,
            });
        }
        Ok(id)
    }

    /// Send a notification; no id is assigned and nothing is registered.
    pub fn notify(&self, method: &str, params: Map<String, Value>) -> Result<()> {
        let frame = self.encode_message(None, method, params)?;
        self.outbound.try_send(frame).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => ProofwireError::SendQueueFull,
            mpsc::error::TrySendError::Closed(_) => ProofwireError::ConnectionClosed,
        })
    }

    /// Dispatch one decoded payload to its pending caller.
    ///
    /// Replies that cannot be routed, and messages that violate the
    /// envelope structure, go to the diagnostics sink.
    pub fn dispatch(&self, payload: &[u8]) {
        if let Some(observer) = &self.observer {
            observer.received(payload);
        }

        let msg: Value = match serde_json::from_slice(payload) {
            Ok(v) => v,
            Err(e) => {
                self.diagnostics
                    .protocol_violation(&format!("unparseable reply: {}", e), &Value::Null);
                return;
            }
        };
        let Some(obj) = msg.as_object() else {
            self.diagnostics
                .protocol_violation("reply is not an object", &msg);
            return;
        };

        let id = obj.get("id").and_then(Value::as_u64);

        if let Some(error_val) = obj.get("error") {
            let error = RpcError::from_value(error_val);
            let Some(id) = id else {
                self.diagnostics.unrouted_reply(None, &msg);
                return;
            };
            match self.take_pending(id) {
                Some(Pending {
                    on_failure: Some(on_failure),
                    ..
                }) => on_failure(error),
                Some(Pending {
                    on_failure: None, ..
                }) => self.diagnostics.unexpected_error(id, &error),
                None => self.diagnostics.unrouted_reply(Some(id), &msg),
            }
        } else if let Some(result) = obj.get("result") {
            // The token update happens before any continuation runs.
            if let Some(new_state) = result.get(STATE_KEY) {
                *self.state_lock() = new_state.clone();
            }
            let Some(id) = id else {
                self.diagnostics.unrouted_reply(None, &msg);
                return;
            };
            let Some(answer) = result.get("answer") else {
                self.diagnostics
                    .protocol_violation("result without an answer member", &msg);
                // Drop the pending entry so the caller observes closure
                // rather than waiting forever.
                let _ = self.take_pending(id);
                return;
            };
            match self.take_pending(id) {
                Some(pending) => (pending.on_success)(answer.clone()),
                None => self.diagnostics.unrouted_reply(Some(id), &msg),
            }
        } else {
            self.diagnostics
                .protocol_violation("reply with neither result nor error", &msg);
        }
    }

    /// Drop every pending continuation. Called at connection teardown;
    /// oneshot-backed callers observe the drop as `ConnectionClosed`.
    pub fn fail_all_pending(&self) {
        let dropped: Vec<u64> = {
            let mut pending = self.pending_lock();
            let ids = pending.keys().copied().collect();
            pending.clear();
            ids
        };
        if !dropped.is_empty() {
            tracing::debug!(count = dropped.len(), "dropped pending requests at teardown");
        }
    }

    /// Snapshot of the current session state token.
    pub fn state_token(&self) -> Value {
        self.state_lock().clone()
    }

    /// Number of requests still awaiting a reply.
    pub fn pending_count(&self) -> usize {
        self.pending_lock().len()
    }

    fn encode_message(
        &self,
        id: Option<u64>,
        method: &str,
        mut params: Map<String, Value>,
    ) -> Result<Bytes> {
        params.insert(STATE_KEY.to_string(), self.state_token());
        let request = match id {
            Some(id) => Request::call(id, method, params),
            None => Request::notification(method, params),
        };
        let body = serde_json::to_vec(&request)?;
        if let Some(observer) = &self.observer {
            observer.sent(&body);
        }
        Ok(Bytes::from(netstring::encode(&body)))
    }

    fn take_pending(&self, id: u64) -> Option<Pending> {
        self.pending_lock().remove(&id)
    }

    fn pending_lock(&self) -> std::sync::MutexGuard<'_, HashMap<u64, Pending>> {
        self.pending.lock().expect("pending map lock poisoned")
    }

    fn state_lock(&self) -> std::sync::MutexGuard<'_, Value> {
        self.state.lock().expect("state token lock poisoned")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::Decoded;
    use serde_json::json;

    /// Sink that records everything it is handed.
    #[derive(Default)]
    struct RecordingSink {
        unrouted: Mutex<Vec<Option<u64>>>,
        violations: Mutex<Vec<String>>,
        unexpected: Mutex<Vec<u64>>,
    }

    impl DiagnosticSink for RecordingSink {
        fn unrouted_reply(&self, id: Option<u64>, _payload: &Value) {
            self.unrouted.lock().unwrap().push(id);
        }
        fn protocol_violation(&self, detail: &str, _payload: &Value) {
            self.violations.lock().unwrap().push(detail.to_string());
        }
        fn unexpected_error(&self, id: u64, _error: &RpcError) {
            self.unexpected.lock().unwrap().push(id);
        }
    }

    fn make_conn() -> (Arc<JsonRpcConnection>, mpsc::Receiver<Bytes>, Arc<RecordingSink>) {
        let (tx, rx) = mpsc::channel(64);
        let sink = Arc::new(RecordingSink::default());
        let conn = Arc::new(JsonRpcConnection::new(tx, sink.clone(), None));
        (conn, rx, sink)
    }

    /// Decode the single netstring frame sent on the channel into JSON.
    fn sent_message(rx: &mut mpsc::Receiver<Bytes>) -> Value {
        let frame = rx.try_recv().expect("nothing was sent");
        match netstring::decode(&frame).unwrap() {
            Decoded::Frame { payload, rest } => {
                assert!(rest.is_empty());
                serde_json::from_slice(payload).unwrap()
            }
            Decoded::Incomplete => panic!("partial frame on the wire"),
        }
    }

    fn noop_success() -> SuccessFn {
        Box::new(|_| {})
    }

    #[test]
    fn test_ids_are_monotonic_and_unique() {
        let (conn, mut rx, _) = make_conn();
        let a = conn
            .send_with("first", Map::new(), noop_success(), None)
            .unwrap();
        let b = conn
            .send_with("second", Map::new(), noop_success(), None)
            .unwrap();
        assert_eq!(a, 1);
        assert_eq!(b, 2);

        assert_eq!(sent_message(&mut rx)["id"], json!(1));
        assert_eq!(sent_message(&mut rx)["id"], json!(2));
    }

    #[test]
    fn test_send_merges_state_into_params() {
        let (conn, mut rx, _) = make_conn();
        let mut params = Map::new();
        params.insert("file".to_string(), json!("Spec.cry"));
        conn.send_with("load module", params, noop_success(), None)
            .unwrap();

        let msg = sent_message(&mut rx);
        assert_eq!(msg["jsonrpc"], json!("2.0"));
        assert_eq!(msg["method"], json!("load module"));
        assert_eq!(msg["params"]["file"], json!("Spec.cry"));
        // No token has been observed yet: an explicit null is threaded.
        assert_eq!(msg["params"]["state"], Value::Null);
    }

    #[test]
    fn test_result_routes_to_success_continuation() {
        let (conn, _rx, _) = make_conn();
        let answers = Arc::new(Mutex::new(Vec::new()));
        let sink = answers.clone();
        conn.send_with(
            "check",
            Map::new(),
            Box::new(move |answer| sink.lock().unwrap().push(answer)),
            None,
        )
        .unwrap();

        conn.dispatch(br#"{"id":1,"result":{"answer":42}}"#);

        assert_eq!(*answers.lock().unwrap(), vec![json!(42)]);
        assert_eq!(conn.pending_count(), 0);
    }

    #[test]
    fn test_state_threading_updates_before_continuation() {
        let (conn, mut rx, _) = make_conn();

        // The continuation observes the already-updated token.
        let conn_ref = conn.clone();
        let seen = Arc::new(Mutex::new(Value::Null));
        let seen_ref = seen.clone();
        conn.send_with(
            "load module",
            Map::new(),
            Box::new(move |_| {
                *seen_ref.lock().unwrap() = conn_ref.state_token();
            }),
            None,
        )
        .unwrap();
        let _ = sent_message(&mut rx);

        conn.dispatch(br#"{"id":1,"result":{"answer":null,"state":["s1"]}}"#);
        assert_eq!(*seen.lock().unwrap(), json!(["s1"]));

        // The next call carries the new token.
        conn.send_with("check", Map::new(), noop_success(), None)
            .unwrap();
        let msg = sent_message(&mut rx);
        assert_eq!(msg["params"]["state"], json!(["s1"]));

        // A result without a state member leaves the token unchanged.
        conn.dispatch(br#"{"id":2,"result":{"answer":true}}"#);
        assert_eq!(conn.state_token(), json!(["s1"]));
    }

    #[test]
    fn test_error_routes_to_failure_continuation() {
        let (conn, _rx, sink) = make_conn();
        let failures = Arc::new(Mutex::new(Vec::new()));
        let failures_ref = failures.clone();
        conn.send_with(
            "verify",
            Map::new(),
            noop_success(),
            Some(Box::new(move |e| failures_ref.lock().unwrap().push(e))),
        )
        .unwrap();

        conn.dispatch(br#"{"id":1,"error":{"code":-32000,"message":"boom","data":"ctx"}}"#);

        let failures = failures.lock().unwrap();
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].code, -32000);
        assert_eq!(failures[0].message, "boom");
        assert_eq!(failures[0].data, Some(json!("ctx")));
        assert!(sink.unexpected.lock().unwrap().is_empty());
        assert_eq!(conn.pending_count(), 0);
    }

    #[test]
    fn test_error_without_failure_continuation_is_surfaced() {
        let (conn, _rx, sink) = make_conn();
        let fired = Arc::new(Mutex::new(false));
        let fired_ref = fired.clone();
        conn.send_with(
            "verify",
            Map::new(),
            Box::new(move |_| *fired_ref.lock().unwrap() = true),
            None,
        )
        .unwrap();

        conn.dispatch(br#"{"id":1,"error":{"code":1,"message":"nope"}}"#);

        assert!(!*fired.lock().unwrap());
        assert_eq!(*sink.unexpected.lock().unwrap(), vec![1]);
        // Both continuations are deregistered either way.
        assert_eq!(conn.pending_count(), 0);
    }

    #[test]
    fn test_unrouted_replies_are_surfaced() {
        let (conn, _rx, sink) = make_conn();
        conn.dispatch(br#"{"id":99,"result":{"answer":1}}"#);
        conn.dispatch(br#"{"id":98,"error":{"code":1,"message":"m"}}"#);
        conn.dispatch(br#"{"result":{"answer":1}}"#);

        assert_eq!(
            *sink.unrouted.lock().unwrap(),
            vec![Some(99), Some(98), None]
        );
    }

    #[test]
    fn test_protocol_violations_are_surfaced() {
        let (conn, _rx, sink) = make_conn();
        conn.dispatch(br#"{"id":1,"neither":true}"#);
        conn.dispatch(b"not json at all");
        conn.dispatch(br#"[1,2,3]"#);

        let violations = sink.violations.lock().unwrap();
        assert_eq!(violations.len(), 3);
        assert!(violations[0].contains("neither result nor error"));
    }

    #[test]
    fn test_result_without_answer_drops_pending() {
        let (conn, _rx, sink) = make_conn();
        let fired = Arc::new(Mutex::new(false));
        let fired_ref = fired.clone();
        conn.send_with(
            "check",
            Map::new(),
            Box::new(move |_| *fired_ref.lock().unwrap() = true),
            None,
        )
        .unwrap();

        conn.dispatch(br#"{"id":1,"result":{"state":[]}}"#);

        assert!(!*fired.lock().unwrap());
        assert_eq!(sink.violations.lock().unwrap().len(), 1);
        assert_eq!(conn.pending_count(), 0);
    }

    #[test]
    fn test_interleaved_replies_route_exactly_once() {
        let (conn, _rx, sink) = make_conn();
        let hits: Arc<Mutex<Vec<(u64, Value)>>> = Arc::new(Mutex::new(Vec::new()));

        let n = 8;
        let mut ids = Vec::new();
        for _ in 0..n {
            let hits_ref = hits.clone();
            let id = conn
                .send_with(
                    "echo",
                    Map::new(),
                    Box::new(move |answer| {
                        hits_ref.lock().unwrap().push((0, answer));
                    }),
                    None,
                )
                .unwrap();
            ids.push(id);
        }

        // Deliver replies in reverse order, each answer tagged with its id.
        for &id in ids.iter().rev() {
            let reply = format!(r#"{{"id":{},"result":{{"answer":{}}}}}"#, id, id);
            conn.dispatch(reply.as_bytes());
        }
        // A second delivery for an already-resolved id is unroutable.
        conn.dispatch(br#"{"id":1,"result":{"answer":1}}"#);

        let hits = hits.lock().unwrap();
        assert_eq!(hits.len(), n);
        let mut answers: Vec<u64> = hits.iter().map(|(_, a)| a.as_u64().unwrap()).collect();
        answers.sort_unstable();
        assert_eq!(answers, (1..=n as u64).collect::<Vec<_>>());
        assert_eq!(*sink.unrouted.lock().unwrap(), vec![Some(1)]);
        assert_eq!(conn.pending_count(), 0);
    }

    #[test]
    fn test_notify_carries_state_but_no_id() {
        let (conn, mut rx, _) = make_conn();
        conn.notify("interrupt", Map::new()).unwrap();
        let msg = sent_message(&mut rx);
        assert!(msg.get("id").is_none());
        assert_eq!(msg["params"]["state"], Value::Null);
    }

    #[test]
    fn test_fail_all_pending_clears_map() {
        let (conn, _rx, _) = make_conn();
        conn.send_with("a", Map::new(), noop_success(), None).unwrap();
        conn.send_with("b", Map::new(), noop_success(), None).unwrap();
        assert_eq!(conn.pending_count(), 2);

        conn.fail_all_pending();
        assert_eq!(conn.pending_count(), 0);
    }

    #[test]
    fn test_send_fails_after_writer_gone() {
        let (conn, rx, _) = make_conn();
        drop(rx);
        let err = conn
            .send_with("echo", Map::new(), noop_success(), None)
            .unwrap_err();
        assert!(matches!(err, ProofwireError::ConnectionClosed));
        // The failed send does not leak a pending entry.
        assert_eq!(conn.pending_count(), 0);
    }
}
