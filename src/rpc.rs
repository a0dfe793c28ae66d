//! JSON-RPC 2.0 node: message types, request correlation, timeouts.
//!
//! The node is transport-agnostic.  Outbound frames (already-serialized
//! JSON) leave through a caller-installed callback; inbound frames are fed
//! to [`RpcNode::push_message`].  There is no framing here; the surrounding
//! transport is message-oriented and delivers whole frames.
//!
//! ## Message types
//!
//! - **Request**: `{ "jsonrpc": "2.0", "id": N, "method": "...", "params": {...} }`
//! - **Response**: `{ "jsonrpc": "2.0", "id": N, "result": ... }` or
//!   `{ ..., "error": { "code": C, "message": "..." } }`
//!
//! Notifications (a `method` without an `id`) are not part of this protocol
//! and are rejected as malformed.
//!
//! ## Correlation
//!
//! [`RpcNode::send_request`] mints a `u64` id, parks a oneshot waiter in the
//! pending table, and only then emits the frame.  A response arriving via
//! [`RpcNode::push_message`] is matched against the table by id; responses
//! with no waiter (e.g. arriving after the waiter timed out and the caller
//! retried with a fresh id) are logged and dropped.

use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use log::debug;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::oneshot;

use crate::buffer::lock;
use crate::mux::PushToOutsideFn;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// RPC-layer errors (encoding, protocol violations, transport emission).
#[derive(Debug, Error)]
pub enum RpcError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json encode error: {0}")]
    Encode(serde_json::Error),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("node closed")]
    Closed,
}

pub type RpcResult<T> = Result<T, RpcError>;

// ---------------------------------------------------------------------------
// Standard error codes
// ---------------------------------------------------------------------------

/// Error codes carried in [`RpcErrorData`].
pub mod error_code {
    /// A peer-visible violation of the wire contract.
    pub const PROTOCOL_ERROR: i64 = -32000;
    /// An internal / unexpected error occurred while serving a request.
    pub const INTERNAL_ERROR: i64 = -32603;
}

// ---------------------------------------------------------------------------
// Message types
// ---------------------------------------------------------------------------

pub const JSONRPC_VERSION: &str = "2.0";

/// A request message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request {
    /// Protocol version — always `"2.0"`.
    pub jsonrpc: String,
    /// Unique request identifier (monotonically increasing per node).
    pub id: u64,
    /// The RPC method to invoke.
    pub method: String,
    /// Method parameters as a JSON object.
    #[serde(default)]
    pub params: Value,
}

/// A response message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Response {
    /// Protocol version — always `"2.0"`.
    pub jsonrpc: String,
    /// Matches the `id` of the originating [`Request`].
    pub id: u64,
    /// The result payload (structure depends on the method).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    /// Present only when the operation failed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcErrorData>,
}

/// Error payload inside a [`Response`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcErrorData {
    /// Machine-readable error code (see [`error_code`]).
    pub code: i64,
    /// Human-readable error message.
    pub message: String,
}

impl Request {
    pub fn new(id: u64, method: impl Into<String>, params: Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.into(),
            id,
            method: method.into(),
            params,
        }
    }
}

impl Response {
    /// Create a successful response.
    pub fn ok(id: u64, result: Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.into(),
            id,
            result: Some(result),
            error: None,
        }
    }

    /// Create an error response.
    pub fn err(id: u64, code: i64, message: impl Into<String>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.into(),
            id,
            result: None,
            error: Some(RpcErrorData {
                code,
                message: message.into(),
            }),
        }
    }

    /// True when the peer reported an error for this request.
    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }
}

// ---------------------------------------------------------------------------
// Incoming message (tagged union for classification)
// ---------------------------------------------------------------------------

/// A message received on the wire: a request from the peer or a response to
/// one of our pending requests.
#[derive(Debug, Clone)]
pub enum Incoming {
    Request(Request),
    Response(Response),
}

/// Classify and decode a raw JSON frame.
///
/// A `method` key makes the message a request (an `id` is then required); an
/// `id` without a `method` makes it a response.  Anything else is malformed.
pub fn classify(data: &[u8]) -> RpcResult<Incoming> {
    let value: Value = serde_json::from_slice(data)
        .map_err(|e| RpcError::Protocol(format!("invalid JSON frame: {e}")))?;

    let obj = value
        .as_object()
        .ok_or_else(|| RpcError::Protocol("expected a JSON object".into()))?;

    let has_id = obj.contains_key("id");
    let has_method = obj.contains_key("method");

    if has_method && has_id {
        let req: Request = serde_json::from_value(value)
            .map_err(|e| RpcError::Protocol(format!("malformed request: {e}")))?;
        Ok(Incoming::Request(req))
    } else if has_method {
        Err(RpcError::Protocol(
            "notification messages are not part of this protocol".into(),
        ))
    } else if has_id {
        let resp: Response = serde_json::from_value(value)
            .map_err(|e| RpcError::Protocol(format!("malformed response: {e}")))?;
        Ok(Incoming::Response(resp))
    } else {
        Err(RpcError::Protocol(
            "message has neither method nor id".into(),
        ))
    }
}

// ---------------------------------------------------------------------------
// Node
// ---------------------------------------------------------------------------

/// Outcome of a single request/response exchange.
#[derive(Debug)]
pub enum WaitOutcome {
    /// The peer answered within the timeout.
    Response(Response),
    /// No response arrived within the timeout; the waiter was unregistered.
    TimedOut,
    /// The node was closed while the request was pending.
    Closed,
}

enum Wakeup {
    Response(Response),
    Closed,
}

/// A JSON-RPC 2.0 endpoint multiplexing concurrent requests over a single
/// frame transport.
pub struct RpcNode {
    pending: Mutex<HashMap<u64, oneshot::Sender<Wakeup>>>,
    next_id: AtomicU64,
    closed: AtomicBool,
    push_to_outside: PushToOutsideFn,
    debug_name: String,
}

impl RpcNode {
    pub fn new(push_to_outside: PushToOutsideFn, debug_name: String) -> Self {
        Self {
            pending: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            closed: AtomicBool::new(false),
            push_to_outside,
            debug_name,
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Send a request and wait up to `timeout` for its response.
    ///
    /// `on_id` runs under the node's internal lock, after the request id has
    /// been minted and its waiter parked but before the frame is emitted.
    /// Callers use it to record the id somewhere concurrent inbound requests
    /// can see it; by the time the peer can possibly refer to this request,
    /// the recording has happened.
    pub async fn send_request(
        &self,
        method: &str,
        params: Value,
        timeout: Duration,
        on_id: Option<&(dyn Fn(u64) + Send + Sync)>,
    ) -> RpcResult<WaitOutcome> {
        let (tx, rx) = oneshot::channel();
        let id = {
            let mut pending = lock(&self.pending);
            // Checked under the lock: close() drains the table under the
            // same lock, so a waiter parked here is guaranteed to be woken.
            if self.is_closed() {
                return Ok(WaitOutcome::Closed);
            }
            let id = self.next_id.fetch_add(1, Ordering::Relaxed);
            pending.insert(id, tx);
            if let Some(hook) = on_id {
                hook(id);
            }
            id
        };

        let request = Request::new(id, method, params);
        let frame = match serde_json::to_vec(&request) {
            Ok(frame) => frame,
            Err(e) => {
                lock(&self.pending).remove(&id);
                return Err(RpcError::Encode(e));
            }
        };

        debug!(
            "{}: sending request {id} ({method}, {} bytes)",
            self.debug_name,
            frame.len()
        );
        if let Err(e) = (self.push_to_outside)(&frame) {
            lock(&self.pending).remove(&id);
            return Err(RpcError::Io(e));
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(Wakeup::Response(resp))) => Ok(WaitOutcome::Response(resp)),
            Ok(Ok(Wakeup::Closed)) => Ok(WaitOutcome::Closed),
            // The sender half is only dropped when the node tears down.
            Ok(Err(_)) => Ok(WaitOutcome::Closed),
            Err(_) => {
                lock(&self.pending).remove(&id);
                debug!("{}: request {id} ({method}) timed out", self.debug_name);
                Ok(WaitOutcome::TimedOut)
            }
        }
    }

    /// Feed one inbound frame to the node.
    ///
    /// Responses are matched against the pending table and consumed; requests
    /// are handed back for the caller to dispatch.
    pub fn push_message(&self, data: &[u8]) -> RpcResult<Option<Request>> {
        if self.is_closed() {
            return Err(RpcError::Closed);
        }

        match classify(data)? {
            Incoming::Request(req) => Ok(Some(req)),
            Incoming::Response(resp) => {
                let waiter = lock(&self.pending).remove(&resp.id);
                match waiter {
                    // The waiter may have timed out in the meantime; a failed
                    // send here is harmless.
                    Some(tx) => {
                        let _ = tx.send(Wakeup::Response(resp));
                    }
                    None => debug!(
                        "{}: dropping response for unknown request id {}",
                        self.debug_name, resp.id
                    ),
                }
                Ok(None)
            }
        }
    }

    /// Serialize and emit a response frame.
    pub fn send_response(&self, response: &Response) -> RpcResult<()> {
        let frame = serde_json::to_vec(response).map_err(RpcError::Encode)?;
        debug!(
            "{}: sending response {} ({} bytes)",
            self.debug_name,
            response.id,
            frame.len()
        );
        (self.push_to_outside)(&frame).map_err(RpcError::Io)
    }

    /// Close the node: refuse further traffic and wake every pending waiter
    /// with a close event.  Idempotent.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let waiters: Vec<_> = lock(&self.pending).drain().collect();
        debug!(
            "{}: closed, waking {} pending request(s)",
            self.debug_name,
            waiters.len()
        );
        for (_, tx) in waiters {
            let _ = tx.send(Wakeup::Closed);
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
