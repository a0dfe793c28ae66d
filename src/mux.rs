//! Multiplexer façade and the sender side of a transfer.
//!
//! A [`Multiplexer`] sits on one end of a bidirectional message transport.
//! [`Multiplexer::channel_data`] registers an outbound buffer, announces it
//! to the peer, and blocks until the peer has pulled the whole buffer (or
//! until timeout/close).  Frames arriving from the transport are fed in
//! through [`Multiplexer::push_message_from_outside`]; the receiver side of
//! a transfer lives in the request handlers (see `transfer`).
//!
//! ```text
//!   channel_data(bytes)                       push_message_from_outside
//!        │                                              │
//!        ▼                                              ▼
//!   BufferRegistry ── announce "n" ──► RpcNode ◄── request/response frames
//!        ▲                                │
//!        └── peer pulls via gbi/gbs ──────┘
//! ```

use std::io::{self, Cursor};
use std::sync::Arc;
use std::time::Duration;

use log::debug;
use serde_json::Value;

use crate::buffer::{BufferWrapper, MemoryDestination, ReadSeek, WriteSeek};
use crate::errors::{MuxError, MuxResult};
use crate::proto::{self, BufferIdParams, MAX_INBOUND_FRAME, METHOD_NEW_BUFFER_AVAILABLE};
use crate::registry::BufferRegistry;
use crate::rpc::{Response, RpcNode, WaitOutcome};

/// Per-request timeout, fixed by the protocol.
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

/// Total send attempts per request; only timeouts are retried.
pub(crate) const SEND_ATTEMPTS: u32 = 3;

// ---------------------------------------------------------------------------
// Callback types
// ---------------------------------------------------------------------------

/// Delivers an already-serialized RPC frame to the peer.
pub type PushToOutsideFn = Arc<dyn Fn(&[u8]) -> io::Result<()> + Send + Sync>;

/// Opens a seekable destination of at least the requested size for an
/// incoming transfer.
pub type ProvideDestinationFn =
    Arc<dyn Fn(u64) -> io::Result<Box<dyn WriteSeek>> + Send + Sync>;

/// Receives the filled destination after a completed incoming transfer.
pub type TransferCompleteFn = Arc<dyn Fn(Box<dyn WriteSeek>) + Send + Sync>;

// ---------------------------------------------------------------------------
// Builder
// ---------------------------------------------------------------------------

/// Configures and assembles a [`Multiplexer`].
///
/// All callbacks are optional; defaults are resolved once at [`build`] time
/// and never mutated afterwards.  Without an outbound callback every send
/// fails with a not-connected error, and without a destination provider
/// incoming transfers land in size-exact [`MemoryDestination`]s.
///
/// [`build`]: MultiplexerBuilder::build
#[derive(Default)]
pub struct MultiplexerBuilder {
    debug_name: Option<String>,
    push_to_outside: Option<PushToOutsideFn>,
    provide_destination: Option<ProvideDestinationFn>,
    on_transfer_complete: Option<TransferCompleteFn>,
}

impl MultiplexerBuilder {
    /// Name used to prefix this instance's log output.
    pub fn debug_name(mut self, name: impl Into<String>) -> Self {
        self.debug_name = Some(name.into());
        self
    }

    pub fn push_to_outside<F>(mut self, f: F) -> Self
    where
        F: Fn(&[u8]) -> io::Result<()> + Send + Sync + 'static,
    {
        self.push_to_outside = Some(Arc::new(f));
        self
    }

    pub fn provide_destination<F>(mut self, f: F) -> Self
    where
        F: Fn(u64) -> io::Result<Box<dyn WriteSeek>> + Send + Sync + 'static,
    {
        self.provide_destination = Some(Arc::new(f));
        self
    }

    pub fn on_transfer_complete<F>(mut self, f: F) -> Self
    where
        F: Fn(Box<dyn WriteSeek>) + Send + Sync + 'static,
    {
        self.on_transfer_complete = Some(Arc::new(f));
        self
    }

    pub fn build(self) -> Arc<Multiplexer> {
        let debug_name = self.debug_name.unwrap_or_else(|| "datamux".to_string());
        let push_to_outside: PushToOutsideFn = self.push_to_outside.unwrap_or_else(|| {
            Arc::new(|_| {
                Err(io::Error::new(
                    io::ErrorKind::NotConnected,
                    "no outbound transport installed",
                ))
            })
        });
        let provide_destination = self
            .provide_destination
            .unwrap_or_else(|| Arc::new(default_provide_destination));
        let on_transfer_complete = self
            .on_transfer_complete
            .unwrap_or_else(|| Arc::new(|_destination| {}));

        Arc::new(Multiplexer {
            node: RpcNode::new(push_to_outside, debug_name.clone()),
            registry: BufferRegistry::new(),
            provide_destination,
            on_transfer_complete,
            debug_name,
        })
    }
}

fn default_provide_destination(size: u64) -> io::Result<Box<dyn WriteSeek>> {
    Ok(Box::new(MemoryDestination::with_size(size)?))
}

// ---------------------------------------------------------------------------
// Multiplexer
// ---------------------------------------------------------------------------

/// One endpoint of the pull-based buffer multiplexing protocol.
pub struct Multiplexer {
    pub(crate) node: RpcNode,
    pub(crate) registry: BufferRegistry,
    pub(crate) provide_destination: ProvideDestinationFn,
    pub(crate) on_transfer_complete: TransferCompleteFn,
    pub(crate) debug_name: String,
}

impl Multiplexer {
    pub fn builder() -> MultiplexerBuilder {
        MultiplexerBuilder::default()
    }

    pub fn debug_name(&self) -> &str {
        &self.debug_name
    }

    /// Number of outbound buffers currently registered.
    pub fn pending_buffers(&self) -> usize {
        self.registry.len()
    }

    /// Channel a byte vector to the peer.
    ///
    /// Convenience over [`channel_data_source`] for callers holding the
    /// bytes in memory.
    ///
    /// [`channel_data_source`]: Multiplexer::channel_data_source
    pub async fn channel_data(&self, data: Vec<u8>) -> MuxResult<Response> {
        self.channel_data_source(Box::new(Cursor::new(data))).await
    }

    /// Channel a seekable byte source to the peer.
    ///
    /// Registers the source, announces it, and blocks until the peer
    /// acknowledges having pulled the whole buffer.  The returned response
    /// is the peer's raw acknowledgement; any non-error response means the
    /// transfer completed.  The buffer is unregistered on every exit path.
    pub async fn channel_data_source(&self, source: Box<dyn ReadSeek>) -> MuxResult<Response> {
        let wrapper = self.registry.register(source);
        debug!(
            "{}: registered outbound buffer {}",
            self.debug_name,
            wrapper.buffer_id()
        );

        let result = self.announce_and_wait(wrapper.buffer_id(), &wrapper).await;

        self.registry.remove(wrapper.buffer_id());
        debug!(
            "{}: unregistered buffer {}",
            self.debug_name,
            wrapper.buffer_id()
        );
        result
    }

    async fn announce_and_wait(
        &self,
        buffer_id: &str,
        wrapper: &Arc<BufferWrapper>,
    ) -> MuxResult<Response> {
        let params = proto::body(&BufferIdParams {
            id: buffer_id.to_string(),
        })
        .map_err(MuxError::Internal)?;

        // Record the announce request id into the wrapper before the frame
        // can leave the node: the peer may start pulling while we are still
        // waiting for the acknowledgement.
        let hook_wrapper = Arc::clone(wrapper);
        let hook = move |id: u64| hook_wrapper.set_request_id(id);

        self.call_with_retry(METHOD_NEW_BUFFER_AVAILABLE, params, REQUEST_TIMEOUT, Some(&hook))
            .await
    }

    /// Send a request, waiting for its response and retrying timeouts.
    ///
    /// Timeouts are retried up to [`SEND_ATTEMPTS`] total attempts; close
    /// and transport errors return immediately.  Each attempt goes out with
    /// a fresh request id, so `on_id` runs once per attempt.
    pub(crate) async fn call_with_retry(
        &self,
        method: &str,
        params: Value,
        timeout: Duration,
        on_id: Option<&(dyn Fn(u64) + Send + Sync)>,
    ) -> MuxResult<Response> {
        let mut attempts_left = SEND_ATTEMPTS;
        loop {
            attempts_left -= 1;
            match self
                .node
                .send_request(method, params.clone(), timeout, on_id)
                .await?
            {
                WaitOutcome::Response(resp) => {
                    if resp.result.is_some() && resp.error.is_some() {
                        return Err(MuxError::Protocol(
                            "response carries both result and error".into(),
                        ));
                    }
                    return Ok(resp);
                }
                WaitOutcome::TimedOut if attempts_left > 0 => {
                    debug!(
                        "{}: {method} request timed out, retrying ({attempts_left} attempt(s) left)",
                        self.debug_name
                    );
                }
                WaitOutcome::TimedOut => return Err(MuxError::Timeout),
                WaitOutcome::Closed => return Err(MuxError::Closed),
            }
        }
    }

    /// Feed one frame received from the transport into the multiplexer.
    ///
    /// Frames at or above [`MAX_INBOUND_FRAME`] bytes are rejected before
    /// they reach the RPC node.  Responses resolve their pending senders;
    /// requests are served on a spawned task, so this call must be made
    /// within a tokio runtime.
    pub fn push_message_from_outside(self: &Arc<Self>, data: &[u8]) -> MuxResult<()> {
        if data.len() >= MAX_INBOUND_FRAME {
            return Err(MuxError::Protocol(format!(
                "inbound frame of {} bytes exceeds the {MAX_INBOUND_FRAME}-byte ceiling",
                data.len()
            )));
        }

        match self.node.push_message(data)? {
            Some(request) => {
                let mux = Arc::clone(self);
                tokio::spawn(async move {
                    mux.dispatch_request(request).await;
                });
                Ok(())
            }
            None => Ok(()),
        }
    }

    /// Close the multiplexer: wake every pending wait with a close error and
    /// drop all registered buffers.  Idempotent.
    pub fn close(&self) {
        debug!("{}: closing", self.debug_name);
        self.node.close();
        self.registry.clear();
    }

    pub fn is_closed(&self) -> bool {
        self.node.is_closed()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
