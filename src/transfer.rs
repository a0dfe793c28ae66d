//! Receiver side of a transfer: serving peer requests.
//!
//! An announce (`n`) drives the whole pull sequence: query the buffer size
//! (`gbi`), open a destination, fetch slices (`gbs`) in ascending offset
//! order, commit each one, and only then acknowledge the announce.  The
//! info and slice handlers are the mirror image, serving our own registered
//! buffers to the pulling peer.
//!
//! Handlers classify failures on two axes: wire-contract violations by the
//! peer (answered with code -32000, "protocol error") and everything local
//! (answered with code -32603, "Internal error").  The distinction also
//! feeds the retry logic, which must not retry protocol errors.

use std::io::{Seek, SeekFrom, Write};
use std::sync::Arc;

use log::{debug, warn};
use serde_json::Value;
use thiserror::Error;

use crate::buffer::WriteSeek;
use crate::errors::MuxError;
use crate::mux::{Multiplexer, REQUEST_TIMEOUT};
use crate::proto::{
    self, BufferIdParams, BufferInfoResult, BufferSliceParams, BufferSliceResult,
    METHOD_GET_BUFFER_INFO, METHOD_GET_BUFFER_SLICE, METHOD_NEW_BUFFER_AVAILABLE, SLICE_SIZE,
};
use crate::rpc::{Request, Response, error_code};

/// Extra attempts per slice fetch after the first failure.
const SLICE_RETRIES: u32 = 3;

// ---------------------------------------------------------------------------
// Handler errors
// ---------------------------------------------------------------------------

/// Failure of a request handler, split along the protocol/local axis.
#[derive(Debug, Error)]
pub(crate) enum HandlerError {
    #[error("protocol error: {0}")]
    Protocol(String),

    #[error(transparent)]
    Local(#[from] MuxError),
}

impl HandlerError {
    fn local(err: impl Into<MuxError>) -> Self {
        HandlerError::Local(err.into())
    }

    fn into_response(self, id: u64, debug_name: &str) -> Response {
        match self {
            HandlerError::Protocol(reason) => {
                warn!("{debug_name}: protocol error serving request {id}: {reason}");
                Response::err(id, error_code::PROTOCOL_ERROR, "protocol error")
            }
            HandlerError::Local(err) => {
                warn!("{debug_name}: request {id} failed: {err}");
                Response::err(id, error_code::INTERNAL_ERROR, "Internal error")
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Request dispatch and handlers
// ---------------------------------------------------------------------------

impl Multiplexer {
    /// Serve one incoming request and send its response.
    ///
    /// Runs on its own task; an announce suspends here for the duration of
    /// the whole pull sequence while further frames keep flowing through
    /// `push_message_from_outside`.
    pub(crate) async fn dispatch_request(&self, request: Request) {
        let id = request.id;
        debug!(
            "{}: serving {} request {id}",
            self.debug_name, request.method
        );

        let result = match request.method.as_str() {
            METHOD_NEW_BUFFER_AVAILABLE => self.serve_announce(&request).await,
            METHOD_GET_BUFFER_INFO => self.serve_buffer_info(&request),
            METHOD_GET_BUFFER_SLICE => self.serve_buffer_slice(&request),
            other => Err(HandlerError::Protocol(format!(
                "unsupported method {other:?}"
            ))),
        };

        let response = match result {
            Ok(value) => Response::ok(id, value),
            Err(err) => err.into_response(id, &self.debug_name),
        };
        if let Err(err) = self.node.send_response(&response) {
            warn!(
                "{}: failed to send response for request {id}: {err}",
                self.debug_name
            );
        }
    }

    /// `n`: pull the announced buffer and commit it to a destination.
    ///
    /// The success acknowledgement is only returned after the final slice
    /// has been committed; the completion callback runs on a fresh task so
    /// the handler is not held up by the consumer.
    async fn serve_announce(&self, request: &Request) -> Result<Value, HandlerError> {
        let params: BufferIdParams =
            proto::parse(&request.params).map_err(HandlerError::Protocol)?;

        let size = self.query_buffer_size(&params.id).await?;
        debug!(
            "{}: incoming buffer {} ({size} bytes)",
            self.debug_name, params.id
        );

        let mut destination = (self.provide_destination)(size).map_err(HandlerError::local)?;
        let provided = destination
            .seek(SeekFrom::End(0))
            .map_err(HandlerError::local)?;
        if provided < size {
            return Err(HandlerError::local(MuxError::Internal(format!(
                "destination holds {provided} bytes, transfer needs {size}"
            ))));
        }

        let full_slices = size / SLICE_SIZE;
        let tail = size % SLICE_SIZE;

        for i in 0..full_slices {
            let start = i * SLICE_SIZE;
            self.fetch_slice_with_retry(&params.id, start, start + SLICE_SIZE, &mut destination)
                .await?;
        }
        if tail > 0 {
            let start = full_slices * SLICE_SIZE;
            self.fetch_slice_with_retry(&params.id, start, start + tail, &mut destination)
                .await?;
        }

        debug!(
            "{}: buffer {} reassembled ({size} bytes)",
            self.debug_name, params.id
        );
        let on_complete = Arc::clone(&self.on_transfer_complete);
        tokio::spawn(async move {
            on_complete(destination);
        });

        Ok(Value::Null)
    }

    /// `gbi`: answer a size query for one of our registered buffers.
    fn serve_buffer_info(&self, request: &Request) -> Result<Value, HandlerError> {
        let params: BufferIdParams =
            proto::parse(&request.params).map_err(HandlerError::Protocol)?;

        let wrapper = self.registry.find(&params.id).ok_or_else(|| {
            HandlerError::local(MuxError::Internal(format!(
                "unknown buffer id {:?}",
                params.id
            )))
        })?;
        let size = wrapper.size().map_err(HandlerError::local)?;

        proto::body(&BufferInfoResult { s: size })
            .map_err(|e| HandlerError::local(MuxError::Internal(e)))
    }

    /// `gbs`: serve one slice of a registered buffer.
    fn serve_buffer_slice(&self, request: &Request) -> Result<Value, HandlerError> {
        let params: BufferSliceParams =
            proto::parse(&request.params).map_err(HandlerError::Protocol)?;
        if params.end < params.start {
            return Err(HandlerError::Protocol(format!(
                "slice end {} precedes start {}",
                params.end, params.start
            )));
        }

        // The registry lock is released as soon as the wrapper is cloned
        // out; the read itself serializes on the wrapper's own lock.
        let wrapper = self.registry.find(&params.id).ok_or_else(|| {
            HandlerError::local(MuxError::Internal(format!(
                "unknown buffer id {:?}",
                params.id
            )))
        })?;

        let size = wrapper.size().map_err(HandlerError::local)?;
        if params.end > size {
            return Err(HandlerError::Protocol(format!(
                "slice end {} exceeds buffer size {size}",
                params.end
            )));
        }

        let bytes = wrapper
            .slice(params.start, params.end)
            .map_err(HandlerError::local)?;

        proto::body(&BufferSliceResult {
            data: proto::encode_slice(&bytes),
        })
        .map_err(|e| HandlerError::local(MuxError::Internal(e)))
    }

    // -----------------------------------------------------------------------
    // Pull-side sub-requests
    // -----------------------------------------------------------------------

    /// Ask the peer for the announced buffer's byte length.
    async fn query_buffer_size(&self, buffer_id: &str) -> Result<u64, HandlerError> {
        let params = proto::body(&BufferIdParams {
            id: buffer_id.to_string(),
        })
        .map_err(|e| HandlerError::local(MuxError::Internal(e)))?;

        let resp = self
            .call_with_retry(METHOD_GET_BUFFER_INFO, params, REQUEST_TIMEOUT, None)
            .await?;
        let result = expect_result(resp)?;
        let info: BufferInfoResult = proto::parse(&result).map_err(HandlerError::Protocol)?;
        Ok(info.s)
    }

    /// Fetch and commit one slice, retrying any failure up to
    /// [`SLICE_RETRIES`] extra attempts.
    async fn fetch_slice_with_retry(
        &self,
        buffer_id: &str,
        start: u64,
        end: u64,
        destination: &mut Box<dyn WriteSeek>,
    ) -> Result<(), HandlerError> {
        let mut retries_left = SLICE_RETRIES;
        loop {
            match self.fetch_slice(buffer_id, start, end, destination).await {
                Ok(()) => return Ok(()),
                Err(err) if retries_left > 0 => {
                    retries_left -= 1;
                    debug!(
                        "{}: slice [{start}, {end}) of {buffer_id} failed ({err}), retrying",
                        self.debug_name
                    );
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// Fetch one slice from the peer and commit it at its offset.
    async fn fetch_slice(
        &self,
        buffer_id: &str,
        start: u64,
        end: u64,
        destination: &mut Box<dyn WriteSeek>,
    ) -> Result<(), HandlerError> {
        let params = proto::body(&BufferSliceParams {
            id: buffer_id.to_string(),
            start,
            end,
        })
        .map_err(|e| HandlerError::local(MuxError::Internal(e)))?;

        let resp = self
            .call_with_retry(METHOD_GET_BUFFER_SLICE, params, REQUEST_TIMEOUT, None)
            .await?;
        let result = expect_result(resp)?;
        let slice: BufferSliceResult = proto::parse(&result).map_err(HandlerError::Protocol)?;

        let bytes = proto::decode_slice(&slice.data).map_err(HandlerError::Protocol)?;
        if bytes.len() as u64 != end - start {
            return Err(HandlerError::Protocol(format!(
                "peer returned {} bytes for slice [{start}, {end})",
                bytes.len()
            )));
        }

        destination
            .seek(SeekFrom::Start(start))
            .map_err(HandlerError::local)?;
        destination.write_all(&bytes).map_err(HandlerError::local)?;
        Ok(())
    }
}

/// Unwrap a response into its result, surfacing peer-reported errors.
fn expect_result(resp: Response) -> Result<Value, HandlerError> {
    if let Some(err) = resp.error {
        return Err(HandlerError::local(MuxError::Peer {
            code: err.code,
            message: err.message,
        }));
    }
    resp.result
        .ok_or_else(|| HandlerError::Protocol("response carries no result".into()))
}
