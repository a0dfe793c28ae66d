use thiserror::Error;

use crate::rpc::RpcError;

/// User-facing multiplexer errors.
///
/// The variants mirror the two axes the protocol distinguishes: peer-visible
/// contract violations ([`MuxError::Protocol`]) versus everything local to
/// this side (I/O, encoding, internal state), with timeouts and close kept
/// separate so retry logic can tell them apart.
#[derive(Debug, Error)]
pub enum MuxError {
    #[error("timeout waiting for peer response")]
    Timeout,

    #[error("multiplexer closed")]
    Closed,

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("peer returned an error: {message} (code {code})")]
    Peer { code: i64, message: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("datamux: {0}")]
    Internal(String),
}

pub type MuxResult<T> = Result<T, MuxError>;

impl MuxError {
    /// True when this error reports a wire-contract violation by the peer.
    pub fn is_protocol(&self) -> bool {
        matches!(self, MuxError::Protocol(_))
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, MuxError::Timeout)
    }

    pub fn is_closed(&self) -> bool {
        matches!(self, MuxError::Closed)
    }
}

impl From<RpcError> for MuxError {
    fn from(err: RpcError) -> Self {
        match err {
            RpcError::Io(e) => MuxError::Io(e),
            RpcError::Encode(e) => MuxError::Internal(format!("json encode error: {e}")),
            RpcError::Protocol(reason) => MuxError::Protocol(reason),
            RpcError::Closed => MuxError::Closed,
        }
    }
}
