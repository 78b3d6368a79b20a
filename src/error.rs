//! Error types of the engine protocol.

use address_monitor::AddressError;
use std::io;
use thiserror::Error;

/// Malformed or unexpected traffic. Fatal to the connection it arrived on.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("malformed frame: {0}")]
    Malformed(String),

    #[error("frame of {size} bytes exceeds limit of {limit}")]
    FrameTooLarge { size: usize, limit: usize },

    #[error("expected {expected}, got {got}")]
    UnexpectedValue {
        expected: &'static str,
        got: &'static str,
    },

    #[error("unknown value tag {0}")]
    UnknownTag(u8),

    #[error("unknown message type {0}")]
    UnknownMessageType(u64),

    #[error("unexpected message {0}")]
    UnexpectedMessage(String),

    #[error("expected {expected} items, got {got}")]
    Arity { expected: usize, got: usize },

    #[error("unsupported protocol version {0}")]
    Version(i64),

    #[error(transparent)]
    Address(#[from] AddressError),
}

impl From<rlp::DecoderError> for ProtocolError {
    fn from(err: rlp::DecoderError) -> Self {
        ProtocolError::Malformed(err.to_string())
    }
}

/// Failure of an endpoint.
#[derive(Debug, Error)]
pub enum IpcError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// The peer closed the connection.
    #[error("peer disconnected")]
    Disconnected,

    /// The endpoint was closed locally.
    #[error("endpoint closed")]
    Closed,
}

impl IpcError {
    /// Whether the connection ended rather than broke.
    pub fn is_disconnect(&self) -> bool {
        matches!(self, IpcError::Disconnected | IpcError::Closed)
    }
}

pub type IpcResult<T> = Result<T, IpcError>;
