//! Client error types.

use burrow_net::NetError;
use burrow_protocol::{ErrorCode, Id};
use thiserror::Error;

/// Client errors.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("protocol error: {0}")]
    Protocol(#[from] burrow_protocol::ProtocolError),

    #[error("socket error: {0}")]
    Net(#[from] NetError),

    #[error("not connected")]
    NotConnected,

    #[error("connection closed")]
    ConnectionClosed,

    #[error("request timeout")]
    Timeout,

    #[error("server rejected the request")]
    BadRequest,

    #[error("no session key for session {0}")]
    UnknownSession(Id),

    #[error("system client {0} registered twice")]
    DuplicateSystemClient(u32),
}

impl ClientError {
    /// Converts to protocol error code.
    pub fn error_code(&self) -> ErrorCode {
        match self {
            ClientError::Io(_) => ErrorCode::TransportError,
            ClientError::Protocol(_) => ErrorCode::BadRequest,
            ClientError::Net(e) if e.is_cancelled() => ErrorCode::Cancelled,
            ClientError::Net(_) => ErrorCode::TransportError,
            ClientError::NotConnected => ErrorCode::TransportError,
            ClientError::ConnectionClosed => ErrorCode::TransportError,
            ClientError::Timeout => ErrorCode::TransportError,
            ClientError::BadRequest => ErrorCode::BadRequest,
            ClientError::UnknownSession(_) => ErrorCode::Unauthorized,
            ClientError::DuplicateSystemClient(_) => ErrorCode::InternalError,
        }
    }

    /// Returns whether this error is retryable.
    pub fn is_retryable(&self) -> bool {
        match self {
            ClientError::Io(_) => true,
            ClientError::Timeout => true,
            ClientError::ConnectionClosed => true,
            ClientError::Net(e) => !e.is_cancelled(),
            _ => false,
        }
    }
}
