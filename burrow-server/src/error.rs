//! Server error types.

use crate::config::ConfigError;
use crate::registry::SystemError;
use burrow_net::NetError;
use burrow_protocol::{ErrorCode, ProtocolError};
use std::net::SocketAddr;
use thiserror::Error;

/// Server errors.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("socket error: {0}")]
    Net(#[from] NetError),

    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    #[error("authentication failed: {0}")]
    Authentication(String),

    #[error("unknown system {0}")]
    UnknownSystem(u32),

    #[error("system {0} registered twice")]
    DuplicateSystem(u32),

    #[error("batch of {count} commands exceeds limit {max}")]
    BatchTooLarge { count: u32, max: u32 },

    #[error("response of {size} bytes exceeds limit {max}")]
    ResponseTooLarge { size: usize, max: usize },

    #[error("system {number} failed: {source}")]
    System {
        number: u32,
        #[source]
        source: SystemError,
    },

    #[error("server shutting down")]
    ShuttingDown,
}

/// How a connection answers a failed request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rejection {
    /// Send `400 BAD REQUEST`, then close.
    BadRequest,
    /// Close without a response.
    Silent,
    /// The socket is unusable or the server is stopping; just unwind.
    Abort,
}

impl ServerError {
    /// Converts to protocol error code.
    pub fn error_code(&self) -> ErrorCode {
        match self {
            ServerError::Io(_) => ErrorCode::TransportError,
            ServerError::Protocol(_) => ErrorCode::BadRequest,
            ServerError::Net(e) if e.is_cancelled() => ErrorCode::Cancelled,
            ServerError::Net(_) => ErrorCode::TransportError,
            ServerError::Config(_) => ErrorCode::InternalError,
            ServerError::Bind { .. } => ErrorCode::TransportError,
            ServerError::Authentication(_) => ErrorCode::Unauthorized,
            ServerError::UnknownSystem(_) => ErrorCode::UnknownSystem,
            ServerError::DuplicateSystem(_) => ErrorCode::InternalError,
            ServerError::BatchTooLarge { .. } => ErrorCode::BadRequest,
            ServerError::ResponseTooLarge { .. } => ErrorCode::InternalError,
            ServerError::System { .. } => ErrorCode::InternalError,
            ServerError::ShuttingDown => ErrorCode::Cancelled,
        }
    }

    /// Returns whether this error is retryable.
    pub fn is_retryable(&self) -> bool {
        self.error_code().is_retryable()
    }

    /// Returns how the connection should answer this error.
    pub fn rejection(&self) -> Rejection {
        match self {
            ServerError::Protocol(e) if e.closes_silently() => Rejection::Silent,
            ServerError::Protocol(_)
            | ServerError::Authentication(_)
            | ServerError::UnknownSystem(_)
            | ServerError::BatchTooLarge { .. }
            | ServerError::ResponseTooLarge { .. } => Rejection::BadRequest,
            _ => Rejection::Abort,
        }
    }
}
