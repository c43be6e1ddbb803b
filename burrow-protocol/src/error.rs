//! Protocol error types and error codes.

use std::fmt;
use thiserror::Error;

/// Protocol-level errors raised while framing or decoding a message.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("message head exceeds {max} bytes without a terminator ({size} buffered)")]
    HeadTooLarge { size: usize, max: usize },

    #[error("missing Content-Length header")]
    MissingContentLength,

    #[error("invalid Content-Length value")]
    InvalidContentLength,

    #[error("content length {length} below minimum {min}")]
    ContentTooSmall { length: usize, min: usize },

    #[error("content length {length} exceeds maximum {max}")]
    ContentTooLarge { length: usize, max: usize },

    #[error("unrecognized response status line")]
    MalformedStatus,

    #[error("truncated read: need {needed} bytes, {available} available")]
    Truncated { needed: usize, available: usize },

    #[error("packet length {length} exceeds remaining {remaining} bytes")]
    PacketOverrun { length: usize, remaining: usize },

    #[error("packet tag mismatch: expected {expected:#x}, got {actual:#x}")]
    TagMismatch { expected: u32, actual: u32 },

    #[error("packet too large: {size} bytes")]
    PacketTooLarge { size: usize },

    #[error("packet boundary does not match the innermost open packet")]
    UnbalancedPacket,
}

impl ProtocolError {
    /// Returns whether the connection should be dropped without answering.
    ///
    /// A body too short to carry a session id is not worth a response.
    pub fn closes_silently(&self) -> bool {
        matches!(self, ProtocolError::ContentTooSmall { .. })
    }
}

/// Stable error codes used in logs and statistics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    BadRequest,
    Unauthorized,
    UnknownSystem,
    Cancelled,
    TransportError,
    InternalError,
}

impl ErrorCode {
    /// Returns whether a fresh connection could succeed where this one failed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ErrorCode::TransportError | ErrorCode::InternalError | ErrorCode::Cancelled
        )
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorCode::BadRequest => write!(f, "BAD_REQUEST"),
            ErrorCode::Unauthorized => write!(f, "UNAUTHORIZED"),
            ErrorCode::UnknownSystem => write!(f, "UNKNOWN_SYSTEM"),
            ErrorCode::Cancelled => write!(f, "CANCELLED"),
            ErrorCode::TransportError => write!(f, "TRANSPORT_ERROR"),
            ErrorCode::InternalError => write!(f, "INTERNAL_ERROR"),
        }
    }
}
