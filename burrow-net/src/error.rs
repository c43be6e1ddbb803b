//! Socket operation errors.

use crate::completion::OpKind;
use thiserror::Error;

/// Outcome of a socket operation that did not complete normally.
#[derive(Debug, Error)]
pub enum NetError {
    #[error("{op} cancelled")]
    Cancelled { op: OpKind },

    #[error("{op} failed (os error {code:?}): {source}")]
    Transport {
        op: OpKind,
        code: Option<i32>,
        #[source]
        source: std::io::Error,
    },

    #[error("operation already in flight on this descriptor")]
    Busy,

    #[error("descriptor was cancelled mid-operation and cannot be reused")]
    Stale,
}

impl NetError {
    pub(crate) fn transport(op: OpKind, source: std::io::Error) -> Self {
        NetError::Transport {
            op,
            code: source.raw_os_error(),
            source,
        }
    }

    /// Returns whether this is a cancellation rather than a failure.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, NetError::Cancelled { .. })
    }

    /// Returns the OS error code of a transport failure.
    pub fn os_code(&self) -> Option<i32> {
        match self {
            NetError::Transport { code, .. } => *code,
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;

    #[test]
    fn test_transport_keeps_os_code() {
        let err = NetError::transport(OpKind::Send, io::Error::from_raw_os_error(32));
        assert_eq!(err.os_code(), Some(32));
        assert!(!err.is_cancelled());
        assert!(err.to_string().contains("send"));
    }

    #[test]
    fn test_synthetic_io_error_has_no_code() {
        let err = NetError::transport(
            OpKind::Receive,
            io::Error::new(io::ErrorKind::Other, "boom"),
        );
        assert_eq!(err.os_code(), None);
    }
}
