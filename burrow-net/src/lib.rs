//! # burrow-net
//!
//! Socket plumbing shared by the burrow server and client.
//!
//! Every socket operation runs through a [`SocketOp`] descriptor, which
//! allows one outstanding operation at a time and races it against a
//! cancellation signal. The result is delivered exactly once: the byte count
//! or socket on success, [`NetError::Cancelled`] if cancellation won, or
//! [`NetError::Transport`] carrying the OS error code.

pub mod cancel;
pub mod completion;
pub mod error;

pub use cancel::CancellationToken;
pub use completion::{OpKind, Phase, SocketOp};
pub use error::NetError;
