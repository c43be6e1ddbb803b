//! # burrow-protocol
//!
//! Wire protocol implementation for burrow.
//!
//! Requests travel inside just enough HTTP/1.1 syntax to pass through
//! HTTP-permissive network paths. This crate provides:
//! - Incremental request framing and response-head scanning
//! - Length-prefixed, optionally keyed packets over a growable buffer
//! - 128-bit identifiers and id generators
//! - Pluggable session key derivation
//! - Error codes and protocol constants

pub mod error;
pub mod id;
pub mod session;
pub mod tunnel;
pub mod wire;

pub use error::{ErrorCode, ProtocolError};
pub use id::{Id, IdGenerator, RandomIdGenerator, SequentialIdGenerator};
pub use session::{SessionKey, SessionKeyResolver, XorKeyResolver};
pub use tunnel::{
    FramerLimits, LengthCheckOrder, ResponseFramer, TunnelFramer, TunnelMessage, TunnelResponse,
};
pub use wire::{PacketWriter, WireBuffer, WireReader};

/// Default port for the burrow server.
pub const DEFAULT_PORT: u16 = 8080;

/// Listen backlog for the accepting socket.
pub const LISTEN_BACKLOG: u32 = 256;

/// Size of a single socket read (128 KiB).
pub const RECEIVE_BUFFER_SIZE: usize = 128 * 1024;

/// Maximum request body size (1 MiB).
pub const MAX_REQUEST_SIZE: usize = 1024 * 1024;

/// Maximum response body size (1 MiB).
pub const MAX_RESPONSE_SIZE: usize = 1024 * 1024;

/// Smallest request body worth parsing: a session packet plus the keyed
/// envelope header.
pub const MIN_CONTENT_LENGTH: usize = 48;

/// Maximum size of a message head before the terminator must appear.
pub const MAX_HEAD_SIZE: usize = 8 * 1024;
