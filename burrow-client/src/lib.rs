//! # burrow-client
//!
//! Client library for burrow.
//!
//! This crate provides:
//! - A poll-driven connection that batches queued commands into requests
//! - Dispatch of acknowledgements and state snapshots to system clients
//! - Automatic disconnect after a configurable number of idle pumps

pub mod config;
pub mod error;
pub mod pump;
pub mod response;
pub mod system;

pub use config::ClientConfig;
pub use error::ClientError;
pub use pump::{ClientStats, ConnectionState, NetClient, TransferState};
pub use response::{Accepted, Response};
pub use system::{RecordingClient, SystemClient};
