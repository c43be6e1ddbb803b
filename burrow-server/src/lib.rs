//! # burrow-server
//!
//! TCP server for burrow.
//!
//! This crate provides:
//! - The accept loop with connection limits and cooperative shutdown
//! - Per-connection request framing, authentication and dispatch
//! - The immutable system registry and the `System` handler trait
//! - A built-in echo system
//! - YAML and environment configuration

pub mod config;
pub mod error;
pub mod processor;
pub mod registry;
pub mod server;
pub mod session;
pub mod systems;

pub use config::{Config, ConfigError, LimitsConfig, NetworkConfig};
pub use error::{Rejection, ServerError};
pub use processor::{ProcessorContext, RequestProcessor};
pub use registry::{Command, System, SystemError, SystemRegistry, SystemRegistryBuilder};
pub use server::{Server, ServerConfig, ServerStats};
pub use session::{Session, SessionState};
pub use systems::{EchoSystem, ECHO_SYSTEM_NUMBER};
