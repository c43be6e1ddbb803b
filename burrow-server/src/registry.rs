//! Systems and the registry that routes commands to them.
//!
//! A system owns a slice of application state under a fixed number. Commands
//! addressed to it are processed concurrently with the rest of their batch;
//! afterwards every registered system is asked for a state snapshot, which is
//! appended to the response as `(system number, packet)`.

use crate::error::ServerError;
use async_trait::async_trait;
use burrow_protocol::{Id, PacketWriter, ProtocolError, WireReader};
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

/// Errors reported by a system.
#[derive(Debug, Error)]
pub enum SystemError {
    #[error("malformed command payload: {0}")]
    Payload(#[from] ProtocolError),

    #[error("command rejected: {0}")]
    Rejected(String),

    #[error("cancelled")]
    Cancelled,
}

/// One command addressed to a system.
#[derive(Debug, Clone)]
pub struct Command {
    pub caller_id: Id,
    pub session_id: Id,
    /// Fresh id issued for this command; echoed to the caller.
    pub command_instance_id: Id,
    pub request_number: u32,
    /// The command's payload packet body.
    pub payload: WireReader,
    /// Fires when the connection or server is going away.
    pub cancel: CancellationToken,
}

/// A handler registered under a unique system number.
#[async_trait]
pub trait System: Send + Sync + 'static {
    /// Routing number; unique within a registry.
    fn number(&self) -> u32;

    /// Short name for logs.
    fn name(&self) -> &str {
        "system"
    }

    /// Applies one command.
    async fn process_command(&self, command: Command) -> Result<(), SystemError>;

    /// Returns a writer for this system's state as seen by `caller_id`, or
    /// `None` when there is nothing to report since `last_event_seen`.
    async fn state_writer(
        &self,
        last_event_seen: Id,
        caller_id: Id,
    ) -> Result<Option<PacketWriter>, SystemError>;
}

/// Immutable map from system number to handler.
#[derive(Clone, Default)]
pub struct SystemRegistry {
    systems: Arc<HashMap<u32, Arc<dyn System>>>,
}

impl std::fmt::Debug for SystemRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut numbers: Vec<_> = self.systems.keys().copied().collect();
        numbers.sort_unstable();
        f.debug_struct("SystemRegistry")
            .field("systems", &numbers)
            .finish()
    }
}

impl SystemRegistry {
    pub fn builder() -> SystemRegistryBuilder {
        SystemRegistryBuilder::default()
    }

    /// Builds a registry from `systems`, rejecting duplicate numbers.
    pub fn new(
        systems: impl IntoIterator<Item = Arc<dyn System>>,
    ) -> Result<Self, ServerError> {
        let mut builder = Self::builder();
        for system in systems {
            builder = builder.register(system)?;
        }
        Ok(builder.build())
    }

    pub fn get(&self, number: u32) -> Option<&Arc<dyn System>> {
        self.systems.get(&number)
    }

    /// Resolves `number` or fails with [`ServerError::UnknownSystem`].
    pub fn resolve(&self, number: u32) -> Result<Arc<dyn System>, ServerError> {
        self.systems
            .get(&number)
            .cloned()
            .ok_or(ServerError::UnknownSystem(number))
    }

    pub fn len(&self) -> usize {
        self.systems.len()
    }

    pub fn is_empty(&self) -> bool {
        self.systems.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (u32, &Arc<dyn System>)> {
        self.systems.iter().map(|(number, system)| (*number, system))
    }
}

/// Collects systems before the registry is frozen.
#[derive(Default)]
pub struct SystemRegistryBuilder {
    systems: HashMap<u32, Arc<dyn System>>,
}

impl SystemRegistryBuilder {
    pub fn register(mut self, system: Arc<dyn System>) -> Result<Self, ServerError> {
        let number = system.number();
        if self.systems.contains_key(&number) {
            return Err(ServerError::DuplicateSystem(number));
        }
        self.systems.insert(number, system);
        Ok(self)
    }

    pub fn build(self) -> SystemRegistry {
        SystemRegistry {
            systems: Arc::new(self.systems),
        }
    }
}
