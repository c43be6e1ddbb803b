//! Built-in systems.

use crate::registry::{Command, System, SystemError};
use async_trait::async_trait;
use burrow_protocol::{Id, PacketWriter, WireBuffer};
use bytes::Bytes;
use parking_lot::Mutex;

/// Number the echo system registers under by default.
pub const ECHO_SYSTEM_NUMBER: u32 = 1;

#[derive(Debug, Default)]
struct EchoState {
    payload: Option<Bytes>,
    command_instance_id: Id,
    commands: u64,
}

/// Reports the most recent command payload back as its state.
///
/// Useful for smoke tests and as the smallest example of a [`System`].
#[derive(Debug)]
pub struct EchoSystem {
    number: u32,
    state: Mutex<EchoState>,
}

impl Default for EchoSystem {
    fn default() -> Self {
        Self::new(ECHO_SYSTEM_NUMBER)
    }
}

impl EchoSystem {
    pub fn new(number: u32) -> Self {
        Self {
            number,
            state: Mutex::new(EchoState::default()),
        }
    }

    /// Returns the id issued to the last command processed.
    pub fn last_command_instance_id(&self) -> Id {
        self.state.lock().command_instance_id
    }

    /// Returns the number of commands processed so far.
    pub fn commands_processed(&self) -> u64 {
        self.state.lock().commands
    }
}

#[async_trait]
impl System for EchoSystem {
    fn number(&self) -> u32 {
        self.number
    }

    fn name(&self) -> &str {
        "echo"
    }

    async fn process_command(&self, command: Command) -> Result<(), SystemError> {
        if command.cancel.is_cancelled() {
            return Err(SystemError::Cancelled);
        }

        let payload = command.payload.data().clone();
        tracing::debug!(
            "echo: command {} (request {}) carries {} bytes",
            command.command_instance_id,
            command.request_number,
            payload.len()
        );

        let mut state = self.state.lock();
        state.payload = Some(payload);
        state.command_instance_id = command.command_instance_id;
        state.commands += 1;
        Ok(())
    }

    async fn state_writer(
        &self,
        _last_event_seen: Id,
        _caller_id: Id,
    ) -> Result<Option<PacketWriter>, SystemError> {
        let payload = self.state.lock().payload.clone();
        Ok(payload.map(|payload| {
            Box::new(move |buf: &mut WireBuffer| buf.write_bytes(&payload)) as PacketWriter
        }))
    }
}
