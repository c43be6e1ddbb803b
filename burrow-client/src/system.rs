//! Client-side system endpoints.

use burrow_protocol::{Id, WireReader};
use bytes::Bytes;
use parking_lot::Mutex;

/// Receives the state updates of one server-side system.
pub trait SystemClient: Send + Sync {
    /// Number of the system this client mirrors.
    fn number(&self) -> u32;

    /// Applies one state snapshot.
    fn apply_update(&self, update: WireReader);

    /// Called when the server accepts a command sent to this system.
    fn command_accepted(&self, _request_number: u32, _command_instance_id: Id) {}
}

/// Records every acknowledgement and update it receives.
#[derive(Debug, Default)]
pub struct RecordingClient {
    number: u32,
    accepted: Mutex<Vec<(u32, Id)>>,
    updates: Mutex<Vec<Bytes>>,
}

impl RecordingClient {
    pub fn new(number: u32) -> Self {
        Self {
            number,
            ..Default::default()
        }
    }

    /// Returns `(request number, command-instance id)` pairs in arrival order.
    pub fn accepted(&self) -> Vec<(u32, Id)> {
        self.accepted.lock().clone()
    }

    /// Returns the snapshot bodies in arrival order.
    pub fn updates(&self) -> Vec<Bytes> {
        self.updates.lock().clone()
    }

    pub fn last_update(&self) -> Option<Bytes> {
        self.updates.lock().last().cloned()
    }
}

impl SystemClient for RecordingClient {
    fn number(&self) -> u32 {
        self.number
    }

    fn apply_update(&self, update: WireReader) {
        let body = Bytes::copy_from_slice(update.remaining_slice());
        self.updates.lock().push(body);
    }

    fn command_accepted(&self, request_number: u32, command_instance_id: Id) {
        self.accepted
            .lock()
            .push((request_number, command_instance_id));
    }
}
