//! Response decoding.

use burrow_protocol::{Id, ProtocolError, SessionKey, WireReader};
use bytes::Bytes;

/// Acknowledgement of one command from the request batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Accepted {
    pub system_number: u32,
    pub request_number: u32,
    /// Id the server issued for the command.
    pub command_instance_id: Id,
}

/// A decoded response body.
#[derive(Debug, Clone)]
pub struct Response {
    /// One entry per command, in request order.
    pub accepted: Vec<Accepted>,
    /// State snapshots as `(system number, snapshot body)`. Order across
    /// systems is unspecified.
    pub updates: Vec<(u32, WireReader)>,
}

impl Response {
    /// Decodes a response body tagged with `key`, the complement of the
    /// request key.
    pub fn decode(body: Bytes, key: SessionKey) -> Result<Self, ProtocolError> {
        let mut reader = WireReader::new(body);
        let end = reader.enter_keyed_packet(key)?;

        let count = reader.read_u32()?;
        // Each acknowledgement is 24 bytes.
        let mut accepted = Vec::with_capacity((count as usize).min(reader.remaining() / 24));
        for _ in 0..count {
            accepted.push(Accepted {
                system_number: reader.read_u32()?,
                request_number: reader.read_u32()?,
                command_instance_id: reader.read_id()?,
            });
        }

        let mut updates = Vec::new();
        while !reader.is_empty() {
            let system_number = reader.read_u32()?;
            let update = reader.peel_packet()?;
            updates.push((system_number, update));
        }

        reader.exit_packet(end)?;
        Ok(Self { accepted, updates })
    }
}
