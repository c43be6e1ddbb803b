//! Packet codec.
//!
//! Packet layout (all integers little-endian):
//!
//! ```text
//! +-------------+-----------------------+
//! | len: u32    | body (len bytes)      |              plain packet
//! +-------------+-------------+---------+-------------+
//! | len: u32    | tag: u32    | body (len bytes)      | keyed packet
//! +-------------+-------------+-----------------------+
//! ```
//!
//! `len` counts body bytes only. A keyed packet's tag is CRC32C seeded with
//! the session key bytes and continued over the length prefix and the body,
//! so a reader holding a different key, or reading a modified span, fails.

use crate::error::ProtocolError;
use crate::id::Id;
use crate::session::SessionKey;
use bytes::{BufMut, Bytes, BytesMut};

/// Size of a plain packet prefix.
pub const PACKET_HEADER_SIZE: usize = 4;

/// Size of a keyed packet prefix (length + tag).
pub const KEYED_PACKET_HEADER_SIZE: usize = 8;

/// Deferred writer for a packet body.
pub type PacketWriter = Box<dyn FnOnce(&mut WireBuffer) + Send>;

fn packet_tag(key: SessionKey, length_prefix: &[u8], body: &[u8]) -> u32 {
    let crc = crc32c::crc32c(&key.to_le_bytes());
    let crc = crc32c::crc32c_append(crc, length_prefix);
    crc32c::crc32c_append(crc, body)
}

/// Position of an open plain packet.
#[derive(Debug)]
#[must_use = "an open packet must be closed"]
pub struct PacketMark {
    start: usize,
}

/// Position of an open keyed packet.
#[derive(Debug)]
#[must_use = "an open packet must be closed"]
pub struct KeyedPacketMark {
    start: usize,
}

/// End offset of a packet being read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[must_use = "an entered packet must be exited"]
pub struct PacketEnd {
    end: usize,
}

/// Growable write buffer.
///
/// Bytes are appended at the write cursor. [`WireBuffer::write_commit`] makes
/// everything written so far visible to [`WireBuffer::committed`];
/// [`WireBuffer::read_commit`] marks visible bytes as consumed, e.g. once
/// they have been flushed to a socket.
#[derive(Debug, Default)]
pub struct WireBuffer {
    buf: BytesMut,
    write_commit: usize,
    read_pos: usize,
}

impl WireBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buf: BytesMut::with_capacity(capacity),
            write_commit: 0,
            read_pos: 0,
        }
    }

    /// Returns the write cursor.
    pub fn write_position(&self) -> usize {
        self.buf.len()
    }

    /// Returns the end of the externally visible bytes.
    pub fn write_commit_position(&self) -> usize {
        self.write_commit
    }

    /// Returns the read (consumed) cursor.
    pub fn read_position(&self) -> usize {
        self.read_pos
    }

    /// Returns the number of committed bytes not yet consumed.
    pub fn readable(&self) -> usize {
        self.write_commit - self.read_pos
    }

    pub fn write_bytes(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    pub fn write_u32(&mut self, value: u32) {
        self.buf.put_u32_le(value);
    }

    pub fn write_u64(&mut self, value: u64) {
        self.buf.put_u64_le(value);
    }

    pub fn write_id(&mut self, id: Id) {
        for word in id.words() {
            self.write_u64(word);
        }
    }

    /// Reserves a length prefix for a plain packet.
    pub fn open_packet(&mut self) -> PacketMark {
        let start = self.buf.len();
        self.buf.put_u32_le(0);
        PacketMark { start }
    }

    /// Back-patches the length of a plain packet; returns the body length.
    pub fn close_packet(&mut self, mark: PacketMark) -> Result<usize, ProtocolError> {
        let body_start = mark.start + PACKET_HEADER_SIZE;
        let length = self.body_length(body_start)?;
        self.buf[mark.start..body_start].copy_from_slice(&length.to_le_bytes());
        Ok(length as usize)
    }

    /// Reserves a length prefix and tag for a keyed packet.
    pub fn open_keyed_packet(&mut self) -> KeyedPacketMark {
        let start = self.buf.len();
        self.buf.put_u32_le(0);
        self.buf.put_u32_le(0);
        KeyedPacketMark { start }
    }

    /// Back-patches length and tag of a keyed packet; returns the body length.
    pub fn close_keyed_packet(
        &mut self,
        mark: KeyedPacketMark,
        key: SessionKey,
    ) -> Result<usize, ProtocolError> {
        let tag_start = mark.start + PACKET_HEADER_SIZE;
        let body_start = mark.start + KEYED_PACKET_HEADER_SIZE;
        let length = self.body_length(body_start)?;
        self.buf[mark.start..tag_start].copy_from_slice(&length.to_le_bytes());
        let tag = packet_tag(
            key,
            &self.buf[mark.start..tag_start],
            &self.buf[body_start..],
        );
        self.buf[tag_start..body_start].copy_from_slice(&tag.to_le_bytes());
        Ok(length as usize)
    }

    /// Writes `body` as a complete plain packet.
    pub fn write_packet(&mut self, body: &[u8]) -> Result<(), ProtocolError> {
        let mark = self.open_packet();
        self.write_bytes(body);
        self.close_packet(mark)?;
        Ok(())
    }

    fn body_length(&self, body_start: usize) -> Result<u32, ProtocolError> {
        // A mark from before a reset points past the write cursor.
        if body_start > self.buf.len() {
            return Err(ProtocolError::UnbalancedPacket);
        }
        let size = self.buf.len() - body_start;
        u32::try_from(size).map_err(|_| ProtocolError::PacketTooLarge { size })
    }

    /// Discards uncommitted bytes past `position`. Committed bytes are kept.
    pub fn truncate(&mut self, position: usize) {
        self.buf.truncate(position.max(self.write_commit));
    }

    /// Makes everything written so far externally visible.
    pub fn write_commit(&mut self) {
        self.write_commit = self.buf.len();
    }

    /// Returns the committed bytes that have not been consumed yet.
    pub fn committed(&self) -> &[u8] {
        &self.buf[self.read_pos..self.write_commit]
    }

    /// Marks `count` committed bytes as consumed.
    pub fn read_commit(&mut self, count: usize) {
        self.read_pos = (self.read_pos + count).min(self.write_commit);
    }

    /// Copies the unconsumed committed bytes into a reader.
    pub fn reader(&self) -> WireReader {
        WireReader::new(Bytes::copy_from_slice(self.committed()))
    }

    /// Returns the buffer to its freshly constructed state, keeping capacity.
    pub fn reset(&mut self) {
        self.buf.clear();
        self.write_commit = 0;
        self.read_pos = 0;
    }
}

/// Zero-copy reader over a received body.
///
/// Reads are bounded by the innermost entered packet, or by the end of the
/// data when no packet is entered.
#[derive(Debug, Clone)]
pub struct WireReader {
    data: Bytes,
    pos: usize,
    limits: Vec<usize>,
    read_commit: usize,
}

impl WireReader {
    pub fn new(data: Bytes) -> Self {
        Self {
            data,
            pos: 0,
            limits: Vec::new(),
            read_commit: 0,
        }
    }

    pub fn position(&self) -> usize {
        self.pos
    }

    /// Moves the read cursor within the current bound.
    pub fn set_position(&mut self, pos: usize) -> Result<(), ProtocolError> {
        let limit = self.limit();
        if pos > limit {
            return Err(ProtocolError::Truncated {
                needed: pos,
                available: limit,
            });
        }
        self.pos = pos;
        Ok(())
    }

    fn limit(&self) -> usize {
        self.limits.last().copied().unwrap_or(self.data.len())
    }

    /// Returns the bytes left before the current bound.
    pub fn remaining(&self) -> usize {
        self.limit() - self.pos
    }

    pub fn is_empty(&self) -> bool {
        self.remaining() == 0
    }

    /// Returns the unread bytes up to the current bound.
    pub fn remaining_slice(&self) -> &[u8] {
        &self.data[self.pos..self.limit()]
    }

    fn take(&mut self, count: usize) -> Result<&[u8], ProtocolError> {
        let available = self.remaining();
        if count > available {
            return Err(ProtocolError::Truncated {
                needed: count,
                available,
            });
        }
        let start = self.pos;
        self.pos += count;
        Ok(&self.data[start..start + count])
    }

    fn take_array<const N: usize>(&mut self) -> Result<[u8; N], ProtocolError> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }

    pub fn read_u32(&mut self) -> Result<u32, ProtocolError> {
        Ok(u32::from_le_bytes(self.take_array()?))
    }

    pub fn read_u64(&mut self) -> Result<u64, ProtocolError> {
        Ok(u64::from_le_bytes(self.take_array()?))
    }

    pub fn read_id(&mut self) -> Result<Id, ProtocolError> {
        let first = self.read_u64()?;
        let second = self.read_u64()?;
        Ok(Id::new(first, second))
    }

    /// Reads `count` bytes without copying.
    pub fn read_bytes(&mut self, count: usize) -> Result<Bytes, ProtocolError> {
        let start = self.pos;
        self.take(count)?;
        Ok(self.data.slice(start..start + count))
    }

    fn read_length(&mut self) -> Result<usize, ProtocolError> {
        let length = self.read_u32()? as usize;
        Ok(length)
    }

    fn check_fits(&self, length: usize) -> Result<(), ProtocolError> {
        let remaining = self.remaining();
        if length > remaining {
            return Err(ProtocolError::PacketOverrun { length, remaining });
        }
        Ok(())
    }

    /// Enters a plain packet; reads are bounded by it until exited.
    pub fn enter_packet(&mut self) -> Result<PacketEnd, ProtocolError> {
        let length = self.read_length()?;
        self.check_fits(length)?;
        let end = self.pos + length;
        self.limits.push(end);
        Ok(PacketEnd { end })
    }

    /// Enters a keyed packet after validating its tag against `key`.
    pub fn enter_keyed_packet(&mut self, key: SessionKey) -> Result<PacketEnd, ProtocolError> {
        let start = self.pos;
        let length = self.read_length()?;
        let stored = self.read_u32()?;
        self.check_fits(length)?;

        let body_start = self.pos;
        let actual = packet_tag(
            key,
            &self.data[start..start + PACKET_HEADER_SIZE],
            &self.data[body_start..body_start + length],
        );
        if actual != stored {
            return Err(ProtocolError::TagMismatch {
                expected: stored,
                actual,
            });
        }

        let end = body_start + length;
        self.limits.push(end);
        Ok(PacketEnd { end })
    }

    /// Leaves the innermost packet, skipping any unread bytes in it.
    pub fn exit_packet(&mut self, end: PacketEnd) -> Result<(), ProtocolError> {
        match self.limits.last() {
            Some(&limit) if limit == end.end => {
                self.limits.pop();
                self.pos = limit;
                Ok(())
            }
            _ => Err(ProtocolError::UnbalancedPacket),
        }
    }

    /// Extracts the next plain packet as its own bounded reader.
    pub fn peel_packet(&mut self) -> Result<WireReader, ProtocolError> {
        let length = self.read_length()?;
        self.check_fits(length)?;
        let body = self.read_bytes(length)?;
        Ok(WireReader::new(body))
    }

    /// Marks everything read so far as consumed.
    pub fn read_commit(&mut self) {
        self.read_commit = self.pos;
    }

    pub fn read_commit_position(&self) -> usize {
        self.read_commit
    }

    /// Returns the whole underlying data, independent of the cursor.
    pub fn data(&self) -> &Bytes {
        &self.data
    }
}
