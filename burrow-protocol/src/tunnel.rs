//! HTTP disguise framing.
//!
//! This is not an HTTP parser. A request is located by its end-of-head
//! marker and its `Content-Length` value; all other header text is ignored:
//!
//! ```text
//! POST / HTTP/1.1\r\n
//! Host: <host>\r\n
//! Content-Type: binary\r\n
//! Content-Length: <N>\r\n
//! \r\n
//! <N body bytes>
//! ```
//!
//! Responses carry no blank line. The head ends with the CR LF that
//! terminates the `Content-Length` value:
//!
//! ```text
//! 200 OK\r\nContent-Type: binary\r\nContent-Length: <M>\r\n<M body bytes>
//! 400 BAD REQUEST\r\n
//! ```

use crate::error::ProtocolError;
use crate::{MAX_HEAD_SIZE, MAX_REQUEST_SIZE, MIN_CONTENT_LENGTH, RECEIVE_BUFFER_SIZE};
use bytes::{Buf, Bytes, BytesMut};
use serde::{Deserialize, Serialize};

/// End-of-head marker.
pub const HEAD_TERMINATOR: &[u8; 4] = b"\r\n\r\n";

/// Complete rejection response.
pub const BAD_REQUEST: &[u8] = b"400 BAD REQUEST\r\n";

const CONTENT_LENGTH_UPPER: &[u8; 14] = b"CONTENT-LENGTH";
const CONTENT_LENGTH_LOWER: &[u8; 14] = b"content-length";

const STATUS_OK: &[u8] = b"200";
const STATUS_BAD_REQUEST: &[u8] = b"400";

/// Builds the head of a request carrying `content_length` body bytes.
pub fn request_head(host: &str, content_length: usize) -> String {
    format!(
        "POST / HTTP/1.1\r\nHost: {}\r\nContent-Type: binary\r\nContent-Length: {}\r\n\r\n",
        host, content_length
    )
}

/// Builds the head of a successful response carrying `content_length` bytes.
pub fn ok_response_head(content_length: usize) -> String {
    format!(
        "200 OK\r\nContent-Type: binary\r\nContent-Length: {}\r\n",
        content_length
    )
}

/// Matches "Content-Length" byte-for-byte against both cases, so no text
/// decoding is needed.
fn is_content_length(name: &[u8]) -> bool {
    name.len() == CONTENT_LENGTH_LOWER.len()
        && name
            .iter()
            .zip(CONTENT_LENGTH_LOWER.iter().zip(CONTENT_LENGTH_UPPER.iter()))
            .all(|(&c, (&lower, &upper))| c == lower || c == upper)
}

/// Parses the decimal value following a header colon at `colon`, stopping at
/// `end`. Leading spaces are skipped.
fn parse_length(bytes: &[u8], colon: usize, end: usize) -> Result<usize, ProtocolError> {
    let mut i = colon + 1;
    while i < end && bytes[i] == b' ' {
        i += 1;
    }

    let digits_start = i;
    let mut value: usize = 0;
    while i < end && bytes[i].is_ascii_digit() {
        value = value
            .checked_mul(10)
            .and_then(|v| v.checked_add((bytes[i] - b'0') as usize))
            .ok_or(ProtocolError::InvalidContentLength)?;
        i += 1;
    }

    if i == digits_start {
        return Err(ProtocolError::InvalidContentLength);
    }
    Ok(value)
}

/// Which content-length bound is checked first.
///
/// Only matters for which error is reported when both bounds are violated,
/// which happens when the configured minimum exceeds the maximum.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LengthCheckOrder {
    #[default]
    MinimumFirst,
    MaximumFirst,
}

/// Bounds enforced while framing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FramerLimits {
    /// Smallest acceptable body.
    pub min_content_length: usize,
    /// Largest acceptable body.
    pub max_content_length: usize,
    /// Largest head accepted before the terminator appears.
    pub max_head_size: usize,
    /// Order of the two length checks.
    pub check_order: LengthCheckOrder,
}

impl Default for FramerLimits {
    fn default() -> Self {
        Self {
            min_content_length: MIN_CONTENT_LENGTH,
            max_content_length: MAX_REQUEST_SIZE,
            max_head_size: MAX_HEAD_SIZE,
            check_order: LengthCheckOrder::MinimumFirst,
        }
    }
}

impl FramerLimits {
    fn check_minimum(&self, length: usize) -> Result<(), ProtocolError> {
        if length < self.min_content_length {
            return Err(ProtocolError::ContentTooSmall {
                length,
                min: self.min_content_length,
            });
        }
        Ok(())
    }

    fn check_maximum(&self, length: usize) -> Result<(), ProtocolError> {
        if length > self.max_content_length {
            return Err(ProtocolError::ContentTooLarge {
                length,
                max: self.max_content_length,
            });
        }
        Ok(())
    }

    /// Validates a declared content length.
    pub fn check(&self, length: usize) -> Result<(), ProtocolError> {
        match self.check_order {
            LengthCheckOrder::MinimumFirst => {
                self.check_minimum(length)?;
                self.check_maximum(length)
            }
            LengthCheckOrder::MaximumFirst => {
                self.check_maximum(length)?;
                self.check_minimum(length)
            }
        }
    }
}

/// One framed request.
#[derive(Debug, Clone)]
pub struct TunnelMessage {
    /// Header text, without the terminator.
    pub head: Bytes,
    /// Exactly `Content-Length` body bytes.
    pub body: Bytes,
}

/// Incremental request framer for a keep-alive stream.
#[derive(Debug)]
pub struct TunnelFramer {
    buf: BytesMut,
    /// Next offset to test for the terminator.
    scan_pos: usize,
    /// Offset of the terminator once found.
    head_end: Option<usize>,
    /// Offset one past the last byte of the current message.
    message_end: usize,
    limits: FramerLimits,
}

impl TunnelFramer {
    pub fn new(limits: FramerLimits) -> Self {
        Self::with_capacity(limits, RECEIVE_BUFFER_SIZE)
    }

    pub fn with_capacity(limits: FramerLimits, capacity: usize) -> Self {
        Self {
            buf: BytesMut::with_capacity(capacity),
            scan_pos: 0,
            head_end: None,
            message_end: 0,
            limits,
        }
    }

    pub fn limits(&self) -> &FramerLimits {
        &self.limits
    }

    /// Appends received bytes.
    pub fn extend(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Returns the number of buffered bytes.
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Returns the declared body length once the head has been parsed.
    pub fn content_length(&self) -> Option<usize> {
        self.head_end
            .map(|head_end| self.message_end - head_end - HEAD_TERMINATOR.len())
    }

    /// Attempts to frame the next message.
    ///
    /// Returns `Ok(None)` when more data is needed. Bytes following the
    /// message stay buffered as the start of the next one.
    pub fn next_message(&mut self) -> Result<Option<TunnelMessage>, ProtocolError> {
        let head_end = match self.head_end {
            Some(head_end) => head_end,
            None => match self.scan_head()? {
                Some(head_end) => {
                    let length = self.find_content_length(head_end)?;
                    self.limits.check(length)?;
                    self.head_end = Some(head_end);
                    self.message_end = head_end + HEAD_TERMINATOR.len() + length;
                    head_end
                }
                None => return Ok(None),
            },
        };

        if self.buf.len() < self.message_end {
            return Ok(None);
        }

        let mut message = self.buf.split_to(self.message_end);
        let body = message.split_off(head_end + HEAD_TERMINATOR.len()).freeze();
        message.truncate(head_end);
        self.reset_state();

        Ok(Some(TunnelMessage {
            head: message.freeze(),
            body,
        }))
    }

    /// Scans forward for the terminator, resuming where the last scan stopped.
    fn scan_head(&mut self) -> Result<Option<usize>, ProtocolError> {
        while self.scan_pos + HEAD_TERMINATOR.len() <= self.buf.len() {
            if &self.buf[self.scan_pos..self.scan_pos + HEAD_TERMINATOR.len()] == HEAD_TERMINATOR {
                return Ok(Some(self.scan_pos));
            }
            self.scan_pos += 1;
        }

        if self.buf.len() > self.limits.max_head_size {
            return Err(ProtocolError::HeadTooLarge {
                size: self.buf.len(),
                max: self.limits.max_head_size,
            });
        }
        Ok(None)
    }

    /// Scans backward from the terminator for `Content-Length:` at the start
    /// of a line.
    fn find_content_length(&self, head_end: usize) -> Result<usize, ProtocolError> {
        let name_len = CONTENT_LENGTH_LOWER.len();
        let mut i = head_end;
        while i >= name_len {
            let start = i - name_len;
            let at_line_start = start == 0 || self.buf[start - 1] == b'\n';
            if self.buf[i] == b':'
                && at_line_start
                && is_content_length(&self.buf[start..i])
            {
                return parse_length(&self.buf, i, head_end);
            }
            i -= 1;
        }
        Err(ProtocolError::MissingContentLength)
    }

    fn reset_state(&mut self) {
        self.scan_pos = 0;
        self.head_end = None;
        self.message_end = 0;
    }

    /// Drops all buffered data and state.
    pub fn clear(&mut self) {
        self.buf.clear();
        self.reset_state();
    }
}

/// A framed response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TunnelResponse {
    /// `200 OK` with its body.
    Ok(Bytes),
    /// `400 BAD REQUEST`.
    BadRequest,
}

/// Incremental response framer used by clients.
#[derive(Debug)]
pub struct ResponseFramer {
    buf: BytesMut,
    max_content_length: usize,
    max_head_size: usize,
}

impl ResponseFramer {
    pub fn new(max_content_length: usize) -> Self {
        Self {
            buf: BytesMut::with_capacity(RECEIVE_BUFFER_SIZE),
            max_content_length,
            max_head_size: MAX_HEAD_SIZE,
        }
    }

    pub fn extend(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Attempts to frame the next response; `Ok(None)` means more data is
    /// needed.
    pub fn next_response(&mut self) -> Result<Option<TunnelResponse>, ProtocolError> {
        let Some(status_end) = find_crlf(&self.buf, 0) else {
            return self.need_more();
        };

        let status = &self.buf[..status_end];
        if status.starts_with(STATUS_BAD_REQUEST) {
            self.buf.advance(status_end + 2);
            return Ok(Some(TunnelResponse::BadRequest));
        }
        if !status.starts_with(STATUS_OK) {
            return Err(ProtocolError::MalformedStatus);
        }

        // Walk header lines until the Content-Length line completes the head.
        let mut line_start = status_end + 2;
        let (length, body_start) = loop {
            let Some(line_end) = find_crlf(&self.buf, line_start) else {
                return self.need_more();
            };
            if line_end == line_start {
                return Err(ProtocolError::MissingContentLength);
            }

            let line = &self.buf[line_start..line_end];
            if let Some(colon) = line.iter().position(|&b| b == b':') {
                if is_content_length(&line[..colon]) {
                    let length = parse_length(line, colon, line.len())?;
                    break (length, line_end + 2);
                }
            }
            line_start = line_end + 2;
        };

        if length > self.max_content_length {
            return Err(ProtocolError::ContentTooLarge {
                length,
                max: self.max_content_length,
            });
        }
        if self.buf.len() < body_start + length {
            return Ok(None);
        }

        self.buf.advance(body_start);
        let body = self.buf.split_to(length).freeze();
        Ok(Some(TunnelResponse::Ok(body)))
    }

    fn need_more(&self) -> Result<Option<TunnelResponse>, ProtocolError> {
        if self.buf.len() > self.max_head_size {
            return Err(ProtocolError::HeadTooLarge {
                size: self.buf.len(),
                max: self.max_head_size,
            });
        }
        Ok(None)
    }
}

fn find_crlf(bytes: &[u8], from: usize) -> Option<usize> {
    if from >= bytes.len() {
        return None;
    }
    bytes[from..]
        .windows(2)
        .position(|w| w == b"\r\n")
        .map(|pos| from + pos)
}
