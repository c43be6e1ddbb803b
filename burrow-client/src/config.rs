//! Client configuration.

use burrow_protocol::{
    Id, IdGenerator, RandomIdGenerator, SessionKeyResolver, XorKeyResolver, MAX_RESPONSE_SIZE,
    RECEIVE_BUFFER_SIZE,
};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

/// Default number of consecutive idle pumps before disconnecting.
pub const DEFAULT_AUTO_DISCONNECT_PUMPS: u32 = 10_000;

/// Minimum read buffer size (1 KiB).
pub const MIN_READ_BUFFER_SIZE: usize = 1024;

/// Connection configuration.
#[derive(Clone)]
pub struct ClientConfig {
    /// Server address.
    pub addr: SocketAddr,
    /// Value of the `Host` header.
    pub host: String,
    /// Session the requests belong to.
    pub session_id: Id,
    /// Caller identity sent with every request.
    pub caller_id: Id,
    /// Session id to key derivation; must match the server's.
    pub key_resolver: Arc<dyn SessionKeyResolver>,
    /// Consecutive pumps without sending or dispatching before the
    /// connection is dropped.
    pub auto_disconnect_pumps: u32,
    /// Connection timeout.
    pub connect_timeout: Duration,
    /// Read buffer size for socket reads.
    pub read_buffer_size: usize,
    /// Largest response body accepted.
    pub max_response_size: usize,
}

impl std::fmt::Debug for ClientConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientConfig")
            .field("addr", &self.addr)
            .field("host", &self.host)
            .field("session_id", &self.session_id)
            .field("caller_id", &self.caller_id)
            .field("auto_disconnect_pumps", &self.auto_disconnect_pumps)
            .field("connect_timeout", &self.connect_timeout)
            .field("read_buffer_size", &self.read_buffer_size)
            .field("max_response_size", &self.max_response_size)
            .finish()
    }
}

impl ClientConfig {
    /// Creates a configuration with a fresh random session and caller.
    pub fn new(addr: SocketAddr) -> Self {
        let ids = RandomIdGenerator;
        Self {
            addr,
            host: addr.to_string(),
            session_id: ids.next_id(),
            caller_id: ids.next_id(),
            key_resolver: Arc::new(XorKeyResolver),
            auto_disconnect_pumps: DEFAULT_AUTO_DISCONNECT_PUMPS,
            connect_timeout: Duration::from_secs(10),
            read_buffer_size: RECEIVE_BUFFER_SIZE,
            max_response_size: MAX_RESPONSE_SIZE,
        }
    }

    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.host = host.into();
        self
    }

    pub fn with_session_id(mut self, session_id: Id) -> Self {
        self.session_id = session_id;
        self
    }

    pub fn with_caller_id(mut self, caller_id: Id) -> Self {
        self.caller_id = caller_id;
        self
    }

    pub fn with_key_resolver(mut self, key_resolver: Arc<dyn SessionKeyResolver>) -> Self {
        self.key_resolver = key_resolver;
        self
    }

    pub fn with_auto_disconnect_pumps(mut self, pumps: u32) -> Self {
        self.auto_disconnect_pumps = pumps.max(1);
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_read_buffer_size(mut self, size: usize) -> Self {
        self.read_buffer_size = size.clamp(MIN_READ_BUFFER_SIZE, RECEIVE_BUFFER_SIZE);
        self
    }

    pub fn with_max_response_size(mut self, size: usize) -> Self {
        self.max_response_size = size;
        self
    }
}
