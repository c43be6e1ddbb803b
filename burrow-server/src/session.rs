//! Per-connection session state.

use crate::error::ServerError;
use burrow_protocol::{Id, SessionKey, SessionKeyResolver};
use std::net::SocketAddr;
use std::time::{Duration, Instant};

/// Session state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Connected, no request authenticated yet.
    Connected,
    /// At least one request carried a valid session id.
    Authenticated,
    /// The connection is being torn down.
    Closing,
}

/// State of one client connection.
///
/// The session key is resolved on the first request and reused for later
/// requests on the same keep-alive connection as long as the session id does
/// not change.
#[derive(Debug)]
pub struct Session {
    /// Remote address.
    pub remote_addr: SocketAddr,

    state: SessionState,

    session_id: Option<Id>,

    caller_id: Id,

    key: Option<SessionKey>,

    /// Request counter.
    request_count: u64,

    /// Session creation time.
    created_at: Instant,

    /// Last activity time.
    last_activity: Instant,
}

impl Session {
    /// Creates a new session.
    pub fn new(remote_addr: SocketAddr) -> Self {
        let now = Instant::now();
        Self {
            remote_addr,
            state: SessionState::Connected,
            session_id: None,
            caller_id: Id::NIL,
            key: None,
            request_count: 0,
            created_at: now,
            last_activity: now,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn set_state(&mut self, state: SessionState) {
        self.state = state;
    }

    pub fn session_id(&self) -> Option<Id> {
        self.session_id
    }

    pub fn caller_id(&self) -> Id {
        self.caller_id
    }

    pub fn key(&self) -> Option<SessionKey> {
        self.key
    }

    /// Returns the key for `session_id`, resolving it if it is not cached.
    pub fn key_for(
        &mut self,
        session_id: Id,
        resolver: &dyn SessionKeyResolver,
    ) -> Result<SessionKey, ServerError> {
        if let (Some(cached), Some(key)) = (self.session_id, self.key) {
            if cached == session_id {
                return Ok(key);
            }
        }

        let key = resolver.resolve(session_id).ok_or_else(|| {
            ServerError::Authentication(format!("unknown session {}", session_id))
        })?;
        self.session_id = Some(session_id);
        self.key = Some(key);
        Ok(key)
    }

    /// Records an authenticated request from `caller_id`.
    pub fn record_request(&mut self, caller_id: Id) {
        self.caller_id = caller_id;
        self.state = SessionState::Authenticated;
        self.request_count += 1;
        self.last_activity = Instant::now();
    }

    /// Notes socket activity that did not complete a request.
    pub fn touch(&mut self) {
        self.last_activity = Instant::now();
    }

    pub fn request_count(&self) -> u64 {
        self.request_count
    }

    /// Returns the time since last activity.
    pub fn idle_duration(&self) -> Duration {
        self.last_activity.elapsed()
    }

    /// Returns the session age.
    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }
}
