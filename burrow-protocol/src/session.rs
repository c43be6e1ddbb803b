//! Session key derivation.
//!
//! There is no login exchange yet: the key is derived from the session id
//! alone. The derivation sits behind [`SessionKeyResolver`] so a real
//! credential lookup can replace it without touching the framing code.

use crate::id::Id;

/// Symmetric key that tags the packets of one session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionKey(u64);

impl SessionKey {
    pub const fn new(value: u64) -> Self {
        Self(value)
    }

    pub fn value(&self) -> u64 {
        self.0
    }

    /// Key used for responses: the bitwise complement of the request key.
    pub fn response_key(&self) -> SessionKey {
        SessionKey(!self.0)
    }

    pub fn to_le_bytes(&self) -> [u8; 8] {
        self.0.to_le_bytes()
    }
}

/// Maps a session id to the key its packets are tagged with.
pub trait SessionKeyResolver: Send + Sync {
    /// Returns `None` when the session is unknown.
    fn resolve(&self, session_id: Id) -> Option<SessionKey>;
}

/// Placeholder derivation: XOR of the session id's two words.
#[derive(Debug, Default, Clone, Copy)]
pub struct XorKeyResolver;

impl SessionKeyResolver for XorKeyResolver {
    fn resolve(&self, session_id: Id) -> Option<SessionKey> {
        let [first, second] = session_id.words();
        Some(SessionKey(first ^ second))
    }
}
