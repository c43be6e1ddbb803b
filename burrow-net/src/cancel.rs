//! Cancellation signal.
//!
//! A [`CancellationToken`] is shared by everything that must stop together:
//! the server's accept loop and its connections, or one client connection and
//! its in-flight sends and receives. Child tokens scope cancellation to a
//! single connection without touching the parent.

pub use tokio_util::sync::CancellationToken;

/// Returns a token cancelled together with `parent` but cancellable alone.
pub fn scoped(parent: &CancellationToken) -> CancellationToken {
    parent.child_token()
}
