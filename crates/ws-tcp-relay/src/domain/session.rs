//! Session lifecycle values.
//!
//! A session moves through three states:
//!
//! ```text
//! Active ──(first close / error / limit on either side)──▶ Draining ──▶ Closed
//! ```
//!
//! In `Active` both relay directions run.  The first direction to finish (for
//! any reason) moves the session to `Draining`, where the other direction is
//! stopped and both connections are closed.  `Closed` is final: the active
//! session gauge has been decremented and nothing of the session remains.

use std::fmt;

/// Where a session is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Active,
    Draining,
    Closed,
}

/// Why a session ended.
///
/// This is a description for logs and tests, not an error: every way a
/// session can end is handled the same way (close both connections).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEnd {
    /// The client closed the WebSocket (Close frame or end of stream).
    ClientClosed,
    /// Receiving from or sending to the client failed.
    ClientError(String),
    /// The backend closed its side of the connection (EOF).
    BackendClosed,
    /// Reading from or writing to the backend failed.
    BackendError(String),
    /// No data moved in either direction for the configured idle timeout.
    IdleTimeout,
    /// The session reached its configured maximum lifetime.
    LifetimeExceeded,
}

impl SessionEnd {
    /// Returns `true` if the session ended without an I/O error.
    pub fn is_clean(&self) -> bool {
        !matches!(self, Self::ClientError(_) | Self::BackendError(_))
    }
}

impl fmt::Display for SessionEnd {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ClientClosed => f.write_str("client closed the connection"),
            Self::ClientError(e) => write!(f, "client connection error: {e}"),
            Self::BackendClosed => f.write_str("backend closed the connection"),
            Self::BackendError(e) => write!(f, "backend connection error: {e}"),
            Self::IdleTimeout => f.write_str("idle timeout elapsed"),
            Self::LifetimeExceeded => f.write_str("maximum session lifetime reached"),
        }
    }
}
