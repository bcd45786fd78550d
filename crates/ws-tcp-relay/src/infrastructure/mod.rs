//! Infrastructure layer for ws-tcp-relay.
//!
//! The infrastructure layer handles all I/O.
//!
//! # Responsibilities
//!
//! - Binding the listener and performing the WebSocket upgrade ([`ws_server`])
//! - Opening TCP / TLS connections to the backend ([`dialer`])
//! - Relaying data between the two for each session ([`session`])
//! - Counting sessions and dial outcomes ([`metrics`])
//!
//! # What does NOT belong here?
//!
//! - Frame translation rules (that is the application layer)
//! - Configuration parsing (that is done in `main.rs`)

pub mod dialer;
pub mod metrics;
pub mod session;
pub mod ws_server;

pub use dialer::{resolve_backend, BackendDialer, BackendStream, DialError};
pub use metrics::{install_exporter, RelayMetrics};
pub use session::Session;
pub use ws_server::{run_server, serve};
