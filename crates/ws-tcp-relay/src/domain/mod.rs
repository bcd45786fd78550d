//! Domain layer for ws-tcp-relay.
//!
//! The domain layer contains plain value types with no dependencies on I/O,
//! networking, or async runtimes.
//!
//! # What belongs in the domain layer?
//!
//! - Configuration structures ([`RelayConfig`], [`BackendTarget`], [`TlsMode`])
//! - The actions a WebSocket frame can map to ([`InboundAction`])
//! - Session lifecycle values ([`SessionState`], [`SessionEnd`])
//!
//! # What does NOT belong here?
//!
//! - Any `tokio`, `TcpStream`, or `WebSocket` types
//! - Environment variable reading (that is done in `main.rs`)

pub mod config;
pub mod frame;
pub mod session;

pub use config::{BackendTarget, RelayConfig, SessionLimits, TlsMode};
pub use frame::{FrameKind, InboundAction};
pub use session::{SessionEnd, SessionState};
