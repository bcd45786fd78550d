//! Application layer for ws-tcp-relay.
//!
//! The application layer decides *what* happens to each piece of data; the
//! infrastructure layer decides *how* it moves.
//!
//! # Responsibilities
//!
//! - Mapping each inbound WebSocket frame to an [`InboundAction`](crate::domain::InboundAction)
//! - Wrapping backend byte chunks into outbound WebSocket messages
//!
//! # What does NOT belong here?
//!
//! - Opening sockets or listening for connections (that is infrastructure)
//! - Tokio task spawning (that happens in the infrastructure layer)
//! - WebSocket framing (handled by tokio-tungstenite)

pub mod translator;

pub use translator::{translate_inbound, translate_outbound};
