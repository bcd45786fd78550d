//! ws-tcp-relay library crate.
//!
//! This crate relays WebSocket connections to a raw TCP (optionally TLS)
//! backend, so that clients which can only open WebSocket connections (web
//! browsers, for example) can talk to services that only understand a plain
//! byte stream.
//!
//! # Architecture (clean architecture)
//!
//! ```text
//! WebSocket client (binary frames)
//!         ↕
//! [ws-tcp-relay]
//!   ├── domain/           Pure types: RelayConfig, session outcomes, frame actions
//!   ├── application/      Frame translation: WebSocket frames ↔ backend bytes
//!   └── infrastructure/
//!         ├── ws_server/  Accept loop, upgrade handshake (tokio-tungstenite)
//!         ├── dialer/     TCP / TLS connection to the backend (tokio-rustls)
//!         ├── session/    The two-direction relay for one connection pair
//!         └── metrics/    Active-session gauge and dial-outcome counter
//!         ↕
//! Backend service (raw TCP or TLS byte stream)
//! ```
//!
//! # Layer rules
//!
//! - `domain` has no I/O and no async code.
//! - `application` depends on `domain` and on the plain WebSocket message type
//!   only; it never touches a socket.
//! - `infrastructure` depends on all other layers plus `tokio`, `tungstenite`
//!   and `rustls`.

/// Domain layer: configuration and value types (no I/O).
pub mod domain;

/// Application layer: frame translation logic.
pub mod application;

/// Infrastructure layer: server, dialer, session relay and metrics.
pub mod infrastructure;
