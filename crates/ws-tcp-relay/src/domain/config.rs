//! Relay configuration types.
//!
//! [`RelayConfig`] is the single source of truth for all runtime settings.  It
//! is built once at startup (from CLI arguments / environment variables in
//! `main.rs`) and then shared read-only by the accept loop, the dialer and
//! every session.
//!
//! Keeping configuration as a plain struct (no global state, no environment
//! variable reads inside the domain) makes the relay easy to embed in tests.

use std::net::SocketAddr;
use std::time::Duration;

/// Default address the WebSocket listener binds to.
pub const DEFAULT_LISTEN_ADDR: &str = "0.0.0.0:8023";

/// Default HTTP path that accepts WebSocket upgrades.
pub const DEFAULT_HTTP_PATH: &str = "/";

/// Default address of the Prometheus metrics listener.
pub const DEFAULT_METRICS_ADDR: &str = "0.0.0.0:8024";

// ── TLS mode ──────────────────────────────────────────────────────────────────

/// How the relay secures its connection to the backend.
///
/// Skipping certificate verification is a separate variant rather than a
/// boolean next to the TLS flag, so it can only ever be selected together with
/// TLS and never by accident.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TlsMode {
    /// Plain TCP.
    #[default]
    Plain,
    /// TLS with full certificate-chain validation against the Mozilla roots.
    Verified,
    /// TLS that accepts any server certificate (self-signed backends).
    InsecureSkipVerify,
}

impl TlsMode {
    /// Builds the mode from the two configuration flags.
    ///
    /// `skip_verify` only has an effect when `tls_target` is set.
    pub fn from_flags(tls_target: bool, skip_verify: bool) -> Self {
        match (tls_target, skip_verify) {
            (false, _) => Self::Plain,
            (true, false) => Self::Verified,
            (true, true) => Self::InsecureSkipVerify,
        }
    }

    /// Returns `true` when the backend connection is wrapped in TLS.
    pub fn is_encrypted(self) -> bool {
        !matches!(self, Self::Plain)
    }

    /// Returns `true` when the server certificate chain is validated.
    pub fn verifies_certificates(self) -> bool {
        matches!(self, Self::Verified)
    }
}

// ── Backend target ────────────────────────────────────────────────────────────

/// The backend every session is relayed to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendTarget {
    /// `host:port` string, resolved on every dial.
    pub address: String,
    /// Transport security for the backend connection.
    pub tls: TlsMode,
}

impl BackendTarget {
    pub fn new(address: impl Into<String>, tls: TlsMode) -> Self {
        Self {
            address: address.into(),
            tls,
        }
    }

    /// Returns the host part of [`address`](Self::address), without the port
    /// and without IPv6 brackets.
    ///
    /// This is the name presented to the backend during the TLS handshake.
    ///
    /// ```rust
    /// use ws_tcp_relay::domain::{BackendTarget, TlsMode};
    ///
    /// let target = BackendTarget::new("[::1]:5432", TlsMode::Verified);
    /// assert_eq!(target.host(), "::1");
    /// ```
    pub fn host(&self) -> &str {
        let host = match self.address.rsplit_once(':') {
            Some((host, port)) if !port.contains(']') => host,
            _ => self.address.as_str(),
        };
        host.trim_start_matches('[').trim_end_matches(']')
    }
}

// ── Session limits ────────────────────────────────────────────────────────────

/// Optional limits on how long a session may live.
///
/// Both are disabled by default: a session then lives exactly as long as both
/// of its connections stay healthy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SessionLimits {
    /// End the session when no data has moved in either direction for this long.
    pub idle_timeout: Option<Duration>,
    /// End the session after this total duration, regardless of activity.
    pub max_lifetime: Option<Duration>,
}

// ── Relay configuration ───────────────────────────────────────────────────────

/// All runtime configuration for the relay.
///
/// Build this once at startup and wrap it in an `Arc` so it can be shared
/// cheaply across all connection tasks.
///
/// # Example
///
/// ```rust
/// use ws_tcp_relay::domain::{BackendTarget, RelayConfig, TlsMode};
///
/// let cfg = RelayConfig::new(BackendTarget::new("127.0.0.1:23", TlsMode::Plain));
/// assert_eq!(cfg.listen_addr.port(), 8023);
/// assert_eq!(cfg.http_path, "/");
/// ```
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Address the WebSocket listener binds to.
    pub listen_addr: SocketAddr,

    /// HTTP path that accepts WebSocket upgrades.
    ///
    /// A path ending in `/` matches every request path below it; any other
    /// path must match exactly.
    pub http_path: String,

    /// Where sessions are relayed to.
    pub backend: BackendTarget,

    /// Optional idle / lifetime limits applied to every session.
    pub limits: SessionLimits,

    /// Address of the Prometheus exporter, or `None` to not serve metrics.
    pub metrics_addr: Option<SocketAddr>,
}

impl RelayConfig {
    /// Returns a configuration for `backend` with every other setting at its
    /// default.
    ///
    /// | Field         | Default         |
    /// |---------------|-----------------|
    /// | listen_addr   | `0.0.0.0:8023`  |
    /// | http_path     | `/`             |
    /// | limits        | none            |
    /// | metrics_addr  | `0.0.0.0:8024`  |
    pub fn new(backend: BackendTarget) -> Self {
        Self {
            listen_addr: SocketAddr::from(([0, 0, 0, 0], 8023)),
            http_path: DEFAULT_HTTP_PATH.to_string(),
            backend,
            limits: SessionLimits::default(),
            metrics_addr: Some(SocketAddr::from(([0, 0, 0, 0], 8024))),
        }
    }
}

/// Matches a request path against a configured pattern.
///
/// Patterns ending in `/` match their whole subtree (so `/` matches
/// everything); other patterns match only themselves.
pub fn path_matches(pattern: &str, request_path: &str) -> bool {
    if pattern.ends_with('/') {
        request_path.starts_with(pattern)
    } else {
        request_path == pattern
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
