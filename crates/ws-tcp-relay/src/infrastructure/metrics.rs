//! Session metrics: the active-session gauge and the dial-outcome counter.
//!
//! [`RelayMetrics`] keeps the values in atomics, so any number of concurrently
//! running sessions can update them without a lock.  Every update is also
//! mirrored into the [`metrics`] facade, where the Prometheus exporter
//! installed by [`install_exporter`] picks it up.  When no exporter is
//! installed the facade calls are no-ops and the atomics remain the only
//! record (tests read them through [`RelayMetrics::snapshot`]).
//!
//! Exported series:
//!
//! | Name                 | Type    | Labels                         |
//! |----------------------|---------|--------------------------------|
//! | `connections_active` | gauge   |                                |
//! | `connections_total`  | counter | `result` = successful / failed |

use std::net::SocketAddr;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::Context;
use metrics_exporter_prometheus::PrometheusBuilder;
use tracing::info;

/// Active sessions (gauge).
pub const CONNECTIONS_ACTIVE: &str = "connections_active";
/// Backend dial attempts (counter, labels: result).
pub const CONNECTIONS_TOTAL: &str = "connections_total";

/// Result of one backend dial attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DialOutcome {
    Successful,
    Failed,
}

impl DialOutcome {
    /// Value of the `result` label.
    pub fn label(self) -> &'static str {
        match self {
            Self::Successful => "successful",
            Self::Failed => "failed",
        }
    }
}

/// Point-in-time copy of the metric values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MetricsSnapshot {
    pub active_sessions: i64,
    pub dials_successful: u64,
    pub dials_failed: u64,
}

/// Process-wide relay metrics.
///
/// Create one instance at startup and share it via `Arc`.
#[derive(Debug, Default)]
pub struct RelayMetrics {
    active_sessions: AtomicI64,
    dials_successful: AtomicU64,
    dials_failed: AtomicU64,
}

impl RelayMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Counts one dial attempt.
    pub fn record_dial(&self, outcome: DialOutcome) {
        let counter = match outcome {
            DialOutcome::Successful => &self.dials_successful,
            DialOutcome::Failed => &self.dials_failed,
        };
        counter.fetch_add(1, Ordering::Relaxed);
        metrics::counter!(CONNECTIONS_TOTAL, "result" => outcome.label()).increment(1);
    }

    /// Counts a new active session.
    ///
    /// The returned guard decrements the gauge when dropped, so the gauge
    /// goes down exactly once per session however the session ends.
    pub fn session_started(self: &Arc<Self>) -> ActiveSessionGuard {
        self.active_sessions.fetch_add(1, Ordering::Relaxed);
        metrics::gauge!(CONNECTIONS_ACTIVE).increment(1.0);
        ActiveSessionGuard {
            metrics: Arc::clone(self),
        }
    }

    fn session_ended(&self) {
        self.active_sessions.fetch_sub(1, Ordering::Relaxed);
        metrics::gauge!(CONNECTIONS_ACTIVE).decrement(1.0);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            active_sessions: self.active_sessions.load(Ordering::Relaxed),
            dials_successful: self.dials_successful.load(Ordering::Relaxed),
            dials_failed: self.dials_failed.load(Ordering::Relaxed),
        }
    }
}

/// Keeps one session counted in the active gauge for as long as it lives.
#[derive(Debug)]
pub struct ActiveSessionGuard {
    metrics: Arc<RelayMetrics>,
}

impl Drop for ActiveSessionGuard {
    fn drop(&mut self) {
        self.metrics.session_ended();
    }
}

/// Installs the global Prometheus recorder and starts its HTTP listener on
/// `addr`.  Must be called from inside the Tokio runtime, at most once.
///
/// # Errors
///
/// Returns an error if the listener cannot be bound or a recorder has already
/// been installed.
pub fn install_exporter(addr: SocketAddr) -> anyhow::Result<()> {
    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .with_context(|| format!("failed to start Prometheus exporter on {addr}"))?;

    metrics::describe_gauge!(CONNECTIONS_ACTIVE, "Number of active WS connections");
    metrics::describe_counter!(CONNECTIONS_TOTAL, "Total number of connections");

    info!("Prometheus metrics listening on {addr}");
    Ok(())
}

// ── Tests ─────────────────────────────────────────────────────────────────────
