//! ws-tcp-relay — entry point.
//!
//! This binary accepts WebSocket connections and relays each one to a raw TCP
//! (optionally TLS) backend.  Binary WebSocket frames from the client are
//! written to the backend unchanged; bytes from the backend are sent back as
//! binary frames.
//!
//! # Usage
//!
//! ```text
//! ws-tcp-relay --remote-addr <HOST:PORT> [OPTIONS]
//!
//! Options:
//!   --listen <ADDR>           WebSocket listener address [default: 0.0.0.0:8023]
//!   --http-path <PATH>        Path that accepts upgrades [default: /]
//!   --remote-addr <HOST:PORT> Backend address (required)
//!   --tls-target              Connect to the backend over TLS
//!   --no-ssl-verify           Skip backend certificate verification (TLS only)
//!   --idle-timeout <SECS>     End sessions idle for this long [default: never]
//!   --max-lifetime <SECS>     End sessions older than this [default: never]
//!   --metrics-listen <ADDR>   Prometheus exporter address, a separate port from
//!                             --listen [default: 0.0.0.0:8024]
//!   --no-metrics              Do not start the Prometheus exporter
//! ```
//!
//! # Environment variable overrides
//!
//! Every option can also be set through the environment.  CLI args take
//! precedence when both are present.
//!
//! The switches (`TLS_TARGET`, `NO_SSL_VERIFY`, `NO_METRICS`) are on for any
//! value except an empty one or a false-like word (`0`, `false`, `no`, `off`,
//! `f`, `n`).  An empty `HTTP_PATH` means `/`.
//!
//! | Variable            | Option             |
//! |---------------------|--------------------|
//! | `LISTEN_ADDR`       | `--listen`         |
//! | `HTTP_PATH`         | `--http-path`      |
//! | `REMOTE_ADDR`       | `--remote-addr`    |
//! | `TLS_TARGET`        | `--tls-target`     |
//! | `NO_SSL_VERIFY`     | `--no-ssl-verify`  |
//! | `IDLE_TIMEOUT_SECS` | `--idle-timeout`   |
//! | `MAX_LIFETIME_SECS` | `--max-lifetime`   |
//! | `METRICS_ADDR`      | `--metrics-listen` |
//! | `NO_METRICS`        | `--no-metrics`     |
//!
//! # Exit status
//!
//! The process exits non-zero only for startup problems: an invalid option,
//! a backend address that does not resolve, or a port that cannot be bound.
//! Failures of individual connections are logged and never stop the relay.

use std::net::SocketAddr;
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use std::time::Duration;

use anyhow::Context;
use clap::builder::FalseyValueParser;
use clap::{ArgAction, Parser};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use ws_tcp_relay::domain::config::DEFAULT_HTTP_PATH;
use ws_tcp_relay::domain::{BackendTarget, RelayConfig, SessionLimits, TlsMode};
use ws_tcp_relay::infrastructure::{install_exporter, resolve_backend, run_server, RelayMetrics};

// ── CLI argument definitions ──────────────────────────────────────────────────

/// WebSocket-to-TCP relay.
///
/// Accepts WebSocket connections and relays binary frames to a raw TCP or TLS
/// backend.
#[derive(Debug, Parser)]
#[command(
    name = "ws-tcp-relay",
    about = "Relay WebSocket connections to a raw TCP/TLS backend",
    version
)]
struct Cli {
    /// Address the WebSocket listener binds to.
    #[arg(long, default_value = "0.0.0.0:8023", env = "LISTEN_ADDR")]
    listen: String,

    /// HTTP path that accepts WebSocket upgrades.
    ///
    /// A path ending in `/` also accepts every path below it.  Empty means `/`.
    #[arg(long, default_value = "/", env = "HTTP_PATH")]
    http_path: String,

    /// Backend address as `host:port`.
    #[arg(long, env = "REMOTE_ADDR")]
    remote_addr: String,

    /// Connect to the backend over TLS.
    #[arg(
        long,
        env = "TLS_TARGET",
        action = ArgAction::SetTrue,
        value_parser = FalseyValueParser::new()
    )]
    tls_target: bool,

    /// Accept any backend certificate.  Only meaningful with `--tls-target`.
    #[arg(
        long,
        env = "NO_SSL_VERIFY",
        action = ArgAction::SetTrue,
        value_parser = FalseyValueParser::new()
    )]
    no_ssl_verify: bool,

    /// End a session after this many seconds without traffic.
    #[arg(long = "idle-timeout", env = "IDLE_TIMEOUT_SECS", value_name = "SECS")]
    idle_timeout_secs: Option<u64>,

    /// End a session after this many seconds, regardless of traffic.
    #[arg(long = "max-lifetime", env = "MAX_LIFETIME_SECS", value_name = "SECS")]
    max_lifetime_secs: Option<u64>,

    /// Address of the Prometheus metrics listener.
    ///
    /// `/metrics` is served on this port, not on the WebSocket listener.
    #[arg(long, default_value = "0.0.0.0:8024", env = "METRICS_ADDR")]
    metrics_listen: String,

    /// Do not start the Prometheus metrics listener.
    #[arg(
        long,
        env = "NO_METRICS",
        action = ArgAction::SetTrue,
        value_parser = FalseyValueParser::new()
    )]
    no_metrics: bool,
}

impl Cli {
    /// Converts the parsed arguments into a [`RelayConfig`].
    ///
    /// # Errors
    ///
    /// Returns an error if an address does not parse, the HTTP path does not
    /// start with `/`, or a timeout is zero.
    fn into_relay_config(mut self) -> anyhow::Result<RelayConfig> {
        let listen_addr: SocketAddr = self
            .listen
            .parse()
            .with_context(|| format!("invalid listen address: '{}'", self.listen))?;

        if self.http_path.is_empty() {
            self.http_path = DEFAULT_HTTP_PATH.to_string();
        }
        if !self.http_path.starts_with('/') {
            anyhow::bail!("HTTP path must start with '/': '{}'", self.http_path);
        }

        if self.no_ssl_verify && !self.tls_target {
            warn!("--no-ssl-verify has no effect without --tls-target");
        }
        let tls = TlsMode::from_flags(self.tls_target, self.no_ssl_verify);
        if tls == TlsMode::InsecureSkipVerify {
            warn!("backend certificate verification is disabled");
        }

        let limits = SessionLimits {
            idle_timeout: seconds("idle timeout", self.idle_timeout_secs)?,
            max_lifetime: seconds("max lifetime", self.max_lifetime_secs)?,
        };

        let metrics_addr = if self.no_metrics {
            None
        } else {
            let addr: SocketAddr = self.metrics_listen.parse().with_context(|| {
                format!("invalid metrics address: '{}'", self.metrics_listen)
            })?;
            Some(addr)
        };

        Ok(RelayConfig {
            listen_addr,
            http_path: self.http_path,
            backend: BackendTarget::new(self.remote_addr, tls),
            limits,
            metrics_addr,
        })
    }
}

/// Converts an optional number of seconds; zero is rejected rather than
/// silently meaning "immediately".
fn seconds(what: &str, secs: Option<u64>) -> anyhow::Result<Option<Duration>> {
    match secs {
        Some(0) => anyhow::bail!("{what} must be at least one second"),
        Some(s) => Ok(Some(Duration::from_secs(s))),
        None => Ok(None),
    }
}

// ── Entry point ───────────────────────────────────────────────────────────────

/// Program entry point.
///
/// # What happens at startup
///
/// 1. Logging is initialised; the level comes from `RUST_LOG` (default `info`).
/// 2. Arguments are parsed into a [`RelayConfig`].
/// 3. The backend address is resolved once; failure aborts startup.
/// 4. The Prometheus exporter is started unless disabled.
/// 5. A Ctrl+C handler clears the shared `running` flag.
/// 6. [`run_server`] accepts connections until the flag is cleared.
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = cli.into_relay_config()?;

    let resolved = resolve_backend(&config.backend).await?;
    info!(
        "ws-tcp-relay starting: listen={}, path={}, backend={} ({:?}) resolved to {:?}",
        config.listen_addr, config.http_path, config.backend.address, config.backend.tls, resolved
    );

    let metrics = Arc::new(RelayMetrics::new());
    if let Some(addr) = config.metrics_addr {
        install_exporter(addr)?;
    }

    // ── Graceful shutdown flag ─────────────────────────────────────────────────
    let running = Arc::new(AtomicBool::new(true));
    let running_clone = Arc::clone(&running);
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("received Ctrl+C, stopping accept loop");
                running_clone.store(false, Ordering::Relaxed);
            }
            Err(e) => {
                tracing::error!("failed to listen for Ctrl+C signal: {e}");
            }
        }
    });

    run_server(config, metrics, running).await?;

    info!("ws-tcp-relay stopped");
    Ok(())
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    use ws_tcp_relay::domain::config::path_matches;

    // Parsing reads the process environment; tests that change it must not
    // overlap with tests that parse.
    static ENV_LOCK: Mutex<()> = Mutex::new(());

    fn parse(extra: &[&str]) -> Cli {
        let _env = ENV_LOCK.lock().unwrap_or_else(|e| e.into_inner());
        parse_unlocked(extra)
    }

    fn parse_unlocked(extra: &[&str]) -> Cli {
        let mut args = vec!["ws-tcp-relay", "--remote-addr", "127.0.0.1:23"];
        args.extend_from_slice(extra);
        Cli::parse_from(args)
    }

    /// Parses with `key=value` set in the environment for the duration of
    /// the call.
    fn parse_with_env(key: &str, value: &str) -> Cli {
        let _env = ENV_LOCK.lock().unwrap_or_else(|e| e.into_inner());
        std::env::set_var(key, value);
        let cli = parse_unlocked(&[]);
        std::env::remove_var(key);
        cli
    }

    #[test]
    fn test_cli_defaults() {
        // Arrange / Act
        let cli = parse(&[]);

        // Assert
        assert_eq!(cli.listen, "0.0.0.0:8023");
        assert_eq!(cli.http_path, "/");
        assert!(!cli.tls_target);
        assert!(!cli.no_ssl_verify);
        assert_eq!(cli.idle_timeout_secs, None);
        assert_eq!(cli.max_lifetime_secs, None);
    }

    #[test]
    fn test_cli_remote_addr_is_kept_verbatim() {
        let cli = parse(&[]);
        assert_eq!(cli.remote_addr, "127.0.0.1:23");
    }

    #[test]
    fn test_into_relay_config_defaults() {
        let config = parse(&[]).into_relay_config().unwrap();

        assert_eq!(config.listen_addr.port(), 8023);
        assert_eq!(config.http_path, "/");
        assert_eq!(config.backend.tls, TlsMode::Plain);
        assert_eq!(config.limits, SessionLimits::default());
        assert_eq!(config.metrics_addr.map(|a| a.port()), Some(8024));
    }

    #[test]
    fn test_tls_target_verifies_by_default() {
        let config = parse(&["--tls-target"]).into_relay_config().unwrap();
        assert_eq!(config.backend.tls, TlsMode::Verified);
    }

    #[test]
    fn test_no_ssl_verify_requires_tls_target() {
        let config = parse(&["--no-ssl-verify"]).into_relay_config().unwrap();
        assert_eq!(config.backend.tls, TlsMode::Plain);

        let config = parse(&["--tls-target", "--no-ssl-verify"])
            .into_relay_config()
            .unwrap();
        assert_eq!(config.backend.tls, TlsMode::InsecureSkipVerify);
    }

    #[test]
    fn test_timeouts_are_converted_to_durations() {
        let config = parse(&["--idle-timeout", "300", "--max-lifetime", "3600"])
            .into_relay_config()
            .unwrap();
        assert_eq!(config.limits.idle_timeout, Some(Duration::from_secs(300)));
        assert_eq!(config.limits.max_lifetime, Some(Duration::from_secs(3600)));
    }

    #[test]
    fn test_zero_timeout_is_rejected() {
        assert!(parse(&["--idle-timeout", "0"]).into_relay_config().is_err());
        assert!(parse(&["--max-lifetime", "0"]).into_relay_config().is_err());
    }

    #[test]
    fn test_no_metrics_disables_exporter() {
        let config = parse(&["--no-metrics"]).into_relay_config().unwrap();
        assert_eq!(config.metrics_addr, None);
    }

    #[test]
    fn test_invalid_listen_addr_returns_error() {
        let result = parse(&["--listen", "not-an-address"]).into_relay_config();
        assert!(result.is_err());
    }

    #[test]
    fn test_http_path_without_leading_slash_returns_error() {
        let result = parse(&["--http-path", "tunnel"]).into_relay_config();
        assert!(result.is_err());
    }

    #[test]
    fn test_custom_http_path() {
        let config = parse(&["--http-path", "/tunnel"]).into_relay_config().unwrap();
        assert!(path_matches(&config.http_path, "/tunnel"));
        assert!(!path_matches(&config.http_path, "/"));
    }

    #[test]
    fn test_empty_http_path_means_root() {
        // Arrange / Act
        let config = parse(&["--http-path", ""]).into_relay_config().unwrap();

        // Assert
        assert_eq!(config.http_path, "/");
    }

    #[test]
    fn test_empty_http_path_env_means_root() {
        let config = parse_with_env("HTTP_PATH", "").into_relay_config().unwrap();
        assert_eq!(config.http_path, "/");
    }

    #[test]
    fn test_switch_env_vars_accept_any_truthy_value() {
        // Arrange / Act / Assert: deployments commonly use 1, yes or on
        for value in ["1", "yes", "on", "true", "enabled"] {
            assert!(parse_with_env("TLS_TARGET", value).tls_target, "TLS_TARGET={value}");
            assert!(parse_with_env("NO_SSL_VERIFY", value).no_ssl_verify, "NO_SSL_VERIFY={value}");
            assert!(parse_with_env("NO_METRICS", value).no_metrics, "NO_METRICS={value}");
        }
    }

    #[test]
    fn test_switch_env_vars_false_like_values_stay_off() {
        for value in ["", "0", "false", "no", "off"] {
            assert!(!parse_with_env("TLS_TARGET", value).tls_target, "TLS_TARGET={value:?}");
            assert!(!parse_with_env("NO_METRICS", value).no_metrics, "NO_METRICS={value:?}");
        }
    }

    #[test]
    fn test_tls_env_vars_build_skip_verify_mode() {
        let _env = ENV_LOCK.lock().unwrap_or_else(|e| e.into_inner());
        std::env::set_var("TLS_TARGET", "1");
        std::env::set_var("NO_SSL_VERIFY", "yes");
        let cli = parse_unlocked(&[]);
        std::env::remove_var("TLS_TARGET");
        std::env::remove_var("NO_SSL_VERIFY");

        let config = cli.into_relay_config().unwrap();
        assert_eq!(config.backend.tls, TlsMode::InsecureSkipVerify);
    }
}
