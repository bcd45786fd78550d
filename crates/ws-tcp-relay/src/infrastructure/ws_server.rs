//! WebSocket server: accept loop and per-connection handling.
//!
//! This module is responsible for:
//!
//! 1. Binding a TCP listener on the configured address.
//! 2. Accepting incoming TCP connections.
//! 3. Upgrading each connection to a WebSocket, on the configured path only.
//! 4. Dialing the backend for each upgraded connection.
//! 5. Running a [`Session`] for the pair until either side is done.
//! 6. Stopping the accept loop when the `running` flag is cleared.
//!
//! # Failure handling
//!
//! Everything that can go wrong for one connection stays with that
//! connection: a failed upgrade or a failed dial is logged, the connection is
//! closed, and the accept loop carries on with the next client.
//!
//! # Handshake
//!
//! - Requests for any other path are answered with `404 Not Found`.
//! - A request carrying an `Origin` header whose host differs from the `Host`
//!   header is answered with `403 Forbidden`, so an arbitrary web page cannot
//!   open a session from a visitor's browser.  Requests without `Origin`
//!   (non-browser clients) are accepted.
//! - If the client offers the `binary` subprotocol it is selected; otherwise no
//!   subprotocol is negotiated.

use std::net::SocketAddr;
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use std::time::Duration;

use anyhow::Context;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::header::{HOST, ORIGIN, SEC_WEBSOCKET_PROTOCOL};
use tokio_tungstenite::tungstenite::http::{HeaderValue, StatusCode, Uri};
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tokio_tungstenite::tungstenite::Error as WsError;
use tokio_tungstenite::{accept_hdr_async_with_config, WebSocketStream};
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::domain::config::{path_matches, RelayConfig};
use crate::infrastructure::dialer::BackendDialer;
use crate::infrastructure::metrics::RelayMetrics;
use crate::infrastructure::session::{Session, CLOSE_TIMEOUT};

/// The only subprotocol the relay speaks.
pub const SUBPROTOCOL: &str = "binary";

/// WebSocket write buffer size, in bytes.
pub const WS_BUFFER_SIZE: usize = 1024;

/// How often the accept loop wakes up to check the shutdown flag.
const ACCEPT_POLL: Duration = Duration::from_millis(200);

// ── Public API ────────────────────────────────────────────────────────────────

/// Binds `config.listen_addr` and runs the accept loop until `running` is
/// set to `false`.
///
/// # Errors
///
/// Returns an error if the listener cannot be bound, or if the backend TLS
/// settings are invalid (see [`serve`]).
pub async fn run_server(
    config: RelayConfig,
    metrics: Arc<RelayMetrics>,
    running: Arc<AtomicBool>,
) -> anyhow::Result<()> {
    let listener = TcpListener::bind(config.listen_addr)
        .await
        .with_context(|| format!("failed to bind WebSocket listener on {}", config.listen_addr))?;

    serve(listener, config, metrics, running).await
}

/// Runs the accept loop on an already bound listener.
///
/// Each accepted connection is handed to its own Tokio task, so one slow
/// client never holds up the others.
///
/// # Errors
///
/// Returns an error if the backend dialer cannot be built (an invalid TLS
/// server name, for example).  Per-connection failures never end the loop.
pub async fn serve(
    listener: TcpListener,
    config: RelayConfig,
    metrics: Arc<RelayMetrics>,
    running: Arc<AtomicBool>,
) -> anyhow::Result<()> {
    let dialer = BackendDialer::new(config.backend.clone(), metrics)
        .context("invalid backend configuration")?;

    match listener.local_addr() {
        Ok(addr) => info!(
            "WebSocket relay listening on {addr}{} → {} ({:?})",
            config.http_path, config.backend.address, config.backend.tls
        ),
        Err(e) => warn!("listener address unavailable: {e}"),
    }

    let ctx = Arc::new(ConnectionContext { config, dialer });

    loop {
        if !running.load(Ordering::Relaxed) {
            info!("shutdown flag set; stopping accept loop");
            break;
        }

        match timeout(ACCEPT_POLL, listener.accept()).await {
            Ok(Ok((stream, peer))) => {
                let ctx = Arc::clone(&ctx);
                tokio::spawn(handle_connection(stream, peer, ctx));
            }
            Ok(Err(e)) => {
                // Transient (e.g. too many open files); keep serving.
                error!("accept error: {e}");
            }
            Err(_) => {
                // No connection within ACCEPT_POLL; re-check the flag.
            }
        }
    }

    Ok(())
}

// ── Per-connection handler ────────────────────────────────────────────────────

/// Read-only state shared by every connection task.
struct ConnectionContext {
    config: RelayConfig,
    dialer: BackendDialer,
}

/// Upgrade, dial, relay.  Never fails: every outcome is logged here.
async fn handle_connection(stream: TcpStream, peer: SocketAddr, ctx: Arc<ConnectionContext>) {
    let session_id = Uuid::new_v4();
    let span = info_span!("session", id = %session_id, %peer);

    async move {
        if let Err(e) = stream.set_nodelay(true) {
            warn!("could not set TCP_NODELAY on client socket: {e}");
        }

        let mut ws = match accept_websocket(stream, &ctx.config.http_path).await {
            Ok(ws) => ws,
            Err(e) => {
                warn!("WebSocket upgrade failed: {e}");
                return;
            }
        };
        info!("WebSocket established");

        let backend = match ctx.dialer.dial().await {
            Ok(backend) => backend,
            Err(e) => {
                warn!("{:#}", anyhow::Error::from(e));
                // No in-band error reporting: the client just sees the close.
                if let Ok(Err(e)) = timeout(CLOSE_TIMEOUT, ws.close(None)).await {
                    warn!("closing WebSocket after failed dial: {e}");
                }
                return;
            }
        };
        info!(
            "connected to backend {} (tls: {})",
            ctx.dialer.target().address,
            backend.is_encrypted()
        );

        let active = ctx.dialer.metrics().session_started();
        let end = Session::new(ws, backend, ctx.config.limits, active)
            .run()
            .await;

        if end.is_clean() {
            info!("session ended: {end}");
        } else {
            warn!("session ended: {end}");
        }
    }
    .instrument(span)
    .await
}

/// Completes the WebSocket handshake on `stream` if the request targets
/// `http_path`.
///
/// # Errors
///
/// Returns the handshake error; for a wrong path the client has already
/// been sent a `404 Not Found` response, and for a foreign `Origin` a
/// `403 Forbidden` response.
pub async fn accept_websocket<S>(
    stream: S,
    http_path: &str,
) -> Result<WebSocketStream<S>, WsError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let path = http_path.to_owned();
    let callback = move |req: &Request, mut response: Response| -> Result<Response, ErrorResponse> {
        if !path_matches(&path, req.uri().path()) {
            return Err(not_found());
        }
        if !is_same_origin(req) {
            return Err(forbidden());
        }
        if offers_subprotocol(req, SUBPROTOCOL) {
            response
                .headers_mut()
                .insert(SEC_WEBSOCKET_PROTOCOL, HeaderValue::from_static(SUBPROTOCOL));
        }
        Ok(response)
    };

    accept_hdr_async_with_config(stream, callback, Some(websocket_config())).await
}

// ── Helpers ───────────────────────────────────────────────────────────────────

fn websocket_config() -> WebSocketConfig {
    let mut config = WebSocketConfig::default();
    config.write_buffer_size = WS_BUFFER_SIZE;
    config
}

fn not_found() -> ErrorResponse {
    let mut response = ErrorResponse::new(Some("404 page not found".to_string()));
    *response.status_mut() = StatusCode::NOT_FOUND;
    response
}

fn forbidden() -> ErrorResponse {
    let mut response = ErrorResponse::new(Some("403 origin not allowed".to_string()));
    *response.status_mut() = StatusCode::FORBIDDEN;
    response
}

/// Returns `true` if the request has no `Origin` header, or if the origin's
/// host (and port) equals the `Host` header, ignoring ASCII case.
fn is_same_origin(req: &Request) -> bool {
    let Some(origin) = req.headers().get(ORIGIN) else {
        return true;
    };
    let origin_host = origin
        .to_str()
        .ok()
        .and_then(|origin| origin.parse::<Uri>().ok())
        .filter(|uri| uri.scheme().is_some())
        .and_then(|uri| uri.authority().map(|a| a.as_str().to_owned()));
    let host = req.headers().get(HOST).and_then(|h| h.to_str().ok());

    match (origin_host, host) {
        (Some(origin_host), Some(host)) => origin_host.eq_ignore_ascii_case(host),
        _ => false,
    }
}

/// Returns `true` if any `Sec-WebSocket-Protocol` header lists `protocol`.
fn offers_subprotocol(req: &Request, protocol: &str) -> bool {
    req.headers()
        .get_all(SEC_WEBSOCKET_PROTOCOL)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .any(|offered| offered.trim() == protocol)
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_tungstenite::client_async;
    use tokio_tungstenite::tungstenite::client::IntoClientRequest;

    fn request_with_protocols(values: &[&str]) -> Request {
        let mut builder = Request::builder().uri("/");
        for v in values {
            builder = builder.header(SEC_WEBSOCKET_PROTOCOL, *v);
        }
        builder.body(()).unwrap()
    }

    #[test]
    fn test_offers_subprotocol_single_value() {
        let req = request_with_protocols(&["binary"]);
        assert!(offers_subprotocol(&req, "binary"));
    }

    #[test]
    fn test_offers_subprotocol_comma_separated_list() {
        let req = request_with_protocols(&["chat, binary"]);
        assert!(offers_subprotocol(&req, "binary"));
    }

    #[test]
    fn test_offers_subprotocol_repeated_headers() {
        let req = request_with_protocols(&["chat", "binary"]);
        assert!(offers_subprotocol(&req, "binary"));
    }

    #[test]
    fn test_offers_subprotocol_absent() {
        assert!(!offers_subprotocol(&request_with_protocols(&[]), "binary"));
        assert!(!offers_subprotocol(&request_with_protocols(&["base64"]), "binary"));
    }

    #[test]
    fn test_not_found_response() {
        let response = not_found();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert!(response.body().is_some());
    }

    fn request_with_origin(host: &str, origin: Option<&str>) -> Request {
        let mut builder = Request::builder().uri("/").header(HOST, host);
        if let Some(origin) = origin {
            builder = builder.header(ORIGIN, origin);
        }
        builder.body(()).unwrap()
    }

    #[test]
    fn test_same_origin_is_allowed() {
        assert!(is_same_origin(&request_with_origin("relay.test", Some("https://relay.test"))));
        assert!(is_same_origin(&request_with_origin(
            "relay.test:8023",
            Some("http://RELAY.test:8023")
        )));
    }

    #[test]
    fn test_missing_origin_is_allowed() {
        assert!(is_same_origin(&request_with_origin("relay.test", None)));
    }

    #[test]
    fn test_cross_origin_is_rejected() {
        assert!(!is_same_origin(&request_with_origin("relay.test", Some("http://evil.example"))));
        // Same host, different port is a different origin.
        assert!(!is_same_origin(&request_with_origin(
            "relay.test:8023",
            Some("http://relay.test:9000")
        )));
        assert!(!is_same_origin(&request_with_origin("relay.test", Some("null"))));
        assert!(!is_same_origin(&request_with_origin("relay.test", Some("relay.test"))));
    }

    #[test]
    fn test_forbidden_response() {
        let response = forbidden();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
        assert!(response.body().is_some());
    }

    #[test]
    fn test_websocket_config_uses_small_write_buffer() {
        assert_eq!(websocket_config().write_buffer_size, WS_BUFFER_SIZE);
    }

    #[tokio::test]
    async fn test_handshake_selects_binary_subprotocol() {
        // Arrange: an in-memory connection between client and server
        let (client_io, server_io) = tokio::io::duplex(16 * 1024);
        let server = tokio::spawn(async move { accept_websocket(server_io, "/").await });

        let mut request = "ws://relay.test/".into_client_request().unwrap();
        request
            .headers_mut()
            .insert(SEC_WEBSOCKET_PROTOCOL, HeaderValue::from_static("binary"));

        // Act
        let (_client, response) = client_async(request, client_io).await.unwrap();

        // Assert
        assert_eq!(
            response.headers().get(SEC_WEBSOCKET_PROTOCOL).unwrap(),
            "binary"
        );
        assert!(server.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_handshake_without_offer_selects_nothing() {
        let (client_io, server_io) = tokio::io::duplex(16 * 1024);
        let server = tokio::spawn(async move { accept_websocket(server_io, "/").await });

        let (_client, response) = client_async("ws://relay.test/", client_io).await.unwrap();

        assert!(response.headers().get(SEC_WEBSOCKET_PROTOCOL).is_none());
        assert!(server.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_handshake_from_foreign_origin_is_forbidden() {
        // Arrange: a browser on another site tries to open a session
        let (client_io, server_io) = tokio::io::duplex(16 * 1024);
        let server = tokio::spawn(async move { accept_websocket(server_io, "/").await });

        let mut request = "ws://relay.test/".into_client_request().unwrap();
        request
            .headers_mut()
            .insert(ORIGIN, HeaderValue::from_static("http://evil.example"));

        // Act
        let result = client_async(request, client_io).await;

        // Assert
        match result {
            Err(WsError::Http(response)) => assert_eq!(response.status(), StatusCode::FORBIDDEN),
            other => panic!("expected HTTP 403, got {other:?}"),
        }
        assert!(server.await.unwrap().is_err());
    }

    #[tokio::test]
    async fn test_handshake_from_own_origin_is_accepted() {
        let (client_io, server_io) = tokio::io::duplex(16 * 1024);
        let server = tokio::spawn(async move { accept_websocket(server_io, "/").await });

        let mut request = "ws://relay.test/".into_client_request().unwrap();
        request
            .headers_mut()
            .insert(ORIGIN, HeaderValue::from_static("http://relay.test"));

        assert!(client_async(request, client_io).await.is_ok());
        assert!(server.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_handshake_on_wrong_path_is_rejected() {
        let (client_io, server_io) = tokio::io::duplex(16 * 1024);
        let server = tokio::spawn(async move { accept_websocket(server_io, "/tunnel").await });

        let result = client_async("ws://relay.test/other", client_io).await;

        match result {
            Err(WsError::Http(response)) => assert_eq!(response.status(), StatusCode::NOT_FOUND),
            other => panic!("expected HTTP 404, got {other:?}"),
        }
        assert!(server.await.unwrap().is_err());
    }
}
