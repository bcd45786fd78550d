//! The relay for one WebSocket connection and one backend connection.
//!
//! A [`Session`] owns both connections for its whole life and moves data
//! between them in two directions at once:
//!
//! - **Inbound** (client → backend): receive one WebSocket message, translate
//!   it (see [`translate_inbound`]) and write binary payloads to the backend.
//!   Pings are answered on the WebSocket with a Pong carrying the same
//!   payload and never reach the backend.
//! - **Outbound** (backend → client): read up to [`READ_CHUNK_SIZE`] bytes
//!   from the backend and send them as one binary WebSocket message.
//!
//! # Teardown
//!
//! The two directions are raced against each other (and against the optional
//! idle / lifetime limits).  The first one to finish, for whatever reason,
//! ends the session: the other direction is dropped at its current await
//! point, which cancels its pending read or write, and then both connections
//! are closed once.  Neither direction can outlive the other, and there is no
//! half-open session left behind.
//!
//! Closing is best effort and bounded by [`CLOSE_TIMEOUT`]: the peer may
//! already be gone, in which case the close fails and is ignored.
//!
//! # Ordering
//!
//! Within one direction bytes are relayed in exactly the order they were
//! read.  Nothing is promised about the relative order of the two directions.

use std::future::pending;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex;
use tokio::time::{sleep, timeout, Instant};
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, trace};

use crate::application::{translate_inbound, translate_outbound};
use crate::domain::config::SessionLimits;
use crate::domain::frame::InboundAction;
use crate::domain::session::{SessionEnd, SessionState};
use crate::infrastructure::metrics::ActiveSessionGuard;

/// Size of the buffer used for each backend read.
pub const READ_CHUNK_SIZE: usize = 4096;

/// Upper bound on how long closing each connection may take.
pub const CLOSE_TIMEOUT: Duration = Duration::from_secs(2);

type WsSink<S> = SplitSink<WebSocketStream<S>, Message>;

/// One relay session.
///
/// `S` is the transport under the WebSocket and `B` the backend stream; in
/// production these are a `TcpStream` and a
/// [`BackendStream`](crate::infrastructure::dialer::BackendStream).
pub struct Session<S, B> {
    ws: WebSocketStream<S>,
    backend: B,
    limits: SessionLimits,
    active: ActiveSessionGuard,
}

impl<S, B> Session<S, B>
where
    S: AsyncRead + AsyncWrite + Unpin,
    B: AsyncRead + AsyncWrite + Unpin,
{
    /// Pairs an upgraded WebSocket with a freshly dialed backend connection.
    ///
    /// `active` keeps the session counted in the active gauge; it is released
    /// when [`run`](Self::run) returns.
    pub fn new(
        ws: WebSocketStream<S>,
        backend: B,
        limits: SessionLimits,
        active: ActiveSessionGuard,
    ) -> Self {
        Self {
            ws,
            backend,
            limits,
            active,
        }
    }

    /// Relays until either side closes or fails, then closes both.
    ///
    /// Never fails: the returned [`SessionEnd`] only says why it ended.
    pub async fn run(self) -> SessionEnd {
        let Self {
            ws,
            backend,
            limits,
            active,
        } = self;

        let mut state = SessionState::Active;
        debug!("session state: {state:?}");

        let (ws_sink, mut ws_rx) = ws.split();
        // Both directions write to the client (pongs inbound, data outbound).
        let ws_sink = Mutex::new(ws_sink);
        let (mut backend_rx, mut backend_tx) = tokio::io::split(backend);
        let activity = Activity::new();

        let end = {
            let inbound = pump_inbound(&mut ws_rx, &mut backend_tx, &ws_sink, &activity);
            let outbound = pump_outbound(&mut backend_rx, &ws_sink, &activity);
            let limits = watch_limits(limits, &activity);

            tokio::select! {
                end = inbound => end,
                end = outbound => end,
                end = limits => end,
            }
        };

        state = SessionState::Draining;
        debug!("session state: {state:?} ({end})");

        let mut sink = ws_sink.lock().await;
        match timeout(CLOSE_TIMEOUT, sink.close()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => debug!("closing client WebSocket: {e}"),
            Err(_) => debug!("closing client WebSocket timed out"),
        }
        drop(sink);

        match timeout(CLOSE_TIMEOUT, backend_tx.shutdown()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => debug!("shutting down backend connection: {e}"),
            Err(_) => debug!("shutting down backend connection timed out"),
        }

        drop(active);
        state = SessionState::Closed;
        debug!("session state: {state:?}");

        end
    }
}

// ── Relay directions ──────────────────────────────────────────────────────────

async fn pump_inbound<S, W>(
    ws_rx: &mut SplitStream<WebSocketStream<S>>,
    backend_tx: &mut W,
    ws_sink: &Mutex<WsSink<S>>,
    activity: &Activity,
) -> SessionEnd
where
    S: AsyncRead + AsyncWrite + Unpin,
    W: AsyncWrite + Unpin,
{
    loop {
        let msg = match ws_rx.next().await {
            Some(Ok(msg)) => msg,
            Some(Err(WsError::ConnectionClosed | WsError::AlreadyClosed)) | None => {
                return SessionEnd::ClientClosed;
            }
            Some(Err(e)) => return SessionEnd::ClientError(e.to_string()),
        };

        match translate_inbound(msg) {
            InboundAction::ForwardToBackend(payload) => {
                activity.touch();
                trace!("client → backend: {} bytes", payload.len());
                if let Err(e) = write_to_backend(backend_tx, &payload).await {
                    return SessionEnd::BackendError(e.to_string());
                }
            }
            InboundAction::ReplyPong(payload) => {
                trace!("ping from client ({} bytes)", payload.len());
                // tungstenite queued the Pong for this payload when it read the
                // Ping; flush it out instead of sending a second one.
                let mut sink = ws_sink.lock().await;
                if let Err(e) = sink.flush().await {
                    return client_send_failed(e);
                }
            }
            InboundAction::Ignore(kind) => {
                debug!("ignoring {kind} frame from client");
            }
            InboundAction::ClientClosed => {
                debug!("client sent Close frame");
                return SessionEnd::ClientClosed;
            }
        }
    }
}

async fn pump_outbound<S, R>(
    backend_rx: &mut R,
    ws_sink: &Mutex<WsSink<S>>,
    activity: &Activity,
) -> SessionEnd
where
    S: AsyncRead + AsyncWrite + Unpin,
    R: AsyncRead + Unpin,
{
    let mut buf = vec![0u8; READ_CHUNK_SIZE];

    loop {
        let n = match backend_rx.read(&mut buf).await {
            Ok(0) => return SessionEnd::BackendClosed,
            Ok(n) => n,
            Err(e) => return SessionEnd::BackendError(e.to_string()),
        };
        activity.touch();
        trace!("backend → client: {n} bytes");

        let mut sink = ws_sink.lock().await;
        if let Err(e) = sink.send(translate_outbound(&buf[..n])).await {
            return client_send_failed(e);
        }
    }
}

async fn write_to_backend<W: AsyncWrite + Unpin>(
    backend_tx: &mut W,
    payload: &[u8],
) -> std::io::Result<()> {
    backend_tx.write_all(payload).await?;
    // TLS streams buffer records; push them out before reading the next frame.
    backend_tx.flush().await
}

fn client_send_failed(e: WsError) -> SessionEnd {
    match e {
        WsError::ConnectionClosed | WsError::AlreadyClosed => SessionEnd::ClientClosed,
        other => SessionEnd::ClientError(other.to_string()),
    }
}

// ── Limits ────────────────────────────────────────────────────────────────────

/// Resolves when one of the configured limits is hit; never resolves when
/// none is configured.
async fn watch_limits(limits: SessionLimits, activity: &Activity) -> SessionEnd {
    let lifetime = async {
        match limits.max_lifetime {
            Some(max) => sleep(max).await,
            None => pending::<()>().await,
        }
    };

    let idle = async {
        match limits.idle_timeout {
            Some(idle) => loop {
                let quiet_for = activity.quiet_for();
                if quiet_for >= idle {
                    break;
                }
                sleep(idle - quiet_for).await;
            },
            None => pending::<()>().await,
        }
    };

    tokio::select! {
        () = lifetime => SessionEnd::LifetimeExceeded,
        () = idle => SessionEnd::IdleTimeout,
    }
}

/// Time of the last data movement, in milliseconds since session start.
struct Activity {
    started: Instant,
    last_ms: AtomicU64,
}

impl Activity {
    fn new() -> Self {
        Self {
            started: Instant::now(),
            last_ms: AtomicU64::new(0),
        }
    }

    fn touch(&self) {
        let now = self.started.elapsed().as_millis() as u64;
        self.last_ms.store(now, Ordering::Relaxed);
    }

    fn quiet_for(&self) -> Duration {
        let last = Duration::from_millis(self.last_ms.load(Ordering::Relaxed));
        self.started.elapsed().saturating_sub(last)
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
