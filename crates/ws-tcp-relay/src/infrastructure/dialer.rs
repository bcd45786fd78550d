//! Outbound connections to the backend.
//!
//! Every accepted WebSocket session gets its own connection to the backend,
//! opened by [`BackendDialer::dial`].  Depending on the configured
//! [`TlsMode`] the connection is plain TCP or TLS over TCP.
//!
//! # Single attempt
//!
//! A dial is tried exactly once.  There is no retry, backoff or reconnection:
//! if the backend cannot be reached the session simply does not start.  The
//! outcome of every attempt is counted in [`RelayMetrics`] before `dial`
//! returns.
//!
//! # TLS
//!
//! The rustls client configuration is built once, in [`BackendDialer::new`],
//! and shared by every dial.  [`TlsMode::Verified`] trusts the Mozilla root
//! set shipped in `webpki-roots`.  [`TlsMode::InsecureSkipVerify`] accepts any
//! certificate chain; handshake signatures are still checked, so the
//! connection is encrypted but the server is not authenticated.

use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context as TaskContext, Poll};

use anyhow::Context;
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::{verify_tls12_signature, verify_tls13_signature, CryptoProvider};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, RootCertStore, SignatureScheme};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tokio_rustls::client::TlsStream;
use tokio_rustls::TlsConnector;
use tracing::debug;

use crate::domain::config::{BackendTarget, TlsMode};
use crate::infrastructure::metrics::{DialOutcome, RelayMetrics};

// ── Errors ────────────────────────────────────────────────────────────────────

/// Errors from setting up the dialer or dialing the backend.
#[derive(Debug, Error)]
pub enum DialError {
    /// Resolving or connecting to the backend address failed.
    #[error("failed to connect to backend {address}")]
    Connect {
        address: String,
        #[source]
        source: io::Error,
    },

    /// The host part of the backend address is not a valid TLS server name.
    #[error("invalid TLS server name: {0}")]
    InvalidServerName(String),

    /// The TCP connection was made but the TLS handshake failed.
    #[error("TLS handshake with backend {address} failed")]
    TlsHandshake {
        address: String,
        #[source]
        source: io::Error,
    },

    /// The TLS client configuration could not be built.
    #[error("invalid TLS client configuration")]
    TlsConfig(#[from] rustls::Error),
}

// ── Backend stream ────────────────────────────────────────────────────────────

/// An open connection to the backend: plain TCP or TLS.
pub enum BackendStream {
    Plain(TcpStream),
    Tls(Box<TlsStream<TcpStream>>),
}

impl BackendStream {
    pub fn is_encrypted(&self) -> bool {
        matches!(self, Self::Tls(_))
    }
}

impl AsyncRead for BackendStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut TaskContext<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Self::Plain(s) => Pin::new(s).poll_read(cx, buf),
            Self::Tls(s) => Pin::new(s.as_mut()).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for BackendStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut TaskContext<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            Self::Plain(s) => Pin::new(s).poll_write(cx, buf),
            Self::Tls(s) => Pin::new(s.as_mut()).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Self::Plain(s) => Pin::new(s).poll_flush(cx),
            Self::Tls(s) => Pin::new(s.as_mut()).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Self::Plain(s) => Pin::new(s).poll_shutdown(cx),
            Self::Tls(s) => Pin::new(s.as_mut()).poll_shutdown(cx),
        }
    }
}

// ── Dialer ────────────────────────────────────────────────────────────────────

/// Opens backend connections for new sessions.
///
/// Built once at startup and shared by all connection tasks.
pub struct BackendDialer {
    target: BackendTarget,
    tls: Option<(TlsConnector, ServerName<'static>)>,
    metrics: Arc<RelayMetrics>,
}

impl BackendDialer {
    /// Prepares a dialer for `target`.
    ///
    /// # Errors
    ///
    /// For TLS targets, returns [`DialError::InvalidServerName`] if the host
    /// part of the address cannot be used as a TLS server name, or
    /// [`DialError::TlsConfig`] if the rustls configuration cannot be built.
    /// Both are configuration errors and should stop the process at startup.
    pub fn new(target: BackendTarget, metrics: Arc<RelayMetrics>) -> Result<Self, DialError> {
        let tls = match client_config(target.tls)? {
            Some(config) => {
                let host = target.host().to_string();
                let server_name = ServerName::try_from(host.clone())
                    .map_err(|_| DialError::InvalidServerName(host))?;
                Some((TlsConnector::from(Arc::new(config)), server_name))
            }
            None => None,
        };

        Ok(Self {
            target,
            tls,
            metrics,
        })
    }

    pub fn target(&self) -> &BackendTarget {
        &self.target
    }

    pub fn metrics(&self) -> &Arc<RelayMetrics> {
        &self.metrics
    }

    /// Opens one connection to the backend and counts the outcome.
    ///
    /// # Errors
    ///
    /// Returns [`DialError::Connect`] if the address cannot be resolved or the
    /// TCP connection is refused, and [`DialError::TlsHandshake`] if the TLS
    /// handshake fails (including certificate validation in verified mode).
    pub async fn dial(&self) -> Result<BackendStream, DialError> {
        let result = self.connect().await;
        let outcome = match result {
            Ok(_) => DialOutcome::Successful,
            Err(_) => DialOutcome::Failed,
        };
        self.metrics.record_dial(outcome);
        result
    }

    async fn connect(&self) -> Result<BackendStream, DialError> {
        let address = self.target.address.as_str();
        let tcp = TcpStream::connect(address)
            .await
            .map_err(|source| DialError::Connect {
                address: address.to_string(),
                source,
            })?;

        // Relayed traffic is often interactive; do not hold back small writes.
        if let Err(e) = tcp.set_nodelay(true) {
            debug!("could not set TCP_NODELAY on backend socket: {e}");
        }

        match &self.tls {
            None => Ok(BackendStream::Plain(tcp)),
            Some((connector, server_name)) => {
                let stream = connector
                    .connect(server_name.clone(), tcp)
                    .await
                    .map_err(|source| DialError::TlsHandshake {
                        address: address.to_string(),
                        source,
                    })?;
                Ok(BackendStream::Tls(Box::new(stream)))
            }
        }
    }
}

/// Resolves the backend address once, at startup.
///
/// The relay must not start serving with a target that can never be reached,
/// so an address that does not resolve is a fatal configuration error.
///
/// # Errors
///
/// Returns an error if the address is malformed or resolves to nothing.
pub async fn resolve_backend(target: &BackendTarget) -> anyhow::Result<Vec<SocketAddr>> {
    let addrs: Vec<SocketAddr> = tokio::net::lookup_host(target.address.as_str())
        .await
        .with_context(|| format!("cannot resolve backend address '{}'", target.address))?
        .collect();

    if addrs.is_empty() {
        anyhow::bail!("backend address '{}' resolved to no addresses", target.address);
    }
    Ok(addrs)
}

// ── TLS configuration ─────────────────────────────────────────────────────────

fn client_config(mode: TlsMode) -> Result<Option<ClientConfig>, rustls::Error> {
    if !mode.is_encrypted() {
        return Ok(None);
    }

    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let builder = ClientConfig::builder_with_provider(Arc::clone(&provider))
        .with_safe_default_protocol_versions()?;

    let config = match mode {
        TlsMode::Plain => return Ok(None),
        TlsMode::Verified => {
            let mut roots = RootCertStore::empty();
            roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
            builder.with_root_certificates(roots).with_no_client_auth()
        }
        TlsMode::InsecureSkipVerify => builder
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(AcceptAnyServerCert(provider)))
            .with_no_client_auth(),
    };
    Ok(Some(config))
}

/// Certificate verifier for [`TlsMode::InsecureSkipVerify`].
///
/// Accepts every certificate chain, but still verifies that the handshake
/// was signed by the key in the presented certificate.
#[derive(Debug)]
struct AcceptAnyServerCert(Arc<CryptoProvider>);

impl ServerCertVerifier for AcceptAnyServerCert {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls12_signature(message, cert, dss, &self.0.signature_verification_algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls13_signature(message, cert, dss, &self.0.signature_verification_algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.0.signature_verification_algorithms.supported_schemes()
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
