//! TLS / HTTP protocol classifier.
//!
//! Every connection coming out of the [`ProxyListener`] is sniffed once:
//!
//! ```text
//!              ┌── TLS, interceptable or direct ──> tls listener
//! connection ──┼── TLS, not interceptable ────────> raw relay to destination
//!              └── anything else ─────────────────> plain listener
//! ```
//!
//! After TLS termination (or on the plaintext branch) [`bounce_non_http`]
//! takes a second look and relays connections that do not start like an HTTP
//! request the proxy handles.

use std::io;
use std::sync::Arc;

use peekconn::{BoxedConnection, PeekError, PeekableConnection, ProxiedConnection};
use rustls::pki_types::ServerName;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio_rustls::TlsConnector;
use tracing::{debug, info_span, warn, Instrument};

use super::addr::host_of;
use super::dialer::Dialer;
use super::forward::proxy_bidirectional;
use super::listener::ProxyListener;
use super::tls::InterceptionCert;

/// Bytes needed to recognise a TLS handshake record.
pub const TLS_PEEK_SIZE: usize = 3;

/// Bytes needed to recognise the request methods the router serves.
pub const HTTP_PEEK_SIZE: usize = 8;

/// Methods (and the HTTP/2 preface) the router accepts.
const HTTP_PREFIXES: [&[u8]; 3] = [b"CONNECT", b"POST", b"PRI "];

/// Classified connections waiting on one branch.
const BRANCH_BACKLOG: usize = 64;

/// Handshake record type followed by a TLS 1.0–1.3 record version.
pub fn is_tls_handshake(prefix: &[u8]) -> bool {
    matches!(prefix, [0x16, 0x03, 0x00..=0x03, ..])
}

/// Starts like a request the HTTP router serves.
pub fn is_proxied_http(prefix: &[u8]) -> bool {
    HTTP_PREFIXES.iter().any(|p| prefix.starts_with(p))
}

/// What to do with a connection that starts with a TLS handshake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TlsRoute {
    /// Terminate TLS locally.
    Intercept,
    /// Relay the encrypted bytes to the destination untouched.
    PassThrough { destination: String },
}

/// Decide between interception and pass-through for a TLS connection.
///
/// Connections without an original destination were made to the proxy itself
/// and can only be intercepted.
pub fn route_tls(destination: Option<&str>, cert: Option<&InterceptionCert>) -> TlsRoute {
    let Some(destination) = destination.filter(|d| !d.is_empty()) else {
        return TlsRoute::Intercept;
    };
    match cert {
        Some(cert) if cert.verify_hostname(host_of(destination)) => TlsRoute::Intercept,
        _ => TlsRoute::PassThrough {
            destination: destination.to_string(),
        },
    }
}

/// One output of the classifier.
pub struct MuxListener {
    rx: mpsc::Receiver<BoxedConnection>,
}

impl MuxListener {
    /// Next connection on this branch, `None` once the classifier stopped.
    pub async fn accept(&mut self) -> Option<BoxedConnection> {
        self.rx.recv().await
    }
}

/// Splits a [`ProxyListener`] into plaintext and TLS branches.
pub struct TlsMux {
    cert: Option<Arc<InterceptionCert>>,
    dialer: Arc<dyn Dialer>,
}

impl TlsMux {
    pub fn new(cert: Option<Arc<InterceptionCert>>, dialer: Arc<dyn Dialer>) -> Self {
        Self { cert, dialer }
    }

    /// Start classifying and return `(plain, tls)`.
    pub fn split(self, mut listener: ProxyListener) -> (MuxListener, MuxListener) {
        let (plain_tx, plain_rx) = mpsc::channel(BRANCH_BACKLOG);
        let (tls_tx, tls_rx) = mpsc::channel(BRANCH_BACKLOG);
        let mux = Arc::new(self);

        tokio::spawn(async move {
            while let Some(conn) = listener.accept().await {
                if plain_tx.is_closed() && tls_tx.is_closed() {
                    break;
                }
                let mux = Arc::clone(&mux);
                let plain_tx = plain_tx.clone();
                let tls_tx = tls_tx.clone();
                let span = info_span!(
                    "classify",
                    destination = conn.original_destination().unwrap_or("-")
                );
                tokio::spawn(
                    async move {
                        if let Err(e) = mux.classify(conn, plain_tx, tls_tx).await {
                            debug!(error = %e, "Dropping connection");
                        }
                    }
                    .instrument(span),
                );
            }
            debug!("Classifier stopped");
        });

        (MuxListener { rx: plain_rx }, MuxListener { rx: tls_rx })
    }

    async fn classify(
        &self,
        conn: BoxedConnection,
        plain_tx: mpsc::Sender<BoxedConnection>,
        tls_tx: mpsc::Sender<BoxedConnection>,
    ) -> io::Result<()> {
        let mut conn = PeekableConnection::new(conn);
        let is_tls = match conn.peek_match(TLS_PEEK_SIZE, &is_tls_handshake).await {
            Ok(is_tls) => is_tls,
            // Too short to be TLS; let the HTTP side decide.
            Err(PeekError::ShortRead { .. }) => false,
            Err(e) => return Err(e.into()),
        };

        if !is_tls {
            return send(&plain_tx, Box::new(conn)).await;
        }

        match route_tls(conn.original_destination(), self.cert.as_deref()) {
            TlsRoute::Intercept => send(&tls_tx, Box::new(conn)).await,
            TlsRoute::PassThrough { destination } => {
                debug!(
                    destination = %destination,
                    "Certificate does not cover destination, passing TLS through"
                );
                let upstream = self.dialer.dial(&destination).await?;
                relay(conn, upstream, destination).await;
                Ok(())
            }
        }
    }
}

async fn send(tx: &mpsc::Sender<BoxedConnection>, conn: BoxedConnection) -> io::Result<()> {
    tx.send(conn)
        .await
        .map_err(|_| io::Error::new(io::ErrorKind::ConnectionAborted, "branch listener closed"))
}

async fn relay<A, B>(client: A, upstream: B, destination: String)
where
    A: AsyncRead + AsyncWrite + Unpin,
    B: AsyncRead + AsyncWrite + Unpin,
{
    match proxy_bidirectional(client, upstream).await {
        Ok((to_destination, from_destination)) => debug!(
            destination = %destination,
            bytes_to_destination = to_destination,
            bytes_from_destination = from_destination,
            "Pass-through closed"
        ),
        Err(e) => warn!(destination = %destination, error = %e, "Pass-through relay failed"),
    }
}

/// Second-stage check on a plaintext or decrypted connection.
///
/// Returns the connection when the router should serve it. Otherwise the
/// bytes are relayed to the original destination with the same security the
/// client used (decrypted TLS is re-encrypted) and `None` is returned.
pub async fn bounce_non_http(
    conn: BoxedConnection,
    dialer: &dyn Dialer,
    tls_connector: Option<&TlsConnector>,
) -> io::Result<Option<BoxedConnection>> {
    let Some(destination) = conn.original_destination().map(str::to_owned) else {
        return Ok(Some(conn));
    };

    let mut conn = PeekableConnection::new(conn);
    if conn.peek_match(HTTP_PEEK_SIZE, &is_proxied_http).await? {
        return Ok(Some(Box::new(conn)));
    }

    debug!(destination = %destination, "Not an HTTP request, relaying");
    let upstream = dialer.dial(&destination).await?;
    if conn.is_tls() {
        let connector = tls_connector.ok_or_else(|| {
            io::Error::new(io::ErrorKind::Unsupported, "no TLS client configuration")
        })?;
        let server_name = ServerName::try_from(host_of(&destination).to_string())
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
        let upstream = connector.connect(server_name, upstream).await?;
        tokio::spawn(relay(conn, upstream, destination));
    } else {
        tokio::spawn(relay(conn, upstream, destination));
    }
    Ok(None)
}
