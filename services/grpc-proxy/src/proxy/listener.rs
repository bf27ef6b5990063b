//! Tunnel-aware listener.
//!
//! Merges two sources of connections into one accept stream:
//! - connections accepted on the bound TCP socket (no original destination)
//! - CONNECT tunnels re-injected by the router through a [`Redirector`],
//!   tagged with the host the client asked to reach

use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use peekconn::{BoxedConnection, ProxiedConn};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tracing::{debug, error, info};

/// Pending connections buffered between the accept loops and `accept()`.
const ACCEPT_BACKLOG: usize = 128;

/// Pause after a failed accept before trying again.
const ACCEPT_RETRY_DELAY: Duration = Duration::from_millis(100);

/// A listener yielding both direct and tunneled connections.
pub struct ProxyListener {
    /// Bound socket; taken when the accept loop starts.
    listener: Option<TcpListener>,
    local_addr: SocketAddr,
    tx: mpsc::Sender<BoxedConnection>,
    rx: mpsc::Receiver<BoxedConnection>,
}

impl ProxyListener {
    pub fn new(listener: TcpListener) -> io::Result<Self> {
        let local_addr = listener.local_addr()?;
        let (tx, rx) = mpsc::channel(ACCEPT_BACKLOG);
        Ok(Self {
            listener: Some(listener),
            local_addr,
            tx,
            rx,
        })
    }

    /// Bind `addr` and wrap the socket.
    pub async fn bind(addr: &str) -> io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        Self::new(listener)
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// A handle for re-injecting CONNECT tunnels into this listener.
    pub fn redirector(&self) -> Redirector {
        Redirector {
            tx: self.tx.clone(),
        }
    }

    /// Wait for the next connection from either source.
    ///
    /// The first call starts the socket accept loop.
    pub async fn accept(&mut self) -> Option<BoxedConnection> {
        if let Some(listener) = self.listener.take() {
            tokio::spawn(accept_loop(listener, self.tx.clone()));
        }
        self.rx.recv().await
    }
}

async fn accept_loop(listener: TcpListener, tx: mpsc::Sender<BoxedConnection>) {
    let local_addr = listener.local_addr().ok();
    info!(bind_addr = ?local_addr, "Listener started");

    loop {
        match listener.accept().await {
            Ok((stream, peer_addr)) => {
                if let Err(e) = stream.set_nodelay(true) {
                    debug!(peer_addr = %peer_addr, error = %e, "Failed to set TCP_NODELAY");
                }
                debug!(peer_addr = %peer_addr, "Accepted connection");
                if tx.send(Box::new(ProxiedConn::direct(stream))).await.is_err() {
                    debug!("Listener closed, stopping accept loop");
                    return;
                }
            }
            Err(e) => {
                error!(error = %e, "Accept error");
                // Brief sleep to avoid tight loop on persistent errors
                tokio::time::sleep(ACCEPT_RETRY_DELAY).await;
            }
        }
    }
}

/// Re-injects hijacked CONNECT streams into a [`ProxyListener`].
#[derive(Debug, Clone)]
pub struct Redirector {
    tx: mpsc::Sender<BoxedConnection>,
}

impl Redirector {
    /// Queue `conn` as a new connection whose original destination is `host`.
    /// `tls` records whether the stream carrying the tunnel was TLS.
    pub async fn redirect<C>(&self, conn: C, host: &str, tls: bool) -> io::Result<()>
    where
        C: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        debug!(destination = %host, tls, "Re-injecting tunneled connection");
        let conn = ProxiedConn::new(conn, Some(host.to_string()), tls);
        self.tx
            .send(Box::new(conn))
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::ConnectionAborted, "listener closed"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use peekconn::ProxiedConnection;
    use tokio::io::{duplex, AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpStream;

    #[tokio::test]
    async fn test_direct_connections_have_no_destination() {
        let mut listener = ProxyListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr();

        let mut client = TcpStream::connect(addr).await.unwrap();
        client.write_all(b"hi").await.unwrap();

        let mut conn = listener.accept().await.unwrap();
        assert!(conn.original_destination().is_none());
        assert!(!conn.is_tls());

        let mut buf = [0u8; 2];
        conn.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hi");
    }

    #[tokio::test]
    async fn test_redirected_connections_are_tagged() {
        let mut listener = ProxyListener::bind("127.0.0.1:0").await.unwrap();
        let redirector = listener.redirector();

        let (tunnel, mut client) = duplex(64);
        redirector.redirect(tunnel, "example.com:443", false).await.unwrap();
        client.write_all(b"\x16\x03\x01").await.unwrap();

        let mut conn = listener.accept().await.unwrap();
        assert_eq!(conn.original_destination(), Some("example.com:443"));
        assert!(!conn.is_tls());

        let mut buf = [0u8; 3];
        conn.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"\x16\x03\x01");
    }

    #[tokio::test]
    async fn test_redirect_carries_tls_flag() {
        let mut listener = ProxyListener::bind("127.0.0.1:0").await.unwrap();
        let redirector = listener.redirector();

        let (tunnel, _client) = duplex(64);
        redirector.redirect(tunnel, "inner.example:443", true).await.unwrap();

        let conn = listener.accept().await.unwrap();
        assert_eq!(conn.original_destination(), Some("inner.example:443"));
        assert!(conn.is_tls());
    }

    #[tokio::test]
    async fn test_redirect_after_listener_dropped() {
        let listener = ProxyListener::bind("127.0.0.1:0").await.unwrap();
        let redirector = listener.redirector();
        drop(listener);

        let (tunnel, _client) = duplex(64);
        let err = redirector
            .redirect(tunnel, "example.com:443", false)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::ConnectionAborted);
    }
}
