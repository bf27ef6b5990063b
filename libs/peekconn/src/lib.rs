//! Connection wrappers used while sniffing the protocol of a fresh connection.
//!
//! This library provides:
//! - [`ProxiedConnection`]: the capability every connection wrapper exposes
//!   (original destination, whether it arrived over TLS)
//! - [`ProxiedConn`]: tags an arbitrary byte stream with those capabilities
//! - [`PeekableConnection`]: inspects a fixed-size prefix exactly once without
//!   losing it for later reads
//!
//! Wrappers nest freely; the capability queries always reach the innermost
//! tagged connection.

mod error;
mod peek;

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;

pub use error::PeekError;
pub use peek::{PeekPattern, PeekableConnection};

/// A live transport connection annotated with where the client meant to go.
pub trait ProxiedConnection: AsyncRead + AsyncWrite + Send + Unpin {
    /// The `host:port` the client believed it was talking to.
    ///
    /// `None` means the connection was made directly to the proxy and there is
    /// nothing to fall back to.
    fn original_destination(&self) -> Option<&str>;

    /// Whether the connection arrived over TLS.
    fn is_tls(&self) -> bool {
        false
    }
}

/// Type-erased connection handed between pipeline stages.
pub type BoxedConnection = Box<dyn ProxiedConnection>;

impl ProxiedConnection for TcpStream {
    fn original_destination(&self) -> Option<&str> {
        None
    }
}

impl<C: ProxiedConnection + ?Sized> ProxiedConnection for Box<C> {
    fn original_destination(&self) -> Option<&str> {
        (**self).original_destination()
    }

    fn is_tls(&self) -> bool {
        (**self).is_tls()
    }
}

/// A byte stream tagged with its original destination and TLS flag.
#[derive(Debug)]
pub struct ProxiedConn<C> {
    inner: C,
    original_destination: Option<String>,
    tls: bool,
}

impl<C> ProxiedConn<C> {
    /// Tag `inner`. An empty destination is treated as no destination.
    pub fn new(inner: C, original_destination: Option<String>, tls: bool) -> Self {
        Self {
            inner,
            original_destination: original_destination.filter(|d| !d.is_empty()),
            tls,
        }
    }

    /// A connection made straight to the proxy's own address.
    pub fn direct(inner: C) -> Self {
        Self::new(inner, None, false)
    }

    pub fn get_ref(&self) -> &C {
        &self.inner
    }

    pub fn get_mut(&mut self) -> &mut C {
        &mut self.inner
    }

    pub fn into_inner(self) -> C {
        self.inner
    }
}

impl<C: AsyncRead + Unpin> AsyncRead for ProxiedConn<C> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl<C: AsyncWrite + Unpin> AsyncWrite for ProxiedConn<C> {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }

    fn poll_write_vectored(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        bufs: &[io::IoSlice<'_>],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write_vectored(cx, bufs)
    }

    fn is_write_vectored(&self) -> bool {
        self.inner.is_write_vectored()
    }
}

impl<C: AsyncRead + AsyncWrite + Send + Unpin> ProxiedConnection for ProxiedConn<C> {
    fn original_destination(&self) -> Option<&str> {
        self.original_destination.as_deref()
    }

    fn is_tls(&self) -> bool {
        self.tls
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{duplex, AsyncReadExt, AsyncWriteExt};

    #[test]
    fn test_empty_destination_is_none() {
        let (a, _b) = duplex(16);
        let conn = ProxiedConn::new(a, Some(String::new()), false);
        assert!(conn.original_destination().is_none());
    }

    #[tokio::test]
    async fn test_boxed_connection_keeps_capabilities() {
        let (a, mut b) = duplex(64);
        let conn: BoxedConnection = Box::new(ProxiedConn::new(
            a,
            Some("example.com:443".to_string()),
            true,
        ));
        let mut peekable = PeekableConnection::new(conn);
        assert_eq!(peekable.original_destination(), Some("example.com:443"));
        assert!(peekable.is_tls());

        b.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        peekable.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");
    }
}
