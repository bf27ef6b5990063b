//! One-shot prefix inspection.
//!
//! [`PeekableConnection::peek_match`] reads a fixed number of bytes, tests them
//! against a pattern and keeps them buffered so the next reader sees the stream
//! from its very first byte. Peeking is allowed once per wrapper; wrap again to
//! peek again.

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, ReadBuf};

use crate::{PeekError, ProxiedConnection};

/// A test applied to the peeked prefix.
pub trait PeekPattern {
    fn matches(&self, prefix: &[u8]) -> bool;
}

impl<F> PeekPattern for F
where
    F: Fn(&[u8]) -> bool,
{
    fn matches(&self, prefix: &[u8]) -> bool {
        self(prefix)
    }
}

/// A connection whose first bytes can be inspected without being consumed.
#[derive(Debug)]
pub struct PeekableConnection<C> {
    inner: C,
    peeked: bool,
    buf: Vec<u8>,
    pos: usize,
}

impl<C> PeekableConnection<C> {
    pub fn new(inner: C) -> Self {
        Self {
            inner,
            peeked: false,
            buf: Vec::new(),
            pos: 0,
        }
    }

    /// A connection whose first reads replay `prefix`, already read off
    /// `inner` by someone else. Counts as peeked.
    pub fn with_prefix(inner: C, prefix: Vec<u8>) -> Self {
        Self {
            inner,
            peeked: true,
            buf: prefix,
            pos: 0,
        }
    }

    /// Bytes peeked but not yet handed to a reader.
    pub fn buffered(&self) -> &[u8] {
        &self.buf[self.pos..]
    }

    pub fn get_ref(&self) -> &C {
        &self.inner
    }
}

impl<C: AsyncRead + Unpin> PeekableConnection<C> {
    /// Read exactly `n` bytes and report whether they satisfy `pattern`.
    ///
    /// The bytes stay buffered whatever the outcome, including on a short read.
    pub async fn peek_match<P>(&mut self, n: usize, pattern: &P) -> Result<bool, PeekError>
    where
        P: PeekPattern + ?Sized,
    {
        if self.peeked {
            return Err(PeekError::AlreadyPeeked);
        }
        self.peeked = true;

        let mut prefix = vec![0u8; n];
        let mut filled = 0;
        while filled < n {
            let read = match self.inner.read(&mut prefix[filled..]).await {
                Ok(read) => read,
                Err(e) => {
                    prefix.truncate(filled);
                    self.buf = prefix;
                    return Err(e.into());
                }
            };
            if read == 0 {
                prefix.truncate(filled);
                self.buf = prefix;
                return Err(PeekError::ShortRead {
                    wanted: n,
                    got: filled,
                });
            }
            filled += read;
        }

        let matched = pattern.matches(&prefix);
        self.buf = prefix;
        Ok(matched)
    }
}

impl<C: AsyncRead + Unpin> AsyncRead for PeekableConnection<C> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        out: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = &mut *self;
        if this.pos < this.buf.len() {
            let n = (this.buf.len() - this.pos).min(out.remaining());
            out.put_slice(&this.buf[this.pos..this.pos + n]);
            this.pos += n;
            if this.pos == this.buf.len() {
                this.buf = Vec::new();
                this.pos = 0;
            }
            return Poll::Ready(Ok(()));
        }
        Pin::new(&mut this.inner).poll_read(cx, out)
    }
}

impl<C: AsyncWrite + Unpin> AsyncWrite for PeekableConnection<C> {
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
}

impl<C: ProxiedConnection> ProxiedConnection for PeekableConnection<C> {
    fn original_destination(&self) -> Option<&str> {
        self.inner.original_destination()
    }

    fn is_tls(&self) -> bool {
        self.inner.is_tls()
    }
}
