//! Error types for connection peeking.

use std::io;

use thiserror::Error;

/// Errors that can occur while peeking at a connection.
#[derive(Debug, Error)]
pub enum PeekError {
    /// `peek_match` was already called on this connection.
    #[error("have already peeked at this connection")]
    AlreadyPeeked,

    /// The connection ended before enough bytes arrived.
    #[error("short read while peeking: wanted {wanted} bytes, got {got}")]
    ShortRead { wanted: usize, got: usize },

    /// The underlying connection failed.
    #[error("peek failed: {0}")]
    Io(#[from] io::Error),
}

impl From<PeekError> for io::Error {
    fn from(err: PeekError) -> Self {
        match err {
            PeekError::Io(e) => e,
            PeekError::ShortRead { .. } => io::Error::new(io::ErrorKind::UnexpectedEof, err),
            PeekError::AlreadyPeeked => io::Error::other(err),
        }
    }
}
