//! Error types for the proxy.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Errors raised while configuring or running a proxy server.
#[derive(Debug, Error)]
pub enum ProxyError {
    /// Invalid configuration, reported before anything is bound.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// Binding or accepting failed.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Certificate or key file could not be read.
    #[error("failed to read {path}: {source}")]
    ReadFile {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// Certificate or key file did not contain usable PEM data.
    #[error("invalid certificate material in {path}: {reason}")]
    Certificate { path: PathBuf, reason: String },

    /// TLS configuration was rejected by rustls.
    #[error("TLS configuration error: {0}")]
    Tls(#[from] rustls::Error),

    /// The reverse proxy HTTP client could not be built.
    #[error("HTTP client error: {0}")]
    HttpClient(#[from] reqwest::Error),
}

/// Failure to obtain an outbound client connection.
#[derive(Debug, Error)]
pub enum PoolError {
    #[error("invalid destination {destination}: {reason}")]
    InvalidDestination { destination: String, reason: String },

    #[error("failed to connect to {destination}: {source}")]
    Connect {
        destination: String,
        #[source]
        source: tonic::transport::Error,
    },
}

/// Failure to open a tunnel through an upstream HTTP proxy.
#[derive(Debug, Error)]
pub enum DialError {
    #[error("upstream proxy {proxy} refused CONNECT to {target}: {status}")]
    Refused {
        proxy: String,
        target: String,
        status: String,
    },

    #[error("upstream proxy response headers exceed {0} bytes")]
    HeadersTooLarge(usize),

    #[error("upstream proxy closed the connection during CONNECT")]
    UnexpectedEof,

    #[error("malformed upstream proxy response: {0}")]
    Malformed(String),
}

impl From<DialError> for io::Error {
    fn from(err: DialError) -> Self {
        match err {
            DialError::UnexpectedEof => io::Error::new(io::ErrorKind::UnexpectedEof, err),
            DialError::Refused { .. } => io::Error::new(io::ErrorKind::ConnectionRefused, err),
            _ => io::Error::new(io::ErrorKind::InvalidData, err),
        }
    }
}
