//! Outbound dialers.
//!
//! Every connection the proxy opens towards a destination, whether for a
//! pooled gRPC channel or for a pass-through relay, goes through a [`Dialer`].
//! The default [`ProxyDialer`] honours the usual `HTTPS_PROXY` / `HTTP_PROXY`
//! / `NO_PROXY` environment and tunnels through the upstream proxy with
//! `CONNECT`.

use std::fmt;
use std::io;
use std::time::Duration;

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use http::Uri;
use peekconn::{BoxedConnection, PeekableConnection};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, warn};

use super::addr::host_of;
use crate::error::DialError;

/// Default connect timeout for outbound connections.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Largest CONNECT response header section accepted from an upstream proxy.
pub const MAX_CONNECT_RESPONSE_HEADERS: usize = 8192;

const READ_CHUNK: usize = 1024;

/// Opens outbound connections to `host:port` addresses.
#[async_trait]
pub trait Dialer: Send + Sync {
    async fn dial(&self, addr: &str) -> io::Result<BoxedConnection>;
}

/// Dials destinations directly over TCP.
#[derive(Debug, Clone)]
pub struct DirectDialer {
    connect_timeout: Duration,
}

impl DirectDialer {
    pub fn new(connect_timeout: Duration) -> Self {
        Self { connect_timeout }
    }

    async fn connect(&self, addr: &str) -> io::Result<TcpStream> {
        let stream = match timeout(self.connect_timeout, TcpStream::connect(addr)).await {
            Ok(result) => result?,
            Err(_) => {
                return Err(io::Error::new(
                    io::ErrorKind::TimedOut,
                    format!("connect to {addr} timed out"),
                ))
            }
        };
        stream.set_nodelay(true)?;
        Ok(stream)
    }
}

impl Default for DirectDialer {
    fn default() -> Self {
        Self::new(DEFAULT_CONNECT_TIMEOUT)
    }
}

#[async_trait]
impl Dialer for DirectDialer {
    async fn dial(&self, addr: &str) -> io::Result<BoxedConnection> {
        let stream = self.connect(addr).await?;
        debug!(destination = %addr, "Dialed destination directly");
        Ok(Box::new(stream))
    }
}

/// `NO_PROXY` matcher.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NoProxy {
    entries: Vec<String>,
}

impl NoProxy {
    pub fn parse(value: &str) -> Self {
        let entries = value
            .split(',')
            .map(|e| e.trim().trim_start_matches('.').to_ascii_lowercase())
            .filter(|e| !e.is_empty())
            .collect();
        Self { entries }
    }

    /// Whether `addr` (`host:port`) must bypass the upstream proxy.
    pub fn matches(&self, addr: &str) -> bool {
        let host = host_of(addr).to_ascii_lowercase();
        self.entries.iter().any(|entry| {
            let entry_host = host_of(entry);
            entry == "*"
                || entry == addr
                || host == entry_host
                || host
                    .strip_suffix(entry_host)
                    .is_some_and(|prefix| prefix.ends_with('.'))
        })
    }
}

/// An upstream HTTP proxy reached with `CONNECT`.
#[derive(Clone, PartialEq, Eq)]
pub struct UpstreamProxy {
    addr: String,
    /// `Proxy-Authorization` value built from the URL's userinfo.
    authorization: Option<String>,
}

impl fmt::Debug for UpstreamProxy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UpstreamProxy")
            .field("addr", &self.addr)
            .field("authenticated", &self.authorization.is_some())
            .finish()
    }
}

impl UpstreamProxy {
    /// A proxy at `addr` (`host:port`) that needs no credentials.
    pub fn new(addr: impl Into<String>) -> Self {
        Self {
            addr: addr.into(),
            authorization: None,
        }
    }

    /// Parse `host[:port]` or `http://[user:password@]host[:port][/]`.
    ///
    /// Userinfo becomes basic `Proxy-Authorization`. Schemes other than
    /// `http` are rejected.
    pub fn parse(raw: &str) -> Option<Self> {
        let raw = raw.trim();
        let uri: Uri = if raw.contains("://") {
            raw.parse().ok()?
        } else {
            format!("http://{raw}").parse().ok()?
        };
        if !uri
            .scheme_str()
            .is_some_and(|scheme| scheme.eq_ignore_ascii_case("http"))
        {
            return None;
        }

        let authority = uri.authority()?;
        if authority.host().is_empty() {
            return None;
        }
        let addr = format!("{}:{}", authority.host(), authority.port_u16().unwrap_or(80));
        let authorization = authority
            .as_str()
            .rsplit_once('@')
            .map(|(userinfo, _)| format!("Basic {}", STANDARD.encode(userinfo)));

        Some(Self {
            addr,
            authorization,
        })
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    fn connect_request(&self, target: &str) -> String {
        let mut request = format!("CONNECT {target} HTTP/1.1\r\nHost: {target}\r\n");
        if let Some(authorization) = &self.authorization {
            request.push_str(&format!("Proxy-Authorization: {authorization}\r\n"));
        }
        request.push_str("\r\n");
        request
    }
}

/// Tunnels through an upstream HTTP proxy when one is configured, otherwise
/// dials directly.
#[derive(Debug, Clone)]
pub struct ProxyDialer {
    upstream: Option<UpstreamProxy>,
    no_proxy: NoProxy,
    direct: DirectDialer,
}

impl ProxyDialer {
    pub fn new(
        upstream: Option<UpstreamProxy>,
        no_proxy: NoProxy,
        connect_timeout: Duration,
    ) -> Self {
        Self {
            upstream,
            no_proxy,
            direct: DirectDialer::new(connect_timeout),
        }
    }

    /// Read the upstream proxy from `HTTPS_PROXY`, `https_proxy`, `HTTP_PROXY`
    /// or `http_proxy` (first non-empty wins) and exclusions from `NO_PROXY`.
    pub fn from_env(connect_timeout: Duration) -> Self {
        let var = |names: &[&str]| {
            names
                .iter()
                .filter_map(|name| std::env::var(name).ok())
                .find(|v| !v.trim().is_empty())
        };

        let upstream = var(&["HTTPS_PROXY", "https_proxy", "HTTP_PROXY", "http_proxy"])
            .and_then(|raw| match UpstreamProxy::parse(&raw) {
                Some(proxy) => Some(proxy),
                None => {
                    warn!("Ignoring unsupported upstream proxy URL");
                    None
                }
            });
        let no_proxy = var(&["NO_PROXY", "no_proxy"])
            .map(|v| NoProxy::parse(&v))
            .unwrap_or_default();

        Self::new(upstream, no_proxy, connect_timeout)
    }

    /// The upstream proxy used for `addr`, if any.
    pub fn upstream_for(&self, addr: &str) -> Option<&UpstreamProxy> {
        match &self.upstream {
            Some(proxy) if !self.no_proxy.matches(addr) => Some(proxy),
            _ => None,
        }
    }
}

#[async_trait]
impl Dialer for ProxyDialer {
    async fn dial(&self, addr: &str) -> io::Result<BoxedConnection> {
        let Some(proxy) = self.upstream_for(addr) else {
            return self.direct.dial(addr).await;
        };

        let stream = self.direct.connect(proxy.addr()).await?;
        let tunnel = connect_tunnel(stream, proxy, addr).await?;
        debug!(destination = %addr, proxy = %proxy.addr(), "Tunneled through upstream proxy");
        Ok(tunnel)
    }
}

/// Status line of a parsed CONNECT response head.
struct ConnectResponse {
    head_len: usize,
    code: u16,
    reason: String,
}

/// `None` while the head is still incomplete.
fn parse_connect_response(buf: &[u8]) -> Result<Option<ConnectResponse>, DialError> {
    let mut headers = [httparse::EMPTY_HEADER; 64];
    let mut response = httparse::Response::new(&mut headers);
    match response.parse(buf) {
        Ok(httparse::Status::Partial) => Ok(None),
        Ok(httparse::Status::Complete(head_len)) => {
            let code = response
                .code
                .ok_or_else(|| DialError::Malformed("missing status code".to_string()))?;
            Ok(Some(ConnectResponse {
                head_len,
                code,
                reason: response.reason.unwrap_or_default().to_string(),
            }))
        }
        Err(e) => Err(DialError::Malformed(e.to_string())),
    }
}

async fn connect_tunnel(
    mut stream: TcpStream,
    proxy: &UpstreamProxy,
    target: &str,
) -> io::Result<BoxedConnection> {
    stream
        .write_all(proxy.connect_request(target).as_bytes())
        .await?;

    let mut buf = Vec::with_capacity(READ_CHUNK);
    let mut chunk = [0u8; READ_CHUNK];
    let response = loop {
        let read = stream.read(&mut chunk).await?;
        if read == 0 {
            return Err(DialError::UnexpectedEof.into());
        }
        buf.extend_from_slice(&chunk[..read]);
        if let Some(response) = parse_connect_response(&buf)? {
            break response;
        }
        if buf.len() > MAX_CONNECT_RESPONSE_HEADERS {
            return Err(DialError::HeadersTooLarge(MAX_CONNECT_RESPONSE_HEADERS).into());
        }
    };
    if response.head_len > MAX_CONNECT_RESPONSE_HEADERS {
        return Err(DialError::HeadersTooLarge(MAX_CONNECT_RESPONSE_HEADERS).into());
    }

    if !(200..300).contains(&response.code) {
        return Err(DialError::Refused {
            proxy: proxy.addr().to_string(),
            target: target.to_string(),
            status: format!("{} {}", response.code, response.reason),
        }
        .into());
    }

    // Tunnel bytes that arrived with the response head.
    let leftover = buf.split_off(response.head_len);
    Ok(Box::new(PeekableConnection::with_prefix(stream, leftover)))
}
