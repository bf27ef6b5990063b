//! Intercepting gRPC proxy implementation.
//!
//! This module provides:
//! - A listener merging direct connections with re-injected CONNECT tunnels
//! - TLS / HTTP classification with selective TLS termination
//! - HTTP routing between CONNECT, gRPC and plain reverse proxying
//! - Transparent gRPC stream relaying through an interceptor chain
//! - Pooled outbound client channels
//!
//! ## Architecture
//!
//! ```text
//! Client -> ProxyListener -> TlsMux ─┬─ plain ─> bounce ─> Router ─┬─ CONNECT ─> Redirector ─┐
//!              ^                     └─ tls ───> bounce ─> Router  ├─ gRPC ────> Interceptors -> StreamHandler -> ConnPool
//!              |                                                   └─ other ───> ReverseProxy
//!              └───────────────────────────────────────────────────────────────────────────────┘
//! ```

mod addr;
mod codec;
mod dialer;
mod forward;
mod handler;
mod interceptor;
mod listener;
mod marker;
mod mux;
mod pool;
mod reverse;
mod router;
mod tls;

pub use addr::{has_port, host_of, with_default_port};
pub use codec::RawCodec;
pub use dialer::{
    Dialer, DirectDialer, NoProxy, ProxyDialer, UpstreamProxy, DEFAULT_CONNECT_TIMEOUT,
};
pub use forward::proxy_bidirectional;
pub use handler::StreamHandler;
pub use interceptor::{
    isolate, CallInfo, CallResult, MessageStream, Next, PanicGuard, ProxyCall, StreamInterceptor,
};
pub use listener::{ProxyListener, Redirector};
pub use marker::{
    add_https_marker, add_loop_check, is_tls_request, is_tls_rpc, remove_https_marker,
    remove_https_marker_from_headers, HTTPS_MARKER,
};
pub use mux::{
    bounce_non_http, is_proxied_http, is_tls_handshake, route_tls, MuxListener, TlsMux, TlsRoute,
};
pub use pool::{ConnPool, EndpointOption};
pub use reverse::ReverseProxy;
pub use router::{CallTarget, Dispatch, ProxyBody, Router};
pub use tls::{
    client_config, detect_key_pair, load_key_pair, server_config, InterceptionCert, KeyLogFile,
    KeyPair,
};

use http::header::{HeaderMap, CONNECTION};

/// Connection-scoped headers that must not be forwarded.
const HOP_BY_HOP_HEADERS: [&str; 9] = [
    "connection",
    "keep-alive",
    "proxy-connection",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// Remove hop-by-hop headers, including any named in `Connection`.
pub(crate) fn strip_hop_by_hop(headers: &mut HeaderMap) {
    let named: Vec<String> = headers
        .get_all(CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .map(|name| name.trim().to_ascii_lowercase())
        .filter(|name| !name.is_empty())
        .collect();
    for name in named {
        headers.remove(name.as_str());
    }
    for name in HOP_BY_HOP_HEADERS {
        headers.remove(name);
    }
}
