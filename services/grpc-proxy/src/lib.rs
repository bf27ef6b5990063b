//! grpc-tools proxy
//!
//! An intercepting proxy for gRPC traffic.
//!
//! The proxy:
//! - Accepts direct connections and HTTP `CONNECT` tunnels on one port
//! - Terminates TLS for destinations its certificate covers, passes the rest
//!   through untouched
//! - Relays gRPC and gRPC-Web calls through a chain of interceptors without
//!   knowing their schemas
//! - Reverse proxies plain HTTP and relays anything else byte for byte

pub mod config;
pub mod error;
pub mod proxy;
pub mod server;

pub use config::{Configurator, Flags, ServerConfig};
pub use error::{DialError, PoolError, ProxyError};
pub use proxy::{CallInfo, CallResult, Dialer, MessageStream, Next, ProxyCall, StreamInterceptor};
pub use server::{ListeningServer, Server};
