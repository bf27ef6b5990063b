//! Proxy configuration.
//!
//! A [`ServerConfig`] starts from defaults and is adjusted by a list of
//! [`Configurator`]s, applied in order. [`Flags`] carries the command line
//! (and `GRPC_PROXY_*` environment) and turns into a configurator with
//! [`from_flags`].

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use rustls::pki_types::CertificateDer;

use crate::error::ProxyError;
use crate::proxy::{
    Dialer, EndpointOption, ProxyDialer, StreamInterceptor, DEFAULT_CONNECT_TIMEOUT,
};

/// Interface bound when none is configured.
pub const DEFAULT_INTERFACE: &str = "localhost";

/// Adjusts a [`ServerConfig`] before the server is built.
pub type Configurator = Box<dyn FnOnce(&mut ServerConfig) + Send>;

/// Everything a proxy server is built from.
pub struct ServerConfig {
    pub interface: String,
    /// Listen port; 0 lets the OS choose.
    pub port: u16,
    pub cert_file: Option<PathBuf>,
    pub key_file: Option<PathBuf>,
    /// Destination for calls that name none themselves.
    pub destination: Option<String>,
    /// Outbound dialer; [`ProxyDialer::from_env`] when unset.
    pub dialer: Option<Arc<dyn Dialer>>,
    pub interceptors: Vec<Arc<dyn StreamInterceptor>>,
    pub endpoint_options: Vec<EndpointOption>,
    /// NSS key log written for every TLS session the proxy takes part in.
    pub tls_secrets_file: Option<PathBuf>,
    pub connect_timeout: Duration,
    pub enable_system_proxy: bool,
    /// Trusted in addition to the Mozilla roots when re-encrypting
    /// intercepted TLS towards its destination.
    pub outbound_root_certificates: Vec<CertificateDer<'static>>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            interface: DEFAULT_INTERFACE.to_string(),
            port: 0,
            cert_file: None,
            key_file: None,
            destination: None,
            dialer: None,
            interceptors: Vec::new(),
            endpoint_options: Vec::new(),
            tls_secrets_file: None,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            enable_system_proxy: false,
            outbound_root_certificates: Vec::new(),
        }
    }
}

impl fmt::Debug for ServerConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerConfig")
            .field("interface", &self.interface)
            .field("port", &self.port)
            .field("cert_file", &self.cert_file)
            .field("key_file", &self.key_file)
            .field("destination", &self.destination)
            .field("custom_dialer", &self.dialer.is_some())
            .field("interceptors", &self.interceptors.len())
            .field("endpoint_options", &self.endpoint_options.len())
            .field("tls_secrets_file", &self.tls_secrets_file)
            .field("connect_timeout", &self.connect_timeout)
            .field("enable_system_proxy", &self.enable_system_proxy)
            .field(
                "outbound_root_certificates",
                &self.outbound_root_certificates.len(),
            )
            .finish()
    }
}

impl ServerConfig {
    /// Apply `configurators` in order on top of the defaults.
    pub fn build<I>(configurators: I) -> Result<Self, ProxyError>
    where
        I: IntoIterator<Item = Configurator>,
    {
        let mut config = Self::default();
        for configure in configurators {
            configure(&mut config);
        }
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ProxyError> {
        if self.interface.trim().is_empty() {
            return Err(ProxyError::Config("interface must not be empty".to_string()));
        }
        match (&self.cert_file, &self.key_file) {
            (Some(_), None) => Err(ProxyError::Config(
                "a certificate was given without a key".to_string(),
            )),
            (None, Some(_)) => Err(ProxyError::Config(
                "a key was given without a certificate".to_string(),
            )),
            _ => Ok(()),
        }
    }

    /// `interface:port`, bracketing IPv6 literals.
    pub fn listen_addr(&self) -> String {
        let interface = self.interface.trim();
        if interface.contains(':') && !interface.starts_with('[') {
            format!("[{interface}]:{}", self.port)
        } else {
            format!("{interface}:{}", self.port)
        }
    }

    /// The configured dialer, or one built from the proxy environment.
    pub fn resolve_dialer(&self) -> Arc<dyn Dialer> {
        match &self.dialer {
            Some(dialer) => Arc::clone(dialer),
            None => Arc::new(ProxyDialer::from_env(self.connect_timeout)),
        }
    }
}

pub fn port(port: u16) -> Configurator {
    Box::new(move |c| c.port = port)
}

pub fn interface(interface: impl Into<String>) -> Configurator {
    let interface = interface.into();
    Box::new(move |c| c.interface = interface)
}

/// Terminate TLS with this certificate chain and key (PEM files).
pub fn using_tls(cert_file: impl Into<PathBuf>, key_file: impl Into<PathBuf>) -> Configurator {
    let cert_file = cert_file.into();
    let key_file = key_file.into();
    Box::new(move |c| {
        c.cert_file = Some(cert_file);
        c.key_file = Some(key_file);
    })
}

/// Send calls without a destination of their own to `destination`.
pub fn with_destination(destination: impl Into<String>) -> Configurator {
    let destination = destination.into();
    Box::new(move |c| c.destination = Some(destination).filter(|d| !d.is_empty()))
}

pub fn with_dialer(dialer: impl Dialer + 'static) -> Configurator {
    let dialer: Arc<dyn Dialer> = Arc::new(dialer);
    Box::new(move |c| c.dialer = Some(dialer))
}

/// Add an interceptor; interceptors run in the order they were added.
pub fn with_interceptor(interceptor: impl StreamInterceptor + 'static) -> Configurator {
    let interceptor: Arc<dyn StreamInterceptor> = Arc::new(interceptor);
    Box::new(move |c| c.interceptors.push(interceptor))
}

pub fn with_endpoint_options<I>(options: I) -> Configurator
where
    I: IntoIterator<Item = EndpointOption>,
{
    let options: Vec<_> = options.into_iter().collect();
    Box::new(move |c| c.endpoint_options.extend(options))
}

pub fn with_tls_secrets_file(path: impl Into<PathBuf>) -> Configurator {
    let path = path.into();
    Box::new(move |c| c.tls_secrets_file = Some(path))
}

pub fn with_connect_timeout(timeout: Duration) -> Configurator {
    Box::new(move |c| c.connect_timeout = timeout)
}

/// Also trust `roots` when re-encrypting intercepted TLS.
pub fn with_outbound_root_certificates<I>(roots: I) -> Configurator
where
    I: IntoIterator<Item = CertificateDer<'static>>,
{
    let roots: Vec<_> = roots.into_iter().collect();
    Box::new(move |c| c.outbound_root_certificates.extend(roots))
}

/// Apply everything given on the command line.
pub fn from_flags(flags: Flags) -> Configurator {
    Box::new(move |c| {
        c.interface = flags.interface;
        c.port = flags.port;
        c.cert_file = flags.cert;
        c.key_file = flags.key;
        c.destination = flags.destination.filter(|d| !d.is_empty());
        c.tls_secrets_file = flags.tls_secrets_file;
        c.enable_system_proxy = flags.system_proxy;
    })
}

/// grpc-proxy - intercepting proxy for gRPC traffic.
#[derive(Debug, Clone, Parser)]
#[command(name = "grpc-proxy")]
#[command(author, version, about, long_about = None)]
pub struct Flags {
    /// Interface to listen on.
    #[arg(long, env = "GRPC_PROXY_INTERFACE", default_value = DEFAULT_INTERFACE)]
    pub interface: String,

    /// Port to listen on (0 picks a free port).
    #[arg(long, env = "GRPC_PROXY_PORT", default_value_t = 0)]
    pub port: u16,

    /// PEM certificate used to intercept TLS.
    #[arg(long, env = "GRPC_PROXY_CERT")]
    pub cert: Option<PathBuf>,

    /// PEM private key for --cert.
    #[arg(long, env = "GRPC_PROXY_KEY")]
    pub key: Option<PathBuf>,

    /// Destination for calls that name none (host:port).
    #[arg(long, env = "GRPC_PROXY_DESTINATION")]
    pub destination: Option<String>,

    /// Log level (trace, debug, info, warn, error); RUST_LOG takes precedence.
    #[arg(long = "log_level", env = "GRPC_PROXY_LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    /// Print how to route system traffic through the proxy.
    #[arg(long = "system_proxy", env = "GRPC_PROXY_SYSTEM_PROXY")]
    pub system_proxy: bool,

    /// Write TLS session secrets to this file (NSS key log format).
    #[arg(long = "tls_secrets_file", env = "GRPC_PROXY_TLS_SECRETS_FILE")]
    pub tls_secrets_file: Option<PathBuf>,
}
