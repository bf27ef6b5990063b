//! Proxy server lifecycle.
//!
//! [`Server::new`] resolves configuration and TLS materials, [`Server::listen`]
//! binds the socket, and [`ListeningServer::serve`] runs the plaintext and TLS
//! branches until one of them stops.

use std::io;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use peekconn::{BoxedConnection, ProxiedConn, ProxiedConnection};
use tokio_rustls::{TlsAcceptor, TlsConnector};
use tracing::{debug, info, info_span, warn, Instrument};

use crate::config::{Configurator, ServerConfig};
use crate::error::ProxyError;
use crate::proxy::{
    bounce_non_http, client_config, detect_key_pair, load_key_pair, server_config, ConnPool,
    Dialer, InterceptionCert, KeyLogFile, MuxListener, ProxyListener, ReverseProxy, Router,
    StreamHandler, StreamInterceptor, TlsMux,
};

#[derive(Clone)]
struct TlsMaterials {
    cert: Arc<InterceptionCert>,
    acceptor: TlsAcceptor,
    connector: TlsConnector,
}

/// A configured, not yet bound proxy.
pub struct Server {
    listen_addr: String,
    proxy_id: String,
    dialer: Arc<dyn Dialer>,
    interceptors: Vec<Arc<dyn StreamInterceptor>>,
    handler: Arc<StreamHandler>,
    reverse: ReverseProxy,
    tls: Option<TlsMaterials>,
}

impl Server {
    pub fn new<I>(configurators: I) -> Result<Self, ProxyError>
    where
        I: IntoIterator<Item = Configurator>,
    {
        // Ignored if the process already installed one.
        let _ = rustls::crypto::ring::default_provider().install_default();

        let config = ServerConfig::build(configurators)?;
        let tls = load_tls(&config)?;
        let proxy_id = hex::encode(rand::random::<[u8; 8]>());
        let dialer = config.resolve_dialer();
        let listen_addr = config.listen_addr();

        let pool = ConnPool::new(
            Arc::clone(&dialer),
            config.endpoint_options,
            config.connect_timeout,
        );
        let handler = Arc::new(StreamHandler::new(
            Arc::new(pool),
            config.destination.clone(),
            proxy_id.clone(),
        ));
        let reverse = ReverseProxy::new(config.connect_timeout)?;

        info!(
            proxy_id = %proxy_id,
            destination = config.destination.as_deref().unwrap_or("-"),
            tls = tls.is_some(),
            interceptors = config.interceptors.len(),
            "Proxy configured"
        );

        Ok(Self {
            listen_addr,
            proxy_id,
            dialer,
            interceptors: config.interceptors,
            handler,
            reverse,
            tls,
        })
    }

    /// Random id this instance adds to `via`.
    pub fn proxy_id(&self) -> &str {
        &self.proxy_id
    }

    pub async fn listen(self) -> Result<ListeningServer, ProxyError> {
        let listener = ProxyListener::bind(&self.listen_addr).await?;
        let local_addr = listener.local_addr();
        info!(bind_addr = %local_addr, "Listener bound");

        let router = Router::new(
            self.interceptors,
            self.handler,
            self.reverse,
            listener.redirector(),
        );
        Ok(ListeningServer {
            listener,
            local_addr,
            router,
            dialer: self.dialer,
            tls: self.tls,
        })
    }

    /// Bind and serve until a server loop stops.
    pub async fn start(self) -> Result<(), ProxyError> {
        self.listen().await?.serve().await
    }
}

/// A bound proxy, ready to serve.
pub struct ListeningServer {
    listener: ProxyListener,
    local_addr: SocketAddr,
    router: Router,
    dialer: Arc<dyn Dialer>,
    tls: Option<TlsMaterials>,
}

impl ListeningServer {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub async fn serve(self) -> Result<(), ProxyError> {
        let cert = self.tls.as_ref().map(|tls| Arc::clone(&tls.cert));
        let (plain, tls) = TlsMux::new(cert, Arc::clone(&self.dialer)).split(self.listener);

        tokio::select! {
            result = serve_plain(plain, self.router.clone(), Arc::clone(&self.dialer)) => result,
            result = serve_tls(tls, self.router, self.dialer, self.tls) => result,
        }
    }
}

async fn serve_plain(
    mut plain: MuxListener,
    router: Router,
    dialer: Arc<dyn Dialer>,
) -> Result<(), ProxyError> {
    while let Some(conn) = plain.accept().await {
        let router = router.clone();
        let dialer = Arc::clone(&dialer);
        let span = info_span!(
            "plain",
            destination = conn.original_destination().unwrap_or("-")
        );
        tokio::spawn(
            async move {
                match bounce_non_http(conn, dialer.as_ref(), None).await {
                    Ok(Some(conn)) => router.serve_connection(conn).await,
                    Ok(None) => {}
                    Err(e) => debug!(error = %e, "Dropping connection"),
                }
            }
            .instrument(span),
        );
    }
    Err(listener_stopped("plaintext"))
}

async fn serve_tls(
    mut tls: MuxListener,
    router: Router,
    dialer: Arc<dyn Dialer>,
    materials: Option<TlsMaterials>,
) -> Result<(), ProxyError> {
    while let Some(conn) = tls.accept().await {
        let Some(materials) = materials.clone() else {
            warn!("TLS connection received but no certificate is configured, dropping");
            continue;
        };
        let router = router.clone();
        let dialer = Arc::clone(&dialer);
        let span = info_span!(
            "tls",
            destination = conn.original_destination().unwrap_or("-")
        );
        tokio::spawn(
            async move {
                let destination = conn.original_destination().map(str::to_owned);
                let stream = match materials.acceptor.accept(conn).await {
                    Ok(stream) => stream,
                    Err(e) => {
                        debug!(error = %e, "TLS handshake failed");
                        return;
                    }
                };
                let conn: BoxedConnection = Box::new(ProxiedConn::new(stream, destination, true));
                match bounce_non_http(conn, dialer.as_ref(), Some(&materials.connector)).await {
                    Ok(Some(conn)) => router.serve_connection(conn).await,
                    Ok(None) => {}
                    Err(e) => debug!(error = %e, "Dropping connection"),
                }
            }
            .instrument(span),
        );
    }
    Err(listener_stopped("TLS"))
}

fn listener_stopped(branch: &str) -> ProxyError {
    ProxyError::Io(io::Error::new(
        io::ErrorKind::BrokenPipe,
        format!("{branch} listener stopped"),
    ))
}

fn load_tls(config: &ServerConfig) -> Result<Option<TlsMaterials>, ProxyError> {
    let Some((cert_path, key_path)) = key_pair_paths(config)? else {
        if config.tls_secrets_file.is_some() {
            warn!("TLS secrets file ignored, no certificate configured");
        }
        info!("No certificate configured, TLS will not be intercepted");
        return Ok(None);
    };

    let key_pair = load_key_pair(&cert_path, &key_path)?;
    let leaf = key_pair.certs.first().ok_or_else(|| ProxyError::Certificate {
        path: cert_path.clone(),
        reason: "no certificates found".to_string(),
    })?;
    let cert = InterceptionCert::from_der(leaf).map_err(|reason| ProxyError::Certificate {
        path: cert_path.clone(),
        reason,
    })?;
    info!(
        cert = %cert_path.display(),
        hostnames = ?cert.dns_names(),
        "Loaded interception certificate"
    );

    let key_log = config
        .tls_secrets_file
        .as_deref()
        .map(KeyLogFile::open)
        .transpose()?
        .map(Arc::new);
    if let Some(path) = &config.tls_secrets_file {
        info!(path = %path.display(), "Writing TLS secrets");
    }

    Ok(Some(TlsMaterials {
        cert: Arc::new(cert),
        acceptor: TlsAcceptor::from(server_config(key_pair, key_log.clone())?),
        connector: TlsConnector::from(client_config(
            key_log,
            &config.outbound_root_certificates,
        )?),
    }))
}

fn key_pair_paths(config: &ServerConfig) -> Result<Option<(PathBuf, PathBuf)>, ProxyError> {
    if let (Some(cert), Some(key)) = (&config.cert_file, &config.key_file) {
        return Ok(Some((cert.clone(), key.clone())));
    }
    let cwd = std::env::current_dir()?;
    let detected = detect_key_pair(&cwd)?;
    if let Some((cert, key)) = &detected {
        info!(
            cert = %cert.display(),
            key = %key.display(),
            "Detected certificate in working directory"
        );
    }
    Ok(detected)
}
