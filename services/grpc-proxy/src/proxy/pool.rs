//! Outbound gRPC connection pool.
//!
//! One client channel per `(destination, tls)` pair. Concurrent first callers
//! for the same key share a single dial; a failed dial leaves no entry, so the
//! next caller tries again.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use hyper_util::rt::TokioIo;
use tokio::sync::{OnceCell, RwLock};
use tonic::transport::{Channel, ClientTlsConfig, Endpoint, Uri};
use tracing::{debug, info};

use super::dialer::Dialer;
use crate::error::PoolError;

/// Extra settings applied to every outbound endpoint.
pub type EndpointOption = Arc<dyn Fn(Endpoint) -> Endpoint + Send + Sync>;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct PoolKey {
    destination: String,
    tls: bool,
}

/// Cache of outbound client channels.
pub struct ConnPool {
    channels: RwLock<HashMap<PoolKey, Arc<OnceCell<Channel>>>>,
    dialer: Arc<dyn Dialer>,
    endpoint_options: Vec<EndpointOption>,
    connect_timeout: Duration,
}

impl fmt::Debug for ConnPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnPool")
            .field("endpoint_options", &self.endpoint_options.len())
            .field("connect_timeout", &self.connect_timeout)
            .finish_non_exhaustive()
    }
}

impl ConnPool {
    pub fn new(
        dialer: Arc<dyn Dialer>,
        endpoint_options: Vec<EndpointOption>,
        connect_timeout: Duration,
    ) -> Self {
        Self {
            channels: RwLock::new(HashMap::new()),
            dialer,
            endpoint_options,
            connect_timeout,
        }
    }

    /// Get the channel for `destination`, dialing it on first use.
    pub async fn get_client_connection(
        &self,
        destination: &str,
        tls: bool,
    ) -> Result<Channel, PoolError> {
        let key = PoolKey {
            destination: destination.to_string(),
            tls,
        };
        let cell = self.cell_for(&key).await;
        match cell.get_or_try_init(|| self.connect(destination, tls)).await {
            Ok(channel) => Ok(channel.clone()),
            Err(e) => {
                self.forget(&key, &cell).await;
                Err(e)
            }
        }
    }

    /// Number of keys with an established channel.
    pub async fn len(&self) -> usize {
        let channels = self.channels.read().await;
        channels.values().filter(|cell| cell.initialized()).count()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    async fn cell_for(&self, key: &PoolKey) -> Arc<OnceCell<Channel>> {
        // Fast path: read lock
        {
            let channels = self.channels.read().await;
            if let Some(cell) = channels.get(key) {
                return Arc::clone(cell);
            }
        }

        // Slow path: write lock
        let mut channels = self.channels.write().await;
        Arc::clone(channels.entry(key.clone()).or_default())
    }

    /// Drop `key` after a failed dial, unless another caller has since
    /// replaced or filled its cell.
    async fn forget(&self, key: &PoolKey, cell: &Arc<OnceCell<Channel>>) {
        let mut channels = self.channels.write().await;
        let stale = channels
            .get(key)
            .is_some_and(|current| Arc::ptr_eq(current, cell) && !current.initialized());
        if stale {
            channels.remove(key);
        }
    }

    async fn connect(&self, destination: &str, tls: bool) -> Result<Channel, PoolError> {
        let scheme = if tls { "https" } else { "http" };
        let mut endpoint = Endpoint::from_shared(format!("{scheme}://{destination}"))
            .map_err(|e| PoolError::InvalidDestination {
                destination: destination.to_string(),
                reason: e.to_string(),
            })?
            .connect_timeout(self.connect_timeout);

        if tls {
            endpoint = endpoint
                .tls_config(ClientTlsConfig::new().with_webpki_roots())
                .map_err(|source| PoolError::Connect {
                    destination: destination.to_string(),
                    source,
                })?;
        }
        for option in &self.endpoint_options {
            endpoint = option(endpoint);
        }

        debug!(destination = %destination, tls, "Dialing destination");
        let dialer = Arc::clone(&self.dialer);
        let target = destination.to_string();
        let connector = tower::service_fn(move |_: Uri| {
            let dialer = Arc::clone(&dialer);
            let target = target.clone();
            async move { dialer.dial(&target).await.map(TokioIo::new) }
        });

        let channel = endpoint
            .connect_with_connector(connector)
            .await
            .map_err(|source| PoolError::Connect {
                destination: destination.to_string(),
                source,
            })?;

        info!(destination = %destination, tls, "Connected to destination");
        Ok(channel)
    }
}
