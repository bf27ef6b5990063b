//! Stream interceptors.
//!
//! Interceptors see every proxied call before it reaches the destination and
//! may observe or rewrite both message streams, short-circuit the call, or
//! fail it with a [`Status`]. They run in installation order; each one is
//! isolated so a panic fails only its own call.

use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use async_trait::async_trait;
use bytes::Bytes;
use futures_core::Stream;
use futures_util::FutureExt;
use tonic::metadata::MetadataMap;
use tonic::{Response, Status};
use tracing::warn;

use super::handler::StreamHandler;
use super::marker::remove_https_marker;

/// A stream of raw gRPC messages.
pub type MessageStream = Pin<Box<dyn Stream<Item = Result<Bytes, Status>> + Send + 'static>>;

/// Result of running a call through the rest of the chain.
pub type CallResult = Result<Response<MessageStream>, Status>;

/// Describes a proxied call.
#[derive(Debug, Clone)]
pub struct CallInfo {
    /// Full method path, e.g. `/pkg.Service/Method`.
    pub method: String,
    /// Inbound request metadata, including proxy markers.
    pub metadata: MetadataMap,
    /// Destination named by the call, if the connection was tunneled.
    pub authority: Option<String>,
    /// Whether the call arrived over TLS.
    pub tls: bool,
}

impl CallInfo {
    /// Request metadata as the client sent it, without proxy markers.
    pub fn external_metadata(&self) -> MetadataMap {
        let mut metadata = self.metadata.clone();
        remove_https_marker(&mut metadata);
        metadata
    }
}

/// A call travelling through the interceptor chain.
pub struct ProxyCall {
    pub info: CallInfo,
    /// Messages from the caller.
    pub inbound: MessageStream,
}

/// Intercepts proxied calls.
#[async_trait]
pub trait StreamInterceptor: Send + Sync {
    async fn intercept(&self, call: ProxyCall, next: Next) -> CallResult;
}

/// The remainder of the chain, ending at the proxy handler.
#[derive(Clone)]
pub struct Next {
    chain: Arc<[Arc<dyn StreamInterceptor>]>,
    index: usize,
    handler: Arc<StreamHandler>,
}

impl Next {
    pub(crate) fn new(
        chain: Arc<[Arc<dyn StreamInterceptor>]>,
        handler: Arc<StreamHandler>,
    ) -> Self {
        Self {
            chain,
            index: 0,
            handler,
        }
    }

    /// Pass `call` on to the next interceptor, or to the destination.
    pub async fn run(self, call: ProxyCall) -> CallResult {
        match self.chain.get(self.index).cloned() {
            Some(interceptor) => {
                let next = Self {
                    index: self.index + 1,
                    ..self
                };
                isolate(interceptor.intercept(call, next)).await
            }
            None => self.handler.handle(call).await,
        }
    }
}

/// Turn panics in `call`, or in the response stream it yields, into
/// `INTERNAL` statuses.
pub async fn isolate<F>(call: F) -> CallResult
where
    F: Future<Output = CallResult>,
{
    match AssertUnwindSafe(call).catch_unwind().await {
        Ok(Ok(response)) => {
            let (metadata, stream, extensions) = response.into_parts();
            let stream: MessageStream = Box::pin(PanicGuard::new(stream));
            Ok(Response::from_parts(metadata, stream, extensions))
        }
        Ok(Err(status)) => Err(status),
        Err(panic) => Err(panic_status(panic)),
    }
}

/// Wraps a message stream so a panic while polling ends it with `INTERNAL`.
pub struct PanicGuard {
    inner: MessageStream,
    done: bool,
}

impl PanicGuard {
    pub fn new(inner: MessageStream) -> Self {
        Self { inner, done: false }
    }
}

impl Stream for PanicGuard {
    type Item = Result<Bytes, Status>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        if self.done {
            return Poll::Ready(None);
        }
        let inner = &mut self.inner;
        match std::panic::catch_unwind(AssertUnwindSafe(|| inner.as_mut().poll_next(cx))) {
            Ok(poll) => poll,
            Err(panic) => {
                self.done = true;
                Poll::Ready(Some(Err(panic_status(panic))))
            }
        }
    }
}

fn panic_status(panic: Box<dyn Any + Send>) -> Status {
    let message = if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    };
    warn!(panic = %message, "Recovered from panic in proxied call");
    Status::internal(format!("proxy error: {message}"))
}
