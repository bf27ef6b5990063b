//! HTTP router.
//!
//! Serves HTTP/1.1 and HTTP/2 on connections handed over by the classifier
//! and dispatches each request to one of three places:
//!
//! - `CONNECT` hijacks the connection and re-injects it into the listener,
//!   tagged with the requested host
//! - gRPC, gRPC-Web and gRPC-Web CORS preflights go to the stream proxy
//! - everything else goes to the plain reverse proxy
//!
//! CORS headers are only added to gRPC-Web traffic; native gRPC responses
//! pass through untouched.

use std::convert::Infallible;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use bytes::Bytes;
use futures_util::future::BoxFuture;
use http::header::{self, HeaderName};
use http::{Method, Request, Response, StatusCode, Version};
use http_body_util::combinators::UnsyncBoxBody;
use http_body_util::{BodyExt, Empty};
use hyper::body::Incoming;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto;
use peekconn::BoxedConnection;
use tonic::codec::{CompressionEncoding, Streaming};
use tonic::server::StreamingService;
use tonic::Status;
use tower::util::BoxCloneService;
use tower::{Service, ServiceBuilder, ServiceExt};
use tower_http::cors::{AllowHeaders, AllowMethods, AllowOrigin, CorsLayer};
use tracing::{debug, info_span, warn, Instrument};

use super::codec::RawCodec;
use super::handler::StreamHandler;
use super::interceptor::{CallInfo, MessageStream, Next, ProxyCall, StreamInterceptor};
use super::listener::Redirector;
use super::marker::add_https_marker;
use super::reverse::ReverseProxy;

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Response body produced by every route.
pub type ProxyBody = UnsyncBoxBody<Bytes, BoxError>;

type GrpcService =
    BoxCloneService<Request<tonic::body::BoxBody>, Response<tonic::body::BoxBody>, Infallible>;

const GRPC_CONTENT_TYPE: &str = "application/grpc";
const GRPC_WEB_CONTENT_TYPE: &str = "application/grpc-web";
const GRPC_WEB_HEADER: &str = "x-grpc-web";
const CORS_MAX_AGE: Duration = Duration::from_secs(24 * 60 * 60);

/// Where a request is sent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatch {
    Connect,
    Grpc,
    ReverseProxy,
}

impl Dispatch {
    pub fn for_request<B>(req: &Request<B>) -> Self {
        if req.method() == Method::CONNECT {
            Dispatch::Connect
        } else if is_grpc_request(req) {
            Dispatch::Grpc
        } else {
            Dispatch::ReverseProxy
        }
    }
}

fn is_grpc_request<B>(req: &Request<B>) -> bool {
    let content_type = req
        .headers()
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");

    content_type.starts_with(GRPC_WEB_CONTENT_TYPE)
        || (req.version() == Version::HTTP_2 && content_type.starts_with(GRPC_CONTENT_TYPE))
        || is_grpc_web_preflight(req)
}

fn is_grpc_web<B>(req: &Request<B>) -> bool {
    req.headers()
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|ct| ct.starts_with(GRPC_WEB_CONTENT_TYPE))
        || is_grpc_web_preflight(req)
}

fn is_grpc_web_preflight<B>(req: &Request<B>) -> bool {
    req.method() == Method::OPTIONS
        && req
            .headers()
            .get_all(header::ACCESS_CONTROL_REQUEST_HEADERS)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .flat_map(|v| v.split(','))
            .any(|h| h.trim().eq_ignore_ascii_case(GRPC_WEB_HEADER))
}

/// Routing facts attached to each gRPC request.
#[derive(Debug, Clone, Default)]
pub struct CallTarget {
    /// Destination named by the request; `None` for connections made
    /// directly to the proxy.
    pub authority: Option<String>,
    /// Whether the request arrived over TLS.
    pub tls: bool,
}

#[derive(Debug, Clone, Copy)]
struct ConnInfo {
    tls: bool,
    direct: bool,
}

/// Per-connection HTTP dispatcher.
#[derive(Clone)]
pub struct Router {
    grpc: GrpcService,
    grpc_web: GrpcService,
    reverse: ReverseProxy,
    redirector: Redirector,
}

impl Router {
    pub fn new(
        interceptors: Vec<Arc<dyn StreamInterceptor>>,
        handler: Arc<StreamHandler>,
        reverse: ReverseProxy,
        redirector: Redirector,
    ) -> Self {
        let proxy = GrpcProxyService {
            chain: interceptors.into(),
            handler,
        };
        let grpc_web = ServiceBuilder::new()
            .layer(cors_layer())
            .layer(tonic_web::GrpcWebLayer::new())
            .service(proxy.clone());

        Self {
            grpc: BoxCloneService::new(proxy),
            grpc_web: BoxCloneService::new(grpc_web),
            reverse,
            redirector,
        }
    }

    /// Serve HTTP on `conn` until the client goes away.
    pub async fn serve_connection(self, conn: BoxedConnection) {
        let info = ConnInfo {
            tls: conn.is_tls(),
            direct: conn.original_destination().is_none(),
        };
        let span = info_span!(
            "connection",
            destination = conn.original_destination().unwrap_or("-"),
            tls = info.tls
        );

        let service = hyper::service::service_fn(move |req| self.clone().route(req, info));
        let builder = auto::Builder::new(TokioExecutor::new());
        if let Err(e) = builder
            .serve_connection_with_upgrades(TokioIo::new(conn), service)
            .instrument(span)
            .await
        {
            debug!(error = %e, "HTTP connection closed with error");
        }
    }

    async fn route(
        self,
        mut req: Request<Incoming>,
        conn: ConnInfo,
    ) -> Result<Response<ProxyBody>, Infallible> {
        if conn.tls {
            add_https_marker(req.headers_mut());
        }

        let dispatch = Dispatch::for_request(&req);
        debug!(method = %req.method(), uri = %req.uri(), ?dispatch, "Routing request");

        let response = match dispatch {
            Dispatch::Connect => self.connect(req, conn),
            Dispatch::Grpc => self.serve_grpc(req, conn).await,
            Dispatch::ReverseProxy => self.reverse.forward(req).await,
        };
        Ok(response)
    }

    fn connect(&self, mut req: Request<Incoming>, conn: ConnInfo) -> Response<ProxyBody> {
        if req.version() >= Version::HTTP_2 {
            debug!("Rejecting CONNECT over HTTP/2");
            return status_response(StatusCode::METHOD_NOT_ALLOWED);
        }
        let Some(host) = request_authority(&req) else {
            return status_response(StatusCode::BAD_REQUEST);
        };

        let on_upgrade = hyper::upgrade::on(&mut req);
        let redirector = self.redirector.clone();
        tokio::spawn(
            async move {
                match on_upgrade.await {
                    Ok(upgraded) => {
                        let tunnel = TokioIo::new(upgraded);
                        if let Err(e) = redirector.redirect(tunnel, &host, conn.tls).await {
                            warn!(destination = %host, error = %e, "Failed to re-inject tunnel");
                        }
                    }
                    Err(e) => warn!(destination = %host, error = %e, "CONNECT upgrade failed"),
                }
            }
            .in_current_span(),
        );

        Response::new(empty_body())
    }

    async fn serve_grpc(self, mut req: Request<Incoming>, conn: ConnInfo) -> Response<ProxyBody> {
        let authority = if conn.direct {
            None
        } else {
            request_authority(&req)
        };
        req.extensions_mut().insert(CallTarget {
            authority,
            tls: conn.tls,
        });

        let service = if is_grpc_web(&req) {
            self.grpc_web
        } else {
            self.grpc
        };
        let req = req.map(tonic::body::boxed);
        let response = match service.oneshot(req).await {
            Ok(response) => response,
            Err(never) => match never {},
        };
        response.map(|body| body.map_err(BoxError::from).boxed_unsync())
    }
}

fn request_authority<B>(req: &Request<B>) -> Option<String> {
    req.uri()
        .authority()
        .map(|a| a.to_string())
        .or_else(|| {
            req.headers()
                .get(header::HOST)
                .and_then(|v| v.to_str().ok())
                .map(str::to_owned)
        })
        .filter(|a| !a.is_empty())
}

fn cors_layer() -> CorsLayer {
    CorsLayer::new()
        .allow_origin(AllowOrigin::mirror_request())
        .allow_methods(AllowMethods::mirror_request())
        .allow_headers(AllowHeaders::mirror_request())
        .allow_credentials(true)
        .expose_headers([
            HeaderName::from_static("grpc-status"),
            HeaderName::from_static("grpc-message"),
            HeaderName::from_static("grpc-status-details-bin"),
        ])
        .max_age(CORS_MAX_AGE)
}

pub(crate) fn empty_body() -> ProxyBody {
    Empty::<Bytes>::new()
        .map_err(|never| match never {})
        .boxed_unsync()
}

pub(crate) fn status_response(status: StatusCode) -> Response<ProxyBody> {
    let mut response = Response::new(empty_body());
    *response.status_mut() = status;
    response
}

/// Adapts HTTP requests onto the interceptor chain.
#[derive(Clone)]
struct GrpcProxyService {
    chain: Arc<[Arc<dyn StreamInterceptor>]>,
    handler: Arc<StreamHandler>,
}

impl Service<Request<tonic::body::BoxBody>> for GrpcProxyService {
    type Response = Response<tonic::body::BoxBody>;
    type Error = Infallible;
    type Future = BoxFuture<'static, Result<Self::Response, Self::Error>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: Request<tonic::body::BoxBody>) -> Self::Future {
        let call = ProxyCallService {
            method: req.uri().path().to_string(),
            chain: Arc::clone(&self.chain),
            handler: Arc::clone(&self.handler),
        };
        Box::pin(async move {
            let mut grpc = tonic::server::Grpc::new(RawCodec)
                .accept_compressed(CompressionEncoding::Gzip)
                .send_compressed(CompressionEncoding::Gzip);
            Ok(grpc.streaming(call, req).await)
        })
    }
}

struct ProxyCallService {
    method: String,
    chain: Arc<[Arc<dyn StreamInterceptor>]>,
    handler: Arc<StreamHandler>,
}

impl StreamingService<Bytes> for ProxyCallService {
    type Response = Bytes;
    type ResponseStream = MessageStream;
    type Future = BoxFuture<'static, Result<tonic::Response<MessageStream>, Status>>;

    fn call(&mut self, request: tonic::Request<Streaming<Bytes>>) -> Self::Future {
        let (metadata, extensions, inbound) = request.into_parts();
        let target = extensions.get::<CallTarget>().cloned().unwrap_or_default();
        let call = ProxyCall {
            info: CallInfo {
                method: self.method.clone(),
                metadata,
                authority: target.authority,
                tls: target.tls,
            },
            inbound: Box::pin(inbound),
        };
        let next = Next::new(Arc::clone(&self.chain), Arc::clone(&self.handler));
        Box::pin(next.run(call))
    }
}
