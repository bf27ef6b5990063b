//! Plain HTTP reverse proxy for requests that are not gRPC.
//!
//! The upstream URL is rebuilt from the request's `Host` with `https` when the
//! request carries the TLS marker. Bodies are streamed in both directions.

use std::time::Duration;

use bytes::Bytes;
use futures_util::TryStreamExt;
use http::request::Parts;
use http::{header, Request, Response, StatusCode};
use http_body_util::{BodyExt, StreamBody};
use hyper::body::{Body, Frame, Incoming};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, warn};

use super::marker::{is_tls_request, remove_https_marker_from_headers};
use super::router::{status_response, BoxError, ProxyBody};
use super::strip_hop_by_hop;
use crate::error::ProxyError;

/// Request body chunks buffered ahead of the upstream connection.
const BODY_BUFFER: usize = 8;

/// Forwards requests to the host they name.
#[derive(Debug, Clone)]
pub struct ReverseProxy {
    client: reqwest::Client,
}

impl ReverseProxy {
    pub fn new(connect_timeout: Duration) -> Result<Self, ProxyError> {
        let client = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .connect_timeout(connect_timeout)
            .build()?;
        Ok(Self { client })
    }

    pub async fn forward(&self, req: Request<Incoming>) -> Response<ProxyBody> {
        let tls = is_tls_request(req.headers());
        let (parts, body) = req.into_parts();
        let Some(url) = target_url(&parts, tls) else {
            debug!(uri = %parts.uri, "Request names no host");
            return status_response(StatusCode::BAD_REQUEST);
        };

        let mut headers = parts.headers;
        remove_https_marker_from_headers(&mut headers);
        strip_hop_by_hop(&mut headers);
        headers.remove(header::HOST);

        let mut upstream = self
            .client
            .request(parts.method, url.as_str())
            .headers(headers);
        if !body.is_end_stream() {
            upstream = upstream.body(reqwest::Body::wrap_stream(pipe_body(body)));
        }

        match upstream.send().await {
            Ok(response) => {
                debug!(url = %url, status = %response.status(), "Reverse proxied request");
                into_response(response)
            }
            Err(e) => {
                warn!(url = %url, error = %e, "Reverse proxy request failed");
                status_response(StatusCode::BAD_GATEWAY)
            }
        }
    }
}

/// `{scheme}://{host}{path}` for the request, `None` without a host.
fn target_url(parts: &Parts, tls: bool) -> Option<String> {
    let host = parts
        .headers
        .get(header::HOST)
        .and_then(|v| v.to_str().ok())
        .map(str::to_owned)
        .or_else(|| parts.uri.authority().map(|a| a.to_string()))
        .filter(|h| !h.is_empty())?;
    let scheme = if tls { "https" } else { "http" };
    let path = parts
        .uri
        .path_and_query()
        .map(|p| p.as_str())
        .unwrap_or("/");
    Some(format!("{scheme}://{host}{path}"))
}

/// Move the inbound body onto a channel so the upstream client gets a
/// `Sync` stream.
fn pipe_body(mut body: Incoming) -> ReceiverStream<Result<Bytes, hyper::Error>> {
    let (tx, rx) = mpsc::channel(BODY_BUFFER);
    tokio::spawn(async move {
        while let Some(frame) = body.frame().await {
            match frame {
                Ok(frame) => {
                    if let Ok(data) = frame.into_data() {
                        if tx.send(Ok(data)).await.is_err() {
                            return;
                        }
                    }
                }
                Err(e) => {
                    let _ = tx.send(Err(e)).await;
                    return;
                }
            }
        }
    });
    ReceiverStream::new(rx)
}

fn into_response(upstream: reqwest::Response) -> Response<ProxyBody> {
    let status = upstream.status();
    let mut headers = upstream.headers().clone();
    strip_hop_by_hop(&mut headers);

    let body = StreamBody::new(
        upstream
            .bytes_stream()
            .map_ok(Frame::data)
            .map_err(BoxError::from),
    );
    let mut response = Response::new(body.boxed_unsync());
    *response.status_mut() = status;
    *response.headers_mut() = headers;
    response
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parts(uri: &str, host: Option<&str>) -> Parts {
        let mut builder = Request::builder().uri(uri);
        if let Some(host) = host {
            builder = builder.header(header::HOST, host);
        }
        builder.body(()).unwrap().into_parts().0
    }

    #[test]
    fn test_target_url_from_host_header() {
        let p = parts("/index.html?q=1", Some("example.com"));
        assert_eq!(
            target_url(&p, false).unwrap(),
            "http://example.com/index.html?q=1"
        );
        assert_eq!(
            target_url(&p, true).unwrap(),
            "https://example.com/index.html?q=1"
        );
    }

    #[test]
    fn test_target_url_from_absolute_uri() {
        let p = parts("http://example.com:8080/a", None);
        assert_eq!(target_url(&p, false).unwrap(), "http://example.com:8080/a");
    }

    #[test]
    fn test_target_url_without_host() {
        assert!(target_url(&parts("/a", None), false).is_none());
    }
}
