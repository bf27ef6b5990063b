//! Stream proxy handler.
//!
//! Relays one intercepted RPC to its destination. Payloads are opaque bytes,
//! so any method on any service can be proxied without schema knowledge.
//!
//! Each call runs three tasks: client→destination, destination→client, and
//! an arbitration task that waits for the first of them to report and decides
//! how the call ends. Both relay tasks report over capacity-1 channels that
//! are never closed explicitly.

use std::sync::Arc;

use bytes::Bytes;
use futures_util::StreamExt;
use http::uri::PathAndQuery;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::ReceiverStream;
use tonic::codec::{CompressionEncoding, Streaming};
use tonic::metadata::MetadataMap;
use tonic::transport::Channel;
use tonic::{Code, Extensions, Request, Response, Status};
use tracing::{debug, info_span, warn, Instrument};

use super::addr::with_default_port;
use super::codec::RawCodec;
use super::interceptor::{CallInfo, CallResult, MessageStream, PanicGuard, ProxyCall};
use super::marker::{add_loop_check, is_tls_rpc, remove_https_marker};
use super::pool::ConnPool;
use super::strip_hop_by_hop;

/// Messages buffered per direction.
const RELAY_BUFFER: usize = 16;

/// Message encoding is negotiated separately on each leg of the call.
const ENCODING_HEADERS: [&str; 2] = ["grpc-encoding", "grpc-accept-encoding"];

/// Trailer keys that tonic derives from the status itself.
const STATUS_TRAILERS: [&str; 3] = ["grpc-status", "grpc-message", "grpc-status-details-bin"];

/// Terminal handler of the interceptor chain.
#[derive(Debug)]
pub struct StreamHandler {
    pool: Arc<ConnPool>,
    destination_override: Option<String>,
    proxy_id: String,
}

impl StreamHandler {
    pub fn new(
        pool: Arc<ConnPool>,
        destination_override: Option<String>,
        proxy_id: String,
    ) -> Self {
        Self {
            pool,
            destination_override: destination_override.filter(|d| !d.is_empty()),
            proxy_id,
        }
    }

    /// The call's own authority wins, then the configured override.
    pub fn destination_for(&self, info: &CallInfo) -> Result<String, Status> {
        if let Some(authority) = info.authority.as_deref().filter(|a| !a.is_empty()) {
            return Ok(with_default_port(authority, is_tls_rpc(&info.metadata)));
        }
        if let Some(destination) = &self.destination_override {
            return Ok(destination.clone());
        }
        Err(Status::unimplemented("no proxy destination configured"))
    }

    pub async fn handle(&self, call: ProxyCall) -> CallResult {
        let ProxyCall { info, inbound } = call;
        let destination = self.destination_for(&info)?;
        let tls = is_tls_rpc(&info.metadata);

        let mut metadata = outbound_metadata(&info.metadata);
        add_loop_check(&mut metadata, &self.proxy_id)?;

        let path = PathAndQuery::try_from(info.method.as_str())
            .map_err(|_| Status::internal(format!("invalid method path {}", info.method)))?;

        let span = info_span!("rpc", method = %info.method, destination = %destination, tls);
        async move {
            let channel = self
                .pool
                .get_client_connection(&destination, tls)
                .await
                .map_err(|e| {
                    warn!(error = %e, "Failed to connect to destination");
                    Status::unavailable(e.to_string())
                })?;
            relay(channel, path, metadata, inbound).await
        }
        .instrument(span)
        .await
    }
}

/// Inbound metadata minus connection-level headers and proxy markers.
fn outbound_metadata(inbound: &MetadataMap) -> MetadataMap {
    let mut metadata = inbound.clone();
    remove_https_marker(&mut metadata);
    let mut headers = metadata.into_headers();
    strip_hop_by_hop(&mut headers);
    headers.remove(http::header::HOST);
    headers.remove(http::header::CONTENT_LENGTH);
    for key in ENCODING_HEADERS {
        headers.remove(key);
    }
    MetadataMap::from_headers(headers)
}

fn response_metadata(head: MetadataMap) -> MetadataMap {
    let mut headers = head.into_headers();
    strip_hop_by_hop(&mut headers);
    headers.remove(http::header::CONTENT_LENGTH);
    for key in ENCODING_HEADERS {
        headers.remove(key);
    }
    MetadataMap::from_headers(headers)
}

/// Custom trailers become an OK status carrying them; `None` when the
/// destination sent only status trailers.
fn trailer_status(trailers: MetadataMap) -> Option<Status> {
    let mut headers = trailers.into_headers();
    for key in STATUS_TRAILERS {
        headers.remove(key);
    }
    if headers.is_empty() {
        return None;
    }
    Some(Status::with_metadata(
        Code::Ok,
        "",
        MetadataMap::from_headers(headers),
    ))
}

struct AbortOnDrop(JoinHandle<()>);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        self.0.abort();
    }
}

enum ServerOutcome {
    /// Destination finished with OK; carries its trailers.
    Finished(MetadataMap),
    /// Destination finished with an error status.
    Failed(Status),
    /// The caller stopped listening.
    CallerGone,
}

async fn relay(
    channel: Channel,
    path: PathAndQuery,
    metadata: MetadataMap,
    inbound: MessageStream,
) -> CallResult {
    let inbound: MessageStream = Box::pin(PanicGuard::new(inbound));
    let (out_tx, out_rx) = mpsc::channel::<Bytes>(RELAY_BUFFER);
    let (c2s_err_tx, mut c2s_err_rx) = mpsc::channel::<Status>(1);
    let c2s = AbortOnDrop(tokio::spawn(
        forward_client_to_server(inbound, out_tx, c2s_err_tx).in_current_span(),
    ));

    let mut request = Request::new(ReceiverStream::new(out_rx));
    *request.metadata_mut() = metadata;

    let mut grpc = tonic::client::Grpc::new(channel)
        .accept_compressed(CompressionEncoding::Gzip);
    let call = async move {
        grpc.ready()
            .await
            .map_err(|e| Status::unavailable(format!("destination not ready: {e}")))?;
        grpc.streaming(request, path, RawCodec).await
    };

    // A failing caller aborts the call even before the destination answers.
    let response = tokio::select! {
        response = call => response?,
        Some(status) = c2s_err_rx.recv() => return Err(client_failure(status)),
    };

    let (head, streaming, _) = response.into_parts();
    let (resp_tx, resp_rx) = mpsc::channel::<Result<Bytes, Status>>(RELAY_BUFFER);
    let (s2c_done_tx, s2c_done_rx) = mpsc::channel::<ServerOutcome>(1);
    let s2c = AbortOnDrop(tokio::spawn(
        forward_server_to_client(streaming, resp_tx.clone(), s2c_done_tx).in_current_span(),
    ));
    tokio::spawn(arbitrate(c2s, s2c, c2s_err_rx, s2c_done_rx, resp_tx).in_current_span());

    let stream: MessageStream = Box::pin(ReceiverStream::new(resp_rx));
    Ok(Response::from_parts(
        response_metadata(head),
        stream,
        Extensions::default(),
    ))
}

fn client_failure(status: Status) -> Status {
    warn!(error = %status, "Failed proxying client to destination");
    Status::internal(format!("failed proxying c2s: {}", status.message()))
}

async fn forward_client_to_server(
    mut inbound: MessageStream,
    out_tx: mpsc::Sender<Bytes>,
    err_tx: mpsc::Sender<Status>,
) {
    while let Some(item) = inbound.next().await {
        match item {
            Ok(message) => {
                if out_tx.send(message).await.is_err() {
                    // Outbound stream already finished.
                    return;
                }
            }
            Err(status) => {
                let _ = err_tx.send(status).await;
                return;
            }
        }
    }
    debug!("Caller finished sending");
    // Dropping out_tx half-closes the outbound stream.
}

async fn forward_server_to_client(
    mut streaming: Streaming<Bytes>,
    resp_tx: mpsc::Sender<Result<Bytes, Status>>,
    done_tx: mpsc::Sender<ServerOutcome>,
) {
    let outcome = loop {
        match streaming.message().await {
            Ok(Some(message)) => {
                if resp_tx.send(Ok(message)).await.is_err() {
                    break ServerOutcome::CallerGone;
                }
            }
            Ok(None) => {
                break match streaming.trailers().await {
                    Ok(trailers) => ServerOutcome::Finished(trailers.unwrap_or_default()),
                    Err(status) => ServerOutcome::Failed(status),
                }
            }
            Err(status) => break ServerOutcome::Failed(status),
        }
    };
    let _ = done_tx.send(outcome).await;
}

async fn arbitrate(
    c2s: AbortOnDrop,
    s2c: AbortOnDrop,
    mut c2s_err_rx: mpsc::Receiver<Status>,
    mut s2c_done_rx: mpsc::Receiver<ServerOutcome>,
    resp_tx: mpsc::Sender<Result<Bytes, Status>>,
) {
    // Dropping these on return cancels whichever relay is still running.
    let _tasks = (c2s, s2c);

    tokio::select! {
        Some(status) = c2s_err_rx.recv() => {
            let _ = resp_tx.send(Err(client_failure(status))).await;
        }
        Some(outcome) = s2c_done_rx.recv() => match outcome {
            ServerOutcome::Finished(trailers) => {
                debug!("Destination finished");
                if let Some(status) = trailer_status(trailers) {
                    let _ = resp_tx.send(Err(status)).await;
                }
            }
            ServerOutcome::Failed(status) => {
                debug!(code = ?status.code(), "Destination returned error");
                let _ = resp_tx.send(Err(status)).await;
            }
            ServerOutcome::CallerGone => debug!("Caller went away"),
        },
        _ = resp_tx.closed() => debug!("Caller went away, cancelling call"),
        else => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proxy::dialer::DirectDialer;
    use std::time::Duration;
    use tonic::metadata::MetadataValue;

    fn handler(destination_override: Option<&str>) -> StreamHandler {
        let pool = ConnPool::new(
            Arc::new(DirectDialer::default()),
            Vec::new(),
            Duration::from_secs(1),
        );
        StreamHandler::new(
            Arc::new(pool),
            destination_override.map(str::to_string),
            "test-proxy".to_string(),
        )
    }

    fn info(authority: Option<&str>) -> CallInfo {
        CallInfo {
            method: "/test.Echo/Echo".to_string(),
            metadata: MetadataMap::new(),
            authority: authority.map(str::to_string),
            tls: false,
        }
    }

    #[test]
    fn test_destination_precedence() {
        let h = handler(Some("fallback:50051"));
        assert_eq!(h.destination_for(&info(Some("svc:9000"))).unwrap(), "svc:9000");
        assert_eq!(h.destination_for(&info(Some("svc"))).unwrap(), "svc:80");
        assert_eq!(h.destination_for(&info(None)).unwrap(), "fallback:50051");
    }

    #[test]
    fn test_no_destination_is_unimplemented() {
        let status = handler(None).destination_for(&info(None)).unwrap_err();
        assert_eq!(status.code(), Code::Unimplemented);
        assert_eq!(status.message(), "no proxy destination configured");
    }

    #[tokio::test]
    async fn test_handle_without_destination() {
        let call = ProxyCall {
            info: info(None),
            inbound: Box::pin(futures_util::stream::empty()),
        };
        let status = handler(None).handle(call).await.err().unwrap();
        assert_eq!(status.code(), Code::Unimplemented);
    }

    #[tokio::test]
    async fn test_handle_detects_loop() {
        let mut call_info = info(Some("127.0.0.1:1"));
        call_info
            .metadata
            .insert("via", MetadataValue::from_static("HTTP/2.0 test-proxy"));
        let call = ProxyCall {
            info: call_info,
            inbound: Box::pin(futures_util::stream::empty()),
        };
        let status = handler(None).handle(call).await.err().unwrap();
        assert_eq!(status.code(), Code::Internal);
        assert!(status.message().contains("proxy loop detected"));
    }

    #[test]
    fn test_outbound_metadata_drops_connection_headers() {
        let mut headers = http::HeaderMap::new();
        crate::proxy::marker::add_https_marker(&mut headers);
        headers.insert("connection", http::HeaderValue::from_static("keep-alive"));
        headers.insert("host", http::HeaderValue::from_static("svc:443"));
        headers.insert("x-request-id", http::HeaderValue::from_static("42"));
        headers.insert("grpc-encoding", http::HeaderValue::from_static("gzip"));

        let outbound = outbound_metadata(&MetadataMap::from_headers(headers));
        assert!(outbound.get("forwarded").is_none());
        assert!(outbound.get("connection").is_none());
        assert!(outbound.get("host").is_none());
        assert!(outbound.get("grpc-encoding").is_none());
        assert_eq!(outbound.get("x-request-id").unwrap(), "42");
    }

    #[test]
    fn test_trailer_status() {
        let mut headers = http::HeaderMap::new();
        headers.insert("grpc-status", http::HeaderValue::from_static("0"));
        assert!(trailer_status(MetadataMap::from_headers(headers.clone())).is_none());

        headers.insert("x-checksum", http::HeaderValue::from_static("abc"));
        let status = trailer_status(MetadataMap::from_headers(headers)).unwrap();
        assert_eq!(status.code(), Code::Ok);
        assert_eq!(status.metadata().get("x-checksum").unwrap(), "abc");
        assert!(status.metadata().get("grpc-status").is_none());
    }
}
