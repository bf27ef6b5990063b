//! Markers the proxy attaches to traffic it handles.
//!
//! - `Forwarded: proto=https` tags requests that reached the proxy over TLS so
//!   the gRPC handler can pick matching security towards the destination.
//! - `Via: HTTP/2.0 <proxy-id>` detects calls that loop back through the same
//!   proxy instance.

use http::header::{HeaderMap, HeaderValue, FORWARDED};
use tonic::metadata::{MetadataMap, MetadataValue};
use tonic::Status;

/// Value of the `forwarded` header marking TLS-originated requests.
pub const HTTPS_MARKER: &str = "proto=https";

const FORWARDED_KEY: &str = "forwarded";
const VIA_KEY: &str = "via";

/// Tag a request that arrived over TLS.
pub fn add_https_marker(headers: &mut HeaderMap) {
    headers.append(FORWARDED, HeaderValue::from_static(HTTPS_MARKER));
}

/// Whether an HTTP request carries the TLS marker.
pub fn is_tls_request(headers: &HeaderMap) -> bool {
    headers
        .get_all(FORWARDED)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .any(|v| v.contains(HTTPS_MARKER))
}

/// Drop the TLS marker from HTTP headers, keeping any other `forwarded`
/// values.
pub fn remove_https_marker_from_headers(headers: &mut HeaderMap) {
    let kept: Vec<HeaderValue> = headers
        .get_all(FORWARDED)
        .iter()
        .filter(|v| v.to_str().map(|s| s != HTTPS_MARKER).unwrap_or(true))
        .cloned()
        .collect();
    headers.remove(FORWARDED);
    for value in kept {
        headers.append(FORWARDED, value);
    }
}

/// Whether gRPC metadata carries the TLS marker.
pub fn is_tls_rpc(metadata: &MetadataMap) -> bool {
    metadata
        .get_all(FORWARDED_KEY)
        .iter()
        .any(|v| v.to_str().map(|s| s == HTTPS_MARKER).unwrap_or(false))
}

/// Drop the TLS marker from gRPC metadata, keeping any other `forwarded`
/// values.
pub fn remove_https_marker(metadata: &mut MetadataMap) {
    let kept: Vec<_> = metadata
        .get_all(FORWARDED_KEY)
        .iter()
        .filter(|v| v.to_str().map(|s| s != HTTPS_MARKER).unwrap_or(true))
        .cloned()
        .collect();
    metadata.remove(FORWARDED_KEY);
    for value in kept {
        metadata.append(FORWARDED_KEY, value);
    }
}

/// Append this proxy to `via`, failing if it is already listed.
pub fn add_loop_check(metadata: &mut MetadataMap, proxy_id: &str) -> Result<(), Status> {
    let via_value = format!("HTTP/2.0 {proxy_id}");

    let seen = metadata
        .get_all(VIA_KEY)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .any(|part| part.trim() == via_value);
    if seen {
        return Err(Status::internal(format!(
            "proxy loop detected, request already handled by {proxy_id}"
        )));
    }

    let value = MetadataValue::try_from(via_value.as_str())
        .map_err(|_| Status::internal("invalid proxy id"))?;
    metadata.append(VIA_KEY, value);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_https_marker_on_headers() {
        let mut headers = HeaderMap::new();
        assert!(!is_tls_request(&headers));

        headers.append(FORWARDED, HeaderValue::from_static("for=192.0.2.60"));
        add_https_marker(&mut headers);
        assert!(is_tls_request(&headers));

        remove_https_marker_from_headers(&mut headers);
        assert!(!is_tls_request(&headers));
        assert_eq!(headers.get(FORWARDED).unwrap(), "for=192.0.2.60");
    }

    #[test]
    fn test_https_marker_on_metadata() {
        let mut headers = HeaderMap::new();
        add_https_marker(&mut headers);
        let mut metadata = MetadataMap::from_headers(headers);
        assert!(is_tls_rpc(&metadata));

        remove_https_marker(&mut metadata);
        assert!(!is_tls_rpc(&metadata));
        assert!(metadata.get(FORWARDED_KEY).is_none());
    }

    #[test]
    fn test_marker_must_match_exactly_in_metadata() {
        let mut metadata = MetadataMap::new();
        metadata.insert(FORWARDED_KEY, MetadataValue::from_static("for=x;proto=https"));
        assert!(!is_tls_rpc(&metadata));
    }

    #[test]
    fn test_loop_check() {
        let mut metadata = MetadataMap::new();
        add_loop_check(&mut metadata, "abc123").unwrap();
        assert_eq!(metadata.get(VIA_KEY).unwrap(), "HTTP/2.0 abc123");

        // A different proxy in the chain is fine.
        add_loop_check(&mut metadata, "def456").unwrap();

        let err = add_loop_check(&mut metadata, "abc123").unwrap_err();
        assert_eq!(err.code(), tonic::Code::Internal);
        assert!(err.message().contains("proxy loop detected"));
    }

    #[test]
    fn test_loop_check_comma_separated() {
        let mut metadata = MetadataMap::new();
        metadata.insert(
            VIA_KEY,
            MetadataValue::from_static("1.1 upstream, HTTP/2.0 abc123"),
        );
        assert!(add_loop_check(&mut metadata, "abc123").is_err());
    }
}
