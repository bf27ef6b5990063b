//! `host:port` helpers shared by the classifier, dialers and handler.

/// Strip the port and any IPv6 brackets from `host:port`.
pub fn host_of(addr: &str) -> &str {
    if let Some(rest) = addr.strip_prefix('[') {
        return match rest.find(']') {
            Some(end) => &rest[..end],
            None => rest,
        };
    }
    match addr.rsplit_once(':') {
        // A bare IPv6 address has more than one colon and no port.
        Some((host, _)) if !host.contains(':') => host,
        Some(_) => addr,
        None => addr,
    }
}

/// Whether `addr` carries an explicit port.
pub fn has_port(addr: &str) -> bool {
    if let Some(rest) = addr.strip_prefix('[') {
        return rest.contains("]:");
    }
    matches!(addr.rsplit_once(':'), Some((host, port)) if !host.contains(':') && !port.is_empty())
}

/// Append the scheme's default port when `authority` has none.
pub fn with_default_port(authority: &str, tls: bool) -> String {
    if has_port(authority) {
        return authority.to_string();
    }
    let port = if tls { 443 } else { 80 };
    if authority.contains(':') && !authority.starts_with('[') {
        format!("[{authority}]:{port}")
    } else {
        format!("{authority}:{port}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_host_of() {
        assert_eq!(host_of("example.com:443"), "example.com");
        assert_eq!(host_of("example.com"), "example.com");
        assert_eq!(host_of("[::1]:8443"), "::1");
        assert_eq!(host_of("::1"), "::1");
        assert_eq!(host_of("127.0.0.1:80"), "127.0.0.1");
    }

    #[test]
    fn test_with_default_port() {
        assert_eq!(with_default_port("example.com", true), "example.com:443");
        assert_eq!(with_default_port("example.com", false), "example.com:80");
        assert_eq!(with_default_port("example.com:50051", true), "example.com:50051");
        assert_eq!(with_default_port("[::1]:9000", false), "[::1]:9000");
        assert_eq!(with_default_port("::1", false), "[::1]:80");
    }
}
