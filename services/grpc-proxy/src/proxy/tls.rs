//! TLS materials: certificate loading, hostname checks, key logging.
//!
//! The proxy terminates TLS only for destinations its certificate covers.
//! [`InterceptionCert`] keeps the subjectAltName entries of the loaded leaf
//! certificate so the classifier can make that decision per connection.

use std::fs::{File, OpenOptions};
use std::io::{self, BufReader, Write};
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::{KeyLog, RootCertStore};
use tracing::warn;
use x509_parser::extensions::GeneralName;

use crate::error::ProxyError;

const KEY_SUFFIX: &str = "-key.pem";
const CERT_SUFFIX: &str = ".pem";

/// ALPN protocols offered on the TLS-terminating branch.
pub const SERVER_ALPN: [&[u8]; 2] = [b"h2", b"http/1.1"];

/// A certificate chain with its private key.
#[derive(Debug)]
pub struct KeyPair {
    pub certs: Vec<CertificateDer<'static>>,
    pub key: PrivateKeyDer<'static>,
}

/// Load a PEM certificate chain and private key.
pub fn load_key_pair(cert_path: &Path, key_path: &Path) -> Result<KeyPair, ProxyError> {
    let mut cert_reader = open(cert_path)?;
    let certs = rustls_pemfile::certs(&mut cert_reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| ProxyError::Certificate {
            path: cert_path.to_path_buf(),
            reason: e.to_string(),
        })?;
    if certs.is_empty() {
        return Err(ProxyError::Certificate {
            path: cert_path.to_path_buf(),
            reason: "no certificates found".to_string(),
        });
    }

    let mut key_reader = open(key_path)?;
    let key = rustls_pemfile::private_key(&mut key_reader)
        .map_err(|e| ProxyError::Certificate {
            path: key_path.to_path_buf(),
            reason: e.to_string(),
        })?
        .ok_or_else(|| ProxyError::Certificate {
            path: key_path.to_path_buf(),
            reason: "no private key found".to_string(),
        })?;

    Ok(KeyPair { certs, key })
}

fn open(path: &Path) -> Result<BufReader<File>, ProxyError> {
    File::open(path)
        .map(BufReader::new)
        .map_err(|source| ProxyError::ReadFile {
            path: path.to_path_buf(),
            source,
        })
}

/// Find an mkcert-style `<name>-key.pem` / `<name>.pem` pair in `dir`.
///
/// Returns `(cert, key)` for the first pair in file name order.
pub fn detect_key_pair(dir: &Path) -> io::Result<Option<(PathBuf, PathBuf)>> {
    let mut names = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        if entry.file_type()?.is_file() {
            names.push(entry.file_name());
        }
    }
    names.sort();

    for name in names {
        let Some(name) = name.to_str() else { continue };
        let Some(prefix) = name.strip_suffix(KEY_SUFFIX) else {
            continue;
        };
        let cert = dir.join(format!("{prefix}{CERT_SUFFIX}"));
        if cert.is_file() {
            return Ok(Some((cert, dir.join(name))));
        }
    }
    Ok(None)
}

/// Hostnames and addresses the interception certificate is valid for.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InterceptionCert {
    dns_names: Vec<String>,
    ip_addrs: Vec<IpAddr>,
}

impl InterceptionCert {
    /// Extract subjectAltName entries from a DER certificate.
    pub fn from_der(der: &[u8]) -> Result<Self, String> {
        let (_, cert) = x509_parser::parse_x509_certificate(der).map_err(|e| e.to_string())?;
        let mut parsed = Self::default();

        let Some(san) = cert.subject_alternative_name().map_err(|e| e.to_string())? else {
            return Ok(parsed);
        };
        for name in &san.value.general_names {
            match name {
                GeneralName::DNSName(dns) => parsed.dns_names.push(dns.to_ascii_lowercase()),
                GeneralName::IPAddress(bytes) => match bytes.len() {
                    4 => {
                        let octets: [u8; 4] = [bytes[0], bytes[1], bytes[2], bytes[3]];
                        parsed.ip_addrs.push(IpAddr::from(octets));
                    }
                    16 => {
                        let mut octets = [0u8; 16];
                        octets.copy_from_slice(bytes);
                        parsed.ip_addrs.push(IpAddr::from(octets));
                    }
                    _ => {}
                },
                _ => {}
            }
        }
        Ok(parsed)
    }

    /// Build from explicit names, mostly useful for tests and callers that
    /// already know the certificate's coverage.
    pub fn from_names<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut parsed = Self::default();
        for name in names {
            let name = name.as_ref();
            match name.parse::<IpAddr>() {
                Ok(ip) => parsed.ip_addrs.push(ip),
                Err(_) => parsed.dns_names.push(name.to_ascii_lowercase()),
            }
        }
        parsed
    }

    pub fn dns_names(&self) -> &[String] {
        &self.dns_names
    }

    /// Whether the certificate covers `host` (no port, no brackets).
    ///
    /// `*.example.com` covers exactly one extra label and the apex
    /// `example.com` itself.
    pub fn verify_hostname(&self, host: &str) -> bool {
        if let Ok(ip) = host.parse::<IpAddr>() {
            return self.ip_addrs.contains(&ip);
        }

        let host = host.trim_end_matches('.').to_ascii_lowercase();
        if host.is_empty() {
            return false;
        }
        self.dns_names.iter().any(|pattern| match pattern.strip_prefix("*.") {
            Some(base) => {
                host == base
                    || host
                        .strip_suffix(base)
                        .and_then(|label| label.strip_suffix('.'))
                        .is_some_and(|label| !label.is_empty() && !label.contains('.'))
            }
            None => host == *pattern,
        })
    }
}

/// Writes TLS session secrets in the NSS key log format.
#[derive(Debug)]
pub struct KeyLogFile {
    file: Mutex<File>,
}

impl KeyLogFile {
    /// Open `path` for appending, creating it if necessary.
    pub fn open(path: &Path) -> Result<Self, ProxyError> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(|source| ProxyError::ReadFile {
                path: path.to_path_buf(),
                source,
            })?;
        Ok(Self {
            file: Mutex::new(file),
        })
    }
}

impl KeyLog for KeyLogFile {
    fn log(&self, label: &str, client_random: &[u8], secret: &[u8]) {
        let line = format!(
            "{label} {} {}\n",
            hex::encode(client_random),
            hex::encode(secret)
        );
        let Ok(mut file) = self.file.lock() else {
            return;
        };
        if let Err(e) = file.write_all(line.as_bytes()) {
            warn!(error = %e, "Failed to write TLS key log");
        }
    }
}

/// Server config for the TLS-terminating branch.
pub fn server_config(
    key_pair: KeyPair,
    key_log: Option<Arc<KeyLogFile>>,
) -> Result<Arc<rustls::ServerConfig>, ProxyError> {
    let mut config = rustls::ServerConfig::builder_with_provider(Arc::new(
        rustls::crypto::ring::default_provider(),
    ))
    .with_safe_default_protocol_versions()?
    .with_no_client_auth()
    .with_single_cert(key_pair.certs, key_pair.key)?;

    config.alpn_protocols = SERVER_ALPN.iter().map(|p| p.to_vec()).collect();
    if let Some(key_log) = key_log {
        config.key_log = key_log;
    }
    Ok(Arc::new(config))
}

/// Client config used to re-encrypt towards a destination, trusting the
/// Mozilla root set plus `extra_roots`.
pub fn client_config(
    key_log: Option<Arc<KeyLogFile>>,
    extra_roots: &[CertificateDer<'static>],
) -> Result<Arc<rustls::ClientConfig>, ProxyError> {
    let mut roots = RootCertStore::empty();
    roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    for root in extra_roots {
        roots.add(root.clone())?;
    }

    let mut config = rustls::ClientConfig::builder_with_provider(Arc::new(
        rustls::crypto::ring::default_provider(),
    ))
    .with_safe_default_protocol_versions()?
    .with_root_certificates(roots)
    .with_no_client_auth();

    if let Some(key_log) = key_log {
        config.key_log = key_log;
    }
    Ok(Arc::new(config))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn github_io_cert() -> InterceptionCert {
        let cert = rcgen::generate_simple_self_signed(vec!["*.github.io".to_string()]).unwrap();
        InterceptionCert::from_der(cert.cert.der()).unwrap()
    }

    #[test]
    fn test_wildcard_covers_label_and_apex() {
        let cert = github_io_cert();
        assert_eq!(cert.dns_names(), ["*.github.io".to_string()]);
        assert!(cert.verify_hostname("github.io"));
        assert!(cert.verify_hostname("grpc-tools.github.io"));
        assert!(cert.verify_hostname("GRPC-TOOLS.GitHub.io."));
        assert!(!cert.verify_hostname("a.b.github.io"));
        assert!(!cert.verify_hostname("other.example.com"));
        assert!(!cert.verify_hostname("notgithub.io"));
    }

    #[test]
    fn test_ip_san() {
        let cert = rcgen::generate_simple_self_signed(vec![
            "localhost".to_string(),
            "127.0.0.1".to_string(),
        ])
        .unwrap();
        let parsed = InterceptionCert::from_der(cert.cert.der()).unwrap();
        assert!(parsed.verify_hostname("localhost"));
        assert!(parsed.verify_hostname("127.0.0.1"));
        assert!(!parsed.verify_hostname("10.0.0.1"));
    }

    #[test]
    fn test_detect_key_pair() {
        let dir = tempfile::tempdir().unwrap();
        assert!(detect_key_pair(dir.path()).unwrap().is_none());

        std::fs::write(dir.path().join("orphan-key.pem"), b"").unwrap();
        std::fs::write(dir.path().join("unrelated.txt"), b"").unwrap();
        assert!(detect_key_pair(dir.path()).unwrap().is_none());

        std::fs::write(dir.path().join("localhost+2-key.pem"), b"").unwrap();
        std::fs::write(dir.path().join("localhost+2.pem"), b"").unwrap();
        let (cert, key) = detect_key_pair(dir.path()).unwrap().unwrap();
        assert_eq!(cert, dir.path().join("localhost+2.pem"));
        assert_eq!(key, dir.path().join("localhost+2-key.pem"));
    }

    #[test]
    fn test_load_key_pair_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let cert = rcgen::generate_simple_self_signed(vec!["localhost".to_string()]).unwrap();
        let cert_path = dir.path().join("localhost.pem");
        let key_path = dir.path().join("localhost-key.pem");
        std::fs::write(&cert_path, cert.cert.pem()).unwrap();
        std::fs::write(&key_path, cert.key_pair.serialize_pem()).unwrap();

        let pair = load_key_pair(&cert_path, &key_path).unwrap();
        assert_eq!(pair.certs.len(), 1);
        assert_eq!(pair.certs[0].as_ref(), cert.cert.der().as_ref());
    }

    #[test]
    fn test_load_key_pair_rejects_missing_key() {
        let dir = tempfile::tempdir().unwrap();
        let cert = rcgen::generate_simple_self_signed(vec!["localhost".to_string()]).unwrap();
        let cert_path = dir.path().join("localhost.pem");
        let key_path = dir.path().join("localhost-key.pem");
        std::fs::write(&cert_path, cert.cert.pem()).unwrap();
        std::fs::write(&key_path, b"not a key").unwrap();

        let err = load_key_pair(&cert_path, &key_path).unwrap_err();
        assert!(matches!(err, ProxyError::Certificate { .. }));
    }

    #[test]
    fn test_client_config_extra_roots() {
        let cert = rcgen::generate_simple_self_signed(vec!["localhost".to_string()]).unwrap();
        let root = CertificateDer::from(cert.cert.der().to_vec());
        assert!(client_config(None, &[root]).is_ok());

        let garbage = CertificateDer::from(b"not a certificate".to_vec());
        let err = client_config(None, &[garbage]).unwrap_err();
        assert!(matches!(err, ProxyError::Tls(_)));
    }

    #[test]
    fn test_key_log_writes_nss_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("keys.log");
        let key_log = KeyLogFile::open(&path).unwrap();
        key_log.log("CLIENT_RANDOM", &[0xab, 0xcd], &[0x01]);

        let contents = std::fs::read_to_string(&path).unwrap();
        assert_eq!(contents, "CLIENT_RANDOM abcd 01\n");
    }
}
