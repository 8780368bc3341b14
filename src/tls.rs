//! TLS termination for listeners with SSL materials configured.

use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;

use tokio_rustls::rustls::pki_types::{CertificateDer, PrivateKeyDer};
use tokio_rustls::rustls::ServerConfig;
use tokio_rustls::TlsAcceptor;

use rulegate_core::ProxyError;

/// Loads PEM certificate and key files into a TLS acceptor.
///
/// ALPN advertises HTTP/2 and HTTP/1.1 so the auto connection builder
/// can negotiate either protocol.
pub fn load_acceptor(cert_path: &Path, key_path: &Path) -> Result<TlsAcceptor, ProxyError> {
    let certs = read_certs(cert_path)?;
    let key = read_key(key_path)?;

    let mut config = ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|err| {
            ProxyError::Listener(format!(
                "invalid TLS materials ({} / {}): {err}",
                cert_path.display(),
                key_path.display()
            ))
        })?;
    config.alpn_protocols = vec![b"h2".to_vec(), b"http/1.1".to_vec()];

    Ok(TlsAcceptor::from(Arc::new(config)))
}

fn read_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>, ProxyError> {
    let file = File::open(path).map_err(|err| {
        ProxyError::Listener(format!("failed to open certificate {}: {err}", path.display()))
    })?;
    let certs: Vec<CertificateDer<'static>> = rustls_pemfile::certs(&mut BufReader::new(file))
        .collect::<Result<_, _>>()
        .map_err(|err| {
            ProxyError::Listener(format!(
                "failed to parse certificate {}: {err}",
                path.display()
            ))
        })?;
    if certs.is_empty() {
        return Err(ProxyError::Listener(format!(
            "no certificates found in {}",
            path.display()
        )));
    }
    Ok(certs)
}

fn read_key(path: &Path) -> Result<PrivateKeyDer<'static>, ProxyError> {
    let file = File::open(path).map_err(|err| {
        ProxyError::Listener(format!("failed to open key {}: {err}", path.display()))
    })?;
    rustls_pemfile::private_key(&mut BufReader::new(file))
        .map_err(|err| {
            ProxyError::Listener(format!("failed to parse key {}: {err}", path.display()))
        })?
        .ok_or_else(|| {
            ProxyError::Listener(format!("no private key found in {}", path.display()))
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_cert_file() {
        let result = load_acceptor(Path::new("/nonexistent/cert.pem"), Path::new("/nonexistent/key.pem"));
        let err = match result {
            Err(err) => err,
            Ok(_) => panic!("expected an error"),
        };
        assert!(err.to_string().contains("cert.pem"));
    }

    #[test]
    fn test_cert_file_without_certificates() {
        let dir = tempfile::tempdir().unwrap();
        let cert = dir.path().join("empty.pem");
        let key = dir.path().join("key.pem");
        std::fs::write(&cert, "not a pem\n").unwrap();
        std::fs::write(&key, "not a pem\n").unwrap();

        let result = load_acceptor(&cert, &key);
        let err = match result {
            Err(err) => err,
            Ok(_) => panic!("expected an error"),
        };
        assert!(err.to_string().contains("no certificates found"));
    }
}
