//! Loading TLS material for STARTTLS.

use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;

use rustls::ServerConfig;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};

use crate::error::{Error, Result};

/// Builds server TLS settings from a PEM certificate chain and a PEM private
/// key (PKCS#1, PKCS#8 or SEC1).
///
/// # Errors
///
/// Returns an error if either file cannot be read, holds no usable item, or
/// the key does not match the certificate.
pub fn load_tls(cert_path: &Path, key_path: &Path) -> Result<Arc<ServerConfig>> {
    let certs = load_certs(cert_path)?;
    let key = load_key(key_path)?;

    let config = ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)?;

    Ok(Arc::new(config))
}

fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>> {
    let mut reader = BufReader::new(File::open(path)?);
    let certs = rustls_pemfile::certs(&mut reader).collect::<std::io::Result<Vec<_>>>()?;
    if certs.is_empty() {
        return Err(Error::InvalidCertificate(format!(
            "no certificate in {}",
            path.display()
        )));
    }
    Ok(certs)
}

fn load_key(path: &Path) -> Result<PrivateKeyDer<'static>> {
    let mut reader = BufReader::new(File::open(path)?);
    rustls_pemfile::private_key(&mut reader)?.ok_or_else(|| {
        Error::InvalidCertificate(format!("no private key in {}", path.display()))
    })
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::path::PathBuf;

    use super::*;

    fn fixture(name: &str) -> PathBuf {
        Path::new(env!("CARGO_MANIFEST_DIR"))
            .join("tests/fixtures")
            .join(name)
    }

    #[test]
    fn test_load_pair() {
        let config = load_tls(&fixture("localhost.pem"), &fixture("localhost-key.pem"));
        assert!(config.is_ok());
    }

    #[test]
    fn test_key_file_without_key() {
        let err = load_tls(&fixture("localhost.pem"), &fixture("ca.pem")).unwrap_err();
        assert!(matches!(err, Error::InvalidCertificate(_)));
    }

    #[test]
    fn test_cert_file_without_cert() {
        let err = load_tls(&fixture("localhost-key.pem"), &fixture("localhost-key.pem")).unwrap_err();
        assert!(matches!(err, Error::InvalidCertificate(_)));
    }

    #[test]
    fn test_missing_file() {
        let err = load_tls(&fixture("absent.pem"), &fixture("localhost-key.pem")).unwrap_err();
        assert!(matches!(err, Error::Io(_)));
    }
}
