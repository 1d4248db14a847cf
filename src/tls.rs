//! TLS termination material
//!
//! The gateway loads a private key, leaf certificate and CA chain once at
//! startup from fixed paths under the resources root. All three must parse
//! before the HTTPS listener may bind; a failure disables the HTTPS listener
//! only, leaving the plaintext listener untouched. The material is never
//! reloaded, so certificate rotation requires a gateway restart.

use crate::config::TlsPaths;
use crate::error::GatewayError;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;
use tokio_rustls::TlsAcceptor;
use tracing::info;

/// Key, leaf certificate and CA chain loaded from disk.
#[derive(Debug)]
pub struct TlsMaterial {
    /// Leaf certificate followed by the CA chain
    certs: Vec<CertificateDer<'static>>,
    key: PrivateKeyDer<'static>,
}

impl TlsMaterial {
    /// Synchronously load and parse all three files.
    pub fn load(paths: &TlsPaths) -> Result<Self, GatewayError> {
        let mut certs = load_certs(&paths.cert)?;
        let ca_chain = load_certs(&paths.ca)?;
        certs.extend(ca_chain);

        let key = load_key(&paths.key)?;

        info!(
            cert = %paths.cert.display(),
            key = %paths.key.display(),
            ca = %paths.ca.display(),
            chain_len = certs.len(),
            "TLS material loaded"
        );

        Ok(Self { certs, key })
    }

    /// Build a TLS acceptor serving this material.
    pub fn into_acceptor(self) -> Result<TlsAcceptor, GatewayError> {
        // More than one rustls crypto provider is linked in; pick ring
        // explicitly instead of relying on the process default
        let provider = Arc::new(rustls::crypto::ring::default_provider());
        let config = rustls::ServerConfig::builder_with_provider(provider)
            .with_safe_default_protocol_versions()
            .map_err(|e| GatewayError::TlsConfig(e.to_string()))?
            .with_no_client_auth()
            .with_single_cert(self.certs, self.key)
            .map_err(|e| GatewayError::TlsConfig(e.to_string()))?;

        Ok(TlsAcceptor::from(Arc::new(config)))
    }
}

/// Load the TLS material and build an acceptor in one step.
pub fn load_acceptor(paths: &TlsPaths) -> Result<TlsAcceptor, GatewayError> {
    TlsMaterial::load(paths)?.into_acceptor()
}

fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>, GatewayError> {
    let file = File::open(path).map_err(|e| GatewayError::TlsMaterial {
        path: path.to_path_buf(),
        source: e,
    })?;
    let mut reader = BufReader::new(file);
    let certs = rustls_pemfile::certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| GatewayError::TlsParse {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;

    if certs.is_empty() {
        return Err(GatewayError::TlsParse {
            path: path.to_path_buf(),
            reason: "no certificates found".to_string(),
        });
    }

    Ok(certs)
}

fn load_key(path: &Path) -> Result<PrivateKeyDer<'static>, GatewayError> {
    let file = File::open(path).map_err(|e| GatewayError::TlsMaterial {
        path: path.to_path_buf(),
        source: e,
    })?;
    let mut reader = BufReader::new(file);

    loop {
        let item = rustls_pemfile::read_one(&mut reader).map_err(|e| GatewayError::TlsParse {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;
        match item {
            Some(rustls_pemfile::Item::Pkcs1Key(key)) => return Ok(key.into()),
            Some(rustls_pemfile::Item::Pkcs8Key(key)) => return Ok(key.into()),
            Some(rustls_pemfile::Item::Sec1Key(key)) => return Ok(key.into()),
            None => break,
            _ => continue,
        }
    }

    Err(GatewayError::TlsParse {
        path: path.to_path_buf(),
        reason: "no private key found".to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use rcgen::{generate_simple_self_signed, CertifiedKey};
    use std::fs;

    fn write_material(dir: &Path) -> TlsPaths {
        let CertifiedKey { cert, key_pair } =
            generate_simple_self_signed(vec!["localhost".to_string()]).unwrap();

        let paths = TlsPaths {
            key: dir.join("server.key"),
            cert: dir.join("server.crt"),
            ca: dir.join("rootCA.crt"),
        };
        fs::write(&paths.key, key_pair.serialize_pem()).unwrap();
        fs::write(&paths.cert, cert.pem()).unwrap();
        // Self-signed certificate doubles as its own chain root
        fs::write(&paths.ca, cert.pem()).unwrap();
        paths
    }

    #[test]
    fn test_load_valid_material() {
        let dir = tempfile::tempdir().unwrap();
        let paths = write_material(dir.path());

        let material = TlsMaterial::load(&paths).unwrap();
        assert_eq!(material.certs.len(), 2); // leaf + CA

        material.into_acceptor().unwrap();
    }

    #[test]
    fn test_missing_key_is_error() {
        let dir = tempfile::tempdir().unwrap();
        let mut paths = write_material(dir.path());
        paths.key = dir.path().join("absent.key");

        let err = TlsMaterial::load(&paths).unwrap_err();
        assert!(matches!(err, GatewayError::TlsMaterial { .. }));
    }

    #[test]
    fn test_corrupt_key_is_error() {
        let dir = tempfile::tempdir().unwrap();
        let paths = write_material(dir.path());
        fs::write(&paths.key, "not a pem file").unwrap();

        let err = TlsMaterial::load(&paths).unwrap_err();
        assert!(matches!(err, GatewayError::TlsParse { .. }));
    }

    #[test]
    fn test_empty_cert_file_is_error() {
        let dir = tempfile::tempdir().unwrap();
        let paths = write_material(dir.path());
        fs::write(&paths.cert, "").unwrap();

        let err = TlsMaterial::load(&paths).unwrap_err();
        assert!(matches!(err, GatewayError::TlsParse { .. }));
    }
}
