//! Certificate loading for frontends that terminate TLS.

use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;

use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::ServerConfig;

use crate::error::TlsLoadError;

/// Load a PEM certificate chain and private key into a server config.
pub fn load_server_config(
    crt_path: &Path,
    key_path: &Path,
) -> Result<Arc<ServerConfig>, TlsLoadError> {
    let certs = load_certs(crt_path)?;
    let key = load_private_key(key_path)?;

    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let config = ServerConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()?
        .with_no_client_auth()
        .with_single_cert(certs, key)?;

    Ok(Arc::new(config))
}

fn open(path: &Path) -> Result<BufReader<File>, TlsLoadError> {
    File::open(path)
        .map(BufReader::new)
        .map_err(|source| TlsLoadError::Read {
            path: path.to_path_buf(),
            source,
        })
}

fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>, TlsLoadError> {
    let mut reader = open(path)?;
    let certs = rustls_pemfile::certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|source| TlsLoadError::Read {
            path: path.to_path_buf(),
            source,
        })?;

    if certs.is_empty() {
        return Err(TlsLoadError::NoCertificates(path.to_path_buf()));
    }
    Ok(certs)
}

fn load_private_key(path: &Path) -> Result<PrivateKeyDer<'static>, TlsLoadError> {
    let mut reader = open(path)?;
    rustls_pemfile::private_key(&mut reader)
        .map_err(|source| TlsLoadError::Read {
            path: path.to_path_buf(),
            source,
        })?
        .ok_or_else(|| TlsLoadError::NoPrivateKey(path.to_path_buf()))
}
