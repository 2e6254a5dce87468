//! rustls server configuration from a certificate bundle.

use std::io::BufReader;
use std::sync::Arc;

use rustls::ServerConfig;

use crate::error::{Error, Result};
use crate::store::CertificateBundle;

/// Build the server config the host terminates HTTPS with. Called once
/// per rotation; the result is shared behind an atomic swap.
pub(crate) fn server_config(bundle: &CertificateBundle) -> Result<Arc<ServerConfig>> {
    let mut chain_reader = BufReader::new(bundle.chain_pem().as_bytes());
    let certs: Vec<_> = rustls_pemfile::certs(&mut chain_reader)
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| Error::Tls(format!("failed to parse certificate chain: {}", e)))?;
    if certs.is_empty() {
        return Err(Error::Tls("no certificates in chain".into()));
    }

    let mut key_reader = BufReader::new(bundle.key_pem().as_bytes());
    let key = rustls_pemfile::private_key(&mut key_reader)
        .map_err(|e| Error::Tls(format!("failed to parse private key: {}", e)))?
        .ok_or_else(|| Error::Tls("no private key found".into()))?;

    let config = ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| Error::Tls(e.to_string()))?;
    Ok(Arc::new(config))
}
