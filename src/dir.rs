//! ACME directory endpoints.

use std::sync::Arc;

use log::debug;

use crate::api::ApiDirectory;
use crate::error::{Error, Result};
use crate::trans::{HttpClient, NoncePool};

const LETSENCRYPT: &str = "https://acme-v02.api.letsencrypt.org/directory";
const LETSENCRYPT_STAGING: &str = "https://acme-staging-v02.api.letsencrypt.org/directory";
const PEBBLE: &str = "https://localhost:14000/dir";
const MOCK: &str = "http://localhost:9829/directory";

/// Known ACME directory endpoints.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerUrl {
    /// The main Let's Encrypt directory. Not appropriate for testing and
    /// dev: it rate limits aggressively.
    LetsEncrypt,
    /// The staging Let's Encrypt directory. Issues chains that no trust
    /// store accepts, but with relaxed rate limits.
    LetsEncryptStaging,
    /// A local Pebble instance on its default port. Pebble serves its
    /// API behind a self-signed certificate, which this variant accepts.
    Pebble,
    /// A local mock directory on the conventional port 9829.
    Mock,
    /// An arbitrary directory URL.
    Custom(String),
}

impl ServerUrl {
    pub(crate) fn url(&self) -> &str {
        match self {
            ServerUrl::LetsEncrypt => LETSENCRYPT,
            ServerUrl::LetsEncryptStaging => LETSENCRYPT_STAGING,
            ServerUrl::Pebble => PEBBLE,
            ServerUrl::Mock => MOCK,
            ServerUrl::Custom(s) => s,
        }
    }

    pub(crate) fn accepts_invalid_certs(&self) -> bool {
        matches!(self, ServerUrl::Pebble)
    }
}

/// Entry point for an ACME API: the fetched directory document plus the
/// client and nonce pool every later request shares. Fetched once and
/// cached for the lifetime of the value.
pub(crate) struct Directory {
    pub(crate) client: HttpClient,
    pub(crate) nonce_pool: Arc<NoncePool>,
    pub(crate) api_directory: ApiDirectory,
}

impl Directory {
    pub fn connect(server: &ServerUrl) -> Result<Directory> {
        let client = HttpClient::new(server.accepts_invalid_certs())?;
        let res = client
            .get(server.url())
            .map_err(|e| Error::DirectoryFetch(format!("{}: {}", server.url(), e)))?;
        if !(200..300).contains(&res.status) {
            return Err(Error::DirectoryFetch(format!(
                "{} returned status {}",
                server.url(),
                res.status
            )));
        }
        let api_directory: ApiDirectory = res.json().map_err(|e| {
            Error::DirectoryFetch(format!("malformed directory document: {}", e))
        })?;
        debug!("directory fetched from {}", server.url());
        let nonce_pool = Arc::new(NoncePool::new(client.clone(), &api_directory.new_nonce));
        Ok(Directory {
            client,
            nonce_pool,
            api_directory,
        })
    }
}
