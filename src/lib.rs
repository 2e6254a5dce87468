#![warn(clippy::all)]
//! autocert embeds an ACME v2 (RFC 8555) client that provisions and keeps
//! renewing TLS server certificates from [Let's Encrypt] or any compatible
//! directory, proving domain ownership over the http-01 challenge.
//!
//! The host application supplies the domain names and the listeners; the
//! library supplies a live [`rustls::ServerConfig`] that silently rotates
//! to a fresh certificate about 30 days before the old one expires.
//!
//! # Quick start
//!
//! ```no_run
//! use autocert::{provision, Config, ServerUrl};
//!
//! fn main() -> Result<(), autocert::Error> {
//!     let handle = provision(Config {
//!         domains: vec!["example.org".into(), "www.example.org".into()],
//!         server: ServerUrl::LetsEncrypt,
//!         settings_path: "/var/lib/autocert".into(),
//!         contacts: vec!["admin@example.org".into()],
//!     })?;
//!
//!     // Port 80: inside the plaintext listener, answer challenge
//!     // requests from the responder and pass everything else through.
//!     let responder = handle.responder();
//!
//!     // Port 443: terminate HTTPS with the live config. Fetch it per
//!     // accept (or per batch) so rotations are picked up.
//!     let tls = handle.server_config();
//!
//!     # let _ = (responder, tls);
//!     Ok(())
//! }
//! ```
//!
//! # What it does, and does not, take care of
//!
//! The library owns the ACME conversation (account, orders,
//! authorizations, nonces), the on-disk state under `settings_path`, the
//! renewal clock, and crash recovery of half-finished renewals. It does
//! not open sockets: the plaintext listener answering
//! `/.well-known/acme-challenge/` and the TLS listener are the host's,
//! which keeps the library usable inside whatever server stack the host
//! already runs.
//!
//! # State on disk
//!
//! `settings_path` holds the account key, the current certificate key and
//! chain, and during a renewal two transient `.old` files. Keys are
//! written mode 0600. Point multiple processes at different directories;
//! the renewal scheduler assumes it is alone.
//!
//! # Development servers
//!
//! Use [`ServerUrl::LetsEncryptStaging`] for anything experimental: the
//! production endpoint enforces strict [rate limits]. A local [Pebble]
//! instance ([`ServerUrl::Pebble`]) works for offline development.
//!
//! [Let's Encrypt]: https://letsencrypt.org/
//! [rate limits]: https://letsencrypt.org/docs/rate-limits/
//! [Pebble]: https://github.com/letsencrypt/pebble

use std::path::PathBuf;

mod account;
mod api;
mod dir;
mod error;
mod identity;
mod jws;
mod order;
mod renew;
mod responder;
mod store;
mod tls;
mod trans;

#[cfg(test)]
mod test;

pub use crate::api::ApiProblem;
pub use crate::dir::ServerUrl;
pub use crate::error::{Error, Result};
pub use crate::renew::TlsHandle;
pub use crate::responder::{Http01Responder, CHALLENGE_PATH_PREFIX};
pub use crate::store::CertificateBundle;

/// What to provision and where to keep it.
#[derive(Debug, Clone)]
pub struct Config {
    /// DNS names the certificate must cover. At least one.
    pub domains: Vec<String>,
    /// Which ACME directory to talk to.
    pub server: ServerUrl,
    /// Absolute directory for the account key, certificate pair and
    /// renewal state. Created if missing.
    pub settings_path: PathBuf,
    /// Optional contact email addresses for the ACME account. A plain
    /// address is fine; the `mailto:` scheme is added when absent.
    pub contacts: Vec<String>,
}

impl Config {
    pub(crate) fn validate(&self) -> Result<()> {
        if self.domains.is_empty() {
            return Err(Error::Configuration("at least one domain is required".into()));
        }
        for domain in &self.domains {
            if domain.is_empty() || domain.contains(|c: char| c.is_whitespace() || c == '/') {
                return Err(Error::Configuration(format!(
                    "invalid domain name: {:?}",
                    domain
                )));
            }
        }
        if !self.settings_path.is_absolute() {
            return Err(Error::Configuration(
                "settings_path must be an absolute directory path".into(),
            ));
        }
        Ok(())
    }

    pub(crate) fn contact_urls(&self) -> Vec<String> {
        self.contacts
            .iter()
            .map(|c| {
                if c.contains(':') {
                    c.clone()
                } else {
                    format!("mailto:{}", c)
                }
            })
            .collect()
    }
}

/// Obtain a certificate for `config.domains` (reusing a stored one when
/// still good) and keep it renewed until the handle is dropped or
/// [`TlsHandle::stop_auto_renewal`] is called.
///
/// Blocks for the initial issuance on a cold start; a warm start with a
/// valid pair on disk returns without touching the network.
///
/// Concurrent calls on the same `settings_path` within one process are
/// serialized: whichever arrives first performs the issuance, the rest
/// wait and come away with its result, so at most one order is ever in
/// flight. Separate processes sharing one directory are not coordinated;
/// give each process its own `settings_path`.
pub fn provision(config: Config) -> Result<TlsHandle> {
    renew::provision(config)
}
