//! On-disk certificate state: atomic replacement and crash recovery.
//!
//! Everything lives under one settings directory with fixed names:
//!
//! ```text
//! account-identity.pem          account key, generated once
//! certificate-identity.pem      key of the current chain
//! certificate.pem               current chain, leaf first
//! certificate-identity.pem.old  ┐ only present while a renewal
//! certificate.pem.old           ┘ is being written out
//! ```
//!
//! A renewal moves the current pair aside, writes the new pair, then
//! deletes the `.old` markers, in that order. Whatever instant the process
//! dies at, [`CertStore::recover`] can put the directory back to a whole
//! pair on the next boot.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use log::{debug, info};
use openssl::asn1::{Asn1Time, Asn1TimeRef};
use openssl::x509::X509;

use crate::error::{Error, Result};

pub(crate) const ACCOUNT_IDENTITY_FILE: &str = "account-identity.pem";
pub(crate) const CERTIFICATE_IDENTITY_FILE: &str = "certificate-identity.pem";
pub(crate) const CERTIFICATE_FILE: &str = "certificate.pem";
const OLD_SUFFIX: &str = ".old";

pub(crate) struct CertStore {
    dir: PathBuf,
}

impl CertStore {
    pub fn new(dir: &Path) -> CertStore {
        CertStore {
            dir: dir.to_path_buf(),
        }
    }

    pub fn account_identity_path(&self) -> PathBuf {
        self.dir.join(ACCOUNT_IDENTITY_FILE)
    }

    fn chain_path(&self) -> PathBuf {
        self.dir.join(CERTIFICATE_FILE)
    }

    fn key_path(&self) -> PathBuf {
        self.dir.join(CERTIFICATE_IDENTITY_FILE)
    }

    fn chain_old_path(&self) -> PathBuf {
        self.dir.join(format!("{}{}", CERTIFICATE_FILE, OLD_SUFFIX))
    }

    fn key_old_path(&self) -> PathBuf {
        self.dir
            .join(format!("{}{}", CERTIFICATE_IDENTITY_FILE, OLD_SUFFIX))
    }

    /// Classify the directory after a possible crash and repair it.
    /// Must run before the first read of the current pair.
    pub fn recover(&self) -> Result<()> {
        let chain = self.chain_path().exists();
        let key = self.key_path().exists();
        let chain_old = self.chain_old_path().exists();
        let key_old = self.key_old_path().exists();

        match (chain, key, chain_old, key_old) {
            // steady state or cold start
            (true, true, false, false) | (false, false, false, false) => Ok(()),
            // renewal finished, only the marker cleanup was interrupted
            (true, true, _, _) => {
                info!("removing stale renewal markers");
                remove_if_present(&self.chain_old_path())?;
                remove_if_present(&self.key_old_path())?;
                Ok(())
            }
            // the pair was moved aside but nothing new was written
            (false, false, true, true) => {
                info!("restoring certificate pair from interrupted renewal");
                fs::rename(self.chain_old_path(), self.chain_path())?;
                fs::rename(self.key_old_path(), self.key_path())?;
                Ok(())
            }
            // one half of the new pair was written; the .old pair is the
            // last whole one, so it wins over the partial write
            (true, false, true, true) | (false, true, true, true) => {
                info!("discarding half-written renewal, restoring previous pair");
                fs::rename(self.chain_old_path(), self.chain_path())?;
                fs::rename(self.key_old_path(), self.key_path())?;
                Ok(())
            }
            // interrupted between the two renames: the chain moved aside,
            // the key never did
            (false, true, true, false) => {
                info!("undoing interrupted rename of certificate chain");
                fs::rename(self.chain_old_path(), self.chain_path())?;
                Ok(())
            }
            other => Err(Error::CertificateStateCorrupted(format!(
                "unexpected file combination (chain={}, key={}, chain.old={}, key.old={}) in {}",
                other.0,
                other.1,
                other.2,
                other.3,
                self.dir.display()
            ))),
        }
    }

    /// Read the current pair. `None` means cold start (run [`recover`]
    /// first so a partial renewal is not mistaken for one).
    ///
    /// [`recover`]: CertStore::recover
    pub fn load(&self) -> Result<Option<CertificateBundle>> {
        if !self.chain_path().exists() || !self.key_path().exists() {
            return Ok(None);
        }
        let chain_pem = fs::read_to_string(self.chain_path())?;
        let key_pem = fs::read_to_string(self.key_path())?;
        let bundle = CertificateBundle::from_parts(chain_pem, key_pem).map_err(|e| {
            Error::CertificateStateCorrupted(format!(
                "{} does not hold a usable certificate: {}",
                self.chain_path().display(),
                e
            ))
        })?;
        debug!(
            "loaded certificate {} ({}s remaining)",
            bundle.serial(),
            bundle.remaining().as_secs()
        );
        Ok(Some(bundle))
    }

    /// Replace the current pair with a freshly issued one. The write order
    /// is what [`recover`] relies on; do not reorder.
    ///
    /// [`recover`]: CertStore::recover
    pub fn install(&self, chain_pem: &str, key_pem: &str) -> Result<()> {
        // move the current pair aside, chain first
        if self.chain_path().exists() {
            fs::rename(self.chain_path(), self.chain_old_path())?;
        }
        if self.key_path().exists() {
            fs::rename(self.key_path(), self.key_old_path())?;
        }

        // write the new pair, chain first
        write_file(&self.chain_path(), chain_pem.as_bytes(), 0o644)?;
        write_file(&self.key_path(), key_pem.as_bytes(), 0o600)?;

        // clear the markers
        remove_if_present(&self.chain_old_path())?;
        remove_if_present(&self.key_old_path())?;
        debug!("installed new certificate pair in {}", self.dir.display());
        Ok(())
    }
}

fn remove_if_present(path: &Path) -> Result<()> {
    if path.exists() {
        fs::remove_file(path)?;
    }
    Ok(())
}

/// Write `bytes` with the given mode and fsync before returning.
#[cfg(unix)]
pub(crate) fn write_file(path: &Path, bytes: &[u8], mode: u32) -> std::io::Result<()> {
    use std::os::unix::fs::{OpenOptionsExt, PermissionsExt};
    let mut f = fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(mode)
        .open(path)?;
    // the open(2) mode is filtered through the umask; set it outright
    let mut permissions = f.metadata()?.permissions();
    permissions.set_mode(mode);
    f.set_permissions(permissions)?;
    f.write_all(bytes)?;
    f.sync_all()
}

#[cfg(not(unix))]
pub(crate) fn write_file(path: &Path, bytes: &[u8], _mode: u32) -> std::io::Result<()> {
    let mut f = fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .open(path)?;
    f.write_all(bytes)?;
    f.sync_all()
}

/// The current chain and its private key, with the leaf fields the
/// scheduler and the TLS layer care about parsed out.
#[derive(Debug, Clone)]
pub struct CertificateBundle {
    chain_pem: String,
    key_pem: String,
    serial: String,
    not_before: SystemTime,
    not_after: SystemTime,
    sans: Vec<String>,
}

impl CertificateBundle {
    pub(crate) fn from_parts(chain_pem: String, key_pem: String) -> Result<CertificateBundle> {
        let certs = X509::stack_from_pem(chain_pem.as_bytes())?;
        let leaf = certs
            .into_iter()
            .next()
            .ok_or_else(|| Error::Tls("certificate chain is empty".into()))?;
        let serial = leaf.serial_number().to_bn()?.to_hex_str()?.to_string();
        let not_before = asn1_to_system_time(leaf.not_before())?;
        let not_after = asn1_to_system_time(leaf.not_after())?;
        let sans = leaf
            .subject_alt_names()
            .map(|names| {
                names
                    .iter()
                    .filter_map(|n| n.dnsname().map(str::to_string))
                    .collect()
            })
            .unwrap_or_default();
        Ok(CertificateBundle {
            chain_pem,
            key_pem,
            serial,
            not_before,
            not_after,
            sans,
        })
    }

    /// PEM chain, leaf first.
    pub fn chain_pem(&self) -> &str {
        &self.chain_pem
    }

    /// PEM private key of the leaf.
    pub fn key_pem(&self) -> &str {
        &self.key_pem
    }

    /// Leaf serial number as hex.
    pub fn serial(&self) -> &str {
        &self.serial
    }

    pub fn not_after(&self) -> SystemTime {
        self.not_after
    }

    /// Time until the leaf expires; zero once it has.
    pub fn remaining(&self) -> Duration {
        self.not_after
            .duration_since(SystemTime::now())
            .unwrap_or(Duration::ZERO)
    }

    /// True while the leaf's validity window contains the present.
    pub fn is_currently_valid(&self) -> bool {
        let now = SystemTime::now();
        self.not_before <= now && now < self.not_after
    }

    /// DNS SANs of the leaf.
    pub fn sans(&self) -> &[String] {
        &self.sans
    }

    /// Whether every configured domain appears as a SAN.
    pub(crate) fn covers(&self, domains: &[String]) -> bool {
        domains.iter().all(|d| {
            self.sans
                .iter()
                .any(|san| san.eq_ignore_ascii_case(d))
        })
    }

    #[cfg(test)]
    pub(crate) fn set_not_after(&mut self, t: SystemTime) {
        self.not_after = t;
    }
}

fn asn1_to_system_time(t: &Asn1TimeRef) -> Result<SystemTime> {
    let epoch = Asn1Time::from_unix(0)?;
    let diff = epoch.diff(t)?;
    let secs = i64::from(diff.days) * 86_400 + i64::from(diff.secs);
    if secs < 0 {
        // a certificate dated before 1970 is nonsense; treat as epoch
        return Ok(UNIX_EPOCH);
    }
    Ok(UNIX_EPOCH + Duration::from_secs(secs as u64))
}
