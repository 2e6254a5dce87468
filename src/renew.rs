//! Renewal scheduling and the live TLS handle.
//!
//! One background thread per handle. It sleeps until the renewal date
//! (never longer than a day, so clock jumps and long suspends are caught),
//! runs the order flow when due, and swaps the fresh config in atomically.
//! Failed attempts back off from a minute up to an hour. The last-known
//! good pair is never deleted to "fix" anything.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Condvar, Mutex, OnceLock};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use arc_swap::ArcSwap;
use log::{debug, info, warn};
use rustls::ServerConfig;

use crate::account::Account;
use crate::dir::Directory;
use crate::error::Result;
use crate::identity::AccountIdentity;
use crate::order::{self, PollPolicy};
use crate::responder::Http01Responder;
use crate::store::{CertStore, CertificateBundle};
use crate::tls;
use crate::Config;

/// Renew once the chain has less than this long to live.
const RENEW_MARGIN: Duration = Duration::from_secs(30 * 24 * 3600);
/// Re-check expiry at least this often even when nothing is due.
const RECHECK_INTERVAL: Duration = Duration::from_secs(24 * 3600);
const RETRY_INITIAL: Duration = Duration::from_secs(60);
const RETRY_CAP: Duration = Duration::from_secs(3600);

/// A provisioned certificate with auto-renewal running behind it.
///
/// [`server_config`] always returns a complete, current configuration;
/// after a rotation new acceptors pick up the new chain immediately while
/// connections handed the previous `Arc` finish undisturbed.
///
/// [`server_config`]: TlsHandle::server_config
pub struct TlsHandle {
    shared: Arc<Shared>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

struct Shared {
    config: Config,
    store: CertStore,
    responder: Http01Responder,
    tls: ArcSwap<ServerConfig>,
    bundle: ArcSwap<CertificateBundle>,
    /// Single-flight guard: concurrent issuance triggers coalesce into the
    /// attempt already holding this. Shared process-wide per settings
    /// directory (see [`settings_lock`]), so even two handles over the
    /// same directory cannot race two orders.
    issue_lock: Arc<Mutex<()>>,
    stopped: Mutex<bool>,
    wake: Condvar,
}

/// Process-wide issuance locks, one per settings directory. Every
/// `provision` call and every handle over the same directory shares one
/// lock, keeping at most one order in flight per process and path.
fn settings_lock(path: &Path) -> Arc<Mutex<()>> {
    static LOCKS: OnceLock<Mutex<HashMap<PathBuf, Arc<Mutex<()>>>>> = OnceLock::new();
    let key = path.canonicalize().unwrap_or_else(|_| path.to_path_buf());
    let mut locks = LOCKS.get_or_init(Default::default).lock().unwrap();
    locks.entry(key).or_default().clone()
}

impl TlsHandle {
    /// The current live TLS server configuration.
    pub fn server_config(&self) -> Arc<ServerConfig> {
        self.shared.tls.load_full()
    }

    /// The current certificate, for introspection.
    pub fn certificate(&self) -> Arc<CertificateBundle> {
        self.shared.bundle.load_full()
    }

    /// The responder to embed in the plaintext listener on port 80.
    pub fn responder(&self) -> Http01Responder {
        self.shared.responder.clone()
    }

    /// Run an expiry check now instead of waiting for the scheduler.
    /// Returns whether a new certificate was installed.
    pub fn check_for_renewal(&self) -> Result<bool> {
        self.shared.check_for_renewal()
    }

    /// Stop the background renewal thread and wait for it to finish. An
    /// issuance already in flight completes first so no server-side state
    /// is leaked.
    pub fn stop_auto_renewal(&self) {
        self.shared.signal_stop();
        if let Some(worker) = self.worker.lock().unwrap().take() {
            worker.join().ok();
        }
    }

    #[cfg(test)]
    pub(crate) fn force_expiry(&self, not_after: std::time::SystemTime) {
        let mut bundle = (*self.shared.bundle.load_full()).clone();
        bundle.set_not_after(not_after);
        self.shared.bundle.store(Arc::new(bundle));
    }
}

impl Drop for TlsHandle {
    fn drop(&mut self) {
        // release the thread without blocking on an in-flight attempt
        self.shared.signal_stop();
    }
}

impl Shared {
    fn signal_stop(&self) {
        *self.stopped.lock().unwrap() = true;
        self.wake.notify_all();
    }

    fn check_for_renewal(&self) -> Result<bool> {
        let _flight = self.issue_lock.lock().unwrap();
        // whoever held the lock before us may already have renewed
        if !needs_renewal(&self.bundle.load(), &self.config.domains) {
            return Ok(false);
        }
        info!(
            "certificate {} due for renewal",
            self.bundle.load().serial()
        );
        let bundle = issue_and_install(&self.config, &self.store, &self.responder)?;
        let tls = tls::server_config(&bundle)?;
        self.bundle.store(Arc::new(bundle));
        self.tls.store(tls);
        Ok(true)
    }

    /// How long the scheduler should sleep before looking again.
    fn next_check_in(&self) -> Duration {
        let until_renew = self
            .bundle
            .load()
            .remaining()
            .saturating_sub(RENEW_MARGIN);
        until_renew.min(RECHECK_INTERVAL).max(Duration::from_secs(1))
    }

    /// Sleep up to `duration`; true means stop was requested.
    fn wait_stop(&self, duration: Duration) -> bool {
        let deadline = Instant::now() + duration;
        let mut stopped = self.stopped.lock().unwrap();
        while !*stopped {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            let (guard, _) = self.wake.wait_timeout(stopped, deadline - now).unwrap();
            stopped = guard;
        }
        true
    }
}

fn needs_renewal(bundle: &CertificateBundle, domains: &[String]) -> bool {
    bundle.remaining() <= RENEW_MARGIN || !bundle.covers(domains)
}

/// Run the full order flow and persist the result atomically.
fn issue_and_install(
    config: &Config,
    store: &CertStore,
    responder: &Http01Responder,
) -> Result<CertificateBundle> {
    let identity = AccountIdentity::load_or_create(&store.account_identity_path())?;
    let directory = Directory::connect(&config.server)?;
    let account = Account::register(&directory, identity, &config.contact_urls())?;
    let issued = order::issue(&account, &config.domains, responder, &PollPolicy::default())?;
    store.install(&issued.chain_pem, &issued.identity_pem)?;
    let bundle = CertificateBundle::from_parts(issued.chain_pem, issued.identity_pem)?;
    info!(
        "issued certificate {} for {:?}",
        bundle.serial(),
        config.domains
    );
    Ok(bundle)
}

pub(crate) fn provision(config: Config) -> Result<TlsHandle> {
    config.validate()?;
    fs::create_dir_all(&config.settings_path)?;

    // Everything from recovery through a possible issuance runs under the
    // per-directory lock: provision calls racing on one settings path
    // coalesce into a single order, the losers reading the winner's pair
    // off disk once it releases.
    let issue_lock = settings_lock(&config.settings_path);
    let flight = issue_lock.lock().unwrap();

    let store = CertStore::new(&config.settings_path);
    store.recover()?;

    let responder = Http01Responder::new();
    let bundle = match store.load()? {
        Some(bundle) if !needs_renewal(&bundle, &config.domains) => {
            debug!(
                "stored certificate {} still good for {}s",
                bundle.serial(),
                bundle.remaining().as_secs()
            );
            bundle
        }
        Some(bundle) => match issue_and_install(&config, &store, &responder) {
            Ok(fresh) => fresh,
            // the stored pair is stale but not expired; keep serving it
            // while the scheduler retries in the background
            Err(e) if bundle.is_currently_valid() => {
                warn!("renewal failed, keeping previous certificate: {}", e);
                bundle
            }
            Err(e) => return Err(e),
        },
        None => issue_and_install(&config, &store, &responder)?,
    };
    drop(flight);

    let tls = tls::server_config(&bundle)?;
    let shared = Arc::new(Shared {
        config,
        store,
        responder,
        tls: ArcSwap::from(tls),
        bundle: ArcSwap::from_pointee(bundle),
        issue_lock,
        stopped: Mutex::new(false),
        wake: Condvar::new(),
    });

    let worker = {
        let shared = shared.clone();
        thread::Builder::new()
            .name("autocert-renewal".into())
            .spawn(move || renewal_worker(shared))?
    };

    Ok(TlsHandle {
        shared,
        worker: Mutex::new(Some(worker)),
    })
}

fn renewal_worker(shared: Arc<Shared>) {
    let mut backoff = RETRY_INITIAL;
    let mut wait = shared.next_check_in();
    loop {
        if shared.wait_stop(wait) {
            debug!("auto-renewal stopped");
            return;
        }
        match shared.check_for_renewal() {
            Ok(renewed) => {
                if renewed {
                    info!("rotated to certificate {}", shared.bundle.load().serial());
                }
                backoff = RETRY_INITIAL;
                wait = shared.next_check_in();
            }
            Err(e) => {
                warn!("renewal attempt failed: {}; retrying in {:?}", e, backoff);
                wait = backoff;
                backoff = (backoff * 2).min(RETRY_CAP);
            }
        }
    }
}
