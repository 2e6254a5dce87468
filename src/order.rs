//! Order life cycle.
//!
//! One order per issuance, driven start to finish: create, prove every
//! authorization over http-01, finalize with a fresh certificate key, poll
//! until the chain is signed, download it. The server owns the status; this
//! module owns the side effects and the clock.

use std::thread;
use std::time::{Duration, Instant};

use log::{debug, info};
use openssl::hash::MessageDigest;
use openssl::pkey::{PKeyRef, Private};
use openssl::stack::Stack;
use openssl::x509::extension::SubjectAlternativeName;
use openssl::x509::{X509Req, X509ReqBuilder, X509};

use crate::account::Account;
use crate::api::{ApiAuth, ApiEmptyObject, ApiEmptyString, ApiFinalize, ApiNewOrder, ApiOrder, ApiProblem};
use crate::error::{Error, Result};
use crate::identity::CertificateIdentity;
use crate::jws::base64url;
use crate::responder::Http01Responder;

/// How order and authorization resources are polled: start at `initial`,
/// add `step` after every attempt up to `cap`, give up at `deadline`.
pub(crate) struct PollPolicy {
    pub initial: Duration,
    pub step: Duration,
    pub cap: Duration,
    pub deadline: Duration,
}

impl Default for PollPolicy {
    fn default() -> Self {
        PollPolicy {
            initial: Duration::from_secs(1),
            step: Duration::from_secs(1),
            cap: Duration::from_secs(10),
            deadline: Duration::from_secs(5 * 60),
        }
    }
}

/// A downloaded chain and the private key it was issued for.
pub(crate) struct IssuedCertificate {
    pub chain_pem: String,
    pub identity_pem: String,
}

/// Run one order to completion.
pub(crate) fn issue(
    account: &Account,
    domains: &[String],
    responder: &Http01Responder,
    policy: &PollPolicy,
) -> Result<IssuedCertificate> {
    let new_order = ApiNewOrder::for_domains(domains);
    let res = account
        .transport()
        .call(&account.directory().new_order, &new_order)?;
    let order_url = res.require_location()?;
    let mut order: ApiOrder = res.json()?;
    info!("order created: {}", order_url);

    // any token we register is removed again when this guard drops,
    // success or not
    let mut tokens = TokenGuard::new(responder);

    if order.is_status_pending() {
        let auth_urls = order.authorizations.clone().unwrap_or_default();
        for auth_url in &auth_urls {
            authorize(account, auth_url, responder, &mut tokens, policy)?;
        }
        order = refresh_order(account, &order_url)?;
    }

    if order.is_status_invalid() {
        return Err(order_failure(&order, "order became invalid"));
    }

    let cert_identity = CertificateIdentity::generate()?;
    if order.is_status_ready() {
        let domain_refs: Vec<&str> = domains.iter().map(String::as_str).collect();
        let csr = create_csr(cert_identity.pkey(), &domain_refs)?;
        let finalize = ApiFinalize {
            csr: base64url(&csr.to_der()?),
        };
        debug!("submitting csr to {}", order.finalize);
        account.transport().call(&order.finalize, &finalize)?;
    }

    let order = poll_until("order finalize", policy, || refresh_order(account, &order_url), |o| {
        !o.is_status_ready() && !o.is_status_processing()
    })?;
    if !order.is_status_valid() {
        return Err(order_failure(&order, "order did not become valid"));
    }

    let cert_url = order.certificate.ok_or_else(|| {
        Error::OrderFailed(ApiProblem::local(
            "missingCertificateUrl",
            "valid order carries no certificate URL",
        ))
    })?;

    // the one response that is not JSON: the body is the PEM chain itself
    let res = account.transport().call(&cert_url, &ApiEmptyString)?;
    let chain_pem = res.body_string();
    let parsed = X509::stack_from_pem(chain_pem.as_bytes())?;
    if parsed.is_empty() {
        return Err(Error::OrderFailed(ApiProblem::local(
            "emptyCertificateChain",
            "certificate download contained no PEM certificates",
        )));
    }
    info!("downloaded chain of {} certificates", parsed.len());
    drop(tokens);

    Ok(IssuedCertificate {
        chain_pem,
        identity_pem: cert_identity.to_pem()?,
    })
}

/// Prove one authorization: pick its http-01 challenge, publish the key
/// authorization, tell the server to look, poll until it decides.
fn authorize(
    account: &Account,
    auth_url: &str,
    responder: &Http01Responder,
    tokens: &mut TokenGuard,
    policy: &PollPolicy,
) -> Result<()> {
    let res = account.transport().call(auth_url, &ApiEmptyString)?;
    let auth: ApiAuth = res.json()?;
    debug!("authorization for {}", auth.identifier.value);

    if auth.is_status_valid() {
        // ownership proven by an earlier order; nothing to do
        return Ok(());
    }

    let challenge = auth.http_challenge().ok_or_else(|| {
        Error::OrderFailed(ApiProblem::local(
            "noHttpChallenge",
            format!("no http-01 challenge offered for {}", auth.identifier.value),
        ))
    })?;

    responder.register(
        challenge.token.clone(),
        account.key_authorization(&challenge.token),
    );
    tokens.track(challenge.token.clone());

    // the empty-object payload signals the challenge may be validated now
    account.transport().call(&challenge.url, &ApiEmptyObject)?;

    let auth = poll_until(
        "authorization",
        policy,
        || {
            let res = account.transport().call(auth_url, &ApiEmptyString)?;
            res.json::<ApiAuth>()
        },
        |a| !a.is_status_pending(),
    )?;

    if !auth.is_status_valid() {
        let problem = auth.challenge_error().cloned().unwrap_or_else(|| {
            ApiProblem::local(
                "authorizationFailed",
                format!(
                    "authorization for {} ended as {:?}",
                    auth.identifier.value,
                    auth.status.as_deref().unwrap_or("unknown")
                ),
            )
        });
        return Err(Error::OrderFailed(problem));
    }
    Ok(())
}

fn refresh_order(account: &Account, order_url: &str) -> Result<ApiOrder> {
    let res = account.transport().call(order_url, &ApiEmptyString)?;
    res.json()
}

fn order_failure(order: &ApiOrder, fallback: &str) -> Error {
    let problem = order.error.clone().unwrap_or_else(|| {
        ApiProblem::local(
            "orderFailed",
            format!(
                "{} (status {:?})",
                fallback,
                order.status.as_deref().unwrap_or("unknown")
            ),
        )
    });
    Error::OrderFailed(problem)
}

fn poll_until<T, F, D>(what: &'static str, policy: &PollPolicy, mut fetch: F, done: D) -> Result<T>
where
    F: FnMut() -> Result<T>,
    D: Fn(&T) -> bool,
{
    let give_up = Instant::now() + policy.deadline;
    let mut delay = policy.initial;
    loop {
        let value = fetch()?;
        if done(&value) {
            return Ok(value);
        }
        if Instant::now() + delay > give_up {
            return Err(Error::OrderTimeout(what));
        }
        thread::sleep(delay);
        delay = (delay + policy.step).min(policy.cap);
    }
}

/// Tokens registered with the responder for the duration of an order.
struct TokenGuard<'a> {
    responder: &'a Http01Responder,
    tokens: Vec<String>,
}

impl<'a> TokenGuard<'a> {
    fn new(responder: &'a Http01Responder) -> Self {
        TokenGuard {
            responder,
            tokens: Vec::new(),
        }
    }
    fn track(&mut self, token: String) {
        self.tokens.push(token);
    }
}

impl Drop for TokenGuard<'_> {
    fn drop(&mut self) {
        for token in &self.tokens {
            self.responder.deregister(token);
        }
    }
}

fn create_csr(pkey: &PKeyRef<Private>, domains: &[&str]) -> Result<X509Req> {
    let mut req_bld = X509ReqBuilder::new()?;
    req_bld.set_pubkey(pkey)?;

    // every domain becomes a SAN; there is no CN
    let mut an = SubjectAlternativeName::new();
    for domain in domains {
        an.dns(domain);
    }
    let ext = {
        let ctx = req_bld.x509v3_context(None);
        an.build(&ctx)?
    };
    let mut stack = Stack::new()?;
    stack.push(ext)?;
    req_bld.add_extensions(&stack)?;

    req_bld.sign(pkey, MessageDigest::sha256())?;
    Ok(req_bld.build())
}
