//! In-process mock ACME server for the test suite.
//!
//! Speaks just enough RFC 8555 to drive the whole issuance flow over real
//! HTTP on a random local port: stateful order/authorization transitions,
//! fresh nonces on every response, and a finalize endpoint that signs a
//! real certificate over the submitted CSR with an in-memory CA. It also
//! plays protocol referee, recording nonce reuse and malformed POST-as-GET
//! payloads so tests can assert the client never cheats.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use axum::body::Body;
use axum::extract::{Request, State};
use axum::http;
use axum::response::Response;
use axum::Router;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use openssl::asn1::Asn1Time;
use openssl::bn::BigNum;
use openssl::hash::MessageDigest;
use openssl::pkey::{HasPublic, PKey, PKeyRef, Private};
use openssl::rsa::Rsa;
use openssl::x509::extension::SubjectAlternativeName;
use openssl::x509::{X509Builder, X509NameBuilder, X509Ref, X509Req, X509};
use serde_json::{json, Value};

static SERIAL: AtomicU64 = AtomicU64::new(1000);

fn next_serial() -> u32 {
    SERIAL.fetch_add(1, Ordering::Relaxed) as u32
}

pub(crate) struct TestServer {
    pub dir_url: String,
    pub state: Arc<RigState>,
    shutdown: Option<tokio::sync::oneshot::Sender<()>>,
}

impl TestServer {
    pub fn new_nonce_url(&self) -> String {
        format!("{}/acme/new-nonce", self.state.base_url)
    }
    pub fn new_account_url(&self) -> String {
        format!("{}/acme/new-acct", self.state.base_url)
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown.take() {
            tx.send(()).ok();
        }
    }
}

pub(crate) fn with_acme_server() -> TestServer {
    let tcp = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let port = tcp.local_addr().unwrap().port();
    tcp.set_nonblocking(true).unwrap();

    let base_url = format!("http://127.0.0.1:{}", port);
    let state = Arc::new(RigState::new(base_url.clone()));
    let (tx, rx) = tokio::sync::oneshot::channel::<()>();

    let app_state = state.clone();
    std::thread::spawn(move || {
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        rt.block_on(async move {
            let listener = tokio::net::TcpListener::from_std(tcp).unwrap();
            let app = Router::new().fallback(route).with_state(app_state);
            axum::serve(listener, app)
                .with_graceful_shutdown(async {
                    rx.await.ok();
                })
                .await
                .unwrap();
        });
    });

    TestServer {
        dir_url: format!("{}/directory", base_url),
        state,
        shutdown: Some(tx),
    }
}

async fn route(State(rig): State<Arc<RigState>>, req: Request) -> Response {
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    let body = axum::body::to_bytes(req.into_body(), usize::MAX)
        .await
        .unwrap_or_default();
    rig.handle(method.as_str(), &path, &body)
}

struct OrderState {
    identifiers: Vec<String>,
    auth_status: Vec<String>,
    status: String,
    processing_polls: usize,
    chain: Option<String>,
}

pub(crate) struct RigState {
    base_url: String,
    ca_key: PKey<Private>,
    ca_cert: X509,
    order: Mutex<Option<OrderState>>,
    accounts: Mutex<HashMap<String, usize>>,
    account_urls: Mutex<HashSet<String>>,
    last_contacts: Mutex<Vec<String>>,
    used_nonces: Mutex<HashSet<String>>,
    nonce_counter: AtomicU64,

    // fault injection
    bad_nonce_budget: AtomicUsize,
    hold_auth: AtomicUsize,
    fail_first_auth: AtomicUsize,
    processing_polls: AtomicUsize,

    // observations
    total: AtomicUsize,
    nonce_fetch_count: AtomicUsize,
    acct_posts: AtomicUsize,
    order_posts: AtomicUsize,
    authz_post_counts: Mutex<HashMap<usize, usize>>,
    duplicate_nonce_count: AtomicUsize,
    payload_violation_count: AtomicUsize,
}

impl RigState {
    fn new(base_url: String) -> RigState {
        let ca_key = PKey::from_rsa(Rsa::generate(2048).unwrap()).unwrap();
        let ca_cert = build_cert(&ca_key, &ca_key, None, &[], 3650);
        RigState {
            base_url,
            ca_key,
            ca_cert,
            order: Mutex::new(None),
            accounts: Mutex::new(HashMap::new()),
            account_urls: Mutex::new(HashSet::new()),
            last_contacts: Mutex::new(Vec::new()),
            used_nonces: Mutex::new(HashSet::new()),
            nonce_counter: AtomicU64::new(0),
            bad_nonce_budget: AtomicUsize::new(0),
            hold_auth: AtomicUsize::new(0),
            fail_first_auth: AtomicUsize::new(0),
            processing_polls: AtomicUsize::new(0),
            total: AtomicUsize::new(0),
            nonce_fetch_count: AtomicUsize::new(0),
            acct_posts: AtomicUsize::new(0),
            order_posts: AtomicUsize::new(0),
            authz_post_counts: Mutex::new(HashMap::new()),
            duplicate_nonce_count: AtomicUsize::new(0),
            payload_violation_count: AtomicUsize::new(0),
        }
    }

    // --- knobs ---

    pub fn fail_next_post_with_bad_nonce(&self) {
        self.bad_nonce_budget.store(1, Ordering::SeqCst);
    }
    pub fn fail_posts_with_bad_nonce(&self, n: usize) {
        self.bad_nonce_budget.store(n, Ordering::SeqCst);
    }
    pub fn hold_authorizations(&self) {
        self.hold_auth.store(1, Ordering::SeqCst);
    }
    pub fn release_authorizations(&self) {
        self.hold_auth.store(0, Ordering::SeqCst);
        let mut order = self.order.lock().unwrap();
        if let Some(order) = order.as_mut() {
            for status in &mut order.auth_status {
                *status = "valid".into();
            }
            order.status = "ready".into();
        }
    }
    pub fn fail_first_authorization(&self) {
        self.fail_first_auth.store(1, Ordering::SeqCst);
    }
    pub fn set_processing_polls(&self, n: usize) {
        self.processing_polls.store(n, Ordering::SeqCst);
    }

    // --- observations ---

    pub fn total_requests(&self) -> usize {
        self.total.load(Ordering::SeqCst)
    }
    pub fn nonce_fetches(&self) -> usize {
        self.nonce_fetch_count.load(Ordering::SeqCst)
    }
    pub fn new_account_posts(&self) -> usize {
        self.acct_posts.load(Ordering::SeqCst)
    }
    pub fn new_order_posts(&self) -> usize {
        self.order_posts.load(Ordering::SeqCst)
    }
    pub fn authorization_posts(&self, id: usize) -> usize {
        *self
            .authz_post_counts
            .lock()
            .unwrap()
            .get(&id)
            .unwrap_or(&0)
    }
    pub fn distinct_account_urls(&self) -> usize {
        self.account_urls.lock().unwrap().len()
    }
    pub fn last_account_contacts(&self) -> Vec<String> {
        self.last_contacts.lock().unwrap().clone()
    }
    pub fn duplicate_nonces(&self) -> usize {
        self.duplicate_nonce_count.load(Ordering::SeqCst)
    }
    pub fn payload_violations(&self) -> usize {
        self.payload_violation_count.load(Ordering::SeqCst)
    }

    // --- serving ---

    fn fresh_nonce(&self) -> String {
        let n = self.nonce_counter.fetch_add(1, Ordering::Relaxed);
        format!("nonce-{}", n)
    }

    fn handle(&self, method: &str, path: &str, body: &[u8]) -> Response {
        self.total.fetch_add(1, Ordering::SeqCst);
        match (method, path) {
            ("GET", "/directory") => self.directory(),
            ("HEAD", "/acme/new-nonce") | ("GET", "/acme/new-nonce") => {
                self.nonce_fetch_count.fetch_add(1, Ordering::SeqCst);
                self.reply(204, None, "", "text/plain")
            }
            ("POST", _) => self.handle_post(path, body),
            _ => self.reply(404, None, "", "text/plain"),
        }
    }

    fn directory(&self) -> Response {
        let body = json!({
            "newNonce": format!("{}/acme/new-nonce", self.base_url),
            "newAccount": format!("{}/acme/new-acct", self.base_url),
            "newOrder": format!("{}/acme/new-order", self.base_url),
            "revokeCert": format!("{}/acme/revoke-cert", self.base_url),
            "keyChange": format!("{}/acme/key-change", self.base_url),
            "meta": { "termsOfService": format!("{}/terms", self.base_url) }
        });
        self.reply(200, None, &body.to_string(), "application/json")
    }

    fn handle_post(&self, path: &str, body: &[u8]) -> Response {
        let (protected, payload) = match jws_parts(body) {
            Some(parts) => parts,
            None => return self.problem(400, "urn:ietf:params:acme:error:malformed", "not a JWS"),
        };

        // every nonce may be presented exactly once
        if let Some(nonce) = protected["nonce"].as_str() {
            if !self.used_nonces.lock().unwrap().insert(nonce.to_string()) {
                self.duplicate_nonce_count.fetch_add(1, Ordering::SeqCst);
            }
        }

        // endpoint counters include requests we are about to reject
        if path == "/acme/new-acct" {
            self.acct_posts.fetch_add(1, Ordering::SeqCst);
        }
        if path == "/acme/new-order" {
            self.order_posts.fetch_add(1, Ordering::SeqCst);
        }
        if let Some(id) = path.strip_prefix("/acme/authz/").and_then(|s| s.parse().ok()) {
            *self.authz_post_counts.lock().unwrap().entry(id).or_insert(0) += 1;
        }

        // injected nonce rejections, fresh nonce included
        let budget = self.bad_nonce_budget.load(Ordering::SeqCst);
        if budget > 0
            && self
                .bad_nonce_budget
                .compare_exchange(budget, budget - 1, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
        {
            return self.problem(
                400,
                "urn:ietf:params:acme:error:badNonce",
                "nonce rejected by test rig",
            );
        }

        match path {
            "/acme/new-acct" => self.new_account(&protected, &payload),
            "/acme/new-order" => self.new_order(&payload),
            "/acme/order/1" => {
                self.expect_post_as_get(&payload);
                self.advance_order();
                self.order_response(200, false)
            }
            "/acme/finalize/1" => self.finalize(&payload),
            "/acme/cert/1" => {
                self.expect_post_as_get(&payload);
                let chain = self.order.lock().unwrap().as_ref().and_then(|o| o.chain.clone());
                match chain {
                    Some(chain) => self.reply(200, None, &chain, "application/pem-certificate-chain"),
                    None => self.problem(404, "urn:ietf:params:acme:error:malformed", "no chain"),
                }
            }
            _ => {
                if let Some(id) = path.strip_prefix("/acme/authz/").and_then(|s| s.parse().ok()) {
                    self.expect_post_as_get(&payload);
                    return self.authorization(id);
                }
                if let Some(id) = path.strip_prefix("/acme/chall/").and_then(|s| s.parse().ok()) {
                    if payload != b"{}" {
                        self.payload_violation_count.fetch_add(1, Ordering::SeqCst);
                    }
                    return self.challenge_ready(id);
                }
                self.reply(404, None, "", "text/plain")
            }
        }
    }

    fn expect_post_as_get(&self, payload: &[u8]) {
        if !payload.is_empty() {
            self.payload_violation_count.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn new_account(&self, protected: &Value, payload: &[u8]) -> Response {
        let key = protected["jwk"]["n"].as_str().unwrap_or("").to_string();
        let payload: Value = serde_json::from_slice(payload).unwrap_or(Value::Null);
        let contacts: Vec<String> = payload["contact"]
            .as_array()
            .map(|a| {
                a.iter()
                    .filter_map(|v| v.as_str().map(str::to_string))
                    .collect()
            })
            .unwrap_or_default();
        *self.last_contacts.lock().unwrap() = contacts.clone();

        let mut accounts = self.accounts.lock().unwrap();
        let known = accounts.contains_key(&key);
        let next_id = accounts.len() + 1;
        let id = *accounts.entry(key).or_insert(next_id);
        let location = format!("{}/acme/acct/{}", self.base_url, id);
        self.account_urls.lock().unwrap().insert(location.clone());

        let body = json!({ "status": "valid", "contact": contacts });
        self.reply(
            if known { 200 } else { 201 },
            Some(&location),
            &body.to_string(),
            "application/json",
        )
    }

    fn new_order(&self, payload: &[u8]) -> Response {
        let payload: Value = serde_json::from_slice(payload).unwrap_or(Value::Null);
        let identifiers: Vec<String> = payload["identifiers"]
            .as_array()
            .map(|a| {
                a.iter()
                    .filter_map(|v| v["value"].as_str().map(str::to_string))
                    .collect()
            })
            .unwrap_or_default();
        let n = identifiers.len();
        *self.order.lock().unwrap() = Some(OrderState {
            identifiers,
            auth_status: vec!["pending".into(); n],
            status: "pending".into(),
            processing_polls: self.processing_polls.load(Ordering::SeqCst),
            chain: None,
        });
        self.order_response(201, true)
    }

    fn advance_order(&self) {
        let mut order = self.order.lock().unwrap();
        if let Some(order) = order.as_mut() {
            if order.status == "processing" {
                if order.processing_polls > 0 {
                    order.processing_polls -= 1;
                } else {
                    order.status = "valid".into();
                }
            }
        }
    }

    fn order_response(&self, status: u16, with_location: bool) -> Response {
        let order = self.order.lock().unwrap();
        let order = match order.as_ref() {
            Some(order) => order,
            None => return self.problem(404, "urn:ietf:params:acme:error:malformed", "no order"),
        };
        let auth_urls: Vec<String> = (1..=order.identifiers.len())
            .map(|i| format!("{}/acme/authz/{}", self.base_url, i))
            .collect();
        let mut body = json!({
            "status": order.status,
            "expires": "2099-01-01T00:00:00Z",
            "identifiers": order.identifiers.iter()
                .map(|d| json!({ "type": "dns", "value": d }))
                .collect::<Vec<_>>(),
            "authorizations": auth_urls,
            "finalize": format!("{}/acme/finalize/1", self.base_url),
        });
        if order.status == "valid" {
            body["certificate"] = json!(format!("{}/acme/cert/1", self.base_url));
        }
        let location = format!("{}/acme/order/1", self.base_url);
        self.reply(
            status,
            if with_location { Some(&location) } else { None },
            &body.to_string(),
            "application/json",
        )
    }

    fn authorization(&self, id: usize) -> Response {
        let order = self.order.lock().unwrap();
        let order = match order.as_ref() {
            Some(order) if id >= 1 && id <= order.identifiers.len() => order,
            _ => return self.problem(404, "urn:ietf:params:acme:error:malformed", "no such authz"),
        };
        let status = &order.auth_status[id - 1];
        let mut http_challenge = json!({
            "type": "http-01",
            "status": if status == "valid" { "valid" } else if status == "invalid" { "invalid" } else { "pending" },
            "url": format!("{}/acme/chall/{}", self.base_url, id),
            "token": format!("token-{}", id),
        });
        if status == "invalid" {
            http_challenge["error"] = json!({
                "type": "urn:ietf:params:acme:error:incorrectResponse",
                "detail": "key authorization did not match",
                "status": 403,
            });
        }
        let body = json!({
            "identifier": { "type": "dns", "value": order.identifiers[id - 1] },
            "status": status,
            "expires": "2099-01-01T00:00:00Z",
            "challenges": [
                http_challenge,
                {
                    "type": "dns-01",
                    "status": "pending",
                    "url": format!("{}/acme/chall-dns/{}", self.base_url, id),
                    "token": format!("dns-token-{}", id),
                }
            ],
        });
        self.reply(200, None, &body.to_string(), "application/json")
    }

    fn challenge_ready(&self, id: usize) -> Response {
        {
            let mut order = self.order.lock().unwrap();
            if let Some(order) = order.as_mut() {
                if id >= 1 && id <= order.auth_status.len() {
                    if self.fail_first_auth.load(Ordering::SeqCst) == 1 && id == 1 {
                        order.auth_status[0] = "invalid".into();
                    } else if self.hold_auth.load(Ordering::SeqCst) == 0 {
                        order.auth_status[id - 1] = "valid".into();
                    }
                    if order.auth_status.iter().all(|s| s == "valid") {
                        order.status = "ready".into();
                    }
                }
            }
        }
        let body = json!({
            "type": "http-01",
            "status": "processing",
            "url": format!("{}/acme/chall/{}", self.base_url, id),
            "token": format!("token-{}", id),
        });
        self.reply(200, None, &body.to_string(), "application/json")
    }

    fn finalize(&self, payload: &[u8]) -> Response {
        let payload: Value = serde_json::from_slice(payload).unwrap_or(Value::Null);
        let csr_der = match payload["csr"]
            .as_str()
            .and_then(|s| URL_SAFE_NO_PAD.decode(s).ok())
        {
            Some(der) => der,
            None => {
                return self.problem(400, "urn:ietf:params:acme:error:badCSR", "csr undecodable")
            }
        };
        let req = match X509Req::from_der(&csr_der) {
            Ok(req) => req,
            Err(e) => {
                return self.problem(
                    400,
                    "urn:ietf:params:acme:error:badCSR",
                    &format!("csr does not parse: {}", e),
                )
            }
        };

        {
            let mut guard = self.order.lock().unwrap();
            let order = match guard.as_mut() {
                Some(order) => order,
                // problem() takes no order lock, holding the guard is fine
                None => return self.problem(404, "urn:ietf:params:acme:error:malformed", "no order"),
            };
            let domains: Vec<&str> = order.identifiers.iter().map(String::as_str).collect();
            let leaf = build_cert(
                &req.public_key().unwrap(),
                &self.ca_key,
                Some(&self.ca_cert),
                &domains,
                90,
            );
            let mut chain = String::from_utf8(leaf.to_pem().unwrap()).unwrap();
            chain.push_str(&String::from_utf8(self.ca_cert.to_pem().unwrap()).unwrap());
            order.chain = Some(chain);
            order.status = if order.processing_polls > 0 {
                "processing".into()
            } else {
                "valid".into()
            };
        }
        self.order_response(200, false)
    }

    fn problem(&self, status: u16, problem_type: &str, detail: &str) -> Response {
        let body = json!({ "type": problem_type, "detail": detail, "status": status });
        self.reply(status, None, &body.to_string(), "application/problem+json")
    }

    fn reply(
        &self,
        status: u16,
        location: Option<&str>,
        body: &str,
        content_type: &str,
    ) -> Response {
        let mut builder = http::Response::builder()
            .status(status)
            .header("Replay-Nonce", self.fresh_nonce())
            .header("Content-Type", content_type);
        if let Some(location) = location {
            builder = builder.header("Location", location);
        }
        builder.body(Body::from(body.to_string())).unwrap()
    }
}

fn jws_parts(body: &[u8]) -> Option<(Value, Vec<u8>)> {
    let v: Value = serde_json::from_slice(body).ok()?;
    let protected = URL_SAFE_NO_PAD.decode(v["protected"].as_str()?).ok()?;
    let protected: Value = serde_json::from_slice(&protected).ok()?;
    let payload_field = v["payload"].as_str()?;
    let payload = if payload_field.is_empty() {
        Vec::new()
    } else {
        URL_SAFE_NO_PAD.decode(payload_field).ok()?
    };
    Some((protected, payload))
}

/// A key and matching self-signed certificate, PEM encoded, for tests
/// that need a realistic pair without a server round-trip.
pub(crate) fn self_signed_pair(domains: &[&str], days: u32) -> (String, String) {
    let pkey = PKey::from_rsa(Rsa::generate(2048).unwrap()).unwrap();
    let cert = build_cert(&pkey, &pkey, None, domains, days);
    let chain_pem = String::from_utf8(cert.to_pem().unwrap()).unwrap();
    let key_pem = String::from_utf8(pkey.private_key_to_pem_pkcs8().unwrap()).unwrap();
    (chain_pem, key_pem)
}

fn build_cert<T: HasPublic>(
    subject_key: &PKeyRef<T>,
    signer: &PKey<Private>,
    issuer: Option<&X509>,
    domains: &[&str],
    days: u32,
) -> X509 {
    let mut builder = X509Builder::new().unwrap();
    builder.set_version(2).unwrap();

    let serial = BigNum::from_u32(next_serial())
        .unwrap()
        .to_asn1_integer()
        .unwrap();
    builder.set_serial_number(&serial).unwrap();

    let mut name = X509NameBuilder::new().unwrap();
    name.append_entry_by_text("CN", domains.first().copied().unwrap_or("autocert test ca"))
        .unwrap();
    let name = name.build();
    builder.set_subject_name(&name).unwrap();
    let issuer_ref: Option<&X509Ref> = issuer.map(|c| &**c);
    match issuer_ref {
        Some(ca) => builder.set_issuer_name(ca.subject_name()).unwrap(),
        None => builder.set_issuer_name(&name).unwrap(),
    }

    builder.set_pubkey(subject_key).unwrap();
    builder
        .set_not_before(&Asn1Time::days_from_now(0).unwrap())
        .unwrap();
    builder
        .set_not_after(&Asn1Time::days_from_now(days).unwrap())
        .unwrap();

    if !domains.is_empty() {
        let mut an = SubjectAlternativeName::new();
        for domain in domains {
            an.dns(domain);
        }
        let ext = {
            let ctx = builder.x509v3_context(issuer_ref, None);
            an.build(&ctx).unwrap()
        };
        builder.append_extension(ext).unwrap();
    }

    builder.sign(signer, MessageDigest::sha256()).unwrap();
    builder.build()
}
