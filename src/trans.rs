//! Signed request transport: nonce pool and the JWS POST engine.
//!
//! Every ACME call goes through [`Transport`]: take a nonce, sign the
//! payload, POST it, harvest the replay nonce from whatever comes back.
//! A `badNonce` rejection is retried exactly once with the nonce the
//! error response carried; anything else is the caller's problem.

use std::collections::VecDeque;
use std::io::Read;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use log::{debug, trace};
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::api::ApiProblem;
use crate::error::{Error, Result};
use crate::identity::AccountIdentity;
use crate::jws;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
const NEW_NONCE_TIMEOUT: Duration = Duration::from_secs(10);
const REPLAY_NONCE: &str = "Replay-Nonce";
const USER_AGENT: &str = concat!("autocert/", env!("CARGO_PKG_VERSION"));

/// Blocking HTTP client with the fixed headers and timeouts every ACME
/// request uses. `accept_invalid_certs` exists for Pebble, whose
/// management endpoint serves a self-signed certificate.
#[derive(Clone)]
pub(crate) struct HttpClient {
    agent: ureq::Agent,
}

impl HttpClient {
    pub fn new(accept_invalid_certs: bool) -> Result<HttpClient> {
        let mut builder = ureq::builder()
            .timeout_connect(REQUEST_TIMEOUT)
            .timeout(REQUEST_TIMEOUT)
            .user_agent(USER_AGENT);
        if accept_invalid_certs {
            let tls = native_tls::TlsConnector::builder()
                .danger_accept_invalid_certs(true)
                .danger_accept_invalid_hostnames(true)
                .build()
                .map_err(|e| Error::DirectoryFetch(format!("tls connector: {}", e)))?;
            builder = builder.tls_connector(Arc::new(tls));
        }
        Ok(HttpClient {
            agent: builder.build(),
        })
    }

    pub fn get(&self, url: &str) -> std::result::Result<AcmeResponse, String> {
        trace!("GET {}", url);
        let req = self.agent.get(url).set("Accept-Language", "en-US");
        into_response(req.call()).map_err(|t| t.to_string())
    }

    fn head(&self, url: &str) -> std::result::Result<AcmeResponse, String> {
        trace!("HEAD {}", url);
        let req = self
            .agent
            .head(url)
            .timeout(NEW_NONCE_TIMEOUT)
            .set("Accept-Language", "en-US");
        into_response(req.call()).map_err(|t| t.to_string())
    }

    fn post_jose(&self, url: &str, body: &str) -> Result<AcmeResponse> {
        trace!("POST {} {}", url, body);
        let req = self
            .agent
            .post(url)
            .set("Content-Type", "application/jose+json")
            .set("Accept-Language", "en-US");
        into_response(req.send_string(body)).map_err(|t| {
            Error::AcmeRequest(ApiProblem::local(
                "httpRequestError",
                format!("POST {}: {}", url, t),
            ))
        })
    }
}

/// Status, the interesting headers, and the raw body of an ACME response.
/// The body stays bytes; callers parse JSON when they expect JSON (the
/// certificate download does not).
pub(crate) struct AcmeResponse {
    pub status: u16,
    pub location: Option<String>,
    pub nonce: Option<String>,
    content_type: String,
    pub body: Vec<u8>,
}

impl AcmeResponse {
    pub fn json<T: DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_slice(&self.body)?)
    }

    pub fn body_string(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    pub fn require_location(&self) -> Result<String> {
        self.location.clone().ok_or_else(|| {
            Error::AcmeRequest(ApiProblem::local(
                "missingHeader",
                "response lacked a Location header",
            ))
        })
    }

    /// The problem document of a failed response, or a synthesized one if
    /// the server did not send `application/problem+json`.
    fn problem(&self) -> ApiProblem {
        if self.content_type == "application/problem+json" {
            serde_json::from_slice(&self.body).unwrap_or_else(|e| {
                ApiProblem::local(
                    "problemJsonFail",
                    format!(
                        "failed to deserialize problem body ({}): {}",
                        e,
                        self.body_string()
                    ),
                )
            })
        } else {
            ApiProblem::local(
                "httpStatusError",
                format!("{} body: {}", self.status, self.body_string()),
            )
        }
    }
}

/// Both arms of a ureq result carry a usable response; only transport
/// failures (DNS, TCP, TLS) surface as `Err`.
fn into_response(
    res: std::result::Result<ureq::Response, ureq::Error>,
) -> std::result::Result<AcmeResponse, ureq::Transport> {
    let res = match res {
        Ok(res) => res,
        Err(ureq::Error::Status(_, res)) => res,
        Err(ureq::Error::Transport(t)) => return Err(t),
    };
    let status = res.status();
    let location = res.header("Location").map(str::to_string);
    let nonce = res.header(REPLAY_NONCE).map(str::to_string);
    let content_type = res.content_type().to_string();
    let mut body = Vec::new();
    // Let's Encrypt sometimes closes the TLS session abruptly even though
    // the body arrived in full.
    res.into_reader().read_to_end(&mut body).ok();
    Ok(AcmeResponse {
        status,
        location,
        nonce,
        content_type,
        body,
    })
}

/// Shared FIFO of replay nonces. Every response donates one; `take`
/// falls back to a HEAD against `newNonce` when the pool runs dry, with
/// at most one such fetch in flight.
pub(crate) struct NoncePool {
    client: HttpClient,
    new_nonce_url: String,
    pool: Mutex<VecDeque<String>>,
    fetch: Mutex<()>,
}

impl NoncePool {
    pub fn new(client: HttpClient, new_nonce_url: &str) -> NoncePool {
        NoncePool {
            client,
            new_nonce_url: new_nonce_url.into(),
            pool: Mutex::new(VecDeque::new()),
            fetch: Mutex::new(()),
        }
    }

    pub fn put(&self, nonce: String) {
        trace!("pool nonce");
        self.pool.lock().unwrap().push_back(nonce);
    }

    pub fn put_from(&self, res: &AcmeResponse) {
        if let Some(nonce) = &res.nonce {
            self.put(nonce.clone());
        }
    }

    pub fn take(&self) -> Result<String> {
        if let Some(nonce) = self.pool.lock().unwrap().pop_front() {
            trace!("use pooled nonce");
            return Ok(nonce);
        }
        let _flight = self.fetch.lock().unwrap();
        // another caller may have refilled the pool while we waited
        if let Some(nonce) = self.pool.lock().unwrap().pop_front() {
            return Ok(nonce);
        }
        debug!("fetch fresh nonce");
        let res = self
            .client
            .head(&self.new_nonce_url)
            .map_err(Error::Nonce)?;
        res.nonce
            .ok_or_else(|| Error::Nonce("newNonce response lacked Replay-Nonce".into()))
    }
}

/// The signed request engine.
///
/// Setup mirrors the protocol: `call_jwk` for the one request made before
/// the account exists (`newAccount`), `set_key_id` with the returned
/// Location, `call` for everything after.
pub(crate) struct Transport {
    client: HttpClient,
    nonce_pool: Arc<NoncePool>,
    identity: Arc<AccountIdentity>,
    kid: Option<String>,
}

impl Transport {
    pub fn new(
        client: HttpClient,
        nonce_pool: Arc<NoncePool>,
        identity: Arc<AccountIdentity>,
    ) -> Transport {
        Transport {
            client,
            nonce_pool,
            identity,
            kid: None,
        }
    }

    pub fn set_key_id(&mut self, kid: String) {
        self.kid = Some(kid);
    }

    pub fn identity(&self) -> &AccountIdentity {
        &self.identity
    }

    /// Call with the full public JWK in the protected header. Only for
    /// `newAccount`.
    pub fn call_jwk<T: Serialize + ?Sized>(&self, url: &str, payload: &T) -> Result<AcmeResponse> {
        self.do_call(url, payload, false)
    }

    /// Call with the account key id in the protected header.
    pub fn call<T: Serialize + ?Sized>(&self, url: &str, payload: &T) -> Result<AcmeResponse> {
        self.do_call(url, payload, true)
    }

    fn do_call<T: Serialize + ?Sized>(
        &self,
        url: &str,
        payload: &T,
        use_kid: bool,
    ) -> Result<AcmeResponse> {
        let mut retried = false;
        loop {
            let nonce = self.nonce_pool.take()?;
            let body = if use_kid {
                let kid = self.kid.as_deref().ok_or_else(|| {
                    Error::AcmeRequest(ApiProblem::local(
                        "noKeyId",
                        "account key id requested before registration",
                    ))
                })?;
                jws::make_jws_kid(url, nonce, &self.identity, kid, payload)?
            } else {
                jws::make_jws_jwk(url, nonce, &self.identity, payload)?
            };

            debug!("call endpoint {}", url);
            let res = self.client.post_jose(url, &body)?;

            // success or not, the response may carry a fresh nonce
            self.nonce_pool.put_from(&res);

            if (200..300).contains(&res.status) {
                return Ok(res);
            }

            let problem = res.problem();
            if problem.is_bad_nonce() && !retried {
                // the rejection itself delivered a fresh nonce; one retry,
                // never more, so a confused server cannot start a storm
                debug!("retrying on bad nonce");
                retried = true;
                continue;
            }
            return Err(Error::AcmeRequest(problem));
        }
    }
}
