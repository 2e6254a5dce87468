//! Flattened JWS signing and JWK handling.
//!
//! Just the RFC 7515/7517/7638 subset ACME needs: an RS256 flattened
//! signature with either an inline `jwk` (before the account exists) or a
//! `kid` (after), and the canonical thumbprint that goes into key
//! authorizations.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use openssl::sha::sha256;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::identity::AccountIdentity;

pub(crate) fn base64url<T: ?Sized + AsRef<[u8]>>(input: &T) -> String {
    URL_SAFE_NO_PAD.encode(input)
}

#[derive(Debug, Serialize, Default)]
struct JwsProtected {
    alg: String,
    url: String,
    nonce: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    jwk: Option<Jwk>,
    #[serde(skip_serializing_if = "Option::is_none")]
    kid: Option<String>,
}

impl JwsProtected {
    fn new_jwk(jwk: Jwk, url: &str, nonce: String) -> Self {
        JwsProtected {
            alg: "RS256".into(),
            url: url.into(),
            nonce,
            jwk: Some(jwk),
            ..Default::default()
        }
    }
    fn new_kid(kid: &str, url: &str, nonce: String) -> Self {
        JwsProtected {
            alg: "RS256".into(),
            url: url.into(),
            nonce,
            kid: Some(kid.into()),
            ..Default::default()
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub(crate) struct Jwk {
    pub alg: String,
    pub e: String,
    pub kty: String,
    pub n: String,
    #[serde(rename = "use")]
    pub _use: String,
}

impl Jwk {
    /// RSA signing key from its public components (big-endian bytes).
    pub fn rs256(n: &[u8], e: &[u8]) -> Jwk {
        Jwk {
            alg: "RS256".into(),
            e: base64url(e),
            kty: "RSA".into(),
            n: base64url(n),
            _use: "sig".into(),
        }
    }
}

#[derive(Debug, Serialize, Clone)]
// LEXICAL ORDER OF FIELDS MATTER! (RFC 7638 required members only)
struct JwkThumb {
    e: String,
    kty: String,
    n: String,
}

impl From<&Jwk> for JwkThumb {
    fn from(a: &Jwk) -> Self {
        JwkThumb {
            e: a.e.clone(),
            kty: a.kty.clone(),
            n: a.n.clone(),
        }
    }
}

#[derive(Debug, Serialize)]
struct Jws {
    protected: String,
    payload: String,
    signature: String,
}

pub(crate) fn make_jws_jwk<T: Serialize + ?Sized>(
    url: &str,
    nonce: String,
    identity: &AccountIdentity,
    payload: &T,
) -> Result<String> {
    let protected = JwsProtected::new_jwk(identity.jwk(), url, nonce);
    seal(protected, identity, payload)
}

pub(crate) fn make_jws_kid<T: Serialize + ?Sized>(
    url: &str,
    nonce: String,
    identity: &AccountIdentity,
    kid: &str,
    payload: &T,
) -> Result<String> {
    let protected = JwsProtected::new_kid(kid, url, nonce);
    seal(protected, identity, payload)
}

fn seal<T: Serialize + ?Sized>(
    protected: JwsProtected,
    identity: &AccountIdentity,
    payload: &T,
) -> Result<String> {
    let protected = {
        let pro_json = serde_json::to_string(&protected)?;
        base64url(pro_json.as_bytes())
    };
    let payload = {
        let pay_json = serde_json::to_string(payload)?;
        if pay_json == "\"\"" {
            // ApiEmptyString: POST-as-GET carries a truly empty payload,
            // not an encoded empty string.
            String::new()
        } else {
            base64url(pay_json.as_bytes())
        }
    };

    let to_sign = format!("{}.{}", protected, payload);
    let signature = base64url(&identity.sign_rs256(to_sign.as_bytes())?);

    let jws = Jws {
        protected,
        payload,
        signature,
    };

    Ok(serde_json::to_string(&jws)?)
}

/// RFC 7638 thumbprint: base64url(SHA-256(canonical JWK JSON)).
pub(crate) fn thumbprint(jwk: &Jwk) -> String {
    let jwk_thumb: JwkThumb = jwk.into();
    let json = serde_json::to_string(&jwk_thumb).expect("jwk_thumb");
    base64url(&sha256(json.as_bytes()))
}

/// `token || "." || thumbprint`; the body served from the http-01 URL.
pub(crate) fn key_authorization(token: &str, identity: &AccountIdentity) -> String {
    format!("{}.{}", token, identity.thumbprint())
}
