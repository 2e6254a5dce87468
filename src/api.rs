//! ACME wire objects (RFC 8555 §7).
//!
//! Request payloads and response bodies as the server sees them. Each
//! operation is a plain data value handed to the transport; statuses stay
//! strings with `is_status_*` helpers because the server owns the state
//! machine.

use serde::ser::{SerializeMap, Serializer};
use serde::{Deserialize, Serialize};

/// Serializes to `""`. The POST-as-GET payload.
pub(crate) struct ApiEmptyString;

impl Serialize for ApiEmptyString {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str("")
    }
}

/// Serializes to `{}`. Signals a challenge is ready for validation.
pub(crate) struct ApiEmptyObject;

impl Serialize for ApiEmptyObject {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let m = serializer.serialize_map(Some(0))?;
        m.end()
    }
}

/// RFC 7807 problem document returned on ACME-level errors.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct ApiProblem {
    #[serde(rename = "type", default)]
    pub problem_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subproblems: Option<Vec<ApiSubproblem>>,
}

impl ApiProblem {
    /// A problem we manufactured locally (transport failure, missing
    /// header) rather than one the server sent.
    pub(crate) fn local(problem_type: &str, detail: impl Into<String>) -> ApiProblem {
        ApiProblem {
            problem_type: problem_type.into(),
            detail: Some(detail.into()),
            ..Default::default()
        }
    }

    pub fn is_bad_nonce(&self) -> bool {
        // Let's Encrypt and Pebble send the full urn; keep accepting the
        // bare form as well.
        self.problem_type == "urn:ietf:params:acme:error:badNonce"
            || self.problem_type == "badNonce"
    }
}

impl std::fmt::Display for ApiProblem {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        if let Some(detail) = &self.detail {
            write!(f, "{}: {}", self.problem_type, detail)
        } else {
            write!(f, "{}", self.problem_type)
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct ApiSubproblem {
    #[serde(rename = "type", default)]
    pub problem_type: String,
    pub detail: Option<String>,
    pub identifier: Option<ApiIdentifier>,
}

/// The directory document: operation name to URL.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiDirectory {
    pub new_nonce: String,
    pub new_account: String,
    pub new_order: String,
    pub revoke_cert: String,
    pub key_change: String,
    #[serde(default)]
    pub meta: Option<ApiDirectoryMeta>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct ApiDirectoryMeta {
    pub terms_of_service: Option<String>,
    pub website: Option<String>,
    pub caa_identities: Option<Vec<String>>,
    pub external_account_required: Option<bool>,
}

/// `newAccount` request and account response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct ApiAccount {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub contact: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub terms_of_service_agreed: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub only_return_existing: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub orders: Option<String>,
}

impl ApiAccount {
    pub fn is_status_valid(&self) -> bool {
        self.status.as_deref() == Some("valid")
    }
}

/// `newOrder` request: the SAN set as dns identifiers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ApiNewOrder {
    pub identifiers: Vec<ApiIdentifier>,
}

impl ApiNewOrder {
    pub fn for_domains(domains: &[String]) -> ApiNewOrder {
        ApiNewOrder {
            identifiers: domains
                .iter()
                .map(|d| ApiIdentifier {
                    identifier_type: "dns".into(),
                    value: d.clone(),
                })
                .collect(),
        }
    }
}

/// Order resource.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiOrder {
    pub status: Option<String>,
    pub expires: Option<String>,
    pub identifiers: Vec<ApiIdentifier>,
    #[serde(default)]
    pub error: Option<ApiProblem>,
    #[serde(default)]
    pub authorizations: Option<Vec<String>>,
    pub finalize: String,
    #[serde(default)]
    pub certificate: Option<String>,
}

impl ApiOrder {
    /// Outstanding authorizations remain.
    pub fn is_status_pending(&self) -> bool {
        self.status.as_deref() == Some("pending")
    }
    /// All authorizations done; waiting for the CSR.
    pub fn is_status_ready(&self) -> bool {
        self.status.as_deref() == Some("ready")
    }
    /// CSR submitted, the server is signing.
    pub fn is_status_processing(&self) -> bool {
        self.status.as_deref() == Some("processing")
    }
    /// Certificate issued and downloadable.
    pub fn is_status_valid(&self) -> bool {
        self.status.as_deref() == Some("valid")
    }
    pub fn is_status_invalid(&self) -> bool {
        self.status.as_deref() == Some("invalid")
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApiIdentifier {
    #[serde(rename = "type")]
    pub identifier_type: String,
    pub value: String,
}

/// Authorization resource: one per identifier.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ApiAuth {
    pub identifier: ApiIdentifier,
    pub status: Option<String>,
    pub expires: Option<String>,
    pub challenges: Vec<ApiChallenge>,
    #[serde(default)]
    pub wildcard: Option<bool>,
}

impl ApiAuth {
    pub fn is_status_pending(&self) -> bool {
        self.status.as_deref() == Some("pending")
    }
    pub fn is_status_valid(&self) -> bool {
        self.status.as_deref() == Some("valid")
    }
    pub fn is_status_invalid(&self) -> bool {
        self.status.as_deref() == Some("invalid")
    }
    /// The first listed http-01 challenge, if the server offers one.
    pub fn http_challenge(&self) -> Option<&ApiChallenge> {
        self.challenges
            .iter()
            .find(|c| c.challenge_type == "http-01")
    }
    /// The error of whichever challenge failed, for reporting.
    pub fn challenge_error(&self) -> Option<&ApiProblem> {
        self.challenges.iter().filter_map(|c| c.error.as_ref()).next()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ApiChallenge {
    pub url: String,
    #[serde(rename = "type")]
    pub challenge_type: String,
    pub status: String,
    pub token: String,
    #[serde(default)]
    pub validated: Option<String>,
    #[serde(default)]
    pub error: Option<ApiProblem>,
}

/// Finalize request: the CSR as base64url DER.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ApiFinalize {
    pub csr: String,
}
