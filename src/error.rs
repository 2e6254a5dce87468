//
use std::fmt;
use std::io;
use std::path::PathBuf;

use crate::api::ApiProblem;

/// autocert result.
pub type Result<T> = std::result::Result<T, Error>;

/// autocert errors.
///
/// Every failure the library can produce is one of these kinds. Local
/// problems (keys, disk state, configuration) are separated from protocol
/// problems, which carry the server's RFC 7807 problem document.
#[derive(Debug)]
pub enum Error {
    /// The account or certificate key file could not be read or written.
    IdentityIo { path: PathBuf, source: io::Error },
    /// A key file exists but does not parse as an RSA private key PEM.
    IdentityParse { path: PathBuf, reason: String },
    /// The ACME directory is unreachable or malformed.
    DirectoryFetch(String),
    /// No replay nonce could be obtained.
    Nonce(String),
    /// The ACME server rejected a signed request.
    AcmeRequest(ApiProblem),
    /// `newAccount` failed.
    AccountRegistration(ApiProblem),
    /// An order or one of its authorizations ended `invalid`.
    OrderFailed(ApiProblem),
    /// Authorization or finalize polling exceeded its deadline.
    OrderTimeout(&'static str),
    /// The files on disk are in a state the crash-recovery table cannot
    /// classify. Requires operator intervention.
    CertificateStateCorrupted(String),
    /// Bad input to [`provision`](crate::provision).
    Configuration(String),
    /// JSON serialization/deserialization error.
    Json(serde_json::Error),
    /// std::io error outside the identity files.
    Io(io::Error),
    /// OpenSSL failure.
    Ssl(openssl::error::ErrorStack),
    /// The issued chain could not be turned into a rustls server config.
    Tls(String),
}

impl std::error::Error for Error {}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Error::IdentityIo { path, source } => {
                write!(f, "identity file {}: {}", path.display(), source)
            }
            Error::IdentityParse { path, reason } => {
                write!(f, "identity file {} is not a valid key: {}", path.display(), reason)
            }
            Error::DirectoryFetch(s) => write!(f, "directory fetch: {}", s),
            Error::Nonce(s) => write!(f, "nonce: {}", s),
            Error::AcmeRequest(p) => write!(f, "acme request: {}", p),
            Error::AccountRegistration(p) => write!(f, "account registration: {}", p),
            Error::OrderFailed(p) => write!(f, "order failed: {}", p),
            Error::OrderTimeout(what) => write!(f, "timed out waiting for {}", what),
            Error::CertificateStateCorrupted(s) => {
                write!(f, "certificate state corrupted: {}", s)
            }
            Error::Configuration(s) => write!(f, "configuration: {}", s),
            Error::Json(e) => write!(f, "{}", e),
            Error::Io(e) => write!(f, "{}", e),
            Error::Ssl(e) => write!(f, "{}", e),
            Error::Tls(s) => write!(f, "tls config: {}", s),
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Json(e)
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Error::Io(e)
    }
}

impl From<openssl::error::ErrorStack> for Error {
    fn from(e: openssl::error::ErrorStack) -> Self {
        Error::Ssl(e)
    }
}
