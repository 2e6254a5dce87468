//! HTTP-01 challenge responder.
//!
//! The host owns the plaintext listener on port 80; this is the piece it
//! embeds. During an order the library registers each challenge token
//! here, and the host answers `/.well-known/acme-challenge/{token}`
//! requests from the map. Anything not in the map is the host's own
//! traffic and passes through untouched.
//!
//! A matching request is answered `200 text/plain; charset=utf-8` with
//! the key authorization as the exact body, no trailing newline:
//!
//! ```no_run
//! # fn serve(path: &str, responder: &autocert::Http01Responder) -> Option<(u16, String)> {
//! if let Some(body) = responder.response_for(path) {
//!     // respond 200, Content-Type: text/plain; charset=utf-8
//!     return Some((200, body));
//! }
//! // fall through to the host's normal handler
//! # None
//! # }
//! ```

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use log::debug;

/// Prefix of every http-01 challenge request.
pub const CHALLENGE_PATH_PREFIX: &str = "/.well-known/acme-challenge/";

/// Token-to-key-authorization map shared between the order engine and the
/// host's listener. Cloning is cheap and all clones see the same map.
#[derive(Clone, Default)]
pub struct Http01Responder {
    tokens: Arc<Mutex<HashMap<String, String>>>,
}

impl Http01Responder {
    pub fn new() -> Http01Responder {
        Http01Responder::default()
    }

    /// True if the path belongs to the challenge namespace.
    pub fn is_challenge_path(path: &str) -> bool {
        path.starts_with(CHALLENGE_PATH_PREFIX)
    }

    /// The token of a challenge path, if it is one.
    pub fn extract_token(path: &str) -> Option<&str> {
        path.strip_prefix(CHALLENGE_PATH_PREFIX)
            .filter(|t| !t.is_empty())
    }

    /// Body for a challenge request, or `None` when the request is not a
    /// known challenge and the host should handle it itself.
    pub fn response_for(&self, path: &str) -> Option<String> {
        let token = Self::extract_token(path)?;
        self.tokens.lock().unwrap().get(token).cloned()
    }

    /// Number of challenges currently being served.
    pub fn active_challenges(&self) -> usize {
        self.tokens.lock().unwrap().len()
    }

    pub(crate) fn register(&self, token: String, key_authorization: String) {
        debug!("serve challenge token {}", token);
        self.tokens.lock().unwrap().insert(token, key_authorization);
    }

    pub(crate) fn deregister(&self, token: &str) {
        debug!("withdraw challenge token {}", token);
        self.tokens.lock().unwrap().remove(token);
    }
}
