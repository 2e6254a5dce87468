//! ACME account registration.

use std::sync::Arc;

use log::debug;

use crate::api::{ApiAccount, ApiDirectory, ApiProblem};
use crate::dir::Directory;
use crate::error::{Error, Result};
use crate::identity::AccountIdentity;
use crate::jws;
use crate::trans::Transport;

/// A registered account: the signed-request transport with its key id
/// set, plus the directory the rest of the flow needs.
///
/// Registration is idempotent. `newAccount` with an already-known key
/// returns 200 and the existing account URL in `Location`; a fresh key
/// gets 201. Either way the URL becomes the `kid` for every later call.
pub(crate) struct Account {
    transport: Transport,
    api_directory: ApiDirectory,
}

impl Account {
    pub fn register(
        dir: &Directory,
        identity: Arc<AccountIdentity>,
        contacts: &[String],
    ) -> Result<Account> {
        let payload = ApiAccount {
            contact: if contacts.is_empty() {
                None
            } else {
                Some(contacts.to_vec())
            },
            terms_of_service_agreed: Some(true),
            ..Default::default()
        };

        let mut transport = Transport::new(dir.client.clone(), dir.nonce_pool.clone(), identity);
        let res = transport
            .call_jwk(&dir.api_directory.new_account, &payload)
            .map_err(|e| match e {
                Error::AcmeRequest(problem) => Error::AccountRegistration(problem),
                other => other,
            })?;

        let kid = res.require_location().map_err(|e| match e {
            Error::AcmeRequest(problem) => Error::AccountRegistration(problem),
            other => other,
        })?;
        debug!("account key id: {}", kid);
        transport.set_key_id(kid);

        let api_account: ApiAccount = res.json()?;
        if !api_account.is_status_valid() {
            return Err(Error::AccountRegistration(ApiProblem::local(
                "accountNotValid",
                format!(
                    "account status is {:?}",
                    api_account.status.as_deref().unwrap_or("unknown")
                ),
            )));
        }

        Ok(Account {
            transport,
            api_directory: dir.api_directory.clone(),
        })
    }

    pub fn transport(&self) -> &Transport {
        &self.transport
    }

    pub fn directory(&self) -> &ApiDirectory {
        &self.api_directory
    }

    /// Key authorization for an http-01 token under this account's key.
    pub fn key_authorization(&self, token: &str) -> String {
        jws::key_authorization(token, self.transport.identity())
    }
}
