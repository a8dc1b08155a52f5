use http::header::{HeaderMap, LOCATION};
use http::StatusCode;
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, trace};
use url::Url;

use crate::directory::{AcmeDirectory, AcmeDirectoryError};
use crate::http::{AcmeHttpClient, HttpError};
use crate::jws::{JwsError, KeyBinding, RsaAccountKey};
use crate::nonce::{NonceError, ReplayNonce};
use crate::problem::AcmeProtocolError;

/// Failures of the signed-request transport.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error(transparent)]
    Http(#[from] HttpError),
    #[error("ACME server did not return a Replay-Nonce from {url}")]
    MissingReplayNonce { url: Url },
    #[error(transparent)]
    Nonce(#[from] NonceError),
    #[error(transparent)]
    Signing(#[from] JwsError),
    #[error("failed to load ACME directory: {0}")]
    Directory(#[from] AcmeDirectoryError),
    #[error(transparent)]
    Protocol(#[from] AcmeProtocolError),
    #[error("no account URL is bound; register the account before calling {url}")]
    AccountNotRegistered { url: Url },
}

/// Successful (2xx) ACME response.
#[derive(Debug, Clone)]
pub struct AcmeResponse {
    pub url: Url,
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Vec<u8>,
}

impl AcmeResponse {
    /// `Location` header resolved against the request URL.
    #[must_use]
    pub fn location(&self) -> Option<Url> {
        let value = self.headers.get(LOCATION)?.to_str().ok()?;
        self.url.join(value.trim()).ok()
    }

    #[must_use]
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

/// Fetches and parses the directory document.
///
/// # Errors
///
/// Returns `TransportError` on connection failures, non-2xx answers or an
/// unparsable directory.
pub fn fetch_directory<C: AcmeHttpClient>(
    client: &C,
    url: &Url,
) -> Result<AcmeDirectory, TransportError> {
    let response = client.get(url)?;
    if !response.status.is_success() {
        return Err(AcmeProtocolError::from_response(response.status, &response.body).into());
    }
    let directory = AcmeDirectory::from_json_slice(&response.body)?;
    debug!(directory = %url, new_order = %directory.new_order, "ACME directory loaded");
    Ok(directory)
}

/// JWS transport bound to one directory and one account key.
///
/// Every call blocks on network I/O. Each signed request fetches a fresh
/// nonce first; nonces are never cached or reused.
#[derive(Debug)]
pub struct AcmeTransport<C> {
    client: C,
    directory: AcmeDirectory,
    account_key: RsaAccountKey,
    account_url: Option<Url>,
}

impl<C: AcmeHttpClient> AcmeTransport<C> {
    #[must_use]
    pub const fn new(client: C, directory: AcmeDirectory, account_key: RsaAccountKey) -> Self {
        Self {
            client,
            directory,
            account_key,
            account_url: None,
        }
    }

    /// Fetches the directory from `directory_url` and builds a transport.
    ///
    /// # Errors
    ///
    /// See [`fetch_directory`].
    pub fn connect(
        client: C,
        directory_url: &Url,
        account_key: RsaAccountKey,
    ) -> Result<Self, TransportError> {
        let directory = fetch_directory(&client, directory_url)?;
        Ok(Self::new(client, directory, account_key))
    }

    #[must_use]
    pub const fn directory(&self) -> &AcmeDirectory {
        &self.directory
    }

    #[must_use]
    pub const fn account_key(&self) -> &RsaAccountKey {
        &self.account_key
    }

    #[must_use]
    pub const fn account_url(&self) -> Option<&Url> {
        self.account_url.as_ref()
    }

    /// Binds the `kid` used for every request other than `newAccount`.
    pub fn set_account_url(&mut self, url: Url) {
        self.account_url = Some(url);
    }

    /// Retrieves a single-use nonce with `HEAD newNonce`.
    ///
    /// # Errors
    ///
    /// Returns `TransportError::MissingReplayNonce` when the header is absent.
    pub fn new_nonce(&self) -> Result<ReplayNonce, TransportError> {
        let url = &self.directory.new_nonce;
        let response = self.client.head(url)?;
        if !response.status.is_success() {
            return Err(AcmeProtocolError::from_response(response.status, &response.body).into());
        }
        ReplayNonce::from_headers(&response.headers)?
            .ok_or_else(|| TransportError::MissingReplayNonce { url: url.clone() })
    }

    /// Signs `payload` and posts it to `url`.
    ///
    /// `None` sends a POST-as-GET (empty payload). The `jwk` binding is used
    /// only for `newAccount`; every other URL requires a bound account.
    ///
    /// # Errors
    ///
    /// * `TransportError::Protocol` for any non-2xx answer.
    /// * `TransportError::AccountNotRegistered` when no `kid` is bound.
    /// * Connection, nonce and signing failures.
    pub fn signed_request(
        &self,
        url: &Url,
        payload: Option<&Value>,
    ) -> Result<AcmeResponse, TransportError> {
        let binding = if url == &self.directory.new_account {
            KeyBinding::Jwk
        } else {
            let kid = self
                .account_url
                .as_ref()
                .ok_or_else(|| TransportError::AccountNotRegistered { url: url.clone() })?;
            KeyBinding::Kid(kid.as_str())
        };

        let nonce = self.new_nonce()?;
        let jws = match payload {
            Some(value) => self.account_key.sign_json(value, &nonce, url, binding)?,
            None => self.account_key.sign_payload(b"", &nonce, url, binding)?,
        };
        let body = serde_json::to_vec(&jws).map_err(JwsError::from)?;

        trace!(url = %url, post_as_get = payload.is_none(), "sending signed ACME request");
        let response = self.client.post_jose(url, body)?;
        if !response.status.is_success() {
            let error = AcmeProtocolError::from_response(response.status, &response.body);
            debug!(url = %url, status = %error.status, problem = %error.problem, "ACME request rejected");
            return Err(error.into());
        }

        Ok(AcmeResponse {
            url: url.clone(),
            status: response.status,
            headers: response.headers,
            body: response.body,
        })
    }

    /// POST-as-GET of an ACME resource.
    ///
    /// # Errors
    ///
    /// Same conditions as [`AcmeTransport::signed_request`].
    pub fn post_as_get(&self, url: &Url) -> Result<AcmeResponse, TransportError> {
        self.signed_request(url, None)
    }
}
