use std::fmt;
use std::str::FromStr;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use http::header::{HeaderMap, ToStrError};
use thiserror::Error;

/// Name of the `Replay-Nonce` header used by ACME servers.
pub const REPLAY_NONCE_HEADER: &str = "replay-nonce";

/// Errors raised while reading a replay nonce.
#[derive(Debug, Error)]
pub enum NonceError {
    /// The nonce value was empty.
    #[error("Replay-Nonce value must not be empty")]
    Empty,
    /// The nonce is not unpadded base64url.
    #[error("Replay-Nonce value is not valid base64url: {source}")]
    InvalidBase64 {
        #[source]
        source: base64::DecodeError,
    },
    /// The header value could not be read as text.
    #[error("Replay-Nonce header is not valid UTF-8: {source}")]
    InvalidHeaderEncoding {
        #[source]
        source: ToStrError,
    },
}

/// Single-use, base64url encoded nonce handed out by an ACME server.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ReplayNonce(String);

impl ReplayNonce {
    /// Parses a nonce and checks that it is unpadded base64url (RFC 8555 §6.5.1).
    ///
    /// # Errors
    ///
    /// * `NonceError::Empty` when the value only contains whitespace.
    /// * `NonceError::InvalidBase64` when the value cannot be decoded.
    pub fn parse<S: AsRef<str>>(value: S) -> Result<Self, NonceError> {
        let trimmed = value.as_ref().trim();
        if trimmed.is_empty() {
            return Err(NonceError::Empty);
        }

        URL_SAFE_NO_PAD
            .decode(trimmed)
            .map_err(|source| NonceError::InvalidBase64 { source })?;

        Ok(Self(trimmed.to_owned()))
    }

    /// Reads the `Replay-Nonce` header from an HTTP response.
    ///
    /// Returns `Ok(None)` when the header is absent.
    ///
    /// # Errors
    ///
    /// Returns `NonceError` when the header is present but malformed.
    pub fn from_headers(headers: &HeaderMap) -> Result<Option<Self>, NonceError> {
        let Some(value) = headers.get(REPLAY_NONCE_HEADER) else {
            return Ok(None);
        };

        let as_str = value
            .to_str()
            .map_err(|source| NonceError::InvalidHeaderEncoding { source })?;
        Self::parse(as_str).map(Some)
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    #[must_use]
    pub fn into_inner(self) -> String {
        self.0
    }
}

impl FromStr for ReplayNonce {
    type Err = NonceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for ReplayNonce {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
