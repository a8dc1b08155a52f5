use std::fmt;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use sha2::{Digest, Sha256};

use crate::domains::registrable_domain;
use crate::jws::RsaAccountKey;

/// Label under which DNS-01 TXT records are published.
pub const ACME_CHALLENGE_LABEL: &str = "_acme-challenge";

/// `token "." base64url(JWK thumbprint)` (RFC 8555 §8.1).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct KeyAuthorization(String);

impl KeyAuthorization {
    #[must_use]
    pub fn new(token: &str, account_key: &RsaAccountKey) -> Self {
        Self::from_thumbprint(token, &account_key.jwk_thumbprint())
    }

    #[must_use]
    pub fn from_thumbprint(token: &str, thumbprint: &str) -> Self {
        Self(format!("{token}.{thumbprint}"))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// TXT record value: base64url(SHA-256(key authorization)), RFC 8555 §8.4.
    #[must_use]
    pub fn dns_txt_value(&self) -> String {
        URL_SAFE_NO_PAD.encode(Sha256::digest(self.0.as_bytes()))
    }
}

impl fmt::Display for KeyAuthorization {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Record name relative to the registrable domain.
///
/// `example.com` yields `_acme-challenge`, `api.eu.example.com` yields
/// `_acme-challenge.api.eu`. A leading wildcard label is ignored.
#[must_use]
pub fn challenge_host_prefix(domain: &str) -> String {
    let domain = domain.strip_prefix("*.").unwrap_or(domain);
    let zone = registrable_domain(domain);
    match domain
        .strip_suffix(zone)
        .and_then(|rest| rest.strip_suffix('.'))
    {
        Some(sub) if !sub.is_empty() => format!("{ACME_CHALLENGE_LABEL}.{sub}"),
        _ => ACME_CHALLENGE_LABEL.to_owned(),
    }
}

/// TXT record published for one authorization.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DnsRecordHandle {
    /// Domain the authorization is for.
    pub domain: String,
    /// Zone the record lives in (last two labels of `domain`).
    pub zone: String,
    pub host_prefix: String,
    pub value: String,
}

impl DnsRecordHandle {
    #[must_use]
    pub fn new(domain: &str, key_authorization: &KeyAuthorization) -> Self {
        let bare = domain.strip_prefix("*.").unwrap_or(domain);
        Self {
            domain: bare.to_owned(),
            zone: registrable_domain(bare).to_owned(),
            host_prefix: challenge_host_prefix(bare),
            value: key_authorization.dns_txt_value(),
        }
    }

    /// Fully qualified record name, e.g. `_acme-challenge.www.example.com`.
    #[must_use]
    pub fn fqdn(&self) -> String {
        format!("{}.{}", self.host_prefix, self.zone)
    }
}
