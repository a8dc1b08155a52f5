use std::collections::BTreeMap;

use serde_json::{Map, Value};
use thiserror::Error;
use url::Url;

#[derive(Debug, Error)]
pub enum AcmeDirectoryError {
    #[error("directory document is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("directory document must be a JSON object")]
    NotAnObject,
    #[error("directory field `{0}` is missing")]
    MissingField(&'static str),
    #[error("directory field `{field}` is not a valid URL: {source}")]
    InvalidUrl {
        field: String,
        source: url::ParseError,
    },
    #[error("directory field `{field}` must be a string")]
    InvalidUrlType { field: String },
    #[error("directory field `meta.{field}` has an unexpected type")]
    InvalidMetaField { field: &'static str },
}

/// Directory members defined by RFC 8555 and the ARI extension.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum KnownEndpoint {
    NewNonce,
    NewAccount,
    NewOrder,
    RevokeCert,
    KeyChange,
    NewAuthz,
    RenewalInfo,
}

impl KnownEndpoint {
    const ALL: [Self; 7] = [
        Self::NewNonce,
        Self::NewAccount,
        Self::NewOrder,
        Self::RevokeCert,
        Self::KeyChange,
        Self::NewAuthz,
        Self::RenewalInfo,
    ];

    /// JSON member name, e.g. `newNonce`.
    #[must_use]
    pub const fn as_key(self) -> &'static str {
        match self {
            Self::NewNonce => "newNonce",
            Self::NewAccount => "newAccount",
            Self::NewOrder => "newOrder",
            Self::RevokeCert => "revokeCert",
            Self::KeyChange => "keyChange",
            Self::NewAuthz => "newAuthz",
            Self::RenewalInfo => "renewalInfo",
        }
    }

    #[must_use]
    pub fn from_key(key: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|endpoint| endpoint.as_key() == key)
    }
}

/// Endpoints advertised by an ACME server directory (RFC 8555 §7.1.1).
///
/// `newNonce`, `newAccount` and `newOrder` are mandatory. Other known
/// endpoints are available through [`AcmeDirectory::known`]; unknown string
/// members (Let's Encrypt publishes a random one) land in
/// `additional_endpoints`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AcmeDirectory {
    pub new_nonce: Url,
    pub new_account: Url,
    pub new_order: Url,
    pub meta: Option<AcmeDirectoryMeta>,
    pub additional_endpoints: BTreeMap<String, Url>,
    optional: BTreeMap<KnownEndpoint, Url>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AcmeDirectoryMeta {
    pub terms_of_service: Option<Url>,
    pub website: Option<Url>,
    pub caa_identities: Vec<String>,
    pub external_account_required: bool,
}

impl AcmeDirectory {
    /// Parses a directory document from raw JSON bytes.
    ///
    /// # Errors
    ///
    /// Returns `AcmeDirectoryError` when the document is not a JSON object,
    /// lacks a required endpoint or carries an invalid URL.
    pub fn from_json_slice(bytes: &[u8]) -> Result<Self, AcmeDirectoryError> {
        let value: Value = serde_json::from_slice(bytes)?;
        Self::from_json_value(&value)
    }

    /// # Errors
    ///
    /// Same conditions as [`AcmeDirectory::from_json_slice`].
    pub fn from_json_value(value: &Value) -> Result<Self, AcmeDirectoryError> {
        let Value::Object(object) = value else {
            return Err(AcmeDirectoryError::NotAnObject);
        };
        Self::from_object(object)
    }

    /// URL of a known endpoint, mandatory or not.
    #[must_use]
    pub fn known(&self, endpoint: KnownEndpoint) -> Option<&Url> {
        match endpoint {
            KnownEndpoint::NewNonce => Some(&self.new_nonce),
            KnownEndpoint::NewAccount => Some(&self.new_account),
            KnownEndpoint::NewOrder => Some(&self.new_order),
            other => self.optional.get(&other),
        }
    }

    /// Looks an endpoint up by its JSON member name.
    #[must_use]
    pub fn endpoint(&self, name: &str) -> Option<&Url> {
        KnownEndpoint::from_key(name).map_or_else(
            || self.additional_endpoints.get(name),
            |endpoint| self.known(endpoint),
        )
    }

    #[must_use]
    pub fn terms_of_service(&self) -> Option<&Url> {
        self.meta
            .as_ref()
            .and_then(|meta| meta.terms_of_service.as_ref())
    }

    fn from_object(object: &Map<String, Value>) -> Result<Self, AcmeDirectoryError> {
        let mut known = BTreeMap::new();
        let mut additional_endpoints = BTreeMap::new();
        let mut meta = None;

        for (key, value) in object {
            if key == "meta" {
                meta = Some(AcmeDirectoryMeta::from_value(value)?);
                continue;
            }
            match (KnownEndpoint::from_key(key), value) {
                (Some(endpoint), Value::String(text)) => {
                    known.insert(endpoint, parse_url(key, text)?);
                }
                (Some(_), _) => {
                    return Err(AcmeDirectoryError::InvalidUrlType { field: key.clone() });
                }
                (None, Value::String(text)) => {
                    additional_endpoints.insert(key.clone(), parse_url(key, text)?);
                }
                (None, _) => {}
            }
        }

        let mut required = |endpoint: KnownEndpoint| {
            known
                .remove(&endpoint)
                .ok_or(AcmeDirectoryError::MissingField(endpoint.as_key()))
        };
        Ok(Self {
            new_nonce: required(KnownEndpoint::NewNonce)?,
            new_account: required(KnownEndpoint::NewAccount)?,
            new_order: required(KnownEndpoint::NewOrder)?,
            meta,
            additional_endpoints,
            optional: known,
        })
    }
}

impl AcmeDirectoryMeta {
    fn from_value(value: &Value) -> Result<Self, AcmeDirectoryError> {
        let object = value
            .as_object()
            .ok_or(AcmeDirectoryError::InvalidMetaField { field: "meta" })?;
        let mut meta = Self::default();

        for (key, value) in object {
            match (key.as_str(), value) {
                ("termsOfService", Value::String(text)) => {
                    meta.terms_of_service = Some(parse_url(&format!("meta.{key}"), text)?);
                }
                ("website", Value::String(text)) => {
                    meta.website = Some(parse_url(&format!("meta.{key}"), text)?);
                }
                ("caaIdentities", Value::Array(values)) => {
                    meta.caa_identities = values
                        .iter()
                        .filter_map(Value::as_str)
                        .map(str::to_owned)
                        .collect();
                }
                ("externalAccountRequired", Value::Bool(flag)) => {
                    meta.external_account_required = *flag;
                }
                ("termsOfService", _) => return Err(meta_type("termsOfService")),
                ("website", _) => return Err(meta_type("website")),
                ("caaIdentities", _) => return Err(meta_type("caaIdentities")),
                ("externalAccountRequired", _) => {
                    return Err(meta_type("externalAccountRequired"))
                }
                _ => {}
            }
        }
        Ok(meta)
    }
}

const fn meta_type(field: &'static str) -> AcmeDirectoryError {
    AcmeDirectoryError::InvalidMetaField { field }
}

fn parse_url(field: &str, text: &str) -> Result<Url, AcmeDirectoryError> {
    Url::parse(text).map_err(|source| AcmeDirectoryError::InvalidUrl {
        field: field.to_owned(),
        source,
    })
}
