use std::fmt;

use serde::ser::{Serialize, Serializer};
use serde::Serialize as DeriveSerialize;
use serde_json::{Map, Value};
use thiserror::Error;
use time::{format_description::well_known::Rfc3339, OffsetDateTime};
use url::Url;

use crate::problem::{Problem, ProblemParseError};

#[derive(Debug, Error)]
pub enum OrderIdentifierError {
    #[error("ACME DNS identifier must not be empty")]
    EmptyDns,
    #[error("ACME DNS identifier is invalid: {value}")]
    InvalidDns { value: String },
    #[error("ACME identifier type is not supported: {value}")]
    UnsupportedType { value: String },
}

/// DNS identifier of an order or authorization.
///
/// Values are lowercased and stripped of a trailing dot. A single leading
/// `*` label is accepted for wildcard names.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct OrderIdentifier(String);

impl OrderIdentifier {
    /// # Errors
    ///
    /// Returns `OrderIdentifierError` for empty names, labels longer than 63
    /// octets, misplaced wildcards or characters outside `[a-z0-9-_]`.
    pub fn dns(value: &str) -> Result<Self, OrderIdentifierError> {
        let raw = value.trim();
        let name = raw.strip_suffix('.').unwrap_or(raw).to_ascii_lowercase();
        if name.is_empty() {
            return Err(OrderIdentifierError::EmptyDns);
        }

        let labels = name.strip_prefix("*.").unwrap_or(&name);
        let well_formed = name.len() <= 253 && labels.split('.').all(is_dns_label);
        if !well_formed {
            return Err(OrderIdentifierError::InvalidDns {
                value: raw.to_owned(),
            });
        }
        Ok(Self(name))
    }

    #[must_use]
    pub fn value(&self) -> &str {
        &self.0
    }

    #[must_use]
    pub fn is_wildcard(&self) -> bool {
        self.0.starts_with("*.")
    }

    /// Parses `{"type": "dns", "value": ...}`.
    fn from_json(value: &Value) -> Result<Self, OrderError> {
        let Value::Object(object) = value else {
            return Err(OrderError::InvalidFieldType {
                field: "identifier",
            });
        };
        let kind = required_str(object, "type", "identifier.type")?;
        if kind != "dns" {
            return Err(OrderIdentifierError::UnsupportedType {
                value: kind.to_owned(),
            }
            .into());
        }
        Ok(Self::dns(required_str(object, "value", "identifier.value")?)?)
    }
}

/// LDH label, `_` allowed for service names such as `_dmarc`.
fn is_dns_label(label: &str) -> bool {
    (1..=63).contains(&label.len())
        && !label.starts_with('-')
        && !label.ends_with('-')
        && label
            .bytes()
            .all(|byte| byte.is_ascii_alphanumeric() || byte == b'-' || byte == b'_')
}

impl Serialize for OrderIdentifier {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        #[derive(DeriveSerialize)]
        struct Wire<'a> {
            #[serde(rename = "type")]
            kind: &'static str,
            value: &'a str,
        }

        Wire {
            kind: "dns",
            value: &self.0,
        }
        .serialize(serializer)
    }
}

impl fmt::Display for OrderIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Error)]
pub enum NewOrderError {
    #[error("ACME newOrder requires at least one identifier")]
    MissingIdentifier,
    #[error(transparent)]
    Identifier(#[from] OrderIdentifierError),
}

/// `newOrder` payload.
#[derive(Debug, Clone, PartialEq, Eq, DeriveSerialize)]
pub struct NewOrderRequest {
    identifiers: Vec<OrderIdentifier>,
}

impl NewOrderRequest {
    /// # Errors
    ///
    /// Returns `NewOrderError::MissingIdentifier` for an empty list.
    pub fn new(identifiers: Vec<OrderIdentifier>) -> Result<Self, NewOrderError> {
        if identifiers.is_empty() {
            return Err(NewOrderError::MissingIdentifier);
        }
        Ok(Self { identifiers })
    }

    /// # Errors
    ///
    /// Returns `NewOrderError` for an empty list or an invalid name.
    pub fn for_dns_names<I, S>(names: I) -> Result<Self, NewOrderError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let identifiers = names
            .into_iter()
            .map(|name| OrderIdentifier::dns(name.as_ref()))
            .collect::<Result<Vec<_>, _>>()?;
        Self::new(identifiers)
    }

    #[must_use]
    pub fn identifiers(&self) -> &[OrderIdentifier] {
        &self.identifiers
    }
}

/// Finalize payload: the CSR in base64url DER.
#[derive(Debug, Clone, PartialEq, Eq, DeriveSerialize)]
pub struct FinalizeRequest {
    pub csr: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrderStatus {
    Pending,
    Ready,
    Processing,
    Valid,
    Invalid,
}

impl OrderStatus {
    fn parse(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(Self::Pending),
            "ready" => Some(Self::Ready),
            "processing" => Some(Self::Processing),
            "valid" => Some(Self::Valid),
            "invalid" => Some(Self::Invalid),
            _ => None,
        }
    }

    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Valid | Self::Invalid)
    }
}

impl fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Pending => "pending",
            Self::Ready => "ready",
            Self::Processing => "processing",
            Self::Valid => "valid",
            Self::Invalid => "invalid",
        })
    }
}

#[derive(Debug, Error)]
pub enum OrderError {
    #[error("order resource is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("order resource must be a JSON object")]
    NotAnObject,
    #[error("order field `{field}` is missing")]
    MissingField { field: &'static str },
    #[error("order field `{field}` has an unexpected type")]
    InvalidFieldType { field: &'static str },
    #[error("order status is invalid: {value}")]
    InvalidStatus { value: String },
    #[error("order field `{field}` is not a valid URL: {source}")]
    InvalidUrl {
        field: &'static str,
        #[source]
        source: url::ParseError,
    },
    #[error("order field `{field}` is not an RFC 3339 timestamp")]
    InvalidDate { field: &'static str },
    #[error(transparent)]
    Identifier(#[from] OrderIdentifierError),
    #[error("order error document is malformed: {0}")]
    Problem(#[from] ProblemParseError),
    #[error("order is valid but carries no certificate URL")]
    MissingCertificate,
}

/// Order resource (RFC 8555 §7.1.3).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Order {
    status: OrderStatus,
    expires: Option<OffsetDateTime>,
    identifiers: Vec<OrderIdentifier>,
    authorizations: Vec<Url>,
    finalize: Url,
    certificate: Option<Url>,
    error: Option<Problem>,
}

impl Order {
    /// # Errors
    ///
    /// Returns `OrderError` when a required member is missing or malformed,
    /// or when a `valid` order lacks its certificate URL.
    pub fn from_json_slice(bytes: &[u8]) -> Result<Self, OrderError> {
        let value: Value = serde_json::from_slice(bytes)?;
        Self::from_json_value(&value)
    }

    /// # Errors
    ///
    /// Same conditions as [`Order::from_json_slice`].
    pub fn from_json_value(value: &Value) -> Result<Self, OrderError> {
        let Value::Object(object) = value else {
            return Err(OrderError::NotAnObject);
        };
        Self::from_object(object)
    }

    fn from_object(object: &Map<String, Value>) -> Result<Self, OrderError> {
        let status_value = required_str(object, "status", "status")?;
        let status = OrderStatus::parse(status_value).ok_or_else(|| OrderError::InvalidStatus {
            value: status_value.to_owned(),
        })?;

        let expires = match object.get("expires") {
            Some(Value::String(value)) => Some(
                OffsetDateTime::parse(value, &Rfc3339)
                    .map_err(|_| OrderError::InvalidDate { field: "expires" })?,
            ),
            Some(Value::Null) | None => None,
            Some(_) => return Err(OrderError::InvalidFieldType { field: "expires" }),
        };

        let identifiers = required_array(object, "identifiers")?
            .iter()
            .map(OrderIdentifier::from_json)
            .collect::<Result<Vec<_>, _>>()?;

        let authorizations = required_array(object, "authorizations")?
            .iter()
            .map(|value| {
                let text = value.as_str().ok_or(OrderError::InvalidFieldType {
                    field: "authorizations",
                })?;
                parse_url("authorizations", text)
            })
            .collect::<Result<Vec<_>, _>>()?;

        let finalize = parse_url("finalize", required_str(object, "finalize", "finalize")?)?;

        let certificate = match object.get("certificate") {
            Some(Value::String(value)) => Some(parse_url("certificate", value)?),
            Some(Value::Null) | None => None,
            Some(_) => {
                return Err(OrderError::InvalidFieldType {
                    field: "certificate",
                })
            }
        };
        if status == OrderStatus::Valid && certificate.is_none() {
            return Err(OrderError::MissingCertificate);
        }

        let error = match object.get("error") {
            Some(Value::Null) | None => None,
            Some(value) => Some(Problem::from_json_value(value)?),
        };

        Ok(Self {
            status,
            expires,
            identifiers,
            authorizations,
            finalize,
            certificate,
            error,
        })
    }

    #[must_use]
    pub const fn status(&self) -> OrderStatus {
        self.status
    }

    #[must_use]
    pub const fn expires(&self) -> Option<&OffsetDateTime> {
        self.expires.as_ref()
    }

    #[must_use]
    pub fn identifiers(&self) -> &[OrderIdentifier] {
        &self.identifiers
    }

    #[must_use]
    pub fn authorizations(&self) -> &[Url] {
        &self.authorizations
    }

    #[must_use]
    pub const fn finalize(&self) -> &Url {
        &self.finalize
    }

    #[must_use]
    pub const fn certificate(&self) -> Option<&Url> {
        self.certificate.as_ref()
    }

    #[must_use]
    pub const fn error(&self) -> Option<&Problem> {
        self.error.as_ref()
    }
}

fn required_str<'a>(
    object: &'a Map<String, Value>,
    key: &str,
    field: &'static str,
) -> Result<&'a str, OrderError> {
    match object.get(key) {
        Some(Value::String(value)) => Ok(value.as_str()),
        Some(_) => Err(OrderError::InvalidFieldType { field }),
        None => Err(OrderError::MissingField { field }),
    }
}

fn required_array<'a>(
    object: &'a Map<String, Value>,
    field: &'static str,
) -> Result<&'a [Value], OrderError> {
    match object.get(field) {
        Some(Value::Array(values)) => Ok(values.as_slice()),
        Some(_) => Err(OrderError::InvalidFieldType { field }),
        None => Err(OrderError::MissingField { field }),
    }
}

fn parse_url(field: &'static str, value: &str) -> Result<Url, OrderError> {
    Url::parse(value).map_err(|source| OrderError::InvalidUrl { field, source })
}
