use std::fmt;

use serde_json::{Map, Value};
use thiserror::Error;
use time::{format_description::well_known::Rfc3339, OffsetDateTime};
use url::Url;

use crate::order::{OrderIdentifier, OrderIdentifierError};
use crate::problem::{Problem, ProblemParseError};

#[derive(Debug, Error)]
pub enum AuthorizationError {
    #[error("authorization resource is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("authorization resource must be a JSON object")]
    NotAnObject,
    #[error("authorization field `{field}` is missing")]
    MissingField { field: &'static str },
    #[error("authorization field `{field}` has an unexpected type")]
    InvalidFieldType { field: &'static str },
    #[error("authorization status is invalid: {value}")]
    InvalidStatus { value: String },
    #[error("authorization field `{field}` is not an RFC 3339 timestamp")]
    InvalidDate { field: &'static str },
    #[error(transparent)]
    Identifier(#[from] OrderIdentifierError),
    #[error("authorization must contain at least one challenge")]
    MissingChallenges,
    #[error("authorization challenge[{index}]: {source}")]
    Challenge {
        index: usize,
        #[source]
        source: ChallengeError,
    },
}

#[derive(Debug, Error)]
pub enum ChallengeError {
    #[error("challenge must be a JSON object")]
    NotAnObject,
    #[error("challenge field `{field}` is missing")]
    MissingField { field: &'static str },
    #[error("challenge field `{field}` has an unexpected type")]
    InvalidFieldType { field: &'static str },
    #[error("challenge status is invalid: {value}")]
    InvalidStatus { value: String },
    #[error("challenge URL is invalid: {source}")]
    InvalidUrl {
        #[from]
        source: url::ParseError,
    },
    #[error("challenge token is invalid: {reason}")]
    InvalidToken { reason: &'static str },
    #[error("challenge `validated` is not an RFC 3339 timestamp")]
    InvalidValidated,
    #[error("challenge error document is malformed: {0}")]
    Problem(#[from] ProblemParseError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthorizationStatus {
    Pending,
    Valid,
    Invalid,
    Deactivated,
    Expired,
    Revoked,
}

impl AuthorizationStatus {
    fn parse(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(Self::Pending),
            "valid" => Some(Self::Valid),
            "invalid" => Some(Self::Invalid),
            "deactivated" => Some(Self::Deactivated),
            "expired" => Some(Self::Expired),
            "revoked" => Some(Self::Revoked),
            _ => None,
        }
    }

    /// Statuses from which the authorization can never become valid.
    #[must_use]
    pub const fn is_failure(self) -> bool {
        matches!(
            self,
            Self::Invalid | Self::Deactivated | Self::Expired | Self::Revoked
        )
    }
}

impl fmt::Display for AuthorizationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Pending => "pending",
            Self::Valid => "valid",
            Self::Invalid => "invalid",
            Self::Deactivated => "deactivated",
            Self::Expired => "expired",
            Self::Revoked => "revoked",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChallengeStatus {
    Pending,
    Processing,
    Valid,
    Invalid,
}

impl ChallengeStatus {
    fn parse(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(Self::Pending),
            "processing" => Some(Self::Processing),
            "valid" => Some(Self::Valid),
            "invalid" => Some(Self::Invalid),
            _ => None,
        }
    }
}

impl fmt::Display for ChallengeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Valid => "valid",
            Self::Invalid => "invalid",
        })
    }
}

/// Challenge type. Only `dns-01` is answered; the others are parsed so that
/// an authorization offering them is still readable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChallengeKind {
    Http01,
    Dns01,
    TlsAlpn01,
    Other(String),
}

impl ChallengeKind {
    fn parse(value: &str) -> Self {
        match value {
            "http-01" => Self::Http01,
            "dns-01" => Self::Dns01,
            "tls-alpn-01" => Self::TlsAlpn01,
            other => Self::Other(other.to_owned()),
        }
    }

    #[must_use]
    #[allow(clippy::missing_const_for_fn)]
    pub fn as_str(&self) -> &str {
        match self {
            Self::Http01 => "http-01",
            Self::Dns01 => "dns-01",
            Self::TlsAlpn01 => "tls-alpn-01",
            Self::Other(value) => value.as_str(),
        }
    }

    const fn requires_token(&self) -> bool {
        matches!(self, Self::Http01 | Self::Dns01 | Self::TlsAlpn01)
    }
}

/// Authorization resource (RFC 8555 §7.1.4).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Authorization {
    identifier: OrderIdentifier,
    status: AuthorizationStatus,
    expires: Option<OffsetDateTime>,
    wildcard: bool,
    challenges: Vec<Challenge>,
}

impl Authorization {
    /// # Errors
    ///
    /// Returns `AuthorizationError` when a required member is missing or
    /// has the wrong shape.
    pub fn from_json_slice(bytes: &[u8]) -> Result<Self, AuthorizationError> {
        let value: Value = serde_json::from_slice(bytes)?;
        Self::from_json_value(&value)
    }

    /// # Errors
    ///
    /// Same conditions as [`Authorization::from_json_slice`].
    pub fn from_json_value(value: &Value) -> Result<Self, AuthorizationError> {
        let Value::Object(object) = value else {
            return Err(AuthorizationError::NotAnObject);
        };
        Self::from_object(object)
    }

    fn from_object(object: &Map<String, Value>) -> Result<Self, AuthorizationError> {
        let fields = Fields(object);

        let status_value = fields.str("status")?;
        let status = AuthorizationStatus::parse(status_value).ok_or_else(|| {
            AuthorizationError::InvalidStatus {
                value: status_value.to_owned(),
            }
        })?;
        let identifier = parse_identifier(fields.object("identifier")?)?;
        let expires = fields.optional_timestamp("expires")?;
        let wildcard = fields.optional_flag("wildcard")?;

        let challenges = fields.array("challenges")?;
        if challenges.is_empty() {
            return Err(AuthorizationError::MissingChallenges);
        }
        let challenges = challenges
            .iter()
            .enumerate()
            .map(|(index, value)| {
                parse_challenge(value)
                    .map_err(|source| AuthorizationError::Challenge { index, source })
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            identifier,
            status,
            expires,
            wildcard,
            challenges,
        })
    }

    #[must_use]
    pub const fn status(&self) -> AuthorizationStatus {
        self.status
    }

    #[must_use]
    pub const fn identifier(&self) -> &OrderIdentifier {
        &self.identifier
    }

    /// Name the challenge proves control of. Wildcard authorizations carry
    /// the base domain as identifier and flag `wildcard` instead.
    #[must_use]
    pub fn domain(&self) -> &str {
        self.identifier.value()
    }

    #[must_use]
    pub const fn expires(&self) -> Option<&OffsetDateTime> {
        self.expires.as_ref()
    }

    #[must_use]
    pub const fn wildcard(&self) -> bool {
        self.wildcard
    }

    #[must_use]
    #[allow(clippy::missing_const_for_fn)]
    pub fn challenges(&self) -> &[Challenge] {
        &self.challenges
    }

    /// The first `dns-01` challenge offered, if any.
    #[must_use]
    pub fn dns01_challenge(&self) -> Option<&Challenge> {
        self.challenges
            .iter()
            .find(|challenge| challenge.kind == ChallengeKind::Dns01)
    }

    /// Error documents attached to the challenges, used when reporting a
    /// failed authorization.
    pub fn challenge_errors(&self) -> impl Iterator<Item = &Problem> {
        self.challenges
            .iter()
            .filter_map(|challenge| challenge.error.as_ref())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Challenge {
    kind: ChallengeKind,
    status: ChallengeStatus,
    url: Url,
    token: Option<String>,
    validated: Option<OffsetDateTime>,
    error: Option<Problem>,
}

impl Challenge {
    #[must_use]
    pub const fn kind(&self) -> &ChallengeKind {
        &self.kind
    }

    #[must_use]
    pub const fn status(&self) -> ChallengeStatus {
        self.status
    }

    #[must_use]
    pub const fn url(&self) -> &Url {
        &self.url
    }

    #[must_use]
    pub fn token(&self) -> Option<&str> {
        self.token.as_deref()
    }

    #[must_use]
    pub const fn validated(&self) -> Option<&OffsetDateTime> {
        self.validated.as_ref()
    }

    #[must_use]
    pub const fn error(&self) -> Option<&Problem> {
        self.error.as_ref()
    }
}

/// Problem with a single member of a JSON object.
#[derive(Debug, Clone, Copy)]
enum FieldIssue {
    Missing(&'static str),
    WrongType(&'static str),
    BadTimestamp(&'static str),
}

impl From<FieldIssue> for AuthorizationError {
    fn from(issue: FieldIssue) -> Self {
        match issue {
            FieldIssue::Missing(field) => Self::MissingField { field },
            FieldIssue::WrongType(field) => Self::InvalidFieldType { field },
            FieldIssue::BadTimestamp(field) => Self::InvalidDate { field },
        }
    }
}

impl From<FieldIssue> for ChallengeError {
    fn from(issue: FieldIssue) -> Self {
        match issue {
            FieldIssue::Missing(field) => Self::MissingField { field },
            FieldIssue::WrongType(field) => Self::InvalidFieldType { field },
            FieldIssue::BadTimestamp(_) => Self::InvalidValidated,
        }
    }
}

/// Typed accessors over one JSON object. `null` members count as absent.
#[derive(Clone, Copy)]
struct Fields<'a>(&'a Map<String, Value>);

impl<'a> Fields<'a> {
    fn get(self, name: &str) -> Option<&'a Value> {
        self.0.get(name).filter(|value| !value.is_null())
    }

    fn optional_str(self, name: &'static str) -> Result<Option<&'a str>, FieldIssue> {
        self.get(name)
            .map(|value| value.as_str().ok_or(FieldIssue::WrongType(name)))
            .transpose()
    }

    fn str(self, name: &'static str) -> Result<&'a str, FieldIssue> {
        self.optional_str(name)?.ok_or(FieldIssue::Missing(name))
    }

    fn optional_flag(self, name: &'static str) -> Result<bool, FieldIssue> {
        self.get(name).map_or(Ok(false), |value| {
            value.as_bool().ok_or(FieldIssue::WrongType(name))
        })
    }

    fn array(self, name: &'static str) -> Result<&'a [Value], FieldIssue> {
        self.get(name)
            .ok_or(FieldIssue::Missing(name))?
            .as_array()
            .map(Vec::as_slice)
            .ok_or(FieldIssue::WrongType(name))
    }

    fn object(self, name: &'static str) -> Result<Self, FieldIssue> {
        self.get(name)
            .ok_or(FieldIssue::Missing(name))?
            .as_object()
            .map(Self)
            .ok_or(FieldIssue::WrongType(name))
    }

    fn optional_timestamp(self, name: &'static str) -> Result<Option<OffsetDateTime>, FieldIssue> {
        self.optional_str(name)?
            .map(|text| {
                OffsetDateTime::parse(text, &Rfc3339).map_err(|_| FieldIssue::BadTimestamp(name))
            })
            .transpose()
    }
}

fn parse_identifier(fields: Fields<'_>) -> Result<OrderIdentifier, AuthorizationError> {
    let nested = |issue: FieldIssue| match issue {
        FieldIssue::Missing("type") => AuthorizationError::MissingField {
            field: "identifier.type",
        },
        FieldIssue::Missing(_) => AuthorizationError::MissingField {
            field: "identifier.value",
        },
        FieldIssue::WrongType("type") => AuthorizationError::InvalidFieldType {
            field: "identifier.type",
        },
        _ => AuthorizationError::InvalidFieldType {
            field: "identifier.value",
        },
    };
    let kind = fields.str("type").map_err(nested)?;
    let value = fields.str("value").map_err(nested)?;

    if kind != "dns" {
        return Err(OrderIdentifierError::UnsupportedType {
            value: kind.to_owned(),
        }
        .into());
    }
    Ok(OrderIdentifier::dns(value)?)
}

fn parse_challenge(value: &Value) -> Result<Challenge, ChallengeError> {
    let fields = value.as_object().map(Fields).ok_or(ChallengeError::NotAnObject)?;

    let kind = ChallengeKind::parse(fields.str("type")?);
    let status_value = fields.str("status")?;
    let status =
        ChallengeStatus::parse(status_value).ok_or_else(|| ChallengeError::InvalidStatus {
            value: status_value.to_owned(),
        })?;
    let url = Url::parse(fields.str("url")?)?;

    let token = fields.optional_str("token")?.map(str::to_owned);
    match token.as_deref() {
        Some(value) => validate_token(value)?,
        None if kind.requires_token() => {
            return Err(ChallengeError::MissingField { field: "token" })
        }
        None => {}
    }

    let validated = fields.optional_timestamp("validated")?;
    let error = fields.get("error").map(Problem::from_json_value).transpose()?;

    Ok(Challenge {
        kind,
        status,
        url,
        token,
        validated,
        error,
    })
}

/// Tokens must be base64url with at least 128 bits of entropy (RFC 8555 §8.1).
fn validate_token(value: &str) -> Result<(), ChallengeError> {
    if value.len() < 16 {
        return Err(ChallengeError::InvalidToken {
            reason: "token is too short",
        });
    }
    if value.len() > 128 {
        return Err(ChallengeError::InvalidToken {
            reason: "token is too long",
        });
    }
    if !value
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_'))
    {
        return Err(ChallengeError::InvalidToken {
            reason: "token contains characters outside the base64url alphabet",
        });
    }
    Ok(())
}
