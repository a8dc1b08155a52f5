use std::fmt;

use serde::ser::{Serialize, Serializer};
use serde::Serialize as DeriveSerialize;
use serde_json::{Map, Value};
use thiserror::Error;
use url::Url;

/// Errors raised while building contact URIs.
#[derive(Debug, Error)]
pub enum AccountContactError {
    #[error("ACME account e-mail address is invalid: {value}")]
    InvalidEmail { value: String },
}

/// Errors raised while parsing an account resource.
#[derive(Debug, Error)]
pub enum AccountError {
    #[error("account resource is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("account resource must be a JSON object")]
    NotAnObject,
    #[error("account field `{field}` is missing")]
    MissingField { field: &'static str },
    #[error("account field `{field}` has an unexpected type")]
    InvalidFieldType { field: &'static str },
    #[error("account status is invalid: {value}")]
    InvalidStatus { value: String },
}

/// `mailto:` contact attached to the account.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccountContact {
    uri: String,
}

impl AccountContact {
    /// Builds a `mailto:` contact from a bare address.
    ///
    /// # Errors
    ///
    /// Returns `AccountContactError::InvalidEmail` for anything that is not a
    /// single `local@domain` address without whitespace.
    pub fn email(address: &str) -> Result<Self, AccountContactError> {
        let normalized = normalize_email(address.trim())?;
        Ok(Self {
            uri: format!("mailto:{normalized}"),
        })
    }

    #[must_use]
    pub fn uri(&self) -> &str {
        &self.uri
    }

    /// Address part of the contact URI.
    #[must_use]
    pub fn address(&self) -> &str {
        self.uri.strip_prefix("mailto:").unwrap_or(&self.uri)
    }
}

impl Serialize for AccountContact {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&self.uri)
    }
}

impl fmt::Display for AccountContact {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.uri)
    }
}

/// `newAccount` payload.
#[derive(Debug, Clone, PartialEq, Eq, DeriveSerialize)]
pub struct NewAccountRequest {
    #[serde(rename = "termsOfServiceAgreed")]
    terms_of_service_agreed: bool,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    contact: Vec<AccountContact>,
    #[serde(rename = "onlyReturnExisting", skip_serializing_if = "is_false")]
    only_return_existing: bool,
}

impl NewAccountRequest {
    /// Registration that agrees to the terms of service.
    #[must_use]
    pub const fn agreeing(contact: Vec<AccountContact>) -> Self {
        Self {
            terms_of_service_agreed: true,
            contact,
            only_return_existing: false,
        }
    }

    /// Asks the server to look up the account without creating one.
    #[must_use]
    pub const fn only_return_existing(mut self) -> Self {
        self.only_return_existing = true;
        self
    }

    #[must_use]
    pub fn contacts(&self) -> &[AccountContact] {
        &self.contact
    }

    #[must_use]
    pub const fn terms_of_service_agreed(&self) -> bool {
        self.terms_of_service_agreed
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccountStatus {
    Valid,
    Deactivated,
    Revoked,
}

impl AccountStatus {
    fn parse(value: &str) -> Option<Self> {
        match value {
            "valid" => Some(Self::Valid),
            "deactivated" => Some(Self::Deactivated),
            "revoked" => Some(Self::Revoked),
            _ => None,
        }
    }
}

impl fmt::Display for AccountStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Valid => "valid",
            Self::Deactivated => "deactivated",
            Self::Revoked => "revoked",
        })
    }
}

/// Account resource returned by `newAccount`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Account {
    status: AccountStatus,
    contact: Vec<String>,
    orders: Option<Url>,
}

impl Account {
    /// # Errors
    ///
    /// Returns `AccountError` when `status` is missing or a field has the
    /// wrong type.
    pub fn from_json_slice(bytes: &[u8]) -> Result<Self, AccountError> {
        let value: Value = serde_json::from_slice(bytes)?;
        Self::from_json_value(&value)
    }

    /// # Errors
    ///
    /// Same conditions as [`Account::from_json_slice`].
    pub fn from_json_value(value: &Value) -> Result<Self, AccountError> {
        let Value::Object(object) = value else {
            return Err(AccountError::NotAnObject);
        };
        Self::from_object(object)
    }

    fn from_object(object: &Map<String, Value>) -> Result<Self, AccountError> {
        let status_value = match object.get("status") {
            Some(Value::String(value)) => value,
            Some(_) => return Err(AccountError::InvalidFieldType { field: "status" }),
            None => return Err(AccountError::MissingField { field: "status" }),
        };
        let status = AccountStatus::parse(status_value).ok_or_else(|| {
            AccountError::InvalidStatus {
                value: status_value.clone(),
            }
        })?;

        let contact = match object.get("contact") {
            Some(Value::Array(values)) => values
                .iter()
                .map(|value| {
                    value
                        .as_str()
                        .map(ToOwned::to_owned)
                        .ok_or(AccountError::InvalidFieldType { field: "contact" })
                })
                .collect::<Result<Vec<_>, _>>()?,
            Some(Value::Null) | None => Vec::new(),
            Some(_) => return Err(AccountError::InvalidFieldType { field: "contact" }),
        };

        let orders = match object.get("orders") {
            Some(Value::String(value)) => Some(
                Url::parse(value).map_err(|_| AccountError::InvalidFieldType { field: "orders" })?,
            ),
            Some(Value::Null) | None => None,
            Some(_) => return Err(AccountError::InvalidFieldType { field: "orders" }),
        };

        Ok(Self {
            status,
            contact,
            orders,
        })
    }

    #[must_use]
    pub const fn status(&self) -> AccountStatus {
        self.status
    }

    #[must_use]
    pub fn contact(&self) -> &[String] {
        &self.contact
    }

    #[must_use]
    pub const fn orders(&self) -> Option<&Url> {
        self.orders.as_ref()
    }
}

/// Registered account: the `kid` URL plus the contacts it was created with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccountRegistration {
    pub account_url: Url,
    pub contacts: Vec<AccountContact>,
}

fn normalize_email(value: &str) -> Result<String, AccountContactError> {
    let invalid = || AccountContactError::InvalidEmail {
        value: value.to_owned(),
    };

    if value.is_empty() || value.chars().any(char::is_whitespace) {
        return Err(invalid());
    }
    if value.chars().filter(|&c| c == '@').count() != 1 {
        return Err(invalid());
    }
    let (local, domain) = value.rsplit_once('@').ok_or_else(invalid)?;
    if local.is_empty() || local.starts_with('.') || local.ends_with('.') {
        return Err(invalid());
    }
    if domain.is_empty()
        || domain.split('.').any(str::is_empty)
        || !domain
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '.'))
    {
        return Err(invalid());
    }

    Ok(format!("{local}@{}", domain.to_ascii_lowercase()))
}

#[allow(clippy::trivially_copy_pass_by_ref)]
const fn is_false(value: &bool) -> bool {
    !*value
}
