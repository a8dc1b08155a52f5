use std::fmt;

use http::StatusCode;
use serde_json::{Map, Value};
use thiserror::Error;

/// Default problem type when the server omits `type` (RFC 7807 §4.2).
pub const ABOUT_BLANK: &str = "about:blank";

/// Errors raised while parsing a problem document.
#[derive(Debug, Error)]
pub enum ProblemParseError {
    #[error("problem document is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("problem document must be a JSON object")]
    NotAnObject,
    #[error("problem field `{field}` has an unexpected type")]
    InvalidFieldType { field: &'static str },
}

/// ACME problem document (`application/problem+json`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Problem {
    problem_type: String,
    detail: Option<String>,
    status: Option<u16>,
    identifier: Option<String>,
    subproblems: Vec<Problem>,
}

impl Problem {
    #[must_use]
    pub fn new(problem_type: impl Into<String>, detail: impl Into<String>) -> Self {
        Self {
            problem_type: problem_type.into(),
            detail: Some(detail.into()),
            status: None,
            identifier: None,
            subproblems: Vec::new(),
        }
    }

    /// Parses a problem document from a response body.
    ///
    /// # Errors
    ///
    /// Returns `ProblemParseError` when the body is not a JSON object or a
    /// known member has the wrong type.
    pub fn from_json_slice(bytes: &[u8]) -> Result<Self, ProblemParseError> {
        let value: Value = serde_json::from_slice(bytes)?;
        Self::from_json_value(&value)
    }

    /// # Errors
    ///
    /// Same conditions as [`Problem::from_json_slice`].
    pub fn from_json_value(value: &Value) -> Result<Self, ProblemParseError> {
        let Value::Object(object) = value else {
            return Err(ProblemParseError::NotAnObject);
        };
        Self::from_object(object)
    }

    /// Builds a placeholder problem for error responses without a usable body.
    #[must_use]
    pub fn from_status(status: StatusCode, body: &[u8]) -> Self {
        let text = String::from_utf8_lossy(body).trim().to_owned();
        Self {
            problem_type: ABOUT_BLANK.to_owned(),
            detail: if text.is_empty() { None } else { Some(text) },
            status: Some(status.as_u16()),
            identifier: None,
            subproblems: Vec::new(),
        }
    }

    fn from_object(object: &Map<String, Value>) -> Result<Self, ProblemParseError> {
        let problem_type =
            optional_string(object, "type")?.unwrap_or_else(|| ABOUT_BLANK.to_owned());
        let detail = optional_string(object, "detail")?;
        let status = match object.get("status") {
            Some(Value::Number(number)) => Some(
                number
                    .as_u64()
                    .and_then(|value| u16::try_from(value).ok())
                    .ok_or(ProblemParseError::InvalidFieldType { field: "status" })?,
            ),
            Some(Value::Null) | None => None,
            Some(_) => return Err(ProblemParseError::InvalidFieldType { field: "status" }),
        };
        let identifier = match object.get("identifier") {
            Some(Value::Object(identifier)) => optional_string(identifier, "value")?,
            Some(Value::Null) | None => None,
            Some(_) => {
                return Err(ProblemParseError::InvalidFieldType {
                    field: "identifier",
                })
            }
        };
        let subproblems = match object.get("subproblems") {
            Some(Value::Array(values)) => values
                .iter()
                .map(Self::from_json_value)
                .collect::<Result<Vec<_>, _>>()?,
            Some(Value::Null) | None => Vec::new(),
            Some(_) => {
                return Err(ProblemParseError::InvalidFieldType {
                    field: "subproblems",
                })
            }
        };

        Ok(Self {
            problem_type,
            detail,
            status,
            identifier,
            subproblems,
        })
    }

    /// Problem type URN, e.g. `urn:ietf:params:acme:error:badNonce`.
    #[must_use]
    pub fn problem_type(&self) -> &str {
        &self.problem_type
    }

    #[must_use]
    pub fn detail(&self) -> Option<&str> {
        self.detail.as_deref()
    }

    #[must_use]
    pub const fn status(&self) -> Option<u16> {
        self.status
    }

    /// Identifier value a subproblem refers to.
    #[must_use]
    pub fn identifier(&self) -> Option<&str> {
        self.identifier.as_deref()
    }

    #[must_use]
    pub fn subproblems(&self) -> &[Self] {
        &self.subproblems
    }

    /// Returns true when the type is the given ACME error name
    /// (`badNonce`, `unauthorized`, ...).
    #[must_use]
    pub fn is_acme_error(&self, name: &str) -> bool {
        self.problem_type
            .strip_prefix("urn:ietf:params:acme:error:")
            .is_some_and(|suffix| suffix == name)
    }
}

impl fmt::Display for Problem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.problem_type)?;
        if let Some(detail) = &self.detail {
            write!(f, ": {detail}")?;
        }
        for sub in &self.subproblems {
            match sub.identifier() {
                Some(identifier) => write!(f, "; [{identifier}] {sub}")?,
                None => write!(f, "; {sub}")?,
            }
        }
        Ok(())
    }
}

/// Non-2xx response from the ACME server, carrying its problem document.
#[derive(Debug, Clone, Error)]
#[error("ACME server answered {status}: {problem}")]
pub struct AcmeProtocolError {
    pub status: StatusCode,
    pub problem: Problem,
}

impl AcmeProtocolError {
    /// Builds the error from a failed response, falling back to a synthetic
    /// problem when the body is not a problem document.
    #[must_use]
    pub fn from_response(status: StatusCode, body: &[u8]) -> Self {
        let problem =
            Problem::from_json_slice(body).unwrap_or_else(|_| Problem::from_status(status, body));
        Self { status, problem }
    }

    #[must_use]
    pub fn problem_type(&self) -> &str {
        self.problem.problem_type()
    }

    #[must_use]
    pub fn detail(&self) -> Option<&str> {
        self.problem.detail()
    }
}

fn optional_string(
    object: &Map<String, Value>,
    field: &'static str,
) -> Result<Option<String>, ProblemParseError> {
    match object.get(field) {
        Some(Value::String(value)) => Ok(Some(value.clone())),
        Some(Value::Null) | None => Ok(None),
        Some(_) => Err(ProblemParseError::InvalidFieldType { field }),
    }
}
