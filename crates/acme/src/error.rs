use std::path::PathBuf;

use thiserror::Error;
use url::Url;

use crate::account::AccountStatus;
use crate::certificates::CertificateError;
use crate::csr::CsrBuildError;
use crate::dns::DnsProvisioningError;
use crate::keys::KeyGenerationError;
use crate::order::NewOrderError;
use crate::problem::{AcmeProtocolError, Problem};
use crate::storage::StorageError;
use crate::transport::TransportError;

/// Everything that can abort the issuance of one domain group.
#[derive(Debug, Error)]
pub enum IssuanceError {
    #[error(transparent)]
    KeyGeneration(#[from] KeyGenerationError),
    #[error(transparent)]
    CsrBuild(#[from] CsrBuildError),
    /// Connection, nonce or signing failure.
    #[error(transparent)]
    Transport(TransportError),
    /// Problem document returned by the ACME server.
    #[error(transparent)]
    Protocol(AcmeProtocolError),
    #[error("authorization for {domain} offers no dns-01 challenge")]
    UnsupportedChallenge { domain: String },
    #[error("authorization for {domain} failed{}", describe(.problem.as_ref()))]
    AuthorizationFailed {
        domain: String,
        problem: Option<Problem>,
    },
    #[error(transparent)]
    DnsProvisioning(#[from] DnsProvisioningError),
    #[error("certificate {} does not match private key {}", .certificate.display(), .private_key.display())]
    CertificateKeyMismatch {
        certificate: PathBuf,
        private_key: PathBuf,
    },
    #[error("order {order_url} became invalid{}", describe(.problem.as_ref()))]
    OrderInvalid {
        order_url: Url,
        problem: Option<Problem>,
    },
    #[error("gave up polling {resource} after {attempts} attempts")]
    PollAttemptsExceeded { resource: Url, attempts: usize },
    #[error("unexpected response from {url}: {reason}")]
    InvalidResponse { url: Url, reason: String },
    #[error("ACME account is {status:?}")]
    AccountUnusable { status: AccountStatus },
    #[error("invalid order identifiers: {0}")]
    Identifiers(#[from] NewOrderError),
    #[error("failed to encode request payload: {0}")]
    Encode(#[from] serde_json::Error),
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error(transparent)]
    Certificate(#[from] CertificateError),
}

impl IssuanceError {
    pub(crate) fn invalid_response(url: &Url, reason: impl std::fmt::Display) -> Self {
        Self::InvalidResponse {
            url: url.clone(),
            reason: reason.to_string(),
        }
    }

    /// Problem document attached to this error, if any.
    #[must_use]
    pub const fn problem(&self) -> Option<&Problem> {
        match self {
            Self::Protocol(error) => Some(&error.problem),
            Self::AuthorizationFailed { problem, .. } | Self::OrderInvalid { problem, .. } => {
                problem.as_ref()
            }
            _ => None,
        }
    }
}

impl From<TransportError> for IssuanceError {
    fn from(error: TransportError) -> Self {
        match error {
            TransportError::Protocol(problem) => Self::Protocol(problem),
            other => Self::Transport(other),
        }
    }
}

fn describe(problem: Option<&Problem>) -> String {
    problem.map_or_else(String::new, |problem| format!(": {problem}"))
}
