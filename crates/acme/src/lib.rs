#![forbid(unsafe_code)]
#![deny(warnings)]
#![deny(clippy::all, clippy::pedantic, clippy::nursery)]
#![allow(clippy::module_name_repetitions)]

//! Blocking ACME v2 client that obtains certificates through DNS-01
//! challenges.
//!
//! [`CertificateManager`] is the entry point: it groups domains by
//! registrable domain, skips groups whose certificate is outside the
//! renewal window, and drives an [`AcmeOrderEngine`] for the rest. DNS
//! records are published through a caller-supplied
//! [`DnsChallengeProvisioner`].
//!
//! Every network-facing call blocks. Callers running inside an async
//! runtime should move the whole issuance onto a blocking worker thread.

mod account;
mod authorization;
mod certificates;
mod challenge;
mod config;
mod csr;
mod directory;
mod dns;
mod domains;
mod engine;
mod error;
mod http;
mod jws;
mod keys;
mod lifecycle;
mod nonce;
mod order;
mod problem;
mod storage;
mod telemetry;
mod transport;

pub use account::{
    Account, AccountContact, AccountContactError, AccountError, AccountRegistration,
    AccountStatus, NewAccountRequest,
};
pub use authorization::{
    Authorization, AuthorizationError, AuthorizationStatus, Challenge, ChallengeError,
    ChallengeKind, ChallengeStatus,
};
pub use certificates::{
    certificate_not_after, verify_key_match, verify_key_match_files, CertificateChain,
    CertificateError,
};
pub use challenge::{challenge_host_prefix, DnsRecordHandle, KeyAuthorization, ACME_CHALLENGE_LABEL};
pub use config::{
    AcmeEnvironment, ConfigError, EngineConfig, DEFAULT_RENEWAL_THRESHOLD, DEFAULT_STORAGE_ROOT,
    LETS_ENCRYPT_PRODUCTION, LETS_ENCRYPT_STAGING,
};
pub use csr::{build_csr, parse_csr_domains, parse_csr_domains_der, Csr, CsrBuildError, CsrDomains};
pub use directory::{AcmeDirectory, AcmeDirectoryError, AcmeDirectoryMeta, KnownEndpoint};
pub use dns::{DnsChallengeProvisioner, DnsOperation, DnsProvisioningError, DEFAULT_TXT_TTL};
pub use domains::{
    group_domains_by_registrable_domain, registrable_domain, DomainGroup, DomainGroupError,
};
pub use engine::{
    AcmeOrderEngine, EngineSettings, IssuedCertificate, OrderPhase, DEFAULT_POLL_INTERVAL,
    DEFAULT_PROPAGATION_DELAY,
};
pub use error::IssuanceError;
pub use self::http::{AcmeHttpClient, HttpError, HttpResponse, ReqwestAcmeClient, JOSE_JSON};
pub use jws::{AcmeJws, JwsError, KeyBinding, RsaAccountKey, RsaJwk};
pub use keys::{ensure_account_key, ensure_certificate_key, CertificateKey, KeyGenerationError};
pub use lifecycle::{renewal_due, CertificateManager, GroupOutcome, IssuanceReport};
pub use nonce::{NonceError, ReplayNonce, REPLAY_NONCE_HEADER};
pub use order::{
    FinalizeRequest, NewOrderError, NewOrderRequest, Order, OrderError, OrderIdentifier,
    OrderIdentifierError, OrderStatus,
};
pub use problem::{AcmeProtocolError, Problem, ProblemParseError, ABOUT_BLANK};
pub use storage::{
    BundlePaths, FileMode, StorageError, StorageLayout, ACCOUNT_KEY_FILE, CERT_FILE, CHAIN_FILE,
    FULLCHAIN_FILE, PRIVKEY_FILE,
};
pub use telemetry::{init_tracing, TelemetryError};
pub use transport::{fetch_directory, AcmeResponse, AcmeTransport, TransportError};
