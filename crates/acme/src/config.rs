use std::env;
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;
use url::Url;

use crate::account::{AccountContact, AccountContactError};
use crate::dns::DEFAULT_TXT_TTL;
use crate::engine::{EngineSettings, DEFAULT_POLL_INTERVAL, DEFAULT_PROPAGATION_DELAY};

pub const LETS_ENCRYPT_PRODUCTION: &str = "https://acme-v02.api.letsencrypt.org/directory";
pub const LETS_ENCRYPT_STAGING: &str = "https://acme-staging-v02.api.letsencrypt.org/directory";

/// Certificates expiring within this window are renewed.
pub const DEFAULT_RENEWAL_THRESHOLD: time::Duration = time::Duration::days(30);
pub const DEFAULT_STORAGE_ROOT: &str = "certs";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{name} must be set")]
    Missing { name: &'static str },
    #[error("{name} has invalid value {value:?}: {reason}")]
    Invalid {
        name: &'static str,
        value: String,
        reason: String,
    },
    #[error(transparent)]
    Contact(#[from] AccountContactError),
}

/// Well-known ACME directories.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AcmeEnvironment {
    Staging,
    #[default]
    Production,
}

impl AcmeEnvironment {
    #[must_use]
    pub const fn directory(self) -> &'static str {
        match self {
            Self::Staging => LETS_ENCRYPT_STAGING,
            Self::Production => LETS_ENCRYPT_PRODUCTION,
        }
    }

    /// # Errors
    ///
    /// Returns `ConfigError::Invalid` when the URL does not parse.
    pub fn directory_url(self) -> Result<Url, ConfigError> {
        parse_url("directory", self.directory())
    }
}

/// Settings of one issuance run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    pub directory_url: Url,
    pub contact: AccountContact,
    pub storage_root: PathBuf,
    pub propagation_delay: Duration,
    pub poll_interval: Duration,
    pub max_poll_attempts: Option<usize>,
    pub renewal_threshold: time::Duration,
    pub txt_ttl: u32,
    pub cleanup_on_failure: bool,
}

impl EngineConfig {
    /// Configuration with default timings and `certs` as storage root.
    #[must_use]
    pub fn new(directory_url: Url, contact: AccountContact) -> Self {
        Self {
            directory_url,
            contact,
            storage_root: PathBuf::from(DEFAULT_STORAGE_ROOT),
            propagation_delay: DEFAULT_PROPAGATION_DELAY,
            poll_interval: DEFAULT_POLL_INTERVAL,
            max_poll_attempts: None,
            renewal_threshold: DEFAULT_RENEWAL_THRESHOLD,
            txt_ttl: DEFAULT_TXT_TTL,
            cleanup_on_failure: false,
        }
    }

    #[must_use]
    pub fn with_storage_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.storage_root = root.into();
        self
    }

    /// Reads the configuration from `CERTFLOW_*` environment variables.
    ///
    /// | Variable | Default |
    /// |---|---|
    /// | `CERTFLOW_CONTACT_EMAIL` | required |
    /// | `CERTFLOW_ACME_DIRECTORY` | production, or staging with `CERTFLOW_STAGING=1` |
    /// | `CERTFLOW_STORAGE_ROOT` | `certs` |
    /// | `CERTFLOW_PROPAGATION_SECS` | `60` |
    /// | `CERTFLOW_POLL_INTERVAL_SECS` | `2` |
    /// | `CERTFLOW_MAX_POLL_ATTEMPTS` | unbounded |
    /// | `CERTFLOW_RENEWAL_DAYS` | `30` |
    /// | `CERTFLOW_TXT_TTL` | `600` |
    /// | `CERTFLOW_CLEANUP_ON_FAILURE` | `false` |
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` for a missing contact or unparsable values.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| env::var(name).ok())
    }

    /// Same as [`EngineConfig::from_env`] with an arbitrary variable source.
    ///
    /// # Errors
    ///
    /// See [`EngineConfig::from_env`].
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let read = |name: &'static str| {
            lookup(name)
                .map(|value| value.trim().to_owned())
                .filter(|value| !value.is_empty())
        };

        let email = read("CERTFLOW_CONTACT_EMAIL").ok_or(ConfigError::Missing {
            name: "CERTFLOW_CONTACT_EMAIL",
        })?;
        let contact = AccountContact::email(&email)?;

        let directory_url = match read("CERTFLOW_ACME_DIRECTORY") {
            Some(value) => parse_url("CERTFLOW_ACME_DIRECTORY", &value)?,
            None => {
                let staging = read("CERTFLOW_STAGING")
                    .map(|value| parse_flag("CERTFLOW_STAGING", &value))
                    .transpose()?
                    .unwrap_or(false);
                let environment = if staging {
                    AcmeEnvironment::Staging
                } else {
                    AcmeEnvironment::Production
                };
                environment.directory_url()?
            }
        };

        let mut config = Self::new(directory_url, contact);
        if let Some(root) = read("CERTFLOW_STORAGE_ROOT") {
            config.storage_root = PathBuf::from(root);
        }
        if let Some(value) = read("CERTFLOW_PROPAGATION_SECS") {
            config.propagation_delay =
                Duration::from_secs(parse_number("CERTFLOW_PROPAGATION_SECS", &value)?);
        }
        if let Some(value) = read("CERTFLOW_POLL_INTERVAL_SECS") {
            config.poll_interval =
                Duration::from_secs(parse_number("CERTFLOW_POLL_INTERVAL_SECS", &value)?);
        }
        if let Some(value) = read("CERTFLOW_MAX_POLL_ATTEMPTS") {
            let attempts: usize = parse_number("CERTFLOW_MAX_POLL_ATTEMPTS", &value)?;
            if attempts == 0 {
                return Err(invalid("CERTFLOW_MAX_POLL_ATTEMPTS", &value, "must be at least 1"));
            }
            config.max_poll_attempts = Some(attempts);
        }
        if let Some(value) = read("CERTFLOW_RENEWAL_DAYS") {
            config.renewal_threshold = parse_renewal_days(&value)?;
        }
        if let Some(value) = read("CERTFLOW_TXT_TTL") {
            config.txt_ttl = parse_number("CERTFLOW_TXT_TTL", &value)?;
        }
        if let Some(value) = read("CERTFLOW_CLEANUP_ON_FAILURE") {
            config.cleanup_on_failure = parse_flag("CERTFLOW_CLEANUP_ON_FAILURE", &value)?;
        }

        Ok(config)
    }

    /// Order engine settings derived from this configuration.
    #[must_use]
    pub fn engine_settings(&self) -> EngineSettings {
        EngineSettings {
            contacts: vec![self.contact.clone()],
            propagation_delay: self.propagation_delay,
            poll_interval: self.poll_interval,
            max_poll_attempts: self.max_poll_attempts,
            txt_ttl: self.txt_ttl,
            cleanup_on_failure: self.cleanup_on_failure,
        }
    }
}

fn invalid(name: &'static str, value: &str, reason: impl Into<String>) -> ConfigError {
    ConfigError::Invalid {
        name,
        value: value.to_owned(),
        reason: reason.into(),
    }
}

fn parse_url(name: &'static str, value: &str) -> Result<Url, ConfigError> {
    let url = Url::parse(value).map_err(|err| invalid(name, value, err.to_string()))?;
    if url.scheme() != "https" && url.scheme() != "http" {
        return Err(invalid(name, value, "expected an http(s) URL"));
    }
    Ok(url)
}

fn parse_number<T>(name: &'static str, value: &str) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    value
        .parse::<T>()
        .map_err(|err| invalid(name, value, err.to_string()))
}

/// Whole days between 1 and `u32::MAX`, which always fits a `time::Duration`.
fn parse_renewal_days(value: &str) -> Result<time::Duration, ConfigError> {
    const NAME: &str = "CERTFLOW_RENEWAL_DAYS";
    let days: u32 = parse_number(NAME, value)?;
    if days == 0 {
        return Err(invalid(NAME, value, "must be at least 1"));
    }
    i64::from(days)
        .checked_mul(86_400)
        .map(time::Duration::seconds)
        .ok_or_else(|| invalid(NAME, value, "day count is too large"))
}

fn parse_flag(name: &'static str, value: &str) -> Result<bool, ConfigError> {
    match value.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(invalid(name, value, "expected a boolean")),
    }
}
