use thiserror::Error;

/// TTL the engine requests for challenge records.
pub const DEFAULT_TXT_TTL: u32 = 600;

/// Failure reported by a DNS provider.
#[derive(Debug, Error)]
#[error("DNS provider failed to {operation} TXT record {host_prefix}.{zone}: {message}")]
pub struct DnsProvisioningError {
    pub operation: DnsOperation,
    pub zone: String,
    pub host_prefix: String,
    pub message: String,
}

impl DnsProvisioningError {
    #[must_use]
    pub fn new(
        operation: DnsOperation,
        zone: impl Into<String>,
        host_prefix: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            operation,
            zone: zone.into(),
            host_prefix: host_prefix.into(),
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DnsOperation {
    Add,
    Delete,
}

impl std::fmt::Display for DnsOperation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Add => "add",
            Self::Delete => "delete",
        })
    }
}

/// Publishes and removes DNS-01 TXT records.
///
/// `zone` is the registrable domain (e.g. `example.com`) and `host_prefix`
/// the record name inside it (e.g. `_acme-challenge.www`). Implementations
/// should tolerate repeated calls with the same arguments so callers can
/// retry them.
pub trait DnsChallengeProvisioner {
    /// Adds a TXT record and returns the provider's record id.
    ///
    /// # Errors
    ///
    /// Returns `DnsProvisioningError` when the provider rejects the change.
    fn add_txt_record(
        &self,
        zone: &str,
        host_prefix: &str,
        value: &str,
        ttl: u32,
    ) -> Result<String, DnsProvisioningError>;

    /// Removes the TXT records at `host_prefix`.
    ///
    /// # Errors
    ///
    /// Returns `DnsProvisioningError` when the provider rejects the change.
    fn delete_txt_record(&self, zone: &str, host_prefix: &str) -> Result<(), DnsProvisioningError>;
}

impl<T: DnsChallengeProvisioner + ?Sized> DnsChallengeProvisioner for &T {
    fn add_txt_record(
        &self,
        zone: &str,
        host_prefix: &str,
        value: &str,
        ttl: u32,
    ) -> Result<String, DnsProvisioningError> {
        (**self).add_txt_record(zone, host_prefix, value, ttl)
    }

    fn delete_txt_record(&self, zone: &str, host_prefix: &str) -> Result<(), DnsProvisioningError> {
        (**self).delete_txt_record(zone, host_prefix)
    }
}
