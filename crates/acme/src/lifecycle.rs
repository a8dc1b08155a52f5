use std::fs;
use std::io;

use time::OffsetDateTime;
use tracing::{error, info, warn};

use crate::certificates::{
    certificate_not_after, verify_key_match_files, CertificateChain, CertificateError,
};
use crate::config::EngineConfig;
use crate::csr::build_csr;
use crate::dns::DnsChallengeProvisioner;
use crate::domains::{group_domains_by_registrable_domain, DomainGroup};
use crate::engine::AcmeOrderEngine;
use crate::error::IssuanceError;
use crate::http::AcmeHttpClient;
use crate::keys::{ensure_account_key, ensure_certificate_key};
use crate::storage::{BundlePaths, StorageLayout};
use crate::transport::AcmeTransport;

/// `true` when `not_after` is at most `threshold` away from `now`.
#[must_use]
pub fn renewal_due(
    not_after: OffsetDateTime,
    now: OffsetDateTime,
    threshold: time::Duration,
) -> bool {
    not_after - now <= threshold
}

/// Result of processing one domain group.
#[derive(Debug)]
pub enum GroupOutcome {
    /// The stored certificate is outside the renewal window.
    Skipped { not_after: OffsetDateTime },
    Issued(BundlePaths),
    Failed(IssuanceError),
}

impl GroupOutcome {
    #[must_use]
    pub const fn is_success(&self) -> bool {
        !matches!(self, Self::Failed(_))
    }
}

/// Outcome of [`CertificateManager::run_all`], one entry per group in
/// processing order.
#[derive(Debug, Default)]
pub struct IssuanceReport {
    outcomes: Vec<(DomainGroup, GroupOutcome)>,
}

impl IssuanceReport {
    #[must_use]
    pub fn outcomes(&self) -> &[(DomainGroup, GroupOutcome)] {
        &self.outcomes
    }

    #[must_use]
    pub fn into_outcomes(self) -> Vec<(DomainGroup, GroupOutcome)> {
        self.outcomes
    }

    /// Groups that were issued or did not need renewal.
    #[must_use]
    pub fn succeeded(&self) -> usize {
        self.outcomes
            .iter()
            .filter(|(_, outcome)| outcome.is_success())
            .count()
    }

    #[must_use]
    pub fn total(&self) -> usize {
        self.outcomes.len()
    }

    #[must_use]
    pub fn all_succeeded(&self) -> bool {
        self.succeeded() == self.total()
    }
}

/// Groups domains, checks expiry and writes certificate bundles.
///
/// Groups are processed one at a time. Key and bundle files are written
/// without locking, so two managers must not share a storage root
/// concurrently.
#[derive(Debug)]
pub struct CertificateManager<C> {
    engine: AcmeOrderEngine<C>,
    layout: StorageLayout,
    renewal_threshold: time::Duration,
}

impl<C: AcmeHttpClient> CertificateManager<C> {
    #[must_use]
    pub const fn new(
        engine: AcmeOrderEngine<C>,
        layout: StorageLayout,
        renewal_threshold: time::Duration,
    ) -> Self {
        Self {
            engine,
            layout,
            renewal_threshold,
        }
    }

    /// Loads or creates the account key under the storage root, fetches the
    /// directory and builds a manager for `config`.
    ///
    /// # Errors
    ///
    /// Returns `IssuanceError` when the account key is unusable or the
    /// directory cannot be loaded.
    pub fn connect(client: C, config: &EngineConfig) -> Result<Self, IssuanceError> {
        let layout = StorageLayout::new(&config.storage_root);
        let account_key = ensure_account_key(&layout.account_key_path())?;
        let transport = AcmeTransport::connect(client, &config.directory_url, account_key)?;
        let engine = AcmeOrderEngine::new(transport, config.engine_settings());
        Ok(Self::new(engine, layout, config.renewal_threshold))
    }

    #[must_use]
    pub const fn engine(&self) -> &AcmeOrderEngine<C> {
        &self.engine
    }

    #[must_use]
    pub const fn layout(&self) -> &StorageLayout {
        &self.layout
    }

    /// `notAfter` of the stored certificate, `None` when there is none.
    ///
    /// # Errors
    ///
    /// Returns `CertificateError` when the file exists but cannot be read or
    /// parsed.
    pub fn expiry(
        &self,
        group: &DomainGroup,
    ) -> Result<Option<OffsetDateTime>, CertificateError> {
        let path = self.layout.bundle_paths(group).full_chain;
        match fs::read_to_string(&path) {
            Ok(pem) => certificate_not_after(&pem).map(Some),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(source) => Err(CertificateError::Io { path, source }),
        }
    }

    #[must_use]
    pub fn needs_renewal(&self, group: &DomainGroup) -> bool {
        self.needs_renewal_at(group, OffsetDateTime::now_utc())
    }

    /// Renewal check against an explicit clock.
    ///
    /// A certificate that cannot be parsed is treated as due.
    #[must_use]
    pub fn needs_renewal_at(&self, group: &DomainGroup, now: OffsetDateTime) -> bool {
        match self.expiry(group) {
            Ok(Some(not_after)) => renewal_due(not_after, now, self.renewal_threshold),
            Ok(None) => true,
            Err(err) => {
                warn!(
                    group = group.primary(),
                    error = %err,
                    "stored certificate unreadable, renewing"
                );
                true
            }
        }
    }

    /// Issues a certificate for `group` and writes its bundle.
    ///
    /// Blocks for the whole ACME exchange. The bundle is only reported as
    /// issued after `cert.pem` is verified against `privkey.pem`; files
    /// already written are left in place when that check fails.
    ///
    /// # Errors
    ///
    /// Any [`IssuanceError`], including `CertificateKeyMismatch`.
    pub fn issue<D>(
        &mut self,
        group: &DomainGroup,
        dns: &D,
    ) -> Result<BundlePaths, IssuanceError>
    where
        D: DnsChallengeProvisioner + ?Sized,
    {
        let key = ensure_certificate_key(&self.layout.certificate_key_path(group))?;
        let csr = build_csr(group.domains(), &key)?;

        let issued = self
            .engine
            .issue_certificate(group.domains(), &csr.der, dns)?;
        let chain = CertificateChain::parse(&issued.certificate_pem)?;
        let paths = self.layout.write_bundle(group, key.pem(), &chain)?;

        if !verify_key_match_files(&paths.certificate, &paths.private_key)? {
            return Err(IssuanceError::CertificateKeyMismatch {
                certificate: paths.certificate,
                private_key: paths.private_key,
            });
        }

        info!(
            group = group.primary(),
            domains = group.domains().len(),
            order_url = %issued.order_url,
            "certificate issued"
        );
        Ok(paths)
    }

    /// Groups `domains` and renews every group that needs it.
    ///
    /// A failing group is logged and recorded; the remaining groups are
    /// still processed.
    pub fn run_all<I, S, D>(&mut self, domains: I, dns: &D) -> IssuanceReport
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
        D: DnsChallengeProvisioner + ?Sized,
    {
        let mut report = IssuanceReport::default();

        for group in group_domains_by_registrable_domain(domains) {
            let now = OffsetDateTime::now_utc();
            let outcome = match self.expiry(&group) {
                Ok(Some(not_after)) if !renewal_due(not_after, now, self.renewal_threshold) => {
                    info!(
                        group = group.primary(),
                        %not_after,
                        "certificate still valid, skipping"
                    );
                    GroupOutcome::Skipped { not_after }
                }
                _ => match self.issue(&group, dns) {
                    Ok(paths) => GroupOutcome::Issued(paths),
                    Err(err) => {
                        error!(
                            group = group.primary(),
                            error = %err,
                            "certificate issuance failed"
                        );
                        GroupOutcome::Failed(err)
                    }
                },
            };
            report.outcomes.push((group, outcome));
        }

        info!(
            succeeded = report.succeeded(),
            total = report.total(),
            "{}/{} domain groups succeeded",
            report.succeeded(),
            report.total()
        );
        report
    }
}
