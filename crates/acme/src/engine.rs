use std::fmt;
use std::thread;
use std::time::Duration;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use serde_json::json;
use tracing::{debug, info, warn};
use url::Url;

use crate::account::{
    Account, AccountContact, AccountRegistration, AccountStatus, NewAccountRequest,
};
use crate::authorization::{Authorization, AuthorizationStatus};
use crate::challenge::{DnsRecordHandle, KeyAuthorization};
use crate::dns::{DnsChallengeProvisioner, DEFAULT_TXT_TTL};
use crate::error::IssuanceError;
use crate::http::AcmeHttpClient;
use crate::order::{FinalizeRequest, NewOrderRequest, Order, OrderStatus};
use crate::transport::AcmeTransport;

/// Wait after publishing a TXT record before answering its challenge.
pub const DEFAULT_PROPAGATION_DELAY: Duration = Duration::from_secs(60);
/// Pause between authorization and order polls.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(2);

/// Timing and cleanup policy of the order state machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineSettings {
    /// Contacts sent with `newAccount`.
    pub contacts: Vec<AccountContact>,
    /// Fixed wait between publishing a TXT record and answering the challenge.
    pub propagation_delay: Duration,
    /// Pause between two polls of the same resource.
    pub poll_interval: Duration,
    /// `None` polls until the server reaches a terminal status.
    pub max_poll_attempts: Option<usize>,
    /// TTL in seconds of the published TXT records.
    pub txt_ttl: u32,
    /// Also delete the TXT record when validation fails.
    pub cleanup_on_failure: bool,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            contacts: Vec::new(),
            propagation_delay: DEFAULT_PROPAGATION_DELAY,
            poll_interval: DEFAULT_POLL_INTERVAL,
            max_poll_attempts: None,
            txt_ttl: DEFAULT_TXT_TTL,
            cleanup_on_failure: false,
        }
    }
}

/// Progress of one order through the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrderPhase {
    Created,
    AuthorizationsPending,
    Finalizing,
    Processing,
    Valid,
    Invalid,
}

impl OrderPhase {
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Valid | Self::Invalid)
    }
}

impl fmt::Display for OrderPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Created => "created",
            Self::AuthorizationsPending => "authorizations-pending",
            Self::Finalizing => "finalizing",
            Self::Processing => "processing",
            Self::Valid => "valid",
            Self::Invalid => "invalid",
        })
    }
}

/// Certificate downloaded for a valid order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IssuedCertificate {
    pub order_url: Url,
    pub certificate_url: Url,
    /// PEM chain exactly as served, leaf first.
    pub certificate_pem: String,
}

/// Drives ACME orders from creation to certificate download.
///
/// All methods block: they perform sequential HTTP round trips and sleep
/// for the configured propagation delay and poll interval. Authorizations
/// are handled one at a time in the order the server lists them. Nothing
/// is retried; the first error aborts the order.
#[derive(Debug)]
pub struct AcmeOrderEngine<C> {
    transport: AcmeTransport<C>,
    settings: EngineSettings,
    phase: Option<OrderPhase>,
}

impl<C: AcmeHttpClient> AcmeOrderEngine<C> {
    #[must_use]
    pub const fn new(transport: AcmeTransport<C>, settings: EngineSettings) -> Self {
        Self {
            transport,
            settings,
            phase: None,
        }
    }

    #[must_use]
    pub const fn transport(&self) -> &AcmeTransport<C> {
        &self.transport
    }

    #[must_use]
    pub const fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    /// Phase reached by the most recent order, `None` before the first one.
    #[must_use]
    pub const fn phase(&self) -> Option<OrderPhase> {
        self.phase
    }

    /// Registers the account key unless an account URL is already bound.
    ///
    /// Registration is idempotent on the server side: the same key always
    /// resolves to the same account URL.
    ///
    /// # Errors
    ///
    /// * `IssuanceError::InvalidResponse` when the server omits `Location`.
    /// * `IssuanceError::AccountUnusable` for deactivated or revoked accounts.
    /// * Transport and protocol failures.
    pub fn ensure_account(&mut self) -> Result<AccountRegistration, IssuanceError> {
        if let Some(account_url) = self.transport.account_url() {
            return Ok(AccountRegistration {
                account_url: account_url.clone(),
                contacts: self.settings.contacts.clone(),
            });
        }

        let new_account = self.transport.directory().new_account.clone();
        let request = NewAccountRequest::agreeing(self.settings.contacts.clone());
        let response = self
            .transport
            .signed_request(&new_account, Some(&serde_json::to_value(&request)?))?;
        let account_url = response.location().ok_or_else(|| {
            IssuanceError::invalid_response(&new_account, "missing Location header")
        })?;

        if !response.body.is_empty() {
            let account = Account::from_json_slice(&response.body)
                .map_err(|err| IssuanceError::invalid_response(&new_account, err))?;
            if account.status() != AccountStatus::Valid {
                return Err(IssuanceError::AccountUnusable {
                    status: account.status(),
                });
            }
        }

        info!(
            account_url = %account_url,
            created = response.status == http::StatusCode::CREATED,
            "ACME account ready"
        );
        self.transport.set_account_url(account_url.clone());
        Ok(AccountRegistration {
            account_url,
            contacts: self.settings.contacts.clone(),
        })
    }

    /// Runs a complete order for `domains` and downloads the certificate.
    ///
    /// `csr_der` must cover exactly `domains`. Each pending authorization
    /// gets one TXT record through `dns`; the record is removed once the
    /// authorization is valid. On failure the record is left in place unless
    /// [`EngineSettings::cleanup_on_failure`] is set.
    ///
    /// # Errors
    ///
    /// Any [`IssuanceError`]; the order is abandoned at the failing step.
    pub fn issue_certificate<D>(
        &mut self,
        domains: &[String],
        csr_der: &[u8],
        dns: &D,
    ) -> Result<IssuedCertificate, IssuanceError>
    where
        D: DnsChallengeProvisioner + ?Sized,
    {
        self.phase = None;
        let result = self.run_order(domains, csr_der, dns);
        if result.is_err() {
            self.phase = Some(OrderPhase::Invalid);
        }
        result
    }

    fn run_order<D>(
        &mut self,
        domains: &[String],
        csr_der: &[u8],
        dns: &D,
    ) -> Result<IssuedCertificate, IssuanceError>
    where
        D: DnsChallengeProvisioner + ?Sized,
    {
        self.ensure_account()?;

        let (order_url, order) = self.create_order(domains)?;
        self.enter(OrderPhase::Created, &order_url);

        self.enter(OrderPhase::AuthorizationsPending, &order_url);
        for authorization_url in order.authorizations() {
            self.authorize(authorization_url, dns)?;
        }

        self.enter(OrderPhase::Finalizing, &order_url);
        let finalized = self.finalize(&order, csr_der)?;

        self.enter(OrderPhase::Processing, &order_url);
        let certificate_url = self.wait_for_certificate(&order_url, finalized)?;

        let response = self.transport.post_as_get(&certificate_url)?;
        let certificate_pem = response.text();
        if !certificate_pem.contains("-----BEGIN CERTIFICATE-----") {
            return Err(IssuanceError::invalid_response(
                &certificate_url,
                "certificate body is not a PEM chain",
            ));
        }

        self.enter(OrderPhase::Valid, &order_url);
        Ok(IssuedCertificate {
            order_url,
            certificate_url,
            certificate_pem,
        })
    }

    fn enter(&mut self, phase: OrderPhase, order_url: &Url) {
        debug!(order_url = %order_url, phase = %phase, "order phase changed");
        self.phase = Some(phase);
    }

    fn create_order(&self, domains: &[String]) -> Result<(Url, Order), IssuanceError> {
        let new_order = self.transport.directory().new_order.clone();
        let request = NewOrderRequest::for_dns_names(domains)?;
        let response = self
            .transport
            .signed_request(&new_order, Some(&serde_json::to_value(&request)?))?;
        let order_url = response.location().ok_or_else(|| {
            IssuanceError::invalid_response(&new_order, "missing Location header")
        })?;
        let order = Order::from_json_slice(&response.body)
            .map_err(|err| IssuanceError::invalid_response(&order_url, err))?;

        info!(
            order_url = %order_url,
            identifiers = order.identifiers().len(),
            authorizations = order.authorizations().len(),
            "order created"
        );
        Ok((order_url, order))
    }

    fn fetch_authorization(&self, url: &Url) -> Result<Authorization, IssuanceError> {
        let response = self.transport.post_as_get(url)?;
        Authorization::from_json_slice(&response.body)
            .map_err(|err| IssuanceError::invalid_response(url, err))
    }

    fn fetch_order(&self, url: &Url) -> Result<Order, IssuanceError> {
        let response = self.transport.post_as_get(url)?;
        Order::from_json_slice(&response.body)
            .map_err(|err| IssuanceError::invalid_response(url, err))
    }

    fn authorize<D>(&self, url: &Url, dns: &D) -> Result<(), IssuanceError>
    where
        D: DnsChallengeProvisioner + ?Sized,
    {
        let authorization = self.fetch_authorization(url)?;
        let domain = authorization.domain().to_owned();

        match authorization.status() {
            AuthorizationStatus::Valid => {
                debug!(domain = %domain, "authorization already valid");
                return Ok(());
            }
            status if status.is_failure() => {
                return Err(IssuanceError::AuthorizationFailed {
                    domain,
                    problem: authorization.challenge_errors().next().cloned(),
                });
            }
            _ => {}
        }

        let challenge = authorization
            .dns01_challenge()
            .ok_or_else(|| IssuanceError::UnsupportedChallenge {
                domain: domain.clone(),
            })?;
        let token = challenge.token().ok_or_else(|| {
            IssuanceError::invalid_response(url, "dns-01 challenge has no token")
        })?;

        let key_authorization = KeyAuthorization::new(token, self.transport.account_key());
        let record = DnsRecordHandle::new(&domain, &key_authorization);
        let record_id = dns.add_txt_record(
            &record.zone,
            &record.host_prefix,
            &record.value,
            self.settings.txt_ttl,
        )?;
        info!(
            domain = %domain,
            record = %record.fqdn(),
            record_id = %record_id,
            delay_secs = self.settings.propagation_delay.as_secs(),
            "challenge TXT record published, waiting for propagation"
        );
        thread::sleep(self.settings.propagation_delay);

        match self.validate(url, challenge.url(), &key_authorization, &domain) {
            Ok(()) => {
                dns.delete_txt_record(&record.zone, &record.host_prefix)?;
                debug!(domain = %domain, record = %record.fqdn(), "challenge TXT record removed");
                Ok(())
            }
            Err(err) => {
                if self.settings.cleanup_on_failure {
                    if let Err(cleanup) = dns.delete_txt_record(&record.zone, &record.host_prefix)
                    {
                        warn!(
                            domain = %domain,
                            record = %record.fqdn(),
                            error = %cleanup,
                            "failed to remove challenge TXT record"
                        );
                    }
                } else {
                    warn!(
                        domain = %domain,
                        record = %record.fqdn(),
                        "validation failed, challenge TXT record left in place"
                    );
                }
                Err(err)
            }
        }
    }

    /// Answers the challenge and polls the authorization to a final status.
    fn validate(
        &self,
        authorization_url: &Url,
        challenge_url: &Url,
        key_authorization: &KeyAuthorization,
        domain: &str,
    ) -> Result<(), IssuanceError> {
        let payload = json!({ "keyAuthorization": key_authorization.as_str() });
        self.transport.signed_request(challenge_url, Some(&payload))?;

        let mut attempts = 0;
        loop {
            self.ensure_attempts_left(authorization_url, attempts)?;
            thread::sleep(self.settings.poll_interval);
            let authorization = self.fetch_authorization(authorization_url)?;
            attempts += 1;

            match authorization.status() {
                AuthorizationStatus::Valid => {
                    info!(domain, attempts, "authorization valid");
                    return Ok(());
                }
                status if status.is_failure() => {
                    let problem = authorization.challenge_errors().next().cloned();
                    warn!(domain, status = ?status, "authorization failed");
                    return Err(IssuanceError::AuthorizationFailed {
                        domain: domain.to_owned(),
                        problem,
                    });
                }
                status => {
                    debug!(domain, status = ?status, attempts, "authorization still pending");
                }
            }
        }
    }

    fn finalize(&self, order: &Order, csr_der: &[u8]) -> Result<Order, IssuanceError> {
        let request = FinalizeRequest {
            csr: URL_SAFE_NO_PAD.encode(csr_der),
        };
        let url = order.finalize();
        let response = self
            .transport
            .signed_request(url, Some(&serde_json::to_value(&request)?))?;
        Order::from_json_slice(&response.body)
            .map_err(|err| IssuanceError::invalid_response(url, err))
    }

    fn wait_for_certificate(
        &self,
        order_url: &Url,
        mut order: Order,
    ) -> Result<Url, IssuanceError> {
        let mut attempts = 0;
        loop {
            match order.status() {
                OrderStatus::Valid => {
                    return order.certificate().cloned().ok_or_else(|| {
                        IssuanceError::invalid_response(
                            order_url,
                            "valid order has no certificate URL",
                        )
                    });
                }
                OrderStatus::Invalid => {
                    return Err(IssuanceError::OrderInvalid {
                        order_url: order_url.clone(),
                        problem: order.error().cloned(),
                    });
                }
                status => debug!(
                    order_url = %order_url,
                    status = ?status,
                    attempts,
                    "waiting for certificate"
                ),
            }

            self.ensure_attempts_left(order_url, attempts)?;
            thread::sleep(self.settings.poll_interval);
            order = self.fetch_order(order_url)?;
            attempts += 1;
        }
    }

    fn ensure_attempts_left(&self, resource: &Url, attempts: usize) -> Result<(), IssuanceError> {
        match self.settings.max_poll_attempts {
            Some(max) if attempts >= max => Err(IssuanceError::PollAttemptsExceeded {
                resource: resource.clone(),
                attempts,
            }),
            _ => Ok(()),
        }
    }
}
