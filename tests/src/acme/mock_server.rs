use std::collections::{BTreeSet, HashSet};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use certflow_acme::{
    parse_csr_domains_der, AcmeHttpClient, AcmeJws, DnsRecordHandle, HttpError, HttpResponse,
    KeyAuthorization, RsaJwk, REPLAY_NONCE_HEADER,
};
use http::header::{CACHE_CONTROL, CONTENT_TYPE, LOCATION};
use http::{HeaderMap, HeaderValue, StatusCode};
use rcgen::{
    BasicConstraints, CertificateParams, DistinguishedName, DnType, ExtendedKeyUsagePurpose, IsCa,
    Issuer, KeyPair, KeyUsagePurpose, PublicKeyData, SignatureAlgorithm,
};
use rsa::pkcs1v15::{Signature, VerifyingKey};
use rsa::{BigUint, RsaPublicKey};
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use signature::Verifier;
use time::format_description::well_known::Rfc3339;
use time::{Duration, OffsetDateTime};
use url::Url;
use x509_parser::certification_request::X509CertificationRequest;
use x509_parser::prelude::FromDer;

use super::RecordingDnsProvisioner;

/// Origin every mock resource lives under.
pub const MOCK_ACME_BASE: &str = "https://acme.test";

const CURVE_P256: &str = "1.2.840.10045.3.1.7";
const CURVE_P384: &str = "1.3.132.0.34";
const PROBLEM_JSON: &str = "application/problem+json";
const PEM_CHAIN: &str = "application/pem-certificate-chain";

/// Knobs that change how the mock CA answers.
#[derive(Debug, Clone)]
struct Behaviour {
    authorization_polls: usize,
    processing_polls: usize,
    failing_domains: HashSet<String>,
    offer_dns01: bool,
    certificate_validity: Duration,
    foreign_certificate_key: bool,
    account_status: &'static str,
    dns: Option<RecordingDnsProvisioner>,
}

impl Default for Behaviour {
    fn default() -> Self {
        Self {
            authorization_polls: 1,
            processing_polls: 1,
            failing_domains: HashSet::new(),
            offer_dns01: true,
            certificate_validity: Duration::days(90),
            foreign_certificate_key: false,
            account_status: "valid",
            dns: None,
        }
    }
}

/// Counters exposed for assertions.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MockStats {
    pub accounts: usize,
    pub orders: usize,
    pub authorizations: usize,
    pub challenge_answers: usize,
    pub certificates: usize,
    pub nonces_issued: usize,
    pub rejected_nonces: usize,
}

struct MockAccount {
    url: String,
    key: RsaPublicKey,
    thumbprint: String,
    contact: Vec<Value>,
}

struct MockAuthorization {
    account: usize,
    domain: String,
    wildcard: bool,
    token: String,
    status: &'static str,
    challenge_status: &'static str,
    error: Option<Value>,
    verdict: Option<Result<(), Value>>,
    polls_left: usize,
}

impl MockAuthorization {
    /// Applies the stored verdict once the configured number of polls passed.
    fn advance(&mut self) {
        if self.verdict.is_none() {
            return;
        }
        if self.polls_left > 0 {
            self.polls_left -= 1;
            return;
        }
        match self.verdict.take() {
            Some(Ok(())) => {
                self.status = "valid";
                self.challenge_status = "valid";
            }
            Some(Err(problem)) => {
                self.status = "invalid";
                self.challenge_status = "invalid";
                self.error = Some(problem);
            }
            None => {}
        }
    }
}

struct MockOrder {
    account: usize,
    identifiers: Vec<String>,
    authorizations: Vec<usize>,
    finalized: bool,
    polls_left: usize,
    certificate: Option<usize>,
}

/// Verified JWS request.
struct SignedRequest {
    account: Option<usize>,
    key: RsaPublicKey,
    payload: Option<Value>,
}

struct TestCa {
    root_pem: String,
    intermediate_pem: String,
    intermediate: Issuer<'static, KeyPair>,
}

impl TestCa {
    fn new() -> Self {
        let root_key = KeyPair::generate_for(&rcgen::PKCS_ECDSA_P256_SHA256)
            .expect("generate mock root key");
        let root_params = ca_params("certflow mock root");
        let root = root_params
            .self_signed(&root_key)
            .expect("self-sign mock root");
        let root_issuer = Issuer::new(root_params, root_key);

        let intermediate_key = KeyPair::generate_for(&rcgen::PKCS_ECDSA_P256_SHA256)
            .expect("generate mock intermediate key");
        let intermediate_params = ca_params("certflow mock intermediate");
        let intermediate = intermediate_params
            .signed_by(&intermediate_key, &root_issuer)
            .expect("sign mock intermediate");

        Self {
            root_pem: root.pem(),
            intermediate_pem: intermediate.pem(),
            intermediate: Issuer::new(intermediate_params, intermediate_key),
        }
    }

    fn issue(
        &self,
        names: &[String],
        key: &CsrPublicKey,
        validity: Duration,
    ) -> Result<String, rcgen::Error> {
        let mut params = CertificateParams::new(names.to_vec())?;
        params.distinguished_name = DistinguishedName::new();
        if let Some(first) = names.first() {
            params.distinguished_name.push(DnType::CommonName, first.as_str());
        }
        let now = OffsetDateTime::now_utc();
        params.not_before = now - Duration::hours(1);
        params.not_after = now + validity;
        params.is_ca = IsCa::ExplicitNoCa;
        params.key_usages = vec![KeyUsagePurpose::DigitalSignature];
        params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];

        let leaf = params.signed_by(key, &self.intermediate)?;
        Ok(format!("{}{}", leaf.pem(), self.intermediate_pem))
    }
}

fn ca_params(common_name: &str) -> CertificateParams {
    let mut params = CertificateParams::default();
    params
        .distinguished_name
        .push(DnType::CommonName, common_name);
    params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    params.key_usages = vec![KeyUsagePurpose::KeyCertSign, KeyUsagePurpose::CrlSign];
    let now = OffsetDateTime::now_utc();
    params.not_before = now - Duration::days(1);
    params.not_after = now + Duration::days(3650);
    params
}

/// Public key lifted out of a CSR so the CA can certify it without the
/// private half.
struct CsrPublicKey {
    raw: Vec<u8>,
    algorithm: &'static SignatureAlgorithm,
}

impl PublicKeyData for CsrPublicKey {
    fn der_bytes(&self) -> &[u8] {
        &self.raw
    }

    fn algorithm(&self) -> &'static SignatureAlgorithm {
        self.algorithm
    }
}

fn csr_public_key(der: &[u8]) -> Result<CsrPublicKey, String> {
    let (_, request) = X509CertificationRequest::from_der(der).map_err(|err| err.to_string())?;
    let spki = &request.certification_request_info.subject_pki;
    let curve = spki
        .algorithm
        .parameters
        .as_ref()
        .and_then(|parameters| parameters.as_oid().ok())
        .map(|oid| oid.to_id_string());
    let algorithm = match curve.as_deref() {
        Some(CURVE_P384) => &rcgen::PKCS_ECDSA_P384_SHA384,
        Some(CURVE_P256) => &rcgen::PKCS_ECDSA_P256_SHA256,
        _ => return Err("CSR key must be an ECDSA P-256 or P-384 key".to_owned()),
    };
    Ok(CsrPublicKey {
        raw: spki.subject_public_key.data.to_vec(),
        algorithm,
    })
}

fn rsa_key_from_jwk(jwk: &Value) -> Result<RsaPublicKey, String> {
    if jwk.get("kty").and_then(Value::as_str) != Some("RSA") {
        return Err("only RSA account keys are accepted".to_owned());
    }
    let component = |name: &str| -> Result<BigUint, String> {
        let encoded = jwk
            .get(name)
            .and_then(Value::as_str)
            .ok_or_else(|| format!("jwk is missing `{name}`"))?;
        let bytes = URL_SAFE_NO_PAD
            .decode(encoded)
            .map_err(|err| format!("jwk `{name}` is not base64url: {err}"))?;
        Ok(BigUint::from_bytes_be(&bytes))
    };
    RsaPublicKey::new(component("n")?, component("e")?).map_err(|err| err.to_string())
}

fn decode_json(segment: &str) -> Option<Value> {
    let bytes = URL_SAFE_NO_PAD.decode(segment).ok()?;
    serde_json::from_slice(&bytes).ok()
}

fn format_time(value: OffsetDateTime) -> Value {
    value.format(&Rfc3339).map_or(Value::Null, Value::String)
}

fn problem_value(kind: &str, detail: &str) -> Value {
    json!({
        "type": format!("urn:ietf:params:acme:error:{kind}"),
        "detail": detail,
    })
}

struct MockState {
    behaviour: Behaviour,
    ca: TestCa,
    nonces: HashSet<String>,
    accounts: Vec<MockAccount>,
    authorizations: Vec<MockAuthorization>,
    orders: Vec<MockOrder>,
    certificates: Vec<String>,
    requests: Vec<String>,
    stats: MockStats,
}

impl MockState {
    fn issue_nonce(&mut self) -> String {
        self.stats.nonces_issued += 1;
        let nonce = URL_SAFE_NO_PAD.encode(format!("mock-nonce-{}", self.stats.nonces_issued));
        self.nonces.insert(nonce.clone());
        nonce
    }

    fn respond(
        &mut self,
        status: StatusCode,
        content_type: &'static str,
        body: Vec<u8>,
        location: Option<&str>,
    ) -> HttpResponse {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static(content_type));
        let nonce = self.issue_nonce();
        headers.insert(
            REPLAY_NONCE_HEADER,
            HeaderValue::from_str(&nonce).expect("base64url nonce is a valid header value"),
        );
        if let Some(location) = location {
            headers.insert(
                LOCATION,
                HeaderValue::from_str(location).expect("mock URLs are valid header values"),
            );
        }
        HttpResponse::new(status, headers, body)
    }

    fn json(&mut self, status: StatusCode, body: &Value, location: Option<&str>) -> HttpResponse {
        self.respond(
            status,
            "application/json",
            body.to_string().into_bytes(),
            location,
        )
    }

    fn problem(&mut self, status: StatusCode, kind: &str, detail: &str) -> HttpResponse {
        let mut body = problem_value(kind, detail);
        body["status"] = json!(status.as_u16());
        self.respond(status, PROBLEM_JSON, body.to_string().into_bytes(), None)
    }

    fn directory(&mut self) -> HttpResponse {
        let body = json!({
            "newNonce": format!("{MOCK_ACME_BASE}/new-nonce"),
            "newAccount": format!("{MOCK_ACME_BASE}/new-account"),
            "newOrder": format!("{MOCK_ACME_BASE}/new-order"),
            "revokeCert": format!("{MOCK_ACME_BASE}/revoke-cert"),
            "keyChange": format!("{MOCK_ACME_BASE}/key-change"),
            "meta": {
                "termsOfService": format!("{MOCK_ACME_BASE}/terms"),
                "caaIdentities": ["acme.test"],
                "externalAccountRequired": false
            }
        });
        self.json(StatusCode::OK, &body, None)
    }

    fn handle_post(&mut self, url: &Url, body: &[u8]) -> HttpResponse {
        let request = match self.authenticate(url, body) {
            Ok(request) => request,
            Err(response) => return response,
        };

        let segments: Vec<&str> = url.path().trim_start_matches('/').split('/').collect();
        let id = segments.get(1).and_then(|value| value.parse::<usize>().ok());
        match (segments.as_slice(), id) {
            (["new-account"], _) => self.new_account(&request),
            (["new-order"], _) => self.new_order(&request),
            (["authz", _], Some(id)) => self.authorization(&request, id),
            (["chall", _], Some(id)) => self.answer_challenge(&request, id),
            (["order", _], Some(id)) => self.order(&request, id),
            (["order", _, "finalize"], Some(id)) => self.finalize(&request, id),
            (["cert", _], Some(id)) => self.certificate(&request, id),
            _ => self.problem(StatusCode::NOT_FOUND, "malformed", "unknown resource"),
        }
    }

    /// Checks the flattened JWS: URL binding, single-use nonce, `jwk` only
    /// on `newAccount`, and the RS256 signature.
    fn authenticate(&mut self, url: &Url, body: &[u8]) -> Result<SignedRequest, HttpResponse> {
        let Ok(jws) = serde_json::from_slice::<AcmeJws>(body) else {
            return Err(self.problem(
                StatusCode::BAD_REQUEST,
                "malformed",
                "body is not a flattened JWS",
            ));
        };
        let Some(header) = decode_json(&jws.protected) else {
            return Err(self.problem(
                StatusCode::BAD_REQUEST,
                "malformed",
                "protected header is not base64url JSON",
            ));
        };

        if header.get("url").and_then(Value::as_str) != Some(url.as_str()) {
            return Err(self.problem(
                StatusCode::UNAUTHORIZED,
                "unauthorized",
                "protected url does not match the request URL",
            ));
        }
        if header.get("alg").and_then(Value::as_str) != Some("RS256") {
            return Err(self.problem(
                StatusCode::BAD_REQUEST,
                "badSignatureAlgorithm",
                "only RS256 is supported",
            ));
        }
        let nonce = header.get("nonce").and_then(Value::as_str).unwrap_or_default();
        if !self.nonces.remove(nonce) {
            self.stats.rejected_nonces += 1;
            return Err(self.problem(
                StatusCode::BAD_REQUEST,
                "badNonce",
                "nonce is unknown or already used",
            ));
        }

        let is_new_account = url.path() == "/new-account";
        let (account, key) = match (header.get("jwk"), header.get("kid")) {
            (Some(jwk), None) if is_new_account => match rsa_key_from_jwk(jwk) {
                Ok(key) => (None, key),
                Err(detail) => {
                    return Err(self.problem(StatusCode::BAD_REQUEST, "badPublicKey", &detail))
                }
            },
            (None, Some(Value::String(kid))) if !is_new_account => {
                match self.accounts.iter().position(|account| &account.url == kid) {
                    Some(index) => (Some(index), self.accounts[index].key.clone()),
                    None => {
                        return Err(self.problem(
                            StatusCode::BAD_REQUEST,
                            "accountDoesNotExist",
                            "kid does not name an account",
                        ))
                    }
                }
            }
            _ => {
                return Err(self.problem(
                    StatusCode::BAD_REQUEST,
                    "malformed",
                    "newAccount requires jwk, every other request requires kid",
                ))
            }
        };

        let signing_input = format!("{}.{}", jws.protected, jws.payload);
        let verified = URL_SAFE_NO_PAD
            .decode(&jws.signature)
            .ok()
            .and_then(|bytes| Signature::try_from(bytes.as_slice()).ok())
            .is_some_and(|signature| {
                VerifyingKey::<Sha256>::new(key.clone())
                    .verify(signing_input.as_bytes(), &signature)
                    .is_ok()
            });
        if !verified {
            return Err(self.problem(
                StatusCode::UNAUTHORIZED,
                "unauthorized",
                "JWS signature does not verify",
            ));
        }

        let payload = if jws.payload.is_empty() {
            None
        } else {
            match decode_json(&jws.payload) {
                Some(value) => Some(value),
                None => {
                    return Err(self.problem(
                        StatusCode::BAD_REQUEST,
                        "malformed",
                        "payload is not base64url JSON",
                    ))
                }
            }
        };

        Ok(SignedRequest {
            account,
            key,
            payload,
        })
    }

    fn new_account(&mut self, request: &SignedRequest) -> HttpResponse {
        let payload = request.payload.clone().unwrap_or(Value::Null);
        let thumbprint = RsaJwk::from_public_key(&request.key).thumbprint();

        if let Some(index) = self
            .accounts
            .iter()
            .position(|account| account.thumbprint == thumbprint)
        {
            let url = self.accounts[index].url.clone();
            let body = self.account_json(index);
            return self.json(StatusCode::OK, &body, Some(&url));
        }
        if payload.get("onlyReturnExisting") == Some(&Value::Bool(true)) {
            return self.problem(
                StatusCode::BAD_REQUEST,
                "accountDoesNotExist",
                "no account for this key",
            );
        }
        if payload.get("termsOfServiceAgreed") != Some(&Value::Bool(true)) {
            return self.problem(
                StatusCode::FORBIDDEN,
                "userActionRequired",
                "terms of service must be agreed to",
            );
        }
        let contact = match payload.get("contact") {
            Some(Value::Array(values)) => values.clone(),
            None => Vec::new(),
            Some(_) => {
                return self.problem(
                    StatusCode::BAD_REQUEST,
                    "invalidContact",
                    "contact must be an array",
                )
            }
        };
        if contact
            .iter()
            .any(|value| !value.as_str().is_some_and(|uri| uri.starts_with("mailto:")))
        {
            return self.problem(
                StatusCode::BAD_REQUEST,
                "unsupportedContact",
                "only mailto contacts are supported",
            );
        }

        let index = self.accounts.len();
        let url = format!("{MOCK_ACME_BASE}/acct/{index}");
        self.accounts.push(MockAccount {
            url: url.clone(),
            key: request.key.clone(),
            thumbprint,
            contact,
        });
        self.stats.accounts += 1;
        let body = self.account_json(index);
        self.json(StatusCode::CREATED, &body, Some(&url))
    }

    fn account_json(&self, index: usize) -> Value {
        let account = &self.accounts[index];
        json!({
            "status": self.behaviour.account_status,
            "contact": account.contact,
            "orders": format!("{}/orders", account.url),
        })
    }

    fn new_order(&mut self, request: &SignedRequest) -> HttpResponse {
        let Some(account) = request.account else {
            return self.problem(StatusCode::UNAUTHORIZED, "unauthorized", "no account");
        };
        let identifiers: Option<Vec<String>> = request
            .payload
            .as_ref()
            .and_then(|payload| payload.get("identifiers"))
            .and_then(Value::as_array)
            .map(|values| {
                values
                    .iter()
                    .filter(|value| value.get("type").and_then(Value::as_str) == Some("dns"))
                    .filter_map(|value| value.get("value").and_then(Value::as_str))
                    .map(str::to_ascii_lowercase)
                    .collect()
            });
        let identifiers = match identifiers {
            Some(values) if !values.is_empty() => values,
            _ => {
                return self.problem(
                    StatusCode::BAD_REQUEST,
                    "malformed",
                    "order needs at least one dns identifier",
                )
            }
        };

        let authorizations = identifiers
            .iter()
            .map(|identifier| self.authorization_for(account, identifier))
            .collect();
        let index = self.orders.len();
        self.orders.push(MockOrder {
            account,
            identifiers,
            authorizations,
            finalized: false,
            polls_left: 0,
            certificate: None,
        });
        self.stats.orders += 1;

        let url = format!("{MOCK_ACME_BASE}/order/{index}");
        let body = self.order_json(index);
        self.json(StatusCode::CREATED, &body, Some(&url))
    }

    /// Reuses a valid authorization of the same account, like production
    /// CAs do, and creates a pending one otherwise.
    fn authorization_for(&mut self, account: usize, identifier: &str) -> usize {
        let wildcard = identifier.starts_with("*.");
        let domain = identifier.trim_start_matches("*.").to_owned();
        if let Some(existing) = self.authorizations.iter().position(|authz| {
            authz.account == account
                && authz.domain == domain
                && authz.wildcard == wildcard
                && authz.status == "valid"
        }) {
            return existing;
        }

        let index = self.authorizations.len();
        let token = URL_SAFE_NO_PAD.encode(Sha256::digest(format!("mock-token-{index}")));
        self.authorizations.push(MockAuthorization {
            account,
            domain,
            wildcard,
            token,
            status: "pending",
            challenge_status: "pending",
            error: None,
            verdict: None,
            polls_left: 0,
        });
        self.stats.authorizations += 1;
        index
    }

    fn authorization_json(&self, index: usize) -> Value {
        let authz = &self.authorizations[index];
        let mut challenge = json!({
            "type": if self.behaviour.offer_dns01 { "dns-01" } else { "http-01" },
            "url": format!("{MOCK_ACME_BASE}/chall/{index}"),
            "token": authz.token,
            "status": authz.challenge_status,
        });
        if authz.challenge_status == "valid" {
            challenge["validated"] = format_time(OffsetDateTime::now_utc());
        }
        if let Some(error) = &authz.error {
            challenge["error"] = error.clone();
        }
        let mut body = json!({
            "identifier": { "type": "dns", "value": authz.domain },
            "status": authz.status,
            "expires": format_time(OffsetDateTime::now_utc() + Duration::days(7)),
            "challenges": [challenge],
        });
        if authz.wildcard {
            body["wildcard"] = Value::Bool(true);
        }
        body
    }

    fn owns_authorization(&self, request: &SignedRequest, index: usize) -> bool {
        self.authorizations
            .get(index)
            .is_some_and(|authz| Some(authz.account) == request.account)
    }

    fn authorization(&mut self, request: &SignedRequest, index: usize) -> HttpResponse {
        if !self.owns_authorization(request, index) {
            return self.problem(StatusCode::NOT_FOUND, "malformed", "no such authorization");
        }
        self.authorizations[index].advance();
        let body = self.authorization_json(index);
        self.json(StatusCode::OK, &body, None)
    }

    fn answer_challenge(&mut self, request: &SignedRequest, index: usize) -> HttpResponse {
        if !self.owns_authorization(request, index) {
            return self.problem(StatusCode::NOT_FOUND, "malformed", "no such challenge");
        }
        if self.authorizations[index].status == "pending"
            && self.authorizations[index].verdict.is_none()
        {
            let verdict = self.judge(request, index);
            let polls = self.behaviour.authorization_polls;
            let authz = &mut self.authorizations[index];
            authz.verdict = Some(verdict);
            authz.polls_left = polls;
            authz.challenge_status = "processing";
            self.stats.challenge_answers += 1;
        }

        let authz = &self.authorizations[index];
        let body = json!({
            "type": if self.behaviour.offer_dns01 { "dns-01" } else { "http-01" },
            "url": format!("{MOCK_ACME_BASE}/chall/{index}"),
            "token": authz.token,
            "status": authz.challenge_status,
        });
        let up = format!("<{MOCK_ACME_BASE}/authz/{index}>;rel=\"up\"");
        let mut response = self.json(StatusCode::OK, &body, None);
        if let Ok(link) = HeaderValue::from_str(&up) {
            response.headers.insert(http::header::LINK, link);
        }
        response
    }

    /// Decides the outcome of a challenge at the moment it is answered.
    fn judge(&self, request: &SignedRequest, index: usize) -> Result<(), Value> {
        let authz = &self.authorizations[index];
        let Some(account) = request.account.map(|account| &self.accounts[account]) else {
            return Err(problem_value("unauthorized", "no account"));
        };
        let expected = KeyAuthorization::from_thumbprint(&authz.token, &account.thumbprint);

        let submitted = request
            .payload
            .as_ref()
            .and_then(|payload| payload.get("keyAuthorization"))
            .and_then(Value::as_str);
        if submitted.is_some_and(|value| value != expected.as_str()) {
            return Err(problem_value(
                "unauthorized",
                "key authorization does not match the account key",
            ));
        }
        if self.behaviour.failing_domains.contains(&authz.domain) {
            return Err(problem_value(
                "unauthorized",
                &format!("incorrect TXT record found at _acme-challenge.{}", authz.domain),
            ));
        }
        if let Some(dns) = &self.behaviour.dns {
            let record = DnsRecordHandle::new(&authz.domain, &expected);
            if !dns.txt_values(&record.fqdn()).contains(&record.value) {
                return Err(problem_value(
                    "dns",
                    &format!("no TXT record with the expected value at {}", record.fqdn()),
                ));
            }
        }
        Ok(())
    }

    fn order_status(&self, index: usize) -> &'static str {
        let order = &self.orders[index];
        let statuses = order
            .authorizations
            .iter()
            .map(|authz| self.authorizations[*authz].status);
        if statuses.clone().any(|status| status == "invalid") {
            "invalid"
        } else if order.finalized {
            if order.polls_left > 0 {
                "processing"
            } else {
                "valid"
            }
        } else if statuses.clone().all(|status| status == "valid") {
            "ready"
        } else {
            "pending"
        }
    }

    fn order_json(&self, index: usize) -> Value {
        let order = &self.orders[index];
        let status = self.order_status(index);
        let mut body = json!({
            "status": status,
            "expires": format_time(OffsetDateTime::now_utc() + Duration::days(7)),
            "identifiers": order
                .identifiers
                .iter()
                .map(|value| json!({ "type": "dns", "value": value }))
                .collect::<Vec<_>>(),
            "authorizations": order
                .authorizations
                .iter()
                .map(|authz| format!("{MOCK_ACME_BASE}/authz/{authz}"))
                .collect::<Vec<_>>(),
            "finalize": format!("{MOCK_ACME_BASE}/order/{index}/finalize"),
        });
        if status == "valid" {
            if let Some(certificate) = order.certificate {
                body["certificate"] = json!(format!("{MOCK_ACME_BASE}/cert/{certificate}"));
            }
        }
        if status == "invalid" {
            if let Some(error) = order
                .authorizations
                .iter()
                .find_map(|authz| self.authorizations[*authz].error.clone())
            {
                body["error"] = error;
            }
        }
        body
    }

    fn owns_order(&self, request: &SignedRequest, index: usize) -> bool {
        self.orders
            .get(index)
            .is_some_and(|order| Some(order.account) == request.account)
    }

    fn order(&mut self, request: &SignedRequest, index: usize) -> HttpResponse {
        if !self.owns_order(request, index) {
            return self.problem(StatusCode::NOT_FOUND, "malformed", "no such order");
        }
        let order = &mut self.orders[index];
        if order.finalized && order.polls_left > 0 {
            order.polls_left -= 1;
        }
        let body = self.order_json(index);
        self.json(StatusCode::OK, &body, None)
    }

    fn finalize(&mut self, request: &SignedRequest, index: usize) -> HttpResponse {
        if !self.owns_order(request, index) {
            return self.problem(StatusCode::NOT_FOUND, "malformed", "no such order");
        }
        if self.order_status(index) != "ready" {
            return self.problem(
                StatusCode::FORBIDDEN,
                "orderNotReady",
                "order is not ready for finalization",
            );
        }

        let der = match request
            .payload
            .as_ref()
            .and_then(|payload| payload.get("csr"))
            .and_then(Value::as_str)
            .map(|csr| URL_SAFE_NO_PAD.decode(csr))
        {
            Some(Ok(der)) => der,
            _ => return self.problem(StatusCode::BAD_REQUEST, "badCSR", "csr is not base64url"),
        };
        let names = match parse_csr_domains_der(&der) {
            Ok(domains) => domains.subject_alt_names,
            Err(err) => {
                return self.problem(StatusCode::BAD_REQUEST, "badCSR", &err.to_string())
            }
        };
        let requested: BTreeSet<String> =
            names.iter().map(|name| name.to_ascii_lowercase()).collect();
        let ordered: BTreeSet<String> = self.orders[index].identifiers.iter().cloned().collect();
        if requested != ordered {
            return self.problem(
                StatusCode::BAD_REQUEST,
                "badCSR",
                "CSR names do not match the order identifiers",
            );
        }

        let key = if self.behaviour.foreign_certificate_key {
            KeyPair::generate_for(&rcgen::PKCS_ECDSA_P384_SHA384)
                .map(|foreign| CsrPublicKey {
                    raw: foreign.public_key_raw().to_vec(),
                    algorithm: &rcgen::PKCS_ECDSA_P384_SHA384,
                })
                .map_err(|err| err.to_string())
        } else {
            csr_public_key(&der)
        };
        let key = match key {
            Ok(key) => key,
            Err(detail) => return self.problem(StatusCode::BAD_REQUEST, "badCSR", &detail),
        };

        let chain = match self
            .ca
            .issue(&names, &key, self.behaviour.certificate_validity)
        {
            Ok(chain) => chain,
            Err(err) => {
                return self.problem(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "serverInternal",
                    &err.to_string(),
                )
            }
        };
        let certificate = self.certificates.len();
        self.certificates.push(chain);
        self.stats.certificates += 1;

        let polls = self.behaviour.processing_polls;
        let order = &mut self.orders[index];
        order.finalized = true;
        order.polls_left = polls;
        order.certificate = Some(certificate);

        let body = self.order_json(index);
        self.json(StatusCode::OK, &body, None)
    }

    fn certificate(&mut self, request: &SignedRequest, index: usize) -> HttpResponse {
        let owned = self.orders.iter().any(|order| {
            order.certificate == Some(index) && Some(order.account) == request.account
        });
        if !owned || request.payload.is_some() {
            return self.problem(StatusCode::NOT_FOUND, "malformed", "no such certificate");
        }
        let chain = self.certificates[index].clone().into_bytes();
        self.respond(StatusCode::OK, PEM_CHAIN, chain, None)
    }
}

/// In-memory ACME CA implementing [`AcmeHttpClient`].
///
/// Requests are verified the way a real CA verifies them: every POST must
/// carry a fresh nonce, sign with RS256, use `jwk` only for `newAccount`
/// and name a known account through `kid` everywhere else. Finalized
/// orders receive a leaf certificate for the CSR key, signed by a
/// throwaway intermediate.
///
/// Clones share state, so a test can keep one handle for assertions while
/// the engine owns another.
#[derive(Clone)]
pub struct MockAcmeServer {
    state: Arc<Mutex<MockState>>,
}

impl Default for MockAcmeServer {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for MockAcmeServer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MockAcmeServer")
            .field("base", &MOCK_ACME_BASE)
            .field("stats", &self.stats())
            .finish_non_exhaustive()
    }
}

impl MockAcmeServer {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(MockState {
                behaviour: Behaviour::default(),
                ca: TestCa::new(),
                nonces: HashSet::new(),
                accounts: Vec::new(),
                authorizations: Vec::new(),
                orders: Vec::new(),
                certificates: Vec::new(),
                requests: Vec::new(),
                stats: MockStats::default(),
            })),
        }
    }

    pub fn directory_url() -> Url {
        Url::parse(&format!("{MOCK_ACME_BASE}/directory")).expect("mock directory URL")
    }

    /// Validates challenges against the TXT records published in `dns`.
    pub fn with_dns(self, dns: RecordingDnsProvisioner) -> Self {
        self.lock().behaviour.dns = Some(dns);
        self
    }

    /// Fails every challenge for `domain` with an `unauthorized` problem.
    pub fn fail_domain(self, domain: &str) -> Self {
        self.lock()
            .behaviour
            .failing_domains
            .insert(domain.to_ascii_lowercase());
        self
    }

    /// Offers `http-01` instead of `dns-01`.
    pub fn without_dns01(self) -> Self {
        self.lock().behaviour.offer_dns01 = false;
        self
    }

    /// Polls an answered authorization stays pending for.
    pub fn authorization_polls(self, polls: usize) -> Self {
        self.lock().behaviour.authorization_polls = polls;
        self
    }

    /// Polls a finalized order stays `processing` for.
    pub fn processing_polls(self, polls: usize) -> Self {
        self.lock().behaviour.processing_polls = polls;
        self
    }

    pub fn certificate_validity(self, validity: Duration) -> Self {
        self.lock().behaviour.certificate_validity = validity;
        self
    }

    /// Certifies a freshly generated key instead of the CSR key.
    pub fn sign_foreign_keys(self) -> Self {
        self.lock().behaviour.foreign_certificate_key = true;
        self
    }

    /// Status reported for every account, e.g. `deactivated`.
    pub fn account_status(self, status: &'static str) -> Self {
        self.lock().behaviour.account_status = status;
        self
    }

    pub fn stats(&self) -> MockStats {
        self.lock().stats
    }

    /// `METHOD /path` for every request received, in order.
    pub fn requests(&self) -> Vec<String> {
        self.lock().requests.clone()
    }

    pub fn root_certificate_pem(&self) -> String {
        self.lock().ca.root_pem.clone()
    }

    fn lock(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl AcmeHttpClient for MockAcmeServer {
    fn head(&self, url: &Url) -> Result<HttpResponse, HttpError> {
        let mut state = self.lock();
        state.requests.push(format!("HEAD {}", url.path()));
        if url.path() != "/new-nonce" {
            return Ok(state.problem(StatusCode::NOT_FOUND, "malformed", "unknown resource"));
        }
        let mut response = state.respond(StatusCode::OK, "text/plain", Vec::new(), None);
        response
            .headers
            .insert(CACHE_CONTROL, HeaderValue::from_static("no-store"));
        Ok(response)
    }

    fn get(&self, url: &Url) -> Result<HttpResponse, HttpError> {
        let mut state = self.lock();
        state.requests.push(format!("GET {}", url.path()));
        if url.path() == "/directory" {
            Ok(state.directory())
        } else {
            Ok(state.problem(
                StatusCode::METHOD_NOT_ALLOWED,
                "malformed",
                "resources must be fetched with POST-as-GET",
            ))
        }
    }

    fn post_jose(&self, url: &Url, body: Vec<u8>) -> Result<HttpResponse, HttpError> {
        let mut state = self.lock();
        state.requests.push(format!("POST {}", url.path()));
        Ok(state.handle_post(url, &body))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use certflow_acme::{fetch_directory, AcmeTransport, RsaAccountKey, TransportError};
    use pretty_assertions::assert_eq;
    use rand_chacha::{rand_core::SeedableRng, ChaCha8Rng};

    fn account_key(seed: u64) -> RsaAccountKey {
        let mut rng = ChaCha8Rng::seed_from_u64(seed);
        RsaAccountKey::generate_with_rng(1024, &mut rng).expect("rsa key")
    }

    #[test]
    fn directory_lists_core_endpoints() {
        let server = MockAcmeServer::new();
        let directory =
            fetch_directory(&server, &MockAcmeServer::directory_url()).expect("directory");
        assert_eq!(
            directory.new_order.as_str(),
            "https://acme.test/new-order"
        );
        assert_eq!(server.requests(), vec!["GET /directory".to_owned()]);
    }

    #[test]
    fn unbound_kid_is_rejected() {
        let server = MockAcmeServer::new();
        let mut transport = AcmeTransport::connect(
            server.clone(),
            &MockAcmeServer::directory_url(),
            account_key(1),
        )
        .expect("connect");
        transport.set_account_url(
            Url::parse("https://acme.test/acct/42").expect("url"),
        );
        let new_order = transport.directory().new_order.clone();

        let err = transport
            .signed_request(&new_order, Some(&json!({ "identifiers": [] })))
            .expect_err("unknown account");
        match err {
            TransportError::Protocol(error) => {
                assert!(error.problem.is_acme_error("accountDoesNotExist"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn nonces_are_single_use() {
        let server = MockAcmeServer::new();
        let transport = AcmeTransport::connect(
            server.clone(),
            &MockAcmeServer::directory_url(),
            account_key(2),
        )
        .expect("connect");
        let new_account = transport.directory().new_account.clone();
        let payload = json!({ "termsOfServiceAgreed": true });

        let nonce = transport.new_nonce().expect("nonce");
        let key = transport.account_key();
        let jws = key
            .sign_json(&payload, &nonce, &new_account, certflow_acme::KeyBinding::Jwk)
            .expect("sign");
        let body = serde_json::to_vec(&jws).expect("encode");

        let first = server
            .post_jose(&new_account, body.clone())
            .expect("first post");
        assert_eq!(first.status, StatusCode::CREATED);

        let replay = server.post_jose(&new_account, body).expect("replayed post");
        assert_eq!(replay.status, StatusCode::BAD_REQUEST);
        assert_eq!(server.stats().rejected_nonces, 1);
        assert_eq!(server.stats().accounts, 1);
    }
}
