use rcgen::{CertificateParams, DistinguishedName, DnType};
use thiserror::Error;
use x509_parser::{
    certification_request::X509CertificationRequest,
    extensions::{GeneralName, ParsedExtension},
    prelude::FromDer,
};

use crate::keys::CertificateKey;

#[derive(Debug, Error)]
pub enum CsrBuildError {
    #[error("a CSR needs at least one domain")]
    EmptyDomainList,
    #[error("failed to build CSR: {0}")]
    Rcgen(#[from] rcgen::Error),
    #[error("CSR is not valid PEM: {0}")]
    Pem(#[from] pem::PemError),
    #[error("CSR could not be parsed: {0}")]
    Parse(String),
}

/// PKCS#10 request in both encodings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Csr {
    pub pem: String,
    pub der: Vec<u8>,
}

/// Builds a CSR with the first domain as common name and every domain,
/// wildcards included, as a DNS subject alternative name.
///
/// # Errors
///
/// Returns `CsrBuildError::EmptyDomainList` for an empty slice and
/// `CsrBuildError::Rcgen` when a name is not a valid IA5 string or signing
/// fails.
pub fn build_csr(domains: &[String], key: &CertificateKey) -> Result<Csr, CsrBuildError> {
    let primary = domains.first().ok_or(CsrBuildError::EmptyDomainList)?;

    let mut params = CertificateParams::new(domains.to_vec())?;
    params.distinguished_name = DistinguishedName::new();
    params
        .distinguished_name
        .push(DnType::CommonName, primary.as_str());

    let request = params.serialize_request(key.key_pair())?;
    Ok(Csr {
        pem: request.pem()?,
        der: request.der().to_vec(),
    })
}

/// Names found in a CSR.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CsrDomains {
    pub common_name: Option<String>,
    pub subject_alt_names: Vec<String>,
}

/// Reads the common name and DNS SANs back out of a PEM CSR.
///
/// # Errors
///
/// Returns `CsrBuildError::Pem` or `CsrBuildError::Parse` for malformed input.
pub fn parse_csr_domains(csr_pem: &str) -> Result<CsrDomains, CsrBuildError> {
    let block = pem::parse(csr_pem)?;
    parse_csr_domains_der(block.contents())
}

/// DER variant of [`parse_csr_domains`].
///
/// # Errors
///
/// Returns `CsrBuildError::Parse` for malformed input.
pub fn parse_csr_domains_der(der: &[u8]) -> Result<CsrDomains, CsrBuildError> {
    let (_, request) = X509CertificationRequest::from_der(der)
        .map_err(|err| CsrBuildError::Parse(err.to_string()))?;

    let common_name = request
        .certification_request_info
        .subject
        .iter_common_name()
        .next()
        .and_then(|attribute| attribute.as_str().ok())
        .map(ToOwned::to_owned);

    let mut subject_alt_names = Vec::new();
    if let Some(extensions) = request.requested_extensions() {
        for extension in extensions {
            if let ParsedExtension::SubjectAlternativeName(san) = extension {
                for name in &san.general_names {
                    if let GeneralName::DNSName(dns) = name {
                        subject_alt_names.push((*dns).to_owned());
                    }
                }
            }
        }
    }

    Ok(CsrDomains {
        common_name,
        subject_alt_names,
    })
}
