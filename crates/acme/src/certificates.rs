use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use pem::Pem;
use rcgen::KeyPair;
use rsa::pkcs1::{DecodeRsaPrivateKey, DecodeRsaPublicKey};
use rsa::pkcs8::DecodePrivateKey;
use rsa::traits::PublicKeyParts;
use rsa::{BigUint, RsaPrivateKey, RsaPublicKey};
use thiserror::Error;
use time::OffsetDateTime;
use x509_parser::oid_registry::{OID_KEY_TYPE_EC_PUBLIC_KEY, OID_PKCS1_RSAENCRYPTION};
use x509_parser::prelude::{FromDer, X509Certificate};

const SECP384R1: &str = "1.3.132.0.34";
const PRIME256V1: &str = "1.2.840.10045.3.1.7";

#[derive(Debug, Error)]
pub enum CertificateError {
    #[error("certificate PEM is invalid: {0}")]
    InvalidPem(String),
    #[error("expected a CERTIFICATE block, found {tag}")]
    UnexpectedTag { tag: String },
    #[error("certificate chain is empty")]
    EmptyChain,
    #[error("certificate could not be parsed: {0}")]
    Parse(String),
    #[error("private key could not be parsed: {0}")]
    InvalidKey(String),
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// PEM chain as returned by the certificate URL: leaf first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertificateChain {
    certificates: Vec<String>,
}

impl CertificateChain {
    /// Splits a PEM bundle into its certificate blocks.
    ///
    /// # Errors
    ///
    /// Returns `CertificateError` when the text holds no certificate or a
    /// block other than `CERTIFICATE`.
    pub fn parse(body: &str) -> Result<Self, CertificateError> {
        let mut certificates = Vec::new();
        let sections = pem::parse_many(body.as_bytes())
            .map_err(|err| CertificateError::InvalidPem(err.to_string()))?;
        for section in sections {
            if section.tag() != "CERTIFICATE" {
                return Err(CertificateError::UnexpectedTag {
                    tag: section.tag().to_owned(),
                });
            }
            let block = Pem::new("CERTIFICATE", section.contents());
            certificates.push(pem::encode(&block).replace("\r\n", "\n"));
        }
        if certificates.is_empty() {
            return Err(CertificateError::EmptyChain);
        }
        Ok(Self { certificates })
    }

    #[must_use]
    pub fn certificates(&self) -> &[String] {
        &self.certificates
    }

    #[must_use]
    pub fn leaf(&self) -> &str {
        &self.certificates[0]
    }

    /// Everything after the leaf.
    #[must_use]
    pub fn intermediates(&self) -> &[String] {
        &self.certificates[1..]
    }

    #[must_use]
    pub fn full_chain_pem(&self) -> String {
        self.certificates.concat()
    }

    /// Intermediates concatenated, `None` when the server sent only the leaf.
    #[must_use]
    pub fn chain_pem(&self) -> Option<String> {
        let rest = self.intermediates();
        if rest.is_empty() {
            None
        } else {
            Some(rest.concat())
        }
    }
}

/// `notAfter` of the first certificate in `pem_text`.
///
/// # Errors
///
/// Returns `CertificateError` when no certificate can be parsed.
pub fn certificate_not_after(pem_text: &str) -> Result<OffsetDateTime, CertificateError> {
    let der = first_certificate_der(pem_text)?;
    let (_, certificate) =
        X509Certificate::from_der(&der).map_err(|err| CertificateError::Parse(err.to_string()))?;
    Ok(certificate.validity().not_after.to_datetime())
}

#[derive(Debug, PartialEq, Eq)]
enum PublicKeyMaterial {
    Ec { curve: String, point: Vec<u8> },
    Rsa { n: BigUint, e: BigUint },
}

impl PublicKeyMaterial {
    fn from_rsa(key: &RsaPublicKey) -> Self {
        Self::Rsa {
            n: key.n().clone(),
            e: key.e().clone(),
        }
    }
}

/// Compares the public key of the first certificate in `cert_pem` with the
/// one derived from `key_pem`.
///
/// EC keys match on curve and point, RSA keys on modulus and exponent.
/// Keys of different types never match.
///
/// # Errors
///
/// Returns `CertificateError` when either input cannot be parsed.
pub fn verify_key_match(cert_pem: &str, key_pem: &str) -> Result<bool, CertificateError> {
    let certificate = certificate_key_material(cert_pem)?;
    let private = private_key_material(key_pem)?;
    Ok(certificate == private)
}

/// File variant of [`verify_key_match`].
///
/// # Errors
///
/// Returns `CertificateError::Io` when a file cannot be read, otherwise the
/// same conditions as [`verify_key_match`].
pub fn verify_key_match_files(
    cert_path: &Path,
    key_path: &Path,
) -> Result<bool, CertificateError> {
    let read = |path: &Path| {
        fs::read_to_string(path).map_err(|source| CertificateError::Io {
            path: path.to_path_buf(),
            source,
        })
    };
    verify_key_match(&read(cert_path)?, &read(key_path)?)
}

fn first_certificate_der(pem_text: &str) -> Result<Vec<u8>, CertificateError> {
    let chain = CertificateChain::parse(pem_text)?;
    let block =
        pem::parse(chain.leaf()).map_err(|err| CertificateError::InvalidPem(err.to_string()))?;
    Ok(block.into_contents())
}

fn certificate_key_material(cert_pem: &str) -> Result<PublicKeyMaterial, CertificateError> {
    let der = first_certificate_der(cert_pem)?;
    let (_, certificate) =
        X509Certificate::from_der(&der).map_err(|err| CertificateError::Parse(err.to_string()))?;
    let spki = certificate.public_key();
    let key_bits: &[u8] = &spki.subject_public_key.data;

    if spki.algorithm.algorithm == OID_KEY_TYPE_EC_PUBLIC_KEY {
        let curve = spki
            .algorithm
            .parameters
            .as_ref()
            .and_then(|parameters| parameters.as_oid().ok())
            .map(|oid| oid.to_id_string())
            .ok_or_else(|| CertificateError::Parse("EC key without named curve".to_owned()))?;
        Ok(PublicKeyMaterial::Ec {
            curve,
            point: key_bits.to_vec(),
        })
    } else if spki.algorithm.algorithm == OID_PKCS1_RSAENCRYPTION {
        let public = RsaPublicKey::from_pkcs1_der(key_bits)
            .map_err(|err| CertificateError::Parse(err.to_string()))?;
        Ok(PublicKeyMaterial::from_rsa(&public))
    } else {
        Err(CertificateError::Parse(format!(
            "unsupported public key algorithm {}",
            spki.algorithm.algorithm.to_id_string()
        )))
    }
}

fn private_key_material(key_pem: &str) -> Result<PublicKeyMaterial, CertificateError> {
    let block = pem::parse(key_pem).map_err(|err| CertificateError::InvalidKey(err.to_string()))?;
    match block.tag() {
        "RSA PRIVATE KEY" => {
            let key = RsaPrivateKey::from_pkcs1_der(block.contents())
                .map_err(|err| CertificateError::InvalidKey(err.to_string()))?;
            Ok(PublicKeyMaterial::from_rsa(&key.to_public_key()))
        }
        "PRIVATE KEY" => {
            if let Ok(key) = RsaPrivateKey::from_pkcs8_der(block.contents()) {
                return Ok(PublicKeyMaterial::from_rsa(&key.to_public_key()));
            }
            let key_pair = KeyPair::from_pem(key_pem)
                .map_err(|err| CertificateError::InvalidKey(err.to_string()))?;
            let algorithm = key_pair.algorithm();
            let curve = if algorithm == &rcgen::PKCS_ECDSA_P384_SHA384 {
                SECP384R1
            } else if algorithm == &rcgen::PKCS_ECDSA_P256_SHA256 {
                PRIME256V1
            } else {
                return Err(CertificateError::InvalidKey(format!(
                    "unsupported key algorithm {algorithm:?}"
                )));
            };
            Ok(PublicKeyMaterial::Ec {
                curve: curve.to_owned(),
                point: rcgen::PublicKeyData::der_bytes(&key_pair).to_vec(),
            })
        }
        other => Err(CertificateError::InvalidKey(format!(
            "unsupported key block {other}"
        ))),
    }
}
