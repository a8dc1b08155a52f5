use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use rcgen::KeyPair;
use rsa::pkcs1::{DecodeRsaPrivateKey, EncodeRsaPrivateKey, LineEnding};
use rsa::pkcs8::DecodePrivateKey;
use rsa::RsaPrivateKey;
use thiserror::Error;
use tracing::{debug, info};

use crate::jws::{JwsError, RsaAccountKey};
use crate::storage::{write_pem, FileMode};

#[derive(Debug, Error)]
pub enum KeyGenerationError {
    #[error("failed to access key file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("account key is unusable: {0}")]
    AccountKey(#[from] JwsError),
    #[error("failed to encode or decode PKCS#1 RSA key: {0}")]
    Pkcs1(#[from] rsa::pkcs1::Error),
    #[error("failed to decode PKCS#8 RSA key: {0}")]
    Pkcs8(#[from] rsa::pkcs8::Error),
    #[error("certificate key operation failed: {0}")]
    Rcgen(#[from] rcgen::Error),
}

impl KeyGenerationError {
    fn io(path: &Path, source: io::Error) -> Self {
        Self::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// ECDSA P-384 key of one domain group, with the PEM it was loaded from.
pub struct CertificateKey {
    pem: String,
    key_pair: KeyPair,
}

impl CertificateKey {
    /// Generates a fresh P-384 key.
    ///
    /// # Errors
    ///
    /// Returns `KeyGenerationError::Rcgen` when the crypto backend fails.
    pub fn generate() -> Result<Self, KeyGenerationError> {
        let key_pair = KeyPair::generate_for(&rcgen::PKCS_ECDSA_P384_SHA384)?;
        Ok(Self {
            pem: key_pair.serialize_pem(),
            key_pair,
        })
    }

    /// # Errors
    ///
    /// Returns `KeyGenerationError::Rcgen` when the PEM is not a supported
    /// PKCS#8 private key.
    pub fn from_pem(pem: &str) -> Result<Self, KeyGenerationError> {
        let key_pair = KeyPair::from_pem(pem)?;
        Ok(Self {
            pem: pem.to_owned(),
            key_pair,
        })
    }

    #[must_use]
    pub fn pem(&self) -> &str {
        &self.pem
    }

    #[must_use]
    pub const fn key_pair(&self) -> &KeyPair {
        &self.key_pair
    }
}

impl fmt::Debug for CertificateKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CertificateKey")
            .field("algorithm", self.key_pair.algorithm())
            .finish_non_exhaustive()
    }
}

/// Loads the account key at `path`, or generates a 2048-bit RSA key and
/// stores it there as PKCS#1 PEM with owner-only permissions.
///
/// An existing key is never replaced.
///
/// # Errors
///
/// Returns `KeyGenerationError` when the file cannot be read or written, the
/// stored key cannot be decoded or key generation fails.
pub fn ensure_account_key(path: &Path) -> Result<RsaAccountKey, KeyGenerationError> {
    load_or_generate(path, "account", decode_account_key, || {
        let key = RsaAccountKey::generate()?;
        let pem = key.private_key().to_pkcs1_pem(LineEnding::LF)?;
        Ok((key, pem.as_str().to_owned()))
    })
}

/// Loads or generates the P-384 key of a domain group.
///
/// # Errors
///
/// Same conditions as [`ensure_account_key`].
pub fn ensure_certificate_key(path: &Path) -> Result<CertificateKey, KeyGenerationError> {
    load_or_generate(path, "certificate", CertificateKey::from_pem, || {
        let key = CertificateKey::generate()?;
        let pem = key.pem.clone();
        Ok((key, pem))
    })
}

/// Accepts both `RSA PRIVATE KEY` (PKCS#1) and `PRIVATE KEY` (PKCS#8).
fn decode_account_key(pem: &str) -> Result<RsaAccountKey, KeyGenerationError> {
    let private_key = if pem.contains("BEGIN RSA PRIVATE KEY") {
        RsaPrivateKey::from_pkcs1_pem(pem)?
    } else {
        RsaPrivateKey::from_pkcs8_pem(pem)?
    };
    Ok(RsaAccountKey::new(private_key)?)
}

fn load_or_generate<T>(
    path: &Path,
    kind: &'static str,
    decode: impl FnOnce(&str) -> Result<T, KeyGenerationError>,
    generate: impl FnOnce() -> Result<(T, String), KeyGenerationError>,
) -> Result<T, KeyGenerationError> {
    match fs::read_to_string(path) {
        Ok(pem) => {
            debug!(kind, path = %path.display(), "loading existing key");
            decode(pem.trim())
        }
        Err(err) if err.kind() == io::ErrorKind::NotFound => {
            let (key, pem) = generate()?;
            write_pem(path, &pem, FileMode::Private)
                .map_err(|source| KeyGenerationError::io(path, source))?;
            info!(kind, path = %path.display(), "generated new key");
            Ok(key)
        }
        Err(source) => Err(KeyGenerationError::io(path, source)),
    }
}
