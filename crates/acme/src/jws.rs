use std::fmt;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use rand_core::{CryptoRng, RngCore};
use rsa::errors::Error as RsaError;
use rsa::pkcs1v15::SigningKey as RsaSigningKey;
use rsa::traits::PublicKeyParts;
use rsa::{RsaPrivateKey, RsaPublicKey};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use signature::{Error as SignatureError, Keypair, SignatureEncoding, Signer};
use thiserror::Error;
use url::Url;

use crate::nonce::ReplayNonce;

/// Errors raised while producing an ACME JWS.
#[derive(Debug, Error)]
pub enum JwsError {
    /// The `kid` binding was empty.
    #[error("ACME kid value must not be empty")]
    EmptyKid,
    /// The JSON payload could not be serialized.
    #[error("failed to serialize ACME JWS payload: {0}")]
    SerializePayload(#[from] serde_json::Error),
    /// The RSA account key is invalid.
    #[error("invalid ACME RSA account key: {0}")]
    InvalidRsaKey(#[from] RsaError),
    /// Signing failed.
    #[error("failed to sign ACME JWS: {0}")]
    Signature(#[from] SignatureError),
}

/// Flattened JWS body posted to ACME endpoints.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AcmeJws {
    pub protected: String,
    pub payload: String,
    pub signature: String,
}

/// Key reference carried by the protected header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyBinding<'a> {
    /// Account URL of an already registered account.
    Kid(&'a str),
    /// Embedded public key, only used by `newAccount`.
    Jwk,
}

/// RSA public key in JWK form.
///
/// Members are declared in lexicographic order so that the compact JSON
/// serialization is the RFC 7638 canonical form.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RsaJwk {
    pub e: String,
    pub kty: String,
    pub n: String,
}

impl RsaJwk {
    #[must_use]
    pub fn from_public_key(key: &RsaPublicKey) -> Self {
        let encode = |value: &rsa::BigUint| URL_SAFE_NO_PAD.encode(value.to_bytes_be());
        Self {
            e: encode(key.e()),
            kty: "RSA".to_owned(),
            n: encode(key.n()),
        }
    }

    /// base64url SHA-256 of the canonical JWK (RFC 7638).
    #[must_use]
    pub fn thumbprint(&self) -> String {
        let canonical = format!(
            r#"{{"e":"{}","kty":"{}","n":"{}"}}"#,
            self.e, self.kty, self.n
        );
        URL_SAFE_NO_PAD.encode(Sha256::digest(canonical.as_bytes()))
    }
}

/// RSA PKCS#1 v1.5 (RS256) ACME account key.
#[derive(Clone)]
pub struct RsaAccountKey {
    signer: RsaSigningKey<Sha256>,
}

impl fmt::Debug for RsaAccountKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RsaAccountKey")
            .field("thumbprint", &self.jwk_thumbprint())
            .finish_non_exhaustive()
    }
}

impl RsaAccountKey {
    /// `alg` value of every protected header.
    pub const ALGORITHM: &'static str = "RS256";
    pub const DEFAULT_MODULUS_BITS: usize = 2048;

    /// Fresh 2048-bit key from the operating system RNG.
    ///
    /// # Errors
    ///
    /// Returns `JwsError::InvalidRsaKey` when prime generation fails.
    pub fn generate() -> Result<Self, JwsError> {
        Self::generate_with_rng(Self::DEFAULT_MODULUS_BITS, &mut rand_core::OsRng)
    }

    /// # Errors
    ///
    /// Returns `JwsError::InvalidRsaKey` when prime generation fails.
    pub fn generate_with_rng(
        bits: usize,
        rng: &mut (impl CryptoRng + RngCore),
    ) -> Result<Self, JwsError> {
        Self::new(RsaPrivateKey::new(rng, bits)?)
    }

    /// # Errors
    ///
    /// Returns `JwsError::InvalidRsaKey` when the key fails validation.
    pub fn new(private_key: RsaPrivateKey) -> Result<Self, JwsError> {
        private_key.validate()?;
        Ok(Self {
            signer: RsaSigningKey::new(private_key),
        })
    }

    #[must_use]
    pub fn private_key(&self) -> &RsaPrivateKey {
        self.signer.as_ref()
    }

    #[must_use]
    pub fn verifying_key(&self) -> rsa::pkcs1v15::VerifyingKey<Sha256> {
        self.signer.verifying_key()
    }

    #[must_use]
    pub fn jwk(&self) -> RsaJwk {
        RsaJwk::from_public_key(&self.private_key().to_public_key())
    }

    #[must_use]
    pub fn jwk_thumbprint(&self) -> String {
        self.jwk().thumbprint()
    }

    /// Signs raw payload bytes. An empty payload is the POST-as-GET form.
    ///
    /// # Errors
    ///
    /// Returns `JwsError` when the `kid` is blank or signing fails.
    pub fn sign_payload(
        &self,
        payload: &[u8],
        nonce: &ReplayNonce,
        url: &Url,
        binding: KeyBinding<'_>,
    ) -> Result<AcmeJws, JwsError> {
        let header = match binding {
            KeyBinding::Kid(kid) => {
                let kid = kid.trim();
                if kid.is_empty() {
                    return Err(JwsError::EmptyKid);
                }
                ProtectedHeader::new(nonce, url, HeaderKey::Kid(kid))
            }
            KeyBinding::Jwk => ProtectedHeader::new(nonce, url, HeaderKey::Jwk(self.jwk())),
        };

        let protected = URL_SAFE_NO_PAD.encode(serde_json::to_vec(&header)?);
        let payload = URL_SAFE_NO_PAD.encode(payload);
        let signature = self
            .signer
            .try_sign(format!("{protected}.{payload}").as_bytes())?;

        Ok(AcmeJws {
            protected,
            payload,
            signature: URL_SAFE_NO_PAD.encode(signature.to_bytes()),
        })
    }

    /// # Errors
    ///
    /// Returns `JwsError` when serialization or signing fails.
    pub fn sign_json<T: Serialize>(
        &self,
        payload: &T,
        nonce: &ReplayNonce,
        url: &Url,
        binding: KeyBinding<'_>,
    ) -> Result<AcmeJws, JwsError> {
        self.sign_payload(&serde_json::to_vec(payload)?, nonce, url, binding)
    }
}

#[derive(Serialize)]
#[serde(rename_all = "lowercase")]
enum HeaderKey<'a> {
    Kid(&'a str),
    Jwk(RsaJwk),
}

#[derive(Serialize)]
struct ProtectedHeader<'a> {
    alg: &'static str,
    nonce: &'a str,
    url: &'a str,
    #[serde(flatten)]
    key: HeaderKey<'a>,
}

impl<'a> ProtectedHeader<'a> {
    fn new(nonce: &'a ReplayNonce, url: &'a Url, key: HeaderKey<'a>) -> Self {
        Self {
            alg: RsaAccountKey::ALGORITHM,
            nonce: nonce.as_str(),
            url: url.as_str(),
            key,
        }
    }
}
