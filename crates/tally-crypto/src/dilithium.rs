use std::fmt;

use pqcrypto_dilithium::dilithium2;
use pqcrypto_traits::sign::{DetachedSignature, PublicKey as _, SecretKey as _};
use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

use crate::digest::Digest;

#[derive(Debug, Error)]
pub enum SignatureError {
    #[error("invalid signature")]
    InvalidSignature,
    #[error("invalid public key length: expected {expected}, got {got}")]
    InvalidPublicKeyLength { expected: usize, got: usize },
}

// ── Key and signature material ───────────────────────────────────────────────

/// Dilithium2 public key (1312 bytes per NIST FIPS 204).
///
/// Serializes as base64; public keys and signatures travel inside JSON
/// envelopes and would triple in size as byte arrays.
#[derive(Clone, PartialEq, Eq)]
pub struct PublicKey(pub Vec<u8>);

/// Dilithium2 detached signature (2420 bytes per NIST FIPS 204).
#[derive(Clone, PartialEq, Eq)]
pub struct Signature(pub Vec<u8>);

impl PublicKey {
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl Signature {
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PublicKey({}b)", self.0.len())
    }
}

impl fmt::Debug for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Signature({}b)", self.0.len())
    }
}

macro_rules! base64_serde {
    ($ty:ty) => {
        impl Serialize for $ty {
            fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
                serializer.serialize_str(&base64::encode(&self.0))
            }
        }

        impl<'de> Deserialize<'de> for $ty {
            fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
                let s = String::deserialize(deserializer)?;
                base64::decode(&s)
                    .map(Self)
                    .map_err(|e| D::Error::custom(format!("invalid base64: {e}")))
            }
        }
    };
}

base64_serde!(PublicKey);
base64_serde!(Signature);

// ── Operations ───────────────────────────────────────────────────────────────

/// Sign a digest with a Dilithium2 secret key. Returns a detached signature.
pub fn sign(secret_key_bytes: &[u8], digest: &Digest) -> Result<Signature, SignatureError> {
    let sk = dilithium2::SecretKey::from_bytes(secret_key_bytes)
        .map_err(|_| SignatureError::InvalidSignature)?;
    let sig = dilithium2::detached_sign(digest.as_bytes(), &sk);
    Ok(Signature(sig.as_bytes().to_vec()))
}

/// Verify a detached Dilithium2 signature over a digest.
pub fn verify_signature(
    public_key: &PublicKey,
    digest: &Digest,
    signature: &Signature,
) -> Result<(), SignatureError> {
    let pk = dilithium2::PublicKey::from_bytes(&public_key.0).map_err(|_| {
        SignatureError::InvalidPublicKeyLength {
            expected: dilithium2::public_key_bytes(),
            got: public_key.0.len(),
        }
    })?;
    let sig = dilithium2::DetachedSignature::from_bytes(&signature.0)
        .map_err(|_| SignatureError::InvalidSignature)?;
    dilithium2::verify_detached_signature(&sig, digest.as_bytes(), &pk)
        .map_err(|_| SignatureError::InvalidSignature)
}
