use pqcrypto_dilithium::dilithium2;
use pqcrypto_traits::sign::{PublicKey as _, SecretKey as _};
use serde::{Deserialize, Serialize};

use crate::digest::{digest_of, Digest};
use crate::dilithium::{self, PublicKey, Signature};

/// A Dilithium2 keypair.
///
/// The secret key bytes are zeroized on drop. The derived `id()` —
/// digest of the public key — is the identity identifier used across
/// the ledger.
#[derive(Serialize, Deserialize)]
pub struct KeyPair {
    public_key: PublicKey,
    secret_key: Vec<u8>,
}

impl KeyPair {
    /// Generate a fresh Dilithium2 keypair.
    pub fn generate() -> Self {
        let (pk, sk) = dilithium2::keypair();
        Self {
            public_key: PublicKey(pk.as_bytes().to_vec()),
            secret_key: sk.as_bytes().to_vec(),
        }
    }

    /// Restore a keypair from raw bytes (e.g. loaded from a keyfile).
    pub fn from_raw(pk_bytes: Vec<u8>, sk_bytes: Vec<u8>) -> Self {
        Self {
            public_key: PublicKey(pk_bytes),
            secret_key: sk_bytes,
        }
    }

    pub fn public_key(&self) -> &PublicKey {
        &self.public_key
    }

    /// Identity identifier derived from the public key.
    pub fn id(&self) -> Digest {
        digest_of(&self.public_key.0)
    }

    /// Sign a digest with this keypair's secret key.
    pub fn sign(&self, digest: &Digest) -> Signature {
        dilithium::sign(&self.secret_key, digest)
            .expect("sign with valid secret key is infallible")
    }

    pub fn secret_key_bytes(&self) -> &[u8] {
        &self.secret_key
    }
}

impl Drop for KeyPair {
    fn drop(&mut self) {
        use zeroize::Zeroize;
        self.secret_key.zeroize();
    }
}

impl Clone for KeyPair {
    fn clone(&self) -> Self {
        Self {
            public_key: self.public_key.clone(),
            secret_key: self.secret_key.clone(),
        }
    }
}

impl std::fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "KeyPair {{ id: {:?} }}", self.id())
    }
}
