use serde::{Deserialize, Serialize};

use tally_crypto::{digest_of, verify_signature, Digest, DigestWriter, KeyPair, PublicKey, Signature};

use crate::error::TallyError;

/// A pseudonym: a public key plus a signed self-description.
///
/// The identifier is the digest of the public key, so an identity can never
/// change keys — a key change is a new identity. The self-signature covers
/// `H(id ‖ name ‖ date ‖ properties)` and is checked at construction; an
/// `Identity` value in hand always verifies.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "IdentityWire", into = "IdentityWire")]
pub struct Identity {
    id: Digest,
    pub_key: PublicKey,
    name: String,
    /// Microseconds since epoch at self-signing time.
    date: u64,
    properties: String,
    nonce: u64,
    sig: Signature,
}

#[derive(Serialize, Deserialize)]
struct IdentityWire {
    pub_key: PublicKey,
    name: String,
    date: u64,
    properties: String,
    #[serde(default)]
    nonce: u64,
    sig: Signature,
}

impl TryFrom<IdentityWire> for Identity {
    type Error = TallyError;

    fn try_from(w: IdentityWire) -> Result<Self, TallyError> {
        Identity::from_parts(w.pub_key, w.name, w.date, w.properties, w.nonce, w.sig)
    }
}

impl From<Identity> for IdentityWire {
    fn from(i: Identity) -> Self {
        IdentityWire {
            pub_key: i.pub_key,
            name: i.name,
            date: i.date,
            properties: i.properties,
            nonce: i.nonce,
            sig: i.sig,
        }
    }
}

impl Identity {
    /// Create a self-signed identity from a keypair.
    pub fn create(
        keys: &KeyPair,
        name: impl Into<String>,
        properties: impl Into<String>,
        date_us: u64,
        nonce: u64,
    ) -> Self {
        let name = name.into();
        let properties = properties.into();
        let id = keys.id();
        let sig = keys.sign(&Self::signing_digest(&id, &name, date_us, &properties));
        Self {
            id,
            pub_key: keys.public_key().clone(),
            name,
            date: date_us,
            properties,
            nonce,
            sig,
        }
    }

    /// Import an identity with an external signature. Fails if the
    /// signature does not verify against the self-description digest.
    pub fn from_parts(
        pub_key: PublicKey,
        name: String,
        date_us: u64,
        properties: String,
        nonce: u64,
        sig: Signature,
    ) -> Result<Self, TallyError> {
        let id = digest_of(pub_key.as_bytes());
        let digest = Self::signing_digest(&id, &name, date_us, &properties);
        if verify_signature(&pub_key, &digest, &sig).is_err() {
            return Err(TallyError::InvalidIdentity(name));
        }
        Ok(Self {
            id,
            pub_key,
            name,
            date: date_us,
            properties,
            nonce,
            sig,
        })
    }

    /// H(id ‖ name ‖ date ‖ properties)
    fn signing_digest(id: &Digest, name: &str, date_us: u64, properties: &str) -> Digest {
        let mut w = DigestWriter::new();
        w.write_digest(id)
            .write(name.as_bytes())
            .write_u64_le(date_us)
            .write(properties.as_bytes());
        w.finish()
    }

    pub fn id(&self) -> &Digest {
        &self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn date(&self) -> u64 {
        self.date
    }

    pub fn properties(&self) -> &str {
        &self.properties
    }

    pub fn nonce(&self) -> u64 {
        self.nonce
    }

    pub fn pub_key(&self) -> &PublicKey {
        &self.pub_key
    }

    pub fn signature(&self) -> &Signature {
        &self.sig
    }

    /// Re-check the self-signature.
    pub fn verify(&self) -> bool {
        let digest = Self::signing_digest(&self.id, &self.name, self.date, &self.properties);
        verify_signature(&self.pub_key, &digest, &self.sig).is_ok()
    }

    /// Verify an arbitrary signature against this identity's public key.
    pub fn pub_verify(&self, digest: &Digest, sig: &Signature) -> bool {
        verify_signature(&self.pub_key, digest, sig).is_ok()
    }
}

// ── PrivateIdentity ──────────────────────────────────────────────────────────

/// An identity together with its private key. Held only by the owning
/// party and never transmitted.
#[derive(Clone, Debug)]
pub struct PrivateIdentity {
    identity: Identity,
    keys: KeyPair,
}

impl PrivateIdentity {
    pub fn create(
        keys: KeyPair,
        name: impl Into<String>,
        properties: impl Into<String>,
        date_us: u64,
    ) -> Self {
        let identity = Identity::create(&keys, name, properties, date_us, 0);
        Self { identity, keys }
    }

    pub fn from_keys(identity: Identity, keys: KeyPair) -> Result<Self, TallyError> {
        if keys.id() != *identity.id() {
            return Err(TallyError::InvalidIdentity(identity.name().to_string()));
        }
        Ok(Self { identity, keys })
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    pub fn keys(&self) -> &KeyPair {
        &self.keys
    }

    pub fn sign(&self, digest: &Digest) -> Signature {
        self.keys.sign(digest)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_and_verify() {
        let kp = KeyPair::generate();
        let ident = Identity::create(&kp, "dan", "{}", 1_700_000_000_000_000, 0);
        assert!(ident.verify());
        assert_eq!(*ident.id(), kp.id());
    }

    #[test]
    fn import_rejects_tampered_name() {
        let kp = KeyPair::generate();
        let ident = Identity::create(&kp, "dan", "{}", 1, 0);
        let err = Identity::from_parts(
            ident.pub_key().clone(),
            "mallory".into(),
            ident.date(),
            ident.properties().into(),
            ident.nonce(),
            ident.signature().clone(),
        );
        assert!(matches!(err, Err(TallyError::InvalidIdentity(_))));
    }

    #[test]
    fn serde_round_trip_preserves_id() {
        let kp = KeyPair::generate();
        let ident = Identity::create(&kp, "dan", "{\"role\":\"issuer\"}", 42, 3);
        let json = serde_json::to_string(&ident).unwrap();
        let back: Identity = serde_json::from_str(&json).unwrap();
        assert_eq!(ident, back);
        assert_eq!(ident.id(), back.id());
    }

    #[test]
    fn private_identity_key_mismatch() {
        let kp = KeyPair::generate();
        let ident = Identity::create(&kp, "dan", "{}", 1, 0);
        let other = KeyPair::generate();
        assert!(PrivateIdentity::from_keys(ident, other).is_err());
    }
}
