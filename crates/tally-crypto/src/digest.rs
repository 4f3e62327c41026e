use std::fmt;

use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Length of a content digest in bytes.
pub const DIGEST_LEN: usize = 20;

// ── Digest ───────────────────────────────────────────────────────────────────

/// 20-byte content digest: BLAKE3 truncated to the first 20 bytes.
///
/// Every entity in the ledger is addressed by the digest of its defining
/// fields, so two parties computing the digest of the same content always
/// arrive at the same identifier. On the wire a digest is a 40-char hex
/// string.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct Digest(pub [u8; DIGEST_LEN]);

impl Digest {
    pub fn from_bytes(b: [u8; DIGEST_LEN]) -> Self {
        Self(b)
    }

    pub fn as_bytes(&self) -> &[u8; DIGEST_LEN] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn from_hex(s: &str) -> Result<Self, hex::FromHexError> {
        let bytes = hex::decode(s)?;
        if bytes.len() != DIGEST_LEN {
            return Err(hex::FromHexError::InvalidStringLength);
        }
        let mut arr = [0u8; DIGEST_LEN];
        arr.copy_from_slice(&bytes);
        Ok(Self(arr))
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl fmt::Debug for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Digest({}…)", &self.to_hex()[..12])
    }
}

impl Serialize for Digest {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for Digest {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Digest::from_hex(&s).map_err(|e| D::Error::custom(format!("invalid digest hex: {e}")))
    }
}

// ── DigestWriter ─────────────────────────────────────────────────────────────

/// Incremental digest builder.
///
/// All multi-field digests in the protocol are produced by streaming the
/// fields through one of these: raw digest bytes for identifiers, fixed
/// little-endian encodings for integers, UTF-8 bytes for strings. Field
/// order is part of the protocol.
pub struct DigestWriter(blake3::Hasher);

impl DigestWriter {
    pub fn new() -> Self {
        Self(blake3::Hasher::new())
    }

    pub fn write(&mut self, bytes: &[u8]) -> &mut Self {
        self.0.update(bytes);
        self
    }

    pub fn write_digest(&mut self, d: &Digest) -> &mut Self {
        self.write(d.as_bytes())
    }

    pub fn write_u64_le(&mut self, v: u64) -> &mut Self {
        self.write(&v.to_le_bytes())
    }

    pub fn write_i64_le(&mut self, v: i64) -> &mut Self {
        self.write(&v.to_le_bytes())
    }

    pub fn finish(self) -> Digest {
        let full = self.0.finalize();
        let mut arr = [0u8; DIGEST_LEN];
        arr.copy_from_slice(&full.as_bytes()[..DIGEST_LEN]);
        Digest(arr)
    }
}

impl Default for DigestWriter {
    fn default() -> Self {
        Self::new()
    }
}

/// Digest of a single byte slice.
pub fn digest_of(bytes: &[u8]) -> Digest {
    let mut w = DigestWriter::new();
    w.write(bytes);
    w.finish()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn digest_is_deterministic() {
        let a = digest_of(b"tally");
        let b = digest_of(b"tally");
        assert_eq!(a, b);
        assert_ne!(a, digest_of(b"tally2"));
    }

    #[test]
    fn writer_field_order_matters() {
        let mut w1 = DigestWriter::new();
        w1.write(b"a").write_u64_le(7);
        let mut w2 = DigestWriter::new();
        w2.write_u64_le(7).write(b"a");
        assert_ne!(w1.finish(), w2.finish());
    }

    #[test]
    fn hex_round_trip() {
        let d = digest_of(b"round trip");
        let restored = Digest::from_hex(&d.to_hex()).unwrap();
        assert_eq!(d, restored);
        assert!(Digest::from_hex("abcd").is_err());
    }

    #[test]
    fn serde_uses_hex_strings() {
        let d = digest_of(b"wire");
        let json = serde_json::to_string(&d).unwrap();
        assert_eq!(json, format!("\"{}\"", d.to_hex()));
        let back: Digest = serde_json::from_str(&json).unwrap();
        assert_eq!(d, back);
    }
}
