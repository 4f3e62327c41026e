use serde::{Deserialize, Serialize};

use tally_crypto::{Digest, DigestWriter, Signature};

use crate::error::TallyError;
use crate::identity::{Identity, PrivateIdentity};

/// A global, immutable asset class. Identifier: H(name ‖ properties).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(from = "AssetWire", into = "AssetWire")]
pub struct Asset {
    id: Digest,
    name: String,
    properties: String,
}

#[derive(Serialize, Deserialize)]
struct AssetWire {
    name: String,
    properties: String,
}

impl From<AssetWire> for Asset {
    fn from(w: AssetWire) -> Self {
        Asset::new(w.name, w.properties)
    }
}

impl From<Asset> for AssetWire {
    fn from(a: Asset) -> Self {
        AssetWire {
            name: a.name,
            properties: a.properties,
        }
    }
}

impl Asset {
    pub fn new(name: impl Into<String>, properties: impl Into<String>) -> Self {
        let name = name.into();
        let properties = properties.into();
        let mut w = DigestWriter::new();
        w.write(name.as_bytes()).write(properties.as_bytes());
        Self {
            id: w.finish(),
            name,
            properties,
        }
    }

    pub fn id(&self) -> &Digest {
        &self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn properties(&self) -> &str {
        &self.properties
    }
}

// ── AssetNote ────────────────────────────────────────────────────────────────

/// An issuer's signed promise to honor an asset: identity *I* issues asset
/// *A* under a note name and properties. Identifier:
/// H(issuer ‖ asset ‖ name ‖ properties); valid iff the issuer signature
/// verifies against that identifier.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(from = "AssetNoteWire", into = "AssetNoteWire")]
pub struct AssetNote {
    id: Digest,
    issuer: Digest,
    asset: Digest,
    name: String,
    properties: String,
    issuer_sig: Signature,
}

#[derive(Serialize, Deserialize)]
struct AssetNoteWire {
    issuer: Digest,
    asset: Digest,
    name: String,
    properties: String,
    issuer_sig: Signature,
}

impl From<AssetNoteWire> for AssetNote {
    fn from(w: AssetNoteWire) -> Self {
        let id = AssetNote::compute_id(&w.issuer, &w.asset, &w.name, &w.properties);
        AssetNote {
            id,
            issuer: w.issuer,
            asset: w.asset,
            name: w.name,
            properties: w.properties,
            issuer_sig: w.issuer_sig,
        }
    }
}

impl From<AssetNote> for AssetNoteWire {
    fn from(n: AssetNote) -> Self {
        AssetNoteWire {
            issuer: n.issuer,
            asset: n.asset,
            name: n.name,
            properties: n.properties,
            issuer_sig: n.issuer_sig,
        }
    }
}

impl AssetNote {
    /// Issue a note: the issuer self-signs the identifier.
    pub fn issue(
        issuer: &PrivateIdentity,
        asset: &Asset,
        name: impl Into<String>,
        properties: impl Into<String>,
    ) -> Self {
        let name = name.into();
        let properties = properties.into();
        let id = Self::compute_id(issuer.identity().id(), asset.id(), &name, &properties);
        let issuer_sig = issuer.sign(&id);
        Self {
            id,
            issuer: *issuer.identity().id(),
            asset: *asset.id(),
            name,
            properties,
            issuer_sig,
        }
    }

    /// Import a note with an external issuer signature; the signature must
    /// verify against the recomputed identifier.
    pub fn import(
        issuer: &Identity,
        asset: &Asset,
        name: impl Into<String>,
        properties: impl Into<String>,
        issuer_sig: Signature,
    ) -> Result<Self, TallyError> {
        let name = name.into();
        let properties = properties.into();
        let id = Self::compute_id(issuer.id(), asset.id(), &name, &properties);
        if !issuer.pub_verify(&id, &issuer_sig) {
            return Err(TallyError::InvalidAssetNote(name));
        }
        Ok(Self {
            id,
            issuer: *issuer.id(),
            asset: *asset.id(),
            name,
            properties,
            issuer_sig,
        })
    }

    fn compute_id(issuer: &Digest, asset: &Digest, name: &str, properties: &str) -> Digest {
        let mut w = DigestWriter::new();
        w.write_digest(issuer)
            .write_digest(asset)
            .write(name.as_bytes())
            .write(properties.as_bytes());
        w.finish()
    }

    pub fn id(&self) -> &Digest {
        &self.id
    }

    pub fn issuer(&self) -> &Digest {
        &self.issuer
    }

    pub fn asset(&self) -> &Digest {
        &self.asset
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn properties(&self) -> &str {
        &self.properties
    }

    pub fn signature(&self) -> &Signature {
        &self.issuer_sig
    }

    /// True iff the stored signature verifies against the identifier.
    pub fn verify(&self, issuer: &Identity) -> bool {
        *issuer.id() == self.issuer && issuer.pub_verify(&self.id, &self.issuer_sig)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tally_crypto::KeyPair;

    fn issuer() -> PrivateIdentity {
        PrivateIdentity::create(KeyPair::generate(), "dan", "{}", 1)
    }

    #[test]
    fn issue_produces_valid_note() {
        let dan = issuer();
        let corn = Asset::new("corn", "{}");
        let note = AssetNote::issue(&dan, &corn, "dan corn", "{}");
        assert!(note.verify(dan.identity()));
        assert_eq!(note.asset(), corn.id());
    }

    #[test]
    fn import_rejects_foreign_signature() {
        let dan = issuer();
        let eve = PrivateIdentity::create(KeyPair::generate(), "eve", "{}", 1);
        let corn = Asset::new("corn", "{}");
        let note = AssetNote::issue(&dan, &corn, "dan corn", "{}");
        let err = AssetNote::import(
            eve.identity(),
            &corn,
            "dan corn",
            "{}",
            note.signature().clone(),
        );
        assert!(matches!(err, Err(TallyError::InvalidAssetNote(_))));
    }

    #[test]
    fn note_id_depends_on_issuer() {
        let a = issuer();
        let b = issuer();
        let corn = Asset::new("corn", "{}");
        let na = AssetNote::issue(&a, &corn, "corn", "{}");
        let nb = AssetNote::issue(&b, &corn, "corn", "{}");
        assert_ne!(na.id(), nb.id());
    }
}
