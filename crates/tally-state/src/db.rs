use std::path::Path;

use serde::de::DeserializeOwned;
use serde::Serialize;

use tally_core::{Account, Asset, AssetNote, Identity, TallyError, Transaction};
use tally_crypto::{Digest, KeyPair};

/// Persistent ledger database backed by sled (pure-Rust, no C dependencies).
///
/// Named trees, all keyed by raw 20-byte digest bytes:
///   identities   — identity id    → bincode(Identity)
///   keys         — identity id    → bincode(KeyPair)   [host-managed keys]
///   assets       — asset id       → bincode(Asset)
///   asset_notes  — note id        → bincode(AssetNote)
///   accounts     — account id     → bincode(Account)
///   transactions — transaction id → bincode(Transaction)
///   meta         — utf8 key bytes → raw bytes
///
/// Digest keys are opaque and compared bytewise; every numeric scan in the
/// protocol goes through unpacked values, never raw key order.
pub struct LedgerDb {
    _db: sled::Db,
    identities: sled::Tree,
    keys: sled::Tree,
    assets: sled::Tree,
    asset_notes: sled::Tree,
    accounts: sled::Tree,
    transactions: sled::Tree,
    meta: sled::Tree,
}

fn storage_err(e: sled::Error) -> TallyError {
    TallyError::Storage(e.to_string())
}

fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, TallyError> {
    bincode::serialize(value).map_err(|e| TallyError::Serialization(e.to_string()))
}

fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, TallyError> {
    bincode::deserialize(bytes).map_err(|e| TallyError::Serialization(e.to_string()))
}

impl LedgerDb {
    /// Open or create the ledger database at `path`.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, TallyError> {
        let db = sled::open(path).map_err(storage_err)?;
        let identities   = db.open_tree("identities").map_err(storage_err)?;
        let keys         = db.open_tree("keys").map_err(storage_err)?;
        let assets       = db.open_tree("assets").map_err(storage_err)?;
        let asset_notes  = db.open_tree("asset_notes").map_err(storage_err)?;
        let accounts     = db.open_tree("accounts").map_err(storage_err)?;
        let transactions = db.open_tree("transactions").map_err(storage_err)?;
        let meta         = db.open_tree("meta").map_err(storage_err)?;
        Ok(Self {
            _db: db,
            identities,
            keys,
            assets,
            asset_notes,
            accounts,
            transactions,
            meta,
        })
    }

    fn get_from<T: DeserializeOwned>(
        tree: &sled::Tree,
        id: &Digest,
    ) -> Result<Option<T>, TallyError> {
        match tree.get(id.as_bytes()).map_err(storage_err)? {
            Some(bytes) => Ok(Some(decode(&bytes)?)),
            None => Ok(None),
        }
    }

    fn put_into<T: Serialize>(
        tree: &sled::Tree,
        id: &Digest,
        value: &T,
    ) -> Result<(), TallyError> {
        tree.insert(id.as_bytes(), encode(value)?).map_err(storage_err)?;
        Ok(())
    }

    fn iter_all<T: DeserializeOwned>(tree: &sled::Tree) -> Result<Vec<T>, TallyError> {
        let mut out = Vec::new();
        for item in tree.iter() {
            let (_, bytes) = item.map_err(storage_err)?;
            out.push(decode(&bytes)?);
        }
        Ok(out)
    }

    // ── Identities ───────────────────────────────────────────────────────────

    pub fn get_identity(&self, id: &Digest) -> Result<Option<Identity>, TallyError> {
        Self::get_from(&self.identities, id)
    }

    pub fn put_identity(&self, ident: &Identity) -> Result<(), TallyError> {
        Self::put_into(&self.identities, ident.id(), ident)
    }

    pub fn iter_identities(&self) -> Result<Vec<Identity>, TallyError> {
        Self::iter_all(&self.identities)
    }

    pub fn identity_by_name(&self, name: &str) -> Result<Option<Identity>, TallyError> {
        for item in self.identities.iter() {
            let (_, bytes) = item.map_err(storage_err)?;
            let ident: Identity = decode(&bytes)?;
            if ident.name() == name {
                return Ok(Some(ident));
            }
        }
        Ok(None)
    }

    // ── Managed keys ─────────────────────────────────────────────────────────

    pub fn get_keys(&self, identity_id: &Digest) -> Result<Option<KeyPair>, TallyError> {
        Self::get_from(&self.keys, identity_id)
    }

    pub fn put_keys(&self, identity_id: &Digest, keys: &KeyPair) -> Result<(), TallyError> {
        Self::put_into(&self.keys, identity_id, keys)
    }

    // ── Assets / notes ───────────────────────────────────────────────────────

    pub fn get_asset(&self, id: &Digest) -> Result<Option<Asset>, TallyError> {
        Self::get_from(&self.assets, id)
    }

    pub fn put_asset(&self, asset: &Asset) -> Result<(), TallyError> {
        Self::put_into(&self.assets, asset.id(), asset)
    }

    pub fn iter_assets(&self) -> Result<Vec<Asset>, TallyError> {
        Self::iter_all(&self.assets)
    }

    pub fn asset_by_name(&self, name: &str) -> Result<Option<Asset>, TallyError> {
        Ok(self.iter_assets()?.into_iter().find(|a| a.name() == name))
    }

    pub fn get_asset_note(&self, id: &Digest) -> Result<Option<AssetNote>, TallyError> {
        Self::get_from(&self.asset_notes, id)
    }

    pub fn put_asset_note(&self, note: &AssetNote) -> Result<(), TallyError> {
        Self::put_into(&self.asset_notes, note.id(), note)
    }

    pub fn iter_asset_notes(&self) -> Result<Vec<AssetNote>, TallyError> {
        Self::iter_all(&self.asset_notes)
    }

    // ── Accounts ─────────────────────────────────────────────────────────────

    pub fn get_account(&self, id: &Digest) -> Result<Option<Account>, TallyError> {
        Self::get_from(&self.accounts, id)
    }

    pub fn put_account(&self, account: &Account) -> Result<(), TallyError> {
        Self::put_into(&self.accounts, account.id(), account)
    }

    pub fn iter_accounts(&self) -> Result<Vec<Account>, TallyError> {
        Self::iter_all(&self.accounts)
    }

    // ── Transactions ─────────────────────────────────────────────────────────

    pub fn get_transaction(&self, id: &Digest) -> Result<Option<Transaction>, TallyError> {
        Self::get_from(&self.transactions, id)
    }

    pub fn put_transaction(&self, trx: &Transaction) -> Result<(), TallyError> {
        Self::put_into(&self.transactions, trx.id(), trx)
    }

    // ── Meta ─────────────────────────────────────────────────────────────────

    pub fn put_meta(&self, key: &str, value: &[u8]) -> Result<(), TallyError> {
        self.meta.insert(key.as_bytes(), value).map_err(storage_err)?;
        Ok(())
    }

    pub fn get_meta(&self, key: &str) -> Result<Option<Vec<u8>>, TallyError> {
        self.meta
            .get(key.as_bytes())
            .map(|v| v.map(|iv| iv.to_vec()))
            .map_err(storage_err)
    }

    /// Flush all pending writes to disk.
    pub fn flush(&self) -> Result<(), TallyError> {
        self._db.flush().map_err(storage_err)?;
        Ok(())
    }
}
