use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use tracing::{info, warn};

use tally_core::account::countersign_digest;
use tally_core::{
    Account, AccountConfirmation, Action, AllocateSigNumRequest, AllocateSigNumResponse, Asset,
    AssetNote, BalanceAgreement, BalanceAgreementReply, Identity, PrivateIdentity, SigState,
    SignatureLine, TallyError, Transaction, MAX_SIG_NUM_BATCH,
};
use tally_crypto::{Digest, KeyPair};

use crate::db::LedgerDb;

/// The host-side ledger engine.
///
/// Every public operation runs under one session lock: load the entities it
/// touches, validate, mutate in memory, then persist. The lock is the
/// per-account critical section — balance agreement, signature insertion
/// and queue moves are atomic with respect to each other, and cross-account
/// moves never interleave.
///
/// The engine also holds keys for identities it created (the original
/// deployment model: one node managing host and local owner identities), so
/// it can sign on behalf of either side of an account it administers.
pub struct LedgerEngine {
    pub db: Arc<LedgerDb>,
    host: PrivateIdentity,
    session: Mutex<()>,
}

const META_HOST_ID: &str = "host_id";

impl LedgerEngine {
    /// Open the engine over a database, loading the host identity or
    /// creating it on first run.
    pub fn open(db: Arc<LedgerDb>, host_name: &str, now_us: u64) -> Result<Self, TallyError> {
        let host = match db.get_meta(META_HOST_ID)? {
            Some(raw) => {
                let id = Digest::from_hex(
                    std::str::from_utf8(&raw)
                        .map_err(|e| TallyError::Serialization(e.to_string()))?,
                )
                .map_err(|e| TallyError::Serialization(e.to_string()))?;
                let identity = db
                    .get_identity(&id)?
                    .ok_or_else(|| TallyError::unknown("identity", id))?;
                let keys = db
                    .get_keys(&id)?
                    .ok_or_else(|| TallyError::unknown("private identity", id))?;
                info!(host = %identity.name(), id = %id, "loaded host identity");
                PrivateIdentity::from_keys(identity, keys)?
            }
            None => {
                let keys = KeyPair::generate();
                let host = PrivateIdentity::create(keys, host_name, "{}", now_us);
                db.put_identity(host.identity())?;
                db.put_keys(host.identity().id(), host.keys())?;
                db.put_meta(META_HOST_ID, host.identity().id().to_hex().as_bytes())?;
                db.flush()?;
                info!(host = %host_name, id = %host.identity().id(), "created host identity");
                host
            }
        };
        Ok(Self {
            db,
            host,
            session: Mutex::new(()),
        })
    }

    pub fn host_identity(&self) -> &Identity {
        self.host.identity()
    }

    // ── Loaders ──────────────────────────────────────────────────────────────

    fn load_identity(&self, id: &Digest) -> Result<Identity, TallyError> {
        self.db
            .get_identity(id)?
            .ok_or_else(|| TallyError::unknown("identity", id))
    }

    fn load_asset(&self, id: &Digest) -> Result<Asset, TallyError> {
        self.db
            .get_asset(id)?
            .ok_or_else(|| TallyError::unknown("asset", id))
    }

    fn load_asset_note(&self, id: &Digest) -> Result<AssetNote, TallyError> {
        self.db
            .get_asset_note(id)?
            .ok_or_else(|| TallyError::unknown("asset note", id))
    }

    fn load_account(&self, id: &Digest) -> Result<Account, TallyError> {
        self.db
            .get_account(id)?
            .ok_or_else(|| TallyError::unknown("account", id))
    }

    fn load_transaction(&self, id: &Digest) -> Result<Transaction, TallyError> {
        self.db
            .get_transaction(id)?
            .ok_or_else(|| TallyError::unknown("transaction", id))
    }

    fn load_managed_keys(&self, identity_id: &Digest) -> Result<KeyPair, TallyError> {
        self.db
            .get_keys(identity_id)?
            .ok_or_else(|| TallyError::unknown("private identity", identity_id))
    }

    /// Resolve every transaction referenced by the account's queues.
    fn queue_txs(&self, account: &Account) -> Result<BTreeMap<Digest, Transaction>, TallyError> {
        let mut txs = BTreeMap::new();
        for id in account
            .in_box()
            .iter()
            .chain(account.out_box())
            .chain(account.applied())
        {
            txs.insert(*id, self.load_transaction(id)?);
        }
        Ok(txs)
    }

    // ── Registration ─────────────────────────────────────────────────────────

    /// Create a host-managed identity (keys stay with the engine).
    pub fn create_identity(
        &self,
        name: &str,
        properties: &str,
        now_us: u64,
    ) -> Result<Digest, TallyError> {
        let _g = self.session.lock().unwrap();
        let keys = KeyPair::generate();
        let ident = Identity::create(&keys, name, properties, now_us, 0);
        let id = *ident.id();
        self.db.put_keys(&id, &keys)?;
        self.db.put_identity(&ident)?;
        info!(name = %name, id = %id, "created identity");
        Ok(id)
    }

    /// Register an externally created identity.
    pub fn register_identity(&self, ident: Identity) -> Result<(), TallyError> {
        let _g = self.session.lock().unwrap();
        if !ident.verify() {
            return Err(TallyError::InvalidIdentity(ident.name().to_string()));
        }
        self.db.put_identity(&ident)
    }

    pub fn create_asset(&self, name: &str, properties: &str) -> Result<Digest, TallyError> {
        let _g = self.session.lock().unwrap();
        let asset = Asset::new(name, properties);
        self.db.put_asset(&asset)?;
        Ok(*asset.id())
    }

    /// Issue an asset note on behalf of a managed issuer identity.
    pub fn create_asset_note(
        &self,
        asset_id: &Digest,
        issuer_id: &Digest,
        name: &str,
        properties: &str,
    ) -> Result<Digest, TallyError> {
        let _g = self.session.lock().unwrap();
        let asset = self.load_asset(asset_id)?;
        let issuer_ident = self.load_identity(issuer_id)?;
        let issuer_keys = self.load_managed_keys(issuer_id)?;
        let issuer = PrivateIdentity::from_keys(issuer_ident, issuer_keys)?;
        let note = AssetNote::issue(&issuer, &asset, name, properties);
        self.db.put_asset_note(&note)?;
        info!(note = %note.id(), issuer = %issuer_id, "issued asset note");
        Ok(*note.id())
    }

    /// Register a note issued elsewhere; the issuer must be known and the
    /// signature must verify.
    pub fn register_asset_note(&self, note: AssetNote) -> Result<(), TallyError> {
        let _g = self.session.lock().unwrap();
        let issuer = self.load_identity(note.issuer())?;
        if !note.verify(&issuer) {
            return Err(TallyError::InvalidAssetNote(note.name().to_string()));
        }
        self.db.put_asset_note(&note)
    }

    // ── Lookups ──────────────────────────────────────────────────────────────

    pub fn get_identity(&self, id: &Digest) -> Result<Identity, TallyError> {
        self.load_identity(id)
    }

    pub fn get_identity_by_name(&self, name: &str) -> Result<Identity, TallyError> {
        self.db
            .identity_by_name(name)?
            .ok_or_else(|| TallyError::unknown("identity", name))
    }

    pub fn identities(&self) -> Result<Vec<Identity>, TallyError> {
        self.db.iter_identities()
    }

    pub fn get_asset(&self, id: &Digest) -> Result<Asset, TallyError> {
        self.load_asset(id)
    }

    pub fn get_asset_by_name(&self, name: &str) -> Result<Asset, TallyError> {
        self.db
            .asset_by_name(name)?
            .ok_or_else(|| TallyError::unknown("asset", name))
    }

    pub fn get_asset_note(&self, id: &Digest) -> Result<AssetNote, TallyError> {
        self.load_asset_note(id)
    }

    pub fn asset_notes(&self) -> Result<Vec<AssetNote>, TallyError> {
        self.db.iter_asset_notes()
    }

    pub fn get_account(&self, id: &Digest) -> Result<Account, TallyError> {
        self.load_account(id)
    }

    pub fn accounts(&self) -> Result<Vec<Account>, TallyError> {
        self.db.iter_accounts()
    }

    pub fn get_transaction(&self, id: &Digest) -> Result<Transaction, TallyError> {
        self.load_transaction(id)
    }

    /// Account plus derived balances, for display surfaces.
    pub fn account_view(&self, id: &Digest) -> Result<(Account, i64, i64), TallyError> {
        let account = self.load_account(id)?;
        let txs = self.queue_txs(&account)?;
        let applied = account.applied_balance(&txs);
        let pending = account.pending_balance(&txs);
        Ok((account, applied, pending))
    }

    // ── Accounts ─────────────────────────────────────────────────────────────

    /// Create (or return) the account for `(host, owner, note)`. The owner
    /// confirms separately; until then the account carries no signatures.
    pub fn create_account(
        &self,
        owner_id: &Digest,
        note_id: &Digest,
        now_ms: u64,
    ) -> Result<Account, TallyError> {
        let _g = self.session.lock().unwrap();
        self.load_identity(owner_id)?;
        self.load_asset_note(note_id)?;
        let account = Account::new(*self.host.identity().id(), *owner_id, *note_id, now_ms);
        if let Some(existing) = self.db.get_account(account.id())? {
            return Ok(existing);
        }
        self.db.put_account(&account)?;
        info!(account = %account.id(), owner = %owner_id, "created account");
        Ok(account)
    }

    /// Owner counter-signs the current account digest; the host counters
    /// with H(owner_sig).
    pub fn confirm_account(&self, c: &AccountConfirmation) -> Result<bool, TallyError> {
        let _g = self.session.lock().unwrap();
        let mut account = self.load_account(&c.account_id)?;
        if account.owner_signature() == Some(&c.owner_sig) {
            return Ok(true);
        }
        let owner = self.load_identity(account.owner())?;
        if !owner.pub_verify(&account.get_digest(), &c.owner_sig) {
            return Err(TallyError::InvalidSignature);
        }
        let host_sig = self.host.sign(&countersign_digest(&c.owner_sig));
        account.set_signatures(c.owner_sig.clone(), host_sig);
        self.db.put_account(&account)?;
        info!(account = %c.account_id, "account confirmed");
        Ok(true)
    }

    /// Owner-side convenience for accounts whose keys this engine manages:
    /// produce the confirmation counter-signature.
    pub fn owner_confirmation(&self, account_id: &Digest) -> Result<AccountConfirmation, TallyError> {
        let account = self.load_account(account_id)?;
        let keys = self.load_managed_keys(account.owner())?;
        Ok(AccountConfirmation {
            account_id: *account_id,
            owner_sig: keys.sign(&account.get_digest()),
        })
    }

    // ── Signature numbers ────────────────────────────────────────────────────

    /// Issue a batch of single-use signature numbers.
    ///
    /// Numbers are microsecond timestamps plus offset, strictly greater
    /// than anything already issued, capped at 64 per request. They enter
    /// `new_sig_ids` and become reserved at the next balance agreement.
    pub fn allocate_signature_numbers(
        &self,
        req: &AllocateSigNumRequest,
        now_us: u64,
    ) -> Result<AllocateSigNumResponse, TallyError> {
        let _g = self.session.lock().unwrap();
        let mut account = self.load_account(&req.account_id)?;
        let txs = self.queue_txs(&account)?;

        let count = req.num_new.min(MAX_SIG_NUM_BATCH) as u64;
        let floor = account
            .reserved_sig_ids()
            .iter()
            .chain(account.new_sig_ids())
            .copied()
            .max()
            .map(|m| m + 1)
            .unwrap_or(0);
        let base = now_us.max(floor);
        let numbers: Vec<u64> = (0..count).map(|i| base + i).collect();

        account.allocate_signature_numbers(&numbers, &txs)?;
        let host_signature = self
            .host
            .sign(&Account::allocation_digest(account.id(), &numbers));
        self.db.put_account(&account)?;
        info!(account = %req.account_id, count, "allocated signature numbers");

        Ok(AllocateSigNumResponse {
            new_sig_nums: numbers,
            old_balance_date: account.balance_date(),
            new_balance_date: now_us / 1_000,
            host_signature,
        })
    }

    // ── Transactions ─────────────────────────────────────────────────────────

    /// Post a transaction to every required signer's inbox.
    ///
    /// Admission checks: the date must not be in the future, every required
    /// account must exist, and no account may be pushed below zero pending
    /// balance — except an account whose owner issued the asset note
    /// (issuance is how units enter circulation).
    pub fn post_transaction(&self, trx: &Transaction, now_ms: u64) -> Result<(), TallyError> {
        let _g = self.session.lock().unwrap();
        if trx.trx_date() > now_ms {
            return Err(TallyError::FutureDate {
                proposed: trx.trx_date(),
                now: now_ms,
            });
        }

        let required = trx.required_signatures();
        let mut accounts: BTreeMap<Digest, Account> = BTreeMap::new();
        for id in &required {
            accounts.insert(*id, self.load_account(id)?);
        }

        for account in accounts.values() {
            let delta = trx.apply(account.id());
            if delta >= 0 {
                continue;
            }
            // Trades drawing on an offer this account still has open are
            // pre-authorized by the offer's reservation.
            let covered_by_offer = trx.actions().iter().any(|a| {
                matches!(a, Action::Trade(tr)
                    if (tr.asset_account == *account.id() || tr.currency_account == *account.id())
                        && account.out_box().contains(&tr.offer_trx))
            });
            if covered_by_offer {
                continue;
            }
            let txs = self.queue_txs(account)?;
            let pending = account.pending_balance(&txs);
            if pending + delta < 0 {
                let note = self.load_asset_note(account.note_type())?;
                if note.issuer() != account.owner() {
                    return Err(TallyError::InsufficientFunds {
                        account: account.id().to_hex(),
                        delta,
                        pending,
                    });
                }
            }
        }

        for account in accounts.values_mut() {
            account.insert_in_box(*trx.id());
        }

        self.db.put_transaction(trx)?;
        for account in accounts.values() {
            self.db.put_account(account)?;
        }
        info!(trx = %trx.id(), signers = required.len(), "posted transaction");
        Ok(())
    }

    /// Sign a posted transaction on behalf of a managed account owner,
    /// consuming the lowest unused reserved number.
    pub fn sign_transaction(
        &self,
        account_id: &Digest,
        trx_id: &Digest,
        state: SigState,
        note: Option<String>,
        now_ms: u64,
    ) -> Result<(), TallyError> {
        let _g = self.session.lock().unwrap();
        let account = self.load_account(account_id)?;
        let trx = self.load_transaction(trx_id)?;
        let keys = self.load_managed_keys(account.owner())?;

        if let Some(existing) = trx.line_for(account_id) {
            if existing.state == SigState::Accepted {
                return Err(TallyError::AlreadySigned(existing.sig_num));
            }
        }

        let sig_num = match state {
            SigState::Accepted => {
                let txs = self.queue_txs(&account)?;
                *account
                    .find_unused_sig_ids(&txs)
                    .first()
                    .ok_or(TallyError::NoSigNumbersAvailable)?
            }
            // A rejection consumes nothing.
            SigState::Rejected => 0,
        };

        let line = SignatureLine::sign(trx_id, *account_id, now_ms, sig_num, state, note, &keys);
        self.update_signature_inner(trx_id, line)
    }

    /// Apply a signature line supplied by an owner.
    pub fn update_signature(&self, trx_id: &Digest, line: SignatureLine) -> Result<(), TallyError> {
        let _g = self.session.lock().unwrap();
        self.update_signature_inner(trx_id, line)
    }

    fn update_signature_inner(
        &self,
        trx_id: &Digest,
        line: SignatureLine,
    ) -> Result<(), TallyError> {
        let mut trx = self.load_transaction(trx_id)?;
        let tid = *trx.id();
        let required = trx.required_signatures();
        if !required.contains(&line.account_id) {
            return Err(TallyError::NotRequired(line.account_id.to_hex()));
        }

        let mut accounts: BTreeMap<Digest, Account> = BTreeMap::new();
        for id in &required {
            accounts.insert(*id, self.load_account(id)?);
        }

        let signer = &accounts[&line.account_id];
        let owner = self.load_identity(signer.owner())?;

        if let Some(existing) = trx.line_for(&line.account_id) {
            if *existing == line {
                return Ok(());
            }
            if existing.state == SigState::Accepted && existing.sig_num != line.sig_num {
                return Err(TallyError::AlreadySigned(existing.sig_num));
            }
        }

        if !owner.pub_verify(&line.digest(&tid), &line.sig) {
            return Err(TallyError::InvalidSignature);
        }

        match line.state {
            SigState::Rejected => {
                // A rejected required signer makes the transaction
                // unfillable; drop it from every participant's queues.
                warn!(trx = %tid, account = %line.account_id, "transaction rejected by signer");
                trx.upsert_signature_line(line);
                for account in accounts.values_mut() {
                    account.remove_from_queues(&tid);
                }
            }
            SigState::Accepted => {
                let txs = self.queue_txs(signer)?;
                if !signer.reserved_sig_ids().contains(&line.sig_num) {
                    return Err(TallyError::UnissuedSigNum(line.sig_num));
                }
                // The number this transaction already consumed stays valid
                // when the line is being replaced.
                let mut used = signer.find_used_sig_ids(&txs);
                if let Some(own) = trx.get_signature_num_for(signer.id()) {
                    used.retain(|n| *n != own);
                }
                if used.contains(&line.sig_num) {
                    return Err(TallyError::SigNumInUse(line.sig_num));
                }

                let signer_id = line.account_id;
                trx.upsert_signature_line(line);
                accounts
                    .get_mut(&signer_id)
                    .expect("signer loaded above")
                    .move_in_to_out(&tid);

                // Offers stay in the outbox as a pending reservation until a
                // close releases them; everything else finalizes once the
                // last required signer has accepted.
                let is_offer = trx.actions().iter().any(|a| matches!(a, Action::Offer(_)));
                if trx.is_signed_all() && !is_offer {
                    trx.sign_host(&self.host);
                    for account in accounts.values_mut() {
                        account.move_out_to_applied(&tid);
                    }
                    self.release_closed_offers(&trx, &mut accounts)?;
                    info!(trx = %tid, "transaction approved and applied");
                }
            }
        }

        for account in accounts.values() {
            self.db.put_account(account)?;
        }
        self.db.put_transaction(&trx)?;
        Ok(())
    }

    /// Remove offer transactions referenced by CloseTrade actions from
    /// their signers' queues, releasing the pending reservation.
    fn release_closed_offers(
        &self,
        trx: &Transaction,
        accounts: &mut BTreeMap<Digest, Account>,
    ) -> Result<(), TallyError> {
        use std::collections::btree_map::Entry;

        for action in trx.actions() {
            let Action::CloseTrade(close) = action else {
                continue;
            };
            let offer_trx = self.load_transaction(&close.offer_trx)?;
            for id in offer_trx.required_signatures() {
                let account = match accounts.entry(id) {
                    Entry::Occupied(e) => e.into_mut(),
                    Entry::Vacant(e) => e.insert(self.load_account(&id)?),
                };
                account.remove_from_queues(&close.offer_trx);
            }
        }
        Ok(())
    }

    // ── Balance agreement ────────────────────────────────────────────────────

    /// Host-side acceptance of an owner-signed balance agreement.
    pub fn host_accept_balance(
        &self,
        ba: &BalanceAgreement,
        now_ms: u64,
    ) -> Result<BalanceAgreementReply, TallyError> {
        let _g = self.session.lock().unwrap();
        let mut account = self.load_account(&ba.account_id)?;
        let owner = self.load_identity(account.owner())?;
        let txs = self.queue_txs(&account)?;

        // Omitted subsets mean the full sets: every applied transaction and
        // every allocated number (host-initiated flow).
        let applied_ids = ba
            .applied_trx_ids
            .clone()
            .unwrap_or_else(|| account.applied().to_vec());
        let new_nums = ba
            .new_sig_nums
            .clone()
            .unwrap_or_else(|| account.new_sig_ids().to_vec());

        let draft =
            account.accept_balance_draft(ba.new_date, &new_nums, &applied_ids, &txs, now_ms)?;

        if let Some(claimed) = ba.new_balance {
            if claimed != draft.new_balance {
                if let Some(owner_open) = &ba.open_sig_ids {
                    if *owner_open != draft.open_sig_ids {
                        warn!(
                            account = %ba.account_id,
                            "open sig id sets diverge: owner {:?} vs host {:?}",
                            owner_open, draft.open_sig_ids
                        );
                    }
                }
                return Err(TallyError::BalanceDisagreement {
                    expected: draft.new_balance,
                    got: claimed,
                });
            }
        }

        if !owner.pub_verify(&draft.digest, &ba.owner_signature) {
            return Err(TallyError::InvalidSignature);
        }

        let host_sig = self.host.sign(&countersign_digest(&ba.owner_signature));
        account.commit_agreement(
            &draft,
            ba.new_date,
            &applied_ids,
            ba.owner_signature.clone(),
            host_sig.clone(),
        );
        self.db.put_account(&account)?;
        info!(
            account = %ba.account_id,
            balance = account.balance(),
            reserved = account.reserved_sig_ids().len(),
            "balance agreement committed"
        );

        Ok(BalanceAgreementReply {
            status: "accepted".to_string(),
            server_account_signature: Some(host_sig),
        })
    }

    /// Owner-side convenience for managed accounts: draft and sign a
    /// balance agreement over the given subsets (or everything, when
    /// omitted).
    pub fn sign_balance_agreement(
        &self,
        account_id: &Digest,
        new_date_ms: u64,
        new_sig_nums: Option<Vec<u64>>,
        applied_trx_ids: Option<Vec<Digest>>,
        now_ms: u64,
    ) -> Result<BalanceAgreement, TallyError> {
        let _g = self.session.lock().unwrap();
        let account = self.load_account(account_id)?;
        let keys = self.load_managed_keys(account.owner())?;
        let txs = self.queue_txs(&account)?;

        let applied_ids = applied_trx_ids.unwrap_or_else(|| account.applied().to_vec());
        let new_nums = new_sig_nums.unwrap_or_else(|| account.new_sig_ids().to_vec());

        let draft =
            account.accept_balance_draft(new_date_ms, &new_nums, &applied_ids, &txs, now_ms)?;
        let owner_signature = keys.sign(&draft.digest);

        Ok(BalanceAgreement {
            account_id: *account_id,
            owner_signature,
            new_date: new_date_ms,
            new_balance: Some(draft.new_balance),
            new_sig_nums: Some(new_nums),
            applied_trx_ids: Some(applied_ids),
            open_sig_ids: Some(draft.open_sig_ids.clone()),
            open_new_sig_ids: Some(draft.open_new_sig_ids),
        })
    }
}
