use std::collections::BTreeMap;
use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use tally_crypto::{Digest, DigestWriter, Signature};

use crate::constants::BALANCE_AGREEMENT_WINDOW_MS;
use crate::error::TallyError;
use crate::identity::Identity;
use crate::transaction::Transaction;

/// Resolves transaction ids to transactions. Accounts keep only ids in
/// their queues; the arena holding the transactions implements this.
pub trait TransactionSource {
    fn transaction(&self, id: &Digest) -> Option<&Transaction>;
}

impl TransactionSource for BTreeMap<Digest, Transaction> {
    fn transaction(&self, id: &Digest) -> Option<&Transaction> {
        self.get(id)
    }
}

/// Digest the host countersigns after the owner has signed: H(owner_sig).
pub fn countersign_digest(sig: &Signature) -> Digest {
    let mut w = DigestWriter::new();
    w.write(sig.as_bytes());
    w.finish()
}

/// Everything derived from a proposed balance agreement before commit.
#[derive(Clone, Debug, PartialEq)]
pub struct BalanceDraft {
    pub new_balance: i64,
    pub digest: Digest,
    /// Reserved numbers after the agreement, sorted ascending.
    pub open_sig_ids: Vec<u64>,
    /// Allocated-but-unaccepted numbers remaining after the agreement.
    pub open_new_sig_ids: Vec<u64>,
}

// ── Account ──────────────────────────────────────────────────────────────────

/// The (host, owner, asset-note) triple that holds a balance.
///
/// The canonical state — `(balance, balance_date, reserved_sig_ids)` — is
/// only ever changed through the balance-agreement protocol, and the stored
/// `owner_sig`/`host_sig` always cover the digest of exactly that state.
/// The three queues hold transaction ids:
///
/// * `in_box` — posted, awaiting this signer
/// * `out_box` — signed here, awaiting the rest and the host
/// * `applied` — host-finalized, awaiting the next balance agreement
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(from = "AccountWire", into = "AccountWire")]
pub struct Account {
    id: Digest,
    host: Digest,
    owner: Digest,
    note_type: Digest,
    balance: i64,
    /// Date of the last mutual agreement, ms since epoch.
    balance_date: u64,
    /// Host-issued numbers both parties have agreed on. Strictly
    /// increasing; ordering is part of the digest.
    reserved_sig_ids: Vec<u64>,
    /// Host-issued numbers the owner has not yet accepted.
    new_sig_ids: Vec<u64>,
    owner_sig: Option<Signature>,
    host_sig: Option<Signature>,
    in_box: Vec<Digest>,
    out_box: Vec<Digest>,
    applied: Vec<Digest>,
}

#[derive(Serialize, Deserialize)]
struct AccountWire {
    host: Digest,
    owner: Digest,
    note_type: Digest,
    balance: i64,
    balance_date: u64,
    reserved_sig_ids: Vec<u64>,
    new_sig_ids: Vec<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    owner_sig: Option<Signature>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    host_sig: Option<Signature>,
    #[serde(default)]
    in_box: Vec<Digest>,
    #[serde(default)]
    out_box: Vec<Digest>,
    #[serde(default)]
    applied: Vec<Digest>,
}

impl From<AccountWire> for Account {
    fn from(w: AccountWire) -> Self {
        Account {
            id: Account::compute_id(&w.host, &w.owner, &w.note_type),
            host: w.host,
            owner: w.owner,
            note_type: w.note_type,
            balance: w.balance,
            balance_date: w.balance_date,
            reserved_sig_ids: w.reserved_sig_ids,
            new_sig_ids: w.new_sig_ids,
            owner_sig: w.owner_sig,
            host_sig: w.host_sig,
            in_box: w.in_box,
            out_box: w.out_box,
            applied: w.applied,
        }
    }
}

impl From<Account> for AccountWire {
    fn from(a: Account) -> Self {
        AccountWire {
            host: a.host,
            owner: a.owner,
            note_type: a.note_type,
            balance: a.balance,
            balance_date: a.balance_date,
            reserved_sig_ids: a.reserved_sig_ids,
            new_sig_ids: a.new_sig_ids,
            owner_sig: a.owner_sig,
            host_sig: a.host_sig,
            in_box: a.in_box,
            out_box: a.out_box,
            applied: a.applied,
        }
    }
}

impl Account {
    pub fn new(host: Digest, owner: Digest, note_type: Digest, init_date_ms: u64) -> Self {
        Self {
            id: Self::compute_id(&host, &owner, &note_type),
            host,
            owner,
            note_type,
            balance: 0,
            balance_date: init_date_ms,
            reserved_sig_ids: Vec::new(),
            new_sig_ids: Vec::new(),
            owner_sig: None,
            host_sig: None,
            in_box: Vec::new(),
            out_box: Vec::new(),
            applied: Vec::new(),
        }
    }

    /// H(host ‖ owner ‖ note_type)
    pub fn compute_id(host: &Digest, owner: &Digest, note_type: &Digest) -> Digest {
        let mut w = DigestWriter::new();
        w.write_digest(host).write_digest(owner).write_digest(note_type);
        w.finish()
    }

    pub fn id(&self) -> &Digest {
        &self.id
    }

    pub fn host(&self) -> &Digest {
        &self.host
    }

    pub fn owner(&self) -> &Digest {
        &self.owner
    }

    pub fn note_type(&self) -> &Digest {
        &self.note_type
    }

    /// Last mutually-signed balance.
    pub fn balance(&self) -> i64 {
        self.balance
    }

    pub fn balance_date(&self) -> u64 {
        self.balance_date
    }

    pub fn reserved_sig_ids(&self) -> &[u64] {
        &self.reserved_sig_ids
    }

    pub fn new_sig_ids(&self) -> &[u64] {
        &self.new_sig_ids
    }

    pub fn owner_signature(&self) -> Option<&Signature> {
        self.owner_sig.as_ref()
    }

    pub fn host_signature(&self) -> Option<&Signature> {
        self.host_sig.as_ref()
    }

    pub fn in_box(&self) -> &[Digest] {
        &self.in_box
    }

    pub fn out_box(&self) -> &[Digest] {
        &self.out_box
    }

    pub fn applied(&self) -> &[Digest] {
        &self.applied
    }

    pub fn is_valid(&self) -> bool {
        self.id == Self::compute_id(&self.host, &self.owner, &self.note_type)
    }

    // ── Balances ─────────────────────────────────────────────────────────────

    /// Balance after all host-finalized transactions: what the host will
    /// accept at the next agreement.
    pub fn applied_balance(&self, src: &impl TransactionSource) -> i64 {
        let mut b = self.balance;
        for id in &self.applied {
            if let Some(trx) = src.transaction(id) {
                b += trx.apply(&self.id);
            }
        }
        b
    }

    /// Balance after everything this signer has signed: what the owner may
    /// still commit to.
    pub fn pending_balance(&self, src: &impl TransactionSource) -> i64 {
        let mut b = self.applied_balance(src);
        for id in &self.out_box {
            if let Some(trx) = src.transaction(id) {
                b += trx.apply(&self.id);
            }
        }
        b
    }

    // ── Signature numbers ────────────────────────────────────────────────────

    /// Numbers consumed by out_box and applied transactions.
    pub fn find_used_sig_ids(&self, src: &impl TransactionSource) -> Vec<u64> {
        let mut used = Vec::with_capacity(self.reserved_sig_ids.len());
        for id in self.out_box.iter().chain(self.applied.iter()) {
            if let Some(num) = src
                .transaction(id)
                .and_then(|t| t.get_signature_num_for(&self.id))
            {
                used.push(num);
            }
        }
        used
    }

    /// Exactly `reserved_sig_ids ∖ used`.
    pub fn find_unused_sig_ids(&self, src: &impl TransactionSource) -> Vec<u64> {
        let used = self.find_used_sig_ids(src);
        self.reserved_sig_ids
            .iter()
            .copied()
            .filter(|n| !used.contains(n))
            .collect()
    }

    /// Record host-issued numbers as pending owner acceptance. The caller
    /// must have verified the host's signature over
    /// `H(account_id ‖ num₀ … numₙ)` first.
    pub fn allocate_signature_numbers(
        &mut self,
        numbers: &[u64],
        src: &impl TransactionSource,
    ) -> Result<(), TallyError> {
        let used = self.find_used_sig_ids(src);
        for n in numbers {
            if used.contains(n) {
                return Err(TallyError::SigNumInUse(*n));
            }
        }
        for n in numbers {
            if !self.new_sig_ids.contains(n) {
                self.new_sig_ids.push(*n);
            }
        }
        Ok(())
    }

    /// Digest the host signs when issuing a batch of numbers.
    pub fn allocation_digest(account_id: &Digest, numbers: &[u64]) -> Digest {
        let mut w = DigestWriter::new();
        w.write_digest(account_id);
        for n in numbers {
            w.write_u64_le(*n);
        }
        w.finish()
    }

    // ── Digests ──────────────────────────────────────────────────────────────

    /// The digest both parties sign: H(account_id ‖ balance ‖ date ‖
    /// sig_ids…). Owners recompute this independently before signing.
    pub fn agreement_digest<'a>(
        id: &Digest,
        balance: i64,
        date: u64,
        sig_ids: impl Iterator<Item = &'a u64>,
    ) -> Digest {
        let mut w = DigestWriter::new();
        w.write_digest(id).write_i64_le(balance).write_u64_le(date);
        for sid in sig_ids {
            w.write_u64_le(*sid);
        }
        w.finish()
    }

    /// Digest of the currently agreed state: everything the owner and host
    /// must agree on — id, balance, date, open signature numbers.
    pub fn get_digest(&self) -> Digest {
        Self::agreement_digest(
            &self.id,
            self.balance,
            self.balance_date,
            self.reserved_sig_ids.iter(),
        )
    }

    /// Digest of the state after folding in every applied transaction:
    /// post-application balance, used numbers removed, new numbers merged.
    pub fn applied_digest(&self, src: &impl TransactionSource) -> Digest {
        let used = self.find_used_sig_ids(src);
        let open: BTreeSet<u64> = self
            .reserved_sig_ids
            .iter()
            .copied()
            .filter(|n| !used.contains(n))
            .chain(self.new_sig_ids.iter().copied())
            .collect();
        Self::agreement_digest(
            &self.id,
            self.applied_balance(src),
            self.balance_date,
            open.iter(),
        )
    }

    pub fn owner_signed(&self, owner: &Identity) -> bool {
        match &self.owner_sig {
            Some(sig) => owner.pub_verify(&self.get_digest(), sig),
            None => false,
        }
    }

    pub fn host_signed(&self, host: &Identity) -> bool {
        match (&self.owner_sig, &self.host_sig) {
            (Some(owner_sig), Some(host_sig)) => {
                host.pub_verify(&countersign_digest(owner_sig), host_sig)
            }
            _ => false,
        }
    }

    /// Store a confirmed signature pair over the current digest. Callers
    /// verify both signatures first.
    pub fn set_signatures(&mut self, owner_sig: Signature, host_sig: Signature) {
        self.owner_sig = Some(owner_sig);
        self.host_sig = Some(host_sig);
    }

    // ── Queues ───────────────────────────────────────────────────────────────

    pub fn insert_in_box(&mut self, trx_id: Digest) {
        if !self.in_box.contains(&trx_id)
            && !self.out_box.contains(&trx_id)
            && !self.applied.contains(&trx_id)
        {
            self.in_box.push(trx_id);
        }
    }

    pub fn move_in_to_out(&mut self, trx_id: &Digest) {
        self.in_box.retain(|t| t != trx_id);
        if !self.out_box.contains(trx_id) {
            self.out_box.push(*trx_id);
        }
    }

    pub fn move_out_to_applied(&mut self, trx_id: &Digest) {
        self.out_box.retain(|t| t != trx_id);
        if !self.applied.contains(trx_id) {
            self.applied.push(*trx_id);
        }
    }

    pub fn remove_from_queues(&mut self, trx_id: &Digest) {
        self.in_box.retain(|t| t != trx_id);
        self.out_box.retain(|t| t != trx_id);
        self.applied.retain(|t| t != trx_id);
    }

    // ── Balance agreement ────────────────────────────────────────────────────

    /// Compute the post-agreement state and digest from a proposal, without
    /// committing anything.
    ///
    /// 1. `new_date` must be newer than the agreed date, not in the future,
    ///    and at most five minutes old.
    /// 2. Every chosen new number must have been issued by the host.
    /// 3. Open numbers = reserved ∪ chosen, minus the numbers consumed by
    ///    the accepted transactions.
    /// 4. New balance = agreed balance + Σ deltas of the accepted
    ///    transactions.
    pub fn accept_balance_draft(
        &self,
        new_date_ms: u64,
        new_sig_nums: &[u64],
        applied_trx_ids: &[Digest],
        src: &impl TransactionSource,
        now_ms: u64,
    ) -> Result<BalanceDraft, TallyError> {
        if new_date_ms <= self.balance_date {
            return Err(TallyError::StaleDate {
                proposed: new_date_ms,
                current: self.balance_date,
            });
        }
        if new_date_ms > now_ms {
            return Err(TallyError::FutureDate {
                proposed: new_date_ms,
                now: now_ms,
            });
        }
        if new_date_ms < now_ms.saturating_sub(BALANCE_AGREEMENT_WINDOW_MS) {
            return Err(TallyError::StaleDate {
                proposed: new_date_ms,
                current: now_ms.saturating_sub(BALANCE_AGREEMENT_WINDOW_MS),
            });
        }

        let mut open_sig_ids: BTreeSet<u64> = BTreeSet::new();
        let mut open_new_sig_ids = self.new_sig_ids.clone();
        for n in new_sig_nums {
            if !self.new_sig_ids.contains(n) {
                return Err(TallyError::UnissuedSigNum(*n));
            }
            open_new_sig_ids.retain(|m| m != n);
            open_sig_ids.insert(*n);
        }

        open_sig_ids.extend(self.reserved_sig_ids.iter().copied());

        let mut delta = 0i64;
        for id in applied_trx_ids {
            if !self.applied.contains(id) {
                return Err(TallyError::UnknownAppliedTrx(id.to_hex()));
            }
            let trx = src
                .transaction(id)
                .ok_or_else(|| TallyError::UnknownAppliedTrx(id.to_hex()))?;
            if let Some(num) = trx.get_signature_num_for(&self.id) {
                open_sig_ids.remove(&num);
            }
            delta += trx.apply(&self.id);
        }

        let new_balance = self.balance + delta;
        let digest =
            Self::agreement_digest(&self.id, new_balance, new_date_ms, open_sig_ids.iter());

        Ok(BalanceDraft {
            new_balance,
            digest,
            open_sig_ids: open_sig_ids.into_iter().collect(),
            open_new_sig_ids,
        })
    }

    /// Apply an agreed draft. All-or-nothing: callers verify signatures
    /// before calling, and nothing here can fail.
    pub fn commit_agreement(
        &mut self,
        draft: &BalanceDraft,
        new_date_ms: u64,
        applied_trx_ids: &[Digest],
        owner_sig: Signature,
        host_sig: Signature,
    ) {
        self.applied.retain(|t| !applied_trx_ids.contains(t));
        self.reserved_sig_ids = draft.open_sig_ids.clone();
        self.new_sig_ids = draft.open_new_sig_ids.clone();
        self.balance = draft.new_balance;
        self.balance_date = new_date_ms;
        self.owner_sig = Some(owner_sig);
        self.host_sig = Some(host_sig);
    }

    /// Owner-side acceptance: recompute the draft, check the host's
    /// counter-signature over H(owner_sig), check the balance the host
    /// reported, then commit.
    #[allow(clippy::too_many_arguments)]
    pub fn owner_accept_balance(
        &mut self,
        host: &Identity,
        owner_sig: Signature,
        server_sig: Signature,
        new_balance: i64,
        new_date_ms: u64,
        new_sig_nums: &[u64],
        applied_trx_ids: &[Digest],
        src: &impl TransactionSource,
        now_ms: u64,
    ) -> Result<(), TallyError> {
        let draft =
            self.accept_balance_draft(new_date_ms, new_sig_nums, applied_trx_ids, src, now_ms)?;
        if draft.new_balance != new_balance {
            return Err(TallyError::BalanceDisagreement {
                expected: draft.new_balance,
                got: new_balance,
            });
        }
        if !host.pub_verify(&countersign_digest(&owner_sig), &server_sig) {
            return Err(TallyError::InvalidSignature);
        }
        self.commit_agreement(&draft, new_date_ms, applied_trx_ids, owner_sig, server_sig);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action::{Action, Transfer};
    use tally_crypto::digest_of;

    const HOUR_MS: u64 = 3_600_000;

    fn ids() -> (Digest, Digest, Digest) {
        (digest_of(b"host"), digest_of(b"owner"), digest_of(b"note"))
    }

    fn empty_arena() -> BTreeMap<Digest, Transaction> {
        BTreeMap::new()
    }

    fn account() -> Account {
        let (h, o, n) = ids();
        Account::new(h, o, n, 1_000)
    }

    fn transfer(from: &Account, to: &Account, amount: i64, date: u64) -> Transaction {
        Transaction::new(
            vec![Action::Transfer(Transfer {
                from: *from.id(),
                to: *to.id(),
                amount,
            })],
            "t",
            date,
        )
        .unwrap()
    }

    #[test]
    fn id_matches_triple_digest() {
        let a = account();
        let (h, o, n) = ids();
        assert_eq!(*a.id(), Account::compute_id(&h, &o, &n));
        assert!(a.is_valid());
    }

    #[test]
    fn balances_over_queues() {
        let mut a = account();
        let b = Account::new(digest_of(b"host"), digest_of(b"owner2"), digest_of(b"note"), 0);
        let t1 = transfer(&b, &a, 10, 1); // +10 applied
        let t2 = transfer(&a, &b, 3, 2); // -3 pending
        let mut arena = BTreeMap::new();
        a.insert_in_box(*t1.id());
        a.move_in_to_out(t1.id());
        a.move_out_to_applied(t1.id());
        a.insert_in_box(*t2.id());
        a.move_in_to_out(t2.id());
        arena.insert(*t1.id(), t1);
        arena.insert(*t2.id(), t2);

        assert_eq!(a.balance(), 0);
        assert_eq!(a.applied_balance(&arena), 10);
        assert_eq!(a.pending_balance(&arena), 7);
    }

    #[test]
    fn balances_stable_across_serde() {
        let mut a = account();
        let b = Account::new(digest_of(b"host"), digest_of(b"owner2"), digest_of(b"note"), 0);
        let t1 = transfer(&b, &a, 10, 1);
        a.insert_in_box(*t1.id());
        a.move_in_to_out(t1.id());
        a.move_out_to_applied(t1.id());
        let mut arena = BTreeMap::new();
        arena.insert(*t1.id(), t1);

        let json = serde_json::to_string(&a).unwrap();
        let restored: Account = serde_json::from_str(&json).unwrap();
        assert_eq!(restored, a);
        assert_eq!(restored.applied_balance(&arena), a.applied_balance(&arena));
        assert_eq!(restored.pending_balance(&arena), a.pending_balance(&arena));
    }

    #[test]
    fn digest_covers_sig_id_order() {
        let mut a = account();
        let arena = empty_arena();
        a.allocate_signature_numbers(&[100, 101], &arena).unwrap();
        let draft = a
            .accept_balance_draft(HOUR_MS, &[100, 101], &[], &arena, HOUR_MS)
            .unwrap();
        let d1 = draft.digest;
        // Same numbers chosen in a different order must agree.
        let draft2 = a
            .accept_balance_draft(HOUR_MS, &[101, 100], &[], &arena, HOUR_MS)
            .unwrap();
        assert_eq!(d1, draft2.digest);
    }

    #[test]
    fn allocate_rejects_used_number() {
        let mut a = account();
        let b = Account::new(digest_of(b"host"), digest_of(b"owner2"), digest_of(b"note"), 0);
        let mut t = transfer(&a, &b, 1, 1);
        let keys = tally_crypto::KeyPair::generate();
        let line = crate::transaction::SignatureLine::sign(
            t.id(),
            *a.id(),
            1,
            100,
            crate::transaction::SigState::Accepted,
            None,
            &keys,
        );
        t.upsert_signature_line(line);
        a.insert_in_box(*t.id());
        a.move_in_to_out(t.id());
        let mut arena = BTreeMap::new();
        arena.insert(*t.id(), t);

        assert!(matches!(
            a.allocate_signature_numbers(&[100], &arena),
            Err(TallyError::SigNumInUse(100))
        ));
    }

    #[test]
    fn draft_time_bounds() {
        let a = account(); // balance_date = 1_000
        let arena = empty_arena();
        let now = 10 * HOUR_MS;
        assert!(matches!(
            a.accept_balance_draft(500, &[], &[], &arena, now),
            Err(TallyError::StaleDate { .. })
        ));
        assert!(matches!(
            a.accept_balance_draft(now + 1, &[], &[], &arena, now),
            Err(TallyError::FutureDate { .. })
        ));
        // More than five minutes behind now.
        assert!(matches!(
            a.accept_balance_draft(now - HOUR_MS, &[], &[], &arena, now),
            Err(TallyError::StaleDate { .. })
        ));
    }

    #[test]
    fn draft_rejects_unissued_number() {
        let a = account();
        let arena = empty_arena();
        assert!(matches!(
            a.accept_balance_draft(HOUR_MS, &[42], &[], &arena, HOUR_MS),
            Err(TallyError::UnissuedSigNum(42))
        ));
    }

    #[test]
    fn draft_rejects_unknown_applied_trx() {
        let a = account();
        let arena = empty_arena();
        let ghost = digest_of(b"ghost");
        assert!(matches!(
            a.accept_balance_draft(HOUR_MS, &[], &[ghost], &arena, HOUR_MS),
            Err(TallyError::UnknownAppliedTrx(_))
        ));
    }

    #[test]
    fn applied_digest_uses_post_application_state() {
        let mut a = account();
        let b = Account::new(digest_of(b"host"), digest_of(b"owner2"), digest_of(b"note"), 0);
        let arena0 = empty_arena();
        a.allocate_signature_numbers(&[100, 101], &arena0).unwrap();
        let draft = a
            .accept_balance_draft(HOUR_MS, &[100, 101], &[], &arena0, HOUR_MS)
            .unwrap();
        a.commit_agreement(&draft, HOUR_MS, &[], Signature(vec![1]), Signature(vec![2]));

        // A finalized transfer of +25 consuming number 100, plus a fresh
        // unaccepted number 200.
        let mut t = transfer(&b, &a, 25, 1);
        let keys = tally_crypto::KeyPair::generate();
        t.upsert_signature_line(crate::transaction::SignatureLine::sign(
            t.id(),
            *a.id(),
            1,
            100,
            crate::transaction::SigState::Accepted,
            None,
            &keys,
        ));
        a.insert_in_box(*t.id());
        a.move_in_to_out(t.id());
        a.move_out_to_applied(t.id());
        let mut arena = BTreeMap::new();
        arena.insert(*t.id(), t);
        a.allocate_signature_numbers(&[200], &arena).unwrap();

        // Post-application balance, number 100 removed, number 200 merged.
        let expected = Account::agreement_digest(
            a.id(),
            25,
            a.balance_date(),
            [101u64, 200].iter(),
        );
        assert_eq!(a.applied_digest(&arena), expected);
        assert_ne!(a.applied_digest(&arena), a.get_digest());
    }

    #[test]
    fn owner_accepts_countersigned_agreement() {
        let host_keys = tally_crypto::KeyPair::generate();
        let owner_keys = tally_crypto::KeyPair::generate();
        let host_ident = crate::identity::Identity::create(&host_keys, "bank", "{}", 1, 0);
        let mut a = Account::new(
            *host_ident.id(),
            owner_keys.id(),
            digest_of(b"note"),
            1_000,
        );
        let arena = empty_arena();
        a.allocate_signature_numbers(&[100], &arena).unwrap();

        let draft = a
            .accept_balance_draft(HOUR_MS, &[100], &[], &arena, HOUR_MS)
            .unwrap();
        let owner_sig = owner_keys.sign(&draft.digest);
        let server_sig = host_keys.sign(&countersign_digest(&owner_sig));

        // A counter-signature from the wrong key is refused.
        let forged = tally_crypto::KeyPair::generate().sign(&countersign_digest(&owner_sig));
        assert!(matches!(
            a.owner_accept_balance(
                &host_ident,
                owner_sig.clone(),
                forged,
                draft.new_balance,
                HOUR_MS,
                &[100],
                &[],
                &arena,
                HOUR_MS,
            ),
            Err(TallyError::InvalidSignature)
        ));

        a.owner_accept_balance(
            &host_ident,
            owner_sig,
            server_sig,
            draft.new_balance,
            HOUR_MS,
            &[100],
            &[],
            &arena,
            HOUR_MS,
        )
        .unwrap();
        assert_eq!(a.reserved_sig_ids(), &[100]);
        assert!(a.host_signed(&host_ident));
    }

    #[test]
    fn agreement_folds_applied_and_prunes_consumed_numbers() {
        let mut a = account();
        let b = Account::new(digest_of(b"host"), digest_of(b"owner2"), digest_of(b"note"), 0);
        let arena0 = empty_arena();
        a.allocate_signature_numbers(&[100, 101], &arena0).unwrap();
        // Accept both numbers into the reserved set first.
        let draft = a
            .accept_balance_draft(HOUR_MS, &[100, 101], &[], &arena0, HOUR_MS)
            .unwrap();
        a.commit_agreement(
            &draft,
            HOUR_MS,
            &[],
            Signature(vec![1]),
            Signature(vec![2]),
        );
        assert_eq!(a.reserved_sig_ids(), &[100, 101]);
        assert!(a.new_sig_ids().is_empty());

        // A finalized incoming transfer consuming number 100.
        let mut t = transfer(&b, &a, 10, 1);
        let keys = tally_crypto::KeyPair::generate();
        t.upsert_signature_line(crate::transaction::SignatureLine::sign(
            t.id(),
            *a.id(),
            1,
            100,
            crate::transaction::SigState::Accepted,
            None,
            &keys,
        ));
        a.insert_in_box(*t.id());
        a.move_in_to_out(t.id());
        a.move_out_to_applied(t.id());
        let tid = *t.id();
        let mut arena = BTreeMap::new();
        arena.insert(tid, t);

        assert_eq!(a.find_used_sig_ids(&arena), vec![100]);
        assert_eq!(a.find_unused_sig_ids(&arena), vec![101]);

        let draft = a
            .accept_balance_draft(2 * HOUR_MS, &[], &[tid], &arena, 2 * HOUR_MS)
            .unwrap();
        assert_eq!(draft.new_balance, 10);
        assert_eq!(draft.open_sig_ids, vec![101]);
        a.commit_agreement(
            &draft,
            2 * HOUR_MS,
            &[tid],
            Signature(vec![1]),
            Signature(vec![2]),
        );
        assert_eq!(a.balance(), 10);
        assert_eq!(a.reserved_sig_ids(), &[101]);
        assert!(a.applied().is_empty());
        // Strictly increasing, no duplicates.
        assert!(a.reserved_sig_ids().windows(2).all(|w| w[0] < w[1]));
    }
}
