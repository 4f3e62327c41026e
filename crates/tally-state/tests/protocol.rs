//! End-to-end exercises of the host engine: the full post → sign → finalize
//! → balance-agreement pipeline over a real sled database.

use std::path::PathBuf;
use std::sync::Arc;

use tally_core::{
    Account, Action, AllocateSigNumRequest, BalanceAgreement, SigState, TallyError, Transaction,
    Transfer,
};
use tally_crypto::{Digest, KeyPair};
use tally_state::{LedgerDb, LedgerEngine};

// ── Harness ──────────────────────────────────────────────────────────────────

/// Deterministic test clock, ms since epoch.
struct Clock {
    ms: u64,
}

impl Clock {
    fn new() -> Self {
        // 2023-11-14, far from zero so the five-minute window never
        // underflows.
        Self {
            ms: 1_700_000_000_000,
        }
    }

    fn ms(&self) -> u64 {
        self.ms
    }

    fn us(&self) -> u64 {
        self.ms * 1_000
    }

    fn tick(&mut self) -> u64 {
        self.ms += 1_000;
        self.ms
    }
}

/// Removes the data directory after the engine above it has closed.
struct DirGuard(PathBuf);

impl Drop for DirGuard {
    fn drop(&mut self) {
        let _ = std::fs::remove_dir_all(&self.0);
    }
}

struct TestLedger {
    engine: LedgerEngine,
    // Declared after `engine` so the directory outlives the open database.
    _guard: DirGuard,
    clock: Clock,
    dan: Digest,
    scott: Digest,
    dan_corn: Digest,
    scott_corn: Digest,
}

fn open_db(dir: &PathBuf) -> Arc<LedgerDb> {
    Arc::new(LedgerDb::open(dir).expect("open ledger db"))
}

/// Host "bank", issuer dan with asset "corn", accounts for dan and scott.
fn setup(tag: &str) -> TestLedger {
    let mut clock = Clock::new();
    let dir = std::env::temp_dir().join(format!("tally_e2e_{}_{}", tag, std::process::id()));
    let _ = std::fs::remove_dir_all(&dir);

    let engine = LedgerEngine::open(open_db(&dir), "bank", clock.us()).unwrap();

    let dan = engine.create_identity("dan", "{}", clock.us()).unwrap();
    let scott = engine.create_identity("scott", "{}", clock.us()).unwrap();
    let corn = engine.create_asset("corn", "{}").unwrap();
    let note = engine
        .create_asset_note(&corn, &dan, "dan corn", "{}")
        .unwrap();

    let dan_corn = *engine.create_account(&dan, &note, clock.ms()).unwrap().id();
    let scott_corn = *engine
        .create_account(&scott, &note, clock.ms())
        .unwrap()
        .id();
    clock.tick();

    TestLedger {
        engine,
        _guard: DirGuard(dir),
        clock,
        dan,
        scott,
        dan_corn,
        scott_corn,
    }
}

/// Allocate `n` numbers and fold them into the reserved set via a balance
/// agreement, verifying the host's issuance proof along the way.
fn reserve(t: &mut TestLedger, account_id: Digest, n: u32) -> Vec<u64> {
    let resp = t
        .engine
        .allocate_signature_numbers(
            &AllocateSigNumRequest {
                account_id,
                num_new: n,
            },
            t.clock.us(),
        )
        .unwrap();
    assert_eq!(resp.new_sig_nums.len(), n as usize);

    // Owner-side check: numbers are provably host-issued.
    let proof = Account::allocation_digest(&account_id, &resp.new_sig_nums);
    assert!(t
        .engine
        .host_identity()
        .pub_verify(&proof, &resp.host_signature));

    let date = t.clock.tick();
    let ba = t
        .engine
        .sign_balance_agreement(&account_id, date, None, None, date)
        .unwrap();
    t.engine.host_accept_balance(&ba, date).unwrap();

    let account = t.engine.get_account(&account_id).unwrap();
    for num in &resp.new_sig_nums {
        assert!(account.reserved_sig_ids().contains(num));
    }
    resp.new_sig_nums
}

fn issue_transfer(t: &TestLedger, from: Digest, to: Digest, amount: i64) -> Transaction {
    Transaction::new(
        vec![Action::Transfer(Transfer { from, to, amount })],
        format!("Issue {amount} corn"),
        t.clock.ms(),
    )
    .unwrap()
}

/// Run one account's balance acceptance over everything applied.
fn accept_balance(t: &mut TestLedger, account_id: Digest) {
    let date = t.clock.tick();
    let ba = t
        .engine
        .sign_balance_agreement(&account_id, date, None, None, date)
        .unwrap();
    t.engine.host_accept_balance(&ba, date).unwrap();
}

// ── Scenarios ────────────────────────────────────────────────────────────────

#[test]
fn issue_transfer_full_lifecycle() {
    let mut t = setup("lifecycle");
    let dan_corn = t.dan_corn;
    reserve(&mut t, dan_corn, 2);
    let scott_corn = t.scott_corn;
    reserve(&mut t, scott_corn, 1);

    let trx = issue_transfer(&t, t.dan_corn, t.scott_corn, 10);
    t.engine.post_transaction(&trx, t.clock.ms()).unwrap();

    // Posted: in both inboxes, no balance effect yet.
    let (_, applied, pending) = t.engine.account_view(&t.dan_corn).unwrap();
    assert_eq!((applied, pending), (0, 0));

    // Dan signs: the delta becomes pending on dan's side.
    t.engine
        .sign_transaction(&t.dan_corn, trx.id(), SigState::Accepted, None, t.clock.ms())
        .unwrap();
    let (_, applied, pending) = t.engine.account_view(&t.dan_corn).unwrap();
    assert_eq!((applied, pending), (0, -10));

    // Scott signs: all required signers accepted → host finalizes.
    t.engine
        .sign_transaction(&t.scott_corn, trx.id(), SigState::Accepted, None, t.clock.ms())
        .unwrap();

    let stored = t.engine.get_transaction(trx.id()).unwrap();
    assert!(stored.is_signed_all());
    assert!(stored.host_signed(t.engine.host_identity()));
    assert_eq!(stored.host_note(), "Approved");

    let (dan_acct, applied, _) = t.engine.account_view(&t.dan_corn).unwrap();
    assert_eq!(applied, -10);
    assert_eq!(dan_acct.applied(), &[*trx.id()]);
    let (_, applied, _) = t.engine.account_view(&t.scott_corn).unwrap();
    assert_eq!(applied, 10);

    // Both sides fold the applied transaction into the agreed balance.
    let dan_corn = t.dan_corn;
    accept_balance(&mut t, dan_corn);
    let scott_corn = t.scott_corn;
    accept_balance(&mut t, scott_corn);

    let dan_acct = t.engine.get_account(&t.dan_corn).unwrap();
    let scott_acct = t.engine.get_account(&t.scott_corn).unwrap();
    assert_eq!(dan_acct.balance(), -10);
    assert_eq!(scott_acct.balance(), 10);
    assert!(dan_acct.applied().is_empty());

    // Mutual signatures hold for both parties.
    let dan_ident = t.engine.get_identity(&t.dan).unwrap();
    let scott_ident = t.engine.get_identity(&t.scott).unwrap();
    assert!(dan_acct.owner_signed(&dan_ident));
    assert!(dan_acct.host_signed(t.engine.host_identity()));
    assert!(scott_acct.owner_signed(&scott_ident));
    assert!(scott_acct.host_signed(t.engine.host_identity()));
}

#[test]
fn signing_without_numbers_fails() {
    let t = setup("no_numbers");

    let trx = issue_transfer(&t, t.dan_corn, t.scott_corn, 10);
    t.engine.post_transaction(&trx, t.clock.ms()).unwrap();

    let err = t
        .engine
        .sign_transaction(&t.dan_corn, trx.id(), SigState::Accepted, None, t.clock.ms())
        .unwrap_err();
    assert!(matches!(err, TallyError::NoSigNumbersAvailable));
}

#[test]
fn overdraft_rejected_at_post_unless_issuer() {
    let t = setup("overdraft");

    // Scott has zero balance and did not issue the note.
    let trx = issue_transfer(&t, t.scott_corn, t.dan_corn, 10);
    let err = t.engine.post_transaction(&trx, t.clock.ms()).unwrap_err();
    assert!(matches!(err, TallyError::InsufficientFunds { .. }));

    // Dan owns the issuing identity, so issuance may go negative.
    let trx = issue_transfer(&t, t.dan_corn, t.scott_corn, 10);
    t.engine.post_transaction(&trx, t.clock.ms()).unwrap();
}

#[test]
fn consumed_numbers_are_pruned_and_never_reissued() {
    let mut t = setup("prune");
    let dan_corn = t.dan_corn;
    let dan_nums = reserve(&mut t, dan_corn, 2);
    let scott_corn = t.scott_corn;
    let scott_nums = reserve(&mut t, scott_corn, 1);

    let trx = issue_transfer(&t, t.dan_corn, t.scott_corn, 10);
    t.engine.post_transaction(&trx, t.clock.ms()).unwrap();
    t.engine
        .sign_transaction(&t.dan_corn, trx.id(), SigState::Accepted, None, t.clock.ms())
        .unwrap();
    t.engine
        .sign_transaction(&t.scott_corn, trx.id(), SigState::Accepted, None, t.clock.ms())
        .unwrap();

    let stored = t.engine.get_transaction(trx.id()).unwrap();
    let dan_consumed = stored.get_signature_num_for(&t.dan_corn).unwrap();
    let scott_consumed = stored.get_signature_num_for(&t.scott_corn).unwrap();
    assert_eq!(dan_consumed, dan_nums[0]);
    assert_eq!(scott_consumed, scott_nums[0]);

    let dan_corn = t.dan_corn;
    accept_balance(&mut t, dan_corn);
    let scott_corn = t.scott_corn;
    accept_balance(&mut t, scott_corn);

    let dan_acct = t.engine.get_account(&t.dan_corn).unwrap();
    assert!(!dan_acct.reserved_sig_ids().contains(&dan_consumed));
    assert_eq!(dan_acct.reserved_sig_ids(), &dan_nums[1..]);
    let scott_acct = t.engine.get_account(&t.scott_corn).unwrap();
    assert!(scott_acct.reserved_sig_ids().is_empty());

    // A fresh allocation never hands the consumed number back.
    let resp = t
        .engine
        .allocate_signature_numbers(
            &AllocateSigNumRequest {
                account_id: t.dan_corn,
                num_new: 8,
            },
            t.clock.us(),
        )
        .unwrap();
    assert!(!resp.new_sig_nums.contains(&dan_consumed));
    assert!(resp.new_sig_nums.windows(2).all(|w| w[0] < w[1]));
}

#[test]
fn stale_agreement_date_rejected() {
    let mut t = setup("stale");
    let dan_corn = t.dan_corn;
    reserve(&mut t, dan_corn, 1);

    let account = t.engine.get_account(&t.dan_corn).unwrap();
    let ba = BalanceAgreement {
        account_id: t.dan_corn,
        owner_signature: tally_crypto::Signature(vec![0; 4]),
        new_date: account.balance_date() - 1,
        new_balance: None,
        new_sig_nums: None,
        applied_trx_ids: None,
        open_sig_ids: None,
        open_new_sig_ids: None,
    };
    let err = t.engine.host_accept_balance(&ba, t.clock.ms()).unwrap_err();
    assert!(matches!(err, TallyError::StaleDate { .. }));
}

#[test]
fn tampered_agreement_detected() {
    let mut t = setup("tamper");
    let dan_corn = t.dan_corn;
    reserve(&mut t, dan_corn, 2);
    let scott_corn = t.scott_corn;
    reserve(&mut t, scott_corn, 1);

    let trx = issue_transfer(&t, t.dan_corn, t.scott_corn, 10);
    t.engine.post_transaction(&trx, t.clock.ms()).unwrap();
    t.engine
        .sign_transaction(&t.dan_corn, trx.id(), SigState::Accepted, None, t.clock.ms())
        .unwrap();
    t.engine
        .sign_transaction(&t.scott_corn, trx.id(), SigState::Accepted, None, t.clock.ms())
        .unwrap();

    let date = t.clock.tick();
    let good = t
        .engine
        .sign_balance_agreement(&t.scott_corn, date, None, None, date)
        .unwrap();

    // Claimed balance disagrees with the host's recomputation.
    let mut claimed = good.clone();
    claimed.new_balance = Some(good.new_balance.unwrap() + 5);
    let err = t.engine.host_accept_balance(&claimed, date).unwrap_err();
    assert!(matches!(err, TallyError::BalanceDisagreement { expected, got }
        if got == expected + 5));

    // Signature over a different digest than the proposal describes.
    let mut shifted = good.clone();
    shifted.new_date = date + 500;
    let err = t.engine.host_accept_balance(&shifted, date + 500).unwrap_err();
    assert!(matches!(err, TallyError::InvalidSignature));

    // The untampered agreement still goes through.
    t.engine.host_accept_balance(&good, date).unwrap();
    assert_eq!(t.engine.get_account(&t.scott_corn).unwrap().balance(), 10);
}

// ── Contract details ─────────────────────────────────────────────────────────

#[test]
fn update_signature_is_idempotent() {
    let mut t = setup("idempotent");
    let dan_corn = t.dan_corn;
    reserve(&mut t, dan_corn, 1);
    let scott_corn = t.scott_corn;
    reserve(&mut t, scott_corn, 1);

    let trx = issue_transfer(&t, t.dan_corn, t.scott_corn, 10);
    t.engine.post_transaction(&trx, t.clock.ms()).unwrap();
    t.engine
        .sign_transaction(&t.dan_corn, trx.id(), SigState::Accepted, None, t.clock.ms())
        .unwrap();

    let stored = t.engine.get_transaction(trx.id()).unwrap();
    let line = stored.line_for(&t.dan_corn).unwrap().clone();

    // Byte-identical resubmission is a no-op.
    t.engine.update_signature(trx.id(), line.clone()).unwrap();
    t.engine.update_signature(trx.id(), line).unwrap();

    let stored = t.engine.get_transaction(trx.id()).unwrap();
    assert_eq!(stored.signatures().len(), 1);
    let account = t.engine.get_account(&t.dan_corn).unwrap();
    assert_eq!(account.out_box(), &[*trx.id()]);
}

#[test]
fn foreign_signature_lines_rejected() {
    let mut t = setup("foreign");
    let dan_corn = t.dan_corn;
    reserve(&mut t, dan_corn, 1);

    let trx = issue_transfer(&t, t.dan_corn, t.scott_corn, 5);
    t.engine.post_transaction(&trx, t.clock.ms()).unwrap();

    // An account outside the required set.
    let outsider = tally_crypto::digest_of(b"outsider");
    let keys = KeyPair::generate();
    let line = tally_core::SignatureLine::sign(
        trx.id(),
        outsider,
        t.clock.ms(),
        1,
        SigState::Accepted,
        None,
        &keys,
    );
    assert!(matches!(
        t.engine.update_signature(trx.id(), line),
        Err(TallyError::NotRequired(_))
    ));

    // Right account, wrong key.
    let line = tally_core::SignatureLine::sign(
        trx.id(),
        t.dan_corn,
        t.clock.ms(),
        1,
        SigState::Accepted,
        None,
        &keys,
    );
    assert!(matches!(
        t.engine.update_signature(trx.id(), line),
        Err(TallyError::InvalidSignature)
    ));

    // Right key, number the host never issued.
    let dan_keys = t.engine.db.get_keys(&t.dan).unwrap().unwrap();
    let line = tally_core::SignatureLine::sign(
        trx.id(),
        t.dan_corn,
        t.clock.ms(),
        999,
        SigState::Accepted,
        None,
        &dan_keys,
    );
    assert!(matches!(
        t.engine.update_signature(trx.id(), line),
        Err(TallyError::UnissuedSigNum(999))
    ));
}

#[test]
fn rejection_cancels_for_everyone() {
    let mut t = setup("reject");
    let dan_corn = t.dan_corn;
    reserve(&mut t, dan_corn, 1);
    let scott_corn = t.scott_corn;
    reserve(&mut t, scott_corn, 1);

    let trx = issue_transfer(&t, t.dan_corn, t.scott_corn, 10);
    t.engine.post_transaction(&trx, t.clock.ms()).unwrap();
    t.engine
        .sign_transaction(&t.dan_corn, trx.id(), SigState::Accepted, None, t.clock.ms())
        .unwrap();
    t.engine
        .sign_transaction(
            &t.scott_corn,
            trx.id(),
            SigState::Rejected,
            Some("not expecting this".into()),
            t.clock.ms(),
        )
        .unwrap();

    for id in [t.dan_corn, t.scott_corn] {
        let account = t.engine.get_account(&id).unwrap();
        assert!(account.in_box().is_empty());
        assert!(account.out_box().is_empty());
        assert!(account.applied().is_empty());
        let (_, applied, pending) = t.engine.account_view(&id).unwrap();
        assert_eq!((applied, pending), (0, 0));
    }
}

#[test]
fn double_signing_reports_consumed_number() {
    let mut t = setup("double");
    let dan_corn = t.dan_corn;
    reserve(&mut t, dan_corn, 2);

    let trx = issue_transfer(&t, t.dan_corn, t.scott_corn, 1);
    t.engine.post_transaction(&trx, t.clock.ms()).unwrap();
    t.engine
        .sign_transaction(&t.dan_corn, trx.id(), SigState::Accepted, None, t.clock.ms())
        .unwrap();

    let err = t
        .engine
        .sign_transaction(&t.dan_corn, trx.id(), SigState::Accepted, None, t.clock.ms())
        .unwrap_err();
    let stored = t.engine.get_transaction(trx.id()).unwrap();
    let consumed = stored.get_signature_num_for(&t.dan_corn).unwrap();
    assert!(matches!(err, TallyError::AlreadySigned(n) if n == consumed));
}

#[test]
fn account_confirmation_round_trip() {
    let mut t = setup("confirm");
    let dan_corn = t.dan_corn;
    reserve(&mut t, dan_corn, 1);

    let confirmation = t.engine.owner_confirmation(&t.dan_corn).unwrap();
    assert!(t.engine.confirm_account(&confirmation).unwrap());
    // Re-submitting the same confirmation is a no-op success.
    assert!(t.engine.confirm_account(&confirmation).unwrap());

    let account = t.engine.get_account(&t.dan_corn).unwrap();
    let dan_ident = t.engine.get_identity(&t.dan).unwrap();
    assert!(account.owner_signed(&dan_ident));
    assert!(account.host_signed(t.engine.host_identity()));

    // A signature over a different digest is refused.
    let keys = t.engine.db.get_keys(&t.dan).unwrap().unwrap();
    let bogus = tally_core::AccountConfirmation {
        account_id: t.dan_corn,
        owner_sig: keys.sign(&tally_crypto::digest_of(b"not the account digest")),
    };
    assert!(matches!(
        t.engine.confirm_account(&bogus),
        Err(TallyError::InvalidSignature)
    ));
}

#[test]
fn registration_and_lookup() {
    let t = setup("register");

    assert_eq!(t.engine.get_identity_by_name("dan").unwrap().id(), &t.dan);
    assert_eq!(t.engine.get_asset_by_name("corn").unwrap().name(), "corn");
    assert!(t.engine.get_identity_by_name("nobody").is_err());

    // An externally-keyed identity registers and can issue its own note.
    let keys = KeyPair::generate();
    let ident = tally_core::Identity::create(&keys, "erin", "{}", 99, 0);
    t.engine.register_identity(ident.clone()).unwrap();
    assert_eq!(t.engine.get_identity_by_name("erin").unwrap().id(), ident.id());

    let wheat = t.engine.create_asset("wheat", "{}").unwrap();
    let erin = tally_core::PrivateIdentity::from_keys(ident.clone(), keys).unwrap();
    let note = tally_core::AssetNote::issue(
        &erin,
        &t.engine.get_asset(&wheat).unwrap(),
        "erin wheat",
        "{}",
    );
    t.engine.register_asset_note(note.clone()).unwrap();
    assert_eq!(t.engine.get_asset_note(note.id()).unwrap().issuer(), ident.id());

    // A note whose issuer is unknown is refused.
    let ghost_keys = KeyPair::generate();
    let ghost = tally_core::PrivateIdentity::create(ghost_keys, "ghost", "{}", 1);
    let orphan = tally_core::AssetNote::issue(
        &ghost,
        &t.engine.get_asset(&wheat).unwrap(),
        "ghost wheat",
        "{}",
    );
    assert!(matches!(
        t.engine.register_asset_note(orphan),
        Err(TallyError::UnknownEntity { .. })
    ));

    assert!(t.engine.accounts().unwrap().len() >= 2);
}

#[test]
fn state_survives_reopen() {
    let dir = std::env::temp_dir().join(format!("tally_e2e_reopen_{}", std::process::id()));
    let _ = std::fs::remove_dir_all(&dir);
    let mut clock = Clock::new();

    let dan_corn;
    let reserved;
    let host_id;
    {
        let engine = LedgerEngine::open(open_db(&dir), "bank", clock.us()).unwrap();
        host_id = *engine.host_identity().id();
        let dan = engine.create_identity("dan", "{}", clock.us()).unwrap();
        let corn = engine.create_asset("corn", "{}").unwrap();
        let note = engine
            .create_asset_note(&corn, &dan, "dan corn", "{}")
            .unwrap();
        dan_corn = *engine.create_account(&dan, &note, clock.ms()).unwrap().id();
        clock.tick();

        let resp = engine
            .allocate_signature_numbers(
                &AllocateSigNumRequest {
                    account_id: dan_corn,
                    num_new: 2,
                },
                clock.us(),
            )
            .unwrap();
        reserved = resp.new_sig_nums;
        let date = clock.tick();
        let ba = engine
            .sign_balance_agreement(&dan_corn, date, None, None, date)
            .unwrap();
        engine.host_accept_balance(&ba, date).unwrap();
        engine.db.flush().unwrap();
    }

    {
        let engine = LedgerEngine::open(open_db(&dir), "bank", 0).unwrap();
        // Loaded from meta, not recreated.
        assert_eq!(*engine.host_identity().id(), host_id);
        let account = engine.get_account(&dan_corn).unwrap();
        assert_eq!(account.reserved_sig_ids(), &reserved[..]);
        let dan_ident = engine.get_identity(account.owner()).unwrap();
        assert!(account.owner_signed(&dan_ident));
        assert!(account.host_signed(engine.host_identity()));
    }
    let _ = std::fs::remove_dir_all(&dir);
}
