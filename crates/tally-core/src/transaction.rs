use std::collections::BTreeSet;
use std::fmt;

use serde::{Deserialize, Serialize};

use tally_crypto::{Digest, DigestWriter, KeyPair, Signature};

use crate::action::Action;
use crate::constants::HOST_NOTE_APPROVED;
use crate::error::TallyError;
use crate::identity::PrivateIdentity;

// ── Signature lines ──────────────────────────────────────────────────────────

/// Outcome a signer attaches to a transaction.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum SigState {
    Accepted,
    Rejected,
}

impl fmt::Display for SigState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SigState::Accepted => write!(f, "Accepted"),
            SigState::Rejected => write!(f, "Rejected"),
        }
    }
}

/// One required signer's verdict on a transaction.
///
/// The signature covers `H(trx_id ‖ account_id ‖ date ‖ sig_num ‖ state ‖
/// note)`, so a line cannot be replayed against another transaction or
/// with a different signature number. A line is only ever replaced whole.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SignatureLine {
    pub account_id: Digest,
    /// Signing time, ms since epoch.
    pub date: u64,
    /// The reserved signature number this line consumes.
    pub sig_num: u64,
    pub state: SigState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
    pub sig: Signature,
}

impl SignatureLine {
    /// Build and sign a line for `trx_id` with the owner's keys.
    #[allow(clippy::too_many_arguments)]
    pub fn sign(
        trx_id: &Digest,
        account_id: Digest,
        date: u64,
        sig_num: u64,
        state: SigState,
        note: Option<String>,
        keys: &KeyPair,
    ) -> Self {
        let mut line = Self {
            account_id,
            date,
            sig_num,
            state,
            note,
            sig: Signature(Vec::new()),
        };
        line.sig = keys.sign(&line.digest(trx_id));
        line
    }

    /// The digest this line's signature covers.
    pub fn digest(&self, trx_id: &Digest) -> Digest {
        let mut w = DigestWriter::new();
        w.write_digest(trx_id)
            .write_digest(&self.account_id)
            .write_u64_le(self.date)
            .write_u64_le(self.sig_num)
            .write(self.state.to_string().as_bytes());
        if let Some(note) = &self.note {
            w.write(note.as_bytes());
        }
        w.finish()
    }
}

// ── Transaction ──────────────────────────────────────────────────────────────

/// A set of actions that are applied atomically once every required
/// account has signed and the host has countersigned.
///
/// The identifier is `H(trx_date ‖ canonical_json(actions))` and is
/// therefore invariant under signature collection; only the action list
/// and date pin it down. Wire form:
///
/// ```json
/// {
///   "date": 1700000000000,
///   "description": "Issue 10 corn",
///   "actions": [ {"type": "transfer", "data": {…}} ],
///   "signatures": [ … ],
///   "host_note": "Approved",
///   "host_sig": "base64"
/// }
/// ```
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "TransactionWire", into = "TransactionWire")]
pub struct Transaction {
    id: Digest,
    trx_date: u64,
    description: String,
    actions: Vec<Action>,
    signatures: Vec<SignatureLine>,
    host_note: String,
    host_sig: Option<Signature>,
}

#[derive(Serialize, Deserialize)]
struct TransactionWire {
    date: u64,
    description: String,
    actions: Vec<Action>,
    #[serde(default)]
    signatures: Vec<SignatureLine>,
    #[serde(default)]
    host_note: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    host_sig: Option<Signature>,
}

impl TryFrom<TransactionWire> for Transaction {
    type Error = TallyError;

    fn try_from(w: TransactionWire) -> Result<Self, TallyError> {
        let id = Transaction::compute_id(w.date, &w.actions)?;
        Ok(Transaction {
            id,
            trx_date: w.date,
            description: w.description,
            actions: w.actions,
            signatures: w.signatures,
            host_note: w.host_note,
            host_sig: w.host_sig,
        })
    }
}

impl From<Transaction> for TransactionWire {
    fn from(t: Transaction) -> Self {
        TransactionWire {
            date: t.trx_date,
            description: t.description,
            actions: t.actions,
            signatures: t.signatures,
            host_note: t.host_note,
            host_sig: t.host_sig,
        }
    }
}

impl Transaction {
    pub fn new(
        actions: Vec<Action>,
        description: impl Into<String>,
        trx_date_ms: u64,
    ) -> Result<Self, TallyError> {
        let id = Self::compute_id(trx_date_ms, &actions)?;
        Ok(Self {
            id,
            trx_date: trx_date_ms,
            description: description.into(),
            actions,
            signatures: Vec::new(),
            host_note: String::new(),
            host_sig: None,
        })
    }

    /// H(trx_date ‖ canonical_json(actions))
    fn compute_id(trx_date: u64, actions: &[Action]) -> Result<Digest, TallyError> {
        let canonical =
            serde_json::to_string(actions).map_err(|e| TallyError::Serialization(e.to_string()))?;
        let mut w = DigestWriter::new();
        w.write_u64_le(trx_date).write(canonical.as_bytes());
        Ok(w.finish())
    }

    /// Decode a JSON envelope, surfacing unknown action tags by name
    /// before the enum decoder turns them into opaque errors.
    pub fn from_json(v: &serde_json::Value) -> Result<Self, TallyError> {
        if let Some(actions) = v.get("actions").and_then(|a| a.as_array()) {
            for envelope in actions {
                Action::from_value(envelope)?;
            }
        }
        serde_json::from_value(v.clone()).map_err(|e| TallyError::Serialization(e.to_string()))
    }

    pub fn id(&self) -> &Digest {
        &self.id
    }

    pub fn trx_date(&self) -> u64 {
        self.trx_date
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn actions(&self) -> &[Action] {
        &self.actions
    }

    pub fn signatures(&self) -> &[SignatureLine] {
        &self.signatures
    }

    pub fn host_note(&self) -> &str {
        &self.host_note
    }

    pub fn host_signature(&self) -> Option<&Signature> {
        self.host_sig.as_ref()
    }

    /// Deduplicated union of every action's required signers, in account-id
    /// order (ordering keeps digests reproducible).
    pub fn required_signatures(&self) -> Vec<Digest> {
        let set: BTreeSet<Digest> = self
            .actions
            .iter()
            .flat_map(|a| a.required_signatures())
            .collect();
        set.into_iter().collect()
    }

    /// Balance delta of applying this transaction to `account`.
    pub fn apply(&self, account: &Digest) -> i64 {
        self.actions.iter().map(|a| a.apply(account)).sum()
    }

    /// The signature number `account` consumed when signing, if any.
    pub fn get_signature_num_for(&self, account: &Digest) -> Option<u64> {
        self.signatures
            .iter()
            .find(|l| l.account_id == *account)
            .map(|l| l.sig_num)
    }

    pub fn line_for(&self, account: &Digest) -> Option<&SignatureLine> {
        self.signatures.iter().find(|l| l.account_id == *account)
    }

    pub fn is_signed_by(&self, account: &Digest) -> bool {
        self.line_for(account)
            .map(|l| l.state == SigState::Accepted)
            .unwrap_or(false)
    }

    /// True once every required account has an Accepted line.
    pub fn is_signed_all(&self) -> bool {
        self.required_signatures()
            .iter()
            .all(|a| self.is_signed_by(a))
    }

    /// Replace the line for the account, or append if absent.
    pub fn upsert_signature_line(&mut self, line: SignatureLine) {
        match self
            .signatures
            .iter_mut()
            .find(|l| l.account_id == line.account_id)
        {
            Some(existing) => *existing = line,
            None => self.signatures.push(line),
        }
    }

    /// H(sig₀ ‖ … ‖ sigₙ ‖ host_note) over the lines in collection order.
    pub fn host_digest(&self) -> Digest {
        let mut w = DigestWriter::new();
        for line in &self.signatures {
            w.write(line.sig.as_bytes());
        }
        w.write(self.host_note.as_bytes());
        w.finish()
    }

    /// Host approval: stamps the note and signs the host digest.
    pub fn sign_host(&mut self, host: &PrivateIdentity) {
        self.host_note = HOST_NOTE_APPROVED.to_string();
        self.host_sig = Some(host.sign(&self.host_digest()));
    }

    /// Check the stored host signature against the host's identity.
    pub fn host_signed(&self, host: &crate::identity::Identity) -> bool {
        match &self.host_sig {
            Some(sig) => host.pub_verify(&self.host_digest(), sig),
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action::Transfer;
    use tally_crypto::digest_of;

    fn acct(tag: &str) -> Digest {
        digest_of(tag.as_bytes())
    }

    fn transfer_trx() -> Transaction {
        Transaction::new(
            vec![Action::Transfer(Transfer {
                from: acct("dan"),
                to: acct("scott"),
                amount: 10,
            })],
            "Issue 10 corn",
            1_700_000_000_000,
        )
        .unwrap()
    }

    #[test]
    fn id_invariant_under_signature_lines() {
        let mut trx = transfer_trx();
        let before = *trx.id();
        let keys = KeyPair::generate();
        let line = SignatureLine::sign(&before, acct("dan"), 1, 100, SigState::Accepted, None, &keys);
        trx.upsert_signature_line(line);
        assert_eq!(before, *trx.id());
    }

    #[test]
    fn required_signatures_deduplicated_and_ordered() {
        let trx = Transaction::new(
            vec![
                Action::Transfer(Transfer {
                    from: acct("dan"),
                    to: acct("scott"),
                    amount: 1,
                }),
                Action::Transfer(Transfer {
                    from: acct("scott"),
                    to: acct("dan"),
                    amount: 2,
                }),
            ],
            "swap",
            5,
        )
        .unwrap();
        let req = trx.required_signatures();
        assert_eq!(req.len(), 2);
        assert!(req.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn apply_sums_action_deltas() {
        let trx = transfer_trx();
        assert_eq!(trx.apply(&acct("dan")), -10);
        assert_eq!(trx.apply(&acct("scott")), 10);
        assert_eq!(trx.apply(&acct("nobody")), 0);
    }

    #[test]
    fn json_round_trip_recomputes_same_id() {
        let trx = transfer_trx();
        let json = serde_json::to_value(&trx).unwrap();
        assert_eq!(json["date"], 1_700_000_000_000u64);
        let back = Transaction::from_json(&json).unwrap();
        assert_eq!(trx.id(), back.id());
    }

    #[test]
    fn unknown_action_in_envelope() {
        let v = serde_json::json!({
            "date": 1, "description": "",
            "actions": [ {"type": "mint", "data": {}} ],
        });
        assert!(matches!(
            Transaction::from_json(&v),
            Err(TallyError::UnknownAction(tag)) if tag == "mint"
        ));
    }

    #[test]
    fn signature_line_digest_binds_fields() {
        let trx = transfer_trx();
        let keys = KeyPair::generate();
        let line = SignatureLine::sign(
            trx.id(),
            acct("dan"),
            7,
            100,
            SigState::Accepted,
            Some("ok".into()),
            &keys,
        );
        let mut tampered = line.clone();
        tampered.sig_num = 101;
        assert_ne!(line.digest(trx.id()), tampered.digest(trx.id()));
        // Same fields → same digest.
        assert_eq!(line.digest(trx.id()), line.clone().digest(trx.id()));
    }

    #[test]
    fn host_signature_verifies() {
        let mut trx = transfer_trx();
        let host = PrivateIdentity::create(KeyPair::generate(), "bank", "{}", 1);
        let keys = KeyPair::generate();
        let trx_id = *trx.id();
        trx.upsert_signature_line(SignatureLine::sign(
            &trx_id,
            acct("dan"),
            1,
            100,
            SigState::Accepted,
            None,
            &keys,
        ));
        trx.sign_host(&host);
        assert_eq!(trx.host_note(), HOST_NOTE_APPROVED);
        assert!(trx.host_signed(host.identity()));
    }

    #[test]
    fn bincode_round_trip() {
        let mut trx = transfer_trx();
        let host = PrivateIdentity::create(KeyPair::generate(), "bank", "{}", 1);
        trx.sign_host(&host);
        let bytes = bincode::serialize(&trx).unwrap();
        let back: Transaction = bincode::deserialize(&bytes).unwrap();
        assert_eq!(trx, back);
    }
}
