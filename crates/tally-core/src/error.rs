use thiserror::Error;

#[derive(Debug, Error)]
pub enum TallyError {
    // ── Cryptographic validation ─────────────────────────────────────────────
    #[error("invalid signature")]
    InvalidSignature,

    #[error("invalid identity: {0}")]
    InvalidIdentity(String),

    #[error("invalid asset note: {0}")]
    InvalidAssetNote(String),

    // ── Entity resolution ────────────────────────────────────────────────────
    #[error("unknown {kind}: {id}")]
    UnknownEntity { kind: &'static str, id: String },

    #[error("unknown action type: {0}")]
    UnknownAction(String),

    #[error("unknown applied transaction: {0}")]
    UnknownAppliedTrx(String),

    // ── Signature-number protocol ────────────────────────────────────────────
    #[error("signature number {0} is currently in use")]
    SigNumInUse(u64),

    #[error("signature number {0} was not issued by the host")]
    UnissuedSigNum(u64),

    #[error("no reserved signature numbers available")]
    NoSigNumbersAvailable,

    #[error("account already signed with number {0}")]
    AlreadySigned(u64),

    // ── Balance agreement ────────────────────────────────────────────────────
    #[error("balance date {proposed} is not newer than the agreed date {current}")]
    StaleDate { proposed: u64, current: u64 },

    #[error("date {proposed} is in the future (now: {now})")]
    FutureDate { proposed: u64, now: u64 },

    #[error("balance disagreement: host calculated {expected}, owner calculated {got}")]
    BalanceDisagreement { expected: i64, got: i64 },

    // ── Transaction admission ────────────────────────────────────────────────
    #[error("insufficient funds in account {account}: delta {delta} against pending {pending}")]
    InsufficientFunds {
        account: String,
        delta: i64,
        pending: i64,
    },

    #[error("signature from account {0} not required")]
    NotRequired(String),

    // ── Serialization / storage ──────────────────────────────────────────────
    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("storage error: {0}")]
    Storage(String),
}

impl TallyError {
    pub fn unknown(kind: &'static str, id: impl ToString) -> Self {
        TallyError::UnknownEntity {
            kind,
            id: id.to_string(),
        }
    }
}
