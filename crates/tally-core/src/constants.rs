/// Maximum signature numbers issued per allocation request.
pub const MAX_SIG_NUM_BATCH: u32 = 64;

/// Balance-agreement dates may lag `now` by at most this much (ms).
pub const BALANCE_AGREEMENT_WINDOW_MS: u64 = 5 * 60 * 1000;

/// Host note stamped on a transaction when every required signer accepted.
pub const HOST_NOTE_APPROVED: &str = "Approved";
