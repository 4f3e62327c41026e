//! Message structures exchanged at the system boundary.
//!
//! These are the JSON bodies collaborators (RPC transport, wallet)
//! replicate; optional fields are omitted from the wire when absent.

use serde::{Deserialize, Serialize};

use tally_crypto::{Digest, Signature};

use crate::transaction::Transaction;

/// Owner asks the host to issue a fresh batch of signature numbers.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AllocateSigNumRequest {
    pub account_id: Digest,
    /// Capped at [`crate::constants::MAX_SIG_NUM_BATCH`].
    pub num_new: u32,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AllocateSigNumResponse {
    pub new_sig_nums: Vec<u64>,
    /// Last agreed balance date, ms.
    pub old_balance_date: u64,
    /// Date the host proposes for the next agreement, ms.
    pub new_balance_date: u64,
    /// host.sign(H(account_id ‖ num₀ … numₙ)) — proves the numbers were
    /// issued by the host.
    pub host_signature: Signature,
}

/// Owner's counter-signature on the account digest after reviewing host
/// changes.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AccountConfirmation {
    pub account_id: Digest,
    pub owner_sig: Signature,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PostTransactionRequest {
    pub account_id: Digest,
    pub transaction: Transaction,
}

/// Owner-signed proposal to fold applied transactions into the agreed
/// balance. Omitted optional fields mean "everything currently applied
/// and every allocated number"; when present they narrow the agreement
/// and help localize a disagreement.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BalanceAgreement {
    pub account_id: Digest,
    pub owner_signature: Signature,
    /// Proposed agreement date, ms.
    pub new_date: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub new_balance: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub new_sig_nums: Option<Vec<u64>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub applied_trx_ids: Option<Vec<Digest>>,
    /// Owner's view of the post-agreement reserved set (diagnostic).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub open_sig_ids: Option<Vec<u64>>,
    /// Owner's view of the remaining unaccepted set (diagnostic).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub open_new_sig_ids: Option<Vec<u64>>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BalanceAgreementReply {
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_account_signature: Option<Signature>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use tally_crypto::digest_of;

    #[test]
    fn optional_fields_are_omitted() {
        let ba = BalanceAgreement {
            account_id: digest_of(b"acct"),
            owner_signature: Signature(vec![1, 2, 3]),
            new_date: 42,
            new_balance: None,
            new_sig_nums: None,
            applied_trx_ids: None,
            open_sig_ids: None,
            open_new_sig_ids: None,
        };
        let v = serde_json::to_value(&ba).unwrap();
        assert!(v.get("new_balance").is_none());
        assert!(v.get("open_sig_ids").is_none());
        let back: BalanceAgreement = serde_json::from_value(v).unwrap();
        assert_eq!(back.new_date, 42);
    }
}
