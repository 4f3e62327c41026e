use serde::{Deserialize, Serialize};

use tally_crypto::Digest;

use crate::error::TallyError;

/// Which side of the book an offer sits on.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderSide {
    Buy,
    Sell,
}

/// Move `amount` from one account to another. Required signers: both.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Transfer {
    pub from: Digest,
    pub to: Digest,
    pub amount: i64,
}

/// A limit order in currency-per-asset units.
///
/// While the enclosing transaction is open, `offer_price * amount` is
/// reserved against the currency account's pending balance. The time
/// window is enforced by the market matcher, not here.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Offer {
    #[serde(rename = "order_type")]
    pub side: OrderSide,
    /// Account the asset units are delivered to / taken from.
    pub asset_account: Digest,
    /// Account the currency is paid from / received into.
    pub currency_account: Digest,
    pub amount: u64,
    /// Minimal trade size.
    pub min_amount: u64,
    #[serde(rename = "price")]
    pub offer_price: u64,
    /// Validity window, ms since epoch.
    pub start: u64,
    pub end: u64,
}

/// One fill against an offer. Deltas are signed from the perspective of
/// the accounts named here.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Trade {
    /// The offer transaction (or prior trade) authorizing this fill.
    pub offer_trx: Digest,
    pub asset_account: Digest,
    pub currency_account: Digest,
    pub delta_asset: i64,
    pub delta_currency: i64,
}

/// Releases the pending reservation of the referenced offer transaction.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CloseTrade {
    pub offer_trx: Digest,
}

// ── Action ───────────────────────────────────────────────────────────────────

/// Every balance-affecting operation is one of these variants.
///
/// The wire form is the envelope `{"type": tag, "data": {…}}`; the tag set
/// is closed, so decoding happens through the enum rather than a runtime
/// factory. Unknown tags are reported as [`TallyError::UnknownAction`] by
/// [`Action::from_value`].
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum Action {
    Transfer(Transfer),
    Offer(Offer),
    Trade(Trade),
    CloseTrade(CloseTrade),
}

impl Action {
    /// Stable serialization discriminator.
    pub fn type_tag(&self) -> &'static str {
        match self {
            Action::Transfer(_) => "transfer",
            Action::Offer(_) => "offer",
            Action::Trade(_) => "trade",
            Action::CloseTrade(_) => "close_trade",
        }
    }

    /// Accounts that must sign before this action may be applied.
    pub fn required_signatures(&self) -> Vec<Digest> {
        match self {
            Action::Transfer(t) => vec![t.from, t.to],
            Action::Offer(o) => vec![o.asset_account, o.currency_account],
            Action::Trade(t) => vec![t.asset_account, t.currency_account],
            // Authorized by the offer transaction it references.
            Action::CloseTrade(_) => Vec::new(),
        }
    }

    /// Balance delta this action contributes to `account`.
    pub fn apply(&self, account: &Digest) -> i64 {
        match self {
            Action::Transfer(t) => {
                if *account == t.from {
                    -t.amount
                } else if *account == t.to {
                    t.amount
                } else {
                    0
                }
            }
            Action::Offer(o) => {
                if *account == o.currency_account {
                    -(o.offer_price as i64 * o.amount as i64)
                } else {
                    0
                }
            }
            Action::Trade(t) => {
                if *account == t.asset_account {
                    t.delta_asset
                } else if *account == t.currency_account {
                    t.delta_currency
                } else {
                    0
                }
            }
            Action::CloseTrade(_) => 0,
        }
    }

    /// Decode one wire envelope, reporting unknown tags by name.
    pub fn from_value(v: &serde_json::Value) -> Result<Action, TallyError> {
        let tag = v
            .get("type")
            .and_then(|t| t.as_str())
            .ok_or_else(|| TallyError::UnknownAction("<missing type>".into()))?;
        match tag {
            "transfer" | "offer" | "trade" | "close_trade" => {
                serde_json::from_value(v.clone()).map_err(|e| TallyError::Serialization(e.to_string()))
            }
            other => Err(TallyError::UnknownAction(other.to_string())),
        }
    }
}
