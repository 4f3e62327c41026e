use serde::{Deserialize, Serialize};
use thiserror::Error;

use tally_core::{Action, OrderSide, TallyError, Transaction};
use tally_crypto::Digest;
use tally_state::LedgerEngine;

#[derive(Debug, Error)]
pub enum MarketError {
    #[error("transaction {0} is not a market offer")]
    NotAnOffer(String),

    #[error("order window [{start}, {end}] excludes now ({now})")]
    OutsideWindow { start: u64, end: u64, now: u64 },

    #[error(transparent)]
    Ledger(#[from] TallyError),
}

/// A resting order derived from an offer transaction.
///
/// The offer transaction is the order's authorization and its primary key;
/// the note ids pin the (asset, currency) pair so orders in different
/// instruments never match each other.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MarketOrder {
    pub order_trx: Digest,
    pub side: OrderSide,
    /// Asset-note id of the asset account's instrument.
    pub stock_note: Digest,
    /// Asset-note id of the currency account's instrument.
    pub cur_note: Digest,
    pub asset_account: Digest,
    pub currency_account: Digest,
    pub amount: u64,
    pub price: u64,
    pub min_unit: u64,
    pub start: u64,
    pub end: u64,
    /// amount − Σ fills
    pub unfilled: u64,
}

impl MarketOrder {
    /// Derive an order from a posted offer transaction. The first action
    /// must be an offer; the referenced accounts resolve the instrument
    /// pair.
    pub fn from_transaction(trx: &Transaction, engine: &LedgerEngine) -> Result<Self, MarketError> {
        let Some(Action::Offer(off)) = trx.actions().first() else {
            return Err(MarketError::NotAnOffer(trx.id().to_hex()));
        };

        let stock_acnt = engine.get_account(&off.asset_account)?;
        let cur_acnt = engine.get_account(&off.currency_account)?;

        Ok(Self {
            order_trx: *trx.id(),
            side: off.side,
            stock_note: *stock_acnt.note_type(),
            cur_note: *cur_acnt.note_type(),
            asset_account: off.asset_account,
            currency_account: off.currency_account,
            amount: off.amount,
            price: off.offer_price,
            min_unit: off.min_amount,
            start: off.start,
            end: off.end,
            unfilled: off.amount,
        })
    }

    pub fn in_window(&self, now_ms: u64) -> bool {
        self.start <= now_ms && now_ms <= self.end
    }
}

/// One executed fill between a buy and a sell order.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MarketTrade {
    pub buy_trx: Digest,
    pub sell_trx: Digest,
    /// The settlement transaction carrying the trade actions.
    pub fill_trx: Digest,
    pub amount: u64,
    pub price: u64,
    pub timestamp: u64,
}
