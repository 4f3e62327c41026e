use serde::{Deserialize, Serialize};

use tally_core::OrderSide;

/// Account state plus derived balances, digests rendered as hex.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RpcAccount {
    pub account_id: String,
    pub host: String,
    pub owner: String,
    pub note_type: String,
    pub balance: i64,
    pub balance_date: u64,
    pub applied_balance: i64,
    pub pending_balance: i64,
    pub reserved_sig_ids: Vec<u64>,
    pub new_sig_ids: Vec<u64>,
    pub owner_signed: bool,
    pub host_signed: bool,
    pub in_box: Vec<String>,
    pub out_box: Vec<String>,
    pub applied: Vec<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RpcBalance {
    pub balance: i64,
    pub applied_balance: i64,
    pub pending_balance: i64,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RpcIdentity {
    pub id: String,
    pub name: String,
    pub date: u64,
    pub properties: String,
    pub nonce: u64,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RpcAssetNote {
    pub id: String,
    pub issuer: String,
    pub asset: String,
    pub name: String,
    pub properties: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RpcOrderRequest {
    pub side: OrderSide,
    pub stock_account: String,
    pub currency_account: String,
    pub amount: u64,
    pub price: u64,
    pub min_unit: u64,
    /// Validity window, ms since epoch.
    pub start: u64,
    pub end: u64,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RpcTrade {
    pub buy_trx: String,
    pub sell_trx: String,
    pub fill_trx: String,
    pub amount: u64,
    pub price: u64,
    pub timestamp: u64,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RpcOrderResult {
    pub order_trx: String,
    pub trades: Vec<RpcTrade>,
}
