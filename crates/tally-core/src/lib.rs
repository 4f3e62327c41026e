pub mod account;
pub mod action;
pub mod asset;
pub mod constants;
pub mod error;
pub mod identity;
pub mod protocol;
pub mod transaction;

pub use account::{Account, BalanceDraft, TransactionSource};
pub use action::{Action, CloseTrade, Offer, OrderSide, Trade, Transfer};
pub use asset::{Asset, AssetNote};
pub use constants::*;
pub use error::TallyError;
pub use identity::{Identity, PrivateIdentity};
pub use protocol::{
    AccountConfirmation, AllocateSigNumRequest, AllocateSigNumResponse, BalanceAgreement,
    BalanceAgreementReply, PostTransactionRequest,
};
pub use transaction::{SigState, SignatureLine, Transaction};
