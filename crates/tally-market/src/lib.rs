pub mod market;
pub mod order;

pub use market::Market;
pub use order::{MarketError, MarketOrder, MarketTrade};
