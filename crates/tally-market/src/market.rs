use std::sync::{Arc, Mutex};

use tracing::info;

use tally_core::{Action, CloseTrade, Offer, OrderSide, SigState, Trade, Transaction};
use tally_crypto::Digest;
use tally_state::LedgerEngine;

use crate::order::{MarketError, MarketOrder, MarketTrade};

/// In-memory order book over offer transactions.
///
/// Matched fills settle as trade transactions posted through the normal
/// inbox → outbox → applied pipeline; the host signs for both parties
/// (it holds both keys in this deployment). When an order fills
/// completely, a close action rides in the settlement transaction and
/// releases the offer's pending reservation atomically with the fill.
pub struct Market {
    engine: Arc<LedgerEngine>,
    book: Mutex<Vec<MarketOrder>>,
}

impl Market {
    pub fn new(engine: Arc<LedgerEngine>) -> Self {
        Self {
            engine,
            book: Mutex::new(Vec::new()),
        }
    }

    pub fn open_orders(&self) -> Vec<MarketOrder> {
        self.book.lock().unwrap().clone()
    }

    /// Build, post and sign the offer transaction for an order, then enter
    /// it into the book and run matching.
    #[allow(clippy::too_many_arguments)]
    pub fn place_order(
        &self,
        side: OrderSide,
        stock_acnt: &Digest,
        currency_acnt: &Digest,
        amount: u64,
        price: u64,
        min_unit: u64,
        start: u64,
        end: u64,
        now_ms: u64,
    ) -> Result<(Digest, Vec<MarketTrade>), MarketError> {
        let stock = self.engine.get_account(stock_acnt)?;
        let currency = self.engine.get_account(currency_acnt)?;
        let stock_note = self.engine.get_asset_note(stock.note_type())?;
        let cur_note = self.engine.get_asset_note(currency.note_type())?;

        let verb = match side {
            OrderSide::Buy => "Buy",
            OrderSide::Sell => "Sell",
        };
        let description = format!(
            "{verb} order: {amount} {} @ {price} {}",
            stock_note.name(),
            cur_note.name()
        );

        let offer = Offer {
            side,
            asset_account: *stock_acnt,
            currency_account: *currency_acnt,
            amount,
            min_amount: min_unit,
            offer_price: price,
            start,
            end,
        };
        let trx = Transaction::new(vec![Action::Offer(offer)], description, now_ms)
            .map_err(MarketError::Ledger)?;

        self.engine.post_transaction(&trx, now_ms)?;
        self.engine
            .sign_transaction(stock_acnt, trx.id(), SigState::Accepted, None, now_ms)?;
        self.engine
            .sign_transaction(currency_acnt, trx.id(), SigState::Accepted, None, now_ms)?;

        let trades = self.submit_order(&trx, now_ms)?;
        Ok((*trx.id(), trades))
    }

    /// Enter an already-posted offer transaction into the book and match
    /// it against the resting side.
    pub fn submit_order(
        &self,
        order_trx: &Transaction,
        now_ms: u64,
    ) -> Result<Vec<MarketTrade>, MarketError> {
        let order = MarketOrder::from_transaction(order_trx, &self.engine)?;
        if !order.in_window(now_ms) {
            return Err(MarketError::OutsideWindow {
                start: order.start,
                end: order.end,
                now: now_ms,
            });
        }

        let mut book = self.book.lock().unwrap();
        book.push(order.clone());
        info!(order = %order.order_trx, ?order.side, amount = order.amount, price = order.price,
              "order entered");

        let trades = self.match_order(&mut book, &order.order_trx, now_ms)?;
        book.retain(|o| o.unfilled > 0);
        Ok(trades)
    }

    /// Match one order against the opposite side, best price first.
    fn match_order(
        &self,
        book: &mut Vec<MarketOrder>,
        order_id: &Digest,
        now_ms: u64,
    ) -> Result<Vec<MarketTrade>, MarketError> {
        let mut trades = Vec::new();

        loop {
            let taker = match book.iter().find(|o| o.order_trx == *order_id) {
                Some(o) if o.unfilled > 0 => o.clone(),
                _ => break,
            };

            // Price-compatible resting orders on the other side, same
            // instrument pair, inside their window. Resting price wins.
            let mut candidates: Vec<usize> = book
                .iter()
                .enumerate()
                .filter(|(_, o)| {
                    o.side != taker.side
                        && o.order_trx != taker.order_trx
                        && o.stock_note == taker.stock_note
                        && o.cur_note == taker.cur_note
                        && o.unfilled > 0
                        && o.in_window(now_ms)
                        && match taker.side {
                            OrderSide::Buy => o.price <= taker.price,
                            OrderSide::Sell => o.price >= taker.price,
                        }
                })
                .map(|(i, _)| i)
                .collect();
            candidates.sort_by_key(|&i| match taker.side {
                OrderSide::Buy => book[i].price as i64,
                OrderSide::Sell => -(book[i].price as i64),
            });

            let Some(&best) = candidates.first() else {
                break;
            };
            let maker = book[best].clone();

            let n = taker.unfilled.min(maker.unfilled);
            if n < taker.min_unit || n < maker.min_unit {
                break;
            }
            let price = maker.price;

            let (buy, sell) = match taker.side {
                OrderSide::Buy => (&taker, &maker),
                OrderSide::Sell => (&maker, &taker),
            };

            let trade = self.settle(buy, sell, n, price, now_ms)?;
            trades.push(trade);

            for o in book.iter_mut() {
                if o.order_trx == taker.order_trx || o.order_trx == maker.order_trx {
                    o.unfilled -= n;
                }
            }
        }

        Ok(trades)
    }

    /// Post and host-sign the settlement transaction for one fill.
    fn settle(
        &self,
        buy: &MarketOrder,
        sell: &MarketOrder,
        n: u64,
        price: u64,
        now_ms: u64,
    ) -> Result<MarketTrade, MarketError> {
        let paid = (n * price) as i64;
        let mut actions = vec![
            Action::Trade(Trade {
                offer_trx: buy.order_trx,
                asset_account: buy.asset_account,
                currency_account: buy.currency_account,
                delta_asset: n as i64,
                delta_currency: -paid,
            }),
            Action::Trade(Trade {
                offer_trx: sell.order_trx,
                asset_account: sell.asset_account,
                currency_account: sell.currency_account,
                delta_asset: -(n as i64),
                delta_currency: paid,
            }),
        ];
        // Orders this fill completes are closed in the same transaction,
        // releasing their reservation when the fill finalizes.
        if buy.unfilled == n {
            actions.push(Action::CloseTrade(CloseTrade {
                offer_trx: buy.order_trx,
            }));
        }
        if sell.unfilled == n {
            actions.push(Action::CloseTrade(CloseTrade {
                offer_trx: sell.order_trx,
            }));
        }

        let trx = Transaction::new(actions, format!("Trade {n} @ {price}"), now_ms)
            .map_err(MarketError::Ledger)?;
        self.engine.post_transaction(&trx, now_ms)?;
        for account in trx.required_signatures() {
            self.engine
                .sign_transaction(&account, trx.id(), SigState::Accepted, None, now_ms)?;
        }

        info!(fill = %trx.id(), n, price, "trade settled");
        Ok(MarketTrade {
            buy_trx: buy.order_trx,
            sell_trx: sell.order_trx,
            fill_trx: *trx.id(),
            amount: n,
            price,
            timestamp: now_ms,
        })
    }
}
