//! Per-instrument worker state.
//!
//! An `Instrument` is owned by exactly one gateway worker for its whole
//! lifetime; nothing here is shared across tasks.

use std::collections::HashMap;

use crate::market_data::{L2Depth, Trade};
use crate::subscription::Subscription;

/// A tradable pair at one venue plus the mutable state its worker drives.
///
/// The id counters advance strictly before the matching insert, and
/// `exch_trade_id` is written on the same advance as `trade_id`.
#[derive(Debug, Clone)]
pub struct Instrument {
    pub exchange_name: String,
    pub instmt_name: String,
    pub instmt_code: String,

    pub l2_depth: L2Depth,
    pub prev_l2_depth: L2Depth,
    /// Latest emitted trade, carried into every snapshot upsert.
    pub last_trade: Trade,

    /// Local monotonic order-book row id, advanced on every emitted book.
    pub order_book_id: i64,
    /// Local monotonic trade row id.
    pub trade_id: i64,
    /// Venue-reported id of the last emitted trade, used for dedup.
    pub exch_trade_id: String,
    /// REST cursor for venues that page trades with a `since` parameter.
    pub trades_cursor: String,

    pub subscribed: bool,
    pub order_book_channel_id: String,
    pub trades_channel_id: String,

    pub snapshot_table_name: String,
    pub trades_table_name: String,

    /// Unrecognized subscription keys, preserved verbatim.
    pub extras: HashMap<String, String>,
}

impl Instrument {
    pub fn new(exchange_name: &str, instmt_name: &str, instmt_code: &str, depth: usize) -> Self {
        Self {
            exchange_name: exchange_name.to_string(),
            instmt_name: instmt_name.to_string(),
            instmt_code: instmt_code.to_string(),
            l2_depth: L2Depth::new(depth),
            prev_l2_depth: L2Depth::new(depth),
            last_trade: Trade::default(),
            order_book_id: 0,
            trade_id: 0,
            exch_trade_id: String::new(),
            trades_cursor: String::new(),
            subscribed: false,
            order_book_channel_id: String::new(),
            trades_channel_id: String::new(),
            snapshot_table_name: String::new(),
            trades_table_name: String::new(),
            extras: HashMap::new(),
        }
    }

    pub fn from_subscription(sub: &Subscription, depth: usize) -> Self {
        let mut instmt = Self::new(&sub.exchange, &sub.instmt_name, &sub.instmt_code, depth);
        instmt.extras = sub.extras.clone();
        instmt
    }

    /// Advance the order-book counter; called once per emitted book.
    pub fn advance_order_book_id(&mut self) -> i64 {
        self.order_book_id += 1;
        self.order_book_id
    }

    /// Advance the trade counter and record the venue id in one step.
    pub fn advance_trade_id(&mut self, exch_trade_id: &str) -> i64 {
        debug_assert_ne!(
            self.exch_trade_id, exch_trade_id,
            "duplicate venue trade id passed dedup: {exch_trade_id}"
        );
        self.trade_id += 1;
        self.exch_trade_id = exch_trade_id.to_string();
        self.trade_id
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_advance_monotonically() {
        let mut instmt = Instrument::new("Okx", "BTC", "btc_usdt", 20);
        assert_eq!(instmt.advance_order_book_id(), 1);
        assert_eq!(instmt.advance_order_book_id(), 2);
        assert_eq!(instmt.advance_trade_id("a"), 1);
        assert_eq!(instmt.advance_trade_id("b"), 2);
        assert_eq!(instmt.exch_trade_id, "b");
    }
}
