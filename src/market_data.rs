//! Normalized market-data values shared by every venue.
//!
//! Venue adapters parse wire messages into these types; the gateway and
//! the sinks never see venue-specific shapes. Any schema change here
//! affects every persisted table and the pub/sub payloads.

use rust_decimal::Decimal;
use serde_json::Value;

use crate::util;

// ------------------------------------------------------------
// Price level
// ------------------------------------------------------------

/// One order-book level.
///
/// `count` is only meaningful on venues that report per-level order
/// counts; everywhere else it stays zero.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PriceLevel {
    pub price: Decimal,
    pub volume: Decimal,
    pub count: i64,
}

impl PriceLevel {
    pub fn new(price: Decimal, volume: Decimal, count: i64) -> Self {
        Self { price, volume, count }
    }
}

/// Book side selector for incremental level updates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BookSide {
    Bid,
    Ask,
}

// ------------------------------------------------------------
// Update type
// ------------------------------------------------------------

/// How a depth message reached the book.
///
/// Venues that stream per-level changes rather than full snapshots mark
/// their rows `Incremental` so downstream consumers can tell a rebuilt
/// book from a venue-provided one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateType {
    Snapshot = 1,
    Incremental = 2,
}

impl UpdateType {
    pub fn as_i64(self) -> i64 {
        self as i64
    }
}

// ------------------------------------------------------------
// L2 depth
// ------------------------------------------------------------

/// Top-N order book, bids descending and asks ascending by price.
///
/// The vectors always hold exactly `depth` levels; unfilled slots stay
/// at zero. Adapters are responsible for the ordering invariant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct L2Depth {
    pub depth: usize,
    pub bids: Vec<PriceLevel>,
    pub asks: Vec<PriceLevel>,
    pub date_time: String,
    pub update_type: UpdateType,
}

impl L2Depth {
    pub fn new(depth: usize) -> Self {
        Self {
            depth,
            bids: vec![PriceLevel::default(); depth],
            asks: vec![PriceLevel::default(); depth],
            date_time: util::now_string(),
            update_type: UpdateType::Snapshot,
        }
    }

    /// True iff any of the top-N bid/ask prices or volumes differ.
    pub fn is_diff(&self, other: &L2Depth) -> bool {
        let levels = self.depth.min(other.depth);
        for i in 0..levels {
            if self.bids[i].price != other.bids[i].price
                || self.bids[i].volume != other.bids[i].volume
                || self.asks[i].price != other.asks[i].price
                || self.asks[i].volume != other.asks[i].volume
            {
                return true;
            }
        }
        false
    }

    /// Replace one side with venue-ordered levels, clamped to the book
    /// depth. The remainder of the fixed array is reset to zeros.
    pub fn assign(&mut self, side: BookSide, levels: &[PriceLevel]) {
        let target = match side {
            BookSide::Bid => &mut self.bids,
            BookSide::Ask => &mut self.asks,
        };
        let take = levels.len().min(target.len());
        for (i, slot) in target.iter_mut().enumerate() {
            *slot = if i < take {
                levels[i].clone()
            } else {
                PriceLevel::default()
            };
        }
    }

    /// Ordering invariant on emitted books: occupied bid levels strictly
    /// descending, occupied ask levels strictly ascending.
    pub fn is_ordered(&self) -> bool {
        let bids: Vec<&PriceLevel> = self
            .bids
            .iter()
            .filter(|l| l.price != Decimal::ZERO)
            .collect();
        let asks: Vec<&PriceLevel> = self
            .asks
            .iter()
            .filter(|l| l.price != Decimal::ZERO)
            .collect();
        bids.windows(2).all(|pair| pair[0].price > pair[1].price)
            && asks.windows(2).all(|pair| pair[0].price < pair[1].price)
    }

    /// Insert or replace a level on one side, keeping the side sorted and
    /// clamped to the book depth. A zero volume removes the level.
    pub fn update_level(&mut self, side: BookSide, level: PriceLevel) {
        let slots = match side {
            BookSide::Bid => &mut self.bids,
            BookSide::Ask => &mut self.asks,
        };

        let mut live: Vec<PriceLevel> = slots
            .iter()
            .filter(|l| l.price != Decimal::ZERO && l.price != level.price)
            .cloned()
            .collect();
        if level.volume != Decimal::ZERO {
            live.push(level);
        }
        match side {
            BookSide::Bid => live.sort_by(|a, b| b.price.cmp(&a.price)),
            BookSide::Ask => live.sort_by(|a, b| a.price.cmp(&b.price)),
        }
        live.truncate(slots.len());
        live.resize(slots.len(), PriceLevel::default());
        *slots = live;
    }
}

// ------------------------------------------------------------
// Trade
// ------------------------------------------------------------

/// Taker side of a trade as persisted: buy = 1, sell = 2, unknown = 0.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum TradeSide {
    #[default]
    Unknown = 0,
    Buy = 1,
    Sell = 2,
}

impl TradeSide {
    pub fn as_i64(self) -> i64 {
        self as i64
    }

    /// Map a venue side field to a normalized side.
    ///
    /// Accepts buy/sell and bid/ask synonyms, single letters, numeric
    /// codes 1/2 and boolean flags. Anything unrecognized is `Unknown`;
    /// this never fails.
    pub fn parse(raw: &Value) -> TradeSide {
        match raw {
            Value::Bool(true) => TradeSide::Buy,
            Value::Bool(false) => TradeSide::Sell,
            Value::Number(n) => match n.as_i64() {
                Some(1) => TradeSide::Buy,
                Some(2) => TradeSide::Sell,
                _ => TradeSide::Unknown,
            },
            Value::String(s) => TradeSide::parse_str(s),
            _ => TradeSide::Unknown,
        }
    }

    pub fn parse_str(raw: &str) -> TradeSide {
        match raw.trim().to_ascii_lowercase().as_str() {
            "buy" | "bid" | "b" | "1" | "true" => TradeSide::Buy,
            "sell" | "ask" | "s" | "2" | "false" => TradeSide::Sell,
            _ => TradeSide::Unknown,
        }
    }
}

/// One normalized trade. `trade_id` is the venue-reported identifier;
/// the per-instrument monotonic id lives on the instrument.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Trade {
    pub trade_id: String,
    pub date_time: String,
    pub trade_price: Decimal,
    pub trade_volume: Decimal,
    pub trade_side: TradeSide,
}

impl Default for Trade {
    fn default() -> Self {
        Self {
            trade_id: String::new(),
            date_time: util::now_string(),
            trade_price: Decimal::ZERO,
            trade_volume: Decimal::ZERO,
            trade_side: TradeSide::Unknown,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use serde_json::json;

    fn level(price: Decimal, volume: Decimal) -> PriceLevel {
        PriceLevel::new(price, volume, 0)
    }

    #[test]
    fn identical_books_are_not_diff() {
        let mut a = L2Depth::new(20);
        a.assign(BookSide::Bid, &[level(dec!(100.0), dec!(1.0))]);
        let b = a.clone();
        assert!(!a.is_diff(&b));
    }

    #[test]
    fn volume_change_is_diff() {
        let mut a = L2Depth::new(20);
        a.assign(BookSide::Bid, &[level(dec!(100.0), dec!(1.0))]);
        let mut b = a.clone();
        b.bids[0].volume = dec!(2.0);
        assert!(a.is_diff(&b));
    }

    #[test]
    fn clone_is_disjoint() {
        let mut a = L2Depth::new(20);
        a.assign(BookSide::Ask, &[level(dec!(100.5), dec!(1.0))]);
        let b = a.clone();
        a.asks[0].price = dec!(101.0);
        assert_eq!(b.asks[0].price, dec!(100.5));
    }

    #[test]
    fn assign_clamps_to_depth_and_zeroes_the_rest() {
        let mut book = L2Depth::new(2);
        book.assign(
            BookSide::Bid,
            &[
                level(dec!(100.0), dec!(1.0)),
                level(dec!(99.5), dec!(2.0)),
                level(dec!(99.0), dec!(3.0)),
            ],
        );
        assert_eq!(book.bids[0].price, dec!(100.0));
        assert_eq!(book.bids[1].price, dec!(99.5));

        book.assign(BookSide::Bid, &[level(dec!(100.0), dec!(1.0))]);
        assert_eq!(book.bids[1], PriceLevel::default());
    }

    #[test]
    fn update_level_keeps_bids_descending() {
        let mut book = L2Depth::new(3);
        book.update_level(BookSide::Bid, level(dec!(99.0), dec!(1.0)));
        book.update_level(BookSide::Bid, level(dec!(100.0), dec!(1.0)));
        book.update_level(BookSide::Bid, level(dec!(99.5), dec!(1.0)));
        let prices: Vec<_> = book.bids.iter().map(|l| l.price).collect();
        assert_eq!(prices, vec![dec!(100.0), dec!(99.5), dec!(99.0)]);
    }

    #[test]
    fn update_level_zero_volume_removes() {
        let mut book = L2Depth::new(3);
        book.update_level(BookSide::Ask, level(dec!(100.5), dec!(1.0)));
        book.update_level(BookSide::Ask, level(dec!(100.5), Decimal::ZERO));
        assert_eq!(book.asks[0], PriceLevel::default());
    }

    #[test]
    fn side_synonyms_parse() {
        for raw in ["buy", "BID", "b", "1", "true"] {
            assert_eq!(TradeSide::parse_str(raw), TradeSide::Buy);
        }
        for raw in ["sell", "ask", "S", "2", "false"] {
            assert_eq!(TradeSide::parse_str(raw), TradeSide::Sell);
        }
        assert_eq!(TradeSide::parse_str("wat"), TradeSide::Unknown);
    }

    #[test]
    fn side_json_codes_parse() {
        assert_eq!(TradeSide::parse(&json!(1)), TradeSide::Buy);
        assert_eq!(TradeSide::parse(&json!(2)), TradeSide::Sell);
        assert_eq!(TradeSide::parse(&json!(true)), TradeSide::Buy);
        assert_eq!(TradeSide::parse(&json!(false)), TradeSide::Sell);
        assert_eq!(TradeSide::parse(&json!(7)), TradeSide::Unknown);
        assert_eq!(TradeSide::parse(&json!(null)), TradeSide::Unknown);
    }
}
