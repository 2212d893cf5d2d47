use serde_json::{Value, json};

use crate::error::{FeedError, Result};
use crate::instrument::Instrument;
use crate::market_data::{BookSide, PriceLevel, Trade, TradeSide, UpdateType};
use crate::util;

use super::adapter::{Classified, VenueApi};

/// Bitfinex WebSocket venue (v2 wire format).
///
/// Channels are numeric and learned from the subscribe acknowledgement;
/// data frames are positional arrays routed by channel id. The book
/// channel sends one full snapshot and then per-level updates
/// `[price, count, amount]`, so the held book is maintained here and
/// rows after the snapshot are marked incremental. Bitfinex is the one
/// venue reporting per-level order counts.
pub struct BitfinexVenue;

impl VenueApi for BitfinexVenue {
    fn exchange_name(&self) -> &'static str {
        "Bitfinex"
    }

    fn link(&self, _instmt: &Instrument) -> String {
        "wss://api-pub.bitfinex.com/ws/2".to_string()
    }

    fn order_book_subscription_string(&self, instmt: &Instrument) -> String {
        json!({
            "event": "subscribe",
            "channel": "book",
            "symbol": instmt.instmt_code,
            "prec": "P0",
            "freq": "F0",
            "len": "25",
        })
        .to_string()
    }

    fn trades_subscription_string(&self, instmt: &Instrument) -> String {
        json!({
            "event": "subscribe",
            "channel": "trades",
            "symbol": instmt.instmt_code,
        })
        .to_string()
    }

    fn classify<'a>(&self, raw: &'a Value, instmt: &mut Instrument) -> Classified<'a> {
        if let Some(event) = raw.get("event").and_then(Value::as_str) {
            // Channel ids only exist after the subscribe acknowledgement.
            if event == "subscribed" {
                let channel = raw.get("channel").and_then(Value::as_str).unwrap_or("");
                if let Some(chan_id) = raw.get("chanId").and_then(Value::as_i64) {
                    match channel {
                        "book" => instmt.order_book_channel_id = chan_id.to_string(),
                        "trades" => instmt.trades_channel_id = chan_id.to_string(),
                        _ => {}
                    }
                }
            }
            return Classified::Control;
        }

        let Some(items) = raw.as_array().filter(|a| a.len() >= 2) else {
            return Classified::Irrelevant;
        };
        let Some(chan_id) = items[0].as_i64().map(|id| id.to_string()) else {
            return Classified::Irrelevant;
        };
        // Heartbeats and book checksums carry no market data.
        if matches!(items[1].as_str(), Some("hb") | Some("cs")) {
            return Classified::Control;
        }
        if chan_id == instmt.order_book_channel_id {
            Classified::OrderBook(raw)
        } else if chan_id == instmt.trades_channel_id {
            Classified::Trades(raw)
        } else {
            Classified::Irrelevant
        }
    }

    fn parse_l2_depth(&self, instmt: &mut Instrument, raw: &Value) -> Result<()> {
        let payload = raw
            .get(1)
            .and_then(Value::as_array)
            .ok_or_else(|| FeedError::Parse("book frame without payload".to_string()))?;

        let l2_depth = &mut instmt.l2_depth;
        l2_depth.date_time = util::now_string();

        if payload.first().map(Value::is_array).unwrap_or(false) {
            // Initial snapshot: the whole visible book in one frame.
            let mut bids = Vec::new();
            let mut asks = Vec::new();
            for row in payload {
                let Some(level) = book_level(row) else {
                    continue;
                };
                if level.1 {
                    bids.push(level.0);
                } else {
                    asks.push(level.0);
                }
            }
            bids.sort_by(|a, b| b.price.cmp(&a.price));
            asks.sort_by(|a, b| a.price.cmp(&b.price));
            l2_depth.assign(BookSide::Bid, &bids);
            l2_depth.assign(BookSide::Ask, &asks);
            l2_depth.update_type = UpdateType::Snapshot;
            return Ok(());
        }

        // Per-level update.
        let Some((level, is_bid)) = book_level(raw.get(1).unwrap_or(&Value::Null)) else {
            return Err(FeedError::Parse(format!("book update row malformed: {raw}")));
        };
        let side = if is_bid { BookSide::Bid } else { BookSide::Ask };
        l2_depth.update_level(side, level);
        l2_depth.update_type = UpdateType::Incremental;
        Ok(())
    }

    fn parse_trade(&self, _instmt: &Instrument, raw: &Value) -> Result<Vec<Trade>> {
        let items = raw
            .as_array()
            .filter(|a| a.len() >= 2)
            .ok_or_else(|| FeedError::Parse("trades frame is not an array".to_string()))?;

        // "te" carries the executed trade first; "tu" repeats it with
        // settlement detail and is skipped to keep dedup trivial.
        match items[1].as_str() {
            Some("te") => {
                let row = items
                    .get(2)
                    .and_then(Value::as_array)
                    .ok_or_else(|| FeedError::Parse("te frame without trade row".to_string()))?;
                Ok(trade_row(row).into_iter().collect())
            }
            Some("tu") => Ok(Vec::new()),
            // Trades snapshot on subscribe: a list of rows, oldest last.
            None if items[1].is_array() => {
                let rows = items[1].as_array().expect("checked is_array");
                let mut trades: Vec<Trade> = rows
                    .iter()
                    .filter_map(Value::as_array)
                    .filter_map(|row| trade_row(row))
                    .collect();
                trades.reverse();
                Ok(trades)
            }
            _ => Ok(Vec::new()),
        }
    }
}

/// `[price, count, amount]` → level plus bid/ask flag. A zero count
/// deletes the price, which maps to a zero-volume level.
fn book_level(row: &Value) -> Option<(PriceLevel, bool)> {
    let fields = row.as_array().filter(|f| f.len() >= 3)?;
    let price = util::decimal_of(&fields[0]);
    let count = fields[1].as_i64()?;
    let amount = util::decimal_of(&fields[2]);
    let is_bid = amount.is_sign_positive();
    let volume = if count == 0 {
        rust_decimal::Decimal::ZERO
    } else {
        amount.abs()
    };
    Some((PriceLevel::new(price, volume, count), is_bid))
}

/// `[id, mts, amount, price]`; the amount sign carries the side.
fn trade_row(row: &[Value]) -> Option<Trade> {
    if row.len() < 4 {
        return None;
    }
    let amount = util::decimal_of(&row[2]);
    Some(Trade {
        trade_id: row[0].as_i64().map(|id| id.to_string())?,
        date_time: util::epoch_to_date_time(row[1].as_f64()?),
        trade_price: util::decimal_of(&row[3]),
        trade_volume: amount.abs(),
        trade_side: if amount.is_sign_positive() {
            TradeSide::Buy
        } else {
            TradeSide::Sell
        },
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn subscribed_instmt() -> Instrument {
        let mut instmt = Instrument::new("Bitfinex", "BTCUSD", "tBTCUSD", 20);
        let venue = BitfinexVenue;
        venue.classify(
            &json!({"event": "subscribed", "channel": "book", "chanId": 17, "symbol": "tBTCUSD"}),
            &mut instmt,
        );
        venue.classify(
            &json!({"event": "subscribed", "channel": "trades", "chanId": 18, "symbol": "tBTCUSD"}),
            &mut instmt,
        );
        instmt
    }

    #[test]
    fn channel_ids_come_from_the_subscribe_ack() {
        let instmt = subscribed_instmt();
        assert_eq!(instmt.order_book_channel_id, "17");
        assert_eq!(instmt.trades_channel_id, "18");
    }

    #[test]
    fn snapshot_builds_a_sorted_book_with_counts() {
        let mut instmt = subscribed_instmt();
        let frame = json!([17, [[100.0, 3, 1.0], [100.5, 2, -1.5], [99.5, 1, 2.0]]]);
        BitfinexVenue.parse_l2_depth(&mut instmt, &frame).unwrap();
        assert_eq!(instmt.l2_depth.bids[0].price, dec!(100.0));
        assert_eq!(instmt.l2_depth.bids[0].count, 3);
        assert_eq!(instmt.l2_depth.bids[1].price, dec!(99.5));
        assert_eq!(instmt.l2_depth.asks[0].price, dec!(100.5));
        assert_eq!(instmt.l2_depth.asks[0].volume, dec!(1.5));
        assert_eq!(instmt.l2_depth.update_type, UpdateType::Snapshot);
    }

    #[test]
    fn level_update_with_zero_count_removes_the_price() {
        let mut instmt = subscribed_instmt();
        let snapshot = json!([17, [[100.0, 1, 1.0], [100.5, 1, -1.0]]]);
        BitfinexVenue.parse_l2_depth(&mut instmt, &snapshot).unwrap();

        let removal = json!([17, [100.0, 0, 1.0]]);
        BitfinexVenue.parse_l2_depth(&mut instmt, &removal).unwrap();
        assert_eq!(instmt.l2_depth.bids[0], PriceLevel::default());
        assert_eq!(instmt.l2_depth.update_type, UpdateType::Incremental);
    }

    #[test]
    fn te_frames_carry_the_side_in_the_amount_sign() {
        let instmt = subscribed_instmt();
        let frame = json!([18, "te", [401, 1_700_000_000_000i64, -0.25, 100.5]]);
        let trades = BitfinexVenue.parse_trade(&instmt, &frame).unwrap();
        assert_eq!(trades.len(), 1);
        assert_eq!(trades[0].trade_id, "401");
        assert_eq!(trades[0].trade_volume, dec!(0.25));
        assert_eq!(trades[0].trade_side, TradeSide::Sell);
        assert_eq!(trades[0].date_time, "20231114 22:13:20.000000");
    }

    #[test]
    fn tu_frames_are_skipped() {
        let instmt = subscribed_instmt();
        let frame = json!([18, "tu", [401, 1_700_000_000_000i64, 0.25, 100.5]]);
        assert!(BitfinexVenue.parse_trade(&instmt, &frame).unwrap().is_empty());
    }
}
