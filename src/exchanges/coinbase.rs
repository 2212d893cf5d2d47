use chrono::{DateTime, Utc};
use serde_json::{Value, json};

use crate::error::{FeedError, Result};
use crate::instrument::Instrument;
use crate::market_data::{BookSide, PriceLevel, Trade, TradeSide, UpdateType};
use crate::util;

use super::adapter::{Classified, VenueApi};

/// Coinbase WebSocket venue.
///
/// Messages are routed by their `type` field: `snapshot` seeds the full
/// book, `l2update` streams per-level changes and `match` carries
/// executed trades. Timestamps are RFC 3339 strings.
pub struct CoinbaseVenue;

impl VenueApi for CoinbaseVenue {
    fn exchange_name(&self) -> &'static str {
        "Coinbase"
    }

    fn link(&self, _instmt: &Instrument) -> String {
        "wss://ws-feed.exchange.coinbase.com".to_string()
    }

    fn assign_channels(&self, instmt: &mut Instrument) {
        instmt.order_book_channel_id = "level2".to_string();
        instmt.trades_channel_id = "matches".to_string();
    }

    fn order_book_subscription_string(&self, instmt: &Instrument) -> String {
        json!({
            "type": "subscribe",
            "product_ids": [instmt.instmt_code],
            "channels": ["level2"],
        })
        .to_string()
    }

    fn trades_subscription_string(&self, instmt: &Instrument) -> String {
        json!({
            "type": "subscribe",
            "product_ids": [instmt.instmt_code],
            "channels": ["matches", "heartbeat"],
        })
        .to_string()
    }

    fn classify<'a>(&self, raw: &'a Value, _instmt: &mut Instrument) -> Classified<'a> {
        match raw.get("type").and_then(Value::as_str) {
            Some("snapshot") | Some("l2update") => Classified::OrderBook(raw),
            Some("match") | Some("last_match") => Classified::Trades(raw),
            Some("subscriptions") | Some("heartbeat") | Some("error") => Classified::Control,
            _ => Classified::Irrelevant,
        }
    }

    fn parse_l2_depth(&self, instmt: &mut Instrument, raw: &Value) -> Result<()> {
        let l2_depth = &mut instmt.l2_depth;

        if raw.get("type").and_then(Value::as_str) == Some("snapshot") {
            let (Some(bids), Some(asks)) = (
                raw.get("bids").and_then(Value::as_array),
                raw.get("asks").and_then(Value::as_array),
            ) else {
                return Err(FeedError::Parse("snapshot without bids/asks keys".to_string()));
            };
            l2_depth.date_time = util::now_string();
            l2_depth.update_type = UpdateType::Snapshot;
            l2_depth.assign(BookSide::Bid, &parse_levels(bids));
            l2_depth.assign(BookSide::Ask, &parse_levels(asks));
            return Ok(());
        }

        let changes = raw
            .get("changes")
            .and_then(Value::as_array)
            .ok_or_else(|| FeedError::Parse("l2update without changes key".to_string()))?;

        l2_depth.date_time = rfc3339_date_time(raw.get("time")).unwrap_or_else(util::now_string);
        l2_depth.update_type = UpdateType::Incremental;
        for change in changes {
            let Some(fields) = change.as_array().filter(|f| f.len() >= 3) else {
                continue;
            };
            let side = match fields[0].as_str() {
                Some("buy") => BookSide::Bid,
                Some("sell") => BookSide::Ask,
                _ => continue,
            };
            // A zero size removes the level.
            l2_depth.update_level(
                side,
                PriceLevel::new(util::decimal_of(&fields[1]), util::decimal_of(&fields[2]), 0),
            );
        }
        Ok(())
    }

    fn parse_trade(&self, _instmt: &Instrument, raw: &Value) -> Result<Vec<Trade>> {
        let trade_id = raw
            .get("trade_id")
            .map(|id| match id {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            })
            .ok_or_else(|| FeedError::Parse("match without trade_id".to_string()))?;
        let price = raw
            .get("price")
            .ok_or_else(|| FeedError::Parse("match without price".to_string()))?;
        let size = raw
            .get("size")
            .ok_or_else(|| FeedError::Parse("match without size".to_string()))?;

        Ok(vec![Trade {
            trade_id,
            date_time: rfc3339_date_time(raw.get("time")).unwrap_or_else(util::now_string),
            trade_price: util::decimal_of(price),
            trade_volume: util::decimal_of(size),
            trade_side: raw
                .get("side")
                .map(TradeSide::parse)
                .unwrap_or(TradeSide::Unknown),
        }])
    }
}

fn rfc3339_date_time(value: Option<&Value>) -> Option<String> {
    let text = value?.as_str()?;
    let parsed: DateTime<Utc> = DateTime::parse_from_rfc3339(text).ok()?.with_timezone(&Utc);
    Some(util::format_date_time(parsed))
}

fn parse_levels(rows: &[Value]) -> Vec<PriceLevel> {
    rows.iter()
        .filter_map(Value::as_array)
        .filter(|row| row.len() >= 2)
        .map(|row| PriceLevel::new(util::decimal_of(&row[0]), util::decimal_of(&row[1]), 0))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn instmt() -> Instrument {
        let mut instmt = Instrument::new("Coinbase", "BTCUSD", "BTC-USD", 20);
        CoinbaseVenue.assign_channels(&mut instmt);
        instmt
    }

    #[test]
    fn snapshot_then_update_maintains_the_book() {
        let mut instmt = instmt();
        let snapshot = json!({
            "type": "snapshot",
            "bids": [["100.0", "1.0"], ["99.5", "2.0"]],
            "asks": [["100.5", "1.0"]]
        });
        CoinbaseVenue.parse_l2_depth(&mut instmt, &snapshot).unwrap();
        assert_eq!(instmt.l2_depth.bids[0].price, dec!(100.0));
        assert_eq!(instmt.l2_depth.update_type, UpdateType::Snapshot);

        let update = json!({
            "type": "l2update",
            "time": "2023-11-14T22:13:20.000000Z",
            "changes": [["buy", "99.5", "0"], ["sell", "100.25", "0.5"]]
        });
        CoinbaseVenue.parse_l2_depth(&mut instmt, &update).unwrap();
        assert_eq!(instmt.l2_depth.bids[1], PriceLevel::default());
        assert_eq!(instmt.l2_depth.asks[0].price, dec!(100.25));
        assert_eq!(instmt.l2_depth.update_type, UpdateType::Incremental);
        assert_eq!(instmt.l2_depth.date_time, "20231114 22:13:20.000000");
    }

    #[test]
    fn matches_parse_with_rfc3339_time() {
        let instmt = instmt();
        let raw = json!({
            "type": "match",
            "trade_id": 7001,
            "time": "2023-11-14T22:13:20.500000Z",
            "price": "100.5",
            "size": "0.25",
            "side": "sell"
        });
        let trades = CoinbaseVenue.parse_trade(&instmt, &raw).unwrap();
        assert_eq!(trades[0].trade_id, "7001");
        assert_eq!(trades[0].date_time, "20231114 22:13:20.500000");
        assert_eq!(trades[0].trade_side, TradeSide::Sell);
    }

    #[test]
    fn l2update_without_changes_is_a_parse_error() {
        let mut instmt = instmt();
        let err = CoinbaseVenue
            .parse_l2_depth(&mut instmt, &json!({"type": "l2update"}))
            .unwrap_err();
        assert!(matches!(err, FeedError::Parse(_)));
    }
}
