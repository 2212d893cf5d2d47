use chrono::{FixedOffset, Utc};
use serde_json::{Value, json};

use crate::error::{FeedError, Result};
use crate::instrument::Instrument;
use crate::market_data::{BookSide, PriceLevel, Trade, TradeSide, UpdateType};
use crate::util;

use super::adapter::{Classified, VenueApi};

/// OKX WebSocket venue.
///
/// Wire quirks handled here:
/// - frames arrive as envelopes: a JSON array of `{channel, data}` items
/// - binary frames are raw-deflate compressed (inflated upstream)
/// - depth carries an epoch-ms `timestamp`
/// - trade rows are positional `[tid, price, volume, "HH:MM:SS", side]`
///   with the wall clock in venue-local UTC+8; side values observed on
///   the deals channel are `bid`/`ask`
pub struct OkxVenue;

/// Venue-local clock offset. No daylight saving applies.
fn venue_offset() -> FixedOffset {
    FixedOffset::east_opt(8 * 3600).expect("static utc+8 offset")
}

impl VenueApi for OkxVenue {
    fn exchange_name(&self) -> &'static str {
        "Okx"
    }

    fn link(&self, _instmt: &Instrument) -> String {
        "wss://real.okx.com:10441/websocket".to_string()
    }

    fn assign_channels(&self, instmt: &mut Instrument) {
        instmt.order_book_channel_id = format!("ok_sub_{}_depth", instmt.instmt_code);
        instmt.trades_channel_id = format!("ok_sub_{}_deals", instmt.instmt_code);
    }

    fn order_book_subscription_string(&self, instmt: &Instrument) -> String {
        json!({"event": "addChannel", "channel": instmt.order_book_channel_id}).to_string()
    }

    fn trades_subscription_string(&self, instmt: &Instrument) -> String {
        json!({"event": "addChannel", "channel": instmt.trades_channel_id}).to_string()
    }

    fn envelope<'a>(&self, raw: &'a Value) -> Vec<&'a Value> {
        match raw.as_array() {
            Some(items) => items.iter().collect(),
            None => vec![raw],
        }
    }

    fn classify<'a>(&self, raw: &'a Value, instmt: &mut Instrument) -> Classified<'a> {
        let Some(channel) = raw.get("channel").and_then(Value::as_str) else {
            return Classified::Control;
        };
        let Some(data) = raw.get("data") else {
            return Classified::Control;
        };
        if channel == instmt.order_book_channel_id {
            Classified::OrderBook(data)
        } else if channel == instmt.trades_channel_id {
            Classified::Trades(data)
        } else {
            Classified::Irrelevant
        }
    }

    fn parse_l2_depth(&self, instmt: &mut Instrument, raw: &Value) -> Result<()> {
        let (Some(bids), Some(asks)) = (
            raw.get("bids").and_then(Value::as_array),
            raw.get("asks").and_then(Value::as_array),
        ) else {
            return Err(FeedError::Parse("depth without bids/asks keys".to_string()));
        };

        let l2_depth = &mut instmt.l2_depth;
        l2_depth.date_time = match raw.get("timestamp").map(numeric_of) {
            Some(epoch) if epoch > 0.0 => util::epoch_to_date_time(epoch),
            _ => util::now_string(),
        };
        l2_depth.update_type = UpdateType::Snapshot;

        let mut bid_levels = parse_levels(bids);
        bid_levels.sort_by(|a, b| b.price.cmp(&a.price));
        let mut ask_levels = parse_levels(asks);
        ask_levels.sort_by(|a, b| a.price.cmp(&b.price));
        l2_depth.assign(BookSide::Bid, &bid_levels);
        l2_depth.assign(BookSide::Ask, &ask_levels);
        Ok(())
    }

    fn parse_trade(&self, _instmt: &Instrument, raw: &Value) -> Result<Vec<Trade>> {
        let rows = raw
            .as_array()
            .ok_or_else(|| FeedError::Parse("deals payload is not an array".to_string()))?;

        let now = Utc::now();
        let mut trades = Vec::with_capacity(rows.len());
        for row in rows {
            let Some(fields) = row.as_array().filter(|f| f.len() >= 5) else {
                return Err(FeedError::Parse(format!("deal row too short: {row}")));
            };
            let date_time = fields[3]
                .as_str()
                .and_then(|hms| util::wall_clock_to_date_time(hms, venue_offset(), now))
                .unwrap_or_else(util::now_string);
            trades.push(Trade {
                trade_id: text_of(&fields[0]),
                date_time,
                trade_price: util::decimal_of(&fields[1]),
                trade_volume: util::decimal_of(&fields[2]),
                trade_side: TradeSide::parse(&fields[4]),
            });
        }
        Ok(trades)
    }
}

fn parse_levels(rows: &[Value]) -> Vec<PriceLevel> {
    rows.iter()
        .filter_map(Value::as_array)
        .filter(|row| row.len() >= 2)
        .map(|row| PriceLevel::new(util::decimal_of(&row[0]), util::decimal_of(&row[1]), 0))
        .collect()
}

fn numeric_of(value: &Value) -> f64 {
    match value {
        Value::Number(n) => n.as_f64().unwrap_or(0.0),
        Value::String(s) => s.parse().unwrap_or(0.0),
        _ => 0.0,
    }
}

fn text_of(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn instmt() -> Instrument {
        let mut instmt = Instrument::new("Okx", "BTC", "spot_btc_usdt", 20);
        OkxVenue.assign_channels(&mut instmt);
        instmt
    }

    #[test]
    fn channels_derive_from_the_instrument_code() {
        let instmt = instmt();
        assert_eq!(instmt.order_book_channel_id, "ok_sub_spot_btc_usdt_depth");
        assert_eq!(
            OkxVenue.trades_subscription_string(&instmt),
            r#"{"channel":"ok_sub_spot_btc_usdt_deals","event":"addChannel"}"#
        );
    }

    #[test]
    fn envelope_splits_array_frames() {
        let raw = json!([
            {"channel": "ok_sub_spot_btc_usdt_depth", "data": {}},
            {"channel": "ok_sub_spot_btc_usdt_deals", "data": []}
        ]);
        assert_eq!(OkxVenue.envelope(&raw).len(), 2);
    }

    #[test]
    fn depth_parses_with_millisecond_timestamp() {
        let mut instmt = instmt();
        let data = json!({
            "bids": [["100.0", "1.0"], ["99.5", "2.0"]],
            "asks": [["100.5", "1.0"]],
            "timestamp": 1_700_000_000_000i64
        });
        OkxVenue.parse_l2_depth(&mut instmt, &data).unwrap();
        assert_eq!(instmt.l2_depth.bids[0].price, dec!(100.0));
        assert_eq!(instmt.l2_depth.bids[1].volume, dec!(2.0));
        assert_eq!(instmt.l2_depth.asks[0].price, dec!(100.5));
        assert_eq!(instmt.l2_depth.asks[1], Default::default());
        assert_eq!(instmt.l2_depth.date_time, "20231114 22:13:20.000000");
    }

    #[test]
    fn depth_without_book_keys_is_a_parse_error() {
        let mut instmt = instmt();
        let err = OkxVenue
            .parse_l2_depth(&mut instmt, &json!({"result": true}))
            .unwrap_err();
        assert!(matches!(err, FeedError::Parse(_)));
    }

    #[test]
    fn deals_rows_parse_positionally() {
        let instmt = instmt();
        let data = json!([["1001", "100", "0.1", "22:13:20", "bid"]]);
        let trades = OkxVenue.parse_trade(&instmt, &data).unwrap();
        assert_eq!(trades.len(), 1);
        assert_eq!(trades[0].trade_id, "1001");
        assert_eq!(trades[0].trade_price, dec!(100));
        assert_eq!(trades[0].trade_volume, dec!(0.1));
        assert_eq!(trades[0].trade_side, TradeSide::Buy);
    }

    #[test]
    fn unknown_deal_side_does_not_fail() {
        let instmt = instmt();
        let data = json!([["1", "100", "0.1", "22:13:20", "mystery"]]);
        let trades = OkxVenue.parse_trade(&instmt, &data).unwrap();
        assert_eq!(trades[0].trade_side, TradeSide::Unknown);
    }
}
