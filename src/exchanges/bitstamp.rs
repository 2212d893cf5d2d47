use serde_json::{Value, json};

use crate::error::{FeedError, Result};
use crate::instrument::Instrument;
use crate::market_data::{BookSide, PriceLevel, Trade, TradeSide, UpdateType};
use crate::util;

use super::adapter::{Classified, VenueApi};

/// Bitstamp WebSocket venue (v2 wire format).
///
/// Channels are named per instrument (`order_book_<code>`,
/// `live_trades_<code>`). Depth frames are full snapshots stamped with a
/// microsecond `microtimestamp` string; trade frames carry epoch-second
/// strings and a numeric `type` where 0 is buy and 1 is sell.
pub struct BitstampVenue;

impl VenueApi for BitstampVenue {
    fn exchange_name(&self) -> &'static str {
        "Bitstamp"
    }

    fn link(&self, _instmt: &Instrument) -> String {
        "wss://ws.bitstamp.net".to_string()
    }

    fn assign_channels(&self, instmt: &mut Instrument) {
        instmt.order_book_channel_id = format!("order_book_{}", instmt.instmt_code);
        instmt.trades_channel_id = format!("live_trades_{}", instmt.instmt_code);
    }

    fn order_book_subscription_string(&self, instmt: &Instrument) -> String {
        json!({
            "event": "bts:subscribe",
            "data": {"channel": instmt.order_book_channel_id},
        })
        .to_string()
    }

    fn trades_subscription_string(&self, instmt: &Instrument) -> String {
        json!({
            "event": "bts:subscribe",
            "data": {"channel": instmt.trades_channel_id},
        })
        .to_string()
    }

    fn classify<'a>(&self, raw: &'a Value, instmt: &mut Instrument) -> Classified<'a> {
        let event = raw.get("event").and_then(Value::as_str).unwrap_or("");
        if event.starts_with("bts:") {
            return Classified::Control;
        }
        let channel = raw.get("channel").and_then(Value::as_str).unwrap_or("");
        let Some(data) = raw.get("data") else {
            return Classified::Control;
        };
        if event == "data" && channel == instmt.order_book_channel_id {
            Classified::OrderBook(data)
        } else if event == "trade" && channel == instmt.trades_channel_id {
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
        l2_depth.date_time = depth_date_time(raw);
        l2_depth.update_type = UpdateType::Snapshot;
        l2_depth.assign(BookSide::Bid, &parse_levels(bids));
        l2_depth.assign(BookSide::Ask, &parse_levels(asks));
        Ok(())
    }

    fn parse_trade(&self, _instmt: &Instrument, raw: &Value) -> Result<Vec<Trade>> {
        let id = raw
            .get("id")
            .map(|id| match id {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            })
            .ok_or_else(|| FeedError::Parse("trade without id".to_string()))?;
        let price = raw
            .get("price_str")
            .or_else(|| raw.get("price"))
            .ok_or_else(|| FeedError::Parse("trade without price".to_string()))?;
        let amount = raw
            .get("amount_str")
            .or_else(|| raw.get("amount"))
            .ok_or_else(|| FeedError::Parse("trade without amount".to_string()))?;

        let date_time = raw
            .get("microtimestamp")
            .and_then(Value::as_str)
            .and_then(|micros| micros.parse::<f64>().ok())
            .map(|micros| util::epoch_to_date_time(micros / 1_000_000.0))
            .or_else(|| {
                raw.get("timestamp")
                    .and_then(Value::as_str)
                    .and_then(|secs| secs.parse::<f64>().ok())
                    .map(util::epoch_to_date_time)
            })
            .unwrap_or_else(util::now_string);

        // type: 0 = buy, 1 = sell. Mapped here because the generic
        // synonym table reads a bare 1 as buy.
        let trade_side = match raw.get("type").and_then(Value::as_i64) {
            Some(0) => TradeSide::Buy,
            Some(1) => TradeSide::Sell,
            _ => TradeSide::Unknown,
        };

        Ok(vec![Trade {
            trade_id: id,
            date_time,
            trade_price: util::decimal_of(price),
            trade_volume: util::decimal_of(amount),
            trade_side,
        }])
    }
}

fn depth_date_time(raw: &Value) -> String {
    raw.get("microtimestamp")
        .and_then(Value::as_str)
        .and_then(|micros| micros.parse::<f64>().ok())
        .map(|micros| util::epoch_to_date_time(micros / 1_000_000.0))
        .or_else(|| {
            raw.get("timestamp")
                .and_then(Value::as_str)
                .and_then(|secs| secs.parse::<f64>().ok())
                .map(util::epoch_to_date_time)
        })
        .unwrap_or_else(util::now_string)
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
        let mut instmt = Instrument::new("Bitstamp", "BTCUSD", "btcusd", 20);
        BitstampVenue.assign_channels(&mut instmt);
        instmt
    }

    #[test]
    fn depth_uses_the_microsecond_timestamp() {
        let mut instmt = instmt();
        let data = json!({
            "bids": [["100.0", "1.0"]],
            "asks": [["100.5", "1.0"]],
            "microtimestamp": "1700000000500000"
        });
        BitstampVenue.parse_l2_depth(&mut instmt, &data).unwrap();
        assert_eq!(instmt.l2_depth.date_time, "20231114 22:13:20.500000");
        assert_eq!(instmt.l2_depth.bids[0].price, dec!(100.0));
    }

    #[test]
    fn trade_type_zero_is_buy_and_one_is_sell() {
        let instmt = instmt();
        let buy = json!({
            "id": 9001, "price_str": "100", "amount_str": "0.1",
            "timestamp": "1700000000", "type": 0
        });
        let sell = json!({
            "id": 9002, "price_str": "100", "amount_str": "0.1",
            "timestamp": "1700000000", "type": 1
        });
        assert_eq!(
            BitstampVenue.parse_trade(&instmt, &buy).unwrap()[0].trade_side,
            TradeSide::Buy
        );
        assert_eq!(
            BitstampVenue.parse_trade(&instmt, &sell).unwrap()[0].trade_side,
            TradeSide::Sell
        );
    }

    #[test]
    fn trade_without_id_is_a_parse_error() {
        let instmt = instmt();
        let err = BitstampVenue
            .parse_trade(&instmt, &json!({"price_str": "100"}))
            .unwrap_err();
        assert!(matches!(err, FeedError::Parse(_)));
    }

    #[test]
    fn classify_routes_by_channel_and_event() {
        let mut instmt = instmt();
        let depth = json!({"event": "data", "channel": "order_book_btcusd", "data": {}});
        assert!(matches!(
            BitstampVenue.classify(&depth, &mut instmt),
            Classified::OrderBook(_)
        ));
        let ack = json!({"event": "bts:subscription_succeeded", "channel": "order_book_btcusd"});
        assert!(matches!(
            BitstampVenue.classify(&ack, &mut instmt),
            Classified::Control
        ));
    }
}
