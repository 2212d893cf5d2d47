use serde_json::Value;

use crate::error::{FeedError, Result};
use crate::instrument::Instrument;
use crate::market_data::{BookSide, PriceLevel, Trade, TradeSide, UpdateType};
use crate::util;

use super::adapter::{Classified, Transport, VenueApi};

/// Kraken REST venue.
///
/// Kraken is polled rather than streamed: the depth and trades public
/// endpoints are fetched once per second per instrument. Responses nest
/// the payload under `result.<PAIR>`; trades page with the `last`
/// cursor and have no venue trade id, so the epoch-seconds execution
/// time stands in for one.
pub struct KrakenVenue;

impl VenueApi for KrakenVenue {
    fn exchange_name(&self) -> &'static str {
        "Kraken"
    }

    fn transport(&self) -> Transport {
        Transport::RestPoll
    }

    fn depth_link(&self, instmt: &Instrument) -> String {
        format!(
            "https://api.kraken.com/0/public/Depth?pair={}&count={}",
            instmt.instmt_code, instmt.l2_depth.depth
        )
    }

    fn trades_link(&self, instmt: &Instrument) -> String {
        if instmt.trades_cursor.is_empty() {
            format!(
                "https://api.kraken.com/0/public/Trades?pair={}",
                instmt.instmt_code
            )
        } else {
            format!(
                "https://api.kraken.com/0/public/Trades?pair={}&since={}",
                instmt.instmt_code, instmt.trades_cursor
            )
        }
    }

    fn rest_cursor(&self, raw: &Value) -> Option<String> {
        raw.get("result")?
            .get("last")
            .and_then(Value::as_str)
            .map(str::to_string)
    }

    fn classify<'a>(&self, _raw: &'a Value, _instmt: &mut Instrument) -> Classified<'a> {
        // Polled responses are routed straight to the parsers.
        Classified::Control
    }

    fn parse_l2_depth(&self, instmt: &mut Instrument, raw: &Value) -> Result<()> {
        let book = pair_payload(raw)
            .filter(|p| p.get("bids").is_some() && p.get("asks").is_some())
            .ok_or_else(|| FeedError::Parse("depth response without result book".to_string()))?;

        let empty: &[Value] = &[];
        let mut bids = parse_levels(
            book.get("bids")
                .and_then(Value::as_array)
                .map_or(empty, Vec::as_slice),
        );
        bids.sort_by(|a, b| b.price.cmp(&a.price));
        let mut asks = parse_levels(
            book.get("asks")
                .and_then(Value::as_array)
                .map_or(empty, Vec::as_slice),
        );
        asks.sort_by(|a, b| a.price.cmp(&b.price));

        let l2_depth = &mut instmt.l2_depth;
        l2_depth.date_time = util::now_string();
        l2_depth.update_type = UpdateType::Snapshot;
        l2_depth.assign(BookSide::Bid, &bids);
        l2_depth.assign(BookSide::Ask, &asks);
        Ok(())
    }

    fn parse_trade(&self, _instmt: &Instrument, raw: &Value) -> Result<Vec<Trade>> {
        let rows = pair_payload(raw)
            .and_then(Value::as_array)
            .ok_or_else(|| FeedError::Parse("trades response without result rows".to_string()))?;

        let mut trades = Vec::with_capacity(rows.len());
        for row in rows {
            let Some(fields) = row.as_array().filter(|f| f.len() >= 4) else {
                continue;
            };
            // [price, volume, time, side, order type, misc]
            let time = numeric_of(&fields[2]);
            trades.push(Trade {
                trade_id: text_of(&fields[2]),
                date_time: util::epoch_to_date_time(time),
                trade_price: util::decimal_of(&fields[0]),
                trade_volume: util::decimal_of(&fields[1]),
                trade_side: TradeSide::parse(&fields[3]),
            });
        }
        Ok(trades)
    }
}

/// The pair-keyed object inside `result`, whatever the pair is called.
fn pair_payload(raw: &Value) -> Option<&Value> {
    raw.get("result")?
        .as_object()?
        .iter()
        .find(|(key, _)| *key != "last")
        .map(|(_, value)| value)
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
