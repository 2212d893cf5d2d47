//! Transport workers and the shared message dispatch.
//!
//! One task per instrument per transport. The loops never exit
//! voluntarily: transport failures reconnect, parse failures drop the
//! message, and sink failures are already swallowed downstream.

use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use log::{debug, info, warn};
use serde_json::Value;
use tokio::time::{Duration, MissedTickBehavior, sleep};
use tokio_tungstenite::tungstenite::Message;

use super::ExchangeGateway;
use crate::api::ws;
use crate::exchanges::adapter::{Classified, Transport, VenueApi};
use crate::instrument::Instrument;
use crate::util;

pub async fn run(gateway: Arc<ExchangeGateway>, venue: Arc<dyn VenueApi>, mut instmt: Instrument) {
    match venue.transport() {
        Transport::Websocket => run_ws(&gateway, venue.as_ref(), &mut instmt).await,
        Transport::RestPoll => run_rest(&gateway, venue.as_ref(), &mut instmt).await,
    }
}

/// Persistent WebSocket loop: connect, subscribe once per connection,
/// dispatch frames, reconnect with jittered backoff on any failure.
async fn run_ws(gateway: &Arc<ExchangeGateway>, venue: &dyn VenueApi, instmt: &mut Instrument) {
    loop {
        match ws::connect(&venue.link(instmt)).await {
            Ok(stream) => {
                let (mut write, mut read) = stream.split();

                venue.assign_channels(instmt);
                if !instmt.subscribed {
                    let mut sent = true;
                    for frame in [
                        venue.order_book_subscription_string(instmt),
                        venue.trades_subscription_string(instmt),
                    ] {
                        if frame.is_empty() {
                            continue;
                        }
                        if write.send(Message::text(frame)).await.is_err() {
                            sent = false;
                            break;
                        }
                    }
                    if !sent {
                        sleep(ws::reconnect_delay()).await;
                        continue;
                    }
                    instmt.subscribed = true;
                    info!(
                        "{}/{} subscribed in channels ({}, {})",
                        instmt.exchange_name,
                        instmt.instmt_name,
                        instmt.order_book_channel_id,
                        instmt.trades_channel_id
                    );
                }

                while let Some(frame) = read.next().await {
                    match frame {
                        Ok(Message::Text(text)) => {
                            handle_raw(gateway, venue, instmt, text.as_str()).await;
                        }
                        Ok(Message::Binary(data)) => match ws::decode_binary(&data) {
                            Ok(text) => handle_raw(gateway, venue, instmt, &text).await,
                            Err(err) => warn!("{}: {err}", instmt.exchange_name),
                        },
                        Ok(Message::Ping(data)) => {
                            let _ = write.send(Message::Pong(data)).await;
                        }
                        Ok(Message::Close(_)) => break,
                        Ok(_) => {}
                        Err(err) => {
                            warn!("{}/{} read failed: {err}", instmt.exchange_name, instmt.instmt_name);
                            break;
                        }
                    }
                }
            }
            Err(err) => {
                warn!(
                    "{}/{} connect failed: {err}",
                    instmt.exchange_name, instmt.instmt_name
                );
            }
        }

        // Next connection must resubscribe.
        instmt.subscribed = false;
        sleep(ws::reconnect_delay()).await;
        debug!("{}/{} reconnecting", instmt.exchange_name, instmt.instmt_name);
    }
}

/// Long-poll loop for venues without a streaming endpoint: fetch depth
/// and trades once per second and push both through the same dispatch
/// path as streamed messages.
async fn run_rest(gateway: &Arc<ExchangeGateway>, venue: &dyn VenueApi, instmt: &mut Instrument) {
    let mut ticker = tokio::time::interval(Duration::from_secs(1));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;

        let depth = gateway.rest().request(&venue.depth_link(instmt)).await;
        if !is_empty_map(&depth) {
            handle_depth(gateway, venue, instmt, &depth).await;
        }

        let trades = gateway.rest().request(&venue.trades_link(instmt)).await;
        if !is_empty_map(&trades) {
            handle_trades(gateway, venue, instmt, &trades).await;
            if let Some(cursor) = venue.rest_cursor(&trades) {
                instmt.trades_cursor = cursor;
            }
        }
    }
}

fn is_empty_map(value: &Value) -> bool {
    value.as_object().is_none_or(|map| map.is_empty())
}

async fn handle_raw(
    gateway: &Arc<ExchangeGateway>,
    venue: &dyn VenueApi,
    instmt: &mut Instrument,
    raw: &str,
) {
    match serde_json::from_str::<Value>(raw) {
        Ok(message) => handle_message(gateway, venue, instmt, &message).await,
        Err(err) => warn!("{}: undecodable frame ({err}): {raw}", instmt.exchange_name),
    }
}

pub(crate) async fn handle_message(
    gateway: &Arc<ExchangeGateway>,
    venue: &dyn VenueApi,
    instmt: &mut Instrument,
    message: &Value,
) {
    for item in venue.envelope(message) {
        match venue.classify(item, instmt) {
            Classified::OrderBook(payload) => {
                handle_depth(gateway, venue, instmt, payload).await;
            }
            Classified::Trades(payload) => {
                handle_trades(gateway, venue, instmt, payload).await;
            }
            Classified::Control => {}
            Classified::Irrelevant => {
                debug!("{}: unclassified item: {item}", instmt.exchange_name);
            }
        }
    }
}

/// Depth path: keep the previous book, parse into the live one and emit
/// only when the top-N levels changed.
pub(crate) async fn handle_depth(
    gateway: &Arc<ExchangeGateway>,
    venue: &dyn VenueApi,
    instmt: &mut Instrument,
    payload: &Value,
) {
    instmt.prev_l2_depth = instmt.l2_depth.clone();
    if let Err(err) = venue.parse_l2_depth(instmt, payload) {
        warn!(
            "{}/{} depth parse failed: {err}; payload: {payload}",
            instmt.exchange_name, instmt.instmt_name
        );
        return;
    }
    if !instmt.l2_depth.is_diff(&instmt.prev_l2_depth) {
        return;
    }
    instmt.advance_order_book_id();
    if gateway.settings().is_local_timestamp {
        instmt.l2_depth.date_time = util::now_string();
    }
    gateway.insert_order_book(instmt).await;
}

/// Trade path: parse, drop venue ids already seen, advance the local id
/// on the same step that records the venue id, then emit.
pub(crate) async fn handle_trades(
    gateway: &Arc<ExchangeGateway>,
    venue: &dyn VenueApi,
    instmt: &mut Instrument,
    payload: &Value,
) {
    let trades = match venue.parse_trade(instmt, payload) {
        Ok(trades) => trades,
        Err(err) => {
            warn!(
                "{}/{} trade parse failed: {err}; payload: {payload}",
                instmt.exchange_name, instmt.instmt_name
            );
            return;
        }
    };

    for mut trade in trades {
        if trade.trade_id == instmt.exch_trade_id {
            continue;
        }
        instmt.advance_trade_id(&trade.trade_id);
        if gateway.settings().is_local_timestamp {
            trade.date_time = util::now_string();
        }
        instmt.last_trade = trade.clone();
        gateway.insert_trade(instmt, &trade).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use serde_json::json;

    use crate::error::Result;
    use crate::exchanges::okx::OkxVenue;
    use crate::market_data::TradeSide;
    use crate::settings::FeedSettings;
    use crate::sinks::{ColumnType, Sink, SqlValue};

    /// Captures every insert so the emission policy can be asserted.
    #[derive(Default)]
    struct RecordingSink {
        inserts: std::sync::Mutex<Vec<(String, Vec<String>, Vec<SqlValue>)>>,
    }

    impl RecordingSink {
        fn rows_for(&self, table_prefix: &str) -> Vec<Vec<SqlValue>> {
            self.inserts
                .lock()
                .unwrap()
                .iter()
                .filter(|(table, _, _)| table.starts_with(table_prefix))
                .map(|(_, _, values)| values.clone())
                .collect()
        }
    }

    #[async_trait]
    impl Sink for RecordingSink {
        fn name(&self) -> &'static str {
            "recording"
        }

        async fn create(
            &self,
            _table: &str,
            _columns: &[&str],
            _types: &[ColumnType],
            _primary_key_index: &[usize],
            _if_not_exists: bool,
        ) -> Result<()> {
            Ok(())
        }

        async fn insert(
            &self,
            table: &str,
            columns: &[&str],
            _types: &[ColumnType],
            values: &[SqlValue],
            _primary_key_index: &[usize],
            _or_replace: bool,
            _commit: bool,
        ) -> Result<()> {
            self.inserts.lock().unwrap().push((
                table.to_string(),
                columns.iter().map(|c| c.to_string()).collect(),
                values.to_vec(),
            ));
            Ok(())
        }

        async fn select(
            &self,
            _table: &str,
            _columns: &[&str],
            _condition: &str,
            _order_by: &str,
            _limit: u64,
        ) -> Result<Vec<Vec<SqlValue>>> {
            Ok(Vec::new())
        }

        async fn delete(&self, _table: &str, _condition: &str) -> Result<()> {
            Ok(())
        }

        async fn commit(&self) -> Result<()> {
            Ok(())
        }

        async fn close(&self) -> Result<()> {
            Ok(())
        }
    }

    fn fixture() -> (Arc<ExchangeGateway>, Arc<RecordingSink>, Instrument) {
        let sink = Arc::new(RecordingSink::default());
        let settings = FeedSettings {
            is_local_timestamp: false,
            ..FeedSettings::default()
        };
        let gateway = Arc::new(
            ExchangeGateway::new(vec![sink.clone() as Arc<dyn Sink>], settings).unwrap(),
        );

        let mut instmt = Instrument::new("Okx", "BTC", "spot_btc_usdt", 20);
        OkxVenue.assign_channels(&mut instmt);
        instmt.snapshot_table_name = "exch_okx_btc_snapshot".to_string();
        instmt.trades_table_name = "exch_okx_btc_trades_20231114".to_string();
        (gateway, sink, instmt)
    }

    fn depth_payload() -> Value {
        json!({
            "bids": [["100.0", "1.0"], ["99.5", "2.0"]],
            "asks": [["100.5", "1.0"]],
            "timestamp": 1_700_000_000_000i64
        })
    }

    #[tokio::test]
    async fn first_depth_message_emits_one_snapshot() {
        let (gateway, sink, mut instmt) = fixture();

        handle_depth(&gateway, &OkxVenue, &mut instmt, &depth_payload()).await;

        assert_eq!(instmt.order_book_id, 1);
        let snapshots = sink.rows_for(crate::gateway::EXCHANGES_SNAPSHOT_TABLE);
        assert_eq!(snapshots.len(), 1);
        let row = &snapshots[0];
        // b1/bv1, b2/bv2, a1/av1, rest zeros, per the column layout.
        assert_eq!(row[5].render_plain(), "100.0");
        assert_eq!(row[10].render_plain(), "1.0");
        assert_eq!(row[6].render_plain(), "99.5");
        assert_eq!(row[11].render_plain(), "2.0");
        assert_eq!(row[20].render_plain(), "100.5");
        assert_eq!(row[21].render_plain(), "0");
        assert_eq!(row[35], SqlValue::Int(1));
        assert_eq!(row[38].render_plain(), "20231114 22:13:20.000000");

        let books = sink.rows_for("exch_okx_btc_snapshot");
        assert_eq!(books.len(), 1);
        assert_eq!(books[0][0], SqlValue::Int(1));
    }

    #[tokio::test]
    async fn identical_depth_message_is_suppressed() {
        let (gateway, sink, mut instmt) = fixture();

        handle_depth(&gateway, &OkxVenue, &mut instmt, &depth_payload()).await;
        handle_depth(&gateway, &OkxVenue, &mut instmt, &depth_payload()).await;

        assert_eq!(instmt.order_book_id, 1);
        assert_eq!(sink.rows_for(crate::gateway::EXCHANGES_SNAPSHOT_TABLE).len(), 1);
    }

    #[tokio::test]
    async fn duplicate_venue_trade_id_emits_once() {
        let (gateway, sink, mut instmt) = fixture();
        let payload = json!([["a", "100", "0.1", "22:13:20", "bid"]]);

        handle_trades(&gateway, &OkxVenue, &mut instmt, &payload).await;
        handle_trades(&gateway, &OkxVenue, &mut instmt, &payload).await;

        assert_eq!(instmt.trade_id, 1);
        assert_eq!(instmt.exch_trade_id, "a");
        let trades = sink.rows_for("exch_okx_btc_trades_");
        assert_eq!(trades.len(), 1);
        assert_eq!(trades[0][0], SqlValue::Int(1));
        assert_eq!(trades[0][5], SqlValue::Int(TradeSide::Buy.as_i64()));
    }

    #[tokio::test]
    async fn parse_failure_drops_the_message_only() {
        let (gateway, sink, mut instmt) = fixture();

        handle_depth(&gateway, &OkxVenue, &mut instmt, &json!({"unexpected": true})).await;
        assert_eq!(instmt.order_book_id, 0);
        assert!(sink.rows_for("").is_empty());

        // The worker keeps going: the next good message still emits.
        handle_depth(&gateway, &OkxVenue, &mut instmt, &depth_payload()).await;
        assert_eq!(instmt.order_book_id, 1);
    }

    #[tokio::test]
    async fn message_routing_follows_the_channel_ids() {
        let (gateway, sink, mut instmt) = fixture();
        let frame = json!([
            {"channel": "ok_sub_spot_btc_usdt_depth", "data": depth_payload()},
            {"channel": "ok_sub_spot_btc_usdt_deals",
             "data": [["b", "100.5", "0.2", "22:13:21", "ask"]]}
        ]);

        handle_message(&gateway, &OkxVenue, &mut instmt, &frame).await;

        assert_eq!(instmt.order_book_id, 1);
        assert_eq!(instmt.trade_id, 1);
        assert_eq!(sink.rows_for("exch_okx_btc_trades_").len(), 1);
    }
}
