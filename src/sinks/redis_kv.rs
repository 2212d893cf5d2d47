//! Key-value + pub/sub sink.
//!
//! Doubles as the substrate for the candle and chart workers:
//!
//! - snapshot rows become one `SET` per column plus a JSON publish on
//!   the snapshot channel
//! - trade rows are bucketed into per-second lists (`LPUSH`) indexed by
//!   a sorted queue (`ZADD`), and mirrored into a per-second price
//!   series for the chart
//!
//! Each write group happens under the sink lock, so a snapshot write is
//! atomic relative to other snapshot writes and a bucket write relative
//! to other bucket writes. All key segments are lowercased.

use async_trait::async_trait;
use log::{error, warn};
use once_cell::sync::Lazy;
use redis::AsyncCommands;
use redis::aio::ConnectionManager;
use regex::Regex;
use tokio::sync::Mutex;

use super::{ColumnType, Sink, SqlValue};
use crate::error::{FeedError, Result};
use crate::util;

const KEY_PREFIX: &str = "befh_";
const SNAPSHOT_TABLE: &str = "exchanges_snapshot";
const SNAPSHOT_CHANNEL: &str = "befh_es";

/// Trades table names carry the venue, instrument and day:
/// `exch_<venue>_<instrument>_trades_YYYYMMDD`.
static TRADES_TABLE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^exch_(.*)_(.*)_trades_[0-9]{8}$").expect("trades table regex"));

pub struct RedisSink {
    conn: Mutex<ConnectionManager>,
}

impl RedisSink {
    /// Connect to a `host:port` destination and database index.
    pub async fn connect(dest: &str, db: u32) -> Result<Self> {
        let (host, port) = dest
            .split_once(':')
            .ok_or_else(|| FeedError::Config(format!("kv destination '{dest}' is not host:port")))?;
        let client = redis::Client::open(format!("redis://{host}:{port}/{db}"))?;
        let conn = client.get_connection_manager().await?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    async fn write_snapshot(&self, table: &str, columns: &[&str], values: &[SqlValue]) -> Result<()> {
        let exchange = column_text(columns, values, "exchange")
            .ok_or_else(|| FeedError::Sink(format!("{table}: missing exchange column")))?
            .to_lowercase();
        let instmt = column_text(columns, values, "instmt")
            .ok_or_else(|| FeedError::Sink(format!("{table}: missing instmt column")))?
            .to_lowercase();
        let payload = snapshot_payload(table, columns, values).to_string();

        let mut conn = self.conn.lock().await;
        for (column, value) in columns.iter().zip(values) {
            let key = snapshot_key(&exchange, &instmt, column);
            let _: () = conn.set(key, value.render_plain()).await?;
        }
        let _: () = conn.publish(SNAPSHOT_CHANNEL, payload).await?;
        Ok(())
    }

    async fn write_trade_bucket(
        &self,
        exchange: &str,
        instmt: &str,
        columns: &[&str],
        values: &[SqlValue],
    ) -> Result<()> {
        let Some(date_time) = column_text(columns, values, "date_time") else {
            warn!("trade row without date_time, skipping bucket write");
            return Ok(());
        };
        let Some(epoch) = util::date_time_to_epoch(date_time) else {
            warn!("trade row with unparsable date_time '{date_time}', skipping bucket write");
            return Ok(());
        };
        let price = column_value(columns, values, "trade_px")
            .map(plain_number)
            .unwrap_or_default();
        let volume = column_value(columns, values, "trade_volume")
            .map(plain_number)
            .unwrap_or_default();

        let period_key = period_key(exchange, instmt, epoch);
        let queue_key = queue_key(exchange, instmt);
        let prices_key = prices_key(exchange, instmt);

        let mut conn = self.conn.lock().await;
        let _: () = conn.lpush(&period_key, bucket_value(&price, &volume)).await?;
        let _: () = conn.zadd(queue_key, period_key, epoch).await?;
        let _: () = conn
            .zadd(prices_key, format!("{epoch}/{price}"), epoch)
            .await?;
        Ok(())
    }
}

// ------------------------------------------------------------
// Key layout
// ------------------------------------------------------------

pub fn snapshot_key(exchange: &str, instmt: &str, column: &str) -> String {
    format!(
        "{KEY_PREFIX}es_{}_{}_{}",
        exchange.to_lowercase(),
        instmt.to_lowercase(),
        column.to_lowercase()
    )
}

pub fn period_key(exchange: &str, instmt: &str, epoch: i64) -> String {
    format!("{KEY_PREFIX}etp_{exchange}_{instmt}_{epoch}")
}

pub fn queue_key(exchange: &str, instmt: &str) -> String {
    format!("{KEY_PREFIX}etpq_{exchange}_{instmt}")
}

pub fn prices_key(exchange: &str, instmt: &str) -> String {
    format!("{KEY_PREFIX}etpr_{exchange}_{instmt}")
}

/// Bucket list entry: `<price>/<volume>`, plain decimals.
fn bucket_value(price: &str, volume: &str) -> String {
    format!("{price}/{volume}")
}

/// Decimal cells without trailing zeros, so `100.10` and `100.1` encode
/// the same bucket entry.
fn plain_number(value: &SqlValue) -> String {
    match value {
        SqlValue::Decimal(d) => d.normalize().to_string(),
        other => other.render_plain(),
    }
}

fn snapshot_payload(table: &str, columns: &[&str], values: &[SqlValue]) -> serde_json::Value {
    let mut payload = serde_json::Map::new();
    payload.insert("table".to_string(), serde_json::Value::from(table));
    for (column, value) in columns.iter().zip(values) {
        payload.insert(column.to_string(), value.as_json());
    }
    serde_json::Value::Object(payload)
}

fn column_value<'a>(columns: &[&str], values: &'a [SqlValue], name: &str) -> Option<&'a SqlValue> {
    columns.iter().position(|c| *c == name).and_then(|i| values.get(i))
}

fn column_text<'a>(columns: &[&str], values: &'a [SqlValue], name: &str) -> Option<&'a str> {
    column_value(columns, values, name).and_then(SqlValue::as_text)
}

#[async_trait]
impl Sink for RedisSink {
    fn name(&self) -> &'static str {
        "kv"
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
        let result = if table == SNAPSHOT_TABLE {
            self.write_snapshot(table, columns, values).await
        } else if let Some(caps) = TRADES_TABLE.captures(table) {
            let exchange = caps[1].to_lowercase();
            let instmt = caps[2].to_lowercase();
            self.write_trade_bucket(&exchange, &instmt, columns, values)
                .await
        } else {
            // Per-instrument snapshot tables have no key-value projection.
            Ok(())
        };
        result.inspect_err(|err| error!("kv insert into {table} failed: {err}"))
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

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn key_layout_is_lowercased() {
        assert_eq!(
            snapshot_key("Okx", "BTC", "trade_px"),
            "befh_es_okx_btc_trade_px"
        );
        assert_eq!(period_key("okx", "btc", 1_700_000_000), "befh_etp_okx_btc_1700000000");
        assert_eq!(queue_key("okx", "btc"), "befh_etpq_okx_btc");
        assert_eq!(prices_key("okx", "btc"), "befh_etpr_okx_btc");
    }

    #[test]
    fn trades_table_names_are_recognized() {
        let caps = TRADES_TABLE.captures("exch_okx_btc_trades_20231114").unwrap();
        assert_eq!(&caps[1], "okx");
        assert_eq!(&caps[2], "btc");
        assert!(TRADES_TABLE.captures("exch_okx_btc_snapshot").is_none());
        assert!(TRADES_TABLE.captures("exchanges_snapshot").is_none());
    }

    #[test]
    fn bucket_entries_join_normalized_price_and_volume() {
        let price = SqlValue::Decimal(dec!(100.0));
        let volume = SqlValue::Decimal(dec!(0.1));
        assert_eq!(
            bucket_value(&plain_number(&price), &plain_number(&volume)),
            "100/0.1"
        );
    }

    #[test]
    fn snapshot_payload_carries_the_table_tag() {
        let payload = snapshot_payload(
            "exchanges_snapshot",
            &["exchange", "instmt", "trade_px"],
            &[
                SqlValue::Text("Okx".to_string()),
                SqlValue::Text("BTC".to_string()),
                SqlValue::Decimal(dec!(100.5)),
            ],
        );
        assert_eq!(payload["table"], "exchanges_snapshot");
        assert_eq!(payload["exchange"], "Okx");
        assert_eq!(payload["trade_px"], "100.5");
    }
}
