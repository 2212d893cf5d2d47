//! Exchange gateway base.
//!
//! Drives one instrument to steady state and routes every normalized
//! event to the sink collection. Venue specifics stay behind the
//! `VenueApi` trait; this module owns table schemas, id restoration and
//! the insert fan-out.

pub mod dispatch;

use std::sync::Arc;

use chrono::Utc;
use log::{info, warn};
use tokio::task::JoinHandle;

use crate::api::rest::RestClient;
use crate::error::Result;
use crate::exchanges::adapter::VenueApi;
use crate::instrument::Instrument;
use crate::market_data::{L2Depth, Trade};
use crate::settings::FeedSettings;
use crate::sinks::{ColumnType, Sink, SqlValue};
use crate::subscription::Subscription;

/// Shared upsert table holding the latest snapshot per instrument.
pub const EXCHANGES_SNAPSHOT_TABLE: &str = "exchanges_snapshot";

/// Book levels serialized into each persisted row. The in-memory book
/// (and the diff detector) still cover the full configured depth.
pub const SNAPSHOT_DEPTH: usize = 5;

// ------------------------------------------------------------
// Table schemas
// ------------------------------------------------------------

pub const SNAPSHOT_COLUMNS: &[&str] = &[
    "exchange", "instmt", "trade_px", "trade_volume", "trade_side",
    "b1", "b2", "b3", "b4", "b5",
    "bv1", "bv2", "bv3", "bv4", "bv5",
    "bc1", "bc2", "bc3", "bc4", "bc5",
    "a1", "a2", "a3", "a4", "a5",
    "av1", "av2", "av3", "av4", "av5",
    "ac1", "ac2", "ac3", "ac4", "ac5",
    "order_book_id", "trade_id", "exch_trade_id",
    "order_book_date_time", "trades_date_time", "update_type",
];

pub const SNAPSHOT_PRIMARY_KEY: &[usize] = &[0, 1];

pub const ORDER_BOOK_COLUMNS: &[&str] = &[
    "id", "date_time", "update_type",
    "b1", "b2", "b3", "b4", "b5",
    "bv1", "bv2", "bv3", "bv4", "bv5",
    "bc1", "bc2", "bc3", "bc4", "bc5",
    "a1", "a2", "a3", "a4", "a5",
    "av1", "av2", "av3", "av4", "av5",
    "ac1", "ac2", "ac3", "ac4", "ac5",
];

pub const TRADES_COLUMNS: &[&str] = &[
    "id", "exch_trade_id", "date_time", "trade_px", "trade_volume", "trade_side",
];

pub fn snapshot_types() -> Vec<ColumnType> {
    let mut types = vec![
        ColumnType::Text,
        ColumnType::Text,
        ColumnType::Decimal,
        ColumnType::Decimal,
        ColumnType::BigInt,
    ];
    types.extend(level_types());
    types.extend([
        ColumnType::BigInt,
        ColumnType::BigInt,
        ColumnType::Text,
        ColumnType::DateTime,
        ColumnType::DateTime,
        ColumnType::BigInt,
    ]);
    types
}

pub fn order_book_types() -> Vec<ColumnType> {
    let mut types = vec![ColumnType::BigInt, ColumnType::DateTime, ColumnType::BigInt];
    types.extend(level_types());
    types
}

pub fn trades_types() -> Vec<ColumnType> {
    vec![
        ColumnType::BigInt,
        ColumnType::Text,
        ColumnType::DateTime,
        ColumnType::Decimal,
        ColumnType::Decimal,
        ColumnType::BigInt,
    ]
}

/// b, bv, bc, a, av, ac blocks of `SNAPSHOT_DEPTH` each.
fn level_types() -> Vec<ColumnType> {
    let mut types = Vec::with_capacity(SNAPSHOT_DEPTH * 6);
    for block in [
        ColumnType::Decimal,
        ColumnType::Decimal,
        ColumnType::BigInt,
        ColumnType::Decimal,
        ColumnType::Decimal,
        ColumnType::BigInt,
    ] {
        types.extend(std::iter::repeat_n(block, SNAPSHOT_DEPTH));
    }
    types
}

pub fn instmt_snapshot_table_name(exchange: &str, instmt: &str) -> String {
    format!(
        "exch_{}_{}_snapshot",
        exchange.to_lowercase(),
        instmt.to_lowercase()
    )
}

pub fn instmt_trades_table_name(exchange: &str, instmt: &str, day: &str) -> String {
    format!(
        "exch_{}_{}_trades_{}",
        exchange.to_lowercase(),
        instmt.to_lowercase(),
        day
    )
}

// ------------------------------------------------------------
// Row builders
// ------------------------------------------------------------

/// b/bv/bc then a/av/ac blocks for the persisted top levels.
fn level_values(l2_depth: &L2Depth) -> Vec<SqlValue> {
    let mut values = Vec::with_capacity(SNAPSHOT_DEPTH * 6);
    let sides = [&l2_depth.bids, &l2_depth.asks];
    for side in sides {
        for i in 0..SNAPSHOT_DEPTH {
            values.push(SqlValue::Decimal(
                side.get(i).map(|l| l.price).unwrap_or_default(),
            ));
        }
        for i in 0..SNAPSHOT_DEPTH {
            values.push(SqlValue::Decimal(
                side.get(i).map(|l| l.volume).unwrap_or_default(),
            ));
        }
        for i in 0..SNAPSHOT_DEPTH {
            values.push(SqlValue::Int(side.get(i).map(|l| l.count).unwrap_or_default()));
        }
    }
    values
}

fn snapshot_values(instmt: &Instrument) -> Vec<SqlValue> {
    let mut values = vec![
        SqlValue::Text(instmt.exchange_name.clone()),
        SqlValue::Text(instmt.instmt_name.clone()),
        SqlValue::Decimal(instmt.last_trade.trade_price),
        SqlValue::Decimal(instmt.last_trade.trade_volume),
        SqlValue::Int(instmt.last_trade.trade_side.as_i64()),
    ];
    values.extend(level_values(&instmt.l2_depth));
    values.extend([
        SqlValue::Int(instmt.order_book_id),
        SqlValue::Int(instmt.trade_id),
        SqlValue::Text(instmt.exch_trade_id.clone()),
        SqlValue::Text(instmt.l2_depth.date_time.clone()),
        SqlValue::Text(instmt.last_trade.date_time.clone()),
        SqlValue::Int(instmt.l2_depth.update_type.as_i64()),
    ]);
    values
}

fn order_book_values(instmt: &Instrument) -> Vec<SqlValue> {
    let mut values = vec![
        SqlValue::Int(instmt.order_book_id),
        SqlValue::Text(instmt.l2_depth.date_time.clone()),
        SqlValue::Int(instmt.l2_depth.update_type.as_i64()),
    ];
    values.extend(level_values(&instmt.l2_depth));
    values
}

fn trade_values(instmt: &Instrument, trade: &Trade) -> Vec<SqlValue> {
    vec![
        SqlValue::Int(instmt.trade_id),
        SqlValue::Text(trade.trade_id.clone()),
        SqlValue::Text(trade.date_time.clone()),
        SqlValue::Decimal(trade.trade_price),
        SqlValue::Decimal(trade.trade_volume),
        SqlValue::Int(trade.trade_side.as_i64()),
    ]
}

// ------------------------------------------------------------
// Gateway
// ------------------------------------------------------------

pub struct ExchangeGateway {
    sinks: Vec<Arc<dyn Sink>>,
    settings: FeedSettings,
    rest: RestClient,
}

impl ExchangeGateway {
    pub fn new(sinks: Vec<Arc<dyn Sink>>, settings: FeedSettings) -> Result<Self> {
        let rest = RestClient::new(settings.proxy.as_deref())?;
        Ok(Self {
            sinks,
            settings,
            rest,
        })
    }

    pub fn settings(&self) -> &FeedSettings {
        &self.settings
    }

    pub fn rest(&self) -> &RestClient {
        &self.rest
    }

    /// Create the shared snapshot table on every sink. Called once at
    /// startup, before any worker spawns.
    pub async fn init_snapshot_table(&self) {
        for sink in &self.sinks {
            let _ = sink
                .create(
                    EXCHANGES_SNAPSHOT_TABLE,
                    SNAPSHOT_COLUMNS,
                    &snapshot_types(),
                    SNAPSHOT_PRIMARY_KEY,
                    true,
                )
                .await;
        }
    }

    /// Bring one instrument to steady state: allocate its books, create
    /// its tables, restore its counters and spawn the transport worker.
    pub async fn start(
        self: &Arc<Self>,
        venue: Arc<dyn VenueApi>,
        sub: &Subscription,
    ) -> Vec<JoinHandle<()>> {
        // A subscription may override the book depth for its venue.
        let depth = sub
            .extras
            .get("depth")
            .and_then(|value| value.parse().ok())
            .unwrap_or(self.settings.depth);
        let mut instmt = Instrument::from_subscription(sub, depth);
        let day = Utc::now().format("%Y%m%d").to_string();
        instmt.snapshot_table_name =
            instmt_snapshot_table_name(&instmt.exchange_name, &instmt.instmt_name);
        instmt.trades_table_name =
            instmt_trades_table_name(&instmt.exchange_name, &instmt.instmt_name, &day);

        self.init_instmt_tables(&instmt).await;
        self.restore_ids(&mut instmt).await;
        info!(
            "starting {}/{} (order_book_id={}, trade_id={})",
            instmt.exchange_name, instmt.instmt_name, instmt.order_book_id, instmt.trade_id
        );

        let gateway = Arc::clone(self);
        vec![tokio::spawn(async move {
            dispatch::run(gateway, venue, instmt).await;
        })]
    }

    async fn init_instmt_tables(&self, instmt: &Instrument) {
        for sink in &self.sinks {
            let _ = sink
                .create(
                    &instmt.snapshot_table_name,
                    ORDER_BOOK_COLUMNS,
                    &order_book_types(),
                    &[0],
                    true,
                )
                .await;
            let _ = sink
                .create(
                    &instmt.trades_table_name,
                    TRADES_COLUMNS,
                    &trades_types(),
                    &[0],
                    true,
                )
                .await;
        }
    }

    /// Resume the monotonic ids from the highest persisted rows. The
    /// first sink that can answer wins; query-less sinks return nothing.
    async fn restore_ids(&self, instmt: &mut Instrument) {
        for sink in &self.sinks {
            match sink
                .select(&instmt.snapshot_table_name, &["id"], "", "id DESC", 1)
                .await
            {
                Ok(rows) => {
                    if let Some(id) = rows.first().and_then(|r| r.first()).and_then(SqlValue::as_int)
                    {
                        instmt.order_book_id = id;
                        break;
                    }
                }
                Err(err) => warn!(
                    "{}: order book id restore failed on {}: {err}",
                    instmt.exchange_name,
                    sink.name()
                ),
            }
        }

        for sink in &self.sinks {
            match sink
                .select(
                    &instmt.trades_table_name,
                    &["id", "exch_trade_id"],
                    "",
                    "id DESC",
                    1,
                )
                .await
            {
                Ok(rows) => {
                    if let Some(row) = rows.first() {
                        if let Some(id) = row.first().and_then(SqlValue::as_int) {
                            instmt.trade_id = id;
                        }
                        if let Some(exch_id) = row.get(1).and_then(SqlValue::as_text) {
                            instmt.exch_trade_id = exch_id.to_string();
                        }
                        break;
                    }
                }
                Err(err) => warn!(
                    "{}: trade id restore failed on {}: {err}",
                    instmt.exchange_name,
                    sink.name()
                ),
            }
        }
    }

    /// Serialize the current book into a snapshot upsert plus an
    /// order-book append, fanned out to every sink. A failing sink does
    /// not stop the remaining ones.
    pub async fn insert_order_book(&self, instmt: &Instrument) {
        if !instmt.l2_depth.is_ordered() {
            debug_assert!(
                instmt.l2_depth.is_ordered(),
                "unordered book emitted for {}/{}",
                instmt.exchange_name,
                instmt.instmt_name
            );
            log::error!(
                "{}/{}: unordered book emitted",
                instmt.exchange_name,
                instmt.instmt_name
            );
        }
        let snapshot = snapshot_values(instmt);
        let order_book = order_book_values(instmt);
        for sink in &self.sinks {
            let _ = sink
                .insert(
                    EXCHANGES_SNAPSHOT_TABLE,
                    SNAPSHOT_COLUMNS,
                    &snapshot_types(),
                    &snapshot,
                    SNAPSHOT_PRIMARY_KEY,
                    true,
                    true,
                )
                .await;
            let _ = sink
                .insert(
                    &instmt.snapshot_table_name,
                    ORDER_BOOK_COLUMNS,
                    &order_book_types(),
                    &order_book,
                    &[0],
                    false,
                    true,
                )
                .await;
        }
    }

    /// Append one trade row, then refresh the snapshot with the latest
    /// trade fields.
    pub async fn insert_trade(&self, instmt: &Instrument, trade: &Trade) {
        let row = trade_values(instmt, trade);
        let snapshot = snapshot_values(instmt);
        for sink in &self.sinks {
            let _ = sink
                .insert(
                    &instmt.trades_table_name,
                    TRADES_COLUMNS,
                    &trades_types(),
                    &row,
                    &[0],
                    false,
                    true,
                )
                .await;
            let _ = sink
                .insert(
                    EXCHANGES_SNAPSHOT_TABLE,
                    SNAPSHOT_COLUMNS,
                    &snapshot_types(),
                    &snapshot,
                    SNAPSHOT_PRIMARY_KEY,
                    true,
                    true,
                )
                .await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn schema_lengths_line_up() {
        assert_eq!(SNAPSHOT_COLUMNS.len(), snapshot_types().len());
        assert_eq!(ORDER_BOOK_COLUMNS.len(), order_book_types().len());
        assert_eq!(TRADES_COLUMNS.len(), trades_types().len());
    }

    #[test]
    fn table_names_are_lowercased_and_dated() {
        assert_eq!(
            instmt_snapshot_table_name("Okx", "BTC"),
            "exch_okx_btc_snapshot"
        );
        assert_eq!(
            instmt_trades_table_name("Okx", "BTC", "20231114"),
            "exch_okx_btc_trades_20231114"
        );
    }
}
