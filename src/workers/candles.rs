//! Candle worker.
//!
//! Once per second, sweeps the per-instrument bucket queues in the
//! key-value store and drains every bucket old enough to be complete
//! into an OHLCV candle. A bucket is eligible once its epoch second is
//! more than the lateness threshold behind the clock; younger buckets
//! stay queued for a later tick. Draining reads the whole list, then
//! deletes the bucket and its queue entry, so a racing trade write
//! simply re-creates the bucket and re-queues it for the next tick.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::Utc;
use log::{info, warn};
use once_cell::sync::Lazy;
use redis::AsyncCommands;
use redis::aio::ConnectionManager;
use regex::Regex;
use rust_decimal::Decimal;
use tokio::time::Duration;

use crate::error::Result;
use crate::sinks::redis_kv;
use crate::subscription::Subscription;

/// Minimum age in seconds before a bucket may be drained.
pub const LATENESS_SECONDS: i64 = 5;

/// Bucket keys end in their epoch second.
static PERIOD_EPOCH: Lazy<Regex> =
    Lazy::new(|| Regex::new(r".*_([0-9]{10})$").expect("period key regex"));

/// One period's aggregate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Candle {
    pub open: Decimal,
    pub high: Decimal,
    pub low: Decimal,
    pub close: Decimal,
    pub volume: Decimal,
}

impl Candle {
    /// OHLCV of a chronologically ordered trade list; all zeros when the
    /// list is empty.
    pub fn from_trades(trades: &[(Decimal, Decimal)]) -> Self {
        let Some(((first, _), (last, _))) = trades.first().zip(trades.last()) else {
            return Self {
                open: Decimal::ZERO,
                high: Decimal::ZERO,
                low: Decimal::ZERO,
                close: Decimal::ZERO,
                volume: Decimal::ZERO,
            };
        };
        Self {
            open: *first,
            high: trades.iter().map(|(price, _)| *price).max().unwrap_or_default(),
            low: trades.iter().map(|(price, _)| *price).min().unwrap_or_default(),
            close: *last,
            volume: trades.iter().map(|(_, volume)| *volume).sum(),
        }
    }
}

/// Decode `<price>/<volume>` bucket entries; malformed entries are
/// dropped.
pub fn parse_bucket_values(values: &[String]) -> Vec<(Decimal, Decimal)> {
    values
        .iter()
        .filter_map(|value| {
            let (price, volume) = value.split_once('/')?;
            Some((
                crate::util::parse_decimal(price),
                crate::util::parse_decimal(volume),
            ))
        })
        .collect()
}

/// Epoch second suffix of a bucket key.
pub fn bucket_epoch(period_key: &str) -> Option<i64> {
    PERIOD_EPOCH
        .captures(period_key)
        .and_then(|caps| caps[1].parse().ok())
}

/// True once a bucket is old enough to be complete.
pub fn drainable(epoch: i64, now: i64) -> bool {
    epoch < now - LATENESS_SECONDS
}

/// Non-reentrancy latch: a sweep that is still in flight when the next
/// tick fires makes the new tick return immediately.
#[derive(Default)]
pub struct SweepGuard(AtomicBool);

impl SweepGuard {
    /// Claim the sweep; false when one is already running.
    pub fn try_begin(&self) -> bool {
        !self.0.swap(true, Ordering::SeqCst)
    }

    pub fn end(&self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

pub struct CandleWorker {
    conn: ConnectionManager,
    instruments: Vec<(String, String)>,
    draining: SweepGuard,
    cold_start: AtomicBool,
}

impl CandleWorker {
    pub fn new(conn: ConnectionManager, subscriptions: &[Subscription]) -> Arc<Self> {
        let instruments = subscriptions
            .iter()
            .map(|sub| (sub.exchange.to_lowercase(), sub.instmt_name.to_lowercase()))
            .collect();
        Arc::new(Self {
            conn,
            instruments,
            draining: SweepGuard::default(),
            cold_start: AtomicBool::new(true),
        })
    }

    /// Tick once per second forever. Each tick runs as its own task so a
    /// slow drain never delays the schedule; the non-reentrancy flag
    /// keeps overlapping ticks from draining the same bucket twice.
    pub async fn run(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(Duration::from_secs(1));
        loop {
            ticker.tick().await;
            let worker = Arc::clone(&self);
            tokio::spawn(async move {
                worker.tick().await;
            });
        }
    }

    pub async fn tick(&self) {
        if !self.draining.try_begin() {
            return;
        }
        let cold = self.cold_start.swap(false, Ordering::SeqCst);
        for (exchange, instmt) in &self.instruments {
            if let Err(err) = self.sweep(exchange, instmt, cold).await {
                warn!("candle sweep {exchange}/{instmt} failed: {err}");
            }
        }
        self.draining.end();
    }

    /// Drain every eligible bucket of one instrument.
    ///
    /// A cold start reads the whole queue to catch up on buckets left
    /// behind by an earlier run; in steady state only the lowest-scored
    /// entry can be old enough.
    async fn sweep(&self, exchange: &str, instmt: &str, cold: bool) -> Result<()> {
        let queue_key = redis_kv::queue_key(exchange, instmt);
        let mut conn = self.conn.clone();

        let window_end = if cold { -1 } else { 0 };
        let period_keys: Vec<String> = conn.zrange(&queue_key, 0, window_end).await?;
        let now = Utc::now().timestamp();

        for period_key in period_keys {
            let Some(epoch) = bucket_epoch(&period_key) else {
                warn!("queue entry without epoch suffix: {period_key}");
                continue;
            };
            if !drainable(epoch, now) {
                continue;
            }

            let raw: Vec<String> = conn.lrange(&period_key, 0, -1).await?;
            // LPUSH prepends, so the list is newest first.
            let mut trades = parse_bucket_values(&raw);
            trades.reverse();
            let candle = Candle::from_trades(&trades);

            let _: () = conn.del(&period_key).await?;
            let _: () = conn.zrem(&queue_key, &period_key).await?;

            info!(
                "{exchange}/{instmt} {epoch} o={} h={} l={} c={} v={}",
                candle.open, candle.high, candle.low, candle.close, candle.volume
            );
        }
        Ok(())
    }
}
