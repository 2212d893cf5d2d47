//! Secondary workloads consuming the key-value trade projection: the
//! per-second candle maker and the terminal price chart.

pub mod candles;
pub mod chart;

use redis::aio::ConnectionManager;

use crate::error::{FeedError, Result};

/// Connect to the key-value store backing the workers.
pub async fn connect_kv(dest: &str, db: u32) -> Result<ConnectionManager> {
    let (host, port) = dest
        .split_once(':')
        .ok_or_else(|| FeedError::Config(format!("kv destination '{dest}' is not host:port")))?;
    let client = redis::Client::open(format!("redis://{host}:{port}/{db}"))?;
    Ok(client.get_connection_manager().await?)
}
