//! Socket publisher sink.
//!
//! Serializes one row as a single tagged JSON line per insert and ships
//! it over a persistent TCP connection. There is no durability: rows
//! are dropped when the connection is down and the queue overflows, and
//! the publisher must never block an instrument worker.

use async_trait::async_trait;
use log::{debug, info, warn};
use rand::random_range;
use serde_json::json;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::{Duration, sleep};

use super::{ColumnType, Sink, SqlValue};
use crate::error::{FeedError, Result};

const QUEUE_CAPACITY: usize = 10_000;

pub struct SocketSink {
    queue: mpsc::Sender<String>,
}

impl SocketSink {
    /// Start a background publisher for a `tcp://host:port` destination.
    ///
    /// The connection is established (and re-established) by the
    /// background task; construction never fails on an unreachable peer.
    pub fn connect(dest: &str) -> Result<Self> {
        let addr = dest
            .strip_prefix("tcp://")
            .unwrap_or(dest)
            .trim()
            .to_string();
        if addr.is_empty() {
            return Err(FeedError::Config(format!(
                "socket publisher destination '{dest}' is empty"
            )));
        }

        let (tx, rx) = mpsc::channel::<String>(QUEUE_CAPACITY);
        tokio::spawn(run_publisher(addr, rx));
        Ok(Self { queue: tx })
    }
}

/// Reconnect loop owning the outbound connection.
///
/// Exits only when every queue sender is gone (sink closed).
async fn run_publisher(addr: String, mut rx: mpsc::Receiver<String>) {
    loop {
        let mut stream = match TcpStream::connect(&addr).await {
            Ok(stream) => {
                info!("socket publisher connected to {addr}");
                stream
            }
            Err(err) => {
                warn!("socket publisher connect to {addr} failed: {err}");
                sleep(reconnect_delay()).await;
                continue;
            }
        };

        loop {
            match rx.recv().await {
                Some(line) => {
                    if let Err(err) = stream.write_all(line.as_bytes()).await {
                        warn!("socket publisher write failed: {err}");
                        break;
                    }
                }
                None => return,
            }
        }

        sleep(reconnect_delay()).await;
    }
}

fn reconnect_delay() -> Duration {
    Duration::from_millis(5_000 + random_range(0..1_000))
}

#[async_trait]
impl Sink for SocketSink {
    fn name(&self) -> &'static str {
        "socket"
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
        let payload = json!({
            "table": table,
            "columns": columns,
            "values": values.iter().map(SqlValue::as_json).collect::<Vec<_>>(),
        });
        let mut line = payload.to_string();
        line.push('\n');

        match self.queue.try_send(line) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(_)) => {
                debug!("socket publisher queue full, dropping row for {table}");
                Ok(())
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                Err(FeedError::Sink("socket publisher task gone".to_string()))
            }
        }
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
    use tokio::io::AsyncBufReadExt;

    #[tokio::test]
    async fn rows_arrive_as_tagged_json_lines() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let sink = SocketSink::connect(&format!("tcp://{addr}")).unwrap();
        let (peer, _) = listener.accept().await.unwrap();

        sink.insert(
            "exchanges_snapshot",
            &["exchange", "trade_px"],
            &[ColumnType::Text, ColumnType::Decimal],
            &[
                SqlValue::Text("Okx".to_string()),
                SqlValue::Decimal(dec!(100.5)),
            ],
            &[0],
            true,
            true,
        )
        .await
        .unwrap();

        let mut reader = tokio::io::BufReader::new(peer);
        let mut line = String::new();
        reader.read_line(&mut line).await.unwrap();

        let parsed: serde_json::Value = serde_json::from_str(&line).unwrap();
        assert_eq!(parsed["table"], "exchanges_snapshot");
        assert_eq!(parsed["columns"][0], "exchange");
        assert_eq!(parsed["values"][1], "100.5");
    }
}
