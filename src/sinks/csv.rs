//! CSV file sink.
//!
//! One file per table under a configured directory. Daily rotation falls
//! out of the `_YYYYMMDD` suffix already baked into trade table names; a
//! header row is written the first time a table file is touched.

use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::fs::{File, OpenOptions};
use std::path::PathBuf;
use std::sync::Mutex;

use async_trait::async_trait;
use log::error;

use super::{ColumnType, Sink, SqlValue};
use crate::error::{FeedError, Result};

pub struct CsvSink {
    dir: PathBuf,
    writers: Mutex<HashMap<String, csv::Writer<File>>>,
}

impl CsvSink {
    pub fn connect(dir: &str) -> Result<Self> {
        let dir = PathBuf::from(dir);
        std::fs::create_dir_all(&dir)?;
        Ok(Self {
            dir,
            writers: Mutex::new(HashMap::new()),
        })
    }

    /// Append `row` to the table file, writing the header first when the
    /// file is new or empty.
    fn append(&self, table: &str, columns: &[&str], row: Vec<String>) -> Result<()> {
        let mut writers = self
            .writers
            .lock()
            .map_err(|_| FeedError::Sink("csv writer lock poisoned".to_string()))?;

        let writer = match writers.entry(table.to_string()) {
            Entry::Occupied(entry) => entry.into_mut(),
            Entry::Vacant(entry) => {
                let path = self.dir.join(format!("{table}.csv"));
                let fresh = std::fs::metadata(&path).map(|m| m.len() == 0).unwrap_or(true);
                let file = OpenOptions::new().create(true).append(true).open(&path)?;
                let mut writer = csv::Writer::from_writer(file);
                if fresh {
                    writer
                        .write_record(columns)
                        .map_err(|err| FeedError::Sink(err.to_string()))?;
                }
                entry.insert(writer)
            }
        };

        writer
            .write_record(&row)
            .and_then(|_| writer.flush().map_err(csv::Error::from))
            .map_err(|err| FeedError::Sink(err.to_string()))
    }
}

#[async_trait]
impl Sink for CsvSink {
    fn name(&self) -> &'static str {
        "csv"
    }

    async fn create(
        &self,
        _table: &str,
        _columns: &[&str],
        _types: &[ColumnType],
        _primary_key_index: &[usize],
        _if_not_exists: bool,
    ) -> Result<()> {
        // Files materialize on first insert.
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
        let row: Vec<String> = values.iter().map(SqlValue::render_plain).collect();
        self.append(table, columns, row).inspect_err(|err| {
            error!("csv insert into {table} failed: {err}");
        })
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
        let mut writers = self
            .writers
            .lock()
            .map_err(|_| FeedError::Sink("csv writer lock poisoned".to_string()))?;
        for writer in writers.values_mut() {
            let _ = writer.flush();
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[tokio::test]
    async fn header_is_written_once() {
        let dir = tempfile::tempdir().unwrap();
        let sink = CsvSink::connect(dir.path().to_str().unwrap()).unwrap();
        let columns = ["id", "trade_px"];
        let types = [ColumnType::BigInt, ColumnType::Decimal];

        for id in 1..=2 {
            sink.insert(
                "exch_okx_btc_trades_20231114",
                &columns,
                &types,
                &[SqlValue::Int(id), SqlValue::Decimal(dec!(100.5))],
                &[0],
                false,
                true,
            )
            .await
            .unwrap();
        }

        let content =
            std::fs::read_to_string(dir.path().join("exch_okx_btc_trades_20231114.csv")).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines, vec!["id,trade_px", "1,100.5", "2,100.5"]);
    }
}
