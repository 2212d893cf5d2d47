//! Columnar append sink speaking the kdb+ IPC protocol.
//!
//! Rows are appended as evaluated q expressions over a persistent TCP
//! connection. There is no upsert: `or_replace` maps to append even on
//! the snapshot table, because the downstream engine computes
//! latest-by-key on read. Queries are not supported; `select` yields no
//! rows, the same as the key-value sink.

use async_trait::async_trait;
use log::{error, info};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::Mutex;

use super::{ColumnType, Sink, SqlValue};
use crate::error::{FeedError, Result};

/// IPC capability requested during the handshake (kdb+ 3.0 wire format).
const CAPABILITY: u8 = 3;

pub struct KdbSink {
    stream: Mutex<TcpStream>,
}

impl KdbSink {
    /// Connect to a `host:port` destination and complete the handshake.
    pub async fn connect(dest: &str) -> Result<Self> {
        let mut stream = TcpStream::connect(dest).await?;

        let mut hello = Vec::from("marketfeed:".as_bytes());
        hello.push(CAPABILITY);
        hello.push(0);
        stream.write_all(&hello).await?;

        let mut ack = [0u8; 1];
        stream.read_exact(&mut ack).await.map_err(|err| {
            FeedError::Transport(format!("kdb handshake with {dest} rejected: {err}"))
        })?;

        info!("connected kdb sink at {dest} (ipc v{})", ack[0]);
        Ok(Self {
            stream: Mutex::new(stream),
        })
    }

    /// Send one q expression as an async IPC message.
    async fn eval(&self, expression: &str) -> Result<()> {
        let message = encode_async_message(expression);
        let mut stream = self.stream.lock().await;
        stream.write_all(&message).await.map_err(|err| {
            FeedError::Sink(format!("kdb eval failed: {err}\n{expression}"))
        })
    }
}

/// Frame a q expression as an async message: 8-byte IPC header followed
/// by a char-vector payload.
fn encode_async_message(expression: &str) -> Vec<u8> {
    let body = expression.as_bytes();
    let total = (8 + 6 + body.len()) as u32;

    let mut message = Vec::with_capacity(total as usize);
    message.extend_from_slice(&[1, 0, 0, 0]); // little endian, async
    message.extend_from_slice(&total.to_le_bytes());
    message.push(10); // char vector
    message.push(0); // no attributes
    message.extend_from_slice(&(body.len() as u32).to_le_bytes());
    message.extend_from_slice(body);
    message
}

fn q_column_type(column_type: ColumnType) -> &'static str {
    match column_type {
        ColumnType::BigInt => "`long$()",
        ColumnType::Decimal => "`float$()",
        ColumnType::Text | ColumnType::DateTime => "`symbol$()",
    }
}

fn q_value(value: &SqlValue) -> String {
    match value {
        SqlValue::Int(v) => v.to_string(),
        SqlValue::Decimal(v) => {
            // A bare integer literal would parse as a long and break the
            // float column; force the float suffix.
            let rendered = v.to_string();
            if rendered.contains('.') {
                rendered
            } else {
                format!("{rendered}f")
            }
        }
        SqlValue::Text(v) => format!("`$\"{}\"", v.replace('\\', "\\\\").replace('"', "\\\"")),
    }
}

fn render_create(table: &str, columns: &[&str], types: &[ColumnType], if_not_exists: bool) -> String {
    let definitions: Vec<String> = columns
        .iter()
        .zip(types)
        .map(|(column, column_type)| format!("{column}:{}", q_column_type(*column_type)))
        .collect();
    let schema = format!("{table}:([]{})", definitions.join(";"));
    if if_not_exists {
        format!("if[not `{table} in tables[];{schema}]")
    } else {
        schema
    }
}

fn render_insert(table: &str, values: &[SqlValue]) -> String {
    let rendered: Vec<String> = values.iter().map(q_value).collect();
    format!("`{table} insert ({})", rendered.join(";"))
}

#[async_trait]
impl Sink for KdbSink {
    fn name(&self) -> &'static str {
        "kdb"
    }

    async fn create(
        &self,
        table: &str,
        columns: &[&str],
        types: &[ColumnType],
        _primary_key_index: &[usize],
        if_not_exists: bool,
    ) -> Result<()> {
        self.eval(&render_create(table, columns, types, if_not_exists))
            .await
            .inspect_err(|err| error!("{err}"))
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
        if columns.len() != values.len() {
            return Err(FeedError::Sink(format!(
                "{table}: {} columns but {} values",
                columns.len(),
                values.len()
            )));
        }
        self.eval(&render_insert(table, values))
            .await
            .inspect_err(|err| error!("{err}"))
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

    async fn delete(&self, table: &str, _condition: &str) -> Result<()> {
        self.eval(&format!("delete from `{table}")).await
    }

    async fn commit(&self) -> Result<()> {
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        let mut stream = self.stream.lock().await;
        let _ = stream.shutdown().await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn create_guards_existing_tables() {
        let expr = render_create(
            "exchanges_snapshot",
            &["exchange", "trade_px", "trade_id"],
            &[ColumnType::Text, ColumnType::Decimal, ColumnType::BigInt],
            true,
        );
        assert_eq!(
            expr,
            "if[not `exchanges_snapshot in tables[];\
             exchanges_snapshot:([]exchange:`symbol$();trade_px:`float$();trade_id:`long$())]"
        );
    }

    #[test]
    fn insert_renders_typed_literals() {
        let expr = render_insert(
            "exch_okx_btc_trades_20231114",
            &[
                SqlValue::Int(1),
                SqlValue::Text("a".to_string()),
                SqlValue::Decimal(dec!(100.5)),
                SqlValue::Decimal(dec!(100)),
            ],
        );
        assert_eq!(
            expr,
            "`exch_okx_btc_trades_20231114 insert (1;`$\"a\";100.5;100f)"
        );
    }

    #[test]
    fn async_message_frames_the_expression() {
        let message = encode_async_message("1+1");
        assert_eq!(&message[..4], &[1, 0, 0, 0]);
        assert_eq!(u32::from_le_bytes(message[4..8].try_into().unwrap()), 17);
        assert_eq!(message[8], 10);
        assert_eq!(&message[14..], b"1+1");
    }
}
