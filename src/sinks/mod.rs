//! Persistence and publication sinks.
//!
//! Every emitted snapshot, order-book row and trade is routed to an
//! ordered collection of sinks behind one abstract contract. The
//! contract is semantic, not SQL-specific: key-value, columnar, file and
//! socket adapters implement the same operations as the relational
//! family.
//!
//! A sink failure is the sink's problem: adapters log the failing
//! statement and return an error, and the caller moves on to the next
//! sink. The ingest path never blocks or crashes on a sink.

pub mod csv;
pub mod kdb;
pub mod redis_kv;
pub mod socket;
pub mod sql;

use async_trait::async_trait;
use rust_decimal::Decimal;

use crate::error::Result;

/// Abstract column types understood by every adapter.
///
/// Timestamps travel as formatted text; decimals are `decimal(20,8)` on
/// engines that support it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnType {
    BigInt,
    Decimal,
    Text,
    DateTime,
}

/// Abstract cell values routed through the sink contract.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SqlValue {
    Int(i64),
    Decimal(Decimal),
    Text(String),
}

impl SqlValue {
    /// SQL literal rendering. Single quotes in text are escaped by
    /// doubling; decimals never use scientific notation.
    pub fn render_literal(&self) -> String {
        match self {
            SqlValue::Int(v) => v.to_string(),
            SqlValue::Decimal(v) => v.to_string(),
            SqlValue::Text(v) => format!("'{}'", v.replace('\'', "''")),
        }
    }

    /// Bare rendering for non-SQL adapters (CSV cells, key-value
    /// payloads).
    pub fn render_plain(&self) -> String {
        match self {
            SqlValue::Int(v) => v.to_string(),
            SqlValue::Decimal(v) => v.to_string(),
            SqlValue::Text(v) => v.clone(),
        }
    }

    pub fn as_json(&self) -> serde_json::Value {
        match self {
            SqlValue::Int(v) => serde_json::Value::from(*v),
            SqlValue::Decimal(v) => serde_json::Value::from(v.to_string()),
            SqlValue::Text(v) => serde_json::Value::from(v.clone()),
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            SqlValue::Int(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            SqlValue::Text(v) => Some(v),
            _ => None,
        }
    }
}

/// Uniform sink contract.
///
/// Connection happens at construction; the remaining operations follow
/// one shape across adapters:
///
/// - `create` declares a table, optionally guarded by if-not-exists
/// - `insert` writes one row; with `or_replace` and a non-empty
///   `primary_key_index` the row whose key columns match is replaced
/// - `select`/`delete` take a rendered condition string
/// - `commit` is a no-op on autocommitting adapters
///
/// Implementations hold an internal exclusive lock for the duration of a
/// single `insert` so bursts from multiple instrument workers cannot
/// interleave statements on one connection.
#[async_trait]
pub trait Sink: Send + Sync {
    fn name(&self) -> &'static str;

    async fn create(
        &self,
        table: &str,
        columns: &[&str],
        types: &[ColumnType],
        primary_key_index: &[usize],
        if_not_exists: bool,
    ) -> Result<()>;

    #[allow(clippy::too_many_arguments)]
    async fn insert(
        &self,
        table: &str,
        columns: &[&str],
        types: &[ColumnType],
        values: &[SqlValue],
        primary_key_index: &[usize],
        or_replace: bool,
        commit: bool,
    ) -> Result<()>;

    async fn select(
        &self,
        table: &str,
        columns: &[&str],
        condition: &str,
        order_by: &str,
        limit: u64,
    ) -> Result<Vec<Vec<SqlValue>>>;

    async fn delete(&self, table: &str, condition: &str) -> Result<()>;

    async fn commit(&self) -> Result<()>;

    async fn close(&self) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn text_literals_double_single_quotes() {
        let value = SqlValue::Text("o'clock".to_string());
        assert_eq!(value.render_literal(), "'o''clock'");
        assert_eq!(value.render_plain(), "o'clock");
    }

    #[test]
    fn decimals_render_without_scientific_notation() {
        let value = SqlValue::Decimal(dec!(0.00000001));
        assert_eq!(value.render_literal(), "0.00000001");
    }
}
