//! Relational sink family.
//!
//! One adapter serves the whole SQL family through the runtime-selected
//! `sqlx` Any driver; the dialects differ only in their upsert rendering
//! and the text column type. Statements are rendered as literal SQL (the
//! row shape varies per table, so there is nothing to prepare against).

use std::sync::Once;

use async_trait::async_trait;
use log::{error, info};
use sqlx::any::AnyPoolOptions;
use sqlx::{AnyPool, Row};
use tokio::sync::Mutex;

use super::{ColumnType, Sink, SqlValue};
use crate::error::{FeedError, Result};
use crate::util;

static DRIVERS: Once = Once::new();

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SqlDialect {
    Sqlite,
    Mysql,
    Postgres,
}

pub struct SqlSink {
    dialect: SqlDialect,
    pool: AnyPool,
    lock: Mutex<()>,
}

impl SqlSink {
    /// SQLite over a database file (created when absent).
    pub async fn connect_sqlite(path: &str) -> Result<Self> {
        let url = if path == ":memory:" {
            "sqlite::memory:".to_string()
        } else {
            format!("sqlite://{path}?mode=rwc")
        };
        Self::connect(SqlDialect::Sqlite, &url).await
    }

    /// MySQL from a `user:pwd@host:port` destination plus schema.
    pub async fn connect_mysql(dest: &str, schema: &str) -> Result<Self> {
        Self::connect(SqlDialect::Mysql, &server_url("mysql", dest, schema)?).await
    }

    /// PostgreSQL from a `user:pwd@host:port` destination plus schema.
    pub async fn connect_postgres(dest: &str, schema: &str) -> Result<Self> {
        Self::connect(SqlDialect::Postgres, &server_url("postgres", dest, schema)?).await
    }

    async fn connect(dialect: SqlDialect, url: &str) -> Result<Self> {
        DRIVERS.call_once(sqlx::any::install_default_drivers);
        let pool = AnyPoolOptions::new().max_connections(1).connect(url).await?;
        info!("connected {dialect:?} sink");
        Ok(Self {
            dialect,
            pool,
            lock: Mutex::new(()),
        })
    }

    fn column_type(&self, column_type: ColumnType) -> &'static str {
        match column_type {
            ColumnType::BigInt => "BIGINT",
            ColumnType::Decimal => "DECIMAL(20,8)",
            // TEXT cannot participate in a MySQL primary key.
            ColumnType::Text | ColumnType::DateTime => match self.dialect {
                SqlDialect::Mysql => "VARCHAR(64)",
                _ => "TEXT",
            },
        }
    }

    fn render_create(
        &self,
        table: &str,
        columns: &[&str],
        types: &[ColumnType],
        primary_key_index: &[usize],
        if_not_exists: bool,
    ) -> String {
        let mut definitions: Vec<String> = columns
            .iter()
            .zip(types)
            .map(|(column, column_type)| format!("{column} {}", self.column_type(*column_type)))
            .collect();
        if !primary_key_index.is_empty() {
            let keys: Vec<&str> = primary_key_index.iter().map(|i| columns[*i]).collect();
            definitions.push(format!("PRIMARY KEY ({})", keys.join(",")));
        }
        format!(
            "CREATE TABLE {}{} ({})",
            if if_not_exists { "IF NOT EXISTS " } else { "" },
            table,
            definitions.join(",")
        )
    }

    fn render_insert(
        &self,
        table: &str,
        columns: &[&str],
        values: &[SqlValue],
        primary_key_index: &[usize],
        or_replace: bool,
    ) -> String {
        let column_list = columns.join(",");
        let value_list: Vec<String> = values.iter().map(SqlValue::render_literal).collect();
        let value_list = value_list.join(",");

        if !or_replace || primary_key_index.is_empty() {
            return format!("INSERT INTO {table} ({column_list}) VALUES ({value_list})");
        }

        match self.dialect {
            SqlDialect::Sqlite => {
                format!("INSERT OR REPLACE INTO {table} ({column_list}) VALUES ({value_list})")
            }
            SqlDialect::Mysql => format!(
                "INSERT INTO {table} ({column_list}) VALUES ({value_list}) \
                 ON DUPLICATE KEY UPDATE {}",
                non_key_assignments(columns, values, primary_key_index).join(",")
            ),
            SqlDialect::Postgres => {
                let keys: Vec<&str> = primary_key_index.iter().map(|i| columns[*i]).collect();
                format!(
                    "INSERT INTO {table} ({column_list}) VALUES ({value_list}) \
                     ON CONFLICT ({}) DO UPDATE SET {}",
                    keys.join(","),
                    non_key_assignments(columns, values, primary_key_index).join(",")
                )
            }
        }
    }

    async fn execute(&self, sql: &str) -> Result<()> {
        sqlx::query(sql).execute(&self.pool).await?;
        Ok(())
    }
}

fn non_key_assignments(
    columns: &[&str],
    values: &[SqlValue],
    primary_key_index: &[usize],
) -> Vec<String> {
    columns
        .iter()
        .zip(values)
        .enumerate()
        .filter(|(i, _)| !primary_key_index.contains(i))
        .map(|(_, (column, value))| format!("{column} = {}", value.render_literal()))
        .collect()
}

fn server_url(scheme: &str, dest: &str, schema: &str) -> Result<String> {
    let (credential, host) = dest
        .split_once('@')
        .ok_or_else(|| FeedError::Config(format!("destination '{dest}' is not user:pwd@host:port")))?;
    Ok(format!("{scheme}://{credential}@{host}/{schema}"))
}

fn decode_row(row: &sqlx::any::AnyRow) -> Vec<SqlValue> {
    (0..row.columns().len())
        .map(|i| {
            if let Ok(v) = row.try_get::<i64, _>(i) {
                SqlValue::Int(v)
            } else if let Ok(v) = row.try_get::<f64, _>(i) {
                SqlValue::Decimal(util::parse_decimal(&v.to_string()))
            } else if let Ok(v) = row.try_get::<String, _>(i) {
                SqlValue::Text(v)
            } else {
                SqlValue::Text(String::new())
            }
        })
        .collect()
}

#[async_trait]
impl Sink for SqlSink {
    fn name(&self) -> &'static str {
        match self.dialect {
            SqlDialect::Sqlite => "sqlite",
            SqlDialect::Mysql => "mysql",
            SqlDialect::Postgres => "postgres",
        }
    }

    async fn create(
        &self,
        table: &str,
        columns: &[&str],
        types: &[ColumnType],
        primary_key_index: &[usize],
        if_not_exists: bool,
    ) -> Result<()> {
        let sql = self.render_create(table, columns, types, primary_key_index, if_not_exists);
        self.execute(&sql).await.inspect_err(|err| {
            error!("{} create failed: {err}\n{sql}", self.name());
        })
    }

    async fn insert(
        &self,
        table: &str,
        columns: &[&str],
        _types: &[ColumnType],
        values: &[SqlValue],
        primary_key_index: &[usize],
        or_replace: bool,
        _commit: bool,
    ) -> Result<()> {
        if columns.len() != values.len() {
            return Err(FeedError::Sink(format!(
                "{table}: {} columns but {} values",
                columns.len(),
                values.len()
            )));
        }
        let sql = self.render_insert(table, columns, values, primary_key_index, or_replace);
        let _guard = self.lock.lock().await;
        self.execute(&sql).await.inspect_err(|err| {
            error!("{} insert failed: {err}\n{sql}", self.name());
        })
    }

    async fn select(
        &self,
        table: &str,
        columns: &[&str],
        condition: &str,
        order_by: &str,
        limit: u64,
    ) -> Result<Vec<Vec<SqlValue>>> {
        let mut sql = format!("SELECT {} FROM {table}", columns.join(","));
        if !condition.is_empty() {
            sql.push_str(&format!(" WHERE {condition}"));
        }
        if !order_by.is_empty() {
            sql.push_str(&format!(" ORDER BY {order_by}"));
        }
        if limit > 0 {
            sql.push_str(&format!(" LIMIT {limit}"));
        }
        let rows = sqlx::query(&sql).fetch_all(&self.pool).await?;
        Ok(rows.iter().map(decode_row).collect())
    }

    async fn delete(&self, table: &str, condition: &str) -> Result<()> {
        let mut sql = format!("DELETE FROM {table}");
        if !condition.is_empty() {
            sql.push_str(&format!(" WHERE {condition}"));
        }
        self.execute(&sql).await
    }

    async fn commit(&self) -> Result<()> {
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.pool.close().await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn sink(dialect: SqlDialect) -> SqlSink {
        DRIVERS.call_once(sqlx::any::install_default_drivers);
        // Rendering never touches the pool; a lazily connecting pool is fine.
        SqlSink {
            dialect,
            pool: AnyPoolOptions::new().connect_lazy("sqlite::memory:").unwrap(),
            lock: Mutex::new(()),
        }
    }

    fn sample_values() -> Vec<SqlValue> {
        vec![
            SqlValue::Text("Okx".to_string()),
            SqlValue::Text("BTC".to_string()),
            SqlValue::Decimal(dec!(100.5)),
        ]
    }

    #[tokio::test]
    async fn sqlite_upsert_uses_insert_or_replace() {
        let sql = sink(SqlDialect::Sqlite).render_insert(
            "exchanges_snapshot",
            &["exchange", "instmt", "trade_px"],
            &sample_values(),
            &[0, 1],
            true,
        );
        assert_eq!(
            sql,
            "INSERT OR REPLACE INTO exchanges_snapshot (exchange,instmt,trade_px) \
             VALUES ('Okx','BTC',100.5)"
        );
    }

    #[tokio::test]
    async fn mysql_upsert_updates_non_key_columns() {
        let sql = sink(SqlDialect::Mysql).render_insert(
            "exchanges_snapshot",
            &["exchange", "instmt", "trade_px"],
            &sample_values(),
            &[0, 1],
            true,
        );
        assert_eq!(
            sql,
            "INSERT INTO exchanges_snapshot (exchange,instmt,trade_px) \
             VALUES ('Okx','BTC',100.5) ON DUPLICATE KEY UPDATE trade_px = 100.5"
        );
    }

    #[tokio::test]
    async fn postgres_upsert_targets_the_key_columns() {
        let sql = sink(SqlDialect::Postgres).render_insert(
            "exchanges_snapshot",
            &["exchange", "instmt", "trade_px"],
            &sample_values(),
            &[0, 1],
            true,
        );
        assert_eq!(
            sql,
            "INSERT INTO exchanges_snapshot (exchange,instmt,trade_px) \
             VALUES ('Okx','BTC',100.5) ON CONFLICT (exchange,instmt) DO UPDATE SET \
             trade_px = 100.5"
        );
    }

    #[tokio::test]
    async fn plain_insert_when_not_replacing() {
        let sql = sink(SqlDialect::Sqlite).render_insert(
            "exch_okx_btc_trades_20231114",
            &["id", "trade_px"],
            &[SqlValue::Int(1), SqlValue::Decimal(dec!(100.5))],
            &[0],
            false,
        );
        assert_eq!(
            sql,
            "INSERT INTO exch_okx_btc_trades_20231114 (id,trade_px) VALUES (1,100.5)"
        );
    }

    #[tokio::test]
    async fn create_declares_a_composite_primary_key() {
        let sql = sink(SqlDialect::Sqlite).render_create(
            "exchanges_snapshot",
            &["exchange", "instmt", "trade_px"],
            &[ColumnType::Text, ColumnType::Text, ColumnType::Decimal],
            &[0, 1],
            true,
        );
        assert_eq!(
            sql,
            "CREATE TABLE IF NOT EXISTS exchanges_snapshot \
             (exchange TEXT,instmt TEXT,trade_px DECIMAL(20,8),PRIMARY KEY (exchange,instmt))"
        );
    }

    #[tokio::test]
    async fn snapshot_upsert_keeps_one_row_per_key() {
        let sink = SqlSink::connect_sqlite(":memory:").await.unwrap();
        let columns = ["exchange", "instmt", "trade_px"];
        let types = [ColumnType::Text, ColumnType::Text, ColumnType::Decimal];
        sink.create("exchanges_snapshot", &columns, &types, &[0, 1], true)
            .await
            .unwrap();

        for price in ["100.0", "101.0", "102.5"] {
            sink.insert(
                "exchanges_snapshot",
                &columns,
                &types,
                &[
                    SqlValue::Text("Okx".to_string()),
                    SqlValue::Text("BTC".to_string()),
                    SqlValue::Decimal(util::parse_decimal(price)),
                ],
                &[0, 1],
                true,
                true,
            )
            .await
            .unwrap();
        }

        let rows = sink
            .select("exchanges_snapshot", &["trade_px"], "", "", 0)
            .await
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0][0], SqlValue::Decimal(dec!(102.5)));
    }
}
