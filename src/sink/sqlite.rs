// =============================================================================
// SQLite sink — keyed upsert into a user-declared table
// =============================================================================
//
// The sink owns a schema descriptor (column set plus key columns) and
// generates `INSERT ... ON CONFLICT (keys) DO UPDATE SET ...` so that
// re-emitting the same candle is idempotent. A user-supplied raw query
// overrides the generated one; its named parameters (`:source`, `:open_ts`,
// ...) bind the canonical candle field names.
// =============================================================================

use std::path::PathBuf;

use anyhow::{Context, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use rusqlite::Connection;
use tracing::debug;

use crate::candle::Candle;
use crate::sink::{to_row, Row, Sink, Transformer};

/// One column of the sink's table schema.
#[derive(Debug, Clone)]
pub struct SqlColumn {
    pub name: String,
    pub sql_type: String,
}

impl SqlColumn {
    pub fn new(name: impl Into<String>, sql_type: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            sql_type: sql_type.into(),
        }
    }
}

/// Default schema: the canonical candle fields, keyed on
/// `(source, symbol, timeframe, open_ts)`.
fn default_columns() -> Vec<SqlColumn> {
    [
        ("source", "TEXT"),
        ("symbol", "TEXT"),
        ("timeframe", "TEXT"),
        ("open_ts", "INTEGER"),
        ("end_ts", "INTEGER"),
        ("open", "REAL"),
        ("high", "REAL"),
        ("low", "REAL"),
        ("close", "REAL"),
        ("volume", "REAL"),
        ("quote_volume", "REAL"),
        ("is_closed", "INTEGER"),
        ("count", "INTEGER"),
    ]
    .into_iter()
    .map(|(n, t)| SqlColumn::new(n, t))
    .collect()
}

fn default_keys() -> Vec<String> {
    ["source", "symbol", "timeframe", "open_ts"]
        .into_iter()
        .map(String::from)
        .collect()
}

pub struct SqliteSink {
    path: PathBuf,
    table: String,
    columns: Vec<SqlColumn>,
    key_columns: Vec<String>,
    raw_query: Option<String>,
    transformer: Option<Transformer>,
    conn: Mutex<Option<Connection>>,
}

impl SqliteSink {
    pub fn new(path: impl Into<PathBuf>, table: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            table: table.into(),
            columns: default_columns(),
            key_columns: default_keys(),
            raw_query: None,
            transformer: None,
            conn: Mutex::new(None),
        }
    }

    /// Fluent schema declaration; replaces the default candle columns.
    pub fn with_model(mut self, columns: Vec<SqlColumn>) -> Self {
        self.columns = columns;
        self
    }

    /// In-place variant of [`SqliteSink::with_model`].
    pub fn set_model(&mut self, columns: Vec<SqlColumn>) {
        self.columns = columns;
    }

    /// Fluent conflict-key declaration: emission updates all non-key
    /// columns when the keyed row already exists.
    pub fn on_conflict(mut self, key_columns: Vec<String>) -> Self {
        self.key_columns = key_columns;
        self
    }

    /// In-place variant of [`SqliteSink::on_conflict`].
    pub fn set_on_conflict(&mut self, key_columns: Vec<String>) {
        self.key_columns = key_columns;
    }

    /// Replace the generated statement entirely. Named parameters bind the
    /// transformed record's field names.
    pub fn with_raw_query(mut self, query: impl Into<String>) -> Self {
        self.raw_query = Some(query.into());
        self
    }

    pub fn with_transformer(mut self, transformer: Transformer) -> Self {
        self.transformer = Some(transformer);
        self
    }

    pub fn set_transformer(&mut self, transformer: Transformer) {
        self.transformer = Some(transformer);
    }

    fn create_table_sql(&self) -> String {
        let cols: Vec<String> = self
            .columns
            .iter()
            .map(|c| format!("\"{}\" {}", c.name, c.sql_type))
            .collect();
        let unique = if self.key_columns.is_empty() {
            String::new()
        } else {
            format!(", UNIQUE({})", quote_list(&self.key_columns))
        };
        format!(
            "CREATE TABLE IF NOT EXISTS \"{}\" ({}{})",
            self.table,
            cols.join(", "),
            unique
        )
    }

    fn upsert_sql(&self) -> String {
        let names: Vec<&str> = self.columns.iter().map(|c| c.name.as_str()).collect();
        let placeholders: Vec<String> = (1..=names.len()).map(|i| format!("?{i}")).collect();
        let insert = format!(
            "INSERT INTO \"{}\" ({}) VALUES ({})",
            self.table,
            names
                .iter()
                .map(|n| format!("\"{n}\""))
                .collect::<Vec<_>>()
                .join(", "),
            placeholders.join(", "),
        );
        if self.key_columns.is_empty() {
            return insert;
        }
        let updates: Vec<String> = names
            .iter()
            .filter(|n| !self.key_columns.iter().any(|k| k == *n))
            .map(|n| format!("\"{n}\" = excluded.\"{n}\""))
            .collect();
        format!(
            "{} ON CONFLICT({}) DO UPDATE SET {}",
            insert,
            quote_list(&self.key_columns),
            updates.join(", "),
        )
    }

    fn insert_row(&self, conn: &Connection, row: &Row) -> Result<()> {
        match &self.raw_query {
            Some(query) => {
                let mut stmt = conn.prepare_cached(query)?;
                for (name, value) in row {
                    if let Some(idx) = stmt.parameter_index(&format!(":{name}"))? {
                        stmt.raw_bind_parameter(idx, json_to_sql(value))?;
                    }
                }
                stmt.raw_execute()?;
            }
            None => {
                let sql = self.upsert_sql();
                let mut stmt = conn.prepare_cached(&sql)?;
                for (i, col) in self.columns.iter().enumerate() {
                    let value = row
                        .get(&col.name)
                        .map(json_to_sql)
                        .unwrap_or(rusqlite::types::Value::Null);
                    stmt.raw_bind_parameter(i + 1, value)?;
                }
                stmt.raw_execute()?;
            }
        }
        Ok(())
    }
}

fn quote_list(names: &[String]) -> String {
    names
        .iter()
        .map(|n| format!("\"{n}\""))
        .collect::<Vec<_>>()
        .join(", ")
}

fn json_to_sql(value: &serde_json::Value) -> rusqlite::types::Value {
    use rusqlite::types::Value as Sql;
    match value {
        serde_json::Value::Null => Sql::Null,
        serde_json::Value::Bool(b) => Sql::Integer(*b as i64),
        serde_json::Value::Number(n) => match n.as_i64() {
            Some(i) => Sql::Integer(i),
            None => Sql::Real(n.as_f64().unwrap_or(f64::NAN)),
        },
        serde_json::Value::String(s) => Sql::Text(s.clone()),
        other => Sql::Text(other.to_string()),
    }
}

#[async_trait]
impl Sink for SqliteSink {
    fn name(&self) -> &str {
        "sqlite"
    }

    async fn connect(&self) -> Result<()> {
        let conn = Connection::open(&self.path)
            .with_context(|| format!("opening {}", self.path.display()))?;
        conn.execute(&self.create_table_sql(), [])?;
        debug!(path = %self.path.display(), table = %self.table, "sqlite sink ready");
        *self.conn.lock() = Some(conn);
        Ok(())
    }

    async fn emit(&self, candle: &Candle) -> Result<()> {
        let row = to_row(candle, self.transformer.as_ref());
        let guard = self.conn.lock();
        let conn = guard.as_ref().context("sqlite sink not connected")?;
        self.insert_row(conn, &row)
    }

    async fn emit_bulk(&self, candles: &[Candle]) -> Result<()> {
        let mut guard = self.conn.lock();
        let conn = guard.as_mut().context("sqlite sink not connected")?;
        let tx = conn.transaction()?;
        for candle in candles {
            let row = to_row(candle, self.transformer.as_ref());
            self.insert_row(&tx, &row)?;
        }
        tx.commit()?;
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        *self.conn.lock() = None;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::timeframe::Timeframe;

    fn sample(open_ts: i64, close: f64) -> Candle {
        Candle {
            source: "bybit".into(),
            symbol: "BTCUSDT".into(),
            timeframe: Timeframe::M1,
            open_ts,
            end_ts: open_ts + 59,
            open: 1.0,
            high: close.max(2.0),
            low: 0.5,
            close,
            volume: 10.0,
            quote_volume: Some(15.0),
            is_closed: true,
            count: None,
        }
    }

    fn temp_db(tag: &str) -> PathBuf {
        std::env::temp_dir().join(format!(
            "candleforge-sqlite-{}-{}.db",
            tag,
            std::process::id()
        ))
    }

    fn count_rows(path: &PathBuf, table: &str) -> i64 {
        let conn = Connection::open(path).unwrap();
        conn.query_row(&format!("SELECT COUNT(*) FROM \"{table}\""), [], |r| {
            r.get(0)
        })
        .unwrap()
    }

    #[tokio::test]
    async fn upsert_is_idempotent() {
        let path = temp_db("upsert");
        let _ = std::fs::remove_file(&path);

        let sink = SqliteSink::new(&path, "candles");
        sink.connect().await.unwrap();
        sink.emit(&sample(0, 1.5)).await.unwrap();
        sink.emit(&sample(0, 1.5)).await.unwrap();
        sink.emit(&sample(60, 1.6)).await.unwrap();
        sink.close().await.unwrap();

        assert_eq!(count_rows(&path, "candles"), 2);
        let _ = std::fs::remove_file(&path);
    }

    #[tokio::test]
    async fn conflict_updates_non_key_columns() {
        let path = temp_db("update");
        let _ = std::fs::remove_file(&path);

        let sink = SqliteSink::new(&path, "candles");
        sink.connect().await.unwrap();
        sink.emit(&sample(0, 1.5)).await.unwrap();
        // The in-progress bucket got a better close on redelivery.
        sink.emit(&sample(0, 1.9)).await.unwrap();
        sink.close().await.unwrap();

        let conn = Connection::open(&path).unwrap();
        let close: f64 = conn
            .query_row("SELECT close FROM candles WHERE open_ts = 0", [], |r| {
                r.get(0)
            })
            .unwrap();
        assert_eq!(close, 1.9);
        assert_eq!(count_rows(&path, "candles"), 1);
        let _ = std::fs::remove_file(&path);
    }

    #[tokio::test]
    async fn bulk_emission_lands_in_one_pass() {
        let path = temp_db("bulk");
        let _ = std::fs::remove_file(&path);

        let sink = SqliteSink::new(&path, "candles");
        sink.connect().await.unwrap();
        let batch: Vec<Candle> = (0..100).map(|i| sample(i * 60, 1.5)).collect();
        sink.emit_bulk(&batch).await.unwrap();
        // Re-running the whole batch leaves the table unchanged.
        sink.emit_bulk(&batch).await.unwrap();
        sink.close().await.unwrap();

        assert_eq!(count_rows(&path, "candles"), 100);
        let _ = std::fs::remove_file(&path);
    }

    #[tokio::test]
    async fn raw_query_overrides_generated_upsert() {
        let path = temp_db("raw");
        let _ = std::fs::remove_file(&path);

        {
            let conn = Connection::open(&path).unwrap();
            conn.execute(
                "CREATE TABLE closes (symbol TEXT, open_ts INTEGER, close REAL)",
                [],
            )
            .unwrap();
        }

        let sink = SqliteSink::new(&path, "closes").with_raw_query(
            "INSERT INTO closes (symbol, open_ts, close) VALUES (:symbol, :open_ts, :close)",
        );
        sink.connect().await.unwrap();
        sink.emit(&sample(0, 1.5)).await.unwrap();
        sink.close().await.unwrap();

        let conn = Connection::open(&path).unwrap();
        let (symbol, close): (String, f64) = conn
            .query_row("SELECT symbol, close FROM closes", [], |r| {
                Ok((r.get(0)?, r.get(1)?))
            })
            .unwrap();
        assert_eq!(symbol, "BTCUSDT");
        assert_eq!(close, 1.5);
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn generated_sql_shapes() {
        let sink = SqliteSink::new("x.db", "candles");
        let sql = sink.upsert_sql();
        assert!(sql.starts_with("INSERT INTO \"candles\""));
        assert!(sql.contains("ON CONFLICT(\"source\", \"symbol\", \"timeframe\", \"open_ts\")"));
        assert!(sql.contains("\"close\" = excluded.\"close\""));
        // Key columns are never rewritten on conflict.
        assert!(!sql.contains("\"open_ts\" = excluded"));

        let create = sink.create_table_sql();
        assert!(create.contains("UNIQUE(\"source\", \"symbol\", \"timeframe\", \"open_ts\")"));
    }
}
