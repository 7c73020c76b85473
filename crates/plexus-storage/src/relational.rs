//! Relational backends.
//!
//! Every SQL dialect goes through one [`sqlx::AnyPool`], so the storage
//! engine treats SQLite, PostgreSQL and MySQL identically.  Each command
//! runs in its own transaction:
//!
//! | Statement                     | Result                                         |
//! |-------------------------------|------------------------------------------------|
//! | `SELECT ...`                  | rows as a JSON array of objects                |
//! | `INSERT` / `UPDATE` / `DELETE`| `{"rows_affected": n, "last_insert_id": n?}`   |
//! | anything else                 | rolled back, [`StorageError::UnsupportedStatement`] |
//!
//! Any failure rolls the transaction back before the error is returned.
//! BLOB cells are returned as standard base64 strings; a column the driver
//! cannot decode fails the statement instead of turning into `null`.

use std::time::Duration;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use serde_json::{Map, Number, Value, json};
use sqlx::any::{AnyPoolOptions, AnyRow, install_default_drivers};
use sqlx::{AnyPool, Column, Connection, Row, TypeInfo, ValueRef};
use tracing::{debug, info, warn};

use crate::config::{DataSourceConfig, Dialect, PoolSettings};
use crate::error::{StorageError, StorageResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StatementKind {
    Query,
    Mutation,
}

fn classify(sql: &str) -> Option<StatementKind> {
    let keyword = sql
        .trim_start()
        .split(|c: char| c.is_whitespace() || c == '(')
        .next()
        .unwrap_or("")
        .to_ascii_uppercase();
    match keyword.as_str() {
        "SELECT" => Some(StatementKind::Query),
        "INSERT" | "UPDATE" | "DELETE" => Some(StatementKind::Mutation),
        _ => None,
    }
}

/// A pooled relational connection for one data source.
#[derive(Clone)]
pub struct RelationalStore {
    name: String,
    dialect: Dialect,
    pool: AnyPool,
}

impl RelationalStore {
    /// Open a pool bounded by `limits` and verify it with a ping.
    pub async fn connect(source: &DataSourceConfig, limits: &PoolSettings) -> StorageResult<Self> {
        install_default_drivers();

        let dialect = source.dialect()?;
        if !dialect.is_relational() {
            return Err(StorageError::InvalidSource {
                source_name: source.name.clone(),
                reason: format!("{dialect} is not a relational dialect"),
            });
        }

        let pool = pool_options(limits).connect(&source.dsn()?).await?;

        let store = Self {
            name: source.name.clone(),
            dialect,
            pool,
        };
        store.ping().await?;
        info!(source = %store.name, dialect = %dialect, "relational pool opened");
        Ok(store)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn dialect(&self) -> Dialect {
        self.dialect
    }

    pub async fn ping(&self) -> StorageResult<()> {
        let mut conn = self.pool.acquire().await?;
        conn.ping().await?;
        Ok(())
    }

    /// Run `sql` in a transaction and return its JSON result.
    pub async fn execute(&self, sql: &str) -> StorageResult<Value> {
        let mut tx = self.pool.begin().await?;

        let Some(kind) = classify(sql) else {
            tx.rollback().await?;
            return Err(StorageError::UnsupportedStatement(sql.to_string()));
        };

        let outcome = match kind {
            StatementKind::Query => match sqlx::query(sql).fetch_all(&mut *tx).await {
                Ok(rows) => rows
                    .iter()
                    .map(row_to_json)
                    .collect::<StorageResult<Vec<_>>>()
                    .map(Value::Array),
                Err(err) => Err(err.into()),
            },
            StatementKind::Mutation => sqlx::query(sql)
                .execute(&mut *tx)
                .await
                .map(|done| {
                    json!({
                        "rows_affected": done.rows_affected(),
                        "last_insert_id": done.last_insert_id(),
                    })
                })
                .map_err(StorageError::from),
        };

        match outcome {
            Ok(value) => {
                tx.commit().await?;
                debug!(source = %self.name, ?kind, "transaction committed");
                Ok(value)
            }
            Err(err) => {
                warn!(source = %self.name, error = %err, "statement failed, rolling back");
                if let Err(rollback) = tx.rollback().await {
                    warn!(source = %self.name, error = %rollback, "rollback failed");
                }
                Err(err)
            }
        }
    }

    /// Close every pooled connection.  Idempotent.
    pub async fn close(&self) {
        self.pool.close().await;
    }
}

/// Pool bounds for one data source.
///
/// sqlx has no separate idle cap: idle connections are bounded by
/// `max_open` and closed once idle for `idle_timeout_secs`.  Nothing is
/// opened eagerly.
fn pool_options(limits: &PoolSettings) -> AnyPoolOptions {
    AnyPoolOptions::new()
        .max_connections(limits.max_open.max(1))
        .min_connections(0)
        .max_lifetime(Duration::from_secs(limits.max_lifetime_secs))
        .idle_timeout(Duration::from_secs(limits.idle_timeout_secs))
}

fn row_to_json(row: &AnyRow) -> StorageResult<Value> {
    let mut object = Map::new();
    for (i, column) in row.columns().iter().enumerate() {
        object.insert(column.name().to_string(), cell(row, i, column.name())?);
    }
    Ok(Value::Object(object))
}

fn cell(row: &AnyRow, i: usize, column: &str) -> StorageResult<Value> {
    let raw = row.try_get_raw(i)?;
    if raw.is_null() {
        return Ok(Value::Null);
    }
    let type_name = raw.type_info().name().to_string();

    if let Ok(v) = row.try_get::<i64, _>(i) {
        return Ok(Value::from(v));
    }
    if let Ok(v) = row.try_get::<f64, _>(i) {
        return Ok(Number::from_f64(v).map(Value::Number).unwrap_or(Value::Null));
    }
    if let Ok(v) = row.try_get::<f32, _>(i) {
        return Ok(Number::from_f64(f64::from(v))
            .map(Value::Number)
            .unwrap_or(Value::Null));
    }
    if let Ok(v) = row.try_get::<String, _>(i) {
        return Ok(Value::String(v));
    }
    if let Ok(v) = row.try_get::<bool, _>(i) {
        return Ok(Value::Bool(v));
    }
    if let Ok(v) = row.try_get::<Vec<u8>, _>(i) {
        return Ok(Value::String(STANDARD.encode(v)));
    }
    Err(StorageError::UnsupportedColumn {
        column: column.to_string(),
        type_name,
    })
}
