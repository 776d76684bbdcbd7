//! SQLite Backend Implementation
//!
//! SQLite support is what lets the runner be exercised without a server.
//! Schema changes in SQLite are transactional, so the one-transaction-per-
//! migration guarantee holds here exactly as it does on PostgreSQL.

use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use sqlx::sqlite::{SqliteArguments, SqliteConnectOptions, SqlitePoolOptions, SqliteRow};
use sqlx::{Column, Pool, Row, Sqlite, TypeInfo, ValueRef};
use tracing::debug;

use super::core::*;
use crate::error::{OrmError, OrmResult};

type SqliteQuery<'q> = sqlx::query::Query<'q, Sqlite, SqliteArguments<'q>>;

/// SQLite database backend implementation
#[derive(Debug, Default)]
pub struct SqliteBackend;

impl SqliteBackend {
    /// Create a new SQLite backend instance
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl DatabaseBackend for SqliteBackend {
    async fn create_pool(&self, database_url: &str, config: DatabasePoolConfig) -> OrmResult<Arc<dyn DatabasePool>> {
        let connect_options = SqliteConnectOptions::from_str(database_url)
            .map_err(|e| OrmError::Connection(format!("Invalid SQLite URL: {}", e)))?
            .create_if_missing(true);

        let mut options = SqlitePoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .acquire_timeout(Duration::from_secs(config.acquire_timeout_seconds))
            .test_before_acquire(config.test_before_acquire);

        if let Some(idle_timeout) = config.idle_timeout_seconds {
            options = options.idle_timeout(Duration::from_secs(idle_timeout));
        }

        if let Some(max_lifetime) = config.max_lifetime_seconds {
            options = options.max_lifetime(Duration::from_secs(max_lifetime));
        }

        let pool = options.connect_with(connect_options)
            .await
            .map_err(|e| OrmError::Connection(format!("Failed to create SQLite pool: {}", e)))?;

        Ok(Arc::new(SqlitePool::new(pool)))
    }

    fn validate_database_url(&self, url: &str) -> OrmResult<()> {
        if !url.starts_with("sqlite:") {
            return Err(OrmError::Connection("Invalid SQLite URL scheme".to_string()));
        }
        Ok(())
    }
}

/// SQLite connection pool implementation
pub struct SqlitePool {
    pool: Pool<Sqlite>,
}

impl SqlitePool {
    pub fn new(pool: Pool<Sqlite>) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl DatabasePool for SqlitePool {
    async fn begin_transaction(&self) -> OrmResult<Box<dyn DatabaseTransaction>> {
        let tx = self.pool.begin()
            .await
            .map_err(|e| OrmError::Connection(format!("Failed to begin transaction: {}", e)))?;

        debug!("Began SQLite transaction");
        Ok(Box::new(SqliteTransaction::new(tx)))
    }

    async fn execute(&self, sql: &str, params: &[DatabaseValue]) -> OrmResult<u64> {
        let query = bind_all(sqlx::query(sql), params);

        let result = query.execute(&self.pool)
            .await
            .map_err(|e| OrmError::Query(format!("Query execution failed: {}", e)))?;

        Ok(result.rows_affected())
    }

    async fn fetch_all(&self, sql: &str, params: &[DatabaseValue]) -> OrmResult<Vec<Box<dyn DatabaseRow>>> {
        let query = bind_all(sqlx::query(sql), params);

        let rows = query.fetch_all(&self.pool)
            .await
            .map_err(|e| OrmError::Query(format!("Query fetch failed: {}", e)))?;

        Ok(rows.into_iter().map(|row| Box::new(SqliteRowWrapper::new(row)) as Box<dyn DatabaseRow>).collect())
    }

    async fn fetch_optional(&self, sql: &str, params: &[DatabaseValue]) -> OrmResult<Option<Box<dyn DatabaseRow>>> {
        let query = bind_all(sqlx::query(sql), params);

        let row = query.fetch_optional(&self.pool)
            .await
            .map_err(|e| OrmError::Query(format!("Query fetch failed: {}", e)))?;

        Ok(row.map(|r| Box::new(SqliteRowWrapper::new(r)) as Box<dyn DatabaseRow>))
    }

    async fn close(&self) -> OrmResult<()> {
        self.pool.close().await;
        Ok(())
    }

    async fn health_check(&self) -> OrmResult<Duration> {
        let start = Instant::now();

        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(|e| OrmError::Connection(format!("Health check failed: {}", e)))?;

        Ok(start.elapsed())
    }

    fn sql_dialect(&self) -> SqlDialect {
        SqlDialect::SQLite
    }
}

/// SQLite transaction implementation
pub struct SqliteTransaction {
    tx: Option<sqlx::Transaction<'static, Sqlite>>,
}

impl SqliteTransaction {
    pub fn new(tx: sqlx::Transaction<'static, Sqlite>) -> Self {
        Self { tx: Some(tx) }
    }

    fn inner(&mut self) -> OrmResult<&mut sqlx::Transaction<'static, Sqlite>> {
        self.tx.as_mut().ok_or_else(|| OrmError::Query("Transaction already completed".to_string()))
    }
}

#[async_trait]
impl DatabaseTransaction for SqliteTransaction {
    async fn execute(&mut self, sql: &str, params: &[DatabaseValue]) -> OrmResult<u64> {
        let tx = self.inner()?;
        let query = bind_all(sqlx::query(sql), params);

        let result = query.execute(&mut **tx)
            .await
            .map_err(|e| OrmError::Query(format!("Query execution failed: {}", e)))?;

        Ok(result.rows_affected())
    }

    async fn fetch_all(&mut self, sql: &str, params: &[DatabaseValue]) -> OrmResult<Vec<Box<dyn DatabaseRow>>> {
        let tx = self.inner()?;
        let query = bind_all(sqlx::query(sql), params);

        let rows = query.fetch_all(&mut **tx)
            .await
            .map_err(|e| OrmError::Query(format!("Query fetch failed: {}", e)))?;

        Ok(rows.into_iter().map(|row| Box::new(SqliteRowWrapper::new(row)) as Box<dyn DatabaseRow>).collect())
    }

    async fn fetch_optional(&mut self, sql: &str, params: &[DatabaseValue]) -> OrmResult<Option<Box<dyn DatabaseRow>>> {
        let tx = self.inner()?;
        let query = bind_all(sqlx::query(sql), params);

        let row = query.fetch_optional(&mut **tx)
            .await
            .map_err(|e| OrmError::Query(format!("Query fetch failed: {}", e)))?;

        Ok(row.map(|r| Box::new(SqliteRowWrapper::new(r)) as Box<dyn DatabaseRow>))
    }

    async fn commit(mut self: Box<Self>) -> OrmResult<()> {
        let tx = self.tx.take().ok_or_else(|| OrmError::Query("Transaction already completed".to_string()))?;

        tx.commit()
            .await
            .map_err(|e| OrmError::Query(format!("Transaction commit failed: {}", e)))
    }

    async fn rollback(mut self: Box<Self>) -> OrmResult<()> {
        let tx = self.tx.take().ok_or_else(|| OrmError::Query("Transaction already completed".to_string()))?;

        tx.rollback()
            .await
            .map_err(|e| OrmError::Query(format!("Transaction rollback failed: {}", e)))
    }
}

/// SQLite row implementation
pub struct SqliteRowWrapper {
    row: SqliteRow,
}

impl SqliteRowWrapper {
    pub fn new(row: SqliteRow) -> Self {
        Self { row }
    }
}

impl DatabaseRow for SqliteRowWrapper {
    fn get_by_index(&self, index: usize) -> OrmResult<DatabaseValue> {
        sqlite_value_to_database_value(&self.row, index)
    }

    fn get_by_name(&self, name: &str) -> OrmResult<DatabaseValue> {
        let index = self.row.columns().iter().position(|col| col.name() == name)
            .ok_or_else(|| OrmError::Query(format!("Column '{}' not found", name)))?;

        sqlite_value_to_database_value(&self.row, index)
    }

    fn column_names(&self) -> Vec<String> {
        self.row.columns().iter().map(|col| col.name().to_string()).collect()
    }
}

fn bind_all<'q>(mut query: SqliteQuery<'q>, params: &[DatabaseValue]) -> SqliteQuery<'q> {
    for param in params {
        query = bind_database_value(query, param);
    }
    query
}

/// Bind a DatabaseValue to a sqlx query.
///
/// Timestamps are stored as RFC 3339 text and JSON as its serialized form.
fn bind_database_value<'q>(query: SqliteQuery<'q>, value: &DatabaseValue) -> SqliteQuery<'q> {
    match value {
        DatabaseValue::Null => query.bind(Option::<String>::None),
        DatabaseValue::Bool(b) => query.bind(*b),
        DatabaseValue::Int32(i) => query.bind(*i),
        DatabaseValue::Int64(i) => query.bind(*i),
        DatabaseValue::Float64(f) => query.bind(*f),
        DatabaseValue::String(s) => query.bind(s.clone()),
        DatabaseValue::Bytes(b) => query.bind(b.clone()),
        DatabaseValue::DateTime(dt) => query.bind(dt.to_rfc3339()),
        DatabaseValue::Json(j) => query.bind(j.to_string()),
    }
}

/// Convert a SQLite value to DatabaseValue using its storage class
fn sqlite_value_to_database_value(row: &SqliteRow, index: usize) -> OrmResult<DatabaseValue> {
    let raw = row.try_get_raw(index)
        .map_err(|e| OrmError::Query(format!("Failed to read column {}: {}", index, e)))?;
    if raw.is_null() {
        return Ok(DatabaseValue::Null);
    }
    let type_name = raw.type_info().name().to_string();

    let decode_err = |e: sqlx::Error| {
        OrmError::Query(format!("Failed to decode {} column {}: {}", type_name, index, e))
    };

    match type_name.as_str() {
        "INTEGER" | "BOOLEAN" => Ok(DatabaseValue::Int64(row.try_get_unchecked(index).map_err(decode_err)?)),
        "REAL" | "NUMERIC" => Ok(DatabaseValue::Float64(row.try_get_unchecked(index).map_err(decode_err)?)),
        "BLOB" => Ok(DatabaseValue::Bytes(row.try_get_unchecked(index).map_err(decode_err)?)),
        _ => {
            let value: String = row.try_get_unchecked(index).map_err(decode_err)?;
            Ok(DatabaseValue::String(value))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_health_check_reports_closed_pool() {
        let pool = SqliteBackend::new()
            .create_pool("sqlite::memory:", DatabasePoolConfig::default())
            .await
            .unwrap();

        assert!(pool.health_check().await.is_ok());

        pool.close().await.unwrap();
        let err = pool.health_check().await.unwrap_err();
        assert!(matches!(err, OrmError::Connection(msg) if msg.contains("Health check failed")));
    }

    #[tokio::test]
    async fn test_round_trips_values_through_memory_database() {
        let pool = SqliteBackend::new()
            .create_pool("sqlite::memory:", DatabasePoolConfig {
                max_connections: 1,
                ..DatabasePoolConfig::default()
            })
            .await
            .unwrap();

        pool.execute("CREATE TABLE t (id INTEGER PRIMARY KEY, label TEXT, seen_at TEXT)", &[])
            .await
            .unwrap();
        let now = chrono::Utc::now();
        pool.execute(
            "INSERT INTO t (id, label, seen_at) VALUES (?, ?, ?)",
            &[DatabaseValue::Int64(7), DatabaseValue::Null, DatabaseValue::DateTime(now)],
        )
        .await
        .unwrap();

        let row = pool.fetch_optional("SELECT id, label, seen_at FROM t", &[])
            .await
            .unwrap()
            .unwrap();
        assert_eq!(row.get_by_name("id").unwrap().as_i64(), Some(7));
        assert!(row.get_by_name("label").unwrap().is_null());
        let seen_at = row.get_by_index(2).unwrap().as_datetime().unwrap();
        assert_eq!(seen_at.timestamp_micros(), now.timestamp_micros());
        assert_eq!(row.column_names(), vec!["id", "label", "seen_at"]);
        assert_eq!(pool.sql_dialect(), SqlDialect::SQLite);
    }

    #[tokio::test]
    async fn test_uncommitted_transaction_is_rolled_back() {
        let pool = SqliteBackend::new()
            .create_pool("sqlite::memory:", DatabasePoolConfig {
                max_connections: 1,
                ..DatabasePoolConfig::default()
            })
            .await
            .unwrap();
        pool.execute("CREATE TABLE t (id INTEGER PRIMARY KEY)", &[]).await.unwrap();

        let mut tx = pool.begin_transaction().await.unwrap();
        tx.execute("INSERT INTO t (id) VALUES (1)", &[]).await.unwrap();
        tx.rollback().await.unwrap();

        let rows = pool.fetch_all("SELECT id FROM t", &[]).await.unwrap();
        assert!(rows.is_empty());
    }
}
