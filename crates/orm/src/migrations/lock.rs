//! Advisory lock keeping a second runner off the same database
//!
//! The lock is a single leased row. Whoever inserts row `1` holds it; a row
//! older than the lease belongs to a runner that died and may be taken over.

use chrono::Utc;
use tracing::{debug, warn};
use uuid::Uuid;

use super::definitions::LockConfig;
use crate::backends::{validate_identifier, DatabasePool, DatabaseTransaction, DatabaseValue, SqlDialect};
use crate::error::{OrmError, OrmResult};

const LOCK_ROW_ID: i64 = 1;

/// Leased-row advisory lock
#[derive(Debug, Clone)]
pub struct MigrationLock {
    table: String,
    dialect: SqlDialect,
    lease_seconds: u64,
    owner: String,
}

impl MigrationLock {
    pub fn new(table: impl Into<String>, dialect: SqlDialect, config: &LockConfig) -> OrmResult<Self> {
        let table = table.into();
        validate_identifier(&table)?;
        Ok(Self {
            table,
            dialect,
            lease_seconds: config.lease_seconds,
            owner: Uuid::new_v4().to_string(),
        })
    }

    /// Token identifying this runner in the lock row
    pub fn owner(&self) -> &str {
        &self.owner
    }

    fn create_table_sql(&self) -> String {
        format!(
            "CREATE TABLE IF NOT EXISTS {} (\n    \
                id INTEGER PRIMARY KEY,\n    \
                owner VARCHAR(64) NOT NULL,\n    \
                acquired_at BIGINT NOT NULL\n\
            )",
            self.table
        )
    }

    /// Take the lock or fail with [`OrmError::LockHeld`]
    pub async fn acquire(&self, pool: &dyn DatabasePool) -> OrmResult<()> {
        pool.execute(&self.create_table_sql(), &[])
            .await
            .map_err(|e| OrmError::Persistence(format!("Failed to create lock table: {}", e)))?;

        let now = Utc::now().timestamp();
        let stale_before = i64::try_from(self.lease_seconds)
            .ok()
            .and_then(|lease| now.checked_sub(lease))
            .ok_or_else(|| {
                OrmError::Configuration(format!("lock lease of {} seconds is out of range", self.lease_seconds))
            })?;
        let expired = pool
            .execute(
                &format!(
                    "DELETE FROM {} WHERE acquired_at < {}",
                    self.table,
                    self.dialect.parameter_placeholder(0)
                ),
                &[DatabaseValue::Int64(stale_before)],
            )
            .await
            .map_err(|e| OrmError::Persistence(format!("Failed to expire stale lock: {}", e)))?;
        if expired > 0 {
            warn!(table = %self.table, "Took over a migration lock whose lease had expired");
        }

        let insert = format!(
            "INSERT INTO {} (id, owner, acquired_at) VALUES ({}, {}, {})",
            self.table,
            self.dialect.parameter_placeholder(0),
            self.dialect.parameter_placeholder(1),
            self.dialect.parameter_placeholder(2)
        );
        let params = [
            DatabaseValue::Int64(LOCK_ROW_ID),
            DatabaseValue::String(self.owner.clone()),
            DatabaseValue::Int64(now),
        ];

        match pool.execute(&insert, &params).await {
            Ok(_) => {
                debug!(owner = %self.owner, "Acquired migration lock");
                Ok(())
            }
            Err(insert_err) => match self.holder(pool).await? {
                Some(owner) => Err(OrmError::LockHeld { owner }),
                None => Err(OrmError::Persistence(format!(
                    "Failed to acquire migration lock: {}",
                    insert_err
                ))),
            },
        }
    }

    /// Release the lock if this runner still holds it
    pub async fn release(&self, pool: &dyn DatabasePool) -> OrmResult<()> {
        let sql = format!(
            "DELETE FROM {} WHERE id = {} AND owner = {}",
            self.table,
            self.dialect.parameter_placeholder(0),
            self.dialect.parameter_placeholder(1)
        );
        let removed = pool
            .execute(&sql, &[DatabaseValue::Int64(LOCK_ROW_ID), DatabaseValue::String(self.owner.clone())])
            .await
            .map_err(|e| OrmError::Persistence(format!("Failed to release migration lock: {}", e)))?;
        if removed == 0 {
            warn!(owner = %self.owner, "Migration lock was no longer held at release");
        } else {
            debug!(owner = %self.owner, "Released migration lock");
        }
        Ok(())
    }

    /// Refresh the lease from inside a migration transaction.
    ///
    /// The update holds the lock row until the transaction ends, so a runner
    /// that finds the lease stale cannot take it over mid-migration. Fails with
    /// [`OrmError::LockHeld`] once the lock no longer belongs to this runner.
    pub async fn renew(&self, tx: &mut dyn DatabaseTransaction) -> OrmResult<()> {
        let sql = format!(
            "UPDATE {} SET acquired_at = {} WHERE id = {} AND owner = {}",
            self.table,
            self.dialect.parameter_placeholder(0),
            self.dialect.parameter_placeholder(1),
            self.dialect.parameter_placeholder(2)
        );
        let params = [
            DatabaseValue::Int64(Utc::now().timestamp()),
            DatabaseValue::Int64(LOCK_ROW_ID),
            DatabaseValue::String(self.owner.clone()),
        ];
        let renewed = tx
            .execute(&sql, &params)
            .await
            .map_err(|e| OrmError::Persistence(format!("Failed to renew migration lock: {}", e)))?;
        if renewed > 0 {
            return Ok(());
        }

        let holder_sql = format!(
            "SELECT owner FROM {} WHERE id = {}",
            self.table,
            self.dialect.parameter_placeholder(0)
        );
        let owner = match tx.fetch_optional(&holder_sql, &[DatabaseValue::Int64(LOCK_ROW_ID)]).await? {
            Some(row) => row.get_by_name("owner")?.as_str().map(str::to_string),
            None => None,
        };
        warn!(owner = %self.owner, "Migration lock was lost during the run");
        Err(OrmError::LockHeld {
            owner: owner.unwrap_or_else(|| "(released)".to_string()),
        })
    }

    /// Owner token of the current lock row, if any
    pub async fn holder(&self, pool: &dyn DatabasePool) -> OrmResult<Option<String>> {
        let sql = format!(
            "SELECT owner FROM {} WHERE id = {}",
            self.table,
            self.dialect.parameter_placeholder(0)
        );
        let row = pool
            .fetch_optional(&sql, &[DatabaseValue::Int64(LOCK_ROW_ID)])
            .await
            .map_err(|e| OrmError::Persistence(format!("Failed to read migration lock: {}", e)))?;

        match row {
            Some(row) => Ok(row.get_by_name("owner")?.as_str().map(str::to_string)),
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::{DatabaseBackend, DatabasePoolConfig, SqliteBackend};

    async fn memory_pool() -> std::sync::Arc<dyn DatabasePool> {
        SqliteBackend::new()
            .create_pool("sqlite::memory:", DatabasePoolConfig {
                max_connections: 1,
                ..DatabasePoolConfig::default()
            })
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_second_runner_is_locked_out() {
        let pool = memory_pool().await;
        let config = LockConfig::default();
        let first = MigrationLock::new("schema_migrations_lock", SqlDialect::SQLite, &config).unwrap();
        let second = MigrationLock::new("schema_migrations_lock", SqlDialect::SQLite, &config).unwrap();

        first.acquire(pool.as_ref()).await.unwrap();
        let err = second.acquire(pool.as_ref()).await.unwrap_err();
        assert!(matches!(err, OrmError::LockHeld { ref owner } if owner == first.owner()));

        first.release(pool.as_ref()).await.unwrap();
        second.acquire(pool.as_ref()).await.unwrap();
        assert_eq!(second.holder(pool.as_ref()).await.unwrap().as_deref(), Some(second.owner()));
    }

    #[tokio::test]
    async fn test_expired_lease_is_taken_over() {
        let pool = memory_pool().await;
        let config = LockConfig::default();
        let lock = MigrationLock::new("schema_migrations_lock", SqlDialect::SQLite, &config).unwrap();
        pool.execute(&lock.create_table_sql(), &[]).await.unwrap();
        pool.execute(
            "INSERT INTO schema_migrations_lock (id, owner, acquired_at) VALUES (1, 'dead-runner', ?)",
            &[DatabaseValue::Int64(Utc::now().timestamp() - 3600)],
        )
        .await
        .unwrap();

        lock.acquire(pool.as_ref()).await.unwrap();
        assert_eq!(lock.holder(pool.as_ref()).await.unwrap().as_deref(), Some(lock.owner()));
    }

    #[tokio::test]
    async fn test_renew_refreshes_the_lease() {
        let pool = memory_pool().await;
        let config = LockConfig::default();
        let lock = MigrationLock::new("schema_migrations_lock", SqlDialect::SQLite, &config).unwrap();
        let other = MigrationLock::new("schema_migrations_lock", SqlDialect::SQLite, &config).unwrap();

        lock.acquire(pool.as_ref()).await.unwrap();
        pool.execute("UPDATE schema_migrations_lock SET acquired_at = 0", &[]).await.unwrap();

        let mut tx = pool.begin_transaction().await.unwrap();
        lock.renew(tx.as_mut()).await.unwrap();
        tx.commit().await.unwrap();

        let err = other.acquire(pool.as_ref()).await.unwrap_err();
        assert!(matches!(err, OrmError::LockHeld { ref owner } if owner == lock.owner()));
    }

    #[tokio::test]
    async fn test_renew_fails_after_takeover() {
        let pool = memory_pool().await;
        let config = LockConfig::default();
        let lock = MigrationLock::new("schema_migrations_lock", SqlDialect::SQLite, &config).unwrap();
        let thief = MigrationLock::new("schema_migrations_lock", SqlDialect::SQLite, &config).unwrap();

        lock.acquire(pool.as_ref()).await.unwrap();
        pool.execute("UPDATE schema_migrations_lock SET acquired_at = 0", &[]).await.unwrap();
        thief.acquire(pool.as_ref()).await.unwrap();

        let mut tx = pool.begin_transaction().await.unwrap();
        let err = lock.renew(tx.as_mut()).await.unwrap_err();
        tx.rollback().await.unwrap();
        assert!(matches!(err, OrmError::LockHeld { ref owner } if owner == thief.owner()));

        thief.release(pool.as_ref()).await.unwrap();
        let mut tx = pool.begin_transaction().await.unwrap();
        let err = lock.renew(tx.as_mut()).await.unwrap_err();
        tx.rollback().await.unwrap();
        assert!(matches!(err, OrmError::LockHeld { ref owner } if owner == "(released)"));
    }

    #[tokio::test]
    async fn test_oversized_lease_is_rejected() {
        let pool = memory_pool().await;
        let config = LockConfig {
            enabled: true,
            lease_seconds: u64::MAX,
        };
        let lock = MigrationLock::new("schema_migrations_lock", SqlDialect::SQLite, &config).unwrap();

        let err = lock.acquire(pool.as_ref()).await.unwrap_err();
        assert!(matches!(err, OrmError::Configuration(_)));
        assert_eq!(lock.holder(pool.as_ref()).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_release_leaves_foreign_lock_alone() {
        let pool = memory_pool().await;
        let config = LockConfig::default();
        let holder = MigrationLock::new("schema_migrations_lock", SqlDialect::SQLite, &config).unwrap();
        let other = MigrationLock::new("schema_migrations_lock", SqlDialect::SQLite, &config).unwrap();

        holder.acquire(pool.as_ref()).await.unwrap();
        other.release(pool.as_ref()).await.unwrap();
        assert_eq!(holder.holder(pool.as_ref()).await.unwrap().as_deref(), Some(holder.owner()));
    }
}
