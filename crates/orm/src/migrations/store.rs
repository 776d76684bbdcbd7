//! Applied-State Store - the ledger of applied migrations
//!
//! One row per applied migration in a dedicated table. Rows are written and
//! deleted inside the migration's own transaction so that the ledger and the
//! schema change commit or roll back together.

use chrono::{DateTime, Utc};

use super::definitions::{AppliedMigration, MigrationId};
use crate::backends::{validate_identifier, DatabasePool, DatabaseRow, DatabaseTransaction, DatabaseValue, SqlDialect};
use crate::error::{OrmError, OrmResult};

/// SQL access to the applied-state table
#[derive(Debug, Clone)]
pub struct AppliedStateStore {
    table: String,
    dialect: SqlDialect,
}

impl AppliedStateStore {
    pub fn new(table: impl Into<String>, dialect: SqlDialect) -> OrmResult<Self> {
        let table = table.into();
        validate_identifier(&table)?;
        Ok(Self { table, dialect })
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    /// SQL to create the applied-state table
    pub fn create_table_sql(&self) -> String {
        format!(
            "CREATE TABLE IF NOT EXISTS {} (\n    \
                identifier VARCHAR(255) PRIMARY KEY,\n    \
                applied_at {} NOT NULL\n\
            )",
            self.table,
            self.dialect.timestamp_type()
        )
    }

    /// Create the table if it does not exist yet
    pub async fn ensure_table(&self, pool: &dyn DatabasePool) -> OrmResult<()> {
        pool.execute(&self.create_table_sql(), &[])
            .await
            .map_err(|e| persistence("create the applied-state table", e))?;
        Ok(())
    }

    /// Check if a specific migration has been applied
    pub async fn is_applied(&self, pool: &dyn DatabasePool, id: MigrationId) -> OrmResult<bool> {
        let sql = format!(
            "SELECT identifier FROM {} WHERE identifier = {}",
            self.table,
            self.dialect.parameter_placeholder(0)
        );
        let row = pool.fetch_optional(&sql, &[DatabaseValue::String(id.to_string())])
            .await
            .map_err(|e| persistence("check migration status", e))?;
        Ok(row.is_some())
    }

    /// Record `id` as applied, inside the forward action's transaction
    pub async fn mark_applied(
        &self,
        tx: &mut dyn DatabaseTransaction,
        id: MigrationId,
        applied_at: DateTime<Utc>,
    ) -> OrmResult<()> {
        let sql = format!(
            "INSERT INTO {} (identifier, applied_at) VALUES ({}, {})",
            self.table,
            self.dialect.parameter_placeholder(0),
            self.dialect.parameter_placeholder(1)
        );
        tx.execute(&sql, &[DatabaseValue::String(id.to_string()), DatabaseValue::DateTime(applied_at)])
            .await
            .map_err(|e| persistence(&format!("record migration {}", id), e))?;
        Ok(())
    }

    /// Remove the record for `id`, inside the reverse action's transaction
    pub async fn mark_reverted(&self, tx: &mut dyn DatabaseTransaction, id: MigrationId) -> OrmResult<()> {
        let sql = format!(
            "DELETE FROM {} WHERE identifier = {}",
            self.table,
            self.dialect.parameter_placeholder(0)
        );
        let removed = tx.execute(&sql, &[DatabaseValue::String(id.to_string())])
            .await
            .map_err(|e| persistence(&format!("remove migration record {}", id), e))?;
        if removed == 0 {
            return Err(OrmError::Persistence(format!(
                "Migration {} has no applied record to remove",
                id
            )));
        }
        Ok(())
    }

    /// Applied identifiers, ascending
    pub async fn applied_identifiers(&self, pool: &dyn DatabasePool) -> OrmResult<Vec<MigrationId>> {
        Ok(self.applied_migrations(pool).await?.into_iter().map(|m| m.id).collect())
    }

    /// Applied records with their timestamps, ascending by identifier
    pub async fn applied_migrations(&self, pool: &dyn DatabasePool) -> OrmResult<Vec<AppliedMigration>> {
        let sql = format!("SELECT identifier, applied_at FROM {}", self.table);
        let rows = pool.fetch_all(&sql, &[])
            .await
            .map_err(|e| persistence("query applied migrations", e))?;

        let mut records = rows.iter()
            .map(|row| row_to_applied(row.as_ref()))
            .collect::<OrmResult<Vec<_>>>()?;
        // Identifiers are stored as text; order numerically here, not in SQL.
        records.sort_by_key(|r| r.id);
        Ok(records)
    }
}

fn row_to_applied(row: &dyn DatabaseRow) -> OrmResult<AppliedMigration> {
    let raw_id = row.get_by_name("identifier")?;
    let id: MigrationId = raw_id.as_str()
        .ok_or_else(|| OrmError::Persistence(format!("Unexpected identifier value {:?}", raw_id)))?
        .parse()
        .map_err(|e: OrmError| OrmError::Persistence(e.to_string()))?;

    let raw_applied_at = row.get_by_name("applied_at")?;
    let applied_at = raw_applied_at.as_datetime()
        .ok_or_else(|| OrmError::Persistence(format!("Unexpected applied_at value {:?}", raw_applied_at)))?;

    Ok(AppliedMigration { id, applied_at })
}

fn persistence(action: &str, err: OrmError) -> OrmError {
    match err {
        OrmError::Persistence(_) => err,
        other => OrmError::Persistence(format!("Failed to {}: {}", action, other)),
    }
}
