//! Migration Rollback - Handles rolling back applied migrations
//!
//! Reverse actions run newest first, one transaction each, and the first
//! failure stops the rollback with that migration still applied.

use std::time::Instant;

use async_trait::async_trait;
use tracing::warn;

use super::definitions::{IrreversiblePolicy, MigrationDirection, RollbackResult};
use super::registry::Migration;
use super::runner::MigrationRunner;
use crate::error::{OrmError, OrmResult};

/// Extension trait for MigrationRunner to add rollback functionality
#[async_trait]
pub trait MigrationRollback {
    /// Revert the `n` most recently applied migrations.
    ///
    /// Targets are taken newest identifier first. When out-of-order
    /// application is allowed they are taken by `applied_at` instead, so a
    /// late-applied older identifier is reverted before newer ones.
    async fn revert_last(&self, n: usize) -> OrmResult<RollbackResult>;

    /// Revert every applied migration
    async fn revert_all(&self) -> OrmResult<RollbackResult>;
}

#[async_trait]
impl<'r> MigrationRollback for MigrationRunner<'r> {
    async fn revert_last(&self, n: usize) -> OrmResult<RollbackResult> {
        self.acquire_lock().await?;
        let result = self.revert_latest(n).await;
        self.release_lock(result).await
    }

    async fn revert_all(&self) -> OrmResult<RollbackResult> {
        self.revert_last(usize::MAX).await
    }
}

impl<'r> MigrationRunner<'r> {
    async fn revert_latest(&self, n: usize) -> OrmResult<RollbackResult> {
        let start_time = Instant::now();

        self.store().ensure_table(self.pool()).await?;
        let mut applied = self.store().applied_migrations(self.pool()).await?;
        if self.config().allow_out_of_order {
            // Identifier order and application order can disagree here.
            applied.sort_by_key(|record| (record.applied_at, record.id));
        }

        // Resolve every target before touching anything, so an unknown or
        // refused migration leaves the database exactly as it was.
        let targets = applied
            .iter()
            .rev()
            .take(n)
            .map(|record| self.registered(record.id))
            .collect::<OrmResult<Vec<&Migration>>>()?;

        if self.config().irreversible_policy == IrreversiblePolicy::Refuse {
            if let Some(migration) = targets.iter().find(|m| m.is_irreversible()) {
                return Err(OrmError::Irreversible(migration.id()));
            }
        }

        let mut result = RollbackResult::default();
        for migration in targets {
            self.run_in_transaction(migration, MigrationDirection::Down).await?;

            if migration.is_irreversible() {
                if self.config().irreversible_policy == IrreversiblePolicy::Warn {
                    warn!(
                        id = %migration.id(),
                        name = migration.name(),
                        "Reverse action is a no-op: the ledger entry was removed but the schema change remains"
                    );
                }
                result.noop_reversions.push(migration.id());
            }
            result.rolled_back_migrations.push(migration.id());
        }

        result.execution_time_ms = start_time.elapsed().as_millis();
        Ok(result)
    }
}
