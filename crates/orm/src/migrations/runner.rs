//! Migration Runner - Executes migrations against the database
//!
//! Applies pending migrations strictly in identifier order, one transaction
//! per migration, and stops at the first failure so the applied set stays a
//! prefix of the registry.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use tracing::{debug, error, info, warn};

use super::definitions::{
    MigrationConfig, MigrationDirection, MigrationId, MigrationRunResult, MigrationStatus,
    MigrationStatusEntry,
};
use super::lock::MigrationLock;
use super::registry::{Migration, MigrationRegistry};
use super::store::AppliedStateStore;
use crate::backends::{DatabasePool, DatabaseTransaction};
use crate::error::{OrmError, OrmResult};

/// Migration runner that executes registered migrations against a database
pub struct MigrationRunner<'r> {
    registry: &'r MigrationRegistry,
    pool: Arc<dyn DatabasePool>,
    config: MigrationConfig,
    store: AppliedStateStore,
    lock: MigrationLock,
}

impl<'r> MigrationRunner<'r> {
    /// Create a new migration runner
    pub fn new(
        registry: &'r MigrationRegistry,
        pool: Arc<dyn DatabasePool>,
        config: MigrationConfig,
    ) -> OrmResult<Self> {
        config.validate()?;
        let dialect = pool.sql_dialect();
        let store = AppliedStateStore::new(config.migrations_table.clone(), dialect)?;
        let lock = MigrationLock::new(config.lock_table(), dialect, &config.lock)?;

        Ok(Self {
            registry,
            pool,
            config,
            store,
            lock,
        })
    }

    /// Get the database pool
    pub fn pool(&self) -> &dyn DatabasePool {
        self.pool.as_ref()
    }

    pub fn registry(&self) -> &MigrationRegistry {
        self.registry
    }

    pub fn config(&self) -> &MigrationConfig {
        &self.config
    }

    pub fn store(&self) -> &AppliedStateStore {
        &self.store
    }

    /// Run all pending migrations
    pub async fn apply_all(&self) -> OrmResult<MigrationRunResult> {
        self.acquire_lock().await?;
        let result = self.apply_pending().await;
        self.release_lock(result).await
    }

    async fn apply_pending(&self) -> OrmResult<MigrationRunResult> {
        let start_time = Instant::now();

        self.store.ensure_table(self.pool()).await?;
        let applied = self.store.applied_identifiers(self.pool()).await?;
        let pending = self.compute_pending(&applied)?;

        let mut result = MigrationRunResult {
            skipped_count: applied.len(),
            ..MigrationRunResult::default()
        };

        if pending.is_empty() {
            info!("Database schema is up to date");
        }

        for id in pending {
            let migration = self.registered(id)?;
            self.run_in_transaction(migration, MigrationDirection::Up).await?;
            result.applied_migrations.push(id);
        }

        result.execution_time_ms = start_time.elapsed().as_millis();
        Ok(result)
    }

    /// Registered migrations that are not applied yet, ascending
    pub async fn pending(&self) -> OrmResult<Vec<MigrationId>> {
        self.store.ensure_table(self.pool()).await?;
        let applied = self.store.applied_identifiers(self.pool()).await?;
        self.compute_pending(&applied)
    }

    /// Compute the pending set for the given applied identifiers.
    ///
    /// Fails when an applied identifier is not registered, or when a pending
    /// identifier sorts below the latest applied one and out-of-order
    /// application is not allowed.
    pub fn compute_pending(&self, applied: &[MigrationId]) -> OrmResult<Vec<MigrationId>> {
        if let Some(unknown) = applied.iter().find(|id| !self.registry.contains(**id)) {
            return Err(OrmError::UnknownMigration(*unknown));
        }

        let applied_set: HashSet<MigrationId> = applied.iter().copied().collect();
        let pending: Vec<MigrationId> = self.registry
            .sorted()
            .into_iter()
            .map(|m| m.id())
            .filter(|id| !applied_set.contains(id))
            .collect();

        if !self.config.allow_out_of_order {
            if let (Some(first_pending), Some(latest_applied)) = (pending.first(), applied.iter().max()) {
                if first_pending < latest_applied {
                    return Err(OrmError::OutOfOrder {
                        pending: *first_pending,
                        latest_applied: *latest_applied,
                    });
                }
            }
        }

        Ok(pending)
    }

    /// Get migration status for all migrations (applied and pending)
    pub async fn status(&self) -> OrmResult<Vec<MigrationStatusEntry>> {
        self.store.ensure_table(self.pool()).await?;
        let applied: HashMap<MigrationId, _> = self.store
            .applied_migrations(self.pool())
            .await?
            .into_iter()
            .map(|record| (record.id, record.applied_at))
            .collect();

        let mut entries: Vec<MigrationStatusEntry> = self.registry
            .sorted()
            .into_iter()
            .map(|migration| MigrationStatusEntry {
                id: migration.id(),
                name: migration.name().to_string(),
                status: match applied.get(&migration.id()) {
                    Some(applied_at) => MigrationStatus::Applied { applied_at: *applied_at },
                    None => MigrationStatus::Pending,
                },
            })
            .collect();

        for (id, applied_at) in &applied {
            if !self.registry.contains(*id) {
                warn!(id = %id, "Applied migration is not registered");
                entries.push(MigrationStatusEntry {
                    id: *id,
                    name: "(not registered)".to_string(),
                    status: MigrationStatus::Applied { applied_at: *applied_at },
                });
            }
        }
        entries.sort_by_key(|entry| entry.id);

        Ok(entries)
    }

    /// Highest applied identifier, if anything is applied
    pub async fn current_version(&self) -> OrmResult<Option<MigrationId>> {
        self.store.ensure_table(self.pool()).await?;
        Ok(self.store.applied_identifiers(self.pool()).await?.last().copied())
    }

    /// Check if a specific migration has been applied
    pub async fn is_applied(&self, id: MigrationId) -> OrmResult<bool> {
        self.store.ensure_table(self.pool()).await?;
        self.store.is_applied(self.pool(), id).await
    }

    pub(crate) fn registered(&self, id: MigrationId) -> OrmResult<&'r Migration> {
        self.registry.get(id).ok_or(OrmError::UnknownMigration(id))
    }

    /// Run one direction of `migration` and update the ledger in one transaction
    pub(crate) async fn run_in_transaction(
        &self,
        migration: &Migration,
        direction: MigrationDirection,
    ) -> OrmResult<()> {
        let id = migration.id();
        let started = Instant::now();
        debug!(id = %id, %direction, "Beginning migration transaction");

        let mut tx = self.pool.begin_transaction().await?;
        if let Err(e) = self.run_steps(&mut *tx, migration, direction).await {
            error!(id = %id, %direction, error = %e, "Migration failed, rolling back");
            rollback_quietly(tx, id).await;
            return Err(e);
        }

        tx.commit().await.map_err(|e| OrmError::MigrationAction {
            id,
            direction,
            message: format!("commit failed: {}", e),
        })?;

        info!(
            id = %id,
            name = migration.name(),
            %direction,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Migrated"
        );
        Ok(())
    }

    async fn run_steps(
        &self,
        tx: &mut dyn DatabaseTransaction,
        migration: &Migration,
        direction: MigrationDirection,
    ) -> OrmResult<()> {
        let id = migration.id();

        // Renewing first holds the lock row for the whole transaction; renewing
        // again before commit leaves a fresh lease behind.
        self.renew_lock(tx).await?;

        let action = match direction {
            MigrationDirection::Up => migration.up(),
            MigrationDirection::Down => migration.down(),
        };
        action.run(tx).await.map_err(|e| OrmError::MigrationAction {
            id,
            direction,
            message: e.to_string(),
        })?;

        match direction {
            MigrationDirection::Up => self.store.mark_applied(tx, id, Utc::now()).await?,
            MigrationDirection::Down => self.store.mark_reverted(tx, id).await?,
        }

        self.renew_lock(tx).await
    }

    async fn renew_lock(&self, tx: &mut dyn DatabaseTransaction) -> OrmResult<()> {
        if self.config.lock.enabled {
            self.lock.renew(tx).await?;
        }
        Ok(())
    }

    pub(crate) async fn acquire_lock(&self) -> OrmResult<()> {
        if self.config.lock.enabled {
            self.lock.acquire(self.pool()).await?;
        }
        Ok(())
    }

    /// Release the lock and hand back `result`; a run error wins over a release error
    pub(crate) async fn release_lock<T>(&self, result: OrmResult<T>) -> OrmResult<T> {
        if !self.config.lock.enabled {
            return result;
        }
        match (self.lock.release(self.pool()).await, result) {
            (Ok(()), result) => result,
            (Err(release_err), Ok(_)) => Err(release_err),
            (Err(release_err), Err(run_err)) => {
                warn!(error = %release_err, "Failed to release migration lock after a failed run");
                Err(run_err)
            }
        }
    }
}

async fn rollback_quietly(tx: Box<dyn DatabaseTransaction>, id: MigrationId) {
    if let Err(e) = tx.rollback().await {
        warn!(id = %id, error = %e, "Rollback failed; the transaction is discarded with its connection");
    }
}
