//! Migration Registry - the set of migrations known to this process
//!
//! Built once at start-up, before any runner method executes, and then
//! handed to the runner by reference.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use super::action::{ActionFn, FnAction, MigrationAction};
use super::definitions::MigrationId;
use super::manager::MigrationManager;
use crate::error::{OrmError, OrmResult};

/// An immutable schema change: identifier plus forward and reverse action
#[derive(Clone)]
pub struct Migration {
    id: MigrationId,
    name: String,
    up: Arc<dyn MigrationAction>,
    down: Arc<dyn MigrationAction>,
}

impl Migration {
    pub fn new(
        id: MigrationId,
        name: impl Into<String>,
        up: impl MigrationAction + 'static,
        down: impl MigrationAction + 'static,
    ) -> Self {
        Self {
            id,
            name: name.into(),
            up: Arc::new(up),
            down: Arc::new(down),
        }
    }

    pub fn id(&self) -> MigrationId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn up(&self) -> &dyn MigrationAction {
        self.up.as_ref()
    }

    pub fn down(&self) -> &dyn MigrationAction {
        self.down.as_ref()
    }

    /// Whether reverting this migration leaves its schema change in place
    pub fn is_irreversible(&self) -> bool {
        self.down.is_noop()
    }
}

impl fmt::Debug for Migration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Migration")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("irreversible", &self.is_irreversible())
            .finish()
    }
}

/// All migrations known to this process, keyed by identifier
#[derive(Debug, Default, Clone)]
pub struct MigrationRegistry {
    migrations: HashMap<MigrationId, Migration>,
}

impl MigrationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a migration; an identifier may only be registered once
    pub fn register(&mut self, migration: Migration) -> OrmResult<()> {
        if self.migrations.contains_key(&migration.id) {
            return Err(OrmError::DuplicateIdentifier(migration.id));
        }
        self.migrations.insert(migration.id, migration);
        Ok(())
    }

    /// Register a pair of plain functions under `id`
    pub fn add_migration(&mut self, id: MigrationId, up: ActionFn, down: ActionFn) -> OrmResult<()> {
        self.register(Migration::new(id, format!("migration {}", id), FnAction(up), FnAction(down)))
    }

    /// Register every SQL migration file the manager finds
    pub fn load_dir(&mut self, manager: &MigrationManager) -> OrmResult<usize> {
        let migrations = manager.load_migrations()?;
        let count = migrations.len();
        for migration in migrations {
            self.register(migration)?;
        }
        Ok(count)
    }

    /// Every registered migration, in no particular order
    pub fn all(&self) -> impl Iterator<Item = &Migration> {
        self.migrations.values()
    }

    /// Every registered migration, ascending by identifier
    pub fn sorted(&self) -> Vec<&Migration> {
        let mut migrations: Vec<&Migration> = self.migrations.values().collect();
        migrations.sort_by_key(|m| m.id);
        migrations
    }

    pub fn get(&self, id: MigrationId) -> Option<&Migration> {
        self.migrations.get(&id)
    }

    pub fn contains(&self, id: MigrationId) -> bool {
        self.migrations.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.migrations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.migrations.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::migrations::action::{NoOp, SqlAction};

    fn sql(id: u64) -> Migration {
        Migration::new(
            MigrationId::new(id),
            format!("m{}", id),
            SqlAction::new("SELECT 1"),
            NoOp,
        )
    }

    #[test]
    fn test_duplicate_identifier_is_rejected() {
        let mut registry = MigrationRegistry::new();
        registry.register(sql(20211109121546)).unwrap();

        let err = registry.register(sql(20211109121546)).unwrap_err();
        assert!(matches!(err, OrmError::DuplicateIdentifier(id) if id.value() == 20211109121546));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_sorted_ignores_insertion_order() {
        let mut registry = MigrationRegistry::new();
        for id in [30, 4, 200, 10] {
            registry.register(sql(id)).unwrap();
        }

        let ids: Vec<u64> = registry.sorted().iter().map(|m| m.id().value()).collect();
        assert_eq!(ids, vec![4, 10, 30, 200]);
        assert_eq!(registry.all().count(), 4);
        assert!(registry.contains(MigrationId::new(200)));
        assert!(registry.get(MigrationId::new(5)).is_none());
    }

    #[test]
    fn test_noop_down_marks_migration_irreversible() {
        let migration = sql(1);
        assert!(migration.is_irreversible());

        let reversible = Migration::new(
            MigrationId::new(2),
            "create hosts",
            SqlAction::new("CREATE TABLE hosts (id INTEGER)"),
            SqlAction::new("DROP TABLE hosts"),
        );
        assert!(!reversible.is_irreversible());
    }
}
