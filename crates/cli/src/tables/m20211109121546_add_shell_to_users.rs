use migrate_orm::{
    ActionFuture, DatabaseTransaction, FnAction, Migration, MigrationId, MigrationRegistry, NoOp, OrmResult,
};

pub const ID: MigrationId = MigrationId::new(20211109121546);

pub fn register(registry: &mut MigrationRegistry) -> OrmResult<()> {
    // Dropping the column would lose user data, so the reverse is a no-op.
    registry.register(Migration::new(ID, "add shell to host users", FnAction(up), NoOp))
}

fn up(tx: &mut dyn DatabaseTransaction) -> ActionFuture<'_> {
    Box::pin(async move {
        tx.execute("ALTER TABLE host_users ADD COLUMN shell varchar(255) DEFAULT NULL", &[])
            .await?;
        Ok(())
    })
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use migrate_orm::{
        DatabaseBackendRegistry, DatabasePool, DatabasePoolConfig, MigrationConfig, MigrationRollback,
        MigrationRunner,
    };

    use super::*;

    async fn host_users_db() -> Arc<dyn DatabasePool> {
        let pool = DatabaseBackendRegistry::with_defaults()
            .create_pool("sqlite::memory:", DatabasePoolConfig {
                max_connections: 1,
                ..DatabasePoolConfig::default()
            })
            .await
            .unwrap();
        pool.execute("CREATE TABLE host_users (id INTEGER PRIMARY KEY, username TEXT)", &[])
            .await
            .unwrap();
        pool
    }

    #[test]
    fn test_registers_as_irreversible() {
        let mut registry = MigrationRegistry::new();
        register(&mut registry).unwrap();

        let migration = registry.get(ID).unwrap();
        assert!(migration.is_irreversible());
        assert!(register(&mut registry).is_err());
    }

    #[tokio::test]
    async fn test_adds_nullable_shell_column() {
        let pool = host_users_db().await;
        let mut registry = MigrationRegistry::new();
        register(&mut registry).unwrap();
        let runner = MigrationRunner::new(&registry, pool.clone(), MigrationConfig::default()).unwrap();

        runner.apply_all().await.unwrap();
        pool.execute("INSERT INTO host_users (username) VALUES ('deploy')", &[]).await.unwrap();
        let row = pool
            .fetch_optional("SELECT shell FROM host_users WHERE username = 'deploy'", &[])
            .await
            .unwrap()
            .unwrap();
        assert!(row.get_by_name("shell").unwrap().is_null());

        let reverted = runner.revert_last(1).await.unwrap();
        assert_eq!(reverted.noop_reversions, vec![ID]);
        assert!(!runner.is_applied(ID).await.unwrap());
        assert!(pool.fetch_all("SELECT shell FROM host_users", &[]).await.unwrap().len() == 1);
    }
}
