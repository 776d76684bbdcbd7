use std::sync::Arc;

use anyhow::Context;
use migrate_orm::{
    redact_database_url, DatabaseBackendRegistry, DatabasePool, DatabasePoolConfig, MigrationConfig,
    MigrationManager, MigrationRegistry, MigrationRollback, MigrationRunner, MigrationStatus,
};
use tracing::{debug, info};

use crate::config::ProjectConfig;
use crate::tables;

/// Code migrations plus SQL files from the configured directory
pub fn build_registry(config: &MigrationConfig) -> anyhow::Result<MigrationRegistry> {
    let mut registry = MigrationRegistry::new();
    tables::register_all(&mut registry)?;

    let loaded = registry
        .load_dir(&MigrationManager::with_config(config.clone()))
        .with_context(|| format!("Failed to load migrations from {}", config.migrations_dir.display()))?;
    info!(code = registry.len() - loaded, files = loaded, "Registered migrations");

    Ok(registry)
}

async fn connect(project: &ProjectConfig, database_url: Option<&str>) -> anyhow::Result<Arc<dyn DatabasePool>> {
    let url = project.database_url(database_url)?;
    info!(url = %redact_database_url(&url), "Connecting to database");

    let pool = DatabaseBackendRegistry::with_defaults()
        .create_pool(
            &url,
            DatabasePoolConfig {
                max_connections: project.database.max_connections,
                ..DatabasePoolConfig::default()
            },
        )
        .await?;

    let latency = pool.health_check().await?;
    debug!(latency_ms = latency.as_millis() as u64, "Database is reachable");
    Ok(pool)
}

pub async fn up(project: &ProjectConfig, database_url: Option<&str>) -> anyhow::Result<()> {
    let config = project.migration_config();
    let registry = build_registry(&config)?;
    let pool = connect(project, database_url).await?;

    let runner = MigrationRunner::new(&registry, pool.clone(), config)?;
    let result = runner.apply_all().await;
    pool.close().await?;
    let result = result?;

    if result.applied_count() == 0 {
        println!("Database schema is up to date ({} applied)", result.skipped_count);
    } else {
        println!("Applied {} migration(s) in {}ms:", result.applied_count(), result.execution_time_ms);
        for id in &result.applied_migrations {
            println!("  {} {}", id, name_of(&registry, *id));
        }
    }
    Ok(())
}

pub async fn down(project: &ProjectConfig, database_url: Option<&str>, n: usize) -> anyhow::Result<()> {
    let config = project.migration_config();
    let registry = build_registry(&config)?;
    let pool = connect(project, database_url).await?;

    let runner = MigrationRunner::new(&registry, pool.clone(), config)?;
    let result = runner.revert_last(n).await;
    pool.close().await?;
    let result = result?;

    if result.rolled_back_count() == 0 {
        println!("No migrations to roll back");
        return Ok(());
    }

    println!("Rolled back {} migration(s):", result.rolled_back_count());
    for id in &result.rolled_back_migrations {
        if result.noop_reversions.contains(id) {
            println!("  {} {} (no-op reversal, schema change left in place)", id, name_of(&registry, *id));
        } else {
            println!("  {} {}", id, name_of(&registry, *id));
        }
    }
    Ok(())
}

pub async fn status(project: &ProjectConfig, database_url: Option<&str>, json: bool) -> anyhow::Result<()> {
    let config = project.migration_config();
    let registry = build_registry(&config)?;
    let pool = connect(project, database_url).await?;

    let runner = MigrationRunner::new(&registry, pool.clone(), config)?;
    let entries = runner.status().await;
    pool.close().await?;
    let entries = entries?;

    if json {
        println!("{}", serde_json::to_string_pretty(&entries)?);
        return Ok(());
    }

    println!("Migration Status:");
    println!("================");
    if entries.is_empty() {
        println!("No migrations found");
    }
    for entry in &entries {
        match &entry.status {
            MigrationStatus::Applied { applied_at } => {
                println!("  applied  {}  {}  ({})", entry.id, entry.name, applied_at.format("%Y-%m-%d %H:%M:%S UTC"))
            }
            MigrationStatus::Pending => println!("  pending  {}  {}", entry.id, entry.name),
        }
    }
    Ok(())
}

pub async fn version(project: &ProjectConfig, database_url: Option<&str>) -> anyhow::Result<()> {
    let config = project.migration_config();
    let registry = build_registry(&config)?;
    let pool = connect(project, database_url).await?;

    let runner = MigrationRunner::new(&registry, pool.clone(), config)?;
    let current = runner.current_version().await;
    pool.close().await?;

    match current? {
        Some(id) => println!("{}", id),
        None => println!("No migrations applied"),
    }
    Ok(())
}

pub fn create(project: &ProjectConfig, name: &str) -> anyhow::Result<()> {
    let manager = MigrationManager::with_config(project.migration_config());
    let filename = manager.create_migration(name)?;
    println!(
        "Created migration: {}",
        project.migrations.dir.join(filename).display()
    );
    Ok(())
}

fn name_of(registry: &MigrationRegistry, id: migrate_orm::MigrationId) -> &str {
    registry.get(id).map(|m| m.name()).unwrap_or("")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MigrationsConfig;

    #[test]
    fn test_registry_merges_code_and_sql_migrations() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("20240101000000_create_hosts.sql"),
            "-- Up migration\nCREATE TABLE hosts (id INTEGER PRIMARY KEY);\n-- Down migration\nDROP TABLE hosts;\n",
        )
        .unwrap();
        let config = MigrationConfig {
            migrations_dir: dir.path().to_path_buf(),
            ..MigrationConfig::default()
        };

        let registry = build_registry(&config).unwrap();
        let ids: Vec<u64> = registry.sorted().iter().map(|m| m.id().value()).collect();
        assert_eq!(ids, vec![20211109121546, 20240101000000]);
    }

    #[test]
    fn test_sql_file_cannot_reuse_a_code_identifier() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("20211109121546_shadow.sql"),
            "-- Up migration\nSELECT 1;\n",
        )
        .unwrap();
        let config = MigrationConfig {
            migrations_dir: dir.path().to_path_buf(),
            ..MigrationConfig::default()
        };

        assert!(build_registry(&config).is_err());
    }

    #[test]
    fn test_create_writes_into_configured_dir() {
        let dir = tempfile::tempdir().unwrap();
        let project = ProjectConfig {
            migrations: MigrationsConfig {
                dir: dir.path().join("migrations"),
                ..MigrationsConfig::default()
            },
            ..ProjectConfig::default()
        };

        create(&project, "add index to hosts").unwrap();

        let files: Vec<_> = std::fs::read_dir(dir.path().join("migrations"))
            .unwrap()
            .map(|entry| entry.unwrap().file_name().to_string_lossy().to_string())
            .collect();
        assert_eq!(files.len(), 1);
        assert!(files[0].ends_with("_add_index_to_hosts.sql"));
    }

    #[tokio::test]
    async fn test_shell_column_survives_down() {
        let dir = tempfile::tempdir().unwrap();
        let url = format!("sqlite://{}", dir.path().join("fleet.db").display());
        let project = ProjectConfig {
            migrations: MigrationsConfig {
                dir: dir.path().join("migrations"),
                ..MigrationsConfig::default()
            },
            ..ProjectConfig::default()
        };

        let pool = connect(&project, Some(&url)).await.unwrap();
        pool.execute("CREATE TABLE host_users (id INTEGER PRIMARY KEY)", &[]).await.unwrap();
        pool.close().await.unwrap();

        up(&project, Some(&url)).await.unwrap();
        down(&project, Some(&url), 1).await.unwrap();

        // Re-applying adds the column a second time.
        let err = up(&project, Some(&url)).await.unwrap_err();
        assert!(err.to_string().contains("20211109121546"));
    }
}
