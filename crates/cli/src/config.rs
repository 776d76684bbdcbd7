use std::path::{Path, PathBuf};

use anyhow::{bail, Context};
use migrate_orm::{IrreversiblePolicy, LockConfig, MigrationConfig};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Project configuration read from `migrate.yaml`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProjectConfig {
    pub database: DatabaseConfig,
    pub migrations: MigrationsConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    /// Environment variable holding the database URL
    pub url_env: String,
    /// Inline URL; takes precedence over `url_env`
    pub url: Option<String>,
    pub max_connections: u32,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url_env: "DATABASE_URL".to_string(),
            url: None,
            max_connections: 2,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MigrationsConfig {
    pub dir: PathBuf,
    pub table: String,
    pub allow_out_of_order: bool,
    pub irreversible_policy: IrreversiblePolicy,
    pub lock: LockConfig,
}

impl Default for MigrationsConfig {
    fn default() -> Self {
        let defaults = MigrationConfig::default();
        Self {
            dir: defaults.migrations_dir,
            table: defaults.migrations_table,
            allow_out_of_order: defaults.allow_out_of_order,
            irreversible_policy: defaults.irreversible_policy,
            lock: defaults.lock,
        }
    }
}

impl ProjectConfig {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        let config = serde_yaml::from_str(&content)
            .with_context(|| format!("Invalid configuration in {}", path.display()))?;
        Ok(config)
    }

    /// Load `path` if it exists, otherwise fall back to defaults
    pub fn load_or_default(path: &Path) -> anyhow::Result<Self> {
        if path.exists() {
            Self::load(path)
        } else {
            debug!(path = %path.display(), "No configuration file, using defaults");
            Ok(Self::default())
        }
    }

    pub fn migration_config(&self) -> MigrationConfig {
        MigrationConfig {
            migrations_dir: self.migrations.dir.clone(),
            migrations_table: self.migrations.table.clone(),
            lock: self.migrations.lock.clone(),
            allow_out_of_order: self.migrations.allow_out_of_order,
            irreversible_policy: self.migrations.irreversible_policy,
        }
    }

    /// Resolve the database URL: flag, then `database.url`, then the environment
    pub fn database_url(&self, flag: Option<&str>) -> anyhow::Result<String> {
        self.resolve_database_url(flag, |name| std::env::var(name).ok())
    }

    fn resolve_database_url(
        &self,
        flag: Option<&str>,
        env: impl Fn(&str) -> Option<String>,
    ) -> anyhow::Result<String> {
        if let Some(url) = flag {
            return Ok(url.to_string());
        }
        if let Some(url) = &self.database.url {
            return Ok(url.clone());
        }
        match env(&self.database.url_env) {
            Some(url) if !url.is_empty() => Ok(url),
            _ => bail!(
                "No database URL: pass --database-url, set database.url, or export {}",
                self.database.url_env
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_yaml_keeps_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("migrate.yaml");
        std::fs::write(
            &path,
            "database:\n  url_env: FLEET_DB\nmigrations:\n  table: fleet_migrations\n  irreversible_policy: refuse\n  lock:\n    lease_seconds: 60\n",
        )
        .unwrap();

        let config = ProjectConfig::load(&path).unwrap();
        assert_eq!(config.database.url_env, "FLEET_DB");
        assert_eq!(config.database.max_connections, 2);

        let migrations = config.migration_config();
        assert_eq!(migrations.migrations_table, "fleet_migrations");
        assert_eq!(migrations.migrations_dir, PathBuf::from("migrations"));
        assert_eq!(migrations.irreversible_policy, IrreversiblePolicy::Refuse);
        assert!(migrations.lock.enabled);
        assert_eq!(migrations.lock.lease_seconds, 60);
    }

    #[test]
    fn test_missing_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = ProjectConfig::load_or_default(&dir.path().join("absent.yaml")).unwrap();
        assert_eq!(config, ProjectConfig::default());
    }

    #[test]
    fn test_invalid_yaml_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("migrate.yaml");
        std::fs::write(&path, "migrations:\n  irreversible_policy: sometimes\n").unwrap();
        assert!(ProjectConfig::load_or_default(&path).is_err());
    }

    #[test]
    fn test_database_url_precedence() {
        let mut config = ProjectConfig::default();
        let env = |name: &str| (name == "DATABASE_URL").then(|| "postgres://env/db".to_string());

        assert_eq!(config.resolve_database_url(None, env).unwrap(), "postgres://env/db");

        config.database.url = Some("sqlite://file.db".to_string());
        assert_eq!(config.resolve_database_url(None, env).unwrap(), "sqlite://file.db");
        assert_eq!(
            config.resolve_database_url(Some("sqlite::memory:"), env).unwrap(),
            "sqlite::memory:"
        );
    }

    #[test]
    fn test_missing_database_url_names_the_variable() {
        let config = ProjectConfig::default();
        let err = config.resolve_database_url(None, |_| None).unwrap_err();
        assert!(err.to_string().contains("DATABASE_URL"));
    }
}
