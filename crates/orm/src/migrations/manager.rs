//! Migration Manager - File system operations for migrations
//!
//! Handles creating, loading, and parsing SQL migration files. A file is
//! named `<id>_<name>.sql`, where `<id>` is all digits, and holds an
//! `-- Up migration` section followed by a `-- Down migration` section.

use std::fs;
use std::path::Path;

use chrono::Utc;

use super::action::{NoOp, SqlAction};
use super::definitions::{MigrationConfig, MigrationId};
use super::registry::Migration;
use crate::error::{OrmError, OrmResult};

/// Migration manager for creating and loading SQL migration files
#[derive(Debug, Clone)]
pub struct MigrationManager {
    config: MigrationConfig,
}

impl MigrationManager {
    /// Create a new migration manager with default configuration
    pub fn new() -> Self {
        Self::with_config(MigrationConfig::default())
    }

    /// Create a new migration manager with custom configuration
    pub fn with_config(config: MigrationConfig) -> Self {
        Self { config }
    }

    /// Get the configuration
    pub fn config(&self) -> &MigrationConfig {
        &self.config
    }

    /// Create a new migration file, returning its file name
    pub fn create_migration(&self, name: &str) -> OrmResult<String> {
        let slug = slugify(name);
        if slug.is_empty() {
            return Err(OrmError::Migration(format!("Invalid migration name '{}'", name)));
        }

        fs::create_dir_all(&self.config.migrations_dir)
            .map_err(|e| OrmError::Migration(format!("Failed to create migrations directory: {}", e)))?;

        let migration_id = Utc::now().format("%Y%m%d%H%M%S").to_string();
        let filename = format!("{}_{}.sql", migration_id, slug);
        let filepath = self.config.migrations_dir.join(&filename);
        if filepath.exists() {
            return Err(OrmError::Migration(format!("Migration file {} already exists", filename)));
        }

        fs::write(&filepath, self.create_migration_template(name, &migration_id))
            .map_err(|e| OrmError::Migration(format!("Failed to write migration file: {}", e)))?;

        Ok(filename)
    }

    /// Load all migration files from the migrations directory, sorted by id
    pub fn load_migrations(&self) -> OrmResult<Vec<Migration>> {
        if !self.config.migrations_dir.exists() {
            return Ok(Vec::new());
        }

        let mut migrations = Vec::new();
        let entries = fs::read_dir(&self.config.migrations_dir)
            .map_err(|e| OrmError::Migration(format!("Failed to read migrations directory: {}", e)))?;

        for entry in entries {
            let entry = entry
                .map_err(|e| OrmError::Migration(format!("Failed to read directory entry: {}", e)))?;

            let path = entry.path();
            if path.extension().map_or(false, |ext| ext == "sql") {
                migrations.push(self.parse_migration_file(&path)?);
            }
        }

        migrations.sort_by_key(|m| m.id());
        Ok(migrations)
    }

    /// Parse a migration file into a Migration
    fn parse_migration_file(&self, path: &Path) -> OrmResult<Migration> {
        let content = fs::read_to_string(path)
            .map_err(|e| OrmError::Migration(format!("Failed to read migration file: {}", e)))?;

        let stem = path.file_stem()
            .and_then(|s| s.to_str())
            .ok_or_else(|| OrmError::Migration("Invalid migration filename".to_string()))?;

        let (id_part, name_part) = stem.split_once('_')
            .ok_or_else(|| OrmError::Migration(format!(
                "Migration filename '{}' must follow format: <id>_<name>.sql", stem
            )))?;
        let id: MigrationId = id_part.parse()?;
        let name = name_part.replace('_', " ");

        let (up_sql, down_sql) = parse_migration_content(&content);
        if up_sql.is_empty() {
            return Err(OrmError::Migration(format!("Migration {} has no up statements", stem)));
        }

        let up = SqlAction::new(&up_sql);
        if down_sql.is_empty() {
            Ok(Migration::new(id, name, up, NoOp))
        } else {
            Ok(Migration::new(id, name, up, SqlAction::new(&down_sql)))
        }
    }

    /// Create migration template content
    fn create_migration_template(&self, name: &str, migration_id: &str) -> String {
        format!(
            "-- Migration: {}\n\
             -- ID: {}\n\
             -- Created: {}\n\n\
             -- Up migration\n\
             -- Add your schema changes here\n\n\n\
             -- Down migration\n\
             -- Add rollback statements here; leave empty for an irreversible migration\n\n",
            name,
            migration_id,
            Utc::now().format("%Y-%m-%d %H:%M:%S UTC")
        )
    }
}

impl Default for MigrationManager {
    fn default() -> Self {
        Self::new()
    }
}

const UP_MARKER: &str = "-- Up migration";
const DOWN_MARKER: &str = "-- Down migration";

/// Parse migration content to extract UP and DOWN SQL
fn parse_migration_content(content: &str) -> (String, String) {
    let mut up_sql = Vec::new();
    let mut down_sql = Vec::new();
    let mut current_section = "";

    for line in content.lines() {
        let trimmed = line.trim();

        // Only a whole-line marker switches sections; other comments are skipped below.
        if trimmed.eq_ignore_ascii_case(UP_MARKER) {
            current_section = "up";
            continue;
        } else if trimmed.eq_ignore_ascii_case(DOWN_MARKER) {
            current_section = "down";
            continue;
        }

        // Skip comment lines and empty lines
        if line.trim().is_empty() || line.trim().starts_with("--") {
            continue;
        }

        match current_section {
            "up" => up_sql.push(line),
            "down" => down_sql.push(line),
            _ => {} // Before any section marker
        }
    }

    (up_sql.join("\n").trim().to_string(), down_sql.join("\n").trim().to_string())
}

fn slugify(name: &str) -> String {
    name.trim()
        .to_lowercase()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect::<String>()
        .split('_')
        .filter(|part| !part.is_empty())
        .collect::<Vec<_>>()
        .join("_")
}
