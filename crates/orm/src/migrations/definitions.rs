//! Migration Definitions - Core types and structures for migrations
//!
//! Defines the fundamental types used throughout the migration system:
//! identifiers, applied-state entries, configuration and run reports.

use std::cmp::Ordering;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::backends::validate_identifier;
use crate::error::{OrmError, OrmResult};

/// Identifier of a migration, typically a `YYYYMMDDhhmmss` timestamp.
///
/// Identifiers compare numerically, so `9 < 10` regardless of how many
/// digits each was written with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub struct MigrationId(u64);

impl MigrationId {
    pub const fn new(value: u64) -> Self {
        Self(value)
    }

    pub fn value(&self) -> u64 {
        self.0
    }
}

impl Ord for MigrationId {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0.cmp(&other.0)
    }
}

impl PartialOrd for MigrationId {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for MigrationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for MigrationId {
    type Err = OrmError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() || !s.bytes().all(|b| b.is_ascii_digit()) {
            return Err(OrmError::InvalidIdentifier(s.to_string()));
        }
        s.parse::<u64>()
            .map(MigrationId)
            .map_err(|_| OrmError::InvalidIdentifier(s.to_string()))
    }
}

impl From<u64> for MigrationId {
    fn from(value: u64) -> Self {
        MigrationId(value)
    }
}

impl From<MigrationId> for String {
    fn from(id: MigrationId) -> Self {
        id.to_string()
    }
}

impl TryFrom<String> for MigrationId {
    type Error = OrmError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

/// A row of the applied-state store
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppliedMigration {
    /// Migration ID
    pub id: MigrationId,
    /// When the forward action committed
    pub applied_at: DateTime<Utc>,
}

/// What to do when a reverse action declares itself a no-op
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IrreversiblePolicy {
    /// Record the reversion silently
    Allow,
    /// Record the reversion and log a warning
    #[default]
    Warn,
    /// Refuse to revert; nothing is changed
    Refuse,
}

impl FromStr for IrreversiblePolicy {
    type Err = OrmError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "allow" => Ok(IrreversiblePolicy::Allow),
            "warn" => Ok(IrreversiblePolicy::Warn),
            "refuse" => Ok(IrreversiblePolicy::Refuse),
            other => Err(OrmError::Configuration(format!(
                "Unknown irreversible policy '{}': expected allow, warn or refuse",
                other
            ))),
        }
    }
}

/// Longest lease a lock may be configured with
pub const MAX_LEASE_SECONDS: u64 = 7 * 24 * 60 * 60;

/// Advisory lock settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LockConfig {
    /// Take the lock around every mutating run
    pub enabled: bool,
    /// Seconds after which a lock left behind by a dead runner may be taken over
    pub lease_seconds: u64,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            lease_seconds: 300,
        }
    }
}

/// Configuration for the migration system
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MigrationConfig {
    /// Directory where SQL migration files are stored
    pub migrations_dir: PathBuf,
    /// Table name for tracking applied migrations
    pub migrations_table: String,
    /// Advisory lock settings
    pub lock: LockConfig,
    /// Apply pending migrations that sort below the latest applied one
    pub allow_out_of_order: bool,
    /// Handling of no-op reverse actions
    pub irreversible_policy: IrreversiblePolicy,
}

impl Default for MigrationConfig {
    fn default() -> Self {
        Self {
            migrations_dir: PathBuf::from("migrations"),
            migrations_table: "schema_migrations".to_string(),
            lock: LockConfig::default(),
            allow_out_of_order: false,
            irreversible_policy: IrreversiblePolicy::default(),
        }
    }
}

impl MigrationConfig {
    /// Check the settings that end up spliced into SQL
    pub fn validate(&self) -> OrmResult<()> {
        validate_identifier(&self.migrations_table)?;
        validate_identifier(&self.lock_table())?;
        if self.lock.enabled && self.lock.lease_seconds == 0 {
            return Err(OrmError::Configuration(
                "lock.lease_seconds must be greater than zero".to_string(),
            ));
        }
        if self.lock.lease_seconds > MAX_LEASE_SECONDS {
            return Err(OrmError::Configuration(format!(
                "lock.lease_seconds must not exceed {} (one week)",
                MAX_LEASE_SECONDS
            )));
        }
        Ok(())
    }

    /// Name of the table holding the advisory lock row
    pub fn lock_table(&self) -> String {
        format!("{}_lock", self.migrations_table)
    }
}

/// Result of running migrations
#[derive(Debug, Clone, Default, Serialize)]
pub struct MigrationRunResult {
    /// IDs of migrations that were applied, in application order
    pub applied_migrations: Vec<MigrationId>,
    /// Number of migrations that were already applied and skipped
    pub skipped_count: usize,
    /// Total execution time in milliseconds
    pub execution_time_ms: u128,
}

impl MigrationRunResult {
    pub fn applied_count(&self) -> usize {
        self.applied_migrations.len()
    }
}

/// Result of rolling back migrations
#[derive(Debug, Clone, Default, Serialize)]
pub struct RollbackResult {
    /// IDs of migrations that were rolled back, most recent first
    pub rolled_back_migrations: Vec<MigrationId>,
    /// Subset whose reverse action was a no-op; their schema change persists
    pub noop_reversions: Vec<MigrationId>,
    /// Total execution time in milliseconds
    pub execution_time_ms: u128,
}

impl RollbackResult {
    pub fn rolled_back_count(&self) -> usize {
        self.rolled_back_migrations.len()
    }
}

/// Migration direction for execution
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MigrationDirection {
    /// Apply the migration (run the forward action)
    Up,
    /// Rollback the migration (run the reverse action)
    Down,
}

impl fmt::Display for MigrationDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MigrationDirection::Up => write!(f, "up"),
            MigrationDirection::Down => write!(f, "down"),
        }
    }
}

/// Migration status in the system
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "lowercase")]
pub enum MigrationStatus {
    /// Migration is pending (not yet applied)
    Pending,
    /// Migration has been applied
    Applied {
        /// When it was applied
        applied_at: DateTime<Utc>,
    },
}

/// One line of `status`: a registered migration and where it stands
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MigrationStatusEntry {
    pub id: MigrationId,
    pub name: String,
    #[serde(flatten)]
    pub status: MigrationStatus,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ids_order_numerically() {
        let short: MigrationId = "9".parse().unwrap();
        let long: MigrationId = "10".parse().unwrap();
        assert!(short < long);

        let mut ids: Vec<MigrationId> = ["20211109121546", "20200101000000", "20211109121545"]
            .iter()
            .map(|s| s.parse().unwrap())
            .collect();
        ids.sort();
        assert_eq!(
            ids.iter().map(|id| id.to_string()).collect::<Vec<_>>(),
            vec!["20200101000000", "20211109121545", "20211109121546"]
        );
    }

    #[test]
    fn test_rejects_malformed_ids() {
        for bad in ["", "2021-11-09", "abc", " 1", "99999999999999999999999"] {
            assert!(
                matches!(bad.parse::<MigrationId>(), Err(OrmError::InvalidIdentifier(_))),
                "{bad:?} should be rejected"
            );
        }
    }

    #[test]
    fn test_id_serializes_as_string() {
        let id = MigrationId::new(20211109121546);
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, "\"20211109121546\"");
        let back: MigrationId = serde_json::from_str(&json).unwrap();
        assert_eq!(back, id);
    }

    #[test]
    fn test_config_defaults_and_validation() {
        let config = MigrationConfig::default();
        assert_eq!(config.migrations_table, "schema_migrations");
        assert_eq!(config.lock_table(), "schema_migrations_lock");
        assert!(config.lock.enabled);
        assert_eq!(config.irreversible_policy, IrreversiblePolicy::Warn);
        assert!(config.validate().is_ok());

        let bad_table = MigrationConfig {
            migrations_table: "migrations; DROP TABLE users".to_string(),
            ..MigrationConfig::default()
        };
        assert!(bad_table.validate().is_err());

        let zero_lease = MigrationConfig {
            lock: LockConfig { enabled: true, lease_seconds: 0 },
            ..MigrationConfig::default()
        };
        assert!(zero_lease.validate().is_err());

        let endless_lease = MigrationConfig {
            lock: LockConfig { enabled: true, lease_seconds: u64::MAX },
            ..MigrationConfig::default()
        };
        assert!(endless_lease.validate().is_err());
    }

    #[test]
    fn test_irreversible_policy_parsing() {
        assert_eq!("Refuse".parse::<IrreversiblePolicy>().unwrap(), IrreversiblePolicy::Refuse);
        assert_eq!("allow".parse::<IrreversiblePolicy>().unwrap(), IrreversiblePolicy::Allow);
        assert!("maybe".parse::<IrreversiblePolicy>().is_err());
    }

    #[test]
    fn test_status_entry_json_shape() {
        let entry = MigrationStatusEntry {
            id: MigrationId::new(1),
            name: "create hosts".to_string(),
            status: MigrationStatus::Pending,
        };
        let json = serde_json::to_value(&entry).unwrap();
        assert_eq!(json["id"], "1");
        assert_eq!(json["state"], "pending");
    }
}
