//! Error types for the migration system
//!
//! Every failure the registry, the applied-state store, the advisory lock or
//! the runner can produce is a variant of [`OrmError`].

use thiserror::Error;

use crate::migrations::definitions::{MigrationDirection, MigrationId};

/// ORM result type alias
pub type OrmResult<T> = Result<T, OrmError>;

/// Error types for migration operations
#[derive(Debug, Clone, Error)]
pub enum OrmError {
    /// Two migrations were registered under the same identifier
    #[error("Duplicate migration identifier: {0}")]
    DuplicateIdentifier(MigrationId),

    /// Identifier text could not be parsed
    #[error("Invalid migration identifier '{0}': expected a non-empty run of ASCII digits")]
    InvalidIdentifier(String),

    /// Applied-state store I/O failed
    #[error("Persistence error: {0}")]
    Persistence(String),

    /// A forward or reverse action failed; its transaction was rolled back
    #[error("Migration {id} failed while migrating {direction}: {message}")]
    MigrationAction {
        id: MigrationId,
        direction: MigrationDirection,
        message: String,
    },

    /// The store lists a migration the registry does not know
    #[error("Migration {0} is recorded as applied but is not registered")]
    UnknownMigration(MigrationId),

    /// A pending migration sorts below one that is already applied
    #[error("Migration {pending} is pending but newer migration {latest_applied} is already applied")]
    OutOfOrder {
        pending: MigrationId,
        latest_applied: MigrationId,
    },

    /// Reverse action is a no-op and the policy refuses lossy rollbacks
    #[error("Migration {0} cannot be reverted: its reverse action is a no-op")]
    Irreversible(MigrationId),

    /// Another runner holds the advisory lock
    #[error("Migration lock is held by runner {owner}")]
    LockHeld { owner: String },

    /// Connection or pool error
    #[error("Connection error: {0}")]
    Connection(String),

    /// Query execution error
    #[error("Query error: {0}")]
    Query(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Migration file handling error
    #[error("Migration error: {0}")]
    Migration(String),
}

impl OrmError {
    /// Identifier of the migration this error is about, if any
    pub fn migration_id(&self) -> Option<MigrationId> {
        match self {
            OrmError::DuplicateIdentifier(id)
            | OrmError::UnknownMigration(id)
            | OrmError::Irreversible(id) => Some(*id),
            OrmError::MigrationAction { id, .. } => Some(*id),
            OrmError::OutOfOrder { pending, .. } => Some(*pending),
            _ => None,
        }
    }
}

impl From<sqlx::Error> for OrmError {
    fn from(err: sqlx::Error) -> Self {
        OrmError::Query(err.to_string())
    }
}

impl From<std::io::Error> for OrmError {
    fn from(err: std::io::Error) -> Self {
        OrmError::Migration(err.to_string())
    }
}
