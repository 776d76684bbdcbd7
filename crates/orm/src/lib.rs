//! # migrate-orm: sequential schema migrations
//!
//! Registers, orders, applies and rolls back discrete schema changes against
//! PostgreSQL or SQLite. Each migration runs in its own transaction together
//! with the ledger update that records it, and runs stop at the first failure.
//!
//! ```no_run
//! use migrate_orm::*;
//!
//! # async fn run() -> OrmResult<()> {
//! let mut registry = MigrationRegistry::new();
//! registry.register(Migration::new(
//!     "20211109121546".parse()?,
//!     "add shell to host users",
//!     SqlAction::new("ALTER TABLE host_users ADD COLUMN shell varchar(255) DEFAULT NULL"),
//!     NoOp,
//! ))?;
//!
//! let pool = DatabaseBackendRegistry::with_defaults()
//!     .create_pool("sqlite://fleet.db", DatabasePoolConfig::default())
//!     .await?;
//! let runner = MigrationRunner::new(&registry, pool, MigrationConfig::default())?;
//! runner.apply_all().await?;
//! runner.revert_last(1).await?;
//! # Ok(())
//! # }
//! ```

pub mod backends;
pub mod error;
pub mod migrations;

pub use backends::{
    detect_backend_from_url, redact_database_url, DatabaseBackend, DatabaseBackendRegistry,
    DatabaseBackendType, DatabasePool, DatabasePoolConfig, DatabaseRow, DatabaseTransaction,
    DatabaseValue, SqlDialect,
};
pub use error::{OrmError, OrmResult};
pub use migrations::*;
