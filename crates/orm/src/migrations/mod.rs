//! Migration System
//!
//! This module provides database migration management: a registry of
//! migrations, the applied-state ledger, an advisory lock, and the runner
//! that applies and reverts migrations in identifier order.

pub mod action;
pub mod definitions;
pub mod lock;
pub mod manager;
pub mod registry;
pub mod rollback;
pub mod runner;
pub mod store;

pub use action::*;
pub use definitions::*;
pub use lock::MigrationLock;
pub use manager::MigrationManager;
pub use registry::{Migration, MigrationRegistry};
pub use rollback::MigrationRollback;
pub use runner::MigrationRunner;
pub use store::AppliedStateStore;
