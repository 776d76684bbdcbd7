//! Migrations defined in code
//!
//! Each submodule owns one migration and registers it with [`register_all`].
//! SQL-file migrations from the migrations directory are registered next to
//! these, so identifiers must stay unique across both sources.

use migrate_orm::{MigrationRegistry, OrmResult};

mod m20211109121546_add_shell_to_users;

pub fn register_all(registry: &mut MigrationRegistry) -> OrmResult<()> {
    m20211109121546_add_shell_to_users::register(registry)?;
    Ok(())
}
