//! Migration actions - the forward and reverse halves of a migration
//!
//! An action receives the open transaction of its migration and nothing else;
//! the runner owns begin, commit and rollback.

use std::fmt;
use std::future::Future;
use std::pin::Pin;

use async_trait::async_trait;
use sqlparser::dialect::GenericDialect;
use sqlparser::parser::Parser;

use crate::backends::DatabaseTransaction;
use crate::error::OrmResult;

/// Future returned by plain-function actions
pub type ActionFuture<'a> = Pin<Box<dyn Future<Output = OrmResult<()>> + Send + 'a>>;

/// Signature of a plain-function action
pub type ActionFn = for<'a> fn(&'a mut dyn DatabaseTransaction) -> ActionFuture<'a>;

/// One direction of a migration
#[async_trait]
pub trait MigrationAction: Send + Sync {
    /// Run the action inside the migration's transaction
    async fn run(&self, tx: &mut dyn DatabaseTransaction) -> OrmResult<()>;

    /// True when the action deliberately does nothing.
    ///
    /// Only meaningful for reverse actions: reverting such a migration drops
    /// its ledger entry while the schema change stays in place.
    fn is_noop(&self) -> bool {
        false
    }
}

/// Action that does nothing and always succeeds
#[derive(Debug, Clone, Copy, Default)]
pub struct NoOp;

#[async_trait]
impl MigrationAction for NoOp {
    async fn run(&self, _tx: &mut dyn DatabaseTransaction) -> OrmResult<()> {
        Ok(())
    }

    fn is_noop(&self) -> bool {
        true
    }
}

/// Action executing one or more SQL statements in order
#[derive(Debug, Clone)]
pub struct SqlAction {
    statements: Vec<String>,
}

impl SqlAction {
    /// Build from a script that may hold several `;`-separated statements
    pub fn new(sql: &str) -> Self {
        Self {
            statements: split_sql_statements(sql),
        }
    }

    /// Build from statements that are already split
    pub fn from_statements<I, S>(statements: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            statements: statements
                .into_iter()
                .map(Into::into)
                .filter(|s: &String| !s.trim().is_empty())
                .collect(),
        }
    }

    pub fn statements(&self) -> &[String] {
        &self.statements
    }
}

#[async_trait]
impl MigrationAction for SqlAction {
    async fn run(&self, tx: &mut dyn DatabaseTransaction) -> OrmResult<()> {
        for statement in &self.statements {
            tx.execute(statement, &[]).await?;
        }
        Ok(())
    }

    fn is_noop(&self) -> bool {
        self.statements.is_empty()
    }
}

/// Action backed by a plain `fn`
#[derive(Clone, Copy)]
pub struct FnAction(pub ActionFn);

impl fmt::Debug for FnAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("FnAction")
    }
}

#[async_trait]
impl MigrationAction for FnAction {
    async fn run(&self, tx: &mut dyn DatabaseTransaction) -> OrmResult<()> {
        (self.0)(tx).await
    }
}

/// Split SQL statements for execution using proper SQL parsing
pub fn split_sql_statements(sql: &str) -> Vec<String> {
    if sql.trim().is_empty() {
        return Vec::new();
    }

    let dialect = GenericDialect {};
    match Parser::parse_sql(&dialect, sql) {
        Ok(parsed_statements) => parsed_statements
            .into_iter()
            .map(|stmt| stmt.to_string())
            .collect(),
        Err(e) => {
            // If parsing fails, fall back to naive splitting with a warning
            tracing::warn!("SQL parsing failed, using naive semicolon splitting: {}", e);
            sql.split(';')
                .map(|s| s.trim())
                .filter(|s| !s.is_empty())
                .map(|s| s.to_string())
                .collect()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_splits_multiple_statements() {
        let statements = split_sql_statements(
            "CREATE TABLE hosts (id INTEGER PRIMARY KEY);\n\
             ALTER TABLE host_users ADD COLUMN shell VARCHAR(255) DEFAULT NULL;",
        );
        assert_eq!(statements.len(), 2);
        assert!(statements[0].starts_with("CREATE TABLE hosts"));
        assert!(statements[1].contains("ADD COLUMN shell"));
    }

    #[test]
    fn test_falls_back_to_naive_splitting() {
        let statements = split_sql_statements("NOT REALLY SQL one; NOT REALLY SQL two;");
        assert_eq!(statements, vec!["NOT REALLY SQL one", "NOT REALLY SQL two"]);
    }

    #[test]
    fn test_empty_sql_action_is_noop() {
        assert!(SqlAction::new("   \n").is_noop());
        assert!(SqlAction::from_statements(Vec::<String>::new()).is_noop());
        assert!(!SqlAction::new("DROP TABLE hosts").is_noop());
        assert!(NoOp.is_noop());
    }
}
