//! Database execution traits.
//!
//! This module defines what the counter-cache engine consumes from a host
//! persistence layer:
//!
//! - [`Executor`] - Run a parameterized statement or query
//! - [`Connection`] - An executor that can open transactions
//! - [`TransactionOps`] - A transaction scope with commit/rollback and savepoints
//! - [`Dialect`] - SQL syntax differences the engine has to care about
//!
//! All operations integrate with asupersync's structured concurrency via `Cx`
//! for cancellation and timeout handling.

use crate::error::Error;
use crate::identifiers::{quote_ident, quote_ident_mysql};
use crate::row::Row;
use crate::value::Value;
use asupersync::{Cx, Outcome};
use std::future::Future;

/// Transaction isolation level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum IsolationLevel {
    /// Read uncommitted: dirty reads possible.
    ReadUncommitted,

    /// Read committed: only committed changes are visible.
    /// This is the default for PostgreSQL.
    #[default]
    ReadCommitted,

    /// Repeatable read: a consistent snapshot for the whole transaction.
    RepeatableRead,

    /// Serializable: transactions appear to execute sequentially.
    Serializable,
}

impl IsolationLevel {
    /// Get the SQL syntax for this isolation level.
    #[must_use]
    pub const fn as_sql(&self) -> &'static str {
        match self {
            IsolationLevel::ReadUncommitted => "READ UNCOMMITTED",
            IsolationLevel::ReadCommitted => "READ COMMITTED",
            IsolationLevel::RepeatableRead => "REPEATABLE READ",
            IsolationLevel::Serializable => "SERIALIZABLE",
        }
    }
}

/// SQL dialect of the host database.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Dialect {
    /// PostgreSQL: `$n` placeholders, `FOR UPDATE` row locks.
    #[default]
    Postgres,
    /// MySQL: `?` placeholders, backtick quoting, `FOR UPDATE` row locks.
    MySql,
    /// SQLite: `$n` placeholders, no row locks. A write transaction opened
    /// with `BEGIN IMMEDIATE` already holds the database write lock.
    Sqlite,
}

impl Dialect {
    /// Placeholder for the `n`th (1-based) bound parameter.
    #[must_use]
    pub fn placeholder(self, n: usize) -> String {
        match self {
            Dialect::MySql => "?".to_string(),
            Dialect::Postgres | Dialect::Sqlite => format!("${}", n),
        }
    }

    /// Quote an identifier for this dialect.
    #[must_use]
    pub fn quote(self, name: &str) -> String {
        match self {
            Dialect::MySql => quote_ident_mysql(name),
            Dialect::Postgres | Dialect::Sqlite => quote_ident(name),
        }
    }

    /// Clause appended to a SELECT to lock the selected rows, if supported.
    #[must_use]
    pub const fn lock_clause(self) -> Option<&'static str> {
        match self {
            Dialect::Postgres | Dialect::MySql => Some("FOR UPDATE"),
            Dialect::Sqlite => None,
        }
    }

    /// Expression evaluating to the current timestamp on the server.
    #[must_use]
    pub const fn now(self) -> &'static str {
        "CURRENT_TIMESTAMP"
    }
}

/// Something that runs SQL: a connection or an open transaction.
///
/// The counter-cache engine never opens connections or decides transaction
/// boundaries for incremental updates; it issues every statement through
/// the executor the host hands in, so counter updates share the caller's
/// atomicity boundary.
pub trait Executor: Send + Sync {
    /// SQL dialect spoken by this executor.
    fn dialect(&self) -> Dialect;

    /// Execute a query and return all rows.
    fn query(
        &self,
        cx: &Cx,
        sql: &str,
        params: &[Value],
    ) -> impl Future<Output = Outcome<Vec<Row>, Error>> + Send;

    /// Execute a query and return the first row, if any.
    fn query_one(
        &self,
        cx: &Cx,
        sql: &str,
        params: &[Value],
    ) -> impl Future<Output = Outcome<Option<Row>, Error>> + Send;

    /// Execute a statement (INSERT, UPDATE, DELETE) and return rows affected.
    fn execute(
        &self,
        cx: &Cx,
        sql: &str,
        params: &[Value],
    ) -> impl Future<Output = Outcome<u64, Error>> + Send;
}

/// A database connection capable of opening transactions.
///
/// # Example
///
/// ```rust,ignore
/// let tx = conn.begin(&cx).await?;
/// tx.execute(&cx, "UPDATE posts SET comments_count = 0 WHERE id = $1", &[Value::BigInt(1)]).await?;
/// tx.commit(&cx).await?;
/// ```
pub trait Connection: Executor {
    /// The transaction type returned by this connection.
    type Tx<'conn>: TransactionOps
    where
        Self: 'conn;

    /// Begin a transaction with default isolation level (ReadCommitted).
    fn begin(&self, cx: &Cx) -> impl Future<Output = Outcome<Self::Tx<'_>, Error>> + Send;

    /// Begin a transaction with a specific isolation level.
    fn begin_with(
        &self,
        cx: &Cx,
        isolation: IsolationLevel,
    ) -> impl Future<Output = Outcome<Self::Tx<'_>, Error>> + Send;
}

/// Operations on an open transaction.
///
/// Transactions must be explicitly committed; dropping one without
/// committing rolls it back.
pub trait TransactionOps: Executor {
    /// Create a savepoint within this transaction.
    fn savepoint(&self, cx: &Cx, name: &str) -> impl Future<Output = Outcome<(), Error>> + Send;

    /// Rollback to a previously created savepoint.
    fn rollback_to(&self, cx: &Cx, name: &str)
    -> impl Future<Output = Outcome<(), Error>> + Send;

    /// Release a savepoint.
    fn release(&self, cx: &Cx, name: &str) -> impl Future<Output = Outcome<(), Error>> + Send;

    /// Commit the transaction, making all changes permanent.
    fn commit(self, cx: &Cx) -> impl Future<Output = Outcome<(), Error>> + Send;

    /// Rollback the transaction, discarding all changes.
    fn rollback(self, cx: &Cx) -> impl Future<Output = Outcome<(), Error>> + Send;
}
