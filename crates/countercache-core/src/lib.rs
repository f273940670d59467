//! Persistence seam for countercache.
//!
//! This crate holds everything the counter-cache engine needs from a host
//! database layer and nothing more:
//!
//! - [`Executor`] for running parameterized statements and aggregate queries
//! - [`Connection`] / [`TransactionOps`] for scoped transactions
//! - [`Dialect`] for placeholder syntax, quoting and row-lock clauses
//! - [`Value`], [`Row`] and [`RowId`] for data crossing the seam
//! - `Outcome` and `Cx` re-exported from asupersync for cancel-correct calls

// Re-export asupersync primitives for structured concurrency
pub use asupersync::{Cx, Outcome};

pub mod connection;
pub mod error;
pub mod id;
pub mod identifiers;
pub mod model;
pub mod row;
pub mod value;

pub use connection::{Connection, Dialect, Executor, IsolationLevel, TransactionOps};
pub use error::{
    ConnectionError, ConnectionErrorKind, Error, QueryError, QueryErrorKind, Result, TypeError,
};
pub use id::RowId;
pub use identifiers::{is_valid_identifier, quote_ident, quote_ident_mysql};
pub use model::Model;
pub use row::{ColumnInfo, FromValue, Row};
pub use value::Value;
