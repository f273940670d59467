//! SQLite driver for countercache.
//!
//! Implements the `Executor`, `Connection` and `TransactionOps` traits from
//! countercache-core on top of libsqlite3, so counter caches can be kept on
//! SQLite tables and the engine can be exercised against a real database.
//!
//! # Example
//!
//! ```rust,ignore
//! use countercache_sqlite::SqliteConnection;
//! use countercache_core::{Cx, Executor, Outcome, Value};
//!
//! let conn = SqliteConnection::open_memory()?;
//! conn.execute_raw("CREATE TABLE posts (id INTEGER PRIMARY KEY, comments_count INTEGER NOT NULL DEFAULT 0)")?;
//!
//! let cx = Cx::for_testing();
//! match conn.execute(&cx, "UPDATE posts SET comments_count = comments_count + $1 WHERE id = $2", &[Value::BigInt(1), Value::BigInt(7)]).await {
//!     Outcome::Ok(rows) => println!("{rows} row(s) updated"),
//!     Outcome::Err(e) => eprintln!("Error: {e}"),
//!     _ => {}
//! }
//! ```
//!
//! # Type Mapping
//!
//! | Value | SQLite storage class |
//! |-------|----------------------|
//! | `Bool`, `Int`, `BigInt` | INTEGER |
//! | `Double` | REAL |
//! | `Text`, `Decimal` | TEXT |
//! | `Bytes` | BLOB |
//! | `Timestamp` | INTEGER (microseconds) |
//! | `Null` | NULL |
//!
//! # Thread Safety
//!
//! `SqliteConnection` is `Send + Sync`; an internal mutex serializes access
//! to the database handle. One transaction may be open per connection at a
//! time. Hosts that want concurrent writers open one connection per worker
//! against a file database.

// FFI bindings require unsafe code
#![allow(unsafe_code)]

pub mod connection;
pub mod types;

pub use connection::{SqliteConfig, SqliteConnection, SqliteTransaction};

/// The linked SQLite library version.
pub fn sqlite_version() -> &'static str {
    // SAFETY: sqlite3_libversion returns a pointer to a static string
    unsafe {
        let ptr = libsqlite3_sys::sqlite3_libversion();
        std::ffi::CStr::from_ptr(ptr).to_str().unwrap_or("unknown")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sqlite_version() {
        assert!(sqlite_version().starts_with('3'));
    }
}
