//! SQLite connection implementation.
//!
//! Safe wrappers around SQLite's C API implementing the `Executor`,
//! `Connection` and `TransactionOps` traits from countercache-core.

// Allow casts in FFI code where we need to match C types exactly
#![allow(clippy::cast_lossless)]
#![allow(clippy::borrow_as_ptr)] // FFI requires raw pointers
#![allow(clippy::if_not_else)] // Clearer for error handling

use crate::types;
use countercache_core::{
    Connection, Cx, Dialect, Error, Executor, IsolationLevel, Outcome, QueryErrorKind, Row,
    TransactionOps, Value,
    error::{ConnectionError, ConnectionErrorKind},
    row::ColumnInfo,
};
use libsqlite3_sys as ffi;
use std::ffi::{CStr, CString, c_int};
use std::future::Future;
use std::ptr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{debug, trace};

// The bundled libsqlite3-sys bindings omit `sqlite3_close_v2`, but the
// statically linked amalgamation exports it.
unsafe extern "C" {
    fn sqlite3_close_v2(db: *mut ffi::sqlite3) -> c_int;
}

/// Configuration for opening SQLite connections.
#[derive(Debug, Clone)]
pub struct SqliteConfig {
    /// Path to the database file, or ":memory:" for an in-memory database.
    pub path: String,
    /// Open the database read-only.
    pub read_only: bool,
    /// Busy timeout in milliseconds. A writer waiting on another
    /// connection's lock gives up with `QueryErrorKind::Locked` after this.
    pub busy_timeout_ms: u32,
}

impl Default for SqliteConfig {
    fn default() -> Self {
        Self {
            path: ":memory:".to_string(),
            read_only: false,
            busy_timeout_ms: 5000,
        }
    }
}

impl SqliteConfig {
    /// Create a config for a file-based database.
    pub fn file(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            ..Default::default()
        }
    }

    /// Create a config for an in-memory database.
    pub fn memory() -> Self {
        Self::default()
    }

    /// Open read-only.
    pub fn read_only(mut self, read_only: bool) -> Self {
        self.read_only = read_only;
        self
    }

    /// Set the busy timeout.
    pub fn busy_timeout(mut self, ms: u32) -> Self {
        self.busy_timeout_ms = ms;
        self
    }

    fn open_flags(&self) -> c_int {
        let access = if self.read_only {
            ffi::SQLITE_OPEN_READONLY
        } else {
            ffi::SQLITE_OPEN_READWRITE | ffi::SQLITE_OPEN_CREATE
        };
        access | ffi::SQLITE_OPEN_FULLMUTEX
    }
}

/// Inner state of the SQLite connection, protected by a mutex.
struct SqliteInner {
    db: *mut ffi::sqlite3,
    in_transaction: bool,
}

// SAFETY: the handle is opened with SQLITE_OPEN_FULLMUTEX and all access
// goes through the Mutex in SqliteConnection.
unsafe impl Send for SqliteInner {}

/// A connection to a SQLite database.
///
/// Statements issued on the connection while a [`SqliteTransaction`] is
/// open run inside that transaction.
pub struct SqliteConnection {
    inner: Mutex<SqliteInner>,
    path: String,
}

// SqliteConnection is Send + Sync because all access goes through the Mutex
unsafe impl Send for SqliteConnection {}
unsafe impl Sync for SqliteConnection {}

impl std::fmt::Debug for SqliteConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteConnection")
            .field("path", &self.path)
            .field("in_transaction", &self.lock().in_transaction)
            .finish()
    }
}

impl SqliteConnection {
    /// Open a new SQLite connection with the given configuration.
    pub fn open(config: &SqliteConfig) -> Result<Self, Error> {
        let c_path = CString::new(config.path.as_str()).map_err(|_| {
            Error::Connection(ConnectionError {
                kind: ConnectionErrorKind::Connect,
                message: "Invalid path: contains null byte".to_string(),
                source: None,
            })
        })?;

        let mut db: *mut ffi::sqlite3 = ptr::null_mut();

        // SAFETY: We pass valid pointers and check the return value
        let rc = unsafe {
            ffi::sqlite3_open_v2(c_path.as_ptr(), &mut db, config.open_flags(), ptr::null())
        };

        if rc != ffi::SQLITE_OK {
            let msg = if !db.is_null() {
                // SAFETY: db is valid, errmsg returns a valid C string
                unsafe {
                    let msg = errmsg(db);
                    ffi::sqlite3_close(db);
                    msg
                }
            } else {
                error_string(rc)
            };

            return Err(Error::Connection(ConnectionError {
                kind: ConnectionErrorKind::Connect,
                message: format!("Failed to open database: {}", msg),
                source: None,
            }));
        }

        if config.busy_timeout_ms > 0 {
            // SAFETY: db is valid
            let rc = unsafe { ffi::sqlite3_busy_timeout(db, config.busy_timeout_ms as c_int) };
            if rc != ffi::SQLITE_OK {
                // SAFETY: db is valid and not used after close
                unsafe {
                    ffi::sqlite3_close(db);
                }
                return Err(Error::Connection(ConnectionError {
                    kind: ConnectionErrorKind::Configure,
                    message: format!("Failed to set busy timeout: {}", error_string(rc)),
                    source: None,
                }));
            }
        }

        debug!(path = %config.path, busy_timeout_ms = config.busy_timeout_ms, "Opened SQLite database");

        Ok(Self {
            inner: Mutex::new(SqliteInner {
                db,
                in_transaction: false,
            }),
            path: config.path.clone(),
        })
    }

    /// Open an in-memory database.
    pub fn open_memory() -> Result<Self, Error> {
        Self::open(&SqliteConfig::memory())
    }

    /// Open a file-based database.
    pub fn open_file(path: impl Into<String>) -> Result<Self, Error> {
        Self::open(&SqliteConfig::file(path))
    }

    /// Get the database path.
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Is a transaction currently open on this connection?
    pub fn in_transaction(&self) -> bool {
        self.lock().in_transaction
    }

    /// Execute SQL directly without parameters (DDL, multi-statement scripts).
    pub fn execute_raw(&self, sql: &str) -> Result<(), Error> {
        let inner = self.lock();
        exec_raw(inner.db, sql)
    }

    /// Get the last insert rowid.
    pub fn last_insert_rowid(&self) -> i64 {
        let inner = self.lock();
        // SAFETY: db is valid
        unsafe { ffi::sqlite3_last_insert_rowid(inner.db) }
    }

    fn lock(&self) -> MutexGuard<'_, SqliteInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Prepare and execute a query, returning all rows.
    fn query_sync(&self, sql: &str, params: &[Value]) -> Result<Vec<Row>, Error> {
        trace!(sql = %sql, params = params.len(), "query");
        let inner = self.lock();
        let stmt = prepare_stmt(inner.db, sql)?;

        if let Err(e) = bind_params(inner.db, stmt, sql, params) {
            // SAFETY: stmt is valid
            unsafe { ffi::sqlite3_finalize(stmt) };
            return Err(e);
        }

        // SAFETY: stmt is valid
        let col_count = unsafe { ffi::sqlite3_column_count(stmt) };
        let mut col_names = Vec::with_capacity(col_count as usize);
        for i in 0..col_count {
            // SAFETY: stmt is valid, i < col_count
            let name =
                unsafe { types::column_name(stmt, i) }.unwrap_or_else(|| format!("col{}", i));
            col_names.push(name);
        }
        let columns = Arc::new(ColumnInfo::new(col_names));

        let mut rows = Vec::new();
        loop {
            // SAFETY: stmt is valid
            let rc = unsafe { ffi::sqlite3_step(stmt) };
            match rc {
                ffi::SQLITE_ROW => {
                    let mut values = Vec::with_capacity(col_count as usize);
                    for i in 0..col_count {
                        // SAFETY: stmt is valid, we just got SQLITE_ROW
                        values.push(unsafe { types::read_column(stmt, i) });
                    }
                    rows.push(Row::with_columns(Arc::clone(&columns), values));
                }
                ffi::SQLITE_DONE => break,
                _ => {
                    // SAFETY: stmt is valid
                    unsafe { ffi::sqlite3_finalize(stmt) };
                    return Err(last_error(inner.db, sql));
                }
            }
        }

        // SAFETY: stmt is valid
        unsafe { ffi::sqlite3_finalize(stmt) };
        Ok(rows)
    }

    /// Prepare and execute a statement, returning rows affected.
    fn execute_sync(&self, sql: &str, params: &[Value]) -> Result<u64, Error> {
        trace!(sql = %sql, params = params.len(), "execute");
        let inner = self.lock();
        let stmt = prepare_stmt(inner.db, sql)?;

        if let Err(e) = bind_params(inner.db, stmt, sql, params) {
            // SAFETY: stmt is valid
            unsafe { ffi::sqlite3_finalize(stmt) };
            return Err(e);
        }

        // SAFETY: stmt is valid
        let rc = unsafe { ffi::sqlite3_step(stmt) };

        let result = match rc {
            ffi::SQLITE_DONE | ffi::SQLITE_ROW => {
                // SAFETY: db is valid
                let changes = unsafe { ffi::sqlite3_changes(inner.db) };
                Ok(changes as u64)
            }
            _ => Err(last_error(inner.db, sql)),
        };

        // SAFETY: stmt is valid
        unsafe { ffi::sqlite3_finalize(stmt) };
        result
    }

    /// Begin a transaction.
    ///
    /// SQLite has no per-transaction isolation levels; the level picks the
    /// lock mode instead. Everything above ReadUncommitted takes the write
    /// lock up front (`BEGIN IMMEDIATE`), so two writers never discover a
    /// conflict halfway through.
    fn begin_sync(&self, isolation: IsolationLevel) -> Result<(), Error> {
        let mut inner = self.lock();
        if inner.in_transaction {
            return Err(Error::Transaction("Already in a transaction".to_string()));
        }

        let begin_sql = match isolation {
            IsolationLevel::Serializable => "BEGIN EXCLUSIVE",
            IsolationLevel::RepeatableRead | IsolationLevel::ReadCommitted => "BEGIN IMMEDIATE",
            IsolationLevel::ReadUncommitted => "BEGIN DEFERRED",
        };

        exec_raw(inner.db, begin_sql)?;
        inner.in_transaction = true;
        trace!(sql = begin_sql, "transaction started");
        Ok(())
    }

    fn finish_sync(&self, sql: &'static str) -> Result<(), Error> {
        let mut inner = self.lock();
        if !inner.in_transaction {
            return Err(Error::Transaction("Not in a transaction".to_string()));
        }

        let result = exec_raw(inner.db, sql);
        // SAFETY: db is valid
        let autocommit = unsafe { ffi::sqlite3_get_autocommit(inner.db) } != 0;
        if result.is_ok() || autocommit {
            inner.in_transaction = false;
        }
        trace!(sql, ok = result.is_ok(), "transaction finished");
        result
    }

    fn commit_sync(&self) -> Result<(), Error> {
        self.finish_sync("COMMIT")
    }

    fn rollback_sync(&self) -> Result<(), Error> {
        self.finish_sync("ROLLBACK")
    }
}

impl Drop for SqliteConnection {
    fn drop(&mut self) {
        let inner = self.lock();
        if !inner.db.is_null() {
            // SAFETY: db is valid and no statements outlive a call
            unsafe {
                sqlite3_close_v2(inner.db);
            }
        }
    }
}

/// A SQLite transaction.
///
/// Dropping the transaction without committing rolls it back.
pub struct SqliteTransaction<'conn> {
    conn: &'conn SqliteConnection,
    finished: bool,
}

impl<'conn> SqliteTransaction<'conn> {
    fn new(conn: &'conn SqliteConnection) -> Self {
        Self {
            conn,
            finished: false,
        }
    }
}

impl Drop for SqliteTransaction<'_> {
    fn drop(&mut self) {
        if !self.finished {
            // Auto-rollback on drop if not committed
            let _ = self.conn.rollback_sync();
        }
    }
}

impl Executor for SqliteConnection {
    fn dialect(&self) -> Dialect {
        Dialect::Sqlite
    }

    fn query(
        &self,
        _cx: &Cx,
        sql: &str,
        params: &[Value],
    ) -> impl Future<Output = Outcome<Vec<Row>, Error>> + Send {
        let result = self.query_sync(sql, params);
        async move { result.map_or_else(Outcome::Err, Outcome::Ok) }
    }

    fn query_one(
        &self,
        _cx: &Cx,
        sql: &str,
        params: &[Value],
    ) -> impl Future<Output = Outcome<Option<Row>, Error>> + Send {
        let result = self
            .query_sync(sql, params)
            .map(|rows| rows.into_iter().next());
        async move { result.map_or_else(Outcome::Err, Outcome::Ok) }
    }

    fn execute(
        &self,
        _cx: &Cx,
        sql: &str,
        params: &[Value],
    ) -> impl Future<Output = Outcome<u64, Error>> + Send {
        let result = self.execute_sync(sql, params);
        async move { result.map_or_else(Outcome::Err, Outcome::Ok) }
    }
}

impl Connection for SqliteConnection {
    type Tx<'conn>
        = SqliteTransaction<'conn>
    where
        Self: 'conn;

    fn begin(&self, cx: &Cx) -> impl Future<Output = Outcome<Self::Tx<'_>, Error>> + Send {
        self.begin_with(cx, IsolationLevel::default())
    }

    fn begin_with(
        &self,
        _cx: &Cx,
        isolation: IsolationLevel,
    ) -> impl Future<Output = Outcome<Self::Tx<'_>, Error>> + Send {
        let result = self
            .begin_sync(isolation)
            .map(|()| SqliteTransaction::new(self));
        async move { result.map_or_else(Outcome::Err, Outcome::Ok) }
    }
}

impl Executor for SqliteTransaction<'_> {
    fn dialect(&self) -> Dialect {
        Dialect::Sqlite
    }

    fn query(
        &self,
        _cx: &Cx,
        sql: &str,
        params: &[Value],
    ) -> impl Future<Output = Outcome<Vec<Row>, Error>> + Send {
        let result = self.conn.query_sync(sql, params);
        async move { result.map_or_else(Outcome::Err, Outcome::Ok) }
    }

    fn query_one(
        &self,
        _cx: &Cx,
        sql: &str,
        params: &[Value],
    ) -> impl Future<Output = Outcome<Option<Row>, Error>> + Send {
        let result = self
            .conn
            .query_sync(sql, params)
            .map(|rows| rows.into_iter().next());
        async move { result.map_or_else(Outcome::Err, Outcome::Ok) }
    }

    fn execute(
        &self,
        _cx: &Cx,
        sql: &str,
        params: &[Value],
    ) -> impl Future<Output = Outcome<u64, Error>> + Send {
        let result = self.conn.execute_sync(sql, params);
        async move { result.map_or_else(Outcome::Err, Outcome::Ok) }
    }
}

impl TransactionOps for SqliteTransaction<'_> {
    fn savepoint(&self, _cx: &Cx, name: &str) -> impl Future<Output = Outcome<(), Error>> + Send {
        let result = savepoint_sql("SAVEPOINT", name).and_then(|sql| self.conn.execute_raw(&sql));
        async move { result.map_or_else(Outcome::Err, Outcome::Ok) }
    }

    fn rollback_to(&self, _cx: &Cx, name: &str) -> impl Future<Output = Outcome<(), Error>> + Send {
        let result =
            savepoint_sql("ROLLBACK TO", name).and_then(|sql| self.conn.execute_raw(&sql));
        async move { result.map_or_else(Outcome::Err, Outcome::Ok) }
    }

    fn release(&self, _cx: &Cx, name: &str) -> impl Future<Output = Outcome<(), Error>> + Send {
        let result = savepoint_sql("RELEASE", name).and_then(|sql| self.conn.execute_raw(&sql));
        async move { result.map_or_else(Outcome::Err, Outcome::Ok) }
    }

    fn commit(mut self, _cx: &Cx) -> impl Future<Output = Outcome<(), Error>> + Send {
        self.finished = true;
        let result = self.conn.commit_sync();
        if result.is_err() && self.conn.in_transaction() {
            // COMMIT failed but the transaction is still open; undo it.
            let _ = self.conn.rollback_sync();
        }
        async move { result.map_or_else(Outcome::Err, Outcome::Ok) }
    }

    fn rollback(mut self, _cx: &Cx) -> impl Future<Output = Outcome<(), Error>> + Send {
        self.finished = true; // Prevent double rollback in drop
        let result = self.conn.rollback_sync();
        async move { result.map_or_else(Outcome::Err, Outcome::Ok) }
    }
}

// Helper functions

fn savepoint_sql(verb: &str, name: &str) -> Result<String, Error> {
    if !countercache_core::is_valid_identifier(name) {
        return Err(Error::Transaction(format!(
            "Invalid savepoint name: {:?}",
            name
        )));
    }
    Ok(format!("{} {}", verb, countercache_core::quote_ident(name)))
}

fn exec_raw(db: *mut ffi::sqlite3, sql: &str) -> Result<(), Error> {
    let c_sql = CString::new(sql).map_err(|_| {
        Error::query(QueryErrorKind::Syntax, Some(sql), "SQL contains null byte")
    })?;

    let mut errmsg_ptr: *mut std::ffi::c_char = ptr::null_mut();

    // SAFETY: All pointers are valid
    let rc = unsafe {
        ffi::sqlite3_exec(db, c_sql.as_ptr(), None, ptr::null_mut(), &mut errmsg_ptr)
    };

    if rc != ffi::SQLITE_OK {
        let msg = if !errmsg_ptr.is_null() {
            // SAFETY: errmsg_ptr is a valid C string allocated by SQLite
            let msg = unsafe { CStr::from_ptr(errmsg_ptr).to_string_lossy().into_owned() };
            unsafe { ffi::sqlite3_free(errmsg_ptr.cast()) };
            msg
        } else {
            error_string(rc)
        };

        return Err(Error::query(error_kind(rc, &msg), Some(sql), msg));
    }

    Ok(())
}

fn prepare_stmt(db: *mut ffi::sqlite3, sql: &str) -> Result<*mut ffi::sqlite3_stmt, Error> {
    let c_sql = CString::new(sql).map_err(|_| {
        Error::query(QueryErrorKind::Syntax, Some(sql), "SQL contains null byte")
    })?;

    let mut stmt: *mut ffi::sqlite3_stmt = ptr::null_mut();

    // SAFETY: All pointers are valid
    let rc = unsafe {
        ffi::sqlite3_prepare_v2(
            db,
            c_sql.as_ptr(),
            c_sql.as_bytes().len() as c_int,
            &mut stmt,
            ptr::null_mut(),
        )
    };

    if rc != ffi::SQLITE_OK {
        return Err(last_error(db, sql));
    }
    if stmt.is_null() {
        return Err(Error::query(
            QueryErrorKind::Syntax,
            Some(sql),
            "empty statement",
        ));
    }

    Ok(stmt)
}

/// Bind `params` to `stmt`.
///
/// The `n`th parameter binds to the `$n` placeholder by name, so a
/// placeholder may appear more than once in the statement. Statements
/// written with anonymous `?` placeholders bind positionally.
fn bind_params(
    db: *mut ffi::sqlite3,
    stmt: *mut ffi::sqlite3_stmt,
    sql: &str,
    params: &[Value],
) -> Result<(), Error> {
    // SAFETY: stmt is valid
    let declared = unsafe { ffi::sqlite3_bind_parameter_count(stmt) };

    for (i, param) in params.iter().enumerate() {
        let n = i + 1;
        let name = CString::new(format!("${}", n)).map_err(|_| {
            Error::query(QueryErrorKind::Database, Some(sql), "invalid parameter name")
        })?;
        // SAFETY: stmt is valid, name is a valid C string
        let mut index = unsafe { ffi::sqlite3_bind_parameter_index(stmt, name.as_ptr()) };
        if index == 0 {
            if (n as c_int) > declared {
                continue;
            }
            index = n as c_int;
        }

        // SAFETY: stmt is valid, index is a declared 1-based parameter
        let rc = unsafe { types::bind_value(stmt, index, param) };
        if rc != ffi::SQLITE_OK {
            // SAFETY: db is valid
            let msg = unsafe { errmsg(db) };
            return Err(Error::query(
                QueryErrorKind::Database,
                Some(sql),
                format!("Failed to bind parameter {}: {}", n, msg),
            ));
        }
    }

    Ok(())
}

fn last_error(db: *mut ffi::sqlite3, sql: &str) -> Error {
    // SAFETY: db is valid
    let (msg, code) = unsafe { (errmsg(db), ffi::sqlite3_errcode(db)) };
    Error::query(error_kind(code, &msg), Some(sql), msg)
}

/// # Safety
/// `db` must be a valid database handle.
unsafe fn errmsg(db: *mut ffi::sqlite3) -> String {
    // SAFETY: guaranteed by the caller; errmsg returns a valid C string
    unsafe {
        let ptr = ffi::sqlite3_errmsg(db);
        CStr::from_ptr(ptr).to_string_lossy().into_owned()
    }
}

fn error_string(code: c_int) -> String {
    // SAFETY: sqlite3_errstr returns a pointer to a static string
    unsafe {
        let ptr = ffi::sqlite3_errstr(code);
        if ptr.is_null() {
            format!("SQLite error {}", code)
        } else {
            CStr::from_ptr(ptr).to_string_lossy().into_owned()
        }
    }
}

fn error_kind(code: c_int, message: &str) -> QueryErrorKind {
    match code & 0xff {
        ffi::SQLITE_CONSTRAINT => QueryErrorKind::Constraint,
        ffi::SQLITE_BUSY | ffi::SQLITE_LOCKED => QueryErrorKind::Locked,
        ffi::SQLITE_NOTFOUND => QueryErrorKind::NotFound,
        ffi::SQLITE_INTERRUPT => QueryErrorKind::Timeout,
        ffi::SQLITE_ERROR if message.starts_with("no such") => QueryErrorKind::NotFound,
        ffi::SQLITE_ERROR if message.contains("syntax error") => QueryErrorKind::Syntax,
        _ => QueryErrorKind::Database,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use asupersync::runtime::RuntimeBuilder;

    fn posts() -> SqliteConnection {
        let conn = SqliteConnection::open_memory().unwrap();
        conn.execute_raw(
            "CREATE TABLE posts (id INTEGER PRIMARY KEY, title TEXT, comments_count INTEGER NOT NULL DEFAULT 0);
             INSERT INTO posts (id, title) VALUES (1, 'first'), (2, 'second');",
        )
        .unwrap();
        conn
    }

    fn count(conn: &SqliteConnection, id: i64) -> i64 {
        let rows = conn
            .query_sync(
                "SELECT comments_count FROM posts WHERE id = $1",
                &[Value::BigInt(id)],
            )
            .unwrap();
        rows[0].get_named("comments_count").unwrap()
    }

    #[test]
    fn test_open_memory() {
        let conn = SqliteConnection::open_memory().unwrap();
        assert_eq!(conn.path(), ":memory:");
        assert!(!conn.in_transaction());
    }

    #[test]
    fn test_query_returns_named_columns() {
        let conn = posts();
        let rows = conn
            .query_sync("SELECT id, title FROM posts ORDER BY id", &[])
            .unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[1].get_named::<String>("title").unwrap(), "second");
        assert_eq!(rows[0].get_by_name("id"), Some(&Value::BigInt(1)));
    }

    #[test]
    fn test_repeated_placeholder_binds_once() {
        let conn = posts();
        let changed = conn
            .execute_sync(
                "UPDATE posts SET comments_count = comments_count + $1 WHERE id = $2 AND $1 > 0",
                &[Value::BigInt(3), Value::BigInt(2)],
            )
            .unwrap();
        assert_eq!(changed, 1);
        assert_eq!(count(&conn, 2), 3);
    }

    #[test]
    fn test_positional_placeholders() {
        let conn = posts();
        let changed = conn
            .execute_sync(
                "UPDATE posts SET comments_count = ? WHERE id = ?",
                &[Value::BigInt(9), Value::BigInt(1)],
            )
            .unwrap();
        assert_eq!(changed, 1);
        assert_eq!(count(&conn, 1), 9);
    }

    #[test]
    fn test_update_missing_row_affects_nothing() {
        let conn = posts();
        let changed = conn
            .execute_sync(
                "UPDATE posts SET comments_count = comments_count + 1 WHERE id = $1",
                &[Value::BigInt(404)],
            )
            .unwrap();
        assert_eq!(changed, 0);
    }

    #[test]
    fn test_error_kinds() {
        let conn = posts();
        let err = conn.query_sync("SELECT * FROM nope", &[]).unwrap_err();
        assert!(matches!(err, Error::Query(ref q) if q.kind == QueryErrorKind::NotFound));

        let err = conn.query_sync("SELEC 1", &[]).unwrap_err();
        assert!(matches!(err, Error::Query(ref q) if q.kind == QueryErrorKind::Syntax));

        let err = conn
            .execute_sync("INSERT INTO posts (id) VALUES ($1)", &[Value::BigInt(1)])
            .unwrap_err();
        assert!(matches!(err, Error::Query(ref q) if q.kind == QueryErrorKind::Constraint));
    }

    #[test]
    fn test_nested_begin_rejected() {
        let conn = posts();
        conn.begin_sync(IsolationLevel::ReadCommitted).unwrap();
        assert!(matches!(
            conn.begin_sync(IsolationLevel::ReadCommitted),
            Err(Error::Transaction(_))
        ));
        conn.rollback_sync().unwrap();
        assert!(!conn.in_transaction());
    }

    #[test]
    fn test_transaction_commit_and_rollback() {
        let rt = RuntimeBuilder::current_thread().build().unwrap();
        rt.block_on(async {
            let cx = Cx::for_testing();
            let conn = posts();

            let Outcome::Ok(tx) = conn.begin(&cx).await else {
                panic!("begin failed");
            };
            let Outcome::Ok(_) = tx
                .execute(
                    &cx,
                    "UPDATE posts SET comments_count = 5 WHERE id = $1",
                    &[Value::BigInt(1)],
                )
                .await
            else {
                panic!("update failed");
            };
            assert!(matches!(tx.rollback(&cx).await, Outcome::Ok(())));
            assert_eq!(count(&conn, 1), 0);

            let Outcome::Ok(tx) = conn.begin(&cx).await else {
                panic!("begin failed");
            };
            let _ = tx
                .execute(
                    &cx,
                    "UPDATE posts SET comments_count = 7 WHERE id = $1",
                    &[Value::BigInt(1)],
                )
                .await;
            assert!(matches!(tx.commit(&cx).await, Outcome::Ok(())));
            assert_eq!(count(&conn, 1), 7);
        });
    }

    #[test]
    fn test_dropped_transaction_rolls_back() {
        let rt = RuntimeBuilder::current_thread().build().unwrap();
        rt.block_on(async {
            let cx = Cx::for_testing();
            let conn = posts();
            {
                let Outcome::Ok(tx) = conn.begin(&cx).await else {
                    panic!("begin failed");
                };
                let _ = tx
                    .execute(&cx, "UPDATE posts SET comments_count = 1", &[])
                    .await;
            }
            assert!(!conn.in_transaction());
            assert_eq!(count(&conn, 1), 0);
        });
    }

    #[test]
    fn test_savepoints() {
        let rt = RuntimeBuilder::current_thread().build().unwrap();
        rt.block_on(async {
            let cx = Cx::for_testing();
            let conn = posts();
            let Outcome::Ok(tx) = conn.begin(&cx).await else {
                panic!("begin failed");
            };
            let _ = tx
                .execute(&cx, "UPDATE posts SET comments_count = 1 WHERE id = 1", &[])
                .await;
            assert!(matches!(tx.savepoint(&cx, "sp1").await, Outcome::Ok(())));
            let _ = tx
                .execute(&cx, "UPDATE posts SET comments_count = 2 WHERE id = 1", &[])
                .await;
            assert!(matches!(tx.rollback_to(&cx, "sp1").await, Outcome::Ok(())));
            assert!(matches!(tx.release(&cx, "sp1").await, Outcome::Ok(())));
            assert!(matches!(
                tx.savepoint(&cx, "bad name").await,
                Outcome::Err(Error::Transaction(_))
            ));
            assert!(matches!(tx.commit(&cx).await, Outcome::Ok(())));
            assert_eq!(count(&conn, 1), 1);
        });
    }

    #[test]
    fn test_busy_writer_reports_locked() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("busy.db").to_string_lossy().into_owned();

        let first = SqliteConnection::open(&SqliteConfig::file(&path).busy_timeout(10)).unwrap();
        first
            .execute_raw("CREATE TABLE t (id INTEGER PRIMARY KEY)")
            .unwrap();
        let second = SqliteConnection::open(&SqliteConfig::file(&path).busy_timeout(10)).unwrap();

        first.begin_sync(IsolationLevel::ReadCommitted).unwrap();
        let err = second
            .begin_sync(IsolationLevel::ReadCommitted)
            .unwrap_err();
        assert!(err.is_lock_failure());
        assert!(!second.in_transaction());
        first.rollback_sync().unwrap();
    }
}
