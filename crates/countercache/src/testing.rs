//! Recording executor and connection for unit tests.

#![allow(clippy::manual_async_fn)] // Mock trait impls must match trait signatures

use asupersync::runtime::RuntimeBuilder;
use countercache_core::{
    Connection, Cx, Dialect, Error, Executor, IsolationLevel, Outcome, QueryErrorKind, Row,
    TransactionOps, Value,
};
use std::future::Future;
use std::sync::Mutex;

type Responder = Box<dyn Fn(&str, &[Value]) -> Vec<Row> + Send + Sync>;

#[derive(Debug, Default)]
struct MockState {
    executed: Vec<(String, Vec<Value>)>,
    queried: Vec<(String, Vec<Value>)>,
}

/// Answers queries through a responder closure and records every
/// statement. `execute` reports `rows_affected` rows.
pub struct MockExecutor {
    state: Mutex<MockState>,
    dialect: Dialect,
    rows_affected: u64,
    responder: Responder,
    fail_on: Option<(String, QueryErrorKind)>,
}

impl MockExecutor {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(MockState::default()),
            dialect: Dialect::Postgres,
            rows_affected: 1,
            responder: Box::new(|_, _| Vec::new()),
            fail_on: None,
        }
    }

    pub fn dialect(mut self, dialect: Dialect) -> Self {
        self.dialect = dialect;
        self
    }

    pub fn rows_affected(mut self, rows: u64) -> Self {
        self.rows_affected = rows;
        self
    }

    pub fn respond<F>(mut self, f: F) -> Self
    where
        F: Fn(&str, &[Value]) -> Vec<Row> + Send + Sync + 'static,
    {
        self.responder = Box::new(f);
        self
    }

    /// Fail any statement containing `needle`.
    pub fn fail_on(mut self, needle: &str, kind: QueryErrorKind) -> Self {
        self.fail_on = Some((needle.to_string(), kind));
        self
    }

    pub fn executed(&self) -> Vec<(String, Vec<Value>)> {
        self.state.lock().expect("lock poisoned").executed.clone()
    }

    pub fn queried(&self) -> Vec<(String, Vec<Value>)> {
        self.state.lock().expect("lock poisoned").queried.clone()
    }

    fn check(&self, sql: &str) -> Result<(), Error> {
        match &self.fail_on {
            Some((needle, kind)) if sql.contains(needle.as_str()) => {
                Err(Error::query(*kind, Some(sql), "mock failure"))
            }
            _ => Ok(()),
        }
    }

    fn run_query(&self, sql: &str, params: &[Value]) -> Result<Vec<Row>, Error> {
        self.check(sql)?;
        self.state
            .lock()
            .expect("lock poisoned")
            .queried
            .push((sql.to_string(), params.to_vec()));
        Ok((self.responder)(sql, params))
    }
}

impl Executor for MockExecutor {
    fn dialect(&self) -> Dialect {
        self.dialect
    }

    fn query(
        &self,
        _cx: &Cx,
        sql: &str,
        params: &[Value],
    ) -> impl Future<Output = Outcome<Vec<Row>, Error>> + Send {
        let result = self.run_query(sql, params);
        async move { result.map_or_else(Outcome::Err, Outcome::Ok) }
    }

    fn query_one(
        &self,
        _cx: &Cx,
        sql: &str,
        params: &[Value],
    ) -> impl Future<Output = Outcome<Option<Row>, Error>> + Send {
        let result = self
            .run_query(sql, params)
            .map(|rows| rows.into_iter().next());
        async move { result.map_or_else(Outcome::Err, Outcome::Ok) }
    }

    fn execute(
        &self,
        _cx: &Cx,
        sql: &str,
        params: &[Value],
    ) -> impl Future<Output = Outcome<u64, Error>> + Send {
        let result = self.check(sql).map(|()| {
            self.state
                .lock()
                .expect("lock poisoned")
                .executed
                .push((sql.to_string(), params.to_vec()));
            self.rows_affected
        });
        async move { result.map_or_else(Outcome::Err, Outcome::Ok) }
    }
}

/// A connection over a [`MockExecutor`]. Transactions run their
/// statements through the same executor; `rollback` fails when
/// `fail_rollback` is set.
pub struct MockConnection {
    exec: MockExecutor,
    fail_rollback: bool,
    rollbacks: Mutex<usize>,
}

impl MockConnection {
    pub fn new(exec: MockExecutor) -> Self {
        Self {
            exec,
            fail_rollback: false,
            rollbacks: Mutex::new(0),
        }
    }

    pub fn fail_rollback(mut self) -> Self {
        self.fail_rollback = true;
        self
    }

    pub fn rollbacks(&self) -> usize {
        *self.rollbacks.lock().expect("lock poisoned")
    }
}

pub struct MockTransaction<'conn> {
    conn: &'conn MockConnection,
}

impl Executor for MockConnection {
    fn dialect(&self) -> Dialect {
        Executor::dialect(&self.exec)
    }

    fn query(
        &self,
        cx: &Cx,
        sql: &str,
        params: &[Value],
    ) -> impl Future<Output = Outcome<Vec<Row>, Error>> + Send {
        self.exec.query(cx, sql, params)
    }

    fn query_one(
        &self,
        cx: &Cx,
        sql: &str,
        params: &[Value],
    ) -> impl Future<Output = Outcome<Option<Row>, Error>> + Send {
        self.exec.query_one(cx, sql, params)
    }

    fn execute(
        &self,
        cx: &Cx,
        sql: &str,
        params: &[Value],
    ) -> impl Future<Output = Outcome<u64, Error>> + Send {
        self.exec.execute(cx, sql, params)
    }
}

impl Connection for MockConnection {
    type Tx<'conn> = MockTransaction<'conn>;

    fn begin(&self, cx: &Cx) -> impl Future<Output = Outcome<Self::Tx<'_>, Error>> + Send {
        self.begin_with(cx, IsolationLevel::default())
    }

    fn begin_with(
        &self,
        _cx: &Cx,
        _isolation: IsolationLevel,
    ) -> impl Future<Output = Outcome<Self::Tx<'_>, Error>> + Send {
        async move { Outcome::Ok(MockTransaction { conn: self }) }
    }
}

impl Executor for MockTransaction<'_> {
    fn dialect(&self) -> Dialect {
        self.conn.dialect()
    }

    fn query(
        &self,
        cx: &Cx,
        sql: &str,
        params: &[Value],
    ) -> impl Future<Output = Outcome<Vec<Row>, Error>> + Send {
        self.conn.exec.query(cx, sql, params)
    }

    fn query_one(
        &self,
        cx: &Cx,
        sql: &str,
        params: &[Value],
    ) -> impl Future<Output = Outcome<Option<Row>, Error>> + Send {
        self.conn.exec.query_one(cx, sql, params)
    }

    fn execute(
        &self,
        cx: &Cx,
        sql: &str,
        params: &[Value],
    ) -> impl Future<Output = Outcome<u64, Error>> + Send {
        self.conn.exec.execute(cx, sql, params)
    }
}

impl TransactionOps for MockTransaction<'_> {
    fn savepoint(&self, _cx: &Cx, _name: &str) -> impl Future<Output = Outcome<(), Error>> + Send {
        async { Outcome::Ok(()) }
    }

    fn rollback_to(
        &self,
        _cx: &Cx,
        _name: &str,
    ) -> impl Future<Output = Outcome<(), Error>> + Send {
        async { Outcome::Ok(()) }
    }

    fn release(&self, _cx: &Cx, _name: &str) -> impl Future<Output = Outcome<(), Error>> + Send {
        async { Outcome::Ok(()) }
    }

    fn commit(self, _cx: &Cx) -> impl Future<Output = Outcome<(), Error>> + Send {
        async { Outcome::Ok(()) }
    }

    fn rollback(self, _cx: &Cx) -> impl Future<Output = Outcome<(), Error>> + Send {
        *self.conn.rollbacks.lock().expect("lock poisoned") += 1;
        let fail = self.conn.fail_rollback;
        async move {
            if fail {
                Outcome::Err(Error::Transaction("connection lost".to_string()))
            } else {
                Outcome::Ok(())
            }
        }
    }
}

/// Drive a future to completion on a fresh current-thread runtime.
pub fn run<F: Future>(future: F) -> F::Output {
    let rt = RuntimeBuilder::current_thread()
        .build()
        .expect("create asupersync runtime");
    rt.block_on(future)
}

pub fn unwrap_outcome<T: std::fmt::Debug, E: std::fmt::Debug>(outcome: Outcome<T, E>) -> T {
    match outcome {
        Outcome::Ok(v) => v,
        other => std::panic::panic_any(format!("unexpected outcome: {other:?}")),
    }
}

pub fn row(columns: &[&str], values: Vec<Value>) -> Row {
    Row::new(columns.iter().map(|c| (*c).to_string()).collect(), values)
}
