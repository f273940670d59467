//! Atomic counter updates.
//!
//! Every adjustment is one statement doing the arithmetic in the database:
//!
//! ```sql
//! UPDATE "posts" SET "comments_count" = COALESCE("comments_count", 0) + $1 WHERE "id" = $2
//! ```
//!
//! There is no prior read, so concurrent adjustments of the same row are
//! serialized by the database's row lock and none is lost.

use crate::batch::Batch;
use crate::declaration::Declaration;
use crate::delta::Delta;
use crate::record::Snapshot;
use crate::resolver::ResolvedTarget;
use countercache_core::{Cx, Dialect, Error, Executor, Outcome, RowId};

/// Direction of an event's contribution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Sign {
    Increment,
    Decrement,
}

impl Sign {
    pub fn apply(self, magnitude: Delta) -> Delta {
        match self {
            Sign::Increment => magnitude,
            Sign::Decrement => -magnitude,
        }
    }
}

/// What happened to one contribution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Applied {
    /// A statement updated the target row.
    Updated,
    /// Merged into the active batch.
    Deferred,
    /// The statement matched no row; the target is gone.
    TargetMissing,
    /// Nothing to do (condition false, zero delta).
    Skipped,
}

/// One atomic counter statement.
#[derive(Debug, Clone, PartialEq)]
pub struct Adjustment {
    pub table: String,
    pub primary_key: String,
    pub id: RowId,
    pub column: String,
    pub delta: Delta,
    /// Timestamp columns set to the current time alongside the counter.
    pub touch: Vec<String>,
}

impl Adjustment {
    /// The statement and its parameters (`delta`, then `id`).
    pub fn to_sql(&self, dialect: Dialect) -> (String, [countercache_core::Value; 2]) {
        let column = dialect.quote(&self.column);
        let mut sets = format!(
            "{} = COALESCE({}, 0) + {}",
            column,
            column,
            dialect.placeholder(1)
        );
        for touch in &self.touch {
            sets.push_str(&format!(", {} = {}", dialect.quote(touch), dialect.now()));
        }
        let sql = format!(
            "UPDATE {} SET {} WHERE {} = {}",
            dialect.quote(&self.table),
            sets,
            dialect.quote(&self.primary_key),
            dialect.placeholder(2)
        );
        (sql, [self.delta.to_value(), self.id.to_value()])
    }
}

/// Issue one adjustment. A missing target is reported, not raised.
#[tracing::instrument(level = "debug", skip(cx, exec, adjustment), fields(table = %adjustment.table, id = %adjustment.id, column = %adjustment.column, delta = %adjustment.delta))]
pub async fn adjust<E: Executor>(
    cx: &Cx,
    exec: &E,
    adjustment: &Adjustment,
) -> Outcome<Applied, Error> {
    let (sql, params) = adjustment.to_sql(exec.dialect());
    tracing::trace!(sql = %sql, "Executing counter UPDATE");
    match exec.execute(cx, &sql, &params).await {
        Outcome::Ok(0) => {
            tracing::warn!(
                table = %adjustment.table,
                id = %adjustment.id,
                column = %adjustment.column,
                "Counter target row not found; update ignored"
            );
            Outcome::Ok(Applied::TargetMissing)
        }
        Outcome::Ok(_) => Outcome::Ok(Applied::Updated),
        Outcome::Err(e) => Outcome::Err(e),
        Outcome::Cancelled(r) => Outcome::Cancelled(r),
        Outcome::Panicked(p) => Outcome::Panicked(p),
    }
}

/// Apply a signed delta to `column` on the terminal row of `target`,
/// directly or through the active batch.
pub async fn apply_delta<E: Executor>(
    cx: &Cx,
    exec: &E,
    batch: Option<&mut Batch>,
    target: &ResolvedTarget,
    declaration: &Declaration,
    column: &str,
    delta: Delta,
) -> Outcome<Applied, Error> {
    if delta.is_zero() {
        return Outcome::Ok(Applied::Skipped);
    }
    let terminal = target.terminal();
    let touch: Vec<String> = declaration
        .touch_column()
        .map(str::to_string)
        .into_iter()
        .collect();

    if let Some(batch) = batch {
        batch.merge(
            &terminal.table,
            &terminal.primary_key,
            &terminal.id,
            column,
            delta,
            &touch,
        );
        return Outcome::Ok(Applied::Deferred);
    }

    let adjustment = Adjustment {
        table: terminal.table.clone(),
        primary_key: terminal.primary_key.clone(),
        id: terminal.id.clone(),
        column: column.to_string(),
        delta,
        touch,
    };
    adjust(cx, exec, &adjustment).await
}

/// Apply `record`'s contribution to `target` with `sign`.
///
/// The declaration's condition and column are evaluated against `record`;
/// the magnitude is `record`'s delta column, or the declaration's step.
pub async fn apply<E: Executor>(
    cx: &Cx,
    exec: &E,
    batch: Option<&mut Batch>,
    target: &ResolvedTarget,
    declaration: &Declaration,
    sign: Sign,
    record: &Snapshot,
) -> Outcome<Applied, crate::Error> {
    let Some(column) = declaration.column_for(record) else {
        return Outcome::Ok(Applied::Skipped);
    };
    let magnitude = match declaration.magnitude(record) {
        Ok(m) => m,
        Err(e) => return Outcome::Err(crate::Error::Type(e)),
    };
    let applied = try_outcome!(
        apply_delta(
            cx,
            exec,
            batch,
            target,
            declaration,
            &column,
            sign.apply(magnitude)
        )
        .await
    );
    Outcome::Ok(applied)
}
