//! Counter recalculation.
//!
//! Recounting derives every counter from the dependent rows and overwrites
//! the stored value. Targets are processed in pages ordered by primary key.
//! Each page is one transaction:
//!
//! 1. lock the page's target rows (`SELECT ... ORDER BY pk LIMIT n FOR UPDATE`)
//! 2. aggregate the dependents of the locked key range, walking the
//!    declaration's path in reverse with joins
//! 3. write corrected values with absolute `SET column = value` statements
//! 4. commit
//!
//! Because the target rows stay locked from (1) to (4), an incremental
//! update of the same row waits for the page to commit instead of being
//! overwritten by a stale total.

use crate::declaration::{ConcreteHop, CounterColumn, Declaration};
use crate::delta::Delta;
use crate::error::{DeclarationError, Error};
use countercache_core::{
    Connection, Cx, Dialect, Executor, Outcome, Row, RowId, TransactionOps, Value,
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Options for a recalculation run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RecountOptions {
    /// Target rows per page (and per transaction).
    pub batch_size: usize,
    /// Only targets with a primary key at or above this one.
    pub start: Option<RowId>,
    /// Only targets with a primary key at or below this one.
    pub finish: Option<RowId>,
    /// Also set the declaration's touch column (or `updated_at`) on
    /// corrected rows.
    pub touch: bool,
    /// Compute fixes without writing them.
    pub dry_run: bool,
}

impl Default for RecountOptions {
    fn default() -> Self {
        Self {
            batch_size: 1000,
            start: None,
            finish: None,
            touch: false,
            dry_run: false,
        }
    }
}

impl RecountOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn batch_size(mut self, size: usize) -> Self {
        self.batch_size = size;
        self
    }

    pub fn start(mut self, id: impl Into<RowId>) -> Self {
        self.start = Some(id.into());
        self
    }

    pub fn finish(mut self, id: impl Into<RowId>) -> Self {
        self.finish = Some(id.into());
        self
    }

    pub fn touch(mut self, touch: bool) -> Self {
        self.touch = touch;
        self
    }

    pub fn dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }
}

/// Which targets to recount.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecountTarget {
    All,
    Row(RowId),
}

/// One corrected counter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Fix {
    pub table: String,
    pub id: RowId,
    pub column: String,
    pub wrong: Value,
    pub right: Value,
}

/// A counter column with the dependent rows it counts.
#[derive(Debug, Clone, PartialEq)]
struct ColumnPlan {
    column: String,
    filter: Option<String>,
}

fn column_plans(decl: &Declaration) -> Result<Vec<ColumnPlan>, DeclarationError> {
    let invalid = |message: &str| DeclarationError::new(decl.record_type(), message);
    if decl.has_condition() && decl.condition_sql_text().is_none() {
        return Err(invalid(
            "a condition without condition_sql cannot be recounted",
        ));
    }
    let condition = decl.condition_sql_text();

    match decl.counter_column() {
        CounterColumn::Fixed(column) => Ok(vec![ColumnPlan {
            column: column.clone(),
            filter: condition.map(str::to_string),
        }]),
        CounterColumn::Dynamic(_) => {
            if decl.column_filters().is_empty() {
                return Err(invalid(
                    "a dynamic counter column needs column filters to be recounted",
                ));
            }
            Ok(decl
                .column_filters()
                .iter()
                .map(|(column, filter)| ColumnPlan {
                    column: column.clone(),
                    filter: Some(match condition {
                        Some(cond) => format!("({}) AND ({})", cond, filter),
                        None => filter.clone(),
                    }),
                })
                .collect())
        }
    }
}

/// Concrete paths ending at the same table.
#[derive(Debug, Clone, PartialEq)]
struct TargetGroup {
    table: String,
    primary_key: String,
    paths: Vec<Vec<ConcreteHop>>,
}

fn target_groups(decl: &Declaration) -> Vec<TargetGroup> {
    let mut groups: Vec<TargetGroup> = Vec::new();
    for path in decl.expansions() {
        let Some(last) = path.last() else { continue };
        match groups
            .iter_mut()
            .find(|g| g.table == last.table && g.primary_key == last.primary_key)
        {
            Some(group) => group.paths.push(path),
            None => groups.push(TargetGroup {
                table: last.table.clone(),
                primary_key: last.primary_key.clone(),
                paths: vec![path],
            }),
        }
    }
    groups
}

/// Bound parameters in textual order.
struct Params {
    dialect: Dialect,
    values: Vec<Value>,
}

impl Params {
    fn new(dialect: Dialect) -> Self {
        Self {
            dialect,
            values: Vec::new(),
        }
    }

    fn push(&mut self, value: Value) -> String {
        self.values.push(value);
        self.dialect.placeholder(self.values.len())
    }
}

fn lock_page_sql(
    dialect: Dialect,
    group: &TargetGroup,
    columns: &[&str],
    target: &RecountTarget,
    after: Option<&RowId>,
    opts: &RecountOptions,
    limit: usize,
) -> (String, Vec<Value>) {
    let pk = dialect.quote(&group.primary_key);
    let mut params = Params::new(dialect);
    let mut conditions = Vec::new();

    match target {
        RecountTarget::Row(id) => {
            conditions.push(format!("{} = {}", pk, params.push(id.to_value())));
        }
        RecountTarget::All => {
            match (after, &opts.start) {
                (Some(after), _) => {
                    conditions.push(format!("{} > {}", pk, params.push(after.to_value())));
                }
                (None, Some(start)) => {
                    conditions.push(format!("{} >= {}", pk, params.push(start.to_value())));
                }
                (None, None) => {}
            }
            if let Some(finish) = &opts.finish {
                conditions.push(format!("{} <= {}", pk, params.push(finish.to_value())));
            }
        }
    }

    let mut sql = format!("SELECT {}", pk);
    for column in columns {
        sql.push_str(", ");
        sql.push_str(&dialect.quote(column));
    }
    sql.push_str(&format!(" FROM {}", dialect.quote(&group.table)));
    if !conditions.is_empty() {
        sql.push_str(" WHERE ");
        sql.push_str(&conditions.join(" AND "));
    }
    sql.push_str(&format!(" ORDER BY {}", pk));
    if matches!(target, RecountTarget::All) {
        sql.push_str(&format!(" LIMIT {}", limit));
    }
    if let Some(lock) = dialect.lock_clause() {
        sql.push(' ');
        sql.push_str(lock);
    }
    (sql, params.values)
}

/// Aggregate of the dependents along `path` whose terminal key lies in
/// `[lo, hi]`, grouped by that key.
fn aggregate_sql(
    dialect: Dialect,
    decl: &Declaration,
    path: &[ConcreteHop],
    plan: &ColumnPlan,
    lo: &RowId,
    hi: &RowId,
) -> (String, Vec<Value>) {
    let q = |name: &str| dialect.quote(name);
    let mut params = Params::new(dialect);

    let source = match &plan.filter {
        Some(filter) => format!(
            "(SELECT * FROM {} WHERE {})",
            q(decl.record_type()),
            filter
        ),
        None => q(decl.record_type()),
    };
    let aggregate = match decl.delta_column_name() {
        Some(column) => format!("SUM(d.{})", q(column)),
        None => "COUNT(*)".to_string(),
    };

    // Alias of the row each hop is read from: `d`, then `j0`, `j1`, ...
    let alias = |i: usize| {
        if i == 0 {
            "d".to_string()
        } else {
            format!("j{}", i - 1)
        }
    };

    let mut joins = String::new();
    for (i, hop) in path.iter().enumerate().take(path.len().saturating_sub(1)) {
        let from = alias(i);
        let to = alias(i + 1);
        joins.push_str(&format!(
            " JOIN {} AS {} ON {}.{} = {}.{}",
            q(&hop.table),
            to,
            to,
            q(&hop.primary_key),
            from,
            q(&hop.foreign_key)
        ));
        if let Some((type_column, type_name)) = &hop.type_filter {
            joins.push_str(&format!(
                " AND {}.{} = {}",
                from,
                q(type_column),
                params.push(Value::Text(type_name.clone()))
            ));
        }
    }

    let last_index = path.len().saturating_sub(1);
    let last_source = alias(last_index);
    let mut conditions = Vec::new();
    let key = match path.last() {
        Some(last) => {
            if let Some((type_column, type_name)) = &last.type_filter {
                conditions.push(format!(
                    "{}.{} = {}",
                    last_source,
                    q(type_column),
                    params.push(Value::Text(type_name.clone()))
                ));
            }
            format!("{}.{}", last_source, q(&last.foreign_key))
        }
        None => "NULL".to_string(),
    };
    conditions.push(format!("{} >= {}", key, params.push(lo.to_value())));
    conditions.push(format!("{} <= {}", key, params.push(hi.to_value())));

    let sql = format!(
        "SELECT {} AS target_id, {} AS total FROM {} AS d{} WHERE {} GROUP BY {}",
        key,
        aggregate,
        source,
        joins,
        conditions.join(" AND "),
        key
    );
    (sql, params.values)
}

fn correction_sql(
    dialect: Dialect,
    group: &TargetGroup,
    id: &RowId,
    fixes: &[Fix],
    touch: Option<&str>,
) -> (String, Vec<Value>) {
    let mut params = Params::new(dialect);
    let mut sets: Vec<String> = fixes
        .iter()
        .map(|fix| {
            format!(
                "{} = {}",
                dialect.quote(&fix.column),
                params.push(fix.right.clone())
            )
        })
        .collect();
    if let Some(touch) = touch {
        sets.push(format!("{} = {}", dialect.quote(touch), dialect.now()));
    }
    let sql = format!(
        "UPDATE {} SET {} WHERE {} = {}",
        dialect.quote(&group.table),
        sets.join(", "),
        dialect.quote(&group.primary_key),
        params.push(id.to_value())
    );
    (sql, params.values)
}

fn scale(total: Delta, step: i64) -> Delta {
    match total {
        Delta::Int(n) => n
            .checked_mul(step)
            .map_or_else(|| Delta::Float(n as f64 * step as f64), Delta::Int),
        Delta::Float(f) => Delta::Float(f * step as f64),
    }
}

fn needs_fix(current: &Value, right: Delta, column: &str) -> bool {
    match current {
        Value::Null => true,
        value => Delta::from_value(value, column).map_or(true, |stored| stored != right),
    }
}

#[derive(Debug, Default)]
struct Page {
    rows: usize,
    last: Option<RowId>,
    fixes: Vec<Fix>,
}

#[allow(clippy::too_many_arguments)]
async fn page_in_tx<E: Executor>(
    cx: &Cx,
    exec: &E,
    decl: &Declaration,
    group: &TargetGroup,
    plans: &[ColumnPlan],
    target: &RecountTarget,
    after: Option<&RowId>,
    opts: &RecountOptions,
) -> Outcome<Page, Error> {
    let dialect = exec.dialect();
    let columns: Vec<&str> = plans.iter().map(|p| p.column.as_str()).collect();
    let (sql, params) = lock_page_sql(
        dialect,
        group,
        &columns,
        target,
        after,
        opts,
        opts.batch_size.max(1),
    );
    tracing::trace!(sql = %sql, "Locking recount page");
    let rows: Vec<Row> = try_outcome!(exec.query(cx, &sql, &params).await);

    let ids: Vec<Option<RowId>> = rows
        .iter()
        .map(|r| r.get(0).and_then(RowId::from_value))
        .collect();
    let mut page = Page {
        rows: rows.len(),
        last: ids.iter().rev().flatten().next().cloned(),
        fixes: Vec::new(),
    };
    let (Some(lo), Some(hi)) = (ids.iter().flatten().next().cloned(), page.last.clone()) else {
        return Outcome::Ok(page);
    };

    let mut totals: Vec<HashMap<RowId, Delta>> = vec![HashMap::new(); plans.len()];
    for (plan, plan_totals) in plans.iter().zip(totals.iter_mut()) {
        for path in &group.paths {
            let (sql, params) = aggregate_sql(dialect, decl, path, plan, &lo, &hi);
            tracing::trace!(sql = %sql, column = %plan.column, "Aggregating dependents");
            let aggregates: Vec<Row> = try_outcome!(exec.query(cx, &sql, &params).await);
            for aggregate in aggregates {
                let Some(id) = aggregate.get(0).and_then(RowId::from_value) else {
                    continue;
                };
                let value = aggregate.get(1).unwrap_or(&Value::Null);
                let total = match Delta::from_value(value, &plan.column) {
                    Ok(total) => total,
                    Err(e) => return Outcome::Err(Error::Type(e)),
                };
                let total = if decl.delta_column_name().is_some() {
                    total
                } else {
                    scale(total, decl.step_size())
                };
                *plan_totals.entry(id).or_default() += total;
            }
        }
    }

    let touch = opts
        .touch
        .then(|| decl.touch_column().unwrap_or("updated_at"));

    for (row, id) in rows.iter().zip(ids) {
        let Some(id) = id else { continue };
        let mut row_fixes = Vec::new();
        for (i, (plan, plan_totals)) in plans.iter().zip(&totals).enumerate() {
            let current = row.get(i + 1).cloned().unwrap_or(Value::Null);
            let right = match plan_totals.get(&id) {
                Some(total) => *total,
                None if decl.keeps_unmatched() => continue,
                None => Delta::ZERO,
            };
            if needs_fix(&current, right, &plan.column) {
                row_fixes.push(Fix {
                    table: group.table.clone(),
                    id: id.clone(),
                    column: plan.column.clone(),
                    wrong: current,
                    right: right.to_value(),
                });
            }
        }
        if row_fixes.is_empty() {
            continue;
        }
        if !opts.dry_run {
            let (sql, params) = correction_sql(dialect, group, &id, &row_fixes, touch);
            tracing::trace!(sql = %sql, "Writing corrected counters");
            try_outcome!(exec.execute(cx, &sql, &params).await);
        }
        page.fixes.extend(row_fixes);
    }

    Outcome::Ok(page)
}

fn conflict(e: Error, table: &str, target: &RecountTarget) -> Error {
    match e {
        Error::Persistence(source) if source.is_lock_failure() => Error::RecalculationConflict {
            table: table.to_string(),
            id: match target {
                RecountTarget::Row(id) => Some(id.clone()),
                RecountTarget::All => None,
            },
            source,
        },
        other => other,
    }
}

/// Abandon a page. The page's own failure is what gets reported, so a
/// failed rollback is only logged.
async fn roll_back<T: TransactionOps>(cx: &Cx, tx: T, table: &str) {
    if let Outcome::Err(e) = tx.rollback(cx).await {
        tracing::warn!(table, error = %e, "Recount rollback failed");
    }
}

#[allow(clippy::too_many_arguments)]
async fn recount_page<C: Connection>(
    cx: &Cx,
    conn: &C,
    decl: &Declaration,
    group: &TargetGroup,
    plans: &[ColumnPlan],
    target: &RecountTarget,
    after: Option<&RowId>,
    opts: &RecountOptions,
) -> Outcome<Page, Error> {
    let tx = match conn.begin(cx).await {
        Outcome::Ok(tx) => tx,
        Outcome::Err(e) => return Outcome::Err(conflict(e.into(), &group.table, target)),
        Outcome::Cancelled(r) => return Outcome::Cancelled(r),
        Outcome::Panicked(p) => return Outcome::Panicked(p),
    };

    match page_in_tx(cx, &tx, decl, group, plans, target, after, opts).await {
        Outcome::Ok(page) => match tx.commit(cx).await {
            Outcome::Ok(()) => Outcome::Ok(page),
            Outcome::Err(e) => Outcome::Err(conflict(e.into(), &group.table, target)),
            Outcome::Cancelled(r) => Outcome::Cancelled(r),
            Outcome::Panicked(p) => Outcome::Panicked(p),
        },
        Outcome::Err(e) => {
            roll_back(cx, tx, &group.table).await;
            Outcome::Err(conflict(e, &group.table, target))
        }
        Outcome::Cancelled(r) => {
            roll_back(cx, tx, &group.table).await;
            Outcome::Cancelled(r)
        }
        Outcome::Panicked(p) => Outcome::Panicked(p),
    }
}

/// Recount `decl` for one target row or for every target.
///
/// Returns the counters that were wrong, with their stored and true
/// values. With `dry_run` nothing is written.
#[tracing::instrument(level = "info", skip(cx, conn, decl), fields(record_type = decl.record_type()))]
pub async fn recalculate<C: Connection>(
    cx: &Cx,
    conn: &C,
    decl: &Declaration,
    target: &RecountTarget,
    opts: &RecountOptions,
) -> Outcome<Vec<Fix>, Error> {
    let plans = match column_plans(decl) {
        Ok(plans) => plans,
        Err(e) => return Outcome::Err(Error::InvalidDeclaration(e)),
    };
    let start = std::time::Instant::now();
    let page_size = opts.batch_size.max(1);
    let mut fixes = Vec::new();
    let mut pages = 0_usize;

    for group in target_groups(decl) {
        let mut after: Option<RowId> = None;
        loop {
            let page = try_outcome!(
                recount_page(cx, conn, decl, &group, &plans, target, after.as_ref(), opts).await
            );
            pages += 1;
            tracing::debug!(
                table = %group.table,
                rows = page.rows,
                fixes = page.fixes.len(),
                "Recount page committed"
            );
            fixes.extend(page.fixes);
            match (target, page.last) {
                (RecountTarget::All, Some(last)) if page.rows >= page_size => after = Some(last),
                _ => break,
            }
        }
    }

    tracing::info!(
        elapsed_ms = start.elapsed().as_millis() as u64,
        pages = pages,
        fixes = fixes.len(),
        dry_run = opts.dry_run,
        "Recount complete"
    );
    Outcome::Ok(fixes)
}

/// Recount every declaration in `declarations`, in order.
pub async fn recalculate_each<C: Connection>(
    cx: &Cx,
    conn: &C,
    declarations: &[Declaration],
    opts: &RecountOptions,
) -> Outcome<Vec<Fix>, Error> {
    let mut fixes = Vec::new();
    for decl in declarations {
        fixes.extend(try_outcome!(
            recalculate(cx, conn, decl, &RecountTarget::All, opts).await
        ));
    }
    Outcome::Ok(fixes)
}
