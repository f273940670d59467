//! Lifecycle notifications.
//!
//! The host persistence layer calls [`CounterCache::on_created`],
//! [`CounterCache::on_updated`] and [`CounterCache::on_destroyed`] exactly
//! once per record event, passing the executor of the unit of work the
//! event belongs to. Counter statements run through that executor (or into
//! the unit of work's [`Batch`]), never on a connection of their own.

use crate::batch::{Batch, FlushSummary};
use crate::declaration::Declaration;
use crate::error::Error;
use crate::record::{Change, Snapshot};
use crate::recount::{self, Fix, RecountOptions, RecountTarget};
use crate::registry::Registry;
use crate::resolver::{Resolution, ResolvedTarget, resolve};
use crate::update::{Applied, Sign, apply, apply_delta};
use countercache_core::{Connection, Cx, Executor, Outcome};
use std::sync::Arc;

/// What one notification did, summed over its declarations.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EventSummary {
    /// Statements that updated a target row.
    pub applied: usize,
    /// Deltas merged into the batch.
    pub deferred: usize,
    /// Contributions with nothing to do.
    pub skipped: usize,
    /// Paths that stopped short of a target.
    pub unresolved: usize,
    /// Statements whose target row was gone.
    pub missing: usize,
}

impl EventSummary {
    fn record(&mut self, applied: Applied) {
        match applied {
            Applied::Updated => self.applied += 1,
            Applied::Deferred => self.deferred += 1,
            Applied::Skipped => self.skipped += 1,
            Applied::TargetMissing => self.missing += 1,
        }
    }
}

/// The counter-cache engine: a frozen [`Registry`] plus the event entry
/// points. Cheap to clone and share between threads.
#[derive(Debug, Clone)]
pub struct CounterCache {
    registry: Arc<Registry>,
}

impl CounterCache {
    pub fn new(registry: Registry) -> Self {
        Self {
            registry: Arc::new(registry),
        }
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn declarations_for(&self, record_type: &str) -> &[Declaration] {
        self.registry.declarations_for(record_type)
    }

    /// Start collecting deltas for a unit of work.
    pub fn begin_batch(&self) -> Batch {
        Batch::new()
    }

    /// Close a unit of work. With `commit`, the batch is flushed through
    /// `exec`, which must still be inside the committing transaction;
    /// otherwise it is discarded.
    pub async fn end_batch<E: Executor>(
        &self,
        cx: &Cx,
        exec: &E,
        batch: Batch,
        commit: bool,
    ) -> Outcome<FlushSummary, Error> {
        if !commit {
            batch.discard();
            return Outcome::Ok(FlushSummary::default());
        }
        let summary = try_outcome!(batch.flush(cx, exec).await);
        Outcome::Ok(summary)
    }

    /// A record was inserted.
    #[tracing::instrument(level = "debug", skip_all, fields(record_type = record.record_type()))]
    pub async fn on_created<E: Executor>(
        &self,
        cx: &Cx,
        exec: &E,
        batch: Option<&mut Batch>,
        record: &Snapshot,
    ) -> Outcome<EventSummary, Error> {
        self.contribute(cx, exec, batch, record, Sign::Increment)
            .await
    }

    /// A record was deleted. `record` must hold the values from before the
    /// delete.
    #[tracing::instrument(level = "debug", skip_all, fields(record_type = record.record_type()))]
    pub async fn on_destroyed<E: Executor>(
        &self,
        cx: &Cx,
        exec: &E,
        batch: Option<&mut Batch>,
        record: &Snapshot,
    ) -> Outcome<EventSummary, Error> {
        self.contribute(cx, exec, batch, record, Sign::Decrement)
            .await
    }

    async fn contribute<E: Executor>(
        &self,
        cx: &Cx,
        exec: &E,
        mut batch: Option<&mut Batch>,
        record: &Snapshot,
        sign: Sign,
    ) -> Outcome<EventSummary, Error> {
        let mut summary = EventSummary::default();

        for decl in self.registry.declarations_for(record.record_type()) {
            let Some(target) = try_outcome!(locate(cx, exec, decl, record, &mut summary).await)
            else {
                continue;
            };
            let applied = try_outcome!(
                apply(cx, exec, batch.as_deref_mut(), &target, decl, sign, record).await
            );
            summary.record(applied);
        }

        Outcome::Ok(summary)
    }

    /// A record was updated.
    ///
    /// The old side (previous values) and the new side (current values)
    /// are evaluated independently: each gets its own condition, column
    /// and target. When both land on the same target and column only the
    /// difference in magnitude is applied; otherwise the old side is
    /// decremented and the new side incremented.
    #[tracing::instrument(level = "debug", skip_all, fields(record_type = change.current().record_type()))]
    pub async fn on_updated<E: Executor>(
        &self,
        cx: &Cx,
        exec: &E,
        mut batch: Option<&mut Batch>,
        change: &Change,
    ) -> Outcome<EventSummary, Error> {
        let mut summary = EventSummary::default();
        let current = change.current();
        let previous = change.previous();

        for decl in self.registry.declarations_for(current.record_type()) {
            let old_column = decl.column_for(&previous);
            let new_column = decl.column_for(current);
            let keys_changed = decl
                .first_hop_columns()
                .iter()
                .any(|c| change.is_changed(c));
            let delta_changed = decl
                .delta_column_name()
                .is_some_and(|c| change.is_changed(c));

            if !keys_changed && !delta_changed && old_column == new_column {
                summary.skipped += 1;
                continue;
            }

            let (old_side, new_side) = if keys_changed {
                let old_side = match old_column {
                    Some(column) => match try_outcome!(resolve(
                        cx,
                        exec,
                        decl.path(),
                        &previous
                    )
                    .await)
                    {
                        Resolution::Resolved(target) => Some((target, column)),
                        Resolution::Unresolvable(u) => {
                            tracing::debug!(hop = u.hop, reason = ?u.reason, "Old side unresolvable");
                            summary.unresolved += 1;
                            None
                        }
                    },
                    None => None,
                };
                let new_side = match new_column {
                    Some(column) => match try_outcome!(resolve(
                        cx,
                        exec,
                        decl.path(),
                        current
                    )
                    .await)
                    {
                        Resolution::Resolved(target) => Some((target, column)),
                        Resolution::Unresolvable(u) => {
                            tracing::debug!(hop = u.hop, reason = ?u.reason, "New side unresolvable");
                            summary.unresolved += 1;
                            None
                        }
                    },
                    None => None,
                };
                (old_side, new_side)
            } else {
                // Same keys: both sides share one target.
                match try_outcome!(resolve(cx, exec, decl.path(), current).await) {
                    Resolution::Resolved(target) => (
                        old_column.map(|c| (target.clone(), c)),
                        new_column.map(|c| (target, c)),
                    ),
                    Resolution::Unresolvable(u) => {
                        tracing::debug!(hop = u.hop, reason = ?u.reason, "Path unresolvable");
                        summary.unresolved += 1;
                        continue;
                    }
                }
            };

            let old_magnitude = match old_side.as_ref().map(|_| decl.magnitude(&previous)) {
                Some(Ok(m)) => Some(m),
                Some(Err(e)) => return Outcome::Err(Error::Type(e)),
                None => None,
            };
            let new_magnitude = match new_side.as_ref().map(|_| decl.magnitude(current)) {
                Some(Ok(m)) => Some(m),
                Some(Err(e)) => return Outcome::Err(Error::Type(e)),
                None => None,
            };

            match (old_side, new_side, old_magnitude, new_magnitude) {
                (Some((old_target, old_col)), Some((new_target, new_col)), Some(old), Some(new))
                    if same_slot(&old_target, &old_col, &new_target, &new_col) =>
                {
                    let applied = try_outcome!(
                        apply_delta(
                            cx,
                            exec,
                            batch.as_deref_mut(),
                            &new_target,
                            decl,
                            &new_col,
                            new - old
                        )
                        .await
                    );
                    summary.record(applied);
                }
                (old_side, new_side, old_magnitude, new_magnitude) => {
                    if let (Some((target, column)), Some(m)) = (old_side, old_magnitude) {
                        let applied = try_outcome!(
                            apply_delta(
                                cx,
                                exec,
                                batch.as_deref_mut(),
                                &target,
                                decl,
                                &column,
                                Sign::Decrement.apply(m)
                            )
                            .await
                        );
                        summary.record(applied);
                    }
                    if let (Some((target, column)), Some(m)) = (new_side, new_magnitude) {
                        let applied = try_outcome!(
                            apply_delta(
                                cx,
                                exec,
                                batch.as_deref_mut(),
                                &target,
                                decl,
                                &column,
                                Sign::Increment.apply(m)
                            )
                            .await
                        );
                        summary.record(applied);
                    }
                }
            }
        }

        Outcome::Ok(summary)
    }

    /// Recount one declaration. See [`recount::recalculate`].
    pub async fn recalculate<C: Connection>(
        &self,
        cx: &Cx,
        conn: &C,
        declaration: &Declaration,
        target: RecountTarget,
        opts: &RecountOptions,
    ) -> Outcome<Vec<Fix>, Error> {
        recount::recalculate(cx, conn, declaration, &target, opts).await
    }

    /// Recount every declaration registered for `record_type`.
    pub async fn recalculate_all<C: Connection>(
        &self,
        cx: &Cx,
        conn: &C,
        record_type: &str,
        opts: &RecountOptions,
    ) -> Outcome<Vec<Fix>, Error> {
        recount::recalculate_each(cx, conn, self.declarations_for(record_type), opts).await
    }
}

fn same_slot(a: &ResolvedTarget, a_col: &str, b: &ResolvedTarget, b_col: &str) -> bool {
    a.terminal() == b.terminal() && a_col == b_col
}

/// Target `record` contributes to under `decl`, or `None` when the
/// condition rejects it or the path stops short.
async fn locate<E: Executor>(
    cx: &Cx,
    exec: &E,
    decl: &Declaration,
    record: &Snapshot,
    summary: &mut EventSummary,
) -> Outcome<Option<ResolvedTarget>, Error> {
    if decl.column_for(record).is_none() {
        summary.skipped += 1;
        return Outcome::Ok(None);
    }
    match try_outcome!(resolve(cx, exec, decl.path(), record).await) {
        Resolution::Resolved(target) => Outcome::Ok(Some(target)),
        Resolution::Unresolvable(u) => {
            tracing::debug!(hop = u.hop, reason = ?u.reason, "Path unresolvable; skipping");
            summary.unresolved += 1;
            Outcome::Ok(None)
        }
    }
}
