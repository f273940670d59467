//! Transaction-scoped batching of counter deltas.
//!
//! A [`Batch`] belongs to one unit of work. Deltas merged into it cost no
//! round trip; at commit the host flushes it, issuing one statement per
//! distinct (table, row, column). On rollback it is discarded unflushed,
//! so counters share the atomicity boundary of the data they describe.

use crate::delta::Delta;
use crate::update::{Adjustment, Applied, adjust};
use countercache_core::{Cx, Error, Executor, Outcome, RowId};
use std::collections::{BTreeMap, BTreeSet};

/// Identity of one pending counter statement.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PendingKey {
    pub table: String,
    pub id: RowId,
    pub column: String,
}

/// Net change accumulated for one [`PendingKey`].
#[derive(Debug, Clone, PartialEq)]
pub struct PendingDelta {
    pub primary_key: String,
    pub delta: Delta,
    pub touch: BTreeSet<String>,
    /// Events merged into this entry.
    pub events: usize,
}

/// Result of flushing a batch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlushSummary {
    /// Statements issued.
    pub statements: usize,
    /// Events those statements stand for.
    pub events: usize,
    /// Statements whose target row no longer exists.
    pub missing: usize,
    /// Entries whose deltas cancelled out and had nothing to touch.
    pub cancelled: usize,
}

/// Pending deltas of one unit of work.
#[derive(Debug, Default)]
pub struct Batch {
    pending: BTreeMap<PendingKey, PendingDelta>,
}

impl Batch {
    pub fn new() -> Self {
        Self::default()
    }

    /// Merge a delta for `table.column` on row `id`.
    pub fn merge(
        &mut self,
        table: &str,
        primary_key: &str,
        id: &RowId,
        column: &str,
        delta: Delta,
        touch: &[String],
    ) {
        let key = PendingKey {
            table: table.to_string(),
            id: id.clone(),
            column: column.to_string(),
        };
        let entry = self.pending.entry(key).or_insert_with(|| PendingDelta {
            primary_key: primary_key.to_string(),
            delta: Delta::ZERO,
            touch: BTreeSet::new(),
            events: 0,
        });
        entry.delta += delta;
        entry.touch.extend(touch.iter().cloned());
        entry.events += 1;
    }

    /// Number of distinct pending statements.
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn get(&self, key: &PendingKey) -> Option<&PendingDelta> {
        self.pending.get(key)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&PendingKey, &PendingDelta)> {
        self.pending.iter()
    }

    /// Issue the pending statements through `exec` (the committing
    /// transaction), in key order so that concurrent flushes lock rows in
    /// the same order. The first failure aborts the flush.
    #[tracing::instrument(level = "debug", skip_all, fields(pending = self.pending.len()))]
    pub async fn flush<E: Executor>(self, cx: &Cx, exec: &E) -> Outcome<FlushSummary, Error> {
        let mut summary = FlushSummary::default();

        for (key, pending) in self.pending {
            if pending.delta.is_zero() && pending.touch.is_empty() {
                summary.cancelled += 1;
                continue;
            }
            let adjustment = Adjustment {
                table: key.table,
                primary_key: pending.primary_key,
                id: key.id,
                column: key.column,
                delta: pending.delta,
                touch: pending.touch.into_iter().collect(),
            };
            match adjust(cx, exec, &adjustment).await {
                Outcome::Ok(applied) => {
                    summary.statements += 1;
                    summary.events += pending.events;
                    if applied == Applied::TargetMissing {
                        summary.missing += 1;
                    }
                }
                Outcome::Err(e) => return Outcome::Err(e),
                Outcome::Cancelled(r) => return Outcome::Cancelled(r),
                Outcome::Panicked(p) => return Outcome::Panicked(p),
            }
        }

        tracing::debug!(
            statements = summary.statements,
            events = summary.events,
            missing = summary.missing,
            "Counter batch flushed"
        );
        Outcome::Ok(summary)
    }

    /// Drop all pending deltas without issuing anything.
    pub fn discard(self) {
        tracing::debug!(pending = self.pending.len(), "Counter batch discarded");
    }
}
