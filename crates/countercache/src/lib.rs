//! Race-free counter caches over relational rows.
//!
//! A counter cache is a column on a parent row (`posts.comments_count`)
//! holding an aggregate over the rows that point at it. This crate keeps
//! such columns correct without scanning tables on every write:
//!
//! - [`Registry`] holds the [`Declaration`]s registered per record type
//! - [`resolver`] walks a declaration's association path (direct or
//!   polymorphic hops, any depth) from a record snapshot to the target row
//! - [`update`] issues one atomic `column = column + delta` statement per
//!   target and column, so concurrent writers never lose an update
//! - [`Batch`] coalesces deltas inside one unit of work into a single
//!   statement per target and column, flushed at commit
//! - [`recount`] recomputes counters from the dependent rows under a row
//!   lock and overwrites drift
//!
//! [`CounterCache`] ties these together behind the lifecycle notifications
//! a host persistence layer emits.
//!
//! # Example
//!
//! ```rust,ignore
//! use countercache::{CounterCache, Declaration, Registry, Snapshot};
//!
//! let mut registry = Registry::new();
//! registry.register("comments", Declaration::belongs_to("post_id", "posts", "comments_count"))?;
//! let cache = CounterCache::new(registry);
//!
//! let comment = Snapshot::new("comments").with("id", 1_i64).with("post_id", 7_i64);
//! cache.on_created(&cx, &conn, None, &comment).await;
//! ```

/// Propagate a non-`Ok` outcome, converting the error.
macro_rules! try_outcome {
    ($e:expr) => {
        match $e {
            ::asupersync::Outcome::Ok(v) => v,
            ::asupersync::Outcome::Err(e) => return ::asupersync::Outcome::Err(e.into()),
            ::asupersync::Outcome::Cancelled(r) => return ::asupersync::Outcome::Cancelled(r),
            ::asupersync::Outcome::Panicked(p) => return ::asupersync::Outcome::Panicked(p),
        }
    };
}

pub mod batch;
pub mod cache;
pub mod declaration;
pub mod delta;
pub mod error;
pub mod record;
pub mod recount;
pub mod registry;
pub mod resolver;
pub mod update;

#[cfg(test)]
mod testing;

pub use batch::{Batch, FlushSummary, PendingDelta, PendingKey};
pub use cache::{CounterCache, EventSummary};
pub use declaration::{CounterColumn, Declaration, Hop, PolymorphicTarget, Touch};
pub use delta::Delta;
pub use error::{DeclarationError, Error, Result};
pub use record::{Change, Snapshot};
pub use recount::{Fix, RecountOptions, RecountTarget};
pub use registry::Registry;
pub use resolver::{HopTarget, Resolution, ResolvedTarget, Unresolved, UnresolvedReason};
pub use update::{Adjustment, Applied, Sign};

pub use countercache_core::{Cx, Outcome, RowId, Value};
