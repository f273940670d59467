//! Association path resolution.
//!
//! The first hop reads its keys from the record snapshot. Every later hop
//! needs the keys of the intermediate row, fetched with one point read by
//! primary key, so the cost of a resolution grows with path length and
//! never with table size.

use crate::declaration::Hop;
use crate::record::Snapshot;
use countercache_core::{Cx, Error, Executor, Outcome, Row, RowId, Value};

/// One located row along a path.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct HopTarget {
    pub table: String,
    pub primary_key: String,
    pub id: RowId,
}

/// A fully resolved path: one located row per hop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedTarget {
    hops: Vec<HopTarget>,
}

impl ResolvedTarget {
    pub fn new(hops: Vec<HopTarget>) -> Self {
        debug_assert!(!hops.is_empty());
        Self { hops }
    }

    /// The row holding the counter.
    pub fn terminal(&self) -> &HopTarget {
        &self.hops[self.hops.len() - 1]
    }

    pub fn hops(&self) -> &[HopTarget] {
        &self.hops
    }
}

/// Why a path stopped short.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UnresolvedReason {
    /// The key column is NULL (or cannot identify a row).
    MissingKey { column: String },
    /// A polymorphic discriminator names no declared target.
    UnknownType { type_name: Option<String> },
    /// An intermediate row does not exist.
    MissingRow { table: String, id: RowId },
}

/// Where a path stopped short, and why.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Unresolved {
    /// Index of the hop that could not be taken.
    pub hop: usize,
    pub reason: UnresolvedReason,
}

/// Outcome of walking a path. `Unresolvable` is a legitimate no-op.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    Resolved(ResolvedTarget),
    Unresolvable(Unresolved),
}

impl Resolution {
    pub fn target(&self) -> Option<&ResolvedTarget> {
        match self {
            Resolution::Resolved(t) => Some(t),
            Resolution::Unresolvable(_) => None,
        }
    }
}

/// Where the keys for the next hop come from.
enum Source<'a> {
    Record(&'a Snapshot),
    Row(Row),
}

impl Source<'_> {
    fn get(&self, column: &str) -> Value {
        match self {
            Source::Record(snapshot) => snapshot.get(column).clone(),
            Source::Row(row) => row.get_by_name(column).cloned().unwrap_or(Value::Null),
        }
    }
}

/// Take one hop from `source`: pick the table and read the key.
fn locate(hop: &Hop, index: usize, source: &Source<'_>) -> Result<HopTarget, Unresolved> {
    let unresolved = |reason| Unresolved { hop: index, reason };

    let (table, primary_key) = match hop {
        Hop::Direct {
            table, primary_key, ..
        } => (table, primary_key),
        Hop::Polymorphic {
            type_column,
            targets,
            ..
        } => {
            let discriminator = source.get(type_column);
            let type_name = discriminator.as_str();
            match targets.iter().find(|t| Some(t.type_name.as_str()) == type_name) {
                Some(t) => (&t.table, &t.primary_key),
                None => {
                    return Err(unresolved(UnresolvedReason::UnknownType {
                        type_name: type_name.map(str::to_string),
                    }));
                }
            }
        }
    };

    let foreign_key = hop.foreign_key();
    let id = RowId::from_value(&source.get(foreign_key)).ok_or_else(|| {
        unresolved(UnresolvedReason::MissingKey {
            column: foreign_key.to_string(),
        })
    })?;

    Ok(HopTarget {
        table: table.clone(),
        primary_key: primary_key.clone(),
        id,
    })
}

/// Point read of the key columns `next` needs from the row at `at`.
fn point_read_sql(exec_dialect: countercache_core::Dialect, at: &HopTarget, next: &Hop) -> String {
    let columns = next
        .key_columns()
        .iter()
        .map(|c| exec_dialect.quote(c))
        .collect::<Vec<_>>()
        .join(", ");
    format!(
        "SELECT {} FROM {} WHERE {} = {}",
        columns,
        exec_dialect.quote(&at.table),
        exec_dialect.quote(&at.primary_key),
        exec_dialect.placeholder(1)
    )
}

/// Walk `path` from `snapshot`.
///
/// Callers resolving the old side of an update pass the previous snapshot
/// ([`crate::Change::previous`]); records being destroyed pass the values
/// captured before the delete.
#[tracing::instrument(level = "trace", skip_all, fields(record_type = snapshot.record_type(), hops = path.len()))]
pub async fn resolve<E: Executor>(
    cx: &Cx,
    exec: &E,
    path: &[Hop],
    snapshot: &Snapshot,
) -> Outcome<Resolution, Error> {
    let mut hops = Vec::with_capacity(path.len());
    let mut source = Source::Record(snapshot);

    for (index, hop) in path.iter().enumerate() {
        let target = match locate(hop, index, &source) {
            Ok(target) => target,
            Err(unresolved) => {
                tracing::trace!(hop = index, reason = ?unresolved.reason, "Path unresolvable");
                return Outcome::Ok(Resolution::Unresolvable(unresolved));
            }
        };

        if let Some(next) = path.get(index + 1) {
            let sql = point_read_sql(exec.dialect(), &target, next);
            tracing::trace!(sql = %sql, id = %target.id, "Reading intermediate row");
            let row = match exec.query_one(cx, &sql, &[target.id.to_value()]).await {
                Outcome::Ok(Some(row)) => row,
                Outcome::Ok(None) => {
                    return Outcome::Ok(Resolution::Unresolvable(Unresolved {
                        hop: index + 1,
                        reason: UnresolvedReason::MissingRow {
                            table: target.table,
                            id: target.id,
                        },
                    }));
                }
                Outcome::Err(e) => return Outcome::Err(e),
                Outcome::Cancelled(r) => return Outcome::Cancelled(r),
                Outcome::Panicked(p) => return Outcome::Panicked(p),
            };
            source = Source::Row(row);
        }

        hops.push(target);
    }

    if hops.is_empty() {
        return Outcome::Ok(Resolution::Unresolvable(Unresolved {
            hop: 0,
            reason: UnresolvedReason::MissingKey {
                column: String::new(),
            },
        }));
    }
    Outcome::Ok(Resolution::Resolved(ResolvedTarget::new(hops)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{MockExecutor, row, run, unwrap_outcome};
    use countercache_core::{Dialect, QueryErrorKind};

    fn commentable_blog() -> Vec<Hop> {
        vec![
            Hop::polymorphic("commentable_type", "commentable_id")
                .target("Post", "posts")
                .target("Video", "videos"),
            Hop::belongs_to("blog_id", "blogs"),
        ]
    }

    #[test]
    fn test_single_hop_reads_snapshot_only() {
        run(async {
            let cx = Cx::for_testing();
            let exec = MockExecutor::new();
            let snap = Snapshot::new("comments").with("post_id", 4_i64);
            let res = unwrap_outcome(
                resolve(&cx, &exec, &[Hop::belongs_to("post_id", "posts")], &snap).await,
            );
            let target = res.target().unwrap().terminal().clone();
            assert_eq!(
                target,
                HopTarget {
                    table: "posts".into(),
                    primary_key: "id".into(),
                    id: RowId::Int(4)
                }
            );
            assert!(exec.queried().is_empty());
        });
    }

    #[test]
    fn test_null_key_unresolvable() {
        run(async {
            let cx = Cx::for_testing();
            let exec = MockExecutor::new();
            let snap = Snapshot::new("comments").with("post_id", Value::Null);
            let res = unwrap_outcome(
                resolve(&cx, &exec, &[Hop::belongs_to("post_id", "posts")], &snap).await,
            );
            assert_eq!(
                res,
                Resolution::Unresolvable(Unresolved {
                    hop: 0,
                    reason: UnresolvedReason::MissingKey {
                        column: "post_id".into()
                    }
                })
            );
        });
    }

    #[test]
    fn test_multi_level_point_read() {
        run(async {
            let cx = Cx::for_testing();
            let exec = MockExecutor::new().respond(|sql, params| {
                assert_eq!(
                    sql,
                    r#"SELECT "blog_id" FROM "posts" WHERE "id" = $1"#
                );
                assert_eq!(params, &[Value::BigInt(7)]);
                vec![row(&["blog_id"], vec![Value::BigInt(3)])]
            });
            let snap = Snapshot::new("comments")
                .with("commentable_type", "Post")
                .with("commentable_id", 7_i64);
            let res = unwrap_outcome(resolve(&cx, &exec, &commentable_blog(), &snap).await);
            let target = res.target().unwrap();
            assert_eq!(target.hops().len(), 2);
            assert_eq!(target.terminal().table, "blogs");
            assert_eq!(target.terminal().id, RowId::Int(3));
        });
    }

    #[test]
    fn test_unknown_polymorphic_type() {
        run(async {
            let cx = Cx::for_testing();
            let exec = MockExecutor::new();
            let snap = Snapshot::new("comments")
                .with("commentable_type", "Photo")
                .with("commentable_id", 7_i64);
            let res = unwrap_outcome(resolve(&cx, &exec, &commentable_blog(), &snap).await);
            assert!(matches!(
                res,
                Resolution::Unresolvable(Unresolved {
                    hop: 0,
                    reason: UnresolvedReason::UnknownType { ref type_name }
                }) if type_name.as_deref() == Some("Photo")
            ));
        });
    }

    #[test]
    fn test_second_hop_without_key_column_is_unresolvable() {
        // videos have no blog_id column: the point read returns a row
        // without it and the path stops.
        run(async {
            let cx = Cx::for_testing();
            let exec = MockExecutor::new().respond(|_, _| vec![row(&["other"], vec![Value::BigInt(1)])]);
            let snap = Snapshot::new("comments")
                .with("commentable_type", "Video")
                .with("commentable_id", 2_i64);
            let res = unwrap_outcome(resolve(&cx, &exec, &commentable_blog(), &snap).await);
            assert!(matches!(
                res,
                Resolution::Unresolvable(Unresolved { hop: 1, .. })
            ));
        });
    }

    #[test]
    fn test_missing_intermediate_row() {
        run(async {
            let cx = Cx::for_testing();
            let exec = MockExecutor::new();
            let snap = Snapshot::new("comments")
                .with("commentable_type", "Post")
                .with("commentable_id", 99_i64);
            let res = unwrap_outcome(resolve(&cx, &exec, &commentable_blog(), &snap).await);
            assert!(matches!(
                res,
                Resolution::Unresolvable(Unresolved {
                    hop: 1,
                    reason: UnresolvedReason::MissingRow { .. }
                })
            ));
        });
    }

    #[test]
    fn test_point_read_failure_propagates() {
        run(async {
            let cx = Cx::for_testing();
            let exec = MockExecutor::new().fail_on("SELECT", QueryErrorKind::Database);
            let snap = Snapshot::new("comments")
                .with("commentable_type", "Post")
                .with("commentable_id", 1_i64);
            let res = resolve(&cx, &exec, &commentable_blog(), &snap).await;
            assert!(matches!(res, Outcome::Err(Error::Query(_))));
        });
    }

    #[test]
    fn test_point_read_sql_mysql() {
        let at = HopTarget {
            table: "posts".into(),
            primary_key: "id".into(),
            id: RowId::Int(1),
        };
        let next = Hop::polymorphic("owner_type", "owner_id").target("User", "users");
        assert_eq!(
            point_read_sql(Dialect::MySql, &at, &next),
            "SELECT `owner_id`, `owner_type` FROM `posts` WHERE `id` = ?"
        );
    }
}
