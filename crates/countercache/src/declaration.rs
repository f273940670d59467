//! Counter declarations.
//!
//! A [`Declaration`] says which column on which ancestor row aggregates a
//! record type, and how to get there: an association path of [`Hop`]s read
//! from the originating record, then from each intermediate row in turn.
//!
//! ```rust,ignore
//! // comments.commentable -> (posts | videos); posts.blog_id -> blogs
//! let decl = Declaration::new(
//!     [
//!         Hop::polymorphic("commentable_type", "commentable_id").target("Post", "posts"),
//!         Hop::belongs_to("blog_id", "blogs"),
//!     ],
//!     "comments_count",
//! );
//! ```

use crate::delta::Delta;
use crate::error::DeclarationError;
use crate::record::Snapshot;
use countercache_core::{TypeError, is_valid_identifier};
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

/// Computes the counter column from the originating record. `None` means
/// the record counts towards no column.
pub type ColumnFn = Arc<dyn Fn(&Snapshot) -> Option<String> + Send + Sync>;

/// Predicate over the originating record.
pub type Predicate = Arc<dyn Fn(&Snapshot) -> bool + Send + Sync>;

/// One candidate of a polymorphic hop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PolymorphicTarget {
    /// Discriminator value stored in the type column.
    pub type_name: String,
    pub table: String,
    pub primary_key: String,
}

/// One step of an association path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Hop {
    /// `foreign_key` on the current row references `table.primary_key`.
    Direct {
        foreign_key: String,
        table: String,
        primary_key: String,
    },
    /// `type_column` on the current row picks one of `targets`,
    /// `foreign_key` references its primary key.
    Polymorphic {
        type_column: String,
        foreign_key: String,
        targets: Vec<PolymorphicTarget>,
    },
}

impl Hop {
    /// A direct hop to `table` keyed by `id`.
    pub fn belongs_to(foreign_key: impl Into<String>, table: impl Into<String>) -> Self {
        Hop::Direct {
            foreign_key: foreign_key.into(),
            table: table.into(),
            primary_key: "id".to_string(),
        }
    }

    /// A polymorphic hop with no targets yet; add them with [`Hop::target`].
    pub fn polymorphic(type_column: impl Into<String>, foreign_key: impl Into<String>) -> Self {
        Hop::Polymorphic {
            type_column: type_column.into(),
            foreign_key: foreign_key.into(),
            targets: Vec::new(),
        }
    }

    /// Add a polymorphic target keyed by `id`. No-op on direct hops.
    pub fn target(self, type_name: impl Into<String>, table: impl Into<String>) -> Self {
        self.target_keyed(type_name, table, "id")
    }

    /// Add a polymorphic target with an explicit primary key.
    pub fn target_keyed(
        mut self,
        type_name: impl Into<String>,
        table: impl Into<String>,
        primary_key: impl Into<String>,
    ) -> Self {
        if let Hop::Polymorphic { targets, .. } = &mut self {
            targets.push(PolymorphicTarget {
                type_name: type_name.into(),
                table: table.into(),
                primary_key: primary_key.into(),
            });
        }
        self
    }

    /// Override the referenced primary key of a direct hop.
    pub fn primary_key(mut self, key: impl Into<String>) -> Self {
        if let Hop::Direct { primary_key, .. } = &mut self {
            *primary_key = key.into();
        }
        self
    }

    pub fn foreign_key(&self) -> &str {
        match self {
            Hop::Direct { foreign_key, .. } | Hop::Polymorphic { foreign_key, .. } => foreign_key,
        }
    }

    /// Columns that must be read from the current row to take this hop.
    pub fn key_columns(&self) -> Vec<&str> {
        match self {
            Hop::Direct { foreign_key, .. } => vec![foreign_key.as_str()],
            Hop::Polymorphic {
                type_column,
                foreign_key,
                ..
            } => vec![foreign_key.as_str(), type_column.as_str()],
        }
    }
}

/// A hop with its polymorphic choice made.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConcreteHop {
    pub foreign_key: String,
    pub table: String,
    pub primary_key: String,
    /// `(type_column, type_name)` the source row must match.
    pub type_filter: Option<(String, String)>,
}

/// Which column receives the delta.
#[derive(Clone)]
pub enum CounterColumn {
    Fixed(String),
    Dynamic(ColumnFn),
}

impl fmt::Debug for CounterColumn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CounterColumn::Fixed(name) => f.debug_tuple("Fixed").field(name).finish(),
            CounterColumn::Dynamic(_) => f.write_str("Dynamic(<fn>)"),
        }
    }
}

/// Timestamp column refreshed alongside the counter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Touch {
    /// `updated_at`
    UpdatedAt,
    Column(String),
}

impl Touch {
    pub fn column(&self) -> &str {
        match self {
            Touch::UpdatedAt => "updated_at",
            Touch::Column(name) => name,
        }
    }
}

/// A counter cache on an ancestor of some record type.
#[derive(Clone)]
pub struct Declaration {
    record_type: String,
    path: Vec<Hop>,
    column: CounterColumn,
    delta_column: Option<String>,
    step: i64,
    condition: Option<Predicate>,
    condition_sql: Option<String>,
    column_filters: Vec<(String, String)>,
    touch: Option<Touch>,
    keep_unmatched: bool,
}

impl Declaration {
    /// Count records into a fixed column on the end of `path`.
    pub fn new(path: impl IntoIterator<Item = Hop>, column: impl Into<String>) -> Self {
        Self::with_column(path, CounterColumn::Fixed(column.into()))
    }

    /// Count records into a column computed from each record.
    pub fn dynamic<F>(path: impl IntoIterator<Item = Hop>, column: F) -> Self
    where
        F: Fn(&Snapshot) -> Option<String> + Send + Sync + 'static,
    {
        Self::with_column(path, CounterColumn::Dynamic(Arc::new(column)))
    }

    /// Single direct hop: `foreign_key` references `table.id`.
    pub fn belongs_to(
        foreign_key: impl Into<String>,
        table: impl Into<String>,
        column: impl Into<String>,
    ) -> Self {
        Self::new([Hop::belongs_to(foreign_key, table)], column)
    }

    fn with_column(path: impl IntoIterator<Item = Hop>, column: CounterColumn) -> Self {
        Self {
            record_type: String::new(),
            path: path.into_iter().collect(),
            column,
            delta_column: None,
            step: 1,
            condition: None,
            condition_sql: None,
            column_filters: Vec::new(),
            touch: None,
            keep_unmatched: false,
        }
    }

    /// Sum this column of the record instead of counting records.
    pub fn delta_column(mut self, column: impl Into<String>) -> Self {
        self.delta_column = Some(column.into());
        self
    }

    /// Count each record as `step` instead of 1.
    pub fn step(mut self, step: i64) -> Self {
        self.step = step;
        self
    }

    /// Only records matching `predicate` contribute.
    pub fn condition<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&Snapshot) -> bool + Send + Sync + 'static,
    {
        self.condition = Some(Arc::new(predicate));
        self
    }

    /// SQL equivalent of [`Declaration::condition`] over the dependent
    /// table's columns, used by recalculation.
    pub fn condition_sql(mut self, sql: impl Into<String>) -> Self {
        self.condition_sql = Some(sql.into());
        self
    }

    /// For dynamic columns: the dependent rows that count into `column`,
    /// as a SQL condition. Recalculation recounts exactly the listed
    /// columns.
    pub fn column_filter(mut self, column: impl Into<String>, sql: impl Into<String>) -> Self {
        self.column_filters.push((column.into(), sql.into()));
        self
    }

    pub fn touch(mut self, touch: Touch) -> Self {
        self.touch = Some(touch);
        self
    }

    /// Recalculation leaves targets without dependents untouched.
    pub fn keep_unmatched(mut self, keep: bool) -> Self {
        self.keep_unmatched = keep;
        self
    }

    pub(crate) fn set_record_type(&mut self, record_type: &str) {
        self.record_type = record_type.to_string();
    }

    /// The dependent record type (table) this declaration is registered on.
    pub fn record_type(&self) -> &str {
        &self.record_type
    }

    pub fn path(&self) -> &[Hop] {
        &self.path
    }

    pub fn counter_column(&self) -> &CounterColumn {
        &self.column
    }

    pub fn delta_column_name(&self) -> Option<&str> {
        self.delta_column.as_deref()
    }

    pub fn step_size(&self) -> i64 {
        self.step
    }

    pub fn has_condition(&self) -> bool {
        self.condition.is_some()
    }

    pub fn condition_sql_text(&self) -> Option<&str> {
        self.condition_sql.as_deref()
    }

    pub fn column_filters(&self) -> &[(String, String)] {
        &self.column_filters
    }

    pub fn touch_column(&self) -> Option<&str> {
        self.touch.as_ref().map(Touch::column)
    }

    pub fn keeps_unmatched(&self) -> bool {
        self.keep_unmatched
    }

    /// Columns of the originating record that locate the first hop.
    pub fn first_hop_columns(&self) -> Vec<&str> {
        self.path.first().map(Hop::key_columns).unwrap_or_default()
    }

    /// The counter column `snapshot` contributes to, if any.
    pub fn column_for(&self, snapshot: &Snapshot) -> Option<String> {
        if let Some(condition) = &self.condition {
            if !condition(snapshot) {
                return None;
            }
        }
        match &self.column {
            CounterColumn::Fixed(name) => Some(name.clone()),
            CounterColumn::Dynamic(f) => {
                let name = f(snapshot)?;
                if is_valid_identifier(&name) {
                    Some(name)
                } else {
                    tracing::warn!(
                        record_type = %self.record_type,
                        column = %name,
                        "Dynamic counter column is not a valid identifier; skipping"
                    );
                    None
                }
            }
        }
    }

    /// Unsigned contribution of `snapshot`: its delta column, or the step.
    pub fn magnitude(&self, snapshot: &Snapshot) -> Result<Delta, TypeError> {
        match &self.delta_column {
            Some(column) => Delta::from_value(snapshot.get(column), column),
            None => Ok(Delta::Int(self.step)),
        }
    }

    /// Concrete paths this declaration can take, one per combination of
    /// polymorphic targets.
    pub fn expansions(&self) -> Vec<Vec<ConcreteHop>> {
        let mut paths: Vec<Vec<ConcreteHop>> = vec![Vec::new()];
        for hop in &self.path {
            let choices: Vec<ConcreteHop> = match hop {
                Hop::Direct {
                    foreign_key,
                    table,
                    primary_key,
                } => vec![ConcreteHop {
                    foreign_key: foreign_key.clone(),
                    table: table.clone(),
                    primary_key: primary_key.clone(),
                    type_filter: None,
                }],
                Hop::Polymorphic {
                    type_column,
                    foreign_key,
                    targets,
                } => targets
                    .iter()
                    .map(|t| ConcreteHop {
                        foreign_key: foreign_key.clone(),
                        table: t.table.clone(),
                        primary_key: t.primary_key.clone(),
                        type_filter: Some((type_column.clone(), t.type_name.clone())),
                    })
                    .collect(),
            };
            paths = paths
                .into_iter()
                .flat_map(|prefix| {
                    choices.iter().map(move |choice| {
                        let mut path = prefix.clone();
                        path.push(choice.clone());
                        path
                    })
                })
                .collect();
        }
        paths
    }

    /// Check the declaration is well formed.
    pub fn validate(&self, record_type: &str) -> Result<(), DeclarationError> {
        let fail = |message: String| -> Result<(), DeclarationError> {
            Err(DeclarationError::new(record_type, message))
        };
        let ident = |what: &str, name: &str| -> Result<(), DeclarationError> {
            if is_valid_identifier(name) {
                Ok(())
            } else {
                Err(DeclarationError::new(
                    record_type,
                    format!("{} {:?} is not a valid SQL identifier", what, name),
                ))
            }
        };

        ident("record type", record_type)?;
        if self.path.is_empty() {
            return fail("association path is empty".to_string());
        }

        for (i, hop) in self.path.iter().enumerate() {
            match hop {
                Hop::Direct {
                    foreign_key,
                    table,
                    primary_key,
                } => {
                    ident(&format!("hop {} foreign key", i), foreign_key)?;
                    ident(&format!("hop {} table", i), table)?;
                    ident(&format!("hop {} primary key", i), primary_key)?;
                }
                Hop::Polymorphic {
                    type_column,
                    foreign_key,
                    targets,
                } => {
                    if type_column.is_empty() {
                        return fail(format!("polymorphic hop {} has no type column", i));
                    }
                    ident(&format!("hop {} type column", i), type_column)?;
                    ident(&format!("hop {} foreign key", i), foreign_key)?;
                    if targets.is_empty() {
                        return fail(format!("polymorphic hop {} has no targets", i));
                    }
                    let mut seen = HashSet::new();
                    for target in targets {
                        if !seen.insert(target.type_name.as_str()) {
                            return fail(format!(
                                "polymorphic hop {} lists type {:?} twice",
                                i, target.type_name
                            ));
                        }
                        ident(&format!("hop {} table", i), &target.table)?;
                        ident(&format!("hop {} primary key", i), &target.primary_key)?;
                    }
                }
            }
        }

        match &self.column {
            CounterColumn::Fixed(name) => ident("counter column", name)?,
            CounterColumn::Dynamic(_) => {
                for (column, _) in &self.column_filters {
                    ident("filtered counter column", column)?;
                }
            }
        }
        if let Some(column) = &self.delta_column {
            ident("delta column", column)?;
            if self.step != 1 {
                return fail("a delta column cannot be combined with a step".to_string());
            }
        }
        if self.step == 0 {
            return fail("step must not be zero".to_string());
        }
        if let Some(touch) = &self.touch {
            ident("touch column", touch.column())?;
        }
        Ok(())
    }
}

impl fmt::Debug for Declaration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Declaration")
            .field("record_type", &self.record_type)
            .field("path", &self.path)
            .field("column", &self.column)
            .field("delta_column", &self.delta_column)
            .field("step", &self.step)
            .field("condition", &self.condition.as_ref().map(|_| "<fn>"))
            .field("condition_sql", &self.condition_sql)
            .field("column_filters", &self.column_filters)
            .field("touch", &self.touch)
            .field("keep_unmatched", &self.keep_unmatched)
            .finish()
    }
}
