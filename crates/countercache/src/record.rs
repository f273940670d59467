//! Record snapshots captured by the host around lifecycle events.

use countercache_core::{Model, Value};
use std::collections::{BTreeMap, BTreeSet};

static NULL: Value = Value::Null;

/// Column values of one record at one point in time.
///
/// Columns the host did not capture read as NULL.
#[derive(Debug, Clone, PartialEq)]
pub struct Snapshot {
    record_type: String,
    values: BTreeMap<String, Value>,
}

impl Snapshot {
    pub fn new(record_type: impl Into<String>) -> Self {
        Self {
            record_type: record_type.into(),
            values: BTreeMap::new(),
        }
    }

    /// Builder-style column assignment.
    pub fn with(mut self, column: impl Into<String>, value: impl Into<Value>) -> Self {
        self.set(column, value);
        self
    }

    pub fn set(&mut self, column: impl Into<String>, value: impl Into<Value>) {
        self.values.insert(column.into(), value.into());
    }

    /// Capture a snapshot from a [`Model`] instance.
    pub fn from_model<M: Model>(model: &M) -> Self {
        let mut snapshot = Self::new(M::TABLE_NAME);
        for (column, value) in model.to_row() {
            snapshot.set(column, value);
        }
        snapshot
    }

    /// Capture a snapshot from a JSON object. Anything else yields an empty
    /// snapshot.
    pub fn from_json(record_type: impl Into<String>, doc: &serde_json::Value) -> Self {
        let mut snapshot = Self::new(record_type);
        if let Some(object) = doc.as_object() {
            for (column, value) in object {
                snapshot.set(column.clone(), Value::from(value));
            }
        }
        snapshot
    }

    pub fn record_type(&self) -> &str {
        &self.record_type
    }

    pub fn get(&self, column: &str) -> &Value {
        self.values.get(column).unwrap_or(&NULL)
    }

    pub fn contains(&self, column: &str) -> bool {
        self.values.contains_key(column)
    }

    pub fn columns(&self) -> impl Iterator<Item = &str> {
        self.values.keys().map(String::as_str)
    }
}

/// An update event: the record as it is now, plus the previous values of
/// the columns that changed.
#[derive(Debug, Clone, PartialEq)]
pub struct Change {
    current: Snapshot,
    previous: BTreeMap<String, Value>,
}

impl Change {
    pub fn new(current: Snapshot) -> Self {
        Self {
            current,
            previous: BTreeMap::new(),
        }
    }

    /// Record the value `column` had before the update.
    pub fn changed(mut self, column: impl Into<String>, old: impl Into<Value>) -> Self {
        self.previous.insert(column.into(), old.into());
        self
    }

    /// Diff two snapshots of the same record. A column missing from either
    /// side compares as NULL.
    pub fn from_snapshots(previous: &Snapshot, current: Snapshot) -> Self {
        let columns: BTreeSet<&str> = previous.columns().chain(current.columns()).collect();
        let mut diff = BTreeMap::new();
        for column in columns {
            let old = previous.get(column);
            if current.get(column) != old {
                diff.insert(column.to_string(), old.clone());
            }
        }
        Self {
            current,
            previous: diff,
        }
    }

    pub fn current(&self) -> &Snapshot {
        &self.current
    }

    /// The record as it was before the update.
    pub fn previous(&self) -> Snapshot {
        let mut snapshot = self.current.clone();
        for (column, value) in &self.previous {
            snapshot.set(column.clone(), value.clone());
        }
        snapshot
    }

    /// Did `column` change value?
    pub fn is_changed(&self, column: &str) -> bool {
        self.previous
            .get(column)
            .is_some_and(|old| old != self.current.get(column))
    }

    pub fn changed_columns(&self) -> impl Iterator<Item = &str> {
        self.previous
            .keys()
            .map(String::as_str)
            .filter(|column| self.is_changed(column))
    }
}
