//! Declaration registry.

use crate::declaration::Declaration;
use crate::error::{Error, Result};
use std::collections::HashMap;

/// Counter declarations per record type, in registration order.
///
/// Built once at setup and then shared read-only (see
/// [`crate::CounterCache::new`]).
#[derive(Debug, Default, Clone)]
pub struct Registry {
    by_type: HashMap<String, Vec<Declaration>>,
    types: Vec<String>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Validate `declaration` and append it to `record_type`'s list.
    pub fn register(
        &mut self,
        record_type: &str,
        mut declaration: Declaration,
    ) -> Result<&Declaration> {
        declaration
            .validate(record_type)
            .map_err(Error::InvalidDeclaration)?;
        declaration.set_record_type(record_type);

        tracing::debug!(
            record_type = record_type,
            hops = declaration.path().len(),
            column = ?declaration.counter_column(),
            "Registered counter declaration"
        );

        if !self.by_type.contains_key(record_type) {
            self.types.push(record_type.to_string());
        }
        let list = self.by_type.entry(record_type.to_string()).or_default();
        list.push(declaration);
        Ok(&list[list.len() - 1])
    }

    /// Declarations for `record_type`, in registration order.
    pub fn declarations_for(&self, record_type: &str) -> &[Declaration] {
        self.by_type
            .get(record_type)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    /// Record types with at least one declaration, in registration order.
    pub fn record_types(&self) -> impl Iterator<Item = &str> {
        self.types.iter().map(String::as_str)
    }

    /// Total number of declarations.
    pub fn len(&self) -> usize {
        self.by_type.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.by_type.is_empty()
    }
}
