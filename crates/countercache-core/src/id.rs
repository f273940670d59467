//! Row identifiers.

use crate::value::Value;
use serde::{Deserialize, Serialize};
use std::fmt;

/// The primary-key value of a single row.
///
/// Unlike [`Value`], identifiers are hashable and totally ordered, so they
/// can key pending-delta maps and drive ordered recalculation pages.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum RowId {
    /// Integer primary key
    Int(i64),
    /// Text primary key (UUID strings, slugs)
    Text(String),
}

impl RowId {
    /// Convert a column value into an identifier.
    ///
    /// Returns `None` for NULL and for values that cannot identify a row
    /// (booleans, blobs, fractional numbers).
    pub fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::Int(v) => Some(RowId::Int(i64::from(*v))),
            Value::BigInt(v) => Some(RowId::Int(*v)),
            Value::Decimal(s) => s.parse().ok().map(RowId::Int),
            Value::Double(v) if v.fract() == 0.0 => Some(RowId::Int(*v as i64)),
            Value::Text(s) => Some(RowId::Text(s.clone())),
            _ => None,
        }
    }

    /// The identifier as a bindable parameter.
    pub fn to_value(&self) -> Value {
        match self {
            RowId::Int(v) => Value::BigInt(*v),
            RowId::Text(s) => Value::Text(s.clone()),
        }
    }
}

impl From<i64> for RowId {
    fn from(v: i64) -> Self {
        RowId::Int(v)
    }
}

impl From<&str> for RowId {
    fn from(v: &str) -> Self {
        RowId::Text(v.to_string())
    }
}

impl fmt::Display for RowId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RowId::Int(v) => write!(f, "{}", v),
            RowId::Text(s) => write!(f, "{}", s),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_null_is_not_an_identifier() {
        assert_eq!(RowId::from_value(&Value::Null), None);
        assert_eq!(RowId::from_value(&Value::Bool(true)), None);
        assert_eq!(RowId::from_value(&Value::Double(1.5)), None);
    }

    #[test]
    fn test_integer_widths_collapse() {
        assert_eq!(RowId::from_value(&Value::Int(4)), Some(RowId::Int(4)));
        assert_eq!(RowId::from_value(&Value::BigInt(4)), Some(RowId::Int(4)));
        assert_eq!(RowId::from_value(&Value::Double(4.0)), Some(RowId::Int(4)));
    }

    #[test]
    fn test_ordering_is_numeric_for_ints() {
        let mut ids = vec![RowId::Int(10), RowId::Int(2), RowId::Int(33)];
        ids.sort();
        assert_eq!(ids, [RowId::Int(2), RowId::Int(10), RowId::Int(33)]);
    }

    #[test]
    fn test_to_value() {
        assert_eq!(RowId::Int(9).to_value(), Value::BigInt(9));
        assert_eq!(RowId::from("abc").to_value(), Value::Text("abc".into()));
        assert_eq!(RowId::Int(9).to_string(), "9");
    }
}
