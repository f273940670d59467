//! Signed counter deltas.

use countercache_core::{TypeError, Value};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::{Add, AddAssign, Neg, Sub};

/// A signed amount added to a counter column.
///
/// Count caches and integer sums stay exact in `Int`; the first fractional
/// operand switches the result to `Float`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub enum Delta {
    Int(i64),
    Float(f64),
}

impl Delta {
    pub const ZERO: Delta = Delta::Int(0);

    /// Read a delta from a column value.
    ///
    /// NULL contributes nothing. Decimal and text values are parsed.
    pub fn from_value(value: &Value, column: &str) -> Result<Self, TypeError> {
        let parsed = match value {
            Value::Null => Some(Delta::ZERO),
            Value::Int(v) => Some(Delta::Int(i64::from(*v))),
            Value::BigInt(v) => Some(Delta::Int(*v)),
            Value::Double(v) => Some(Delta::Float(*v)),
            Value::Decimal(s) | Value::Text(s) => parse(s.trim()),
            Value::Bool(_) | Value::Bytes(_) | Value::Timestamp(_) => None,
        };
        parsed.ok_or_else(|| TypeError {
            expected: "numeric",
            actual: value.type_name().to_string(),
            column: Some(column.to_string()),
        })
    }

    pub fn is_zero(self) -> bool {
        match self {
            Delta::Int(v) => v == 0,
            Delta::Float(v) => v == 0.0,
        }
    }

    /// The delta as a bindable parameter.
    pub fn to_value(self) -> Value {
        match self {
            Delta::Int(v) => Value::BigInt(v),
            Delta::Float(v) => Value::Double(v),
        }
    }

    fn as_f64(self) -> f64 {
        match self {
            Delta::Int(v) => v as f64,
            Delta::Float(v) => v,
        }
    }
}

fn parse(s: &str) -> Option<Delta> {
    s.parse::<i64>()
        .map(Delta::Int)
        .ok()
        .or_else(|| s.parse::<f64>().ok().map(Delta::Float))
}

impl Default for Delta {
    fn default() -> Self {
        Delta::ZERO
    }
}

impl From<i64> for Delta {
    fn from(v: i64) -> Self {
        Delta::Int(v)
    }
}

impl Add for Delta {
    type Output = Delta;

    fn add(self, rhs: Delta) -> Delta {
        match (self, rhs) {
            (Delta::Int(a), Delta::Int(b)) => a
                .checked_add(b)
                .map_or_else(|| Delta::Float(a as f64 + b as f64), Delta::Int),
            (a, b) => Delta::Float(a.as_f64() + b.as_f64()),
        }
    }
}

impl AddAssign for Delta {
    fn add_assign(&mut self, rhs: Delta) {
        *self = *self + rhs;
    }
}

impl Neg for Delta {
    type Output = Delta;

    fn neg(self) -> Delta {
        match self {
            Delta::Int(v) => v
                .checked_neg()
                .map_or_else(|| Delta::Float(-(v as f64)), Delta::Int),
            Delta::Float(v) => Delta::Float(-v),
        }
    }
}

impl Sub for Delta {
    type Output = Delta;

    fn sub(self, rhs: Delta) -> Delta {
        self + -rhs
    }
}

impl PartialEq for Delta {
    fn eq(&self, other: &Delta) -> bool {
        match (self, other) {
            (Delta::Int(a), Delta::Int(b)) => a == b,
            (a, b) => a.as_f64() == b.as_f64(),
        }
    }
}

impl fmt::Display for Delta {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Delta::Int(v) => write!(f, "{}", v),
            Delta::Float(v) => write!(f, "{}", v),
        }
    }
}
