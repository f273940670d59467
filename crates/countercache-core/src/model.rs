//! Model trait for mapping host structs to table rows.
//!
//! Hosts that already describe their records as structs implement
//! [`Model`] so snapshots can be captured without hand-assembling column
//! maps.

use crate::value::Value;

/// A struct that maps to one row of a database table.
pub trait Model {
    /// The table this model is stored in.
    const TABLE_NAME: &'static str;

    /// Primary key column name.
    const PRIMARY_KEY: &'static str = "id";

    /// Column values of this instance, as stored.
    fn to_row(&self) -> Vec<(&'static str, Value)>;
}
