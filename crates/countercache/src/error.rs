//! Error types for the counter-cache engine.

use countercache_core::{RowId, TypeError};
use std::fmt;

/// Everything that can go wrong maintaining a counter cache.
///
/// `Unresolvable` paths and missing targets are not errors; they are
/// reported through [`crate::Resolution`] and [`crate::Applied`].
#[derive(Debug)]
pub enum Error {
    /// A declaration is malformed. Raised at registration time, or when a
    /// declaration that cannot be expressed in SQL is asked to recount.
    InvalidDeclaration(DeclarationError),
    /// A record value could not be used (non-numeric delta column).
    Type(TypeError),
    /// The host persistence layer failed; passed through unchanged.
    Persistence(countercache_core::Error),
    /// Recalculation could not lock its target rows in time.
    RecalculationConflict {
        table: String,
        id: Option<RowId>,
        source: countercache_core::Error,
    },
}

/// Details of a rejected declaration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeclarationError {
    /// Record type the declaration was registered for.
    pub record_type: String,
    pub message: String,
}

impl DeclarationError {
    pub fn new(record_type: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            record_type: record_type.into(),
            message: message.into(),
        }
    }
}

/// Result alias for setup-time operations.
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Can the caller retry the operation that produced this error?
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::RecalculationConflict { .. } => true,
            Error::Persistence(e) => e.is_retryable(),
            Error::InvalidDeclaration(_) | Error::Type(_) => false,
        }
    }
}

impl From<countercache_core::Error> for Error {
    fn from(e: countercache_core::Error) -> Self {
        match e {
            countercache_core::Error::Type(t) => Error::Type(t),
            other => Error::Persistence(other),
        }
    }
}

impl From<DeclarationError> for Error {
    fn from(e: DeclarationError) -> Self {
        Error::InvalidDeclaration(e)
    }
}

impl fmt::Display for DeclarationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.record_type, self.message)
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::InvalidDeclaration(e) => write!(f, "Invalid counter declaration for {}", e),
            Error::Type(e) => write!(f, "Type error: {}", e),
            Error::Persistence(e) => write!(f, "Persistence failure: {}", e),
            Error::RecalculationConflict { table, id, source } => match id {
                Some(id) => write!(
                    f,
                    "Recalculation conflict on {} row {}: {}",
                    table, id, source
                ),
                None => write!(f, "Recalculation conflict on {}: {}", table, source),
            },
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Persistence(e) | Error::RecalculationConflict { source: e, .. } => Some(e),
            Error::InvalidDeclaration(_) | Error::Type(_) => None,
        }
    }
}

impl std::error::Error for DeclarationError {}
