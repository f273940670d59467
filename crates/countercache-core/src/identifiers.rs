//! SQL identifier quoting and validation utilities.

use regex::Regex;
use std::sync::OnceLock;

/// Quote a SQL identifier using ANSI double-quoting.
///
/// Embedded double-quotes are escaped by doubling them (`"` → `""`).
///
/// # Examples
///
/// ```
/// use countercache_core::quote_ident;
///
/// assert_eq!(quote_ident("posts"), "\"posts\"");
/// assert_eq!(quote_ident("odd\"name"), "\"odd\"\"name\"");
/// ```
#[inline]
pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Quote a SQL identifier using MySQL backtick quoting.
///
/// ```
/// use countercache_core::quote_ident_mysql;
///
/// assert_eq!(quote_ident_mysql("posts"), "`posts`");
/// ```
#[inline]
pub fn quote_ident_mysql(name: &str) -> String {
    format!("`{}`", name.replace('`', "``"))
}

fn identifier_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^[A-Za-z_][A-Za-z0-9_]{0,62}$").expect("identifier pattern is valid")
    })
}

/// Check that a name is a plain SQL identifier.
///
/// Declarations only accept plain identifiers (letters, digits, underscore,
/// not starting with a digit, at most 63 characters) for tables and
/// columns, so names stay portable across dialects.
///
/// ```
/// use countercache_core::is_valid_identifier;
///
/// assert!(is_valid_identifier("comments_count"));
/// assert!(!is_valid_identifier("1st"));
/// assert!(!is_valid_identifier("a;DROP TABLE posts"));
/// ```
pub fn is_valid_identifier(name: &str) -> bool {
    identifier_pattern().is_match(name)
}
