//! Textual gate for the arbitrary read-only query operation.
//!
//! This is a conservative token scan, not a SQL parser: comments are
//! stripped, the statement must open with a read-only clause keyword, and no
//! mutating/DDL keyword may appear anywhere as a whole word.

use regex::Regex;
use std::sync::LazyLock;

static LINE_COMMENT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"--[^\n]*").expect("line comment pattern"));
static BLOCK_COMMENT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)/\*.*?\*/").expect("block comment pattern"));
static WORD: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b[A-Z_]+\b").expect("word pattern"));

const DENYLIST: &[&str] = &[
    "INSERT", "UPDATE", "DELETE", "DROP", "ALTER", "CREATE", "TRUNCATE", "EXEC", "EXECUTE",
    "MERGE", "GRANT", "REVOKE",
];

/// Check that `query` is a plain read-only statement.
///
/// Returns the rejection reason on failure; the caller reports it as a
/// structured error observation and never executes the statement.
pub fn check_read_only(query: &str) -> std::result::Result<(), String> {
    let normalized = LINE_COMMENT.replace_all(query, "");
    let normalized = BLOCK_COMMENT.replace_all(&normalized, "");
    let normalized = normalized.trim().to_uppercase();

    if !normalized.starts_with("SELECT") && !normalized.starts_with("WITH") {
        return Err("only SELECT queries are allowed".to_string());
    }

    for token in WORD.find_iter(&normalized) {
        let token = token.as_str();
        if DENYLIST.contains(&token) {
            return Err(format!("forbidden keyword: {token}"));
        }
    }

    Ok(())
}
