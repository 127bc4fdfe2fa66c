//! Wildcard key patterns.
//!
//! Cache keys are opaque strings and `*` is the only special character in a
//! pattern: it matches any substring, including the empty one.

use crate::error::{Result, ThrottlerError};
use regex::Regex;

pub const WILDCARD: char = '*';

pub fn is_pattern(key: &str) -> bool {
    key.contains(WILDCARD)
}

/// Compile a `*` glob into an anchored regex.
pub fn compile(pattern: &str) -> Result<Regex> {
    let body = pattern
        .split(WILDCARD)
        .map(regex::escape)
        .collect::<Vec<_>>()
        .join(".*");

    Regex::new(&format!("^{}$", body))
        .map_err(|e| ThrottlerError::Validation(format!("Invalid key pattern '{}': {}", pattern, e)))
}

/// Translate a `*` glob into Redis' glob dialect, escaping the metacharacters
/// Redis would otherwise interpret.
pub fn to_redis_glob(pattern: &str) -> String {
    let mut out = String::with_capacity(pattern.len());
    for c in pattern.chars() {
        match c {
            '?' | '[' | ']' | '\\' | '^' => {
                out.push('\\');
                out.push(c);
            }
            _ => out.push(c),
        }
    }
    out
}
