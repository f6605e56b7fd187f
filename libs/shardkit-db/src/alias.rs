//! Backend alias normalization.
//!
//! Aliases are case- and surrounding-whitespace-insensitive. Every alias that
//! enters the registry or leaves the router goes through [`normalize_alias`].

use crate::{DbError, Result};

/// Trim and lowercase an alias.
///
/// Idempotent: `normalize_alias(&normalize_alias(s)) == normalize_alias(s)`.
#[must_use]
pub fn normalize_alias(alias: &str) -> String {
    alias.trim().to_lowercase()
}

/// Normalize an alias and reject it if nothing is left.
///
/// # Errors
/// Returns `DbError::InvalidAlias` for blank input.
pub fn validate_alias(alias: &str) -> Result<String> {
    let normalized = normalize_alias(alias);
    if normalized.is_empty() {
        return Err(DbError::InvalidAlias(alias.to_owned()));
    }
    Ok(normalized)
}
