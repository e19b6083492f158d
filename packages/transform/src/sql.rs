//! SQL identifier validation.
//!
//! Table and column names come from configuration and are interpolated
//! into statements, so they are restricted to plain identifiers and always
//! emitted double-quoted.

use crate::TransformError;

/// Validates that `name` is a plain SQL identifier
/// (`[A-Za-z_][A-Za-z0-9_]*`, at most 63 bytes).
///
/// # Errors
///
/// Returns [`TransformError::InvalidIdentifier`] otherwise.
pub fn validate_identifier(name: &str) -> Result<(), TransformError> {
    let mut chars = name.chars();
    let valid_start = chars
        .next()
        .is_some_and(|c| c.is_ascii_alphabetic() || c == '_');
    let valid_rest = chars.all(|c| c.is_ascii_alphanumeric() || c == '_');

    if valid_start && valid_rest && name.len() <= 63 {
        Ok(())
    } else {
        Err(TransformError::InvalidIdentifier {
            name: name.to_string(),
        })
    }
}

/// Double-quotes an identifier that has passed [`validate_identifier`].
#[must_use]
pub fn quote_ident(name: &str) -> String {
    format!("\"{name}\"")
}
