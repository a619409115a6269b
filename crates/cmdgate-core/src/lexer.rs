//! Shell-style splitting of command text into argument words.

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("failed to parse arguments: {0}")]
pub struct TokenizeError(pub String);

/// Split `text` the way a POSIX shell would, honoring single quotes, double
/// quotes and backslash escapes.
pub fn tokenize(text: &str) -> Result<Vec<String>, TokenizeError> {
    shell_words::split(text).map_err(|e| TokenizeError(e.to_string()))
}
