//! User identifiers accepted at the ingestion boundary.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Longest identifier accepted by the ingestion endpoint, in bytes.
pub const MAX_IDENTIFIER_LEN: usize = 1024;

/// Reasons an identifier is rejected before it reaches the queue
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum IdentifierError {
    #[error("Identifier is empty")]
    Empty,

    #[error("Identifier exceeds {max} bytes (got {len})")]
    TooLong { len: usize, max: usize },

    #[error("Identifier contains control characters")]
    ControlCharacter,
}

/// Opaque user token. Equality is exact string equality.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Identifier(String);

impl Identifier {
    /// Validate a raw identifier string
    pub fn parse(raw: impl Into<String>) -> Result<Self, IdentifierError> {
        let raw = raw.into();

        if raw.trim().is_empty() {
            return Err(IdentifierError::Empty);
        }
        if raw.len() > MAX_IDENTIFIER_LEN {
            return Err(IdentifierError::TooLong {
                len: raw.len(),
                max: MAX_IDENTIFIER_LEN,
            });
        }
        if raw.chars().any(char::is_control) {
            return Err(IdentifierError::ControlCharacter);
        }

        Ok(Self(raw))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Identifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for Identifier {
    fn as_ref(&self) -> &str {
        &self.0
    }
}
