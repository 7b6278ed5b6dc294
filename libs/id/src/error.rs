//! Error types for identifier parsing and validation.

use thiserror::Error;

/// Errors that can occur when parsing or validating identifiers.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum IdError {
    /// The ID string is empty.
    #[error("ID cannot be empty")]
    Empty,

    /// The ID has an invalid prefix.
    #[error("invalid ID prefix: expected '{expected}', got '{actual}'")]
    InvalidPrefix {
        expected: &'static str,
        actual: String,
    },

    /// The ID is missing its separator.
    #[error("ID missing '{0}' separator")]
    MissingSeparator(char),

    /// The ULID portion of the ID is invalid.
    #[error("invalid ULID: {0}")]
    InvalidUlid(String),

    /// A slot index could not be parsed.
    #[error("invalid slot index '{0}'")]
    InvalidIndex(String),

    /// A name exceeds its length limit.
    #[error("name too long: {actual} characters (max {max})")]
    TooLong { max: usize, actual: usize },

    /// A name contains characters outside its allowed alphabet.
    #[error("invalid name '{value}': {reason}")]
    InvalidName { value: String, reason: &'static str },
}

impl IdError {
    /// Returns true if this error indicates the input was empty.
    pub fn is_empty(&self) -> bool {
        matches!(self, IdError::Empty)
    }

    /// Returns true if this error came from name validation.
    pub fn is_name_error(&self) -> bool {
        matches!(self, IdError::TooLong { .. } | IdError::InvalidName { .. })
    }
}
