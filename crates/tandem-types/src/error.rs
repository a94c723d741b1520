use thiserror::Error;

/// Errors produced by type operations.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum TypeError {
    #[error("invalid storage key '{key}': {reason}")]
    InvalidStorageKey { key: String, reason: String },

    #[error("not a reference-mode storage key: {0}")]
    NotReferenceMode(String),
}
