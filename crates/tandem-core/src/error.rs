//! Error types for Tandem Core

use thiserror::Error;

/// Core error types
#[derive(Error, Debug)]
pub enum Error {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid operation: {0}")]
    InvalidOperation(String),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Type mismatch for {path}: stored {stored}, found {found}")]
    TypeMismatch {
        path: String,
        stored: String,
        found: String,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid document ID: {0}")]
    InvalidDocumentId(String),

    #[error("Invalid path: {0}")]
    InvalidPath(String),

    #[error("Document already exists: {0}")]
    DocumentExists(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Change {0} failed hash verification")]
    CorruptChange(String),
}

impl Error {
    /// Shorthand for a missing document
    pub fn document_not_found(id: impl std::fmt::Display) -> Self {
        Error::NotFound(format!("document {}", id))
    }
}

/// Result type alias for Tandem Core operations
pub type Result<T> = std::result::Result<T, Error>;
