//! Scene error types

use thiserror::Error;

/// Errors raised while parsing or editing scene text
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SceneError {
    #[error("Parse error at line {line}: {message}")]
    Parse { line: usize, message: String },

    #[error("Node not found: {0}")]
    NodeNotFound(String),

    #[error("Invalid edit: {0}")]
    InvalidEdit(String),
}

impl SceneError {
    pub fn parse(line: usize, message: impl Into<String>) -> Self {
        SceneError::Parse {
            line,
            message: message.into(),
        }
    }
}

/// Result type for scene operations
pub type SceneResult<T> = Result<T, SceneError>;
