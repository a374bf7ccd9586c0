//! Project error types

use tandem_core::FileKind;
use tandem_scene::SceneError;
use tandem_storage::StorageError;
use thiserror::Error;

/// Coarse error category shown to the editor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    NotFound,
    InvalidOperation,
    ParseError,
    TypeMismatch,
    IoFailure,
    Other,
}

#[derive(Error, Debug)]
pub enum ProjectError {
    #[error(transparent)]
    Core(#[from] tandem_core::Error),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Scene(#[from] SceneError),

    #[error("Branch not found: {0}")]
    BranchNotFound(String),

    #[error("Invalid operation: {0}")]
    InvalidOperation(String),

    #[error("Type mismatch for {path}: stored {stored}, found {found}")]
    TypeMismatch {
        path: String,
        stored: FileKind,
        found: FileKind,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Config error: {0}")]
    Config(String),

    #[error("Watcher error: {0}")]
    Watch(#[from] notify::Error),

    #[error("Background task failed: {0}")]
    Task(String),
}

impl ProjectError {
    pub fn invalid(message: impl Into<String>) -> Self {
        ProjectError::InvalidOperation(message.into())
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            ProjectError::Core(e) => core_kind(e),
            ProjectError::Storage(e) => match e {
                StorageError::NotFound(_) => ErrorKind::NotFound,
                StorageError::Io(_) | StorageError::Database(_) => ErrorKind::IoFailure,
                StorageError::Core(e) => core_kind(e),
                StorageError::Serialization(_) | StorageError::Corrupt { .. } => ErrorKind::Other,
            },
            ProjectError::Scene(e) => match e {
                SceneError::Parse { .. } => ErrorKind::ParseError,
                SceneError::NodeNotFound(_) => ErrorKind::NotFound,
                SceneError::InvalidEdit(_) => ErrorKind::InvalidOperation,
            },
            ProjectError::BranchNotFound(_) => ErrorKind::NotFound,
            ProjectError::InvalidOperation(_) => ErrorKind::InvalidOperation,
            ProjectError::TypeMismatch { .. } => ErrorKind::TypeMismatch,
            ProjectError::Io(_) | ProjectError::Watch(_) => ErrorKind::IoFailure,
            ProjectError::Config(_) => ErrorKind::ParseError,
            ProjectError::Task(_) => ErrorKind::Other,
        }
    }
}

fn core_kind(e: &tandem_core::Error) -> ErrorKind {
    use tandem_core::Error;
    match e {
        Error::NotFound(_) => ErrorKind::NotFound,
        Error::InvalidOperation(_) | Error::DocumentExists(_) => ErrorKind::InvalidOperation,
        Error::Parse(_) | Error::InvalidPath(_) | Error::InvalidDocumentId(_) => {
            ErrorKind::ParseError
        }
        Error::TypeMismatch { .. } => ErrorKind::TypeMismatch,
        Error::Io(_) => ErrorKind::IoFailure,
        Error::Serialization(_) | Error::CorruptChange(_) => ErrorKind::Other,
    }
}

/// Result type for project operations
pub type ProjectResult<T> = Result<T, ProjectError>;
