use std::io;
use thiserror::Error;

/// Operation kind passed to the permission collaborator and carried in
/// [`StorageError::PermissionDenied`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Read,
    Write,
    Delete,
}

impl Operation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Read => "read",
            Self::Write => "write",
            Self::Delete => "delete",
        }
    }
}

impl std::fmt::Display for Operation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("object `{key}` not found")]
    NotFound { key: String },
    #[error("{operation} on `{key}` denied")]
    PermissionDenied { key: String, operation: Operation },
    #[error("invalid object key: {0}")]
    InvalidKey(String),
    #[error("backend `{backend}` could not serve `{key}`")]
    BackendUnavailable { key: String, backend: String },
    #[error("compression failed: {0}")]
    Compression(String),
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error("storage manager is shut down")]
    Shutdown,
    #[error(transparent)]
    Metadata(#[from] sqlx::Error),
    #[error(transparent)]
    Serialization(#[from] serde_json::Error),
    #[error(transparent)]
    Io(#[from] io::Error),
}

impl StorageError {
    pub fn not_found(key: impl Into<String>) -> Self {
        Self::NotFound { key: key.into() }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}

pub type StorageResult<T> = Result<T, StorageError>;
