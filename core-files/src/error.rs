use thiserror::Error;

/// Failures of file manager operations and worker transfers.
///
/// Errors are plain data (cloneable, comparable) because terminal worker
/// errors are fanned out to every subscriber of a file.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FileError {
    #[error("Local file is gone: {path}: {reason}")]
    LocalFileGone { path: String, reason: String },

    #[error("Remote location unavailable: {0}")]
    RemoteUnavailable(String),

    #[error("Remote location forbidden: {0}")]
    RemoteForbidden(String),

    #[error("Remote location not found: {0}")]
    RemoteNotFound(String),

    #[error("Generation failed: {0}")]
    GenerateFailed(String),

    #[error("Merge conflict: {0}")]
    MergeConflict(String),

    #[error("Invalid persistent id: {0}")]
    InvalidPersistentId(String),

    #[error("Unknown file handle {0}")]
    NotFoundHandle(i32),

    #[error("Store error: {0}")]
    Store(String),

    #[error("Filesystem error: {0}")]
    Filesystem(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Operation cancelled")]
    Cancelled,
}

pub type Result<T> = std::result::Result<T, FileError>;
