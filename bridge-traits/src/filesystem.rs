//! File System Access Trait
//!
//! The slice of host filesystem the file manager needs: existence and metadata
//! checks for validating registered local paths, whole-file reads for
//! `get_content`, writes for `set_content` fallbacks, and deletion for
//! `delete_file`. Byte streaming for transfers lives in the workers, not here.

use bytes::Bytes;
use std::path::Path;

use crate::error::Result;

/// Metadata of one local file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileStat {
    pub size: i64,
    pub mtime_nsec: i64,
    pub is_directory: bool,
}

#[async_trait::async_trait]
pub trait FileSystemAccess: Send + Sync {
    /// Check if a path exists.
    async fn exists(&self, path: &Path) -> Result<bool>;

    /// Get size and modification time of a file. Errors if the path is
    /// missing or unreadable.
    async fn stat(&self, path: &Path) -> Result<FileStat>;

    /// Read entire file contents into memory.
    async fn read_file(&self, path: &Path) -> Result<Bytes>;

    /// Write data to a file, creating it if it doesn't exist.
    async fn write_file(&self, path: &Path, data: Bytes) -> Result<()>;

    /// Delete a file.
    async fn delete_file(&self, path: &Path) -> Result<()>;
}
