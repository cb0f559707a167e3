//! File Handles & Subscriber Callbacks
//!
//! A [`FileId`] is the stable externally-visible identity of a file. Handles
//! are indices into the manager's handle table; they never change once issued,
//! even when the nodes behind them are unified by a merge: the table entry is
//! redirected instead. Ids are never reused within a manager instance.
//!
//! Each handle carries its own request state ([`FileIdInfo`]): download and
//! upload priorities, callbacks, a pin flag, and an upload ordering token.
//! Many handles can point at the same node; worker progress fans out to every
//! handle whose priority for the matching kind is non-zero.

use std::fmt;
use std::sync::Arc;

use bridge_traits::{UploadedEncryptedFile, UploadedFile};

use crate::error::FileError;

/// Stable, externally visible file identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct FileId(pub i32);

impl FileId {
    pub fn empty() -> Self {
        Self(0)
    }

    pub fn is_valid(self) -> bool {
        self.0 > 0
    }
}

impl fmt::Display for FileId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Internal index of a file node. Not exposed outside the crate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct FileNodeId(pub(crate) usize);

/// Subscriber interface for download progress and completion.
///
/// Callbacks are invoked inline on the manager's thread and must not block.
/// For a given handle, progress is observed in issue order and is followed by
/// exactly one terminal `on_download_ok` or `on_download_error`.
pub trait DownloadCallback: Send + Sync {
    fn on_progress(&self, _file_id: FileId) {}

    fn on_download_ok(&self, file_id: FileId);

    fn on_download_error(&self, file_id: FileId, error: FileError);
}

/// Subscriber interface for upload progress and completion.
///
/// After `on_upload_ok` further uploads of the file are paused until
/// `resume_upload`, `delete_partial_remote_location`, an explicit `upload` on
/// the same handle, or a merge that changes the file's remote location.
pub trait UploadCallback: Send + Sync {
    fn on_progress(&self, _file_id: FileId) {}

    fn on_upload_ok(&self, file_id: FileId, file: UploadedFile);

    fn on_upload_encrypted_ok(&self, file_id: FileId, file: UploadedEncryptedFile);

    fn on_upload_error(&self, file_id: FileId, error: FileError);
}

/// Per-handle request state.
pub(crate) struct FileIdInfo {
    pub node_id: FileNodeId,
    /// Whether user-visible updates of this file should be broadcast. Set
    /// once the file object has been handed to the application.
    pub send_updates: bool,
    /// Pinned handles are never forgotten, even without callbacks or
    /// priority.
    pub pinned: bool,
    /// Whether this handle was forgotten; a forgotten handle no longer
    /// resolves.
    pub forgotten: bool,

    pub download_priority: i8,
    pub upload_priority: i8,
    pub upload_order: u64,

    pub download_callback: Option<Arc<dyn DownloadCallback>>,
    pub upload_callback: Option<Arc<dyn UploadCallback>>,
}

impl FileIdInfo {
    pub fn new(node_id: FileNodeId) -> Self {
        Self {
            node_id,
            send_updates: false,
            pinned: false,
            forgotten: false,
            download_priority: 0,
            upload_priority: 0,
            upload_order: 0,
            download_callback: None,
            upload_callback: None,
        }
    }

    /// A handle with no callbacks, no priority, and no pin may be forgotten.
    pub fn is_forgettable(&self) -> bool {
        !self.pinned
            && self.download_priority == 0
            && self.upload_priority == 0
            && self.download_callback.is_none()
            && self.upload_callback.is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_file_id_validity() {
        assert!(!FileId::empty().is_valid());
        assert!(!FileId(-1).is_valid());
        assert!(FileId(1).is_valid());
    }

    #[test]
    fn test_fresh_info_is_forgettable() {
        let info = FileIdInfo::new(FileNodeId(0));
        assert!(info.is_forgettable());
    }

    #[test]
    fn test_pinned_info_is_not_forgettable() {
        let mut info = FileIdInfo::new(FileNodeId(0));
        info.pinned = true;
        assert!(!info.is_forgettable());
    }

    #[test]
    fn test_prioritized_info_is_not_forgettable() {
        let mut info = FileIdInfo::new(FileNodeId(0));
        info.download_priority = 3;
        assert!(!info.is_forgettable());
    }
}
