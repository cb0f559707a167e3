//! File Views & Public File Objects
//!
//! [`FileView`] is an owned snapshot of one node taken at a message boundary;
//! it answers every "what do we know about this file" question without holding
//! a borrow into the manager. [`FileObject`] is the flattened record handed to
//! the application layer.

use bridge_traits::{
    ChatId, EncryptionKey, FileType, FullGenerateFileLocation, FullLocalFileLocation,
    FullRemoteFileLocation, GenerateFileLocation, LocalFileLocation, RemoteFileLocation,
};
use serde::Serialize;

use crate::handle::FileId;

/// Snapshot of everything known about one file.
#[derive(Debug, Clone)]
pub struct FileView {
    pub(crate) file_id: FileId,
    pub(crate) local: LocalFileLocation,
    pub(crate) remote: RemoteFileLocation,
    pub(crate) generate: GenerateFileLocation,
    pub(crate) size: i64,
    pub(crate) expected_size: i64,
    pub(crate) name: String,
    pub(crate) url: String,
    pub(crate) owner_id: ChatId,
    pub(crate) encryption_key: EncryptionKey,
    pub(crate) get_by_hash: bool,
    pub(crate) is_downloading: bool,
    pub(crate) is_uploading: bool,
    pub(crate) local_ready_size: i64,
    pub(crate) remote_ready_size: i64,
    pub(crate) file_type_hint: FileType,
}

impl FileView {
    /// The main handle of the underlying node.
    pub fn file_id(&self) -> FileId {
        self.file_id
    }

    pub fn has_local_location(&self) -> bool {
        self.local.is_full()
    }

    pub fn local_location(&self) -> Option<&FullLocalFileLocation> {
        self.local.full()
    }

    pub fn has_remote_location(&self) -> bool {
        self.remote.is_full()
    }

    pub fn remote_location(&self) -> Option<&FullRemoteFileLocation> {
        self.remote.full()
    }

    pub fn has_generate_location(&self) -> bool {
        self.generate.is_full()
    }

    pub fn generate_location(&self) -> Option<&FullGenerateFileLocation> {
        self.generate.full()
    }

    pub fn has_url(&self) -> bool {
        !self.url.is_empty()
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn owner_id(&self) -> ChatId {
        self.owner_id
    }

    pub fn get_by_hash(&self) -> bool {
        self.get_by_hash
    }

    pub fn size(&self) -> i64 {
        self.size
    }

    pub fn expected_size(&self) -> i64 {
        if self.size != 0 {
            self.size
        } else {
            self.expected_size
        }
    }

    /// Whether a download or generation is currently producing the local copy.
    pub fn is_downloading(&self) -> bool {
        self.is_downloading
    }

    /// Bytes of the local copy ready so far.
    pub fn local_size(&self) -> i64 {
        if self.local.is_full() {
            self.size
        } else {
            self.local_ready_size
        }
    }

    pub fn is_uploading(&self) -> bool {
        self.is_uploading
    }

    /// Bytes acknowledged by the server so far.
    pub fn remote_size(&self) -> i64 {
        if self.remote.is_full() {
            self.size
        } else {
            self.remote_ready_size
        }
    }

    /// Path of the local copy, full or partial.
    pub fn path(&self) -> Option<&str> {
        self.local.path()
    }

    pub fn can_download_from_server(&self) -> bool {
        self.remote.is_full()
    }

    pub fn can_generate(&self) -> bool {
        self.generate.is_full()
    }

    pub fn can_delete(&self) -> bool {
        !self.local.is_empty()
    }

    pub fn file_type(&self) -> FileType {
        self.local
            .file_type()
            .or_else(|| self.remote.file_type())
            .or_else(|| self.generate.file_type())
            .unwrap_or(self.file_type_hint)
    }

    pub fn is_encrypted(&self) -> bool {
        self.file_type().is_encrypted()
    }

    pub fn encryption_key(&self) -> &EncryptionKey {
        &self.encryption_key
    }
}

/// Local side of a public file record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LocalFileObject {
    pub path: String,
    pub can_be_downloaded: bool,
    pub can_be_deleted: bool,
    pub is_downloading_active: bool,
    pub is_downloading_completed: bool,
    pub downloaded_size: i64,
}

/// Remote side of a public file record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RemoteFileObject {
    /// Versioned URL-safe token for the server reference; empty while the
    /// file has no full remote location.
    pub persistent_id: String,
    pub is_uploading_active: bool,
    pub is_uploading_completed: bool,
    pub uploaded_size: i64,
}

/// The file record handed to the application layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FileObject {
    pub id: i32,
    pub file_type: FileType,
    pub size: i64,
    pub expected_size: i64,
    pub local: LocalFileObject,
    pub remote: RemoteFileObject,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_view() -> FileView {
        FileView {
            file_id: FileId(1),
            local: LocalFileLocation::Empty,
            remote: RemoteFileLocation::Full(FullRemoteFileLocation {
                file_type: FileType::Video,
                server_id: 5,
                access_hash: 6,
            }),
            generate: GenerateFileLocation::Empty,
            size: 0,
            expected_size: 2048,
            name: "clip.mp4".to_string(),
            url: String::new(),
            owner_id: ChatId(0),
            encryption_key: EncryptionKey::empty(),
            get_by_hash: false,
            is_downloading: false,
            is_uploading: false,
            local_ready_size: 0,
            remote_ready_size: 0,
            file_type_hint: FileType::Temp,
        }
    }

    #[test]
    fn test_expected_size_prefers_authoritative_size() {
        let mut view = sample_view();
        assert_eq!(view.expected_size(), 2048);
        view.size = 4096;
        assert_eq!(view.expected_size(), 4096);
    }

    #[test]
    fn test_type_comes_from_remote_when_local_is_empty() {
        let view = sample_view();
        assert_eq!(view.file_type(), FileType::Video);
        assert!(view.can_download_from_server());
        assert!(!view.can_generate());
        assert!(!view.can_delete());
    }
}
