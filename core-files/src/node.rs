//! File Node
//!
//! The authoritative in-memory record for one logical file: three tiered
//! locations, sizes, naming, ownership, encryption key, worker slots, and the
//! two dirty channels (`info` for user-visible changes, `pmc` for the durable
//! record). Nodes are created by the registry, mutated only through the
//! manager, and destroyed only by a merge.

use bridge_traits::{
    ChatId, EncryptionKey, FileDbId, FileType, GenerateFileLocation, LocalFileLocation,
    LocationSource, QueryId, RemoteFileLocation,
};

use crate::handle::FileId;

pub(crate) struct FileNode {
    pub local: LocalFileLocation,
    pub remote: RemoteFileLocation,
    pub generate: GenerateFileLocation,

    /// Authoritative total size in bytes, 0 if unknown.
    pub size: i64,
    /// Best-effort estimate used before `size` is known.
    pub expected_size: i64,

    pub name: String,
    pub url: String,
    pub owner_id: ChatId,
    pub encryption_key: EncryptionKey,
    pub pmc_id: FileDbId,

    /// Every live handle pointing at this node. Nonempty for a live node.
    pub file_ids: Vec<FileId>,
    /// The canonical handle returned by public queries.
    pub main_file_id: FileId,
    /// The priority at which the main handle was elected.
    pub main_file_id_priority: i8,

    pub remote_source: LocationSource,
    /// Declared type for nodes whose locations don't carry one yet.
    pub file_type_hint: FileType,

    pub local_ready_size: i64,
    pub remote_ready_size: i64,

    // One in-flight worker query per kind; zero means the slot is free.
    pub download_query: QueryId,
    pub upload_query: QueryId,
    pub generate_query: QueryId,

    // Last priority commanded to each worker; zero when no worker runs.
    pub download_priority: i8,
    pub upload_priority: i8,
    pub generate_priority: i8,

    /// Handle whose completed upload pauses further uploads until resumed.
    pub upload_pause: Option<FileId>,
    /// Part indices to resend on the next upload start.
    pub pending_bad_parts: Vec<i32>,

    pub get_by_hash: bool,
    pub is_download_started: bool,
    pub generate_was_update: bool,
    /// The store could not be consulted when this node was registered; a
    /// sync view forces the lookup.
    pub need_load_from_store: bool,

    pub pmc_dirty: bool,
    pub info_dirty: bool,

    // Which store indices gained a key since the last successful flush.
    pub new_local_key: bool,
    pub new_remote_key: bool,
    pub new_generate_key: bool,
}

impl FileNode {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        local: LocalFileLocation,
        remote: RemoteFileLocation,
        remote_source: LocationSource,
        generate: GenerateFileLocation,
        size: i64,
        expected_size: i64,
        name: String,
        url: String,
        owner_id: ChatId,
        encryption_key: EncryptionKey,
        file_type_hint: FileType,
    ) -> Self {
        Self {
            local,
            remote,
            generate,
            size,
            expected_size,
            name,
            url,
            owner_id,
            encryption_key,
            pmc_id: FileDbId(0),
            file_ids: Vec::new(),
            main_file_id: FileId::empty(),
            main_file_id_priority: 0,
            remote_source,
            file_type_hint,
            local_ready_size: 0,
            remote_ready_size: 0,
            download_query: QueryId(0),
            upload_query: QueryId(0),
            generate_query: QueryId(0),
            download_priority: 0,
            upload_priority: 0,
            generate_priority: 0,
            upload_pause: None,
            pending_bad_parts: Vec::new(),
            get_by_hash: false,
            is_download_started: false,
            generate_was_update: false,
            need_load_from_store: false,
            pmc_dirty: false,
            info_dirty: false,
            new_local_key: false,
            new_remote_key: false,
            new_generate_key: false,
        }
    }

    /// The file's type, from the first location that knows it.
    pub fn file_type(&self) -> FileType {
        self.local
            .file_type()
            .or_else(|| self.remote.file_type())
            .or_else(|| self.generate.file_type())
            .unwrap_or(self.file_type_hint)
    }

    pub fn set_local_location(&mut self, local: LocalFileLocation, ready_size: i64) {
        if self.local_ready_size != ready_size {
            self.local_ready_size = ready_size;
            self.on_info_changed();
        }
        if self.local != local {
            self.local = local;
            self.on_changed();
        }
    }

    pub fn set_remote_location(
        &mut self,
        remote: RemoteFileLocation,
        source: LocationSource,
        ready_size: i64,
    ) {
        if self.remote_ready_size != ready_size {
            self.remote_ready_size = ready_size;
            self.on_info_changed();
        }
        if self.remote != remote {
            self.remote = remote;
            self.remote_source = source;
            self.on_changed();
        } else if source > self.remote_source {
            self.remote_source = source;
            self.on_pmc_changed();
        }
    }

    pub fn set_generate_location(&mut self, generate: GenerateFileLocation) {
        if self.generate != generate {
            self.generate = generate;
            self.on_pmc_changed();
        }
    }

    pub fn set_size(&mut self, size: i64) {
        if self.size != size {
            self.size = size;
            self.on_changed();
        }
    }

    pub fn set_expected_size(&mut self, expected_size: i64) {
        if self.expected_size != expected_size {
            self.expected_size = expected_size;
            self.on_info_changed();
        }
    }

    pub fn set_name(&mut self, name: String) {
        if self.name != name {
            self.name = name;
            self.on_pmc_changed();
        }
    }

    pub fn set_url(&mut self, url: String) {
        if self.url != url {
            self.url = url;
            self.on_pmc_changed();
        }
    }

    pub fn set_owner_id(&mut self, owner_id: ChatId) {
        if self.owner_id != owner_id {
            self.owner_id = owner_id;
            self.on_pmc_changed();
        }
    }

    /// Sets the encryption key. Fails (returns false) when a different key is
    /// already present.
    pub fn set_encryption_key(&mut self, key: EncryptionKey) -> bool {
        if self.encryption_key.is_empty() {
            self.encryption_key = key;
            self.on_pmc_changed();
            true
        } else {
            self.encryption_key == key
        }
    }

    /// Something both user-visible and durable changed.
    pub fn on_changed(&mut self) {
        self.on_info_changed();
        self.on_pmc_changed();
    }

    pub fn on_info_changed(&mut self) {
        self.info_dirty = true;
    }

    pub fn on_pmc_changed(&mut self) {
        self.pmc_dirty = true;
    }

    /// Whether the node carries anything worth writing to the store.
    pub fn has_persistent_key(&self) -> bool {
        self.local.is_full() || self.remote.is_full() || self.generate.is_full()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bridge_traits::{FullLocalFileLocation, FullRemoteFileLocation};

    fn empty_node() -> FileNode {
        FileNode::new(
            LocalFileLocation::Empty,
            RemoteFileLocation::Empty,
            LocationSource::None,
            GenerateFileLocation::Empty,
            0,
            0,
            String::new(),
            String::new(),
            ChatId(0),
            EncryptionKey::empty(),
            FileType::Temp,
        )
    }

    #[test]
    fn test_set_local_location_marks_both_channels_dirty() {
        let mut node = empty_node();
        node.set_local_location(
            LocalFileLocation::Full(FullLocalFileLocation {
                file_type: FileType::Document,
                path: "/tmp/a.bin".to_string(),
                mtime_nsec: 1,
            }),
            100,
        );
        assert!(node.info_dirty);
        assert!(node.pmc_dirty);
        assert_eq!(node.local_ready_size, 100);
    }

    #[test]
    fn test_same_location_does_not_dirty_pmc() {
        let mut node = empty_node();
        node.set_local_location(LocalFileLocation::Empty, 0);
        assert!(!node.pmc_dirty);
        assert!(!node.info_dirty);
    }

    #[test]
    fn test_remote_source_only_upgrade_dirties_pmc_only() {
        let mut node = empty_node();
        let remote = RemoteFileLocation::Full(FullRemoteFileLocation {
            file_type: FileType::Photo,
            server_id: 1,
            access_hash: 2,
        });
        node.set_remote_location(remote.clone(), LocationSource::FromStore, 0);
        node.pmc_dirty = false;
        node.info_dirty = false;

        node.set_remote_location(remote, LocationSource::FromServer, 0);
        assert_eq!(node.remote_source, LocationSource::FromServer);
        assert!(node.pmc_dirty);
        assert!(!node.info_dirty);
    }

    #[test]
    fn test_encryption_key_conflict_is_rejected() {
        let mut node = empty_node();
        assert!(node.set_encryption_key(EncryptionKey::new(vec![1; 32])));
        assert!(node.set_encryption_key(EncryptionKey::new(vec![1; 32])));
        assert!(!node.set_encryption_key(EncryptionKey::new(vec![2; 32])));
        assert_eq!(node.encryption_key, EncryptionKey::new(vec![1; 32]));
    }

    #[test]
    fn test_file_type_falls_back_to_hint() {
        let mut node = empty_node();
        assert_eq!(node.file_type(), FileType::Temp);
        node.file_type_hint = FileType::Photo;
        assert_eq!(node.file_type(), FileType::Photo);
    }
}
