//! # File Manager
//!
//! Central bookkeeping and coordination for the client's file subsystem. The
//! manager maintains the identity, state, and lifecycle of every file the
//! client knows about, whether that file exists only on the server, only on
//! disk, only as a generation recipe, or in any combination, and drives those
//! files through the download, upload, and generation pipelines.
//!
//! ## Overview
//!
//! The manager is the meeting point of four concerns:
//! - **Identity unification**: the same underlying file may be discovered
//!   through a local path, a server reference, a URL, a generation recipe, or
//!   a persisted record, in any order. All discovery paths collapse into one
//!   node per logical file; already-issued handles survive unification.
//! - **Per-file state**: each node tracks three tiered locations and at most
//!   one in-flight worker query per kind (download, upload, generate).
//! - **Persistence coherence**: learned facts are lazily loaded from and
//!   incrementally flushed to the durable store.
//! - **Callback multiplexing**: overlapping download/upload requests fan in
//!   per node; worker progress fans out to every subscribed handle.
//!
//! ## Concurrency
//!
//! The manager is a single-owner cooperative actor: every method takes
//! `&mut self`, so the host must drive it from one task and deliver worker
//! callbacks as ordinary method calls. Awaits inside methods (store and
//! filesystem consultations) are the only suspension points; the `&mut`
//! receiver rules out re-entrancy, so no field is behind a lock.

use std::collections::btree_map::Entry;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::Path;
use std::sync::Arc;

use bridge_traits::{
    ChatId, EncryptionKey, FileDbId, FileRecord, FileStore, FileSystemAccess, FileType,
    FullGenerateFileLocation, FullLocalFileLocation, FullRemoteFileLocation, GenerateFileLocation,
    GenerateWorker, LoadWorker, LocalFileLocation, LocationSource, QueryId, RemoteFileLocation,
    URL_CONVERSION,
};
use bytes::Bytes;
use core_runtime::events::{EventBus, FileEvent};
use tracing::{debug, instrument, warn};

use crate::config::{FileManagerConfig, MAX_PRIORITY};
use crate::error::{FileError, Result};
use crate::handle::{DownloadCallback, FileId, FileIdInfo, FileNodeId, UploadCallback};
use crate::node::FileNode;
use crate::persistent_id::{decode_persistent_id, encode_persistent_id};
use crate::view::{FileObject, FileView, LocalFileObject, RemoteFileObject};

/// Reserved priority for uploads induced by `set_content`.
pub const FROM_BYTES_PRIORITY: i8 = 10;

/// One in-flight worker query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Query {
    pub file_id: FileId,
    pub kind: QueryKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum QueryKind {
    Download,
    Upload,
    UploadByHash,
    SetContent,
    Generate,
}

/// Outcome of a store lookup during registration.
pub(crate) enum StoreLookup {
    Found(FileDbId, FileRecord),
    Missing,
    /// The store errored; the caller records that a lookup is still owed.
    Failed,
}

/// The file manager actor. See the module docs for the overall design.
pub struct FileManager {
    pub(crate) config: FileManagerConfig,
    pub(crate) load_worker: Arc<dyn LoadWorker>,
    pub(crate) generate_worker: Arc<dyn GenerateWorker>,
    pub(crate) store: Option<Arc<dyn FileStore>>,
    pub(crate) fs: Arc<dyn FileSystemAccess>,
    pub(crate) event_bus: EventBus,

    pub(crate) file_id_infos: Vec<FileIdInfo>,
    pub(crate) file_nodes: Vec<Option<FileNode>>,

    pub(crate) local_location_to_file_id: BTreeMap<String, FileId>,
    pub(crate) remote_location_to_file_id: BTreeMap<FullRemoteFileLocation, FileId>,
    pub(crate) generate_location_to_file_id: BTreeMap<FullGenerateFileLocation, FileId>,
    pub(crate) pmc_id_to_node_id: HashMap<FileDbId, FileNodeId>,

    pub(crate) queries: HashMap<QueryId, Query>,
    pub(crate) next_query_id: u64,

    /// Negative cache of local paths that recently failed a readability check.
    pub(crate) bad_paths: HashSet<String>,
    /// Store rows orphaned by merges under `no_sync`, deleted at the next
    /// flush boundary.
    pub(crate) pending_pmc_deletes: Vec<FileDbId>,
}

impl FileManager {
    /// Create a new file manager.
    ///
    /// # Arguments
    ///
    /// * `config` - Manager configuration
    /// * `load_worker` - Download/upload byte pool
    /// * `generate_worker` - On-demand generation worker
    /// * `store` - Durable record store; `None` disables persistence
    /// * `fs` - Local filesystem access
    pub fn new(
        config: FileManagerConfig,
        load_worker: Arc<dyn LoadWorker>,
        generate_worker: Arc<dyn GenerateWorker>,
        store: Option<Arc<dyn FileStore>>,
        fs: Arc<dyn FileSystemAccess>,
    ) -> Result<Self> {
        config.validate()?;
        let event_bus = EventBus::new(config.event_buffer_size);

        Ok(Self {
            config,
            load_worker,
            generate_worker,
            store,
            fs,
            event_bus,
            file_id_infos: Vec::new(),
            file_nodes: Vec::new(),
            local_location_to_file_id: BTreeMap::new(),
            remote_location_to_file_id: BTreeMap::new(),
            generate_location_to_file_id: BTreeMap::new(),
            pmc_id_to_node_id: HashMap::new(),
            queries: HashMap::new(),
            next_query_id: 0,
            bad_paths: HashSet::new(),
            pending_pmc_deletes: Vec::new(),
        })
    }

    /// Broadcast channel for user-visible file events.
    pub fn event_bus(&self) -> &EventBus {
        &self.event_bus
    }

    // ========================================================================
    // Handle and node plumbing
    // ========================================================================

    pub(crate) fn info_index(&self, file_id: FileId) -> Result<usize> {
        if !file_id.is_valid() {
            return Err(FileError::NotFoundHandle(file_id.0));
        }
        let index = (file_id.0 - 1) as usize;
        match self.file_id_infos.get(index) {
            Some(info) if !info.forgotten => Ok(index),
            _ => Err(FileError::NotFoundHandle(file_id.0)),
        }
    }

    pub(crate) fn node_id_of(&self, file_id: FileId) -> Result<FileNodeId> {
        let index = self.info_index(file_id)?;
        Ok(self.file_id_infos[index].node_id)
    }

    pub(crate) fn node_ref(&self, node_id: FileNodeId) -> Option<&FileNode> {
        self.file_nodes.get(node_id.0).and_then(|slot| slot.as_ref())
    }

    pub(crate) fn node_mut(&mut self, node_id: FileNodeId) -> Option<&mut FileNode> {
        self.file_nodes
            .get_mut(node_id.0)
            .and_then(|slot| slot.as_mut())
    }

    pub(crate) fn take_node(&mut self, node_id: FileNodeId) -> Option<FileNode> {
        self.file_nodes.get_mut(node_id.0).and_then(|slot| slot.take())
    }

    pub(crate) fn put_node(&mut self, node_id: FileNodeId, node: FileNode) {
        if let Some(slot) = self.file_nodes.get_mut(node_id.0) {
            *slot = Some(node);
        }
    }

    pub(crate) fn get_node(&self, file_id: FileId) -> Result<(&FileNode, FileNodeId)> {
        let node_id = self.node_id_of(file_id)?;
        self.node_ref(node_id)
            .map(|node| (node, node_id))
            .ok_or(FileError::NotFoundHandle(file_id.0))
    }

    /// Main handle of the node a handle resolves to; used for index entries,
    /// which always point at main handles.
    pub(crate) fn main_of(&self, file_id: FileId) -> FileId {
        self.get_node(file_id)
            .map(|(node, _)| node.main_file_id)
            .unwrap_or(file_id)
    }

    /// Issue a fresh handle aliased to an existing node.
    pub(crate) fn create_file_id(&mut self, node_id: FileNodeId) -> FileId {
        let file_id = FileId(self.file_id_infos.len() as i32 + 1);
        self.file_id_infos.push(FileIdInfo::new(node_id));
        if let Some(node) = self.node_mut(node_id) {
            node.file_ids.push(file_id);
            if !node.main_file_id.is_valid() {
                node.main_file_id = file_id;
            }
        }
        file_id
    }

    /// Insert a freshly built node into the registry: allocate its main
    /// handle, claim index entries for its full locations, and announce it.
    ///
    /// Index keys already owned by another node are left untouched; the
    /// holders are returned so the caller can merge with them.
    pub(crate) fn register_new_node(&mut self, mut node: FileNode) -> (FileId, Vec<FileId>) {
        let node_id = FileNodeId(self.file_nodes.len());
        let file_id = FileId(self.file_id_infos.len() as i32 + 1);
        self.file_id_infos.push(FileIdInfo::new(node_id));
        node.file_ids.push(file_id);
        node.main_file_id = file_id;

        let mut collisions = Vec::new();
        if let Some(full) = node.local.full() {
            match self.local_location_to_file_id.entry(full.path.clone()) {
                Entry::Vacant(entry) => {
                    entry.insert(file_id);
                    node.new_local_key = true;
                }
                Entry::Occupied(entry) => collisions.push(*entry.get()),
            }
        }
        if let Some(full) = node.remote.full() {
            match self.remote_location_to_file_id.entry(full.clone()) {
                Entry::Vacant(entry) => {
                    entry.insert(file_id);
                    node.new_remote_key = true;
                }
                Entry::Occupied(entry) => collisions.push(*entry.get()),
            }
        }
        if let Some(full) = node.generate.full() {
            match self.generate_location_to_file_id.entry(full.clone()) {
                Entry::Vacant(entry) => {
                    entry.insert(file_id);
                    node.new_generate_key = true;
                }
                Entry::Occupied(entry) => collisions.push(*entry.get()),
            }
        }

        node.on_changed();
        let announced_size = if node.size != 0 {
            node.size
        } else {
            node.expected_size
        };
        self.file_nodes.push(Some(node));
        self.event_bus
            .emit(FileEvent::NewFile {
                size: announced_size,
            })
            .ok();
        debug!("Registered new file node as {}", file_id);
        (file_id, collisions)
    }

    /// Drop a handle that carries no callback, no priority, and no pin. The
    /// main handle goes only when it is the last one and the node keeps no
    /// location worth re-discovering, in which case the node goes with it;
    /// a node with any remaining location always keeps its main handle.
    pub(crate) fn try_forget_file_id(&mut self, file_id: FileId) {
        let Ok(index) = self.info_index(file_id) else {
            return;
        };
        if !self.file_id_infos[index].is_forgettable() {
            return;
        }
        let node_id = self.file_id_infos[index].node_id;
        let Some(node) = self.node_ref(node_id) else {
            return;
        };
        let is_main = node.main_file_id == file_id;
        let droppable = node.file_ids.len() == 1
            && node.local.is_empty()
            && node.remote.is_empty()
            && node.generate.is_empty()
            && !node.pmc_id.is_valid()
            && !node.download_query.is_valid()
            && !node.upload_query.is_valid()
            && !node.generate_query.is_valid();
        if is_main && !droppable {
            return;
        }
        self.file_id_infos[index].forgotten = true;
        if let Some(node) = self.node_mut(node_id) {
            node.file_ids.retain(|&id| id != file_id);
        }
        // the last handle of a locationless node takes the node with it
        if droppable {
            self.take_node(node_id);
        }
    }

    /// Sweep all handles of a node after a terminal delivery.
    pub(crate) fn forget_node_handles(&mut self, node_id: FileNodeId) {
        let file_ids = self
            .node_ref(node_id)
            .map(|node| node.file_ids.clone())
            .unwrap_or_default();
        for file_id in file_ids {
            self.try_forget_file_id(file_id);
        }
    }

    // ========================================================================
    // Queries
    // ========================================================================

    pub(crate) fn alloc_query(&mut self, file_id: FileId, kind: QueryKind) -> QueryId {
        self.next_query_id += 1;
        let query_id = QueryId(self.next_query_id);
        self.queries.insert(query_id, Query { file_id, kind });
        query_id
    }

    /// Remove a query from the in-flight table. Returns `None` when the query
    /// was already finished or cancelled, in which case late worker callbacks
    /// for it are no-ops.
    pub(crate) fn finish_query(&mut self, query_id: QueryId) -> Option<Query> {
        self.queries.remove(&query_id)
    }

    pub(crate) fn query_kind(&self, query_id: QueryId) -> Option<QueryKind> {
        self.queries.get(&query_id).map(|query| query.kind)
    }

    // ========================================================================
    // Subscriber fan-out
    // ========================================================================

    pub(crate) fn download_progress_subscribers(
        &self,
        node_id: FileNodeId,
    ) -> Vec<(FileId, Arc<dyn DownloadCallback>)> {
        let Some(node) = self.node_ref(node_id) else {
            return Vec::new();
        };
        node.file_ids
            .iter()
            .filter_map(|&file_id| {
                let info = self.file_id_infos.get((file_id.0 - 1) as usize)?;
                if info.forgotten || info.download_priority == 0 {
                    return None;
                }
                info.download_callback
                    .as_ref()
                    .map(|callback| (file_id, Arc::clone(callback)))
            })
            .collect()
    }

    pub(crate) fn upload_progress_subscribers(
        &self,
        node_id: FileNodeId,
    ) -> Vec<(FileId, Arc<dyn UploadCallback>)> {
        let Some(node) = self.node_ref(node_id) else {
            return Vec::new();
        };
        node.file_ids
            .iter()
            .filter_map(|&file_id| {
                let info = self.file_id_infos.get((file_id.0 - 1) as usize)?;
                if info.forgotten || info.upload_priority == 0 {
                    return None;
                }
                info.upload_callback
                    .as_ref()
                    .map(|callback| (file_id, Arc::clone(callback)))
            })
            .collect()
    }

    /// Detach every download subscriber of a node for a terminal delivery,
    /// zeroing the per-handle download priorities.
    pub(crate) fn take_download_subscribers(
        &mut self,
        node_id: FileNodeId,
    ) -> Vec<(FileId, Arc<dyn DownloadCallback>)> {
        let file_ids = self
            .node_ref(node_id)
            .map(|node| node.file_ids.clone())
            .unwrap_or_default();
        let mut subscribers = Vec::new();
        for file_id in file_ids {
            let Some(info) = self.file_id_infos.get_mut((file_id.0 - 1) as usize) else {
                continue;
            };
            if info.forgotten {
                continue;
            }
            info.download_priority = 0;
            if let Some(callback) = info.download_callback.take() {
                subscribers.push((file_id, callback));
            }
        }
        subscribers
    }

    /// Detach every upload subscriber of a node for a terminal delivery.
    pub(crate) fn take_upload_subscribers(
        &mut self,
        node_id: FileNodeId,
    ) -> Vec<(FileId, Arc<dyn UploadCallback>)> {
        let file_ids = self
            .node_ref(node_id)
            .map(|node| node.file_ids.clone())
            .unwrap_or_default();
        let mut subscribers = Vec::new();
        for file_id in file_ids {
            let Some(info) = self.file_id_infos.get_mut((file_id.0 - 1) as usize) else {
                continue;
            };
            if info.forgotten {
                continue;
            }
            info.upload_priority = 0;
            if let Some(callback) = info.upload_callback.take() {
                subscribers.push((file_id, callback));
            }
        }
        subscribers
    }

    // ========================================================================
    // Local path validation
    // ========================================================================

    /// Verify a to-be-registered local path against the filesystem, filling
    /// in size and mtime. Known-bad paths short-circuit without touching the
    /// filesystem.
    pub(crate) async fn check_new_local_location(
        &mut self,
        location: &mut FullLocalFileLocation,
        size: &mut i64,
    ) -> Result<()> {
        if self.bad_paths.contains(&location.path) {
            return Err(FileError::LocalFileGone {
                path: location.path.clone(),
                reason: "known bad path".to_string(),
            });
        }

        let stat = match self.fs.stat(Path::new(&location.path)).await {
            Ok(stat) => stat,
            Err(e) => {
                self.remember_bad_path(&location.path);
                return Err(FileError::LocalFileGone {
                    path: location.path.clone(),
                    reason: e.to_string(),
                });
            }
        };

        if stat.is_directory {
            self.remember_bad_path(&location.path);
            return Err(FileError::LocalFileGone {
                path: location.path.clone(),
                reason: "path is a directory".to_string(),
            });
        }

        if *size != 0 && stat.size != *size {
            self.remember_bad_path(&location.path);
            return Err(FileError::LocalFileGone {
                path: location.path.clone(),
                reason: format!("size mismatch: expected {}, found {}", size, stat.size),
            });
        }

        if location.mtime_nsec != 0 && location.mtime_nsec != stat.mtime_nsec {
            self.remember_bad_path(&location.path);
            return Err(FileError::LocalFileGone {
                path: location.path.clone(),
                reason: "modification time changed".to_string(),
            });
        }

        *size = stat.size;
        location.mtime_nsec = stat.mtime_nsec;
        Ok(())
    }

    pub(crate) fn remember_bad_path(&mut self, path: &str) {
        if self.bad_paths.len() < self.config.bad_path_cache_limit {
            self.bad_paths.insert(path.to_string());
        }
    }

    /// Re-check a path that is already attached to a node against the disk,
    /// comparing the node's recorded size and mtime. Unlike the
    /// registration-time check this never feeds the bad-path cache; a stale
    /// copy just costs the node its local location.
    pub(crate) async fn verify_attached_local_location(&self, node_id: FileNodeId) -> Result<()> {
        let (path, mtime_nsec, known_size) = {
            let Some(node) = self.node_ref(node_id) else {
                return Ok(());
            };
            let Some(full) = node.local.full() else {
                return Ok(());
            };
            (full.path.clone(), full.mtime_nsec, node.size)
        };

        let stat = match self.fs.stat(Path::new(&path)).await {
            Ok(stat) => stat,
            Err(e) => {
                return Err(FileError::LocalFileGone {
                    path,
                    reason: e.to_string(),
                });
            }
        };
        if stat.is_directory {
            return Err(FileError::LocalFileGone {
                path,
                reason: "path is a directory".to_string(),
            });
        }
        if known_size != 0 && stat.size != known_size {
            return Err(FileError::LocalFileGone {
                path,
                reason: format!("size changed: expected {}, found {}", known_size, stat.size),
            });
        }
        if mtime_nsec != 0 && mtime_nsec != stat.mtime_nsec {
            return Err(FileError::LocalFileGone {
                path,
                reason: "modification time changed".to_string(),
            });
        }
        Ok(())
    }

    /// Drop a node's local location: evict the index entry, demote the slot
    /// to empty, and cancel any upload reading the dead file.
    pub(crate) async fn demote_local_location(&mut self, node_id: FileNodeId) {
        let (path, stale_upload) = {
            let Some(node) = self.node_mut(node_id) else {
                return;
            };
            let path = node.local.path().map(|p| p.to_string());
            node.set_local_location(LocalFileLocation::Empty, 0);
            node.is_download_started = false;
            let stale = node.upload_query;
            if stale.is_valid() {
                node.upload_query = QueryId(0);
                node.upload_priority = 0;
            }
            (path, stale)
        };
        if let Some(path) = path {
            self.local_location_to_file_id.remove(&path);
        }
        if stale_upload.is_valid() {
            self.finish_query(stale_upload);
            self.load_worker.cancel(stale_upload).await;
        }
    }

    /// Tail of a local registration whose known path no longer matches the
    /// disk: demote the local location and keep the node when another
    /// location can satisfy callers; otherwise the registration fails.
    async fn register_local_after_demote(
        &mut self,
        node_id: FileNodeId,
        error: FileError,
        owner_id: ChatId,
        get_by_hash: bool,
    ) -> Result<FileId> {
        warn!("Registered local path no longer matches the disk: {}", error);
        self.demote_local_location(node_id).await;
        let has_fallback = self
            .node_ref(node_id)
            .map(|node| node.remote.is_full() || node.generate.is_full())
            .unwrap_or(false);
        if !has_fallback {
            self.run_scheduler(node_id).await;
            self.try_flush_node(node_id).await;
            return Err(error);
        }
        let file_id = self.create_file_id(node_id);
        if let Some(node) = self.node_mut(node_id) {
            if !node.owner_id.is_valid() && owner_id.is_valid() {
                node.set_owner_id(owner_id);
            }
            if get_by_hash && !node.get_by_hash {
                node.get_by_hash = true;
                node.on_pmc_changed();
            }
        }
        self.run_scheduler(node_id).await;
        self.try_flush_node(node_id).await;
        Ok(file_id)
    }

    // ========================================================================
    // Store lookups during registration
    // ========================================================================

    pub(crate) async fn lookup_store_by_local(
        &self,
        location: &FullLocalFileLocation,
    ) -> StoreLookup {
        let Some(store) = self.store.clone() else {
            return StoreLookup::Missing;
        };
        match store.load_by_local(location).await {
            Ok(Some((id, record))) => StoreLookup::Found(id, record),
            Ok(None) => StoreLookup::Missing,
            Err(e) => {
                warn!(
                    "Failed to load file record by local path {}: {}",
                    location.path, e
                );
                StoreLookup::Failed
            }
        }
    }

    pub(crate) async fn lookup_store_by_remote(
        &self,
        location: &FullRemoteFileLocation,
    ) -> StoreLookup {
        let Some(store) = self.store.clone() else {
            return StoreLookup::Missing;
        };
        match store.load_by_remote(location).await {
            Ok(Some((id, record))) => StoreLookup::Found(id, record),
            Ok(None) => StoreLookup::Missing,
            Err(e) => {
                warn!(
                    "Failed to load file record by remote id {}: {}",
                    location.server_id, e
                );
                StoreLookup::Failed
            }
        }
    }

    pub(crate) async fn lookup_store_by_generate(
        &self,
        location: &FullGenerateFileLocation,
    ) -> StoreLookup {
        let Some(store) = self.store.clone() else {
            return StoreLookup::Missing;
        };
        match store.load_by_generate(location).await {
            Ok(Some((id, record))) => StoreLookup::Found(id, record),
            Ok(None) => StoreLookup::Missing,
            Err(e) => {
                warn!(
                    "Failed to load file record by generate recipe {}: {}",
                    location.conversion, e
                );
                StoreLookup::Failed
            }
        }
    }

    // ========================================================================
    // Registry
    // ========================================================================

    /// Register an empty file of the given type. The handle starts with no
    /// locations; facts arrive later via merges or worker callbacks.
    pub fn register_empty(&mut self, file_type: FileType) -> FileId {
        let node = FileNode::new(
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
            file_type,
        );
        let (file_id, _) = self.register_new_node(node);
        file_id
    }

    /// Register a file discovered at a local path.
    ///
    /// The path is resolved against the index and the store before any
    /// filesystem check, so a path that is already attached to a node (or
    /// recoverable from the store) never fails outright: if the on-disk file
    /// has since changed or vanished, that node's local location is demoted
    /// to empty and the handle is returned with the remote and generate
    /// locations intact. Only a genuinely new registration with nothing to
    /// fall back on fails with `LocalFileGone`, and only that path feeds the
    /// bad-paths set. `force = true` bypasses the filesystem entirely and is
    /// used when replaying persisted state. `get_by_hash` allows
    /// content-addressed deduplication when the file is later uploaded.
    #[instrument(skip(self), fields(path = %location.path))]
    pub async fn register_local(
        &mut self,
        mut location: FullLocalFileLocation,
        owner_id: ChatId,
        mut size: i64,
        get_by_hash: bool,
        force: bool,
    ) -> Result<FileId> {
        if let Some(&existing) = self.local_location_to_file_id.get(&location.path) {
            let node_id = self.node_id_of(existing)?;
            if !force {
                if let Err(e) = self.verify_attached_local_location(node_id).await {
                    return self
                        .register_local_after_demote(node_id, e, owner_id, get_by_hash)
                        .await;
                }
            }
            let file_id = self.create_file_id(node_id);
            if let Some(node) = self.node_mut(node_id) {
                if node.size == 0 && size != 0 {
                    node.set_size(size);
                }
                if !node.owner_id.is_valid() && owner_id.is_valid() {
                    node.set_owner_id(owner_id);
                }
                if get_by_hash && !node.get_by_hash {
                    node.get_by_hash = true;
                    node.on_pmc_changed();
                }
            }
            self.try_flush_node(node_id).await;
            return Ok(file_id);
        }

        let mut lookup_failed = false;
        match self.lookup_store_by_local(&location).await {
            StoreLookup::Found(pmc_id, record) => {
                let file_id = self
                    .register_record_impl(record, pmc_id, LocationSource::FromStore)
                    .await;
                let node_id = self.node_id_of(file_id)?;
                if !force {
                    if let Err(e) = self.verify_attached_local_location(node_id).await {
                        return self
                            .register_local_after_demote(node_id, e, owner_id, get_by_hash)
                            .await;
                    }
                }
                if let Some(node) = self.node_mut(node_id) {
                    node.set_local_location(
                        LocalFileLocation::Full(location.clone()),
                        node.local_ready_size,
                    );
                    if node.size == 0 && size != 0 {
                        node.set_size(size);
                    }
                    if !node.owner_id.is_valid() && owner_id.is_valid() {
                        node.set_owner_id(owner_id);
                    }
                    if get_by_hash && !node.get_by_hash {
                        node.get_by_hash = true;
                        node.on_pmc_changed();
                    }
                }
                let main_file_id = self.main_of(file_id);
                self.local_location_to_file_id
                    .insert(location.path.clone(), main_file_id);
                self.try_flush_node(node_id).await;
                return Ok(file_id);
            }
            StoreLookup::Missing => {}
            StoreLookup::Failed => lookup_failed = true,
        }

        // brand-new registration: nothing to fall back on, so a bad path is
        // an error and enters the negative cache
        if !force {
            self.check_new_local_location(&mut location, &mut size).await?;
        }

        let file_type = location.file_type;
        let mut node = FileNode::new(
            LocalFileLocation::Full(location),
            RemoteFileLocation::Empty,
            LocationSource::None,
            GenerateFileLocation::Empty,
            size,
            size,
            String::new(),
            String::new(),
            owner_id,
            EncryptionKey::empty(),
            file_type,
        );
        node.get_by_hash = get_by_hash;
        node.need_load_from_store = lookup_failed;
        let (file_id, _) = self.register_new_node(node);
        let node_id = self.node_id_of(file_id)?;
        self.try_flush_node(node_id).await;
        Ok(file_id)
    }

    /// Register a file known by a server reference.
    #[instrument(skip(self), fields(server_id = location.server_id))]
    pub async fn register_remote(
        &mut self,
        location: FullRemoteFileLocation,
        source: LocationSource,
        owner_id: ChatId,
        size: i64,
        expected_size: i64,
        name: String,
    ) -> FileId {
        if let Some(&existing) = self.remote_location_to_file_id.get(&location) {
            if let Ok(node_id) = self.node_id_of(existing) {
                let file_id = self.create_file_id(node_id);
                if let Some(node) = self.node_mut(node_id) {
                    let ready = node.remote_ready_size;
                    node.set_remote_location(
                        RemoteFileLocation::Full(location),
                        source.max(node.remote_source),
                        ready,
                    );
                    if node.size == 0 && size != 0 {
                        node.set_size(size);
                    }
                    if expected_size > node.expected_size {
                        node.set_expected_size(expected_size);
                    }
                    if node.name.is_empty() && !name.is_empty() {
                        node.set_name(name);
                    }
                    if !node.owner_id.is_valid() && owner_id.is_valid() {
                        node.set_owner_id(owner_id);
                    }
                }
                self.try_flush_node(node_id).await;
                return file_id;
            }
        }

        let mut lookup_failed = false;
        match self.lookup_store_by_remote(&location).await {
            StoreLookup::Found(pmc_id, record) => {
                let file_id = self
                    .register_record_impl(record, pmc_id, LocationSource::FromStore)
                    .await;
                if let Ok(node_id) = self.node_id_of(file_id) {
                    if let Some(node) = self.node_mut(node_id) {
                        let ready = node.remote_ready_size;
                        node.set_remote_location(
                            RemoteFileLocation::Full(location.clone()),
                            source.max(node.remote_source),
                            ready,
                        );
                        if node.size == 0 && size != 0 {
                            node.set_size(size);
                        }
                        if expected_size > node.expected_size {
                            node.set_expected_size(expected_size);
                        }
                        if node.name.is_empty() && !name.is_empty() {
                            node.set_name(name);
                        }
                        if !node.owner_id.is_valid() && owner_id.is_valid() {
                            node.set_owner_id(owner_id);
                        }
                    }
                    let main_file_id = self.main_of(file_id);
                    self.remote_location_to_file_id
                        .insert(location, main_file_id);
                    self.try_flush_node(node_id).await;
                }
                return file_id;
            }
            StoreLookup::Missing => {}
            StoreLookup::Failed => lookup_failed = true,
        }

        let mut node = FileNode::new(
            LocalFileLocation::Empty,
            RemoteFileLocation::Full(location),
            source,
            GenerateFileLocation::Empty,
            size,
            expected_size.max(size),
            name,
            String::new(),
            owner_id,
            EncryptionKey::empty(),
            FileType::Temp,
        );
        node.need_load_from_store = lookup_failed;
        let (file_id, _) = self.register_new_node(node);
        if let Ok(node_id) = self.node_id_of(file_id) {
            self.try_flush_node(node_id).await;
        }
        file_id
    }

    /// Register a file producible by running `conversion` over
    /// `original_path`.
    #[instrument(skip(self))]
    pub async fn register_generate(
        &mut self,
        file_type: FileType,
        original_path: String,
        conversion: String,
        owner_id: ChatId,
        expected_size: i64,
    ) -> Result<FileId> {
        if conversion.is_empty() {
            return Err(FileError::Config(
                "generate conversion must not be empty".to_string(),
            ));
        }

        let location = FullGenerateFileLocation {
            file_type,
            original_path,
            conversion,
        };

        if let Some(&existing) = self.generate_location_to_file_id.get(&location) {
            let node_id = self.node_id_of(existing)?;
            let file_id = self.create_file_id(node_id);
            if let Some(node) = self.node_mut(node_id) {
                if expected_size > node.expected_size {
                    node.set_expected_size(expected_size);
                }
                if !node.owner_id.is_valid() && owner_id.is_valid() {
                    node.set_owner_id(owner_id);
                }
            }
            self.try_flush_node(node_id).await;
            return Ok(file_id);
        }

        let mut lookup_failed = false;
        match self.lookup_store_by_generate(&location).await {
            StoreLookup::Found(pmc_id, record) => {
                let file_id = self
                    .register_record_impl(record, pmc_id, LocationSource::FromStore)
                    .await;
                let node_id = self.node_id_of(file_id)?;
                if let Some(node) = self.node_mut(node_id) {
                    node.set_generate_location(GenerateFileLocation::Full(location.clone()));
                    if expected_size > node.expected_size {
                        node.set_expected_size(expected_size);
                    }
                    if !node.owner_id.is_valid() && owner_id.is_valid() {
                        node.set_owner_id(owner_id);
                    }
                }
                let main_file_id = self.main_of(file_id);
                self.generate_location_to_file_id
                    .insert(location, main_file_id);
                self.try_flush_node(node_id).await;
                return Ok(file_id);
            }
            StoreLookup::Missing => {}
            StoreLookup::Failed => lookup_failed = true,
        }

        let mut node = FileNode::new(
            LocalFileLocation::Empty,
            RemoteFileLocation::Empty,
            LocationSource::None,
            GenerateFileLocation::Full(location),
            0,
            expected_size,
            String::new(),
            String::new(),
            owner_id,
            EncryptionKey::empty(),
            file_type,
        );
        node.need_load_from_store = lookup_failed;
        let (file_id, _) = self.register_new_node(node);
        let node_id = self.node_id_of(file_id)?;
        self.try_flush_node(node_id).await;
        Ok(file_id)
    }

    /// Register a URL-backed file: a generate location whose conversion is
    /// the reserved URL marker, with the URL recorded on the node.
    pub async fn register_url(
        &mut self,
        url: String,
        file_type: FileType,
        owner_id: ChatId,
    ) -> Result<FileId> {
        if url.is_empty() {
            return Err(FileError::Config("url must not be empty".to_string()));
        }
        let file_id = self
            .register_generate(
                file_type,
                url.clone(),
                URL_CONVERSION.to_string(),
                owner_id,
                0,
            )
            .await?;
        let node_id = self.node_id_of(file_id)?;
        if let Some(node) = self.node_mut(node_id) {
            node.set_url(url);
        }
        self.try_flush_node(node_id).await;
        Ok(file_id)
    }

    /// Register a complete persisted record, e.g. when replaying a message
    /// payload that embeds file state.
    pub async fn register_from_record(
        &mut self,
        record: FileRecord,
        source: LocationSource,
    ) -> Result<FileId> {
        if record.local.full().is_none()
            && record.remote.full().is_none()
            && record.generate.full().is_none()
        {
            return Err(FileError::Config(
                "file record has no usable location".to_string(),
            ));
        }
        Ok(self.register_record_impl(record, FileDbId(0), source).await)
    }

    /// Core of record registration: build a node from the record, then unify
    /// it with any node that already owns one of its location keys. Merge
    /// conflicts are logged and leave the colliding nodes separate; no node is
    /// destroyed on a failed merge.
    pub(crate) async fn register_record_impl(
        &mut self,
        record: FileRecord,
        pmc_id: FileDbId,
        source: LocationSource,
    ) -> FileId {
        if pmc_id.is_valid() {
            if let Some(&node_id) = self.pmc_id_to_node_id.get(&pmc_id) {
                return self.create_file_id(node_id);
            }
        }

        let FileRecord {
            local,
            remote,
            generate,
            size,
            expected_size,
            name,
            url,
            owner_id,
            encryption_key,
            get_by_hash,
        } = record;

        let mut node = FileNode::new(
            local,
            remote,
            source,
            generate,
            size,
            expected_size,
            name,
            url,
            owner_id,
            EncryptionKey::new(encryption_key),
            FileType::Temp,
        );
        node.get_by_hash = get_by_hash;
        node.pmc_id = pmc_id;

        let (mut file_id, collisions) = self.register_new_node(node);
        if pmc_id.is_valid() {
            if let Ok(node_id) = self.node_id_of(file_id) {
                self.pmc_id_to_node_id.insert(pmc_id, node_id);
                // the record mirrors the store; nothing to write back yet
                if let Some(node) = self.node_mut(node_id) {
                    node.pmc_dirty = false;
                }
            }
        }

        for other in collisions {
            match self.merge(file_id, other, true).await {
                Ok(unified) => file_id = unified,
                Err(e) => {
                    warn!("Keeping files {} and {} separate: {}", file_id, other, e);
                }
            }
        }

        file_id
    }

    /// Issue another handle for the same file.
    pub fn dup_file_id(&mut self, file_id: FileId) -> Result<FileId> {
        let node_id = self.node_id_of(file_id)?;
        Ok(self.create_file_id(node_id))
    }

    // ========================================================================
    // Transfers
    // ========================================================================

    /// Request a download of the file at the given priority, 1 (lowest) to
    /// 31 (highest). Priority 0 withdraws this handle's request; the worker
    /// keeps running if other handles still want the file.
    pub async fn download(
        &mut self,
        file_id: FileId,
        callback: Option<Arc<dyn DownloadCallback>>,
        new_priority: i8,
    ) -> Result<()> {
        let node_id = self.node_id_of(file_id)?;
        let priority = new_priority.clamp(0, MAX_PRIORITY);
        {
            let index = self.info_index(file_id)?;
            let info = &mut self.file_id_infos[index];
            info.download_priority = priority;
            if priority == 0 {
                info.download_callback = None;
            } else if callback.is_some() {
                info.download_callback = callback;
            }
        }
        self.elect_main(node_id, file_id, priority);
        self.run_scheduler(node_id).await;
        self.try_flush_node(node_id).await;
        self.try_forget_file_id(file_id);
        Ok(())
    }

    /// A handle requesting at a priority above the current main election
    /// becomes the node's canonical handle.
    pub(crate) fn elect_main(&mut self, node_id: FileNodeId, file_id: FileId, priority: i8) {
        if priority == 0 {
            return;
        }
        if let Some(node) = self.node_mut(node_id) {
            if priority > node.main_file_id_priority {
                node.main_file_id = file_id;
                node.main_file_id_priority = priority;
                node.on_info_changed();
            }
        }
    }

    /// Request an upload of the file. `upload_order` breaks ties among
    /// concurrent uploads at the same priority, lower first. An explicit
    /// upload on a handle whose completed upload paused the file resumes it.
    pub async fn upload(
        &mut self,
        file_id: FileId,
        callback: Option<Arc<dyn UploadCallback>>,
        new_priority: i8,
        upload_order: u64,
    ) -> Result<()> {
        let node_id = self.node_id_of(file_id)?;
        let priority = new_priority.clamp(0, MAX_PRIORITY);
        {
            let index = self.info_index(file_id)?;
            let info = &mut self.file_id_infos[index];
            info.upload_priority = priority;
            info.upload_order = upload_order;
            if priority == 0 {
                info.upload_callback = None;
            } else if callback.is_some() {
                info.upload_callback = callback;
            }
        }
        if let Some(node) = self.node_mut(node_id) {
            if node.upload_pause == Some(file_id) {
                node.upload_pause = None;
            }
        }
        self.elect_main(node_id, file_id, priority);
        self.run_scheduler(node_id).await;
        self.try_flush_node(node_id).await;
        self.try_forget_file_id(file_id);
        Ok(())
    }

    /// Resume a paused upload, resending the parts the server rejected.
    pub async fn resume_upload(
        &mut self,
        file_id: FileId,
        bad_parts: Vec<i32>,
        callback: Option<Arc<dyn UploadCallback>>,
        new_priority: i8,
        upload_order: u64,
    ) -> Result<()> {
        let node_id = self.node_id_of(file_id)?;
        // restart the transfer so the resent parts are honored
        let stale_query = {
            let Some(node) = self.node_mut(node_id) else {
                return Err(FileError::NotFoundHandle(file_id.0));
            };
            node.upload_pause = None;
            node.pending_bad_parts = bad_parts;
            let stale = node.upload_query;
            if stale.is_valid() {
                node.upload_query = QueryId(0);
                node.upload_priority = 0;
            }
            stale
        };
        if stale_query.is_valid() {
            self.finish_query(stale_query);
            self.load_worker.cancel(stale_query).await;
        }
        self.upload(file_id, callback, new_priority, upload_order).await
    }

    /// Drop a partially uploaded server location so the next upload starts
    /// from scratch. Returns false (and does nothing) when the remote
    /// location is already full.
    pub async fn delete_partial_remote_location(&mut self, file_id: FileId) -> bool {
        let Ok(node_id) = self.node_id_of(file_id) else {
            return false;
        };
        let stale_query = {
            let Some(node) = self.node_mut(node_id) else {
                return false;
            };
            if node.remote.is_full() {
                return false;
            }
            node.upload_pause = None;
            node.set_remote_location(RemoteFileLocation::Empty, LocationSource::None, 0);
            let stale = node.upload_query;
            if stale.is_valid() {
                node.upload_query = QueryId(0);
                node.upload_priority = 0;
            }
            stale
        };
        if stale_query.is_valid() {
            self.finish_query(stale_query);
            self.load_worker.cancel(stale_query).await;
        }
        self.run_scheduler(node_id).await;
        self.try_flush_node(node_id).await;
        true
    }

    /// Replace the file's content with the given bytes, materialized through
    /// the load worker at the reserved from-bytes priority.
    pub async fn set_content(&mut self, file_id: FileId, bytes: Bytes) -> bool {
        let Ok(node_id) = self.node_id_of(file_id) else {
            return false;
        };
        let (stale_query, file_type, main_file_id) = {
            let Some(node) = self.node_ref(node_id) else {
                return false;
            };
            (node.download_query, node.file_type(), node.main_file_id)
        };
        if stale_query.is_valid() {
            self.finish_query(stale_query);
            if let Some(node) = self.node_mut(node_id) {
                node.download_query = QueryId(0);
                node.download_priority = 0;
            }
            self.load_worker.cancel(stale_query).await;
        }

        let query_id = self.alloc_query(main_file_id, QueryKind::SetContent);
        if let Some(node) = self.node_mut(node_id) {
            node.download_query = query_id;
            node.download_priority = FROM_BYTES_PRIORITY;
        }
        if let Err(e) = self.load_worker.from_bytes(query_id, file_type, bytes).await {
            warn!("Failed to start set-content query {}: {}", query_id, e);
            self.finish_query(query_id);
            if let Some(node) = self.node_mut(node_id) {
                if node.download_query == query_id {
                    node.download_query = QueryId(0);
                    node.download_priority = 0;
                }
            }
            return false;
        }
        true
    }

    /// Read the file's bytes from its full local copy.
    pub async fn get_content(&self, file_id: FileId) -> Result<Bytes> {
        let (node, _) = self.get_node(file_id)?;
        let Some(full) = node.local.full() else {
            return Err(FileError::LocalFileGone {
                path: node.local.path().unwrap_or_default().to_string(),
                reason: "no full local copy".to_string(),
            });
        };
        let path = full.path.clone();
        self.fs
            .read_file(Path::new(&path))
            .await
            .map_err(|e| FileError::Filesystem(e.to_string()))
    }

    /// Attach an encryption key to the file. Returns false when a different
    /// key is already set or the file's locations are not encrypted-typed.
    pub async fn set_encryption_key(&mut self, file_id: FileId, key: EncryptionKey) -> bool {
        let Ok(node_id) = self.node_id_of(file_id) else {
            return false;
        };
        let accepted = {
            let Some(node) = self.node_mut(node_id) else {
                return false;
            };
            let types_encrypted = [
                node.local.file_type(),
                node.remote.file_type(),
                node.generate.file_type(),
            ]
            .into_iter()
            .flatten()
            .all(FileType::is_encrypted);
            if !key.is_empty() && !types_encrypted {
                warn!("Refusing encryption key for non-encrypted file {}", file_id);
                false
            } else {
                node.set_encryption_key(key)
            }
        };
        if accepted {
            self.try_flush_node(node_id).await;
        }
        accepted
    }

    /// Prevent the handle from being forgotten while it has no callbacks and
    /// no priority.
    pub fn pin_file(&mut self, file_id: FileId, pinned: bool) -> Result<()> {
        let index = self.info_index(file_id)?;
        self.file_id_infos[index].pinned = pinned;
        Ok(())
    }

    // ========================================================================
    // Views and public objects
    // ========================================================================

    /// Snapshot of everything known about the file.
    pub fn get_file_view(&self, file_id: FileId) -> Result<FileView> {
        let (node, _) = self.get_node(file_id)?;
        Ok(Self::view_of(node))
    }

    /// Like [`get_file_view`](Self::get_file_view), but first completes any
    /// store lookup that could not run when the file was registered.
    pub async fn get_sync_file_view(&mut self, file_id: FileId) -> Result<FileView> {
        let node_id = self.node_id_of(file_id)?;
        let pending = self
            .node_ref(node_id)
            .map(|node| node.need_load_from_store)
            .unwrap_or(false);
        if pending {
            if let Some(node) = self.node_mut(node_id) {
                node.need_load_from_store = false;
            }
            let (local, remote, generate) = {
                let Some(node) = self.node_ref(node_id) else {
                    return Err(FileError::NotFoundHandle(file_id.0));
                };
                (
                    node.local.full().cloned(),
                    node.remote.full().cloned(),
                    node.generate.full().cloned(),
                )
            };
            let lookup = if let Some(remote) = remote {
                self.lookup_store_by_remote(&remote).await
            } else if let Some(local) = local {
                self.lookup_store_by_local(&local).await
            } else if let Some(generate) = generate {
                self.lookup_store_by_generate(&generate).await
            } else {
                StoreLookup::Missing
            };
            if let StoreLookup::Found(pmc_id, record) = lookup {
                // the loaded node collides with ours on the shared key and is
                // merged back in
                self.register_record_impl(record, pmc_id, LocationSource::FromStore)
                    .await;
            }
        }
        self.get_file_view(file_id)
    }

    pub(crate) fn view_of(node: &FileNode) -> FileView {
        FileView {
            file_id: node.main_file_id,
            local: node.local.clone(),
            remote: node.remote.clone(),
            generate: node.generate.clone(),
            size: node.size,
            expected_size: node.expected_size,
            name: node.name.clone(),
            url: node.url.clone(),
            owner_id: node.owner_id,
            encryption_key: node.encryption_key.clone(),
            get_by_hash: node.get_by_hash,
            is_downloading: node.download_query.is_valid() || node.generate_query.is_valid(),
            is_uploading: node.upload_query.is_valid(),
            local_ready_size: node.local_ready_size,
            remote_ready_size: node.remote_ready_size,
            file_type_hint: node.file_type_hint,
        }
    }

    /// Build the public file record handed to the application layer. Marks
    /// the handle for user-visible update broadcasts: once the application
    /// has seen the file, it keeps receiving `Updated` events for it.
    pub fn get_file_object(&mut self, file_id: FileId, with_main: bool) -> Result<FileObject> {
        let index = self.info_index(file_id)?;
        self.file_id_infos[index].send_updates = true;
        let node_id = self.file_id_infos[index].node_id;
        let node = self
            .node_ref(node_id)
            .ok_or(FileError::NotFoundHandle(file_id.0))?;

        let id = if with_main { node.main_file_id } else { file_id };
        let persistent_id = node
            .remote
            .full()
            .map(encode_persistent_id)
            .unwrap_or_default();

        Ok(FileObject {
            id: id.0,
            file_type: node.file_type(),
            size: node.size,
            expected_size: if node.size != 0 {
                node.size
            } else {
                node.expected_size
            },
            local: LocalFileObject {
                path: node.local.path().unwrap_or_default().to_string(),
                can_be_downloaded: node.remote.is_full() || node.generate.is_full(),
                can_be_deleted: !node.local.is_empty(),
                is_downloading_active: node.download_query.is_valid()
                    || node.generate_query.is_valid(),
                is_downloading_completed: node.local.is_full(),
                downloaded_size: if node.local.is_full() {
                    node.size
                } else {
                    node.local_ready_size
                },
            },
            remote: RemoteFileObject {
                persistent_id,
                is_uploading_active: node.upload_query.is_valid(),
                is_uploading_completed: node.remote.is_full(),
                uploaded_size: if node.remote.is_full() {
                    node.size
                } else {
                    node.remote_ready_size
                },
            },
        })
    }

    // ========================================================================
    // Persistent identifiers
    // ========================================================================

    /// Encode the file's server reference as a shareable token.
    pub fn to_persistent_id(&self, file_id: FileId) -> Result<String> {
        let (node, _) = self.get_node(file_id)?;
        node.remote
            .full()
            .map(encode_persistent_id)
            .ok_or_else(|| {
                FileError::InvalidPersistentId("file has no remote location".to_string())
            })
    }

    /// Decode a shareable token and register the referenced file.
    pub async fn from_persistent_id(
        &mut self,
        token: &str,
        expected_type: FileType,
    ) -> Result<FileId> {
        let remote = decode_persistent_id(token, expected_type)?;
        Ok(self
            .register_remote(
                remote,
                LocationSource::FromUser,
                ChatId(0),
                0,
                0,
                String::new(),
            )
            .await)
    }
}

/// Display name for a downloaded file, derived from its path with the type's
/// default extension appended when the basename has none.
pub(crate) fn file_name_for(file_type: FileType, path: &str) -> String {
    let base = Path::new(path)
        .file_name()
        .and_then(|name| name.to_str())
        .unwrap_or_default()
        .to_string();
    if base.is_empty() || base.contains('.') {
        return base;
    }
    match file_type.default_extension() {
        Some(extension) => format!("{}.{}", base, extension),
        None => base,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_file_name_keeps_existing_extension() {
        assert_eq!(
            file_name_for(FileType::Photo, "/cache/photos/selfie.png"),
            "selfie.png"
        );
    }

    #[test]
    fn test_file_name_appends_default_extension() {
        assert_eq!(file_name_for(FileType::Photo, "/cache/photos/42"), "42.jpg");
        assert_eq!(file_name_for(FileType::Document, "/cache/docs/42"), "42");
    }

    #[test]
    fn test_file_name_of_empty_path() {
        assert_eq!(file_name_for(FileType::Photo, ""), "");
    }
}
