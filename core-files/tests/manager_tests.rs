//! End-to-end tests for the file manager.
//!
//! These tests drive the manager through mock implementations of the bridge
//! traits: a recording load worker, a recording generate worker, an in-memory
//! record store with secondary location indices, and an in-memory filesystem.

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bridge_traits::error::{BridgeError, Result as BridgeResult};
use bridge_traits::{
    ChatId, EncryptionKey, FileDbId, FileRecord, FileStat, FileStore, FileSystemAccess, FileType,
    FullGenerateFileLocation, FullLocalFileLocation, FullRemoteFileLocation, GenerateWorker,
    LoadWorker, LocalFileLocation, LocationSource, PartialLocalFileLocation,
    PartialRemoteFileLocation, QueryId, RemoteFileLocation, UploadedEncryptedFile, UploadedFile,
};
use bytes::Bytes;
use core_files::{
    DownloadCallback, FileError, FileId, FileManager, FileManagerConfig, UploadCallback,
};

// ============================================================================
// Mock load worker
// ============================================================================

#[derive(Default)]
struct MockLoadWorker {
    started_downloads: Mutex<Vec<(QueryId, i8)>>,
    started_uploads: Mutex<Vec<(QueryId, Vec<i32>, u64, i8)>>,
    from_bytes_calls: Mutex<Vec<(QueryId, FileType, Bytes)>>,
    priority_updates: Mutex<Vec<(QueryId, i8)>>,
    cancels: Mutex<Vec<QueryId>>,
}

impl MockLoadWorker {
    fn last_download(&self) -> (QueryId, i8) {
        *self
            .started_downloads
            .lock()
            .unwrap()
            .last()
            .expect("no download was started")
    }

    fn last_upload(&self) -> (QueryId, Vec<i32>, u64, i8) {
        self.started_uploads
            .lock()
            .unwrap()
            .last()
            .cloned()
            .expect("no upload was started")
    }

    fn download_count(&self) -> usize {
        self.started_downloads.lock().unwrap().len()
    }

    fn upload_count(&self) -> usize {
        self.started_uploads.lock().unwrap().len()
    }

    fn updates(&self) -> Vec<(QueryId, i8)> {
        self.priority_updates.lock().unwrap().clone()
    }

    fn cancels(&self) -> Vec<QueryId> {
        self.cancels.lock().unwrap().clone()
    }
}

#[async_trait::async_trait]
impl LoadWorker for MockLoadWorker {
    async fn start_download(
        &self,
        query_id: QueryId,
        _remote: FullRemoteFileLocation,
        _local: LocalFileLocation,
        _size: i64,
        _name: String,
        _encryption_key: EncryptionKey,
        _is_started: bool,
        priority: i8,
    ) -> BridgeResult<()> {
        self.started_downloads
            .lock()
            .unwrap()
            .push((query_id, priority));
        Ok(())
    }

    async fn start_upload(
        &self,
        query_id: QueryId,
        _local: FullLocalFileLocation,
        _remote: RemoteFileLocation,
        _expected_size: i64,
        _encryption_key: EncryptionKey,
        bad_parts: Vec<i32>,
        _by_hash: bool,
        upload_order: u64,
        priority: i8,
    ) -> BridgeResult<()> {
        self.started_uploads
            .lock()
            .unwrap()
            .push((query_id, bad_parts, upload_order, priority));
        Ok(())
    }

    async fn from_bytes(
        &self,
        query_id: QueryId,
        file_type: FileType,
        bytes: Bytes,
    ) -> BridgeResult<()> {
        self.from_bytes_calls
            .lock()
            .unwrap()
            .push((query_id, file_type, bytes));
        Ok(())
    }

    async fn update_priority(&self, query_id: QueryId, priority: i8) {
        self.priority_updates
            .lock()
            .unwrap()
            .push((query_id, priority));
    }

    async fn cancel(&self, query_id: QueryId) {
        self.cancels.lock().unwrap().push(query_id);
    }
}

// ============================================================================
// Mock generate worker
// ============================================================================

#[derive(Default)]
struct MockGenerateWorker {
    started: Mutex<Vec<(QueryId, FullGenerateFileLocation, i8)>>,
    cancels: Mutex<Vec<QueryId>>,
}

impl MockGenerateWorker {
    fn last_started(&self) -> (QueryId, FullGenerateFileLocation, i8) {
        self.started
            .lock()
            .unwrap()
            .last()
            .cloned()
            .expect("no generation was started")
    }
}

#[async_trait::async_trait]
impl GenerateWorker for MockGenerateWorker {
    async fn generate(
        &self,
        query_id: QueryId,
        generate: FullGenerateFileLocation,
        _local: LocalFileLocation,
        _name: String,
        priority: i8,
    ) -> BridgeResult<()> {
        self.started
            .lock()
            .unwrap()
            .push((query_id, generate, priority));
        Ok(())
    }

    async fn cancel(&self, query_id: QueryId) {
        self.cancels.lock().unwrap().push(query_id);
    }
}

// ============================================================================
// Mock record store
// ============================================================================

#[derive(Default)]
struct MockFileStore {
    next_id: AtomicU64,
    records: Mutex<HashMap<FileDbId, FileRecord>>,
    by_local: Mutex<HashMap<String, FileDbId>>,
    by_remote: Mutex<HashMap<FullRemoteFileLocation, FileDbId>>,
    by_generate: Mutex<HashMap<FullGenerateFileLocation, FileDbId>>,
    fail_stores: AtomicUsize,
    store_calls: AtomicUsize,
}

impl MockFileStore {
    fn record_count(&self) -> usize {
        self.records.lock().unwrap().len()
    }

    /// Make the next `n` store() calls fail.
    fn fail_next_stores(&self, n: usize) {
        self.fail_stores.store(n, Ordering::SeqCst);
    }
}

#[async_trait::async_trait]
impl FileStore for MockFileStore {
    async fn next_id(&self) -> BridgeResult<FileDbId> {
        Ok(FileDbId(self.next_id.fetch_add(1, Ordering::SeqCst) + 1))
    }

    async fn load_by_id(&self, id: FileDbId) -> BridgeResult<Option<FileRecord>> {
        Ok(self.records.lock().unwrap().get(&id).cloned())
    }

    async fn load_by_local(
        &self,
        location: &FullLocalFileLocation,
    ) -> BridgeResult<Option<(FileDbId, FileRecord)>> {
        let id = match self.by_local.lock().unwrap().get(&location.path) {
            Some(&id) => id,
            None => return Ok(None),
        };
        Ok(self
            .records
            .lock()
            .unwrap()
            .get(&id)
            .cloned()
            .map(|record| (id, record)))
    }

    async fn load_by_remote(
        &self,
        location: &FullRemoteFileLocation,
    ) -> BridgeResult<Option<(FileDbId, FileRecord)>> {
        let id = match self.by_remote.lock().unwrap().get(location) {
            Some(&id) => id,
            None => return Ok(None),
        };
        Ok(self
            .records
            .lock()
            .unwrap()
            .get(&id)
            .cloned()
            .map(|record| (id, record)))
    }

    async fn load_by_generate(
        &self,
        location: &FullGenerateFileLocation,
    ) -> BridgeResult<Option<(FileDbId, FileRecord)>> {
        let id = match self.by_generate.lock().unwrap().get(location) {
            Some(&id) => id,
            None => return Ok(None),
        };
        Ok(self
            .records
            .lock()
            .unwrap()
            .get(&id)
            .cloned()
            .map(|record| (id, record)))
    }

    async fn store(
        &self,
        id: FileDbId,
        record: &FileRecord,
        _new_local: bool,
        _new_remote: bool,
        _new_generate: bool,
    ) -> BridgeResult<()> {
        self.store_calls.fetch_add(1, Ordering::SeqCst);
        let failing = self.fail_stores.load(Ordering::SeqCst);
        if failing > 0 {
            self.fail_stores.store(failing - 1, Ordering::SeqCst);
            return Err(BridgeError::StoreError("simulated outage".to_string()));
        }
        self.records.lock().unwrap().insert(id, record.clone());
        if let LocalFileLocation::Full(full) = &record.local {
            self.by_local.lock().unwrap().insert(full.path.clone(), id);
        }
        if let RemoteFileLocation::Full(full) = &record.remote {
            self.by_remote.lock().unwrap().insert(full.clone(), id);
        }
        if let bridge_traits::GenerateFileLocation::Full(full) = &record.generate {
            self.by_generate.lock().unwrap().insert(full.clone(), id);
        }
        Ok(())
    }

    async fn delete(&self, id: FileDbId) -> BridgeResult<()> {
        self.records.lock().unwrap().remove(&id);
        self.by_local.lock().unwrap().retain(|_, v| *v != id);
        self.by_remote.lock().unwrap().retain(|_, v| *v != id);
        self.by_generate.lock().unwrap().retain(|_, v| *v != id);
        Ok(())
    }
}

// ============================================================================
// Mock filesystem
// ============================================================================

#[derive(Default)]
struct MockFileSystem {
    files: Mutex<HashMap<String, (i64, i64)>>,
    stat_calls: AtomicUsize,
    deleted: Mutex<Vec<String>>,
}

impl MockFileSystem {
    fn add_file(&self, path: &str, size: i64, mtime_nsec: i64) {
        self.files
            .lock()
            .unwrap()
            .insert(path.to_string(), (size, mtime_nsec));
    }

    fn stat_calls(&self) -> usize {
        self.stat_calls.load(Ordering::SeqCst)
    }

    fn deleted(&self) -> Vec<String> {
        self.deleted.lock().unwrap().clone()
    }
}

#[async_trait::async_trait]
impl FileSystemAccess for MockFileSystem {
    async fn exists(&self, path: &Path) -> BridgeResult<bool> {
        Ok(self
            .files
            .lock()
            .unwrap()
            .contains_key(path.to_string_lossy().as_ref()))
    }

    async fn stat(&self, path: &Path) -> BridgeResult<FileStat> {
        self.stat_calls.fetch_add(1, Ordering::SeqCst);
        match self
            .files
            .lock()
            .unwrap()
            .get(path.to_string_lossy().as_ref())
        {
            Some(&(size, mtime_nsec)) => Ok(FileStat {
                size,
                mtime_nsec,
                is_directory: false,
            }),
            None => Err(BridgeError::OperationFailed("no such file".to_string())),
        }
    }

    async fn read_file(&self, path: &Path) -> BridgeResult<Bytes> {
        match self
            .files
            .lock()
            .unwrap()
            .get(path.to_string_lossy().as_ref())
        {
            Some(&(size, _)) => Ok(Bytes::from(vec![0u8; size as usize])),
            None => Err(BridgeError::OperationFailed("no such file".to_string())),
        }
    }

    async fn write_file(&self, path: &Path, data: Bytes) -> BridgeResult<()> {
        self.files
            .lock()
            .unwrap()
            .insert(path.to_string_lossy().to_string(), (data.len() as i64, 1));
        Ok(())
    }

    async fn delete_file(&self, path: &Path) -> BridgeResult<()> {
        let key = path.to_string_lossy().to_string();
        self.files.lock().unwrap().remove(&key);
        self.deleted.lock().unwrap().push(key);
        Ok(())
    }
}

// ============================================================================
// Recording callbacks
// ============================================================================

#[derive(Default)]
struct RecordingDownloadCallback {
    events: Mutex<Vec<String>>,
}

impl RecordingDownloadCallback {
    fn events(&self) -> Vec<String> {
        self.events.lock().unwrap().clone()
    }
}

impl DownloadCallback for RecordingDownloadCallback {
    fn on_progress(&self, file_id: FileId) {
        self.events
            .lock()
            .unwrap()
            .push(format!("progress:{}", file_id));
    }

    fn on_download_ok(&self, file_id: FileId) {
        self.events.lock().unwrap().push(format!("ok:{}", file_id));
    }

    fn on_download_error(&self, file_id: FileId, error: FileError) {
        self.events
            .lock()
            .unwrap()
            .push(format!("error:{}:{}", file_id, error));
    }
}

#[derive(Default)]
struct RecordingUploadCallback {
    events: Mutex<Vec<String>>,
}

impl RecordingUploadCallback {
    fn events(&self) -> Vec<String> {
        self.events.lock().unwrap().clone()
    }
}

impl UploadCallback for RecordingUploadCallback {
    fn on_progress(&self, file_id: FileId) {
        self.events
            .lock()
            .unwrap()
            .push(format!("progress:{}", file_id));
    }

    fn on_upload_ok(&self, file_id: FileId, file: UploadedFile) {
        self.events
            .lock()
            .unwrap()
            .push(format!("ok:{}:{}", file_id, file.server_id));
    }

    fn on_upload_encrypted_ok(&self, file_id: FileId, file: UploadedEncryptedFile) {
        self.events
            .lock()
            .unwrap()
            .push(format!("encrypted_ok:{}:{}", file_id, file.server_id));
    }

    fn on_upload_error(&self, file_id: FileId, error: FileError) {
        self.events
            .lock()
            .unwrap()
            .push(format!("error:{}:{}", file_id, error));
    }
}

// ============================================================================
// Harness
// ============================================================================

struct Harness {
    manager: FileManager,
    load: Arc<MockLoadWorker>,
    generate: Arc<MockGenerateWorker>,
    store: Option<Arc<MockFileStore>>,
    fs: Arc<MockFileSystem>,
}

impl Harness {
    fn new(with_store: bool) -> Self {
        let load = Arc::new(MockLoadWorker::default());
        let generate = Arc::new(MockGenerateWorker::default());
        let store = with_store.then(|| Arc::new(MockFileStore::default()));
        let fs = Arc::new(MockFileSystem::default());
        let config = FileManagerConfig {
            flush_retry_base_delay: Duration::from_millis(1),
            ..Default::default()
        };
        let manager = FileManager::new(
            config,
            load.clone(),
            generate.clone(),
            store
                .clone()
                .map(|store| store as Arc<dyn FileStore>),
            fs.clone(),
        )
        .expect("valid config");
        Self {
            manager,
            load,
            generate,
            store,
            fs,
        }
    }

    fn with_shared_store(store: Arc<MockFileStore>) -> Self {
        let load = Arc::new(MockLoadWorker::default());
        let generate = Arc::new(MockGenerateWorker::default());
        let fs = Arc::new(MockFileSystem::default());
        let config = FileManagerConfig {
            flush_retry_base_delay: Duration::from_millis(1),
            ..Default::default()
        };
        let manager = FileManager::new(
            config,
            load.clone(),
            generate.clone(),
            Some(store.clone() as Arc<dyn FileStore>),
            fs.clone(),
        )
        .expect("valid config");
        Self {
            manager,
            load,
            generate,
            store: Some(store),
            fs,
        }
    }
}

fn photo_remote(server_id: i64) -> FullRemoteFileLocation {
    FullRemoteFileLocation {
        file_type: FileType::Photo,
        server_id,
        access_hash: server_id ^ 0x5a5a,
    }
}

fn photo_local(path: &str) -> FullLocalFileLocation {
    FullLocalFileLocation {
        file_type: FileType::Photo,
        path: path.to_string(),
        mtime_nsec: 0,
    }
}

// ============================================================================
// Scenario: download, then re-register the downloaded path
// ============================================================================

#[tokio::test]
async fn test_download_then_reregister_local() {
    let mut h = Harness::new(false);
    let remote = photo_remote(1001);
    let h1 = h
        .manager
        .register_remote(
            remote.clone(),
            LocationSource::FromServer,
            ChatId(7),
            1000,
            0,
            "pic.jpg".to_string(),
        )
        .await;

    let callback = Arc::new(RecordingDownloadCallback::default());
    h.manager
        .download(h1, Some(callback.clone()), 5)
        .await
        .unwrap();
    let (query_id, priority) = h.load.last_download();
    assert_eq!(priority, 5);

    h.manager
        .on_partial_download(
            query_id,
            PartialLocalFileLocation {
                file_type: FileType::Photo,
                path: "/cache/photos/1001.part".to_string(),
                part_size: 500,
                ready_part_count: 1,
                is_writable: true,
            },
            500,
        )
        .await;
    assert_eq!(callback.events(), vec![format!("progress:{}", h1)]);

    let local = photo_local("/cache/photos/1001.jpg");
    h.fs.add_file(&local.path, 1000, 11);
    h.manager
        .on_download_ok(query_id, local.clone(), 1000)
        .await;
    assert_eq!(
        callback.events(),
        vec![format!("progress:{}", h1), format!("ok:{}", h1)]
    );

    // Registering the downloaded path lands on the same node.
    let h2 = h
        .manager
        .register_local(local.clone(), ChatId(7), 1000, false, false)
        .await
        .unwrap();
    assert_ne!(h1, h2);

    let unified = h.manager.merge(h1, h2, false).await.unwrap();
    let view = h.manager.get_file_view(h2).unwrap();
    assert_eq!(view.file_id(), unified);
    assert_eq!(view.local_location().unwrap().path, local.path);
    assert_eq!(view.remote_location().unwrap(), &remote);
    assert_eq!(view.size(), 1000);
}

// ============================================================================
// Scenario: upload, pause, then merge in a server reference
// ============================================================================

#[tokio::test]
async fn test_upload_pause_and_remote_merge() {
    let mut h = Harness::new(false);
    let local = photo_local("/photos/outgoing.jpg");
    h.fs.add_file(&local.path, 2000, 5);

    let file_id = h
        .manager
        .register_local(local, ChatId(3), 2000, false, false)
        .await
        .unwrap();

    let callback = Arc::new(RecordingUploadCallback::default());
    h.manager
        .upload(file_id, Some(callback.clone()), 3, 1)
        .await
        .unwrap();
    let (query_id, bad_parts, upload_order, priority) = h.load.last_upload();
    assert!(bad_parts.is_empty());
    assert_eq!(upload_order, 1);
    assert_eq!(priority, 3);

    h.manager
        .on_upload_ok(
            query_id,
            FileType::Photo,
            PartialRemoteFileLocation {
                server_id: 777,
                part_count: 4,
                part_size: 512,
                ready_part_count: 4,
                is_big: false,
            },
            2000,
        )
        .await;
    assert_eq!(callback.events(), vec![format!("ok:{}:777", file_id)]);

    // Further uploads stay paused.
    let second = Arc::new(RecordingUploadCallback::default());
    let alias = h.manager.dup_file_id(file_id).unwrap();
    h.manager
        .upload(alias, Some(second.clone()), 3, 2)
        .await
        .unwrap();
    assert_eq!(h.load.upload_count(), 1);

    // A merge that changes the remote location releases the pause and
    // satisfies the waiting subscriber from the server reference.
    let remote = photo_remote(777);
    let remote_handle = h
        .manager
        .register_remote(
            remote.clone(),
            LocationSource::FromServer,
            ChatId(3),
            2000,
            0,
            String::new(),
        )
        .await;
    h.manager.merge(file_id, remote_handle, false).await.unwrap();

    let view = h.manager.get_file_view(file_id).unwrap();
    assert_eq!(view.remote_location().unwrap(), &remote);
    assert_eq!(second.events(), vec![format!("ok:{}:777", alias)]);
}

// ============================================================================
// Scenario: persistence reload
// ============================================================================

#[tokio::test]
async fn test_persistence_reload_by_local_path() {
    let store = Arc::new(MockFileStore::default());
    let remote = photo_remote(42);
    let local = photo_local("/cache/photos/42.jpg");

    {
        let mut h = Harness::with_shared_store(store.clone());
        let remote_handle = h
            .manager
            .register_remote(
                remote.clone(),
                LocationSource::FromServer,
                ChatId(1),
                1000,
                0,
                "42.jpg".to_string(),
            )
            .await;
        let local_handle = h
            .manager
            .register_local(local.clone(), ChatId(1), 1000, false, true)
            .await
            .unwrap();
        h.manager
            .merge(remote_handle, local_handle, false)
            .await
            .unwrap();
        assert!(store.record_count() >= 1);
    }

    // Fresh manager, same store: the local path alone recovers the record.
    let mut h2 = Harness::with_shared_store(store.clone());
    let reloaded = h2
        .manager
        .register_local(local.clone(), ChatId(1), 0, false, true)
        .await
        .unwrap();
    let view = h2.manager.get_file_view(reloaded).unwrap();
    assert_eq!(view.remote_location().unwrap(), &remote);
    assert_eq!(view.size(), 1000);
    assert_eq!(h2.load.download_count(), 0);
}

// ============================================================================
// Scenario: priority arbitration
// ============================================================================

#[tokio::test]
async fn test_priority_arbitration_reprioritizes_without_cancel() {
    let mut h = Harness::new(false);
    let file_id = h
        .manager
        .register_remote(
            photo_remote(9),
            LocationSource::FromServer,
            ChatId(0),
            1000,
            0,
            String::new(),
        )
        .await;

    let cb1 = Arc::new(RecordingDownloadCallback::default());
    h.manager.download(file_id, Some(cb1), 2).await.unwrap();
    let (query_id, priority) = h.load.last_download();
    assert_eq!(priority, 2);

    let alias = h.manager.dup_file_id(file_id).unwrap();
    let cb2 = Arc::new(RecordingDownloadCallback::default());
    h.manager.download(alias, Some(cb2), 7).await.unwrap();
    assert_eq!(h.load.updates(), vec![(query_id, 7)]);

    // Withdrawing the high-priority request re-prioritizes; it does not
    // cancel.
    h.manager.download(alias, None, 0).await.unwrap();
    assert_eq!(h.load.updates(), vec![(query_id, 7), (query_id, 2)]);
    assert!(h.load.cancels().is_empty());
    assert_eq!(h.load.download_count(), 1);
}

// ============================================================================
// Scenario: encryption key conflict
// ============================================================================

#[tokio::test]
async fn test_encryption_key_conflict_is_rejected() {
    let mut h = Harness::new(false);
    let key1 = EncryptionKey::new(vec![1u8; 32]);
    let record = FileRecord {
        remote: RemoteFileLocation::Full(FullRemoteFileLocation {
            file_type: FileType::Encrypted,
            server_id: 5,
            access_hash: 6,
        }),
        size: 100,
        encryption_key: key1.as_slice().to_vec(),
        ..Default::default()
    };
    let file_id = h
        .manager
        .register_from_record(record, LocationSource::FromStore)
        .await
        .unwrap();

    let key2 = EncryptionKey::new(vec![2u8; 32]);
    assert!(!h.manager.set_encryption_key(file_id, key2).await);
    assert!(h.manager.set_encryption_key(file_id, key1.clone()).await);
    let view = h.manager.get_file_view(file_id).unwrap();
    assert_eq!(view.encryption_key(), &key1);
}

// ============================================================================
// Scenario: bad local path negative cache
// ============================================================================

#[tokio::test]
async fn test_bad_local_path_short_circuits() {
    let mut h = Harness::new(false);
    let missing = photo_local("/photos/not-there.jpg");

    let first = h
        .manager
        .register_local(missing.clone(), ChatId(0), 0, false, false)
        .await;
    assert!(matches!(first, Err(FileError::LocalFileGone { .. })));
    assert_eq!(h.fs.stat_calls(), 1);

    let second = h
        .manager
        .register_local(missing, ChatId(0), 0, false, false)
        .await;
    assert!(matches!(second, Err(FileError::LocalFileGone { .. })));
    // the second attempt never touched the filesystem
    assert_eq!(h.fs.stat_calls(), 1);
}

// ============================================================================
// Round-trip laws
// ============================================================================

#[tokio::test]
async fn test_register_remote_twice_resolves_to_same_node() {
    let mut h = Harness::new(false);
    let remote = photo_remote(31337);
    let h1 = h
        .manager
        .register_remote(
            remote.clone(),
            LocationSource::FromServer,
            ChatId(0),
            0,
            0,
            String::new(),
        )
        .await;
    let h2 = h
        .manager
        .register_remote(
            remote,
            LocationSource::FromServer,
            ChatId(0),
            0,
            0,
            String::new(),
        )
        .await;
    assert_ne!(h1, h2);
    assert_eq!(
        h.manager.get_file_view(h1).unwrap().file_id(),
        h.manager.get_file_view(h2).unwrap().file_id()
    );
}

#[tokio::test]
async fn test_persistent_id_round_trip_aliases_same_node() {
    let mut h = Harness::new(false);
    let file_id = h
        .manager
        .register_remote(
            photo_remote(64),
            LocationSource::FromServer,
            ChatId(0),
            0,
            0,
            String::new(),
        )
        .await;
    let token = h.manager.to_persistent_id(file_id).unwrap();
    let decoded = h
        .manager
        .from_persistent_id(&token, FileType::Photo)
        .await
        .unwrap();
    assert_eq!(
        h.manager.get_file_view(file_id).unwrap().file_id(),
        h.manager.get_file_view(decoded).unwrap().file_id()
    );
}

#[tokio::test]
async fn test_merge_is_idempotent() {
    let mut h = Harness::new(false);
    let local = photo_local("/photos/a.jpg");
    h.fs.add_file(&local.path, 10, 1);
    let a = h
        .manager
        .register_local(local, ChatId(0), 10, false, false)
        .await
        .unwrap();
    let b = h
        .manager
        .register_remote(
            photo_remote(8),
            LocationSource::FromServer,
            ChatId(0),
            10,
            0,
            String::new(),
        )
        .await;

    let first = h.manager.merge(a, b, false).await.unwrap();
    let second = h.manager.merge(a, b, false).await.unwrap();
    assert_eq!(first, second);
    let view = h.manager.get_file_view(a).unwrap();
    assert!(view.has_local_location());
    assert!(view.has_remote_location());
}

#[tokio::test]
async fn test_merge_with_conflicting_keys_fails_and_destroys_nothing() {
    let mut h = Harness::new(false);
    let a = h
        .manager
        .register_from_record(
            FileRecord {
                remote: RemoteFileLocation::Full(FullRemoteFileLocation {
                    file_type: FileType::Encrypted,
                    server_id: 1,
                    access_hash: 1,
                }),
                encryption_key: vec![1u8; 32],
                size: 10,
                ..Default::default()
            },
            LocationSource::FromUser,
        )
        .await
        .unwrap();
    let b = h
        .manager
        .register_from_record(
            FileRecord {
                remote: RemoteFileLocation::Full(FullRemoteFileLocation {
                    file_type: FileType::Encrypted,
                    server_id: 2,
                    access_hash: 2,
                }),
                encryption_key: vec![2u8; 32],
                size: 10,
                ..Default::default()
            },
            LocationSource::FromUser,
        )
        .await
        .unwrap();

    let result = h.manager.merge(a, b, false).await;
    assert!(matches!(result, Err(FileError::MergeConflict(_))));
    assert!(h.manager.get_file_view(a).is_ok());
    assert!(h.manager.get_file_view(b).is_ok());
}

// ============================================================================
// Boundary behaviors
// ============================================================================

#[tokio::test]
async fn test_delete_partial_remote_location_refuses_full_remote() {
    let mut h = Harness::new(false);
    let remote = photo_remote(2);
    let file_id = h
        .manager
        .register_remote(
            remote.clone(),
            LocationSource::FromServer,
            ChatId(0),
            0,
            0,
            String::new(),
        )
        .await;
    assert!(!h.manager.delete_partial_remote_location(file_id).await);
    let view = h.manager.get_file_view(file_id).unwrap();
    assert_eq!(view.remote_location().unwrap(), &remote);
}

#[tokio::test]
async fn test_force_registration_skips_filesystem() {
    let mut h = Harness::new(false);
    let ghost = photo_local("/photos/replayed.jpg");
    let file_id = h
        .manager
        .register_local(ghost.clone(), ChatId(0), 123, false, true)
        .await
        .unwrap();
    assert_eq!(h.fs.stat_calls(), 0);
    let view = h.manager.get_file_view(file_id).unwrap();
    assert_eq!(view.local_location().unwrap().path, ghost.path);
    assert_eq!(view.size(), 123);
}

#[tokio::test]
async fn test_generate_feeds_download_subscribers() {
    let mut h = Harness::new(false);
    let file_id = h
        .manager
        .register_generate(
            FileType::Thumbnail,
            "/photos/original.jpg".to_string(),
            "scale:128".to_string(),
            ChatId(0),
            4096,
        )
        .await
        .unwrap();

    let callback = Arc::new(RecordingDownloadCallback::default());
    h.manager
        .download(file_id, Some(callback.clone()), 4)
        .await
        .unwrap();
    let (query_id, generate, priority) = h.generate.last_started();
    assert_eq!(generate.conversion, "scale:128");
    assert_eq!(priority, 4);

    h.manager
        .on_partial_generate(
            query_id,
            PartialLocalFileLocation {
                file_type: FileType::Thumbnail,
                path: "/cache/thumbs/original.jpg".to_string(),
                part_size: 1024,
                ready_part_count: 2,
                is_writable: true,
            },
            4096,
        )
        .await;

    let generated = "/cache/thumbs/original.jpg";
    h.fs.add_file(generated, 4096, 3);
    h.manager
        .on_generate_ok(
            query_id,
            FullLocalFileLocation {
                file_type: FileType::Thumbnail,
                path: generated.to_string(),
                mtime_nsec: 3,
            },
        )
        .await;

    assert_eq!(
        callback.events(),
        vec![format!("progress:{}", file_id), format!("ok:{}", file_id)]
    );
    let view = h.manager.get_file_view(file_id).unwrap();
    assert_eq!(view.local_location().unwrap().path, generated);
}

#[tokio::test]
async fn test_delete_file_keeps_remote_and_removes_local() {
    let mut h = Harness::new(false);
    let local = photo_local("/photos/temp.jpg");
    h.fs.add_file(&local.path, 50, 2);
    let a = h
        .manager
        .register_local(local.clone(), ChatId(0), 50, false, false)
        .await
        .unwrap();
    let b = h
        .manager
        .register_remote(
            photo_remote(55),
            LocationSource::FromServer,
            ChatId(0),
            50,
            0,
            String::new(),
        )
        .await;
    h.manager.merge(a, b, false).await.unwrap();

    h.manager.delete_file(a, "test").await.unwrap();
    assert_eq!(h.fs.deleted(), vec![local.path.clone()]);
    let view = h.manager.get_file_view(a).unwrap();
    assert!(!view.has_local_location());
    assert!(view.has_remote_location());
}

#[tokio::test]
async fn test_flush_retries_through_transient_store_outage() {
    let store = Arc::new(MockFileStore::default());
    store.fail_next_stores(1);
    let mut h = Harness::with_shared_store(store.clone());

    h.manager
        .register_remote(
            photo_remote(12),
            LocationSource::FromServer,
            ChatId(0),
            10,
            0,
            String::new(),
        )
        .await;

    // first attempt failed, a retry succeeded
    assert!(store.store_calls.load(Ordering::SeqCst) >= 2);
    assert_eq!(store.record_count(), 1);
}

#[tokio::test]
async fn test_set_content_uses_reserved_priority() {
    let mut h = Harness::new(false);
    let file_id = h.manager.register_empty(FileType::Document);
    assert!(
        h.manager
            .set_content(file_id, Bytes::from_static(b"payload"))
            .await
    );
    let calls = h.load.from_bytes_calls.lock().unwrap().clone();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].1, FileType::Document);

    // completion arrives as a download-ok
    let query_id = calls[0].0;
    h.fs.add_file("/cache/documents/blob.bin", 7, 9);
    h.manager
        .on_download_ok(
            query_id,
            FullLocalFileLocation {
                file_type: FileType::Document,
                path: "/cache/documents/blob.bin".to_string(),
                mtime_nsec: 9,
            },
            7,
        )
        .await;
    let view = h.manager.get_file_view(file_id).unwrap();
    assert!(view.has_local_location());
    assert_eq!(view.size(), 7);
}

#[tokio::test]
async fn test_cancelled_query_callbacks_are_no_ops() {
    let mut h = Harness::new(false);
    let file_id = h
        .manager
        .register_remote(
            photo_remote(70),
            LocationSource::FromServer,
            ChatId(0),
            100,
            0,
            String::new(),
        )
        .await;
    let callback = Arc::new(RecordingDownloadCallback::default());
    h.manager
        .download(file_id, Some(callback.clone()), 1)
        .await
        .unwrap();
    let (query_id, _) = h.load.last_download();

    // withdraw the only request; the worker is cancelled
    h.manager.download(file_id, None, 0).await.unwrap();
    assert_eq!(h.load.cancels(), vec![query_id]);

    // late callbacks for the cancelled query change nothing
    h.manager
        .on_download_ok(query_id, photo_local("/cache/photos/ghost.jpg"), 100)
        .await;
    let view = h.manager.get_file_view(file_id).unwrap();
    assert!(!view.has_local_location());
    assert!(callback.events().is_empty());
}

#[tokio::test]
async fn test_download_error_surfaces_to_subscribers() {
    let mut h = Harness::new(false);
    let file_id = h
        .manager
        .register_remote(
            photo_remote(90),
            LocationSource::FromServer,
            ChatId(0),
            100,
            0,
            String::new(),
        )
        .await;
    let callback = Arc::new(RecordingDownloadCallback::default());
    h.manager
        .download(file_id, Some(callback.clone()), 6)
        .await
        .unwrap();
    let (query_id, _) = h.load.last_download();

    h.manager
        .on_error(query_id, FileError::RemoteNotFound("410".to_string()))
        .await;
    let events = callback.events();
    assert_eq!(events.len(), 1);
    assert!(events[0].starts_with(&format!("error:{}", file_id)));

    // the failed worker slot was freed
    let view = h.manager.get_file_view(file_id).unwrap();
    assert!(!view.is_downloading());
}

#[tokio::test]
async fn test_reregistering_stale_path_demotes_local_and_keeps_remote() {
    let mut h = Harness::new(false);
    let local = photo_local("/photos/stale.jpg");
    h.fs.add_file(&local.path, 1000, 5);
    let a = h
        .manager
        .register_local(local.clone(), ChatId(0), 1000, false, false)
        .await
        .unwrap();
    let b = h
        .manager
        .register_remote(
            photo_remote(21),
            LocationSource::FromServer,
            ChatId(0),
            1000,
            0,
            String::new(),
        )
        .await;
    h.manager.merge(a, b, false).await.unwrap();

    // the file changes on disk behind the manager's back
    h.fs.add_file(&local.path, 999, 6);

    let again = h
        .manager
        .register_local(local.clone(), ChatId(0), 0, false, false)
        .await
        .unwrap();
    let view = h.manager.get_file_view(again).unwrap();
    assert!(!view.has_local_location());
    assert!(view.has_remote_location());
    // still the same node
    assert_eq!(view.file_id(), h.manager.get_file_view(a).unwrap().file_id());

    // the path was not blacklisted: once the disk settles it registers again
    h.fs.add_file(&local.path, 2000, 9);
    assert!(h
        .manager
        .register_local(local, ChatId(0), 0, false, false)
        .await
        .is_ok());
}

#[tokio::test]
async fn test_reregistering_vanished_local_only_path_fails() {
    let mut h = Harness::new(false);
    let local = photo_local("/photos/lonely.jpg");
    h.fs.add_file(&local.path, 100, 3);
    let file_id = h
        .manager
        .register_local(local.clone(), ChatId(0), 100, false, false)
        .await
        .unwrap();

    // with no other location the registration has nothing to fall back on
    h.fs.add_file(&local.path, 101, 4);
    let result = h
        .manager
        .register_local(local, ChatId(0), 0, false, false)
        .await;
    assert!(matches!(result, Err(FileError::LocalFileGone { .. })));
    let view = h.manager.get_file_view(file_id).unwrap();
    assert!(!view.has_local_location());
}

#[tokio::test]
async fn test_locationless_node_is_dropped_with_its_last_handle() {
    let mut h = Harness::new(false);
    let file_id = h.manager.register_empty(FileType::Document);
    assert!(h.manager.get_file_view(file_id).is_ok());

    // withdrawing the only request leaves nothing worth keeping
    h.manager.download(file_id, None, 0).await.unwrap();
    assert!(matches!(
        h.manager.get_file_view(file_id),
        Err(FileError::NotFoundHandle(_))
    ));
}

#[tokio::test]
async fn test_upload_order_is_minimum_over_requesters() {
    let mut h = Harness::new(false);
    let local = photo_local("/photos/ordered.jpg");
    h.fs.add_file(&local.path, 10, 1);
    let file_id = h
        .manager
        .register_local(local, ChatId(0), 10, false, false)
        .await
        .unwrap();
    let alias = h.manager.dup_file_id(file_id).unwrap();

    h.manager.upload(file_id, None, 2, 40).await.unwrap();
    let (_, _, order, _) = h.load.last_upload();
    assert_eq!(order, 40);

    // a second requester with an earlier order does not restart the upload
    h.manager.upload(alias, None, 2, 15).await.unwrap();
    assert_eq!(h.load.upload_count(), 1);
}
