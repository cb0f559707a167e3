//! Worker Callback Surface
//!
//! Inbound entry points invoked by the load and generate workers. Every
//! callback is correlated back to a node through the in-flight query table;
//! callbacks for queries that were already finished or cancelled fall through
//! as no-ops. Errors are triaged in `on_error_impl`, which decides between
//! demote-and-reschedule and surfacing a terminal error to subscribers.

use std::path::Path;

use bridge_traits::{
    FileType, FullLocalFileLocation, FullRemoteFileLocation, LocalFileLocation, LocationSource,
    PartialLocalFileLocation, PartialRemoteFileLocation, QueryId, RemoteFileLocation,
    UploadedEncryptedFile, UploadedFile,
};
use tracing::{debug, warn};

use crate::error::FileError;
use crate::handle::{FileId, FileNodeId};
use crate::manager::{file_name_for, FileManager, QueryKind};

impl FileManager {
    /// The worker began moving bytes for a download.
    pub async fn on_start_download(&mut self, query_id: QueryId) {
        let Some(query) = self.queries.get(&query_id).copied() else {
            return;
        };
        let Ok(node_id) = self.node_id_of(query.file_id) else {
            return;
        };
        if let Some(node) = self.node_mut(node_id) {
            if node.download_query != query_id {
                return;
            }
            if !node.is_download_started {
                node.is_download_started = true;
                node.on_info_changed();
            }
        }
        self.try_flush_node(node_id).await;
    }

    /// A download produced more local bytes.
    pub async fn on_partial_download(
        &mut self,
        query_id: QueryId,
        partial_local: PartialLocalFileLocation,
        ready_size: i64,
    ) {
        let Some(query) = self.queries.get(&query_id).copied() else {
            return;
        };
        let Ok(node_id) = self.node_id_of(query.file_id) else {
            return;
        };
        if let Some(node) = self.node_mut(node_id) {
            if node.download_query != query_id {
                return;
            }
            node.set_local_location(LocalFileLocation::Partial(partial_local), ready_size);
        }
        for (file_id, callback) in self.download_progress_subscribers(node_id) {
            callback.on_progress(file_id);
        }
        self.try_flush_node(node_id).await;
    }

    /// A download finished with a complete local file.
    pub async fn on_download_ok(
        &mut self,
        query_id: QueryId,
        local: FullLocalFileLocation,
        size: i64,
    ) {
        let Some(query) = self.finish_query(query_id) else {
            return;
        };
        let Ok(node_id) = self.node_id_of(query.file_id) else {
            return;
        };
        if let Some(node) = self.node_mut(node_id) {
            if node.download_query == query_id {
                node.download_query = QueryId(0);
                node.download_priority = 0;
            }
        }
        debug!("Download query {} finished with {}", query_id, local.path);
        self.on_local_file_ready(node_id, local, size).await;
    }

    /// An upload pushed more bytes to the server.
    pub async fn on_partial_upload(
        &mut self,
        query_id: QueryId,
        partial_remote: PartialRemoteFileLocation,
        ready_size: i64,
    ) {
        let Some(query) = self.queries.get(&query_id).copied() else {
            return;
        };
        let Ok(node_id) = self.node_id_of(query.file_id) else {
            return;
        };
        if let Some(node) = self.node_mut(node_id) {
            if node.upload_query != query_id {
                return;
            }
            let source = node.remote_source;
            node.set_remote_location(
                RemoteFileLocation::Partial(partial_remote),
                source,
                ready_size,
            );
        }
        for (file_id, callback) in self.upload_progress_subscribers(node_id) {
            callback.on_progress(file_id);
        }
        self.try_flush_node(node_id).await;
    }

    /// All parts of an upload were acknowledged. The query stays in flight
    /// until the server reference is finalized via
    /// [`on_upload_full_ok`](Self::on_upload_full_ok); meanwhile further
    /// uploads of this file are paused.
    pub async fn on_upload_ok(
        &mut self,
        query_id: QueryId,
        file_type: FileType,
        partial_remote: PartialRemoteFileLocation,
        size: i64,
    ) {
        let Some(query) = self.queries.get(&query_id).copied() else {
            return;
        };
        if !matches!(query.kind, QueryKind::Upload | QueryKind::UploadByHash) {
            return;
        }
        let Ok(node_id) = self.node_id_of(query.file_id) else {
            return;
        };

        let server_id = partial_remote.server_id;
        let part_count = partial_remote.part_count;
        let (encrypted, name, key_fingerprint) = {
            let Some(node) = self.node_mut(node_id) else {
                return;
            };
            if node.upload_query != query_id {
                return;
            }
            if node.size == 0 && size != 0 {
                node.set_size(size);
            }
            let source = node.remote_source;
            node.set_remote_location(RemoteFileLocation::Partial(partial_remote), source, size);
            node.upload_pause = Some(query.file_id);
            (
                file_type.is_encrypted() || !node.encryption_key.is_empty(),
                node.name.clone(),
                node.encryption_key.fingerprint(),
            )
        };

        let subscribers = self.take_upload_subscribers(node_id);
        for (file_id, callback) in subscribers {
            if encrypted {
                callback.on_upload_encrypted_ok(
                    file_id,
                    UploadedEncryptedFile {
                        server_id,
                        part_count,
                        key_fingerprint,
                    },
                );
            } else {
                callback.on_upload_ok(
                    file_id,
                    UploadedFile {
                        server_id,
                        part_count,
                        name: name.clone(),
                    },
                );
            }
        }
        self.forget_node_handles(node_id);
        self.try_flush_node(node_id).await;
    }

    /// The server finalized the uploaded file's reference.
    pub async fn on_upload_full_ok(&mut self, query_id: QueryId, remote: FullRemoteFileLocation) {
        let Some(query) = self.finish_query(query_id) else {
            return;
        };
        let Ok(node_id) = self.node_id_of(query.file_id) else {
            return;
        };
        let main_file_id = {
            let Some(node) = self.node_mut(node_id) else {
                return;
            };
            if node.upload_query == query_id {
                node.upload_query = QueryId(0);
                node.upload_priority = 0;
            }
            let size = node.size;
            node.set_remote_location(
                RemoteFileLocation::Full(remote.clone()),
                LocationSource::FromServer,
                size,
            );
            node.new_remote_key = true;
            node.main_file_id
        };
        self.claim_remote_index(remote, main_file_id, node_id);
        self.run_scheduler(node_id).await;
        self.try_flush_node(node_id).await;
    }

    /// A generation produced more local bytes.
    pub async fn on_partial_generate(
        &mut self,
        query_id: QueryId,
        partial_local: PartialLocalFileLocation,
        expected_size: i64,
    ) {
        let Some(query) = self.queries.get(&query_id).copied() else {
            return;
        };
        let Ok(node_id) = self.node_id_of(query.file_id) else {
            return;
        };
        if let Some(node) = self.node_mut(node_id) {
            if node.generate_query != query_id {
                return;
            }
            let ready_size =
                i64::from(partial_local.part_size) * i64::from(partial_local.ready_part_count);
            node.set_local_location(LocalFileLocation::Partial(partial_local), ready_size);
            if expected_size > 0 {
                node.set_expected_size(expected_size);
            }
            node.generate_was_update = true;
        }
        for (file_id, callback) in self.download_progress_subscribers(node_id) {
            callback.on_progress(file_id);
        }
        self.try_flush_node(node_id).await;
    }

    /// A generation finished with a complete local file.
    pub async fn on_generate_ok(&mut self, query_id: QueryId, local: FullLocalFileLocation) {
        let Some(query) = self.finish_query(query_id) else {
            return;
        };
        let Ok(node_id) = self.node_id_of(query.file_id) else {
            return;
        };
        if let Some(node) = self.node_mut(node_id) {
            if node.generate_query == query_id {
                node.generate_query = QueryId(0);
                node.generate_priority = 0;
            }
        }
        let size = match self.fs.stat(Path::new(&local.path)).await {
            Ok(stat) => stat.size,
            Err(e) => {
                self.on_error_impl(
                    node_id,
                    QueryKind::Generate,
                    true,
                    FileError::GenerateFailed(format!(
                        "generated file {} is unreadable: {}",
                        local.path, e
                    )),
                )
                .await;
                return;
            }
        };
        debug!("Generate query {} finished with {}", query_id, local.path);
        self.on_local_file_ready(node_id, local, size).await;
    }

    /// Progress of an externally driven generation (e.g. a host application
    /// producing the file itself).
    pub async fn external_file_generate_progress(
        &mut self,
        query_id: QueryId,
        expected_size: i64,
        local_prefix_size: i64,
    ) {
        let Some(query) = self.queries.get(&query_id).copied() else {
            return;
        };
        let Ok(node_id) = self.node_id_of(query.file_id) else {
            return;
        };
        if let Some(node) = self.node_mut(node_id) {
            if node.generate_query != query_id {
                return;
            }
            if expected_size > 0 {
                node.set_expected_size(expected_size);
            }
            let local = node.local.clone();
            node.set_local_location(local, local_prefix_size);
            node.generate_was_update = true;
        }
        for (file_id, callback) in self.download_progress_subscribers(node_id) {
            callback.on_progress(file_id);
        }
        self.try_flush_node(node_id).await;
    }

    /// Completion of an externally driven generation. The generator must have
    /// reported its output path through partial updates before finishing.
    pub async fn external_file_generate_finish(
        &mut self,
        query_id: QueryId,
        result: std::result::Result<(), FileError>,
    ) {
        if let Err(error) = result {
            self.on_error(query_id, error).await;
            return;
        }
        let Some(query) = self.queries.get(&query_id).copied() else {
            return;
        };
        let Ok(node_id) = self.node_id_of(query.file_id) else {
            return;
        };
        let partial = self
            .node_ref(node_id)
            .and_then(|node| match &node.local {
                LocalFileLocation::Partial(partial) => Some(partial.clone()),
                _ => None,
            });
        match partial {
            Some(partial) => {
                let local = FullLocalFileLocation {
                    file_type: partial.file_type,
                    path: partial.path,
                    mtime_nsec: 0,
                };
                self.on_generate_ok(query_id, local).await;
            }
            None => {
                self.on_error(
                    query_id,
                    FileError::GenerateFailed(
                        "generator finished without producing output".to_string(),
                    ),
                )
                .await;
            }
        }
    }

    /// A worker query failed.
    pub async fn on_error(&mut self, query_id: QueryId, error: FileError) {
        let Some(query) = self.finish_query(query_id) else {
            // cancelled or already finished; late errors are no-ops
            return;
        };
        let Ok(node_id) = self.node_id_of(query.file_id) else {
            return;
        };
        if let Some(node) = self.node_mut(node_id) {
            match query.kind {
                QueryKind::Download | QueryKind::SetContent => {
                    if node.download_query == query_id {
                        node.download_query = QueryId(0);
                        node.download_priority = 0;
                    }
                }
                QueryKind::Upload | QueryKind::UploadByHash => {
                    if node.upload_query == query_id {
                        node.upload_query = QueryId(0);
                        node.upload_priority = 0;
                    }
                }
                QueryKind::Generate => {
                    if node.generate_query == query_id {
                        node.generate_query = QueryId(0);
                        node.generate_priority = 0;
                    }
                }
            }
        }
        self.on_error_impl(node_id, query.kind, true, error).await;
    }

    /// Error triage: decide between demote-and-reschedule and surfacing a
    /// terminal error to the matching subscriber set.
    pub(crate) async fn on_error_impl(
        &mut self,
        node_id: FileNodeId,
        kind: QueryKind,
        was_active: bool,
        error: FileError,
    ) {
        if !was_active {
            return;
        }
        warn!("Worker query failed ({:?}): {}", kind, error);

        match kind {
            QueryKind::Download | QueryKind::SetContent => {
                if matches!(error, FileError::LocalFileGone { .. }) {
                    // the partial output vanished; restart from scratch if any
                    // source remains
                    let can_retry = {
                        let Some(node) = self.node_mut(node_id) else {
                            return;
                        };
                        if !node.local.is_full() {
                            node.set_local_location(LocalFileLocation::Empty, 0);
                        }
                        node.is_download_started = false;
                        node.remote.is_full() || node.generate.is_full()
                    };
                    if can_retry {
                        self.run_scheduler(node_id).await;
                        self.try_flush_node(node_id).await;
                        return;
                    }
                }
                let subscribers = self.take_download_subscribers(node_id);
                for (file_id, callback) in subscribers {
                    callback.on_download_error(file_id, error.clone());
                }
            }
            QueryKind::Upload | QueryKind::UploadByHash => {
                if let FileError::LocalFileGone { path, .. } = &error {
                    let can_regenerate = {
                        self.remember_bad_path(path);
                        self.local_location_to_file_id.remove(path);
                        let Some(node) = self.node_mut(node_id) else {
                            return;
                        };
                        node.set_local_location(LocalFileLocation::Empty, 0);
                        node.is_download_started = false;
                        node.generate.is_full() || node.remote.is_full()
                    };
                    if can_regenerate {
                        self.run_scheduler(node_id).await;
                        self.try_flush_node(node_id).await;
                        return;
                    }
                }
                let subscribers = self.take_upload_subscribers(node_id);
                for (file_id, callback) in subscribers {
                    callback.on_upload_error(file_id, error.clone());
                }
            }
            QueryKind::Generate => {
                let remote_available = self
                    .node_ref(node_id)
                    .map(|node| node.remote.is_full())
                    .unwrap_or(false);
                if remote_available {
                    // the server copy can satisfy the same subscribers
                    self.run_scheduler(node_id).await;
                    self.try_flush_node(node_id).await;
                    return;
                }
                let subscribers = self.take_download_subscribers(node_id);
                for (file_id, callback) in subscribers {
                    callback.on_download_error(file_id, error.clone());
                }
                let uploaders = self.take_upload_subscribers(node_id);
                for (file_id, callback) in uploaders {
                    callback.on_upload_error(file_id, error.clone());
                }
            }
        }

        self.forget_node_handles(node_id);
        self.run_scheduler(node_id).await;
        self.try_flush_node(node_id).await;
    }

    /// Common tail of download and generation completion: adopt the full
    /// local location, reconcile sizes, fix up the display name, and hand the
    /// terminal ok to download subscribers.
    pub(crate) async fn on_local_file_ready(
        &mut self,
        node_id: FileNodeId,
        local: FullLocalFileLocation,
        size: i64,
    ) {
        let main_file_id = {
            let Some(node) = self.node_mut(node_id) else {
                return;
            };
            if node.size != 0 && node.size != size {
                warn!(
                    "File {} arrived with size {} but {} was recorded",
                    node.main_file_id, size, node.size
                );
                if !node.pmc_id.is_valid() {
                    // no store record to defer to; trust the bytes on disk
                    node.set_size(size);
                }
            } else {
                node.set_size(size);
            }
            node.is_download_started = false;
            node.set_local_location(LocalFileLocation::Full(local.clone()), size);
            if node.name.is_empty() {
                let name = file_name_for(node.file_type(), &local.path);
                if !name.is_empty() {
                    node.set_name(name);
                }
            }
            node.new_local_key = true;
            node.main_file_id
        };

        self.claim_local_index(local.path.clone(), main_file_id, node_id);

        let subscribers = self.take_download_subscribers(node_id);
        for (file_id, callback) in subscribers {
            callback.on_download_ok(file_id);
        }
        self.forget_node_handles(node_id);
        self.run_scheduler(node_id).await;
        self.try_flush_node(node_id).await;
    }

    /// Point the local index at this node, demoting any other node that still
    /// claims the same path.
    pub(crate) fn claim_local_index(
        &mut self,
        path: String,
        main_file_id: FileId,
        node_id: FileNodeId,
    ) {
        if let Some(&other) = self.local_location_to_file_id.get(&path) {
            if let Ok(other_node_id) = self.node_id_of(other) {
                if other_node_id != node_id {
                    warn!("Local path {} changed owner", path);
                    if let Some(other_node) = self.node_mut(other_node_id) {
                        other_node.set_local_location(LocalFileLocation::Empty, 0);
                    }
                }
            }
        }
        self.local_location_to_file_id.insert(path, main_file_id);
    }

    /// Point the remote index at this node, demoting any other claimant.
    pub(crate) fn claim_remote_index(
        &mut self,
        remote: FullRemoteFileLocation,
        main_file_id: FileId,
        node_id: FileNodeId,
    ) {
        if let Some(&other) = self.remote_location_to_file_id.get(&remote) {
            if let Ok(other_node_id) = self.node_id_of(other) {
                if other_node_id != node_id {
                    warn!("Remote id {} changed owner", remote.server_id);
                    if let Some(other_node) = self.node_mut(other_node_id) {
                        other_node.set_remote_location(
                            RemoteFileLocation::Empty,
                            LocationSource::None,
                            0,
                        );
                    }
                }
            }
        }
        self.remote_location_to_file_id.insert(remote, main_file_id);
    }
}
