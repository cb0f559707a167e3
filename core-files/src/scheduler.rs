//! Scheduler
//!
//! Decides, per node, whether to start, keep, re-prioritize, or cancel a
//! download, upload, or generation. The decision is a pure function of the
//! node's fields and the per-handle priorities, so re-running the scheduler on
//! unchanged state never churns workers.
//!
//! Planning runs synchronously against the node (allocating query ids and
//! updating the commanded priorities), producing a list of worker commands
//! that are executed afterwards without any node borrow held across an await.

use bridge_traits::{
    EncryptionKey, FullGenerateFileLocation, FullLocalFileLocation, FullRemoteFileLocation,
    LocalFileLocation, QueryId, RemoteFileLocation, UploadedEncryptedFile, UploadedFile,
};
use tracing::warn;

use crate::handle::FileNodeId;
use crate::manager::{FileManager, QueryKind};

pub(crate) enum WorkerCommand {
    StartDownload {
        query_id: QueryId,
        node_id: FileNodeId,
        remote: FullRemoteFileLocation,
        local: LocalFileLocation,
        size: i64,
        name: String,
        encryption_key: EncryptionKey,
        is_started: bool,
        priority: i8,
    },
    StartUpload {
        query_id: QueryId,
        node_id: FileNodeId,
        local: FullLocalFileLocation,
        remote: RemoteFileLocation,
        expected_size: i64,
        encryption_key: EncryptionKey,
        bad_parts: Vec<i32>,
        by_hash: bool,
        upload_order: u64,
        priority: i8,
    },
    StartGenerate {
        query_id: QueryId,
        node_id: FileNodeId,
        generate: FullGenerateFileLocation,
        local: LocalFileLocation,
        name: String,
        priority: i8,
    },
    UpdateLoadPriority {
        query_id: QueryId,
        priority: i8,
    },
    CancelLoad {
        query_id: QueryId,
    },
    CancelGenerate {
        query_id: QueryId,
    },
}

/// Terminal deliveries owed to subscribers because the node's state already
/// satisfies their request.
#[derive(Default)]
pub(crate) struct SchedulerNotifications {
    pub download_ok: bool,
    pub upload_ok: bool,
}

impl FileManager {
    /// Re-evaluate one node against its effective priorities and reconcile
    /// the worker slots. Idempotent.
    pub(crate) async fn run_scheduler(&mut self, node_id: FileNodeId) {
        let (commands, notifications) = self.plan_node(node_id);

        if notifications.download_ok {
            let subscribers = self.take_download_subscribers(node_id);
            for (file_id, callback) in subscribers {
                callback.on_download_ok(file_id);
            }
            self.forget_node_handles(node_id);
        }

        if notifications.upload_ok {
            self.deliver_upload_ok_from_remote(node_id);
        }

        self.execute_commands(commands).await;
    }

    /// Deliver an upload completion synthesized from a full remote location,
    /// e.g. after a merge brought in a server reference while subscribers
    /// were still waiting on an upload.
    pub(crate) fn deliver_upload_ok_from_remote(&mut self, node_id: FileNodeId) {
        let Some(node) = self.node_ref(node_id) else {
            return;
        };
        let Some(remote) = node.remote.full().cloned() else {
            return;
        };
        let encrypted = remote.file_type.is_encrypted() || !node.encryption_key.is_empty();
        let name = node.name.clone();
        let key_fingerprint = node.encryption_key.fingerprint();

        let subscribers = self.take_upload_subscribers(node_id);
        for (file_id, callback) in subscribers {
            if encrypted {
                callback.on_upload_encrypted_ok(
                    file_id,
                    UploadedEncryptedFile {
                        server_id: remote.server_id,
                        part_count: 0,
                        key_fingerprint,
                    },
                );
            } else {
                callback.on_upload_ok(
                    file_id,
                    UploadedFile {
                        server_id: remote.server_id,
                        part_count: 0,
                        name: name.clone(),
                    },
                );
            }
        }
        self.forget_node_handles(node_id);
    }

    fn plan_node(&mut self, node_id: FileNodeId) -> (Vec<WorkerCommand>, SchedulerNotifications) {
        let mut commands = Vec::new();
        let mut notifications = SchedulerNotifications::default();
        let Some(mut node) = self.take_node(node_id) else {
            return (commands, notifications);
        };

        // Effective priorities: max over the node's handles.
        let mut download_priority: i8 = 0;
        let mut upload_priority: i8 = 0;
        let mut upload_order = u64::MAX;
        for &file_id in &node.file_ids {
            let Some(info) = self.file_id_infos.get((file_id.0 - 1) as usize) else {
                continue;
            };
            if info.forgotten {
                continue;
            }
            download_priority = download_priority.max(info.download_priority);
            if info.upload_priority > 0 {
                upload_priority = upload_priority.max(info.upload_priority);
                upload_order = upload_order.min(info.upload_order);
            }
        }
        if upload_order == u64::MAX {
            upload_order = 0;
        }

        let can_download = node.remote.is_full();
        let can_generate = node.generate.is_full();

        // ----- download slot (a set-content write owns it unconditionally) -----
        let set_content_active = node.download_query.is_valid()
            && matches!(
                self.query_kind(node.download_query),
                Some(QueryKind::SetContent)
            );
        let want_download = download_priority > 0 && !node.local.is_full() && can_download;
        if set_content_active {
            // leave the from-bytes write alone
        } else if want_download {
            if node.download_query.is_valid() {
                if node.download_priority != download_priority {
                    node.download_priority = download_priority;
                    commands.push(WorkerCommand::UpdateLoadPriority {
                        query_id: node.download_query,
                        priority: download_priority,
                    });
                }
            } else if let Some(remote) = node.remote.full().cloned() {
                let query_id = self.alloc_query(node.main_file_id, QueryKind::Download);
                node.download_query = query_id;
                node.download_priority = download_priority;
                commands.push(WorkerCommand::StartDownload {
                    query_id,
                    node_id,
                    remote,
                    local: node.local.clone(),
                    size: node.size,
                    name: node.name.clone(),
                    encryption_key: node.encryption_key.clone(),
                    is_started: node.is_download_started,
                    priority: download_priority,
                });
            }
        } else if node.download_query.is_valid() {
            let query_id = node.download_query;
            node.download_query = QueryId(0);
            node.download_priority = 0;
            self.finish_query(query_id);
            commands.push(WorkerCommand::CancelLoad { query_id });
            if node.local.is_full() && download_priority > 0 {
                notifications.download_ok = true;
            }
        } else if node.local.is_full() && download_priority > 0 {
            // already satisfied; subscribers get their terminal ok right away
            notifications.download_ok = true;
        }

        // ----- generate slot -----
        // Generation satisfies downloads when no server copy exists, and
        // produces the local copy an upload needs.
        let paused = node.upload_pause.is_some();
        let generate_for_download =
            download_priority > 0 && !node.local.is_full() && !can_download && can_generate;
        let generate_for_upload = upload_priority > 0
            && !node.local.is_full()
            && !node.remote.is_full()
            && can_generate
            && !paused;
        let generate_priority = i8::max(
            if generate_for_download {
                download_priority
            } else {
                0
            },
            if generate_for_upload { upload_priority } else { 0 },
        );
        if generate_priority > 0 {
            if node.generate_query.is_valid() {
                node.generate_priority = generate_priority;
            } else if let Some(generate) = node.generate.full().cloned() {
                let query_id = self.alloc_query(node.main_file_id, QueryKind::Generate);
                node.generate_query = query_id;
                node.generate_priority = generate_priority;
                commands.push(WorkerCommand::StartGenerate {
                    query_id,
                    node_id,
                    generate,
                    local: node.local.clone(),
                    name: node.name.clone(),
                    priority: generate_priority,
                });
            }
        } else if node.generate_query.is_valid() {
            let query_id = node.generate_query;
            node.generate_query = QueryId(0);
            node.generate_priority = 0;
            self.finish_query(query_id);
            commands.push(WorkerCommand::CancelGenerate { query_id });
        }

        // ----- upload slot -----
        let want_upload = upload_priority > 0
            && node.local.is_full()
            && !node.remote.is_full()
            && node.upload_pause.is_none();
        if want_upload {
            if node.upload_query.is_valid() {
                if node.upload_priority != upload_priority {
                    node.upload_priority = upload_priority;
                    commands.push(WorkerCommand::UpdateLoadPriority {
                        query_id: node.upload_query,
                        priority: upload_priority,
                    });
                }
            } else if let Some(local) = node.local.full().cloned() {
                let kind = if node.get_by_hash {
                    QueryKind::UploadByHash
                } else {
                    QueryKind::Upload
                };
                let query_id = self.alloc_query(node.main_file_id, kind);
                node.upload_query = query_id;
                node.upload_priority = upload_priority;
                let bad_parts = std::mem::take(&mut node.pending_bad_parts);
                commands.push(WorkerCommand::StartUpload {
                    query_id,
                    node_id,
                    local,
                    remote: node.remote.clone(),
                    expected_size: if node.size != 0 {
                        node.size
                    } else {
                        node.expected_size
                    },
                    encryption_key: node.encryption_key.clone(),
                    bad_parts,
                    by_hash: node.get_by_hash,
                    upload_order,
                    priority: upload_priority,
                });
            }
        } else if node.upload_query.is_valid() {
            // an acknowledged upload keeps its query alive while the server
            // reference is being finalized
            let awaiting_finalize = node.upload_pause.is_some() && !node.remote.is_full();
            if !awaiting_finalize {
                let query_id = node.upload_query;
                node.upload_query = QueryId(0);
                node.upload_priority = 0;
                self.finish_query(query_id);
                commands.push(WorkerCommand::CancelLoad { query_id });
                if node.remote.is_full() && upload_priority > 0 {
                    notifications.upload_ok = true;
                }
            }
        } else if node.remote.is_full() && upload_priority > 0 {
            notifications.upload_ok = true;
        }

        self.put_node(node_id, node);
        (commands, notifications)
    }

    async fn execute_commands(&mut self, commands: Vec<WorkerCommand>) {
        for command in commands {
            match command {
                WorkerCommand::StartDownload {
                    query_id,
                    node_id,
                    remote,
                    local,
                    size,
                    name,
                    encryption_key,
                    is_started,
                    priority,
                } => {
                    let result = self
                        .load_worker
                        .start_download(
                            query_id,
                            remote,
                            local,
                            size,
                            name,
                            encryption_key,
                            is_started,
                            priority,
                        )
                        .await;
                    if let Err(e) = result {
                        warn!("Failed to start download query {}: {}", query_id, e);
                        self.finish_query(query_id);
                        if let Some(node) = self.node_mut(node_id) {
                            if node.download_query == query_id {
                                node.download_query = QueryId(0);
                                node.download_priority = 0;
                            }
                        }
                    }
                }
                WorkerCommand::StartUpload {
                    query_id,
                    node_id,
                    local,
                    remote,
                    expected_size,
                    encryption_key,
                    bad_parts,
                    by_hash,
                    upload_order,
                    priority,
                } => {
                    let result = self
                        .load_worker
                        .start_upload(
                            query_id,
                            local,
                            remote,
                            expected_size,
                            encryption_key,
                            bad_parts,
                            by_hash,
                            upload_order,
                            priority,
                        )
                        .await;
                    if let Err(e) = result {
                        warn!("Failed to start upload query {}: {}", query_id, e);
                        self.finish_query(query_id);
                        if let Some(node) = self.node_mut(node_id) {
                            if node.upload_query == query_id {
                                node.upload_query = QueryId(0);
                                node.upload_priority = 0;
                            }
                        }
                    }
                }
                WorkerCommand::StartGenerate {
                    query_id,
                    node_id,
                    generate,
                    local,
                    name,
                    priority,
                } => {
                    let result = self
                        .generate_worker
                        .generate(query_id, generate, local, name, priority)
                        .await;
                    if let Err(e) = result {
                        warn!("Failed to start generate query {}: {}", query_id, e);
                        self.finish_query(query_id);
                        if let Some(node) = self.node_mut(node_id) {
                            if node.generate_query == query_id {
                                node.generate_query = QueryId(0);
                                node.generate_priority = 0;
                            }
                        }
                    }
                }
                WorkerCommand::UpdateLoadPriority { query_id, priority } => {
                    self.load_worker.update_priority(query_id, priority).await;
                }
                WorkerCommand::CancelLoad { query_id } => {
                    self.load_worker.cancel(query_id).await;
                }
                WorkerCommand::CancelGenerate { query_id } => {
                    self.generate_worker.cancel(query_id).await;
                }
            }
        }
    }
}
