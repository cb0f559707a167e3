//! Persistence Coordinator
//!
//! Two flush channels per node: the info channel broadcasts a user-visible
//! `Updated` event when something observable changed and at least one handle
//! asked for updates; the pmc channel writes the complete current record to
//! the durable store when durable state changed. Flushes coalesce naturally
//! (whatever state is current at the flush boundary is what gets written) and
//! failed store writes leave the node dirty so the record is never lost from
//! memory.

use std::path::Path;

use bridge_traits::{FileDbId, FileRecord, FullLocalFileLocation, LocalFileLocation, QueryId};
use core_runtime::events::FileEvent;
use tracing::{info, warn};

use crate::error::{FileError, Result};
use crate::handle::{FileId, FileNodeId};
use crate::manager::FileManager;
use crate::node::FileNode;

impl FileManager {
    /// Flush both channels of one node, plus any store deletions deferred by
    /// `no_sync` merges.
    pub(crate) async fn try_flush_node(&mut self, node_id: FileNodeId) {
        self.try_flush_node_info(node_id);
        self.flush_pending_store_deletes().await;
        self.try_flush_node_pmc(node_id).await;
    }

    /// Broadcast an `Updated` event if the node changed observably and
    /// someone subscribed to its updates.
    fn try_flush_node_info(&mut self, node_id: FileNodeId) {
        let Some(node) = self.node_ref(node_id) else {
            return;
        };
        if !node.info_dirty {
            return;
        }
        let wants_updates = node.file_ids.iter().any(|&file_id| {
            self.file_id_infos
                .get((file_id.0 - 1) as usize)
                .map(|file_info| file_info.send_updates && !file_info.forgotten)
                .unwrap_or(false)
        });
        if !wants_updates {
            // stays dirty until someone subscribes
            return;
        }
        let main_file_id = node.main_file_id;
        if let Some(node) = self.node_mut(node_id) {
            node.info_dirty = false;
        }
        self.event_bus
            .emit(FileEvent::Updated {
                file_id: main_file_id.0,
            })
            .ok();
    }

    async fn flush_pending_store_deletes(&mut self) {
        if self.pending_pmc_deletes.is_empty() {
            return;
        }
        let ids = std::mem::take(&mut self.pending_pmc_deletes);
        let Some(store) = self.store.clone() else {
            return;
        };
        for id in ids {
            if let Err(e) = store.delete(id).await {
                warn!("Failed to delete file record {}: {}", id, e);
            }
        }
    }

    /// Write the node's complete current record to the store, retrying with
    /// backoff. On exhaustion the node stays `pmc_dirty` and is retried at
    /// the next dirty transition.
    async fn try_flush_node_pmc(&mut self, node_id: FileNodeId) {
        let Some(store) = self.store.clone() else {
            return;
        };
        let (record, current_pmc_id, new_local, new_remote, new_generate) = {
            let Some(node) = self.node_ref(node_id) else {
                return;
            };
            if !node.pmc_dirty || !node.has_persistent_key() {
                return;
            }
            (
                Self::build_record(node),
                node.pmc_id,
                node.new_local_key,
                node.new_remote_key,
                node.new_generate_key,
            )
        };

        let pmc_id = if current_pmc_id.is_valid() {
            current_pmc_id
        } else {
            match store.next_id().await {
                Ok(id) => {
                    if let Some(node) = self.node_mut(node_id) {
                        node.pmc_id = id;
                    }
                    self.pmc_id_to_node_id.insert(id, node_id);
                    id
                }
                Err(e) => {
                    warn!("Failed to allocate a file record id: {}", e);
                    return;
                }
            }
        };

        let mut delay = self.config.flush_retry_base_delay;
        for attempt in 1..=self.config.flush_retry_attempts {
            match store
                .store(pmc_id, &record, new_local, new_remote, new_generate)
                .await
            {
                Ok(()) => {
                    if let Some(node) = self.node_mut(node_id) {
                        node.pmc_dirty = false;
                        node.new_local_key = false;
                        node.new_remote_key = false;
                        node.new_generate_key = false;
                    }
                    return;
                }
                Err(e) => {
                    warn!(
                        "Flush attempt {}/{} for file record {} failed: {}",
                        attempt, self.config.flush_retry_attempts, pmc_id, e
                    );
                    if attempt < self.config.flush_retry_attempts {
                        tokio::time::sleep(delay).await;
                        delay *= 2;
                    }
                }
            }
        }
    }

    fn build_record(node: &FileNode) -> FileRecord {
        FileRecord {
            local: node.local.clone(),
            remote: node.remote.clone(),
            generate: node.generate.clone(),
            size: node.size,
            expected_size: node.expected_size,
            name: node.name.clone(),
            url: node.url.clone(),
            owner_id: node.owner_id,
            encryption_key: node.encryption_key.as_slice().to_vec(),
            get_by_hash: node.get_by_hash,
        }
    }

    /// Delete a store row, e.g. for the losing node of a merge.
    pub(crate) async fn clear_from_store(&mut self, pmc_id: FileDbId) {
        self.pmc_id_to_node_id.remove(&pmc_id);
        let Some(store) = self.store.clone() else {
            return;
        };
        if let Err(e) = store.delete(pmc_id).await {
            warn!("Failed to delete file record {}: {}", pmc_id, e);
        }
    }

    // ========================================================================
    // Local file lifecycle
    // ========================================================================

    /// Delete the file's local copy: stop the workers that touch it, remove
    /// the file from disk, and demote the local location to empty. The remote
    /// and generate locations survive, so the file stays re-downloadable.
    pub async fn delete_file(&mut self, file_id: FileId, source: &str) -> Result<()> {
        let node_id = self.node_id_of(file_id)?;
        info!("Deleting local file {} from {}", file_id, source);

        let mut cancel_load_queries: Vec<QueryId> = Vec::new();
        let mut cancel_generate_queries: Vec<QueryId> = Vec::new();
        let path = {
            let Some(node) = self.node_mut(node_id) else {
                return Err(FileError::NotFoundHandle(file_id.0));
            };
            if node.download_query.is_valid() {
                cancel_load_queries.push(node.download_query);
                node.download_query = QueryId(0);
                node.download_priority = 0;
            }
            if node.upload_query.is_valid() {
                cancel_load_queries.push(node.upload_query);
                node.upload_query = QueryId(0);
                node.upload_priority = 0;
            }
            if node.generate_query.is_valid() {
                cancel_generate_queries.push(node.generate_query);
                node.generate_query = QueryId(0);
                node.generate_priority = 0;
            }
            node.local.path().map(|p| p.to_string())
        };
        for query_id in &cancel_load_queries {
            self.finish_query(*query_id);
        }
        for query_id in &cancel_generate_queries {
            self.finish_query(*query_id);
        }
        for query_id in cancel_load_queries {
            self.load_worker.cancel(query_id).await;
        }
        for query_id in cancel_generate_queries {
            self.generate_worker.cancel(query_id).await;
        }

        if let Some(path) = path {
            self.local_location_to_file_id.remove(&path);
            if let Err(e) = self.fs.delete_file(Path::new(&path)).await {
                warn!("Failed to delete local file {}: {}", path, e);
            }
        }

        let main_file_id = {
            let Some(node) = self.node_mut(node_id) else {
                return Err(FileError::NotFoundHandle(file_id.0));
            };
            node.set_local_location(LocalFileLocation::Empty, 0);
            node.is_download_started = false;
            node.main_file_id
        };
        self.event_bus
            .emit(FileEvent::Deleted {
                file_id: main_file_id.0,
            })
            .ok();

        self.run_scheduler(node_id).await;
        self.try_flush_node(node_id).await;
        Ok(())
    }

    /// Host notification that a local path disappeared outside the manager's
    /// control.
    pub async fn on_file_unlink(&mut self, location: &FullLocalFileLocation) {
        let Some(&file_id) = self.local_location_to_file_id.get(&location.path) else {
            return;
        };
        let Ok(node_id) = self.node_id_of(file_id) else {
            return;
        };
        self.demote_local_location(node_id).await;
        self.run_scheduler(node_id).await;
        self.try_flush_node(node_id).await;
    }
}
