//! Merge Engine
//!
//! Unifies two handles that turned out to describe the same logical file.
//! Merge is the only mechanism that destroys a node: the loser's handles are
//! redirected to the winner, its locations and facts are folded in under the
//! conflict policies below, its redundant workers are cancelled, and its
//! store row is scheduled for deletion.
//!
//! Conflict policies:
//! - locations adopt the higher tier; on full-vs-full, local keeps the path
//!   that still exists, remote keeps the better-sourced reference
//!   (server over user over store), generate keeps the winner's recipe
//! - known sizes must match; a mismatch clears the authoritative size and
//!   keeps the larger estimate
//! - encryption keys must match or exactly one be empty, else the merge fails
//!   and both nodes survive

use std::path::Path;

use bridge_traits::{FileDbId, QueryId};
use tracing::{debug, warn};

use crate::error::{FileError, Result};
use crate::handle::{FileId, FileNodeId};
use crate::manager::FileManager;
use crate::node::FileNode;

impl FileManager {
    /// Unify the files behind two handles. Returns the unified main handle.
    /// `no_sync = true` defers store side-effects to the next flush boundary.
    pub async fn merge(
        &mut self,
        x_file_id: FileId,
        y_file_id: FileId,
        no_sync: bool,
    ) -> Result<FileId> {
        let x_node_id = self.node_id_of(x_file_id)?;
        let y_node_id = self.node_id_of(y_file_id)?;
        if x_node_id == y_node_id {
            return Ok(self
                .node_ref(x_node_id)
                .map(|node| node.main_file_id)
                .unwrap_or(x_file_id));
        }

        let (winner_id, loser_id) = {
            let x = self
                .node_ref(x_node_id)
                .ok_or(FileError::NotFoundHandle(x_file_id.0))?;
            let y = self
                .node_ref(y_node_id)
                .ok_or(FileError::NotFoundHandle(y_file_id.0))?;
            if !x.encryption_key.is_empty()
                && !y.encryption_key.is_empty()
                && x.encryption_key != y.encryption_key
            {
                return Err(FileError::MergeConflict(
                    "encryption key mismatch".to_string(),
                ));
            }
            if Self::wins_over(x, y, x_node_id, y_node_id) {
                (x_node_id, y_node_id)
            } else {
                (y_node_id, x_node_id)
            }
        };
        debug!("Merging file nodes {} <- {}", winner_id.0, loser_id.0);

        // Pre-resolve the full-vs-full local conflict: the path that still
        // exists wins. Checked before any mutation so no borrow spans the
        // filesystem await.
        let winner_local_exists = {
            let winner_path = self
                .node_ref(winner_id)
                .and_then(|node| node.local.full())
                .map(|full| full.path.clone());
            let loser_has_other_full = self
                .node_ref(loser_id)
                .and_then(|node| node.local.full())
                .map(|full| Some(&full.path) != winner_path.as_ref())
                .unwrap_or(false);
            match (winner_path, loser_has_other_full) {
                (Some(path), true) => self.fs.exists(Path::new(&path)).await.unwrap_or(false),
                _ => true,
            }
        };

        let Some(loser) = self.take_node(loser_id) else {
            return Err(FileError::NotFoundHandle(y_file_id.0));
        };

        let mut evicted_local_keys: Vec<String> = Vec::new();
        let mut evicted_remote_keys = Vec::new();
        let mut evicted_generate_keys = Vec::new();
        let mut cancel_load_queries: Vec<QueryId> = Vec::new();
        let mut cancel_generate_queries: Vec<QueryId> = Vec::new();
        let mut delete_pmc: Option<FileDbId> = None;

        {
            let Some(winner) = self.file_nodes[winner_id.0].as_mut() else {
                self.file_nodes[loser_id.0] = Some(loser);
                return Err(FileError::NotFoundHandle(x_file_id.0));
            };

            let mut remote_changed = false;

            // ---- local location ----
            if loser.local.tier() > winner.local.tier() {
                winner.set_local_location(loser.local.clone(), loser.local_ready_size);
                winner.is_download_started = loser.is_download_started;
                if winner.local.is_full() {
                    winner.new_local_key = true;
                }
            } else if winner.local.is_full() && loser.local.is_full() {
                let same = winner.local == loser.local;
                if !same {
                    if winner_local_exists {
                        if let Some(full) = loser.local.full() {
                            evicted_local_keys.push(full.path.clone());
                        }
                    } else {
                        if let Some(full) = winner.local.full() {
                            evicted_local_keys.push(full.path.clone());
                        }
                        winner.set_local_location(loser.local.clone(), loser.local_ready_size);
                        winner.new_local_key = true;
                    }
                }
            }

            // ---- remote location ----
            if loser.remote.tier() > winner.remote.tier() {
                winner.set_remote_location(
                    loser.remote.clone(),
                    loser.remote_source,
                    loser.remote_ready_size,
                );
                remote_changed = true;
                if winner.remote.is_full() {
                    winner.new_remote_key = true;
                }
            } else if winner.remote.is_full() && loser.remote.is_full() {
                let same = winner.remote == loser.remote;
                if !same {
                    if loser.remote_source > winner.remote_source {
                        if let Some(full) = winner.remote.full() {
                            evicted_remote_keys.push(full.clone());
                        }
                        winner.set_remote_location(
                            loser.remote.clone(),
                            loser.remote_source,
                            loser.remote_ready_size,
                        );
                        remote_changed = true;
                        winner.new_remote_key = true;
                    } else {
                        if loser.remote_source == winner.remote_source {
                            warn!(
                                "Conflicting server references with equal source; keeping the current one"
                            );
                        }
                        if let Some(full) = loser.remote.full() {
                            evicted_remote_keys.push(full.clone());
                        }
                    }
                }
            }

            // ---- generate location ----
            if winner.generate.is_empty() && loser.generate.is_full() {
                winner.set_generate_location(loser.generate.clone());
                winner.new_generate_key = true;
            } else if winner.generate.is_full() && loser.generate.is_full() {
                if winner.generate != loser.generate {
                    if let Some(full) = loser.generate.full() {
                        evicted_generate_keys.push(full.clone());
                    }
                }
            }

            // ---- sizes ----
            if winner.size != 0 && loser.size != 0 && winner.size != loser.size {
                warn!(
                    "Size conflict while merging: {} vs {}; size reset to unknown",
                    winner.size, loser.size
                );
                let estimate = winner
                    .expected_size
                    .max(loser.expected_size)
                    .max(winner.size.max(loser.size));
                winner.set_expected_size(estimate);
                winner.set_size(0);
            } else if winner.size == 0 && loser.size != 0 {
                winner.set_size(loser.size);
            }
            if loser.expected_size > winner.expected_size {
                winner.set_expected_size(loser.expected_size);
            }

            // ---- scalar facts ----
            if winner.name.is_empty() && !loser.name.is_empty() {
                winner.set_name(loser.name.clone());
            }
            if winner.url.is_empty() && !loser.url.is_empty() {
                winner.set_url(loser.url.clone());
            }
            if !winner.owner_id.is_valid() && loser.owner_id.is_valid() {
                winner.set_owner_id(loser.owner_id);
            }
            if winner.encryption_key.is_empty() && !loser.encryption_key.is_empty() {
                winner.encryption_key = loser.encryption_key.clone();
                winner.on_pmc_changed();
            }
            if loser.get_by_hash && !winner.get_by_hash {
                winner.get_by_hash = true;
            }
            winner.generate_was_update |= loser.generate_was_update;
            winner.need_load_from_store |= loser.need_load_from_store;
            winner.new_local_key |= loser.new_local_key;
            winner.new_remote_key |= loser.new_remote_key;
            winner.new_generate_key |= loser.new_generate_key;

            // ---- handles ----
            winner.file_ids.extend(loser.file_ids.iter().copied());

            // ---- upload pause ----
            if remote_changed {
                winner.upload_pause = None;
            } else if winner.upload_pause.is_none() {
                winner.upload_pause = loser.upload_pause;
            }

            // ---- worker reconciliation ----
            if loser.download_query.is_valid() {
                if winner.download_query.is_valid() || winner.local.is_full() {
                    cancel_load_queries.push(loser.download_query);
                } else {
                    winner.download_query = loser.download_query;
                    winner.download_priority = loser.download_priority;
                }
            }
            if loser.upload_query.is_valid() {
                if winner.upload_query.is_valid()
                    || winner.remote.is_full()
                    || winner.upload_pause.is_some()
                {
                    cancel_load_queries.push(loser.upload_query);
                } else {
                    winner.upload_query = loser.upload_query;
                    winner.upload_priority = loser.upload_priority;
                }
            }
            if loser.generate_query.is_valid() {
                if winner.generate_query.is_valid() || winner.local.is_full() {
                    cancel_generate_queries.push(loser.generate_query);
                } else {
                    winner.generate_query = loser.generate_query;
                    winner.generate_priority = loser.generate_priority;
                }
            }

            // ---- persistence ----
            if loser.pmc_id.is_valid() {
                if winner.pmc_id.is_valid() {
                    delete_pmc = Some(loser.pmc_id);
                } else {
                    winner.pmc_id = loser.pmc_id;
                }
            }
            winner.on_changed();
        }

        // Redirect the loser's handles to the winner.
        for &file_id in &loser.file_ids {
            if let Some(info) = self.file_id_infos.get_mut((file_id.0 - 1) as usize) {
                info.node_id = winner_id;
            }
        }

        // Reconcile the location indices: drop keys owned by neither side
        // anymore, then reassert the winner's full locations.
        for key in evicted_local_keys {
            self.local_location_to_file_id.remove(&key);
        }
        for key in evicted_remote_keys {
            self.remote_location_to_file_id.remove(&key);
        }
        for key in evicted_generate_keys {
            self.generate_location_to_file_id.remove(&key);
        }
        let (main_file_id, local_key, remote_key, generate_key, winner_pmc_id) = {
            let Some(winner) = self.node_ref(winner_id) else {
                return Err(FileError::NotFoundHandle(x_file_id.0));
            };
            (
                winner.main_file_id,
                winner.local.full().map(|full| full.path.clone()),
                winner.remote.full().cloned(),
                winner.generate.full().cloned(),
                winner.pmc_id,
            )
        };
        if let Some(key) = local_key {
            self.local_location_to_file_id.insert(key, main_file_id);
        }
        if let Some(key) = remote_key {
            self.remote_location_to_file_id.insert(key, main_file_id);
        }
        if let Some(key) = generate_key {
            self.generate_location_to_file_id.insert(key, main_file_id);
        }

        // Persistence row bookkeeping.
        if let Some(old) = delete_pmc {
            self.pmc_id_to_node_id.remove(&old);
        }
        if winner_pmc_id.is_valid() {
            self.pmc_id_to_node_id.insert(winner_pmc_id, winner_id);
        }

        // The loser node is gone; cancelled queries become no-ops.
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

        self.run_scheduler(winner_id).await;

        if let Some(old) = delete_pmc {
            if no_sync {
                self.pending_pmc_deletes.push(old);
            } else {
                self.clear_from_store(old).await;
            }
        }
        if !no_sync {
            self.try_flush_node(winner_id).await;
        }

        Ok(main_file_id)
    }

    /// Winner selection: higher main-handle priority wins; ties break by a
    /// full remote, then a full local, then a full generate location, then by
    /// the lower internal node id.
    pub(crate) fn wins_over(
        x: &FileNode,
        y: &FileNode,
        x_node_id: FileNodeId,
        y_node_id: FileNodeId,
    ) -> bool {
        if x.main_file_id_priority != y.main_file_id_priority {
            return x.main_file_id_priority > y.main_file_id_priority;
        }
        if x.remote.is_full() != y.remote.is_full() {
            return x.remote.is_full();
        }
        if x.local.is_full() != y.local.is_full() {
            return x.local.is_full();
        }
        if x.generate.is_full() != y.generate.is_full() {
            return x.generate.is_full();
        }
        x_node_id.0 < y_node_id.0
    }
}
