//! Persistent File Store Trait
//!
//! Key-value backend for durable file records. The store owns the primary-key
//! space ([`FileDbId`]) and maintains secondary indices by every full location
//! a record contains, so a record can be found again by its local path, its
//! server reference, or its generate recipe, whichever the manager
//! rediscovers first.
//!
//! Writes are idempotent keyed writes: storing the same id twice replaces the
//! record. The manager coalesces dirty transitions so at most one write per
//! node is in flight.

use crate::error::Result;
use crate::location::{
    FileDbId, FullGenerateFileLocation, FullLocalFileLocation, FullRemoteFileLocation,
};
use crate::record::FileRecord;

#[async_trait::async_trait]
pub trait FileStore: Send + Sync {
    /// Allocate a fresh primary key. Never returns an invalid (zero) id.
    async fn next_id(&self) -> Result<FileDbId>;

    /// Load a record by primary key.
    async fn load_by_id(&self, id: FileDbId) -> Result<Option<FileRecord>>;

    /// Load a record by its full local path index.
    async fn load_by_local(
        &self,
        location: &FullLocalFileLocation,
    ) -> Result<Option<(FileDbId, FileRecord)>>;

    /// Load a record by its full remote reference index.
    async fn load_by_remote(
        &self,
        location: &FullRemoteFileLocation,
    ) -> Result<Option<(FileDbId, FileRecord)>>;

    /// Load a record by its full generate recipe index.
    async fn load_by_generate(
        &self,
        location: &FullGenerateFileLocation,
    ) -> Result<Option<(FileDbId, FileRecord)>>;

    /// Write the complete current record under `id`. The `new_*` flags tell
    /// the store which secondary indices gained a key since the last write, so
    /// it can update them without diffing the record.
    async fn store(
        &self,
        id: FileDbId,
        record: &FileRecord,
        new_local: bool,
        new_remote: bool,
        new_generate: bool,
    ) -> Result<()>;

    /// Remove a record and its index entries.
    async fn delete(&self, id: FileDbId) -> Result<()>;
}
