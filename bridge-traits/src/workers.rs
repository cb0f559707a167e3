//! Worker Pool Traits
//!
//! Contracts for the byte-transfer and generation workers that live outside
//! the file manager. The manager allocates a [`QueryId`] for every operation
//! it hands to a worker; workers echo that id in every callback so the manager
//! can correlate results without holding references into worker state.
//!
//! All start/cancel methods are fire-and-forget from the manager's point of
//! view: a cancelled query may still deliver callbacks, which the manager
//! discards by query id. Timeouts and transport retries are the workers'
//! concern; the manager only reacts to terminal callbacks.

use bytes::Bytes;

use crate::error::Result;
use crate::location::{
    EncryptionKey, FileType, FullGenerateFileLocation, FullLocalFileLocation,
    FullRemoteFileLocation, LocalFileLocation, QueryId, RemoteFileLocation,
};

/// Byte-transfer pool: downloads, uploads, and set-content writes.
///
/// Progress and completion flow back through the manager's worker-callback
/// surface (`on_start_download`, `on_partial_download`, `on_download_ok`,
/// `on_partial_upload`, `on_upload_ok`, `on_upload_full_ok`, `on_error`).
#[async_trait::async_trait]
pub trait LoadWorker: Send + Sync {
    /// Begin or resume downloading `remote` into a local file. `local` carries
    /// any partial copy to resume from; `is_started` tells the worker the
    /// download had already begun before a restart.
    #[allow(clippy::too_many_arguments)]
    async fn start_download(
        &self,
        query_id: QueryId,
        remote: FullRemoteFileLocation,
        local: LocalFileLocation,
        size: i64,
        name: String,
        encryption_key: EncryptionKey,
        is_started: bool,
        priority: i8,
    ) -> Result<()>;

    /// Begin or resume uploading `local`. `remote` carries any partial upload
    /// to resume; `bad_parts` lists part indices the server rejected and must
    /// be resent; `by_hash` allows content-addressed deduplication.
    /// `upload_order` breaks ties among uploads at the same priority, lower
    /// first.
    #[allow(clippy::too_many_arguments)]
    async fn start_upload(
        &self,
        query_id: QueryId,
        local: FullLocalFileLocation,
        remote: RemoteFileLocation,
        expected_size: i64,
        encryption_key: EncryptionKey,
        bad_parts: Vec<i32>,
        by_hash: bool,
        upload_order: u64,
        priority: i8,
    ) -> Result<()>;

    /// Materialize `bytes` as a local file of the given type. Completion is
    /// delivered as a download-ok callback.
    async fn from_bytes(&self, query_id: QueryId, file_type: FileType, bytes: Bytes)
        -> Result<()>;

    /// Re-prioritize an in-flight query without restarting it.
    async fn update_priority(&self, query_id: QueryId, priority: i8);

    /// Cancel an in-flight query. Fire-and-forget; late callbacks for the id
    /// are ignored by the manager.
    async fn cancel(&self, query_id: QueryId);
}

/// On-demand file generation (conversions, thumbnails, URL fetches).
///
/// Progress mirrors the download surface: partial-local updates followed by a
/// generate-ok with the finished local location, or an error.
#[async_trait::async_trait]
pub trait GenerateWorker: Send + Sync {
    /// Run the `generate` recipe. `local` carries any partial output to resume
    /// from; `name` is a display-name hint for the produced file.
    async fn generate(
        &self,
        query_id: QueryId,
        generate: FullGenerateFileLocation,
        local: LocalFileLocation,
        name: String,
        priority: i8,
    ) -> Result<()>;

    /// Cancel an in-flight generation. Fire-and-forget.
    async fn cancel(&self, query_id: QueryId);
}
