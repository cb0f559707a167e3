//! # Host Bridge Traits
//!
//! Boundary contract between the file manager core and its host: the data
//! types that cross the manager's edge and the traits each host must
//! implement.
//!
//! ## Overview
//!
//! The file manager never transfers bytes, never touches the durable store
//! directly, and never generates files itself. Those capabilities are injected
//! through the traits defined here:
//!
//! - [`LoadWorker`](workers::LoadWorker): download/upload/set-content byte pool
//! - [`GenerateWorker`](workers::GenerateWorker): on-demand local generation
//! - [`FileStore`](store::FileStore): durable keyed record store
//! - [`FileSystemAccess`](filesystem::FileSystemAccess): local path checks and I/O
//!
//! The shared data model (tiered locations, file types, encryption keys,
//! persisted records) lives in [`location`] and [`record`] so workers, store
//! backends, and the core speak the same language.
//!
//! ## Thread Safety
//!
//! All bridge traits require `Send + Sync` bounds to support safe concurrent
//! usage across async tasks. Implementations must ensure thread safety.

pub mod error;
pub mod filesystem;
pub mod location;
pub mod record;
pub mod store;
pub mod workers;

pub use error::BridgeError;

// Re-export commonly used types
pub use filesystem::{FileStat, FileSystemAccess};
pub use location::{
    ChatId, EncryptionKey, FileDbId, FileType, FullGenerateFileLocation, FullLocalFileLocation,
    FullRemoteFileLocation, GenerateFileLocation, LocalFileLocation, LocationSource,
    PartialLocalFileLocation, PartialRemoteFileLocation, QueryId, RemoteFileLocation,
    URL_CONVERSION,
};
pub use record::{FileRecord, UploadedEncryptedFile, UploadedFile};
pub use store::FileStore;
pub use workers::{GenerateWorker, LoadWorker};
