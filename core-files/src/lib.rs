//! # Messenger File Core
//!
//! The file manager of the messaging client: one logical file per node, no
//! matter how many times and ways it is discovered; three tiered locations
//! per node (local, remote, generated); at most one worker query per kind in
//! flight; lazy persistence keyed by any full location.
//!
//! ## Overview
//!
//! - [`FileManager`]: the single-owner actor coordinating everything
//! - [`FileId`]: stable external handle; survives merges by redirection
//! - [`FileView`] / [`FileObject`]: snapshots for internal and UI consumers
//! - [`DownloadCallback`] / [`UploadCallback`]: per-request subscriber hooks
//! - [`FileError`]: the error surface of all public operations
//!
//! External collaborators (byte-transfer workers, generation worker, durable
//! store, filesystem) are injected through the `bridge-traits` contracts.

pub mod config;
pub mod error;
pub mod handle;
pub mod manager;
mod merge;
pub mod node;
pub mod persistent_id;
mod scheduler;
mod store_sync;
pub mod view;
mod worker;

pub use config::{FileManagerConfig, MAX_PRIORITY};
pub use error::{FileError, Result};
pub use handle::{DownloadCallback, FileId, UploadCallback};
pub use manager::{FileManager, FROM_BYTES_PRIORITY};
pub use persistent_id::PERSISTENT_ID_VERSION;
pub use view::{FileObject, FileView, LocalFileObject, RemoteFileObject};

// Re-export the boundary types that appear in the public API.
pub use bridge_traits::{
    ChatId, EncryptionKey, FileDbId, FileRecord, FileType, FullGenerateFileLocation,
    FullLocalFileLocation, FullRemoteFileLocation, GenerateFileLocation, LocalFileLocation,
    LocationSource, PartialLocalFileLocation, PartialRemoteFileLocation, QueryId,
    RemoteFileLocation, UploadedEncryptedFile, UploadedFile,
};
