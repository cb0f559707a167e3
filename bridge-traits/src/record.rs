//! Persisted File Record
//!
//! The record format written to the durable store: the complete learned state
//! of one logical file. Store backends serialize records with `serde_json` and
//! index them by every full location they contain, so the manager can find a
//! record again by whichever key it rediscovers first.

use serde::{Deserialize, Serialize};

use crate::location::{
    ChatId, GenerateFileLocation, LocalFileLocation, RemoteFileLocation,
};

/// Complete persisted state of one logical file.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileRecord {
    pub local: LocalFileLocation,
    pub remote: RemoteFileLocation,
    pub generate: GenerateFileLocation,

    /// Authoritative total size in bytes, 0 if unknown.
    pub size: i64,
    /// Best-effort size estimate used before `size` is known.
    pub expected_size: i64,

    pub name: String,
    pub url: String,
    pub owner_id: ChatId,

    /// Raw encryption key bytes; empty when the file is not encrypted.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub encryption_key: Vec<u8>,

    /// Whether the file may be deduplicated by content hash on upload.
    #[serde(default)]
    pub get_by_hash: bool,
}

/// Descriptor of a finished plaintext upload, handed to upload subscribers.
/// The server reference may still be finalized later.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadedFile {
    pub server_id: i64,
    pub part_count: i32,
    pub name: String,
}

/// Descriptor of a finished encrypted upload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadedEncryptedFile {
    pub server_id: i64,
    pub part_count: i32,
    pub key_fingerprint: i64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::location::{FileType, FullRemoteFileLocation};

    #[test]
    fn test_record_round_trips_through_json() {
        let record = FileRecord {
            remote: RemoteFileLocation::Full(FullRemoteFileLocation {
                file_type: FileType::Photo,
                server_id: 42,
                access_hash: -7,
            }),
            size: 1000,
            name: "photo.jpg".to_string(),
            owner_id: ChatId(11),
            ..Default::default()
        };

        let encoded = serde_json::to_vec(&record).unwrap();
        let decoded: FileRecord = serde_json::from_slice(&encoded).unwrap();
        assert_eq!(decoded, record);
    }
}
