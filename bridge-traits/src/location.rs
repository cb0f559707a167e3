//! File Location Model
//!
//! The tiered location types shared between the file manager and the host
//! workers. Every logical file tracks three independent locations (a local
//! copy on disk, a remote copy on the messaging server, and a recipe for
//! producing the file locally), each of which can be `Empty`, `Partial`, or
//! `Full`. `Empty` means "known to be absent"; an unknown location simply has
//! no node at all.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

/// Reserved conversion name marking a generate location that downloads a URL.
pub const URL_CONVERSION: &str = "#url#";

/// The kind of payload a file carries.
///
/// The type rides along with every full location and decides cache placement,
/// extension fix-up, and whether the payload is end-to-end encrypted.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum FileType {
    Document,
    Photo,
    Video,
    Audio,
    VoiceNote,
    VideoNote,
    Sticker,
    Animation,
    Thumbnail,
    ProfilePhoto,
    Wallpaper,
    SecureDocument,
    /// End-to-end encrypted payload; all full locations of such a file must
    /// carry this type.
    Encrypted,
    /// Placeholder when the type is not yet known.
    #[default]
    Temp,
}

impl FileType {
    /// Whether files of this type carry end-to-end encrypted bytes.
    pub fn is_encrypted(self) -> bool {
        matches!(self, FileType::Encrypted)
    }

    /// Stable one-byte code used inside persistent identifiers.
    pub fn to_code(self) -> u8 {
        match self {
            FileType::Document => 0,
            FileType::Photo => 1,
            FileType::Video => 2,
            FileType::Audio => 3,
            FileType::VoiceNote => 4,
            FileType::VideoNote => 5,
            FileType::Sticker => 6,
            FileType::Animation => 7,
            FileType::Thumbnail => 8,
            FileType::ProfilePhoto => 9,
            FileType::Wallpaper => 10,
            FileType::SecureDocument => 11,
            FileType::Encrypted => 12,
            FileType::Temp => 13,
        }
    }

    /// Inverse of [`to_code`](Self::to_code).
    pub fn from_code(code: u8) -> Option<Self> {
        Some(match code {
            0 => FileType::Document,
            1 => FileType::Photo,
            2 => FileType::Video,
            3 => FileType::Audio,
            4 => FileType::VoiceNote,
            5 => FileType::VideoNote,
            6 => FileType::Sticker,
            7 => FileType::Animation,
            8 => FileType::Thumbnail,
            9 => FileType::ProfilePhoto,
            10 => FileType::Wallpaper,
            11 => FileType::SecureDocument,
            12 => FileType::Encrypted,
            13 => FileType::Temp,
            _ => return None,
        })
    }

    /// Default file extension for display-name fix-up, if the type implies one.
    pub fn default_extension(self) -> Option<&'static str> {
        match self {
            FileType::Photo | FileType::ProfilePhoto | FileType::Thumbnail => Some("jpg"),
            FileType::Video | FileType::VideoNote => Some("mp4"),
            FileType::VoiceNote => Some("oga"),
            FileType::Sticker => Some("webp"),
            FileType::Animation => Some("gif"),
            _ => None,
        }
    }
}

impl fmt::Display for FileType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// Where knowledge about a location came from.
///
/// Orders conflict resolution when two full remote references collide:
/// server-sourced beats user-sourced beats store-sourced.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum LocationSource {
    None,
    FromStore,
    #[default]
    FromUser,
    FromServer,
}

/// A conversation that owns a file, used for access checks and quota
/// accounting by the host. Zero means "no owner".
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
pub struct ChatId(pub i64);

impl ChatId {
    pub fn is_valid(self) -> bool {
        self.0 != 0
    }
}

impl fmt::Display for ChatId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Primary key of a persisted file record. Zero means "not yet persisted".
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
pub struct FileDbId(pub u64);

impl FileDbId {
    pub fn is_valid(self) -> bool {
        self.0 != 0
    }
}

impl fmt::Display for FileDbId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Correlation id for one in-flight worker query. Zero means "no query".
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
pub struct QueryId(pub u64);

impl QueryId {
    pub fn is_valid(self) -> bool {
        self.0 != 0
    }
}

impl fmt::Display for QueryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Symmetric key for an end-to-end encrypted file. May be empty.
#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptionKey {
    key: Vec<u8>,
}

impl EncryptionKey {
    pub fn new(key: Vec<u8>) -> Self {
        Self { key }
    }

    pub fn empty() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.key.is_empty()
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.key
    }

    /// 64-bit fingerprint of the key, used in upload descriptors. Zero for an
    /// empty key.
    pub fn fingerprint(&self) -> i64 {
        if self.key.is_empty() {
            return 0;
        }
        let digest = Sha256::digest(&self.key);
        let mut raw = [0u8; 8];
        raw.copy_from_slice(&digest[..8]);
        i64::from_le_bytes(raw)
    }
}

// Key material never reaches logs.
impl fmt::Debug for EncryptionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            write!(f, "EncryptionKey(empty)")
        } else {
            write!(f, "EncryptionKey({} bytes)", self.key.len())
        }
    }
}

/// A fully usable local copy: the file is on disk at `path` and was last seen
/// with modification time `mtime_nsec`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct FullLocalFileLocation {
    pub file_type: FileType,
    pub path: String,
    pub mtime_nsec: i64,
}

/// A local file still being written by a download or a generation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartialLocalFileLocation {
    pub file_type: FileType,
    pub path: String,
    pub part_size: i32,
    pub ready_part_count: i32,
    /// Whether the transfer may still append to the file.
    pub is_writable: bool,
}

/// State of the on-disk copy of a file.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum LocalFileLocation {
    #[default]
    Empty,
    Partial(PartialLocalFileLocation),
    Full(FullLocalFileLocation),
}

impl LocalFileLocation {
    pub fn is_empty(&self) -> bool {
        matches!(self, LocalFileLocation::Empty)
    }

    pub fn is_partial(&self) -> bool {
        matches!(self, LocalFileLocation::Partial(_))
    }

    pub fn is_full(&self) -> bool {
        matches!(self, LocalFileLocation::Full(_))
    }

    pub fn full(&self) -> Option<&FullLocalFileLocation> {
        match self {
            LocalFileLocation::Full(full) => Some(full),
            _ => None,
        }
    }

    pub fn file_type(&self) -> Option<FileType> {
        match self {
            LocalFileLocation::Empty => None,
            LocalFileLocation::Partial(partial) => Some(partial.file_type),
            LocalFileLocation::Full(full) => Some(full.file_type),
        }
    }

    /// Path of the copy, full or partial.
    pub fn path(&self) -> Option<&str> {
        match self {
            LocalFileLocation::Empty => None,
            LocalFileLocation::Partial(partial) => Some(&partial.path),
            LocalFileLocation::Full(full) => Some(&full.path),
        }
    }

    /// Readiness tier, ordered Empty < Partial < Full.
    pub fn tier(&self) -> u8 {
        match self {
            LocalFileLocation::Empty => 0,
            LocalFileLocation::Partial(_) => 1,
            LocalFileLocation::Full(_) => 2,
        }
    }
}

/// A fully usable server reference.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct FullRemoteFileLocation {
    pub file_type: FileType,
    pub server_id: i64,
    pub access_hash: i64,
}

/// A server upload in progress: parts acknowledged so far.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartialRemoteFileLocation {
    pub server_id: i64,
    pub part_count: i32,
    pub part_size: i32,
    pub ready_part_count: i32,
    /// Large-file upload path on the server side.
    pub is_big: bool,
}

/// State of the server-side copy of a file.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum RemoteFileLocation {
    #[default]
    Empty,
    Partial(PartialRemoteFileLocation),
    Full(FullRemoteFileLocation),
}

impl RemoteFileLocation {
    pub fn is_empty(&self) -> bool {
        matches!(self, RemoteFileLocation::Empty)
    }

    pub fn is_partial(&self) -> bool {
        matches!(self, RemoteFileLocation::Partial(_))
    }

    pub fn is_full(&self) -> bool {
        matches!(self, RemoteFileLocation::Full(_))
    }

    pub fn full(&self) -> Option<&FullRemoteFileLocation> {
        match self {
            RemoteFileLocation::Full(full) => Some(full),
            _ => None,
        }
    }

    pub fn file_type(&self) -> Option<FileType> {
        match self {
            RemoteFileLocation::Full(full) => Some(full.file_type),
            _ => None,
        }
    }

    /// Readiness tier, ordered Empty < Partial < Full.
    pub fn tier(&self) -> u8 {
        match self {
            RemoteFileLocation::Empty => 0,
            RemoteFileLocation::Partial(_) => 1,
            RemoteFileLocation::Full(_) => 2,
        }
    }
}

/// A recipe for producing the file locally: run `conversion` over
/// `original_path`. URL-backed files use the [`URL_CONVERSION`] marker with the
/// URL in `original_path`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct FullGenerateFileLocation {
    pub file_type: FileType,
    pub original_path: String,
    pub conversion: String,
}

impl FullGenerateFileLocation {
    pub fn is_url(&self) -> bool {
        self.conversion == URL_CONVERSION
    }
}

/// State of the generation recipe of a file. There is no partial tier: a
/// recipe is either known in full or absent.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum GenerateFileLocation {
    #[default]
    Empty,
    Full(FullGenerateFileLocation),
}

impl GenerateFileLocation {
    pub fn is_empty(&self) -> bool {
        matches!(self, GenerateFileLocation::Empty)
    }

    pub fn is_full(&self) -> bool {
        matches!(self, GenerateFileLocation::Full(_))
    }

    pub fn full(&self) -> Option<&FullGenerateFileLocation> {
        match self {
            GenerateFileLocation::Full(full) => Some(full),
            _ => None,
        }
    }

    pub fn file_type(&self) -> Option<FileType> {
        match self {
            GenerateFileLocation::Full(full) => Some(full.file_type),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_file_type_codes_round_trip() {
        for code in 0..=13u8 {
            let file_type = FileType::from_code(code).unwrap();
            assert_eq!(file_type.to_code(), code);
        }
        assert!(FileType::from_code(200).is_none());
    }

    #[test]
    fn test_location_tiers_order() {
        let empty = LocalFileLocation::Empty;
        let partial = LocalFileLocation::Partial(PartialLocalFileLocation {
            file_type: FileType::Document,
            path: "/tmp/doc.bin.part".to_string(),
            part_size: 4096,
            ready_part_count: 2,
            is_writable: true,
        });
        let full = LocalFileLocation::Full(FullLocalFileLocation {
            file_type: FileType::Document,
            path: "/tmp/doc.bin".to_string(),
            mtime_nsec: 1,
        });
        assert!(empty.tier() < partial.tier());
        assert!(partial.tier() < full.tier());
    }

    #[test]
    fn test_location_source_order() {
        assert!(LocationSource::FromServer > LocationSource::FromUser);
        assert!(LocationSource::FromUser > LocationSource::FromStore);
    }

    #[test]
    fn test_encryption_key_fingerprint_is_stable() {
        let key = EncryptionKey::new(vec![7u8; 32]);
        assert_eq!(key.fingerprint(), key.fingerprint());
        assert_ne!(key.fingerprint(), 0);
        assert_eq!(EncryptionKey::empty().fingerprint(), 0);
    }

    #[test]
    fn test_encryption_key_debug_redacts_material() {
        let key = EncryptionKey::new(vec![1, 2, 3]);
        let rendered = format!("{:?}", key);
        assert!(!rendered.contains('1'));
        assert!(rendered.contains("3 bytes"));
    }
}
