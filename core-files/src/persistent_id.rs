//! Persistent File Identifiers
//!
//! A persistent id is a versioned, URL-safe token encoding a file's full
//! remote reference so it can be shared across sessions and clients. Layout of
//! the raw bytes before base64: one version byte, the server id and access
//! hash (little-endian), and a trailing file-type code byte used to validate
//! the expected type on decode.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use bridge_traits::{FileType, FullRemoteFileLocation};

use crate::error::{FileError, Result};

/// Current persistent id format version. Decoding rejects any other version.
pub const PERSISTENT_ID_VERSION: u8 = 2;

const RAW_LEN: usize = 18;

pub(crate) fn encode_persistent_id(remote: &FullRemoteFileLocation) -> String {
    let mut raw = Vec::with_capacity(RAW_LEN);
    raw.push(PERSISTENT_ID_VERSION);
    raw.extend_from_slice(&remote.server_id.to_le_bytes());
    raw.extend_from_slice(&remote.access_hash.to_le_bytes());
    raw.push(remote.file_type.to_code());
    URL_SAFE_NO_PAD.encode(raw)
}

pub(crate) fn decode_persistent_id(
    token: &str,
    expected_type: FileType,
) -> Result<FullRemoteFileLocation> {
    let raw = URL_SAFE_NO_PAD
        .decode(token)
        .map_err(|e| FileError::InvalidPersistentId(format!("malformed token: {}", e)))?;

    if raw.len() != RAW_LEN {
        return Err(FileError::InvalidPersistentId(format!(
            "unexpected length {}",
            raw.len()
        )));
    }

    if raw[0] != PERSISTENT_ID_VERSION {
        return Err(FileError::InvalidPersistentId(format!(
            "unsupported version {}",
            raw[0]
        )));
    }

    let mut server_id_raw = [0u8; 8];
    server_id_raw.copy_from_slice(&raw[1..9]);
    let mut access_hash_raw = [0u8; 8];
    access_hash_raw.copy_from_slice(&raw[9..17]);

    let file_type = FileType::from_code(raw[17])
        .ok_or_else(|| FileError::InvalidPersistentId(format!("unknown type code {}", raw[17])))?;

    if file_type != expected_type && expected_type != FileType::Temp && file_type != FileType::Temp
    {
        return Err(FileError::InvalidPersistentId(format!(
            "wrong file type: expected {}, got {}",
            expected_type, file_type
        )));
    }

    Ok(FullRemoteFileLocation {
        file_type,
        server_id: i64::from_le_bytes(server_id_raw),
        access_hash: i64::from_le_bytes(access_hash_raw),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_remote() -> FullRemoteFileLocation {
        FullRemoteFileLocation {
            file_type: FileType::Photo,
            server_id: 123_456_789,
            access_hash: -987_654_321,
        }
    }

    #[test]
    fn test_round_trip() {
        let remote = sample_remote();
        let token = encode_persistent_id(&remote);
        let decoded = decode_persistent_id(&token, FileType::Photo).unwrap();
        assert_eq!(decoded, remote);
    }

    #[test]
    fn test_temp_expected_type_accepts_any() {
        let token = encode_persistent_id(&sample_remote());
        assert!(decode_persistent_id(&token, FileType::Temp).is_ok());
    }

    #[test]
    fn test_wrong_type_is_rejected() {
        let token = encode_persistent_id(&sample_remote());
        let err = decode_persistent_id(&token, FileType::Video).unwrap_err();
        assert!(matches!(err, FileError::InvalidPersistentId(_)));
    }

    #[test]
    fn test_wrong_version_is_rejected() {
        let mut raw = URL_SAFE_NO_PAD
            .decode(encode_persistent_id(&sample_remote()))
            .unwrap();
        raw[0] = 1;
        let token = URL_SAFE_NO_PAD.encode(raw);
        let err = decode_persistent_id(&token, FileType::Photo).unwrap_err();
        assert!(matches!(err, FileError::InvalidPersistentId(_)));
    }

    #[test]
    fn test_garbage_is_rejected() {
        assert!(decode_persistent_id("???", FileType::Photo).is_err());
        assert!(decode_persistent_id("", FileType::Photo).is_err());
        assert!(decode_persistent_id("AAAA", FileType::Photo).is_err());
    }

    #[test]
    fn test_token_is_url_safe() {
        let token = encode_persistent_id(&sample_remote());
        assert!(token
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_'));
    }
}
