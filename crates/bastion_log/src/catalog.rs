//! Catalog payload decoding.
//!
//! Catalog jobs publish the archive listing as `base64(gzip(json))`, where
//! the JSON is an array of entries.

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use serde::{Deserialize, Serialize};
use std::io::{Read, Write};

/// One file recorded in an archive
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CatalogEntry {
    /// Archive the entry belongs to
    #[serde(default)]
    pub archive_name: String,
    /// Path inside the archive
    pub path: String,
    /// Entry type (`d`, `-`, `l`, ...)
    #[serde(default, rename = "type")]
    pub kind: String,
    /// Mode string
    #[serde(default)]
    pub mode: String,
    /// Size in bytes
    #[serde(default)]
    pub size: u64,
    /// Modification time as reported by borg
    #[serde(default)]
    pub mtime: Option<String>,
    /// Owner
    #[serde(default)]
    pub user: Option<String>,
    /// Group
    #[serde(default)]
    pub group: Option<String>,
}

/// Catalog decoding errors
#[derive(Debug, thiserror::Error)]
pub enum CatalogError {
    /// Not valid base64
    #[error("catalog is not valid base64: {0}")]
    Base64(#[from] base64::DecodeError),

    /// Not a gzip stream
    #[error("catalog is not a gzip stream: {0}")]
    Gzip(#[from] std::io::Error),

    /// Decompressed bytes are not an entry array
    #[error("catalog is not an entry array: {0}")]
    Json(#[from] serde_json::Error),
}

/// Decode a catalog blob
///
/// # Errors
///
/// Returns error if any layer fails to decode
pub fn decode(blob: &str) -> Result<Vec<CatalogEntry>, CatalogError> {
    let compressed = STANDARD.decode(blob.trim())?;
    let mut json = Vec::new();
    GzDecoder::new(compressed.as_slice()).read_to_end(&mut json)?;
    Ok(serde_json::from_slice(&json)?)
}

/// Encode entries as a catalog blob
///
/// # Errors
///
/// Returns error if compression fails
pub fn encode(entries: &[CatalogEntry]) -> Result<String, CatalogError> {
    let json = serde_json::to_vec(entries)?;
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(&json)?;
    let compressed = encoder.finish()?;
    Ok(STANDARD.encode(compressed))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_encoded_listing() {
        let entries = vec![CatalogEntry {
            archive_name: "web1-4-2026".to_string(),
            path: "etc/hosts".to_string(),
            kind: "-".to_string(),
            mode: "-rw-r--r--".to_string(),
            size: 220,
            mtime: Some("2026-01-01T00:00:00".to_string()),
            user: Some("root".to_string()),
            group: Some("root".to_string()),
        }];
        let blob = encode(&entries).unwrap();
        assert_eq!(decode(&blob).unwrap(), entries);
    }

    #[test]
    fn test_decode_rejects_plain_base64() {
        let blob = STANDARD.encode(b"[]");
        assert!(matches!(decode(&blob), Err(CatalogError::Gzip(_))));
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(matches!(decode("***"), Err(CatalogError::Base64(_))));
    }
}
