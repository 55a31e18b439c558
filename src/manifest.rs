use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::errors::Result;
use crate::hash::ContentHash;

/// Per-file record served by the remote manifest.
#[derive(Clone, Debug)]
pub struct FileMetaData {
    pub hash: ContentHash,
    pub size_bytes: u64,
    /// Optional full-file sha256 (lowercase hex) verified after the cache
    /// write completes.
    pub sha256: Option<String>,
    /// Logical names of files that must be loaded alongside this one.
    pub dependencies: Vec<String>,
}

/// Boundary to the remote manifest: resolves a logical name to its current
/// content hash and size. Reconciliation deletes any cached entry this
/// database no longer vouches for.
pub trait AssetFileDatabase: Send + Sync {
    fn get_file_metadata(&self, name: &str) -> Option<FileMetaData>;
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AssetManifest {
    pub version: String,
    pub files: Vec<ManifestFile>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ManifestFile {
    pub name: String,
    pub hash: ContentHash,
    pub size: u64,
    #[serde(default)]
    pub sha256: Option<String>,
    #[serde(default)]
    pub dependencies: Vec<String>,
}

/// Manifest database backed by a parsed JSON document.
pub struct JsonAssetDatabase {
    entries: HashMap<String, FileMetaData>,
}

impl JsonAssetDatabase {
    pub fn from_json(raw: &str) -> Result<Self> {
        let manifest: AssetManifest = serde_json::from_str(raw)?;
        Ok(Self::from_manifest(&manifest))
    }

    pub fn from_manifest(manifest: &AssetManifest) -> Self {
        let entries = manifest
            .files
            .iter()
            .map(|file| {
                (
                    file.name.clone(),
                    FileMetaData {
                        hash: file.hash,
                        size_bytes: file.size,
                        sha256: file
                            .sha256
                            .as_ref()
                            .map(|value| value.trim().to_ascii_lowercase())
                            .filter(|value| !value.is_empty()),
                        dependencies: file.dependencies.clone(),
                    },
                )
            })
            .collect();
        Self { entries }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl AssetFileDatabase for JsonAssetDatabase {
    fn get_file_metadata(&self, name: &str) -> Option<FileMetaData> {
        self.entries.get(name).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_manifest_document() {
        let hash = ContentHash::of_slice(b"level1");
        let raw = format!(
            r#"{{
                "version": "2024.1",
                "files": [
                    {{"name": "level1.bundle", "hash": "{}", "size": 4096,
                      "dependencies": ["shared.bundle"]}},
                    {{"name": "shared.bundle", "hash": "{}", "size": 1024}}
                ]
            }}"#,
            hash.to_hex(),
            ContentHash::of_slice(b"shared").to_hex()
        );

        let database = JsonAssetDatabase::from_json(&raw).expect("parse manifest");
        assert_eq!(database.len(), 2);

        let meta = database
            .get_file_metadata("level1.bundle")
            .expect("level1 metadata");
        assert_eq!(meta.hash, hash);
        assert_eq!(meta.size_bytes, 4096);
        assert_eq!(meta.dependencies, vec!["shared.bundle".to_string()]);
        assert!(meta.sha256.is_none());

        assert!(database.get_file_metadata("absent.bundle").is_none());
    }

    #[test]
    fn rejects_malformed_hash() {
        let raw = r#"{"version": "1", "files": [{"name": "a", "hash": "nope", "size": 1}]}"#;
        assert!(JsonAssetDatabase::from_json(raw).is_err());
    }
}
