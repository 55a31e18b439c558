use std::fmt;
use std::fs::File;
use std::io::{self, Read};
use std::path::Path;

use serde::{Deserialize, Serialize};

pub const HASH_HEX_LEN: usize = 32;

/// 128-bit content fingerprint used to detect stale cached files. Encoded
/// as 32 lowercase hex characters inside cache filenames and manifests.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ContentHash([u8; 16]);

impl ContentHash {
    pub fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(bytes)
    }

    /// Fingerprint of an in-memory buffer (truncated blake3).
    pub fn of_slice(data: &[u8]) -> Self {
        let digest = blake3::hash(data);
        let mut out = [0_u8; 16];
        out.copy_from_slice(&digest.as_bytes()[..16]);
        Self(out)
    }

    /// Streaming fingerprint of a file on disk.
    pub fn of_file(path: &Path) -> io::Result<Self> {
        let mut file = File::open(path)?;
        let mut hasher = blake3::Hasher::new();
        let mut buffer = vec![0_u8; 1024 * 1024];
        loop {
            let read = file.read(&mut buffer)?;
            if read == 0 {
                break;
            }
            hasher.update(&buffer[..read]);
        }
        let digest = hasher.finalize();
        let mut out = [0_u8; 16];
        out.copy_from_slice(&digest.as_bytes()[..16]);
        Ok(Self(out))
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn from_hex(value: &str) -> Option<Self> {
        if value.len() != HASH_HEX_LEN {
            return None;
        }
        let decoded = hex::decode(value.as_bytes()).ok()?;
        let mut out = [0_u8; 16];
        out.copy_from_slice(&decoded);
        Some(Self(out))
    }
}

impl fmt::Display for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ContentHash({})", self.to_hex())
    }
}

impl TryFrom<String> for ContentHash {
    type Error = String;

    fn try_from(value: String) -> std::result::Result<Self, Self::Error> {
        ContentHash::from_hex(value.trim())
            .ok_or_else(|| format!("invalid content hash: {}", value))
    }
}

impl From<ContentHash> for String {
    fn from(value: ContentHash) -> Self {
        value.to_hex()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hex_round_trip() {
        let hash = ContentHash::of_slice(b"level1.bundle payload");
        let hex = hash.to_hex();
        assert_eq!(hex.len(), HASH_HEX_LEN);
        assert_eq!(ContentHash::from_hex(&hex), Some(hash));
    }

    #[test]
    fn rejects_bad_hex() {
        assert!(ContentHash::from_hex("zz").is_none());
        assert!(ContentHash::from_hex(&"a".repeat(31)).is_none());
        assert!(ContentHash::from_hex(&"g".repeat(32)).is_none());
    }

    #[test]
    fn file_hash_matches_slice_hash() {
        let dir = std::env::temp_dir().join(format!("assetflow-hash-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).expect("create temp dir");
        let path = dir.join("payload.bin");
        let data = vec![7_u8; 3 * 1024 * 1024];
        std::fs::write(&path, &data).expect("write payload");

        let from_file = ContentHash::of_file(&path).expect("hash file");
        assert_eq!(from_file, ContentHash::of_slice(&data));
    }
}
