use std::path::PathBuf;
use std::time::Duration;

const DEFAULT_RETRY_COUNT: u32 = 3;
const DEFAULT_TIMEOUT_SECS: u64 = 30;
const DEFAULT_WRITE_BUFFER_BYTES: usize = 4 * 1024 * 1024;
const DEFAULT_WRITE_CHUNK_BYTES: usize = 64 * 1024;

/// Tuning knobs for the pipeline. Defaults can be overridden per-field or
/// through `ASSETFLOW_*` environment variables.
#[derive(Clone, Debug)]
pub struct PipelineConfig {
    pub cache_root: PathBuf,
    /// When true, cache filenames embed the content hash and a hash
    /// mismatch against the manifest invalidates the cached file.
    pub use_hash_invalidation: bool,
    /// Extra attempts after the first failed transfer.
    pub retry_count: u32,
    /// Network receive timeout: no bytes for this long aborts the attempt.
    pub timeout: Duration,
    /// Total in-flight bytes the writer accepts before producers block.
    pub write_buffer_bytes: usize,
    /// Largest slice a single write request carries.
    pub write_chunk_bytes: usize,
}

impl PipelineConfig {
    pub fn new(cache_root: impl Into<PathBuf>) -> Self {
        let retry_count = env_usize("ASSETFLOW_RETRY_COUNT")
            .map(|value| value as u32)
            .unwrap_or(DEFAULT_RETRY_COUNT);
        let timeout_secs = env_usize("ASSETFLOW_TIMEOUT_SECS")
            .map(|value| value as u64)
            .unwrap_or(DEFAULT_TIMEOUT_SECS);
        let write_buffer_bytes = env_usize("ASSETFLOW_WRITE_BUFFER_BYTES")
            .unwrap_or(DEFAULT_WRITE_BUFFER_BYTES)
            .max(DEFAULT_WRITE_CHUNK_BYTES);
        let write_chunk_bytes = env_usize("ASSETFLOW_WRITE_CHUNK_BYTES")
            .unwrap_or(DEFAULT_WRITE_CHUNK_BYTES)
            .clamp(4 * 1024, write_buffer_bytes);

        Self {
            cache_root: cache_root.into(),
            use_hash_invalidation: !env_truthy("ASSETFLOW_DISABLE_HASH_INVALIDATION"),
            retry_count,
            timeout: Duration::from_secs(timeout_secs.max(1)),
            write_buffer_bytes,
            write_chunk_bytes,
        }
    }

    /// Number of write requests the writer channel holds before back-pressure.
    pub fn write_queue_capacity(&self) -> usize {
        (self.write_buffer_bytes / self.write_chunk_bytes).max(1)
    }
}

pub(crate) fn env_usize(key: &str) -> Option<usize> {
    std::env::var(key)
        .ok()
        .and_then(|value| value.trim().parse::<usize>().ok())
}

pub(crate) fn env_truthy(key: &str) -> bool {
    std::env::var(key)
        .map(|value| {
            let normalized = value.trim().to_ascii_lowercase();
            matches!(normalized.as_str(), "1" | "true" | "yes" | "on")
        })
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let config = PipelineConfig::new("/tmp/assetflow-cache");
        assert!(config.retry_count >= 1);
        assert!(config.timeout >= Duration::from_secs(1));
        assert!(config.write_chunk_bytes <= config.write_buffer_bytes);
        assert!(config.write_queue_capacity() >= 1);
    }
}
