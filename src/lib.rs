//! Client-side content delivery pipeline: manifest-driven downloads into a
//! hashed disk cache, buffered writes, bundle loading and typed asset
//! extraction. Handles are reference counted and polled through a single
//! `update()` tick while the blocking work runs on background tasks.

pub mod asset;
pub mod cache;
pub mod config;
pub mod download;
pub mod errors;
pub mod file_handle;
pub mod hash;
pub mod loaded;
pub mod logging;
pub mod manifest;
pub mod pipeline;
pub mod refcount;
pub mod utils;
pub mod writer;

pub use asset::{AssetHandle, AssetState};
pub use cache::StorageCache;
pub use config::PipelineConfig;
pub use download::{DownloadHandle, DownloadState, HttpSource, RemoteSource};
pub use errors::{ErrorCallback, ErrorKind, PipelineError, ProgressCallback, Result};
pub use file_handle::{FileHandle, FileState};
pub use hash::ContentHash;
pub use loaded::{AssetBundle, AssetKind, AssetObject, LoadedFile};
pub use manifest::{AssetFileDatabase, FileMetaData, JsonAssetDatabase};
pub use pipeline::AssetPipeline;
pub use refcount::{Ref, RefCount, RefCounted};
pub use writer::FileWriter;

#[cfg(test)]
pub(crate) mod testutil;
