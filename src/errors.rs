use std::io;
use std::sync::Arc;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),
    #[error("HTTP error: {0}")]
    Http(String),
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("Cache error: {0}")]
    Cache(String),
    #[error("Bundle error: {0}")]
    Bundle(String),
    #[error("Asset error: {0}")]
    Asset(String),
    #[error("Config error: {0}")]
    Config(String),
    #[error("Not found: {0}")]
    NotFound(String),
}

pub type Result<T> = std::result::Result<T, PipelineError>;

/// Terminal failure categories reported to the owner's error callback.
/// Only `Network` is retried by the pipeline itself; everything else
/// usually indicates a persistent condition.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorKind {
    Network,
    CantWriteStorageCache,
    CantLoadStorageCache,
    CantLoadBundle,
    CantLoadAsset,
    AssetTypeMismatch,
    NoAssetInBundle,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Network => "network",
            ErrorKind::CantWriteStorageCache => "cant_write_storage_cache",
            ErrorKind::CantLoadStorageCache => "cant_load_storage_cache",
            ErrorKind::CantLoadBundle => "cant_load_bundle",
            ErrorKind::CantLoadAsset => "cant_load_asset",
            ErrorKind::AssetTypeMismatch => "asset_type_mismatch",
            ErrorKind::NoAssetInBundle => "no_asset_in_bundle",
        }
    }
}

/// `(kind, resource name, detail)` — invoked once per terminal failure.
pub type ErrorCallback = Arc<dyn Fn(ErrorKind, &str, &str) + Send + Sync>;

/// Delta of reported bytes; negative values roll back progress that a
/// retried attempt had already reported.
pub type ProgressCallback = Arc<dyn Fn(i64) + Send + Sync>;
