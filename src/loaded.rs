use std::collections::HashMap;
use std::fs::File;
use std::io::{Cursor, Read};
use std::path::Path;
use std::sync::{Arc, Mutex};

use image::GenericImageView;
use memmap2::Mmap;
use serde::{Deserialize, Serialize};

use crate::errors::{ErrorKind, PipelineError, Result};

const BUNDLE_INDEX_NAME: &str = "bundle.json";
pub const BUNDLE_EXTENSION: &str = "bundle";

/// Asset categories the pipeline can materialize.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AssetKind {
    Texture,
    Audio,
    Text,
    Binary,
}

impl AssetKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            AssetKind::Texture => "texture",
            AssetKind::Audio => "audio",
            AssetKind::Text => "text",
            AssetKind::Binary => "binary",
        }
    }
}

/// Decoded RGBA8 image.
#[derive(Debug)]
pub struct TextureAsset {
    pub width: u32,
    pub height: u32,
    pub rgba: Vec<u8>,
}

/// Decoded PCM clip, interleaved f32 samples.
#[derive(Debug)]
pub struct AudioAsset {
    pub channels: u16,
    pub sample_rate: u32,
    pub samples: Vec<f32>,
}

impl AudioAsset {
    pub fn samples_per_channel(&self) -> usize {
        if self.channels == 0 {
            return 0;
        }
        self.samples.len() / self.channels as usize
    }
}

/// One extracted, typed object handed to the consumer.
#[derive(Clone, Debug)]
pub enum AssetObject {
    Texture(Arc<TextureAsset>),
    Audio(Arc<AudioAsset>),
    Text(Arc<String>),
    Binary(Arc<Vec<u8>>),
}

impl AssetObject {
    pub fn kind(&self) -> AssetKind {
        match self {
            AssetObject::Texture(_) => AssetKind::Texture,
            AssetObject::Audio(_) => AssetKind::Audio,
            AssetObject::Text(_) => AssetKind::Text,
            AssetObject::Binary(_) => AssetKind::Binary,
        }
    }

    /// Rough in-memory footprint. Heuristic only: RGBA8 for textures and
    /// two bytes per sample for audio, regardless of the source encoding.
    pub fn estimate_memory_size(&self) -> usize {
        match self {
            AssetObject::Texture(texture) => {
                texture.width as usize * texture.height as usize * 4
            }
            AssetObject::Audio(audio) => {
                audio.samples_per_channel() * audio.channels as usize * 2
            }
            AssetObject::Text(text) => text.len(),
            AssetObject::Binary(bytes) => bytes.len(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BundleIndex {
    pub entries: Vec<BundleEntry>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BundleEntry {
    pub name: String,
    pub kind: AssetKind,
    pub path: String,
}

/// Opaque container holding named, typed assets: a zip archive with a
/// `bundle.json` index mapping asset names to entry paths.
pub struct AssetBundle {
    entries: HashMap<String, BundleEntry>,
    archive: Mutex<zip::ZipArchive<Cursor<Vec<u8>>>>,
}

impl AssetBundle {
    pub fn from_bytes(data: Vec<u8>) -> Result<Self> {
        let mut archive = zip::ZipArchive::new(Cursor::new(data))
            .map_err(|err| PipelineError::Bundle(format!("unreadable container: {}", err)))?;

        let mut raw = String::new();
        archive
            .by_name(BUNDLE_INDEX_NAME)
            .map_err(|err| PipelineError::Bundle(format!("missing {}: {}", BUNDLE_INDEX_NAME, err)))?
            .read_to_string(&mut raw)
            .map_err(|err| PipelineError::Bundle(format!("unreadable index: {}", err)))?;

        let index: BundleIndex = serde_json::from_str(&raw)
            .map_err(|err| PipelineError::Bundle(format!("invalid index: {}", err)))?;

        let entries = index
            .entries
            .into_iter()
            .map(|entry| (entry.name.clone(), entry))
            .collect();

        Ok(Self {
            entries,
            archive: Mutex::new(archive),
        })
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    pub fn entry_kind(&self, name: &str) -> Option<AssetKind> {
        self.entries.get(name).map(|entry| entry.kind)
    }

    /// Pulls one named object out of the container, checking the expected
    /// kind first. The error carries the caller-facing taxonomy:
    /// absent name, kind mismatch, or a container read/decode failure.
    pub fn extract(
        &self,
        name: &str,
        expected: Option<AssetKind>,
    ) -> std::result::Result<AssetObject, (ErrorKind, String)> {
        let Some(entry) = self.entries.get(name) else {
            return Err((
                ErrorKind::NoAssetInBundle,
                format!("no asset named {} in bundle", name),
            ));
        };
        if let Some(expected) = expected {
            if expected != entry.kind {
                return Err((
                    ErrorKind::AssetTypeMismatch,
                    format!("asset is {}, requested {}", entry.kind.as_str(), expected.as_str()),
                ));
            }
        }

        let mut bytes = Vec::new();
        {
            let mut archive = self
                .archive
                .lock()
                .map_err(|_| (ErrorKind::CantLoadAsset, "bundle lock poisoned".to_string()))?;
            let mut file = archive
                .by_name(&entry.path)
                .map_err(|err| (ErrorKind::CantLoadAsset, format!("entry {}: {}", entry.path, err)))?;
            file.read_to_end(&mut bytes)
                .map_err(|err| (ErrorKind::CantLoadAsset, format!("entry {}: {}", entry.path, err)))?;
        }

        decode_object(entry.kind, &bytes)
            .map_err(|err| (ErrorKind::CantLoadAsset, err.to_string()))
    }
}

/// One fully loaded file: either an asset container or a single decoded
/// asset, depending on the file's extension.
#[derive(Clone)]
pub enum LoadedFile {
    Bundle(Arc<AssetBundle>),
    Texture(Arc<TextureAsset>),
    Audio(Arc<AudioAsset>),
    Text(Arc<String>),
    Binary(Arc<Vec<u8>>),
}

impl LoadedFile {
    pub fn kind_name(&self) -> &'static str {
        match self {
            LoadedFile::Bundle(_) => "bundle",
            LoadedFile::Texture(_) => "texture",
            LoadedFile::Audio(_) => "audio",
            LoadedFile::Text(_) => "text",
            LoadedFile::Binary(_) => "binary",
        }
    }

    /// For non-container files the file itself is the asset.
    pub fn as_single_asset(&self) -> Option<AssetObject> {
        match self {
            LoadedFile::Bundle(_) => None,
            LoadedFile::Texture(texture) => Some(AssetObject::Texture(Arc::clone(texture))),
            LoadedFile::Audio(audio) => Some(AssetObject::Audio(Arc::clone(audio))),
            LoadedFile::Text(text) => Some(AssetObject::Text(Arc::clone(text))),
            LoadedFile::Binary(bytes) => Some(AssetObject::Binary(Arc::clone(bytes))),
        }
    }
}

/// Loads a cached file from disk; the container format is inferred from
/// the path's extension.
pub fn load_from_path(path: &Path) -> Result<LoadedFile> {
    let file = File::open(path)?;
    let mmap = unsafe { Mmap::map(&file)? };
    let extension = path
        .extension()
        .and_then(|value| value.to_str())
        .map(|value| value.to_ascii_lowercase())
        .unwrap_or_default();

    match extension.as_str() {
        BUNDLE_EXTENSION => Ok(LoadedFile::Bundle(Arc::new(AssetBundle::from_bytes(
            mmap.to_vec(),
        )?))),
        "png" | "jpg" | "jpeg" | "webp" => {
            Ok(LoadedFile::Texture(Arc::new(decode_texture(&mmap)?)))
        }
        "wav" => Ok(LoadedFile::Audio(Arc::new(decode_audio(&mmap)?))),
        "txt" | "json" => {
            let text = String::from_utf8(mmap.to_vec())
                .map_err(|err| PipelineError::Asset(format!("invalid utf-8: {}", err)))?;
            Ok(LoadedFile::Text(Arc::new(text)))
        }
        _ => Ok(LoadedFile::Binary(Arc::new(mmap.to_vec()))),
    }
}

fn decode_object(kind: AssetKind, bytes: &[u8]) -> Result<AssetObject> {
    match kind {
        AssetKind::Texture => Ok(AssetObject::Texture(Arc::new(decode_texture(bytes)?))),
        AssetKind::Audio => Ok(AssetObject::Audio(Arc::new(decode_audio(bytes)?))),
        AssetKind::Text => {
            let text = String::from_utf8(bytes.to_vec())
                .map_err(|err| PipelineError::Asset(format!("invalid utf-8: {}", err)))?;
            Ok(AssetObject::Text(Arc::new(text)))
        }
        AssetKind::Binary => Ok(AssetObject::Binary(Arc::new(bytes.to_vec()))),
    }
}

fn decode_texture(bytes: &[u8]) -> Result<TextureAsset> {
    let image = image::load_from_memory(bytes)
        .map_err(|err| PipelineError::Asset(format!("texture decode failed: {}", err)))?;
    let (width, height) = image.dimensions();
    Ok(TextureAsset {
        width,
        height,
        rgba: image.to_rgba8().into_raw(),
    })
}

fn decode_audio(bytes: &[u8]) -> Result<AudioAsset> {
    let mut reader = hound::WavReader::new(Cursor::new(bytes))
        .map_err(|err| PipelineError::Asset(format!("audio decode failed: {}", err)))?;
    let spec = reader.spec();

    let samples: std::result::Result<Vec<f32>, _> = match spec.sample_format {
        hound::SampleFormat::Float => reader.samples::<f32>().collect(),
        hound::SampleFormat::Int => {
            let max_value = (1_i64 << (spec.bits_per_sample - 1)) as f32;
            reader
                .samples::<i32>()
                .map(|sample| sample.map(|value| value as f32 / max_value))
                .collect()
        }
    };
    let samples =
        samples.map_err(|err| PipelineError::Asset(format!("audio samples failed: {}", err)))?;

    Ok(AudioAsset {
        channels: spec.channels,
        sample_rate: spec.sample_rate,
        samples,
    })
}
