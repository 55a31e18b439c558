use std::io::{Cursor, Write};
use std::path::PathBuf;

use zip::write::FileOptions;

use crate::loaded::{AssetKind, BundleEntry, BundleIndex};

pub fn temp_dir(tag: &str) -> PathBuf {
    let dir = std::env::temp_dir()
        .join("assetflow-tests")
        .join(format!("{}-{}", tag, uuid::Uuid::new_v4()));
    std::fs::create_dir_all(&dir).expect("create temp dir");
    dir
}

/// Builds an in-memory bundle container from `(name, kind, payload)`
/// triples.
pub fn bundle_bytes(entries: &[(&str, AssetKind, Vec<u8>)]) -> Vec<u8> {
    let mut writer = zip::ZipWriter::new(Cursor::new(Vec::new()));
    let options = FileOptions::default();

    let index = BundleIndex {
        entries: entries
            .iter()
            .map(|(name, kind, _)| BundleEntry {
                name: name.to_string(),
                kind: *kind,
                path: format!("data/{}", name),
            })
            .collect(),
    };
    writer
        .start_file("bundle.json", options)
        .expect("start index entry");
    writer
        .write_all(serde_json::to_string(&index).expect("encode index").as_bytes())
        .expect("write index");

    for (name, _, payload) in entries {
        writer
            .start_file(format!("data/{}", name), options)
            .expect("start data entry");
        writer.write_all(payload).expect("write data entry");
    }

    writer.finish().expect("finish archive").into_inner()
}

/// 2x2 RGBA png.
pub fn tiny_png_bytes() -> Vec<u8> {
    let image = image::RgbaImage::from_fn(2, 2, |x, y| {
        image::Rgba([if x == 0 { 0 } else { 255 }, if y == 0 { 0 } else { 255 }, 0, 255])
    });
    let mut buffer = Cursor::new(Vec::new());
    image::DynamicImage::ImageRgba8(image)
        .write_to(&mut buffer, image::ImageFormat::Png)
        .expect("encode png");
    buffer.into_inner()
}

/// 16-bit PCM wav with a deterministic ramp.
pub fn wav_bytes(channels: u16, samples_per_channel: usize) -> Vec<u8> {
    let spec = hound::WavSpec {
        channels,
        sample_rate: 44_100,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };
    let mut buffer = Vec::new();
    {
        let cursor = Cursor::new(&mut buffer);
        let mut writer = hound::WavWriter::new(cursor, spec).expect("create wav writer");
        for index in 0..samples_per_channel * channels as usize {
            writer
                .write_sample((index as i16).wrapping_mul(64))
                .expect("write sample");
        }
        writer.finalize().expect("finalize wav");
    }
    buffer
}
