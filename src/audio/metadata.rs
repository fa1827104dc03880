// MP3fy - Audio Transcode and Tag Engine
// Copyright (C) 2025 Henning Berge
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.


//! Audio metadata and cover art
//!
//! # Read Policy
//! The plain readers (`read`, `read_album_art`, `read_info`) never fail:
//! a file whose tags cannot be read looks like a file without tags. The
//! `try_*` variants return the underlying error for callers that need to
//! tell the two apart.
//!
//! # Write Strategy
//! Tag edits never touch the audio. The input is copied to a hidden
//! temporary sibling of the output, its primary tag is rebuilt from the
//! record, and the temporary file is renamed over the output. Cover art
//! supplied with the record is re-encoded to baseline JPEG first so that
//! every player can show it.

use crate::audio::decoder::InputMedia;
use crate::audio::tags::{self, EmbeddedPicture, PictureUpdate};
use crate::error::{Mp3fyError, Result};
use image::ImageFormat;
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Default JPEG quality for re-encoded cover art
pub const DEFAULT_ART_QUALITY: u8 = 90;

/// How an image's bytes are encoded
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ImageEncoding {
    Jpeg,
    Png,
    Bmp,
    Gif,
    Tiff,
    WebP,
    /// Pixels only, no encoded form
    Raw,
    Unknown,
}

impl ImageEncoding {
    fn from_format(format: Option<ImageFormat>) -> Self {
        match format {
            Some(ImageFormat::Jpeg) => Self::Jpeg,
            Some(ImageFormat::Png) => Self::Png,
            Some(ImageFormat::Bmp) => Self::Bmp,
            Some(ImageFormat::Gif) => Self::Gif,
            Some(ImageFormat::Tiff) => Self::Tiff,
            Some(ImageFormat::WebP) => Self::WebP,
            _ => Self::Unknown,
        }
    }

    pub fn mime_type(&self) -> Option<&'static str> {
        match self {
            Self::Jpeg => Some("image/jpeg"),
            Self::Png => Some("image/png"),
            Self::Bmp => Some("image/bmp"),
            Self::Gif => Some("image/gif"),
            Self::Tiff => Some("image/tiff"),
            Self::WebP => Some("image/webp"),
            Self::Raw | Self::Unknown => None,
        }
    }
}

/// Cover art: encoded bytes plus the decoded RGBA8 pixel buffer
#[derive(Clone, PartialEq, Eq)]
pub struct AlbumArt {
    pub width: u32,
    pub height: u32,
    pub encoding: ImageEncoding,
    /// Encoded image; empty for [`ImageEncoding::Raw`]
    pub data: Vec<u8>,
    /// RGBA8, row-major, `width * height * 4` bytes
    pub pixels: Vec<u8>,
}

impl std::fmt::Debug for AlbumArt {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AlbumArt")
            .field("width", &self.width)
            .field("height", &self.height)
            .field("encoding", &self.encoding)
            .field("data_len", &self.data.len())
            .finish()
    }
}

impl AlbumArt {
    /// Decode an encoded image (JPEG, PNG, ...)
    pub fn from_encoded(data: Vec<u8>) -> Result<Self> {
        let decoded = tags::decode_image(&data)?;
        Ok(Self {
            width: decoded.width,
            height: decoded.height,
            encoding: ImageEncoding::from_format(decoded.format),
            data,
            pixels: decoded.rgba,
        })
    }

    /// Wrap a raw RGBA8 buffer
    pub fn from_rgba(width: u32, height: u32, pixels: Vec<u8>) -> Result<Self> {
        let expected = width as usize * height as usize * 4;
        if width == 0 || height == 0 || pixels.len() != expected {
            return Err(Mp3fyError::ImageFailure(format!(
                "expected {} bytes for {}x{} RGBA, got {}",
                expected,
                width,
                height,
                pixels.len()
            )));
        }
        Ok(Self {
            width,
            height,
            encoding: ImageEncoding::Raw,
            data: Vec::new(),
            pixels,
        })
    }

    /// Pixels packed as `0xAARRGGBB`, the layout of Android `ARGB_8888`
    pub fn to_argb_pixels(&self) -> Vec<i32> {
        self.pixels
            .chunks_exact(4)
            .map(|p| {
                ((p[3] as u32) << 24 | (p[0] as u32) << 16 | (p[1] as u32) << 8 | p[2] as u32) as i32
            })
            .collect()
    }

    /// Re-encode as baseline JPEG
    pub fn to_baseline_jpeg(&self, quality: u8) -> Result<Vec<u8>> {
        tags::encode_baseline_jpeg(self.width, self.height, self.pixels.clone(), quality)
    }
}

/// Tag fields plus optional cover art, always a complete snapshot
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MetadataRecord {
    /// Lowercase tag key to value
    pub fields: BTreeMap<String, String>,
    #[serde(skip)]
    pub album_art: Option<AlbumArt>,
}

impl MetadataRecord {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from key/value pairs, normalising keys to lowercase
    pub fn from_fields<I, K, V>(fields: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: Into<String>,
    {
        let mut record = Self::new();
        for (k, v) in fields {
            record.set(k.as_ref(), v);
        }
        record
    }

    /// Set a field; empty keys are ignored
    pub fn set(&mut self, key: &str, value: impl Into<String>) {
        let key = key.trim().to_lowercase();
        if !key.is_empty() {
            self.fields.insert(key, value.into());
        }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.fields.get(&key.to_lowercase()).map(String::as_str)
    }

    pub fn with_album_art(mut self, art: AlbumArt) -> Self {
        self.album_art = Some(art);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty() && self.album_art.is_none()
    }
}

/// Read-only inspection result
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct AudioFileInfo {
    pub metadata: MetadataRecord,
    pub duration_micros: u64,
    /// Bits per second, 0 if unknown
    pub bitrate_bps: u64,
    /// Hz, 0 if unknown
    pub sample_rate: u32,
    pub channels: u8,
}

/// Reads and rewrites container-level metadata
#[derive(Debug, Clone)]
pub struct MetadataEditor {
    art_quality: u8,
}

impl Default for MetadataEditor {
    fn default() -> Self {
        Self::new(DEFAULT_ART_QUALITY)
    }
}

impl MetadataEditor {
    pub fn new(art_quality: u8) -> Self {
        Self {
            art_quality: art_quality.clamp(1, 100),
        }
    }

    pub fn art_quality(&self) -> u8 {
        self.art_quality
    }

    fn decode_cover(path: &Path, picture: Option<&EmbeddedPicture>) -> Option<AlbumArt> {
        let picture = picture?;
        match AlbumArt::from_encoded(picture.data.clone()) {
            Ok(art) => Some(art),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Embedded picture could not be decoded");
                None
            }
        }
    }

    /// Read every tag and the cover art
    pub fn try_read(&self, path: &Path) -> Result<MetadataRecord> {
        let probed = tags::read_file(path)?;
        let album_art = Self::decode_cover(path, probed.tags.cover());
        Ok(MetadataRecord {
            fields: probed.tags.fields,
            album_art,
        })
    }

    /// Like [`try_read`](Self::try_read), empty on any failure
    pub fn read(&self, path: &Path) -> MetadataRecord {
        self.try_read(path).unwrap_or_else(|e| {
            debug!(path = %path.display(), error = %e, "Metadata read failed, returning empty record");
            MetadataRecord::default()
        })
    }

    pub fn try_read_album_art(&self, path: &Path) -> Result<Option<AlbumArt>> {
        let probed = tags::read_file(path)?;
        match probed.tags.cover() {
            Some(picture) => AlbumArt::from_encoded(picture.data.clone()).map(Some),
            None => Ok(None),
        }
    }

    pub fn read_album_art(&self, path: &Path) -> Option<AlbumArt> {
        self.try_read_album_art(path).unwrap_or_else(|e| {
            debug!(path = %path.display(), error = %e, "Album art read failed");
            None
        })
    }

    pub fn try_read_info(&self, path: &Path) -> Result<AudioFileInfo> {
        let probed = tags::read_file(path)?;
        let album_art = Self::decode_cover(path, probed.tags.cover());
        Ok(AudioFileInfo {
            metadata: MetadataRecord {
                fields: probed.tags.fields,
                album_art,
            },
            duration_micros: probed.properties.duration_micros,
            bitrate_bps: probed.properties.bitrate_bps,
            sample_rate: probed.properties.sample_rate,
            channels: probed.properties.channels,
        })
    }

    /// Tags plus duration and bitrate; `None` when the file cannot be
    /// opened as a container
    pub fn read_info(&self, path: &Path) -> Option<AudioFileInfo> {
        match self.try_read_info(path) {
            Ok(info) => Some(info),
            Err(e) => {
                debug!(path = %path.display(), error = %e, "Audio file info unavailable");
                None
            }
        }
    }

    /// Write `record` into a copy of `input` at `output`
    ///
    /// Returns the field keys the destination tag format could not store.
    /// `input` and `output` may be the same path.
    pub fn write(&self, input: &Path, record: &MetadataRecord, output: &Path) -> Result<Vec<String>> {
        let meta = fs::metadata(input).map_err(|e| Mp3fyError::from_io(input, e))?;
        if !meta.is_file() {
            return Err(Mp3fyError::invalid_input(format!(
                "{} is not a file",
                input.display()
            )));
        }
        match output.parent() {
            Some(parent) if parent.as_os_str().is_empty() || parent.is_dir() => {}
            _ => {
                return Err(Mp3fyError::InvalidPath(format!(
                    "{}: parent directory does not exist",
                    output.display()
                )))
            }
        }

        // Encode the art before touching the filesystem.
        let pictures = match &record.album_art {
            Some(art) => PictureUpdate::Replace(EmbeddedPicture {
                data: art.to_baseline_jpeg(self.art_quality)?,
                mime_type: Some("image/jpeg".to_string()),
                front_cover: true,
            }),
            None => PictureUpdate::Keep,
        };

        let temp = temp_sibling(output);
        fs::copy(input, &temp).map_err(|e| Mp3fyError::io_failure("copy to", &temp, e))?;

        let outcome = tags::write_tags(&temp, &record.fields, pictures).and_then(|dropped| {
            fs::rename(&temp, output)
                .map_err(|e| Mp3fyError::io_failure("rename onto", output, e))?;
            Ok(dropped)
        });

        match outcome {
            Ok(dropped) => {
                info!(
                    input = %input.display(),
                    output = %output.display(),
                    fields = record.fields.len(),
                    art = record.album_art.is_some(),
                    "Metadata written"
                );
                Ok(dropped)
            }
            Err(e) => {
                if let Err(cleanup) = fs::remove_file(&temp) {
                    debug!(path = %temp.display(), error = %cleanup, "Temporary file not removed");
                }
                Err(e)
            }
        }
    }

    /// [`write`](Self::write), then confirm the decoded audio is unchanged
    pub fn write_verified(
        &self,
        input: &Path,
        record: &MetadataRecord,
        output: &Path,
    ) -> Result<Vec<String>> {
        let before = decoded_audio_digest(input)?;
        let dropped = self.write(input, record, output)?;
        let after = decoded_audio_digest(output)?;
        if before != after {
            return Err(Mp3fyError::internal(format!(
                "audio of {} changed during tag rewrite",
                output.display()
            )));
        }
        Ok(dropped)
    }
}

/// Hidden temporary file next to `output`, keeping its extension so tag
/// writers can still tell the container type
fn temp_sibling(output: &Path) -> PathBuf {
    let stem = output
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "output".to_string());
    let name = match output.extension() {
        Some(ext) => format!(".{}.mp3fy-tmp.{}", stem, ext.to_string_lossy()),
        None => format!(".{}.mp3fy-tmp", stem),
    };
    output.with_file_name(name)
}

/// SHA-256 hex of the file with a leading ID3v2 tag and trailing
/// ID3v1/APE tags cut off
///
/// For MPEG streams this is the audio payload; other containers carry
/// their tags inline and are hashed whole apart from those blocks.
pub fn audio_payload_digest(path: &Path) -> Result<String> {
    let bytes = fs::read(path).map_err(|e| Mp3fyError::from_io(path, e))?;
    let (start, end) = payload_range(&bytes);
    Ok(hex::encode(Sha256::digest(&bytes[start..end])))
}

/// Byte range of `bytes` outside the ID3v2 head and ID3v1/APE tail
fn payload_range(bytes: &[u8]) -> (usize, usize) {
    let mut start = 0;
    if bytes.len() >= 10 && &bytes[..3] == b"ID3" {
        let size = bytes[6..10]
            .iter()
            .fold(0usize, |acc, &b| (acc << 7) | (b & 0x7F) as usize);
        let footer = if bytes[5] & 0x10 != 0 { 10 } else { 0 };
        start = (10 + size + footer).min(bytes.len());
    }

    let mut end = bytes.len();
    if end >= start + 128 && &bytes[end - 128..end - 125] == b"TAG" {
        end -= 128;
    }
    if end >= start + 32 && &bytes[end - 32..end - 24] == b"APETAGEX" {
        let footer = &bytes[end - 32..end];
        let size = u32::from_le_bytes([footer[12], footer[13], footer[14], footer[15]]) as usize;
        let flags = u32::from_le_bytes([footer[20], footer[21], footer[22], footer[23]]);
        let header = if flags & 0x8000_0000 != 0 { 32 } else { 0 };
        end = end.saturating_sub(size + header).max(start);
    }
    (start, end)
}

/// SHA-256 over the decoded samples of the first audio track
///
/// Two files with the same digest are sample-identical whatever their
/// tags look like.
pub fn decoded_audio_digest(path: &Path) -> Result<String> {
    let mut media = InputMedia::open(path)?;
    let mut hasher = Sha256::new();
    let mut frames = 0u64;

    while let Some(chunk) = media.next_chunk()? {
        frames += chunk.frames() as u64;
        for sample in &chunk.samples {
            hasher.update(sample.to_bits().to_le_bytes());
        }
    }
    hasher.update(frames.to_le_bytes());
    Ok(hex::encode(hasher.finalize()))
}
