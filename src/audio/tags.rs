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


//! Tag tables and embedded images
//!
//! All tag dialect handling lives here. Callers see a flat table of
//! lowercase keys: well-known fields use generic names (`title`, `artist`,
//! `album_artist`, `track`, ...) whatever the container calls them, and
//! everything else keeps its native key.
//!
//! lofty does the reading and writing. Containers lofty cannot parse fall
//! back to the metadata symphonia finds while probing (read only).
//!
//! # Key Mapping
//! | generic | lofty item |
//! |---|---|
//! | `track` | `TrackNumber` + `TrackTotal` as `n/total` |
//! | `disc` | `DiscNumber` + `DiscTotal` as `n/total` |
//! | `date` | `RecordingDate`, else `Year` |
//!
//! The rest map one to one, see [`generic_name`].

use crate::error::{Mp3fyError, Result};
use image::codecs::jpeg::JpegEncoder;
use image::{DynamicImage, ImageFormat, RgbaImage};
use lofty::config::{ParseOptions, WriteOptions};
use lofty::file::{AudioFile, TaggedFile, TaggedFileExt};
use lofty::picture::{MimeType, Picture, PictureType};
use lofty::probe::Probe;
use lofty::tag::{ItemKey, ItemValue, Tag, TagExt, TagItem, TagType};
use std::collections::BTreeMap;
use std::fs::File;
use std::path::Path;
use symphonia::core::formats::FormatOptions;
use symphonia::core::io::MediaSourceStream;
use symphonia::core::meta::{MetadataOptions, MetadataRevision, StandardTagKey, StandardVisualKey};
use symphonia::core::probe::Hint;
use tracing::{debug, warn};

/// Picture bytes exactly as stored in the container
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EmbeddedPicture {
    pub data: Vec<u8>,
    pub mime_type: Option<String>,
    pub front_cover: bool,
}

/// Flat tag table plus embedded pictures
#[derive(Debug, Clone, Default)]
pub struct TagTable {
    pub fields: BTreeMap<String, String>,
    pub pictures: Vec<EmbeddedPicture>,
}

impl TagTable {
    /// Front cover if there is one, otherwise the first picture
    pub fn cover(&self) -> Option<&EmbeddedPicture> {
        self.pictures
            .iter()
            .find(|p| p.front_cover)
            .or_else(|| self.pictures.first())
    }
}

/// Stream-level numbers from container headers
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StreamProperties {
    pub duration_micros: u64,
    pub bitrate_bps: u64,
    pub sample_rate: u32,
    pub channels: u8,
}

/// Everything read-only inspection pulls out of a file
#[derive(Debug, Clone, Default)]
pub struct ProbedFile {
    pub tags: TagTable,
    pub properties: StreamProperties,
}

/// What to do with pictures already in the file when writing tags
#[derive(Debug, Clone)]
pub enum PictureUpdate {
    Keep,
    Replace(EmbeddedPicture),
}

/// Generic name for a lofty item key
pub fn generic_name(key: &ItemKey) -> Option<&'static str> {
    Some(match key {
        ItemKey::TrackTitle => "title",
        ItemKey::TrackArtist => "artist",
        ItemKey::AlbumTitle => "album",
        ItemKey::AlbumArtist => "album_artist",
        ItemKey::Genre => "genre",
        ItemKey::TrackNumber => "track",
        ItemKey::DiscNumber => "disc",
        ItemKey::RecordingDate => "date",
        ItemKey::Composer => "composer",
        ItemKey::Comment => "comment",
        ItemKey::Lyrics => "lyrics",
        ItemKey::CopyrightMessage => "copyright",
        ItemKey::EncodedBy => "encoded_by",
        ItemKey::EncoderSoftware => "encoder",
        ItemKey::Language => "language",
        ItemKey::Performer => "performer",
        ItemKey::Publisher => "publisher",
        ItemKey::ContentGroup => "grouping",
        ItemKey::Isrc => "isrc",
        ItemKey::Lyricist => "lyricist",
        ItemKey::Conductor => "conductor",
        _ => return None,
    })
}

/// lofty item key for a generic name
pub fn item_key_for(name: &str) -> Option<ItemKey> {
    Some(match name {
        "title" => ItemKey::TrackTitle,
        "artist" => ItemKey::TrackArtist,
        "album" => ItemKey::AlbumTitle,
        "album_artist" => ItemKey::AlbumArtist,
        "genre" => ItemKey::Genre,
        "track" => ItemKey::TrackNumber,
        "disc" => ItemKey::DiscNumber,
        "date" => ItemKey::RecordingDate,
        "composer" => ItemKey::Composer,
        "comment" => ItemKey::Comment,
        "lyrics" => ItemKey::Lyrics,
        "copyright" => ItemKey::CopyrightMessage,
        "encoded_by" => ItemKey::EncodedBy,
        "encoder" => ItemKey::EncoderSoftware,
        "language" => ItemKey::Language,
        "performer" => ItemKey::Performer,
        "publisher" => ItemKey::Publisher,
        "grouping" => ItemKey::ContentGroup,
        "isrc" => ItemKey::Isrc,
        "lyricist" => ItemKey::Lyricist,
        "conductor" => ItemKey::Conductor,
        _ => return None,
    })
}

/// Native key a dialect stores a non-generic field under, if it can
fn native_key(tag_type: TagType, key: &str) -> Option<String> {
    match tag_type {
        TagType::Id3v2 | TagType::RiffInfo => {
            let upper = key.to_ascii_uppercase();
            let is_frame_id = upper.len() == 4
                && upper.starts_with(|c: char| c.is_ascii_uppercase())
                && upper.chars().all(|c| c.is_ascii_uppercase() || c.is_ascii_digit());
            is_frame_id.then_some(upper)
        }
        TagType::VorbisComments | TagType::Ape => Some(key.to_ascii_uppercase()),
        TagType::Mp4Ilst => {
            (key.starts_with("----:") || key.len() == 4).then(|| key.to_string())
        }
        _ => None,
    }
}

fn append_value(fields: &mut BTreeMap<String, String>, key: String, value: &str) {
    if value.is_empty() {
        return;
    }
    match fields.get_mut(&key) {
        Some(existing) if !existing.split("; ").any(|v| v == value) => {
            existing.push_str("; ");
            existing.push_str(value);
        }
        Some(_) => {}
        None => {
            fields.insert(key, value.to_string());
        }
    }
}

fn join_numbered(fields: &mut BTreeMap<String, String>, key: &str, total: Option<String>) {
    if let Some(total) = total.filter(|t| !t.is_empty()) {
        if let Some(number) = fields.get_mut(key) {
            if !number.contains('/') {
                number.push('/');
                number.push_str(&total);
            }
        }
    }
}

/// Flatten a lofty tag into generic / native lowercase keys
pub fn fields_from_tag(tag: &Tag) -> BTreeMap<String, String> {
    let tag_type = tag.tag_type();
    let mut fields = BTreeMap::new();
    let mut track_total = None;
    let mut disc_total = None;
    let mut year = None;

    for item in tag.items() {
        let text = match item.value() {
            ItemValue::Text(s) | ItemValue::Locator(s) => s.as_str(),
            ItemValue::Binary(_) => continue,
        };

        match item.key() {
            ItemKey::TrackTotal => track_total = Some(text.to_string()),
            ItemKey::DiscTotal => disc_total = Some(text.to_string()),
            ItemKey::Year => year = Some(text.to_string()),
            key => {
                let name = match generic_name(key) {
                    Some(generic) => generic.to_string(),
                    None => match key {
                        ItemKey::Unknown(raw) => raw.to_lowercase(),
                        other => match other.map_key(tag_type, true) {
                            Some(native) => native.to_lowercase(),
                            None => continue,
                        },
                    },
                };
                append_value(&mut fields, name, text);
            }
        }
    }

    join_numbered(&mut fields, "track", track_total);
    join_numbered(&mut fields, "disc", disc_total);
    if let Some(year) = year.filter(|y| !y.is_empty()) {
        fields.entry("date".to_string()).or_insert(year);
    }
    fields
}

fn insert_numbered(tag: &mut Tag, number_key: ItemKey, total_key: ItemKey, value: &str) {
    let (number, total) = match value.split_once('/') {
        Some((n, t)) => (n.trim(), Some(t.trim())),
        None => (value.trim(), None),
    };
    if !number.is_empty() {
        tag.insert_text(number_key, number.to_string());
    }
    if let Some(total) = total.filter(|t| !t.is_empty()) {
        tag.insert_text(total_key, total.to_string());
    }
}

/// Fill `tag` from a flat table; returns the keys the dialect dropped
pub fn insert_fields(tag: &mut Tag, fields: &BTreeMap<String, String>) -> Vec<String> {
    let tag_type = tag.tag_type();
    let mut dropped = Vec::new();

    for (key, value) in fields {
        let key_lc = key.to_lowercase();
        match key_lc.as_str() {
            "track" => insert_numbered(tag, ItemKey::TrackNumber, ItemKey::TrackTotal, value),
            "disc" => insert_numbered(tag, ItemKey::DiscNumber, ItemKey::DiscTotal, value),
            name => {
                let inserted = match item_key_for(name) {
                    Some(item_key) => tag.insert_text(item_key, value.clone()),
                    None => match native_key(tag_type, key) {
                        Some(native) => tag.insert(TagItem::new(
                            ItemKey::Unknown(native),
                            ItemValue::Text(value.clone()),
                        )),
                        None => false,
                    },
                };
                if !inserted {
                    dropped.push(key.clone());
                }
            }
        }
    }

    if !dropped.is_empty() {
        debug!(?tag_type, ?dropped, "Fields not representable in destination tag");
    }
    dropped
}

fn mime_to_string(mime: &MimeType) -> String {
    mime.as_str().to_string()
}

fn pictures_from_tag(tag: &Tag) -> Vec<EmbeddedPicture> {
    tag.pictures()
        .iter()
        .filter(|pic| !pic.data().is_empty())
        .map(|pic| EmbeddedPicture {
            data: pic.data().to_vec(),
            mime_type: pic.mime_type().map(mime_to_string),
            front_cover: pic.pic_type() == PictureType::CoverFront,
        })
        .collect()
}

fn open_tagged(path: &Path) -> Result<TaggedFile> {
    let tagged = Probe::open(path)?
        .options(ParseOptions::new())
        .guess_file_type()?
        .read()?;
    Ok(tagged)
}

fn read_with_lofty(path: &Path) -> Result<ProbedFile> {
    let tagged = open_tagged(path)?;

    let tags = match tagged.primary_tag().or_else(|| tagged.first_tag()) {
        Some(tag) => TagTable {
            fields: fields_from_tag(tag),
            pictures: pictures_from_tag(tag),
        },
        None => TagTable::default(),
    };

    let props = tagged.properties();
    let kbps = props.overall_bitrate().or_else(|| props.audio_bitrate()).unwrap_or(0);
    let properties = StreamProperties {
        duration_micros: props.duration().as_micros() as u64,
        bitrate_bps: kbps as u64 * 1000,
        sample_rate: props.sample_rate().unwrap_or(0),
        channels: props.channels().unwrap_or(0),
    };

    Ok(ProbedFile { tags, properties })
}

fn symphonia_name(key: StandardTagKey) -> Option<&'static str> {
    Some(match key {
        StandardTagKey::TrackTitle => "title",
        StandardTagKey::Artist => "artist",
        StandardTagKey::Album => "album",
        StandardTagKey::AlbumArtist => "album_artist",
        StandardTagKey::Genre => "genre",
        StandardTagKey::TrackNumber => "track",
        StandardTagKey::DiscNumber => "disc",
        StandardTagKey::Date => "date",
        StandardTagKey::Composer => "composer",
        StandardTagKey::Comment => "comment",
        StandardTagKey::Lyrics => "lyrics",
        StandardTagKey::Copyright => "copyright",
        StandardTagKey::EncodedBy => "encoded_by",
        StandardTagKey::Encoder => "encoder",
        StandardTagKey::Language => "language",
        StandardTagKey::Performer => "performer",
        StandardTagKey::Label => "publisher",
        StandardTagKey::IdentIsrc => "isrc",
        StandardTagKey::Lyricist => "lyricist",
        StandardTagKey::Conductor => "conductor",
        _ => return None,
    })
}

fn absorb_revision(revision: &MetadataRevision, table: &mut TagTable) {
    let mut track_total = None;
    let mut disc_total = None;

    for tag in revision.tags() {
        let value = tag.value.to_string();
        match tag.std_key {
            Some(StandardTagKey::TrackTotal) => track_total = Some(value),
            Some(StandardTagKey::DiscTotal) => disc_total = Some(value),
            std_key => {
                let name = std_key
                    .and_then(symphonia_name)
                    .map(str::to_string)
                    .unwrap_or_else(|| tag.key.to_lowercase());
                append_value(&mut table.fields, name, &value);
            }
        }
    }
    join_numbered(&mut table.fields, "track", track_total);
    join_numbered(&mut table.fields, "disc", disc_total);

    for visual in revision.visuals() {
        table.pictures.push(EmbeddedPicture {
            data: visual.data.to_vec(),
            mime_type: Some(visual.media_type.clone()).filter(|m| !m.is_empty()),
            front_cover: visual.usage == Some(StandardVisualKey::FrontCover),
        });
    }
}

fn read_with_symphonia(path: &Path) -> Result<ProbedFile> {
    let file = File::open(path).map_err(|e| Mp3fyError::from_io(path, e))?;
    let file_len = file.metadata().map(|m| m.len()).unwrap_or(0);
    let mss = MediaSourceStream::new(Box::new(file), Default::default());

    let mut hint = Hint::new();
    if let Some(ext) = path.extension() {
        hint.with_extension(&ext.to_string_lossy());
    }
    let format_opts = FormatOptions {
        enable_gapless: true,
        ..Default::default()
    };
    let mut probed = symphonia::default::get_probe()
        .format(&hint, mss, &format_opts, &MetadataOptions::default())
        .map_err(|e| Mp3fyError::TagFailure(format!("{}: {}", path.display(), e)))?;

    let mut table = TagTable::default();
    if let Some(metadata) = probed.metadata.get() {
        if let Some(revision) = metadata.current() {
            absorb_revision(revision, &mut table);
        }
    }
    {
        let metadata = probed.format.metadata();
        if let Some(revision) = metadata.current() {
            absorb_revision(revision, &mut table);
        }
    }

    let mut properties = StreamProperties::default();
    if let Some(track) = probed.format.default_track() {
        let params = &track.codec_params;
        properties.sample_rate = params.sample_rate.unwrap_or(0);
        properties.channels = params
            .channels
            .map(|c| u8::try_from(c.count()).unwrap_or(u8::MAX))
            .unwrap_or(0);
        if let (Some(frames), Some(rate)) = (params.n_frames, params.sample_rate) {
            if rate > 0 {
                properties.duration_micros = frames * 1_000_000 / rate as u64;
            }
        }
        if let Some(bits) = params.bits_per_sample {
            if let (Some(rate), Some(channels)) = (params.sample_rate, params.channels) {
                properties.bitrate_bps = bits as u64 * rate as u64 * channels.count() as u64;
            }
        }
    }
    if properties.bitrate_bps == 0 && properties.duration_micros > 0 {
        properties.bitrate_bps = file_len * 8 * 1_000_000 / properties.duration_micros;
    }

    Ok(ProbedFile {
        tags: table,
        properties,
    })
}

/// Read tags, pictures and stream properties from `path`
///
/// Fails with `FileNotFound`/`PermissionDenied` when the file cannot be
/// opened; parser failures surface as `TagFailure` only when both lofty
/// and the symphonia fallback give up.
pub fn read_file(path: &Path) -> Result<ProbedFile> {
    File::open(path).map_err(|e| Mp3fyError::from_io(path, e))?;

    match read_with_lofty(path) {
        Ok(probed) => Ok(probed),
        Err(lofty_err) => {
            debug!(path = %path.display(), error = %lofty_err, "lofty could not parse, trying symphonia");
            read_with_symphonia(path).map_err(|e| {
                warn!(path = %path.display(), error = %e, "No tag reader could parse file");
                lofty_err
            })
        }
    }
}

/// Replace the primary tag of `path` in place
///
/// The tag is rebuilt from `fields`, so keys not listed disappear. Returns
/// the keys the destination dialect could not store.
pub fn write_tags(
    path: &Path,
    fields: &BTreeMap<String, String>,
    pictures: PictureUpdate,
) -> Result<Vec<String>> {
    let tagged = open_tagged(path)?;
    let tag_type = tagged.primary_tag_type();

    let mut tag = Tag::new(tag_type);
    let dropped = insert_fields(&mut tag, fields);

    match pictures {
        PictureUpdate::Keep => {
            if let Some(existing) = tagged.tag(tag_type) {
                for picture in existing.pictures() {
                    tag.push_picture(picture.clone());
                }
            }
        }
        PictureUpdate::Replace(picture) => {
            let mime = picture.mime_type.as_deref().map(MimeType::from_str);
            tag.push_picture(Picture::new_unchecked(
                PictureType::CoverFront,
                mime,
                None,
                picture.data,
            ));
        }
    }

    tag.save_to_path(path, WriteOptions::default())?;
    debug!(path = %path.display(), ?tag_type, fields = fields.len(), "Tag written");
    Ok(dropped)
}

/// Decoded picture as RGBA8
#[derive(Debug, Clone)]
pub struct DecodedImage {
    pub width: u32,
    pub height: u32,
    pub rgba: Vec<u8>,
    pub format: Option<ImageFormat>,
}

/// Decode encoded image bytes to RGBA8
pub fn decode_image(bytes: &[u8]) -> Result<DecodedImage> {
    let format = image::guess_format(bytes).ok();
    let img = image::load_from_memory(bytes)?;
    let rgba = img.to_rgba8();
    Ok(DecodedImage {
        width: rgba.width(),
        height: rgba.height(),
        rgba: rgba.into_raw(),
        format,
    })
}

/// Encode RGBA8 pixels as baseline JPEG at `quality` (1-100)
///
/// Alpha is dropped; JPEG has no transparency.
pub fn encode_baseline_jpeg(width: u32, height: u32, rgba: Vec<u8>, quality: u8) -> Result<Vec<u8>> {
    let img = RgbaImage::from_raw(width, height, rgba).ok_or_else(|| {
        Mp3fyError::ImageFailure(format!("pixel buffer does not match {}x{}", width, height))
    })?;
    let rgb = DynamicImage::ImageRgba8(img).to_rgb8();

    let mut out = Vec::new();
    let mut encoder = JpegEncoder::new_with_quality(&mut out, quality.clamp(1, 100));
    encoder.encode_image(&rgb)?;
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generic_names_round_trip() {
        for name in [
            "title", "artist", "album", "album_artist", "genre", "track", "disc", "date",
            "composer", "comment", "lyrics", "copyright", "encoded_by", "encoder", "language",
            "performer", "publisher", "grouping", "isrc", "lyricist", "conductor",
        ] {
            let key = item_key_for(name).unwrap();
            assert_eq!(generic_name(&key), Some(name));
        }
        assert!(item_key_for("my_custom_field").is_none());
    }

    #[test]
    fn test_native_key_rules() {
        assert_eq!(native_key(TagType::Id3v2, "tsoa"), Some("TSOA".to_string()));
        assert_eq!(native_key(TagType::Id3v2, "my_custom_field"), None);
        assert_eq!(native_key(TagType::Id3v2, "1abc"), None);
        assert_eq!(
            native_key(TagType::VorbisComments, "replaygain_track_gain"),
            Some("REPLAYGAIN_TRACK_GAIN".to_string())
        );
        assert_eq!(native_key(TagType::Id3v1, "title"), None);
    }

    #[test]
    fn test_fields_round_trip_through_tag() {
        let mut fields = BTreeMap::new();
        fields.insert("title".to_string(), "X".to_string());
        fields.insert("track".to_string(), "3/12".to_string());
        fields.insert("album_artist".to_string(), "Various".to_string());
        fields.insert("replaygain_album_gain".to_string(), "-6.5 dB".to_string());

        let mut tag = Tag::new(TagType::VorbisComments);
        let dropped = insert_fields(&mut tag, &fields);
        assert!(dropped.is_empty());

        let read = fields_from_tag(&tag);
        assert_eq!(read.get("title").map(String::as_str), Some("X"));
        assert_eq!(read.get("track").map(String::as_str), Some("3/12"));
        assert_eq!(read.get("album_artist").map(String::as_str), Some("Various"));
        assert_eq!(read.get("replaygain_album_gain").map(String::as_str), Some("-6.5 dB"));
    }

    #[test]
    fn test_id3v2_drops_unrepresentable_keys() {
        let mut fields = BTreeMap::new();
        fields.insert("title".to_string(), "X".to_string());
        fields.insert("not a frame".to_string(), "y".to_string());

        let mut tag = Tag::new(TagType::Id3v2);
        let dropped = insert_fields(&mut tag, &fields);
        assert_eq!(dropped, vec!["not a frame".to_string()]);
    }

    #[test]
    fn test_append_value_joins_distinct_values() {
        let mut fields = BTreeMap::new();
        append_value(&mut fields, "artist".into(), "A");
        append_value(&mut fields, "artist".into(), "B");
        append_value(&mut fields, "artist".into(), "B");
        append_value(&mut fields, "empty".into(), "");
        assert_eq!(fields.get("artist").map(String::as_str), Some("A; B"));
        assert!(!fields.contains_key("empty"));
    }

    #[test]
    fn test_jpeg_encode_then_decode() {
        let (w, h) = (8u32, 4u32);
        let rgba: Vec<u8> = (0..w * h).flat_map(|_| [200u8, 10, 10, 255]).collect();

        let jpeg = encode_baseline_jpeg(w, h, rgba, 90).unwrap();
        assert_eq!(&jpeg[..2], &[0xFF, 0xD8]);

        let decoded = decode_image(&jpeg).unwrap();
        assert_eq!((decoded.width, decoded.height), (w, h));
        assert_eq!(decoded.format, Some(ImageFormat::Jpeg));
        assert_eq!(decoded.rgba.len(), (w * h * 4) as usize);
    }

    #[test]
    fn test_jpeg_rejects_short_buffer() {
        let err = encode_baseline_jpeg(4, 4, vec![0; 10], 90).unwrap_err();
        assert!(matches!(err, Mp3fyError::ImageFailure(_)));
    }
}
