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


//! Audio decoding, transcoding, and tagging
//!
//! # Module Organization
//!
//! ## Codec adapter
//! Everything that knows about a particular container, codec, or tag
//! dialect lives in these modules:
//! - `decoder` - `AudioFormat` detection, `InputMedia` demux and decode
//! - `resampler` - channel remix and sample-rate conversion (`FormatConverter`)
//! - `encoder` - LAME CBR encoder (`Mp3Encoder`, `EncodingQuality`)
//! - `muxer` - MP3 frame writer (`Mp3FrameWriter`)
//! - `tags` - tag table and embedded picture read/write, key mapping
//!
//! ## converter
//! The transcode pipeline run against one session:
//! - `AudioConverter` - decode, resample, encode, mux, progress
//! - `ConversionOptions` - bitrate, quality, output rate, tag carry-over
//!
//! ## metadata
//! Container-level metadata independent of any session:
//! - `MetadataRecord`, `AlbumArt`, `AudioFileInfo`
//! - `MetadataEditor` - read with soft failure, rewrite tags without touching audio

pub mod converter;
pub mod decoder;
pub mod encoder;
pub mod metadata;
pub mod muxer;
pub mod resampler;
pub mod tags;

pub use converter::{AudioConverter, ConversionOptions, ProgressCallback};
pub use decoder::{AudioFormat, InputMedia, SourceSpec};
pub use encoder::EncodingQuality;
pub use metadata::{
    audio_payload_digest, decoded_audio_digest, AlbumArt, AudioFileInfo, ImageEncoding,
    MetadataEditor, MetadataRecord,
};
