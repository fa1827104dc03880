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


//! Container detection, demuxing and decoding
//!
//! [`InputMedia`] is the read side of the codec adapter: it opens a file
//! through symphonia, selects the first decodable audio track and hands out
//! interleaved `f32` PCM chunks until end of stream.
//!
//! # Format Detection Strategy
//! 1. Read the file header (magic bytes)
//! 2. Fall back to the file extension
//! 3. Pass the result to the symphonia probe as a hint; the probe has the
//!    final say

use crate::error::{Mp3fyError, Result};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use symphonia::core::audio::SampleBuffer;
use symphonia::core::codecs::{Decoder, DecoderOptions, CODEC_TYPE_NULL};
use symphonia::core::errors::Error as SymphoniaError;
use symphonia::core::formats::{FormatOptions, FormatReader};
use symphonia::core::io::{MediaSource, MediaSourceStream};
use symphonia::core::meta::MetadataOptions;
use symphonia::core::probe::Hint;
use tracing::{debug, warn};

/// Container format, as far as it can be told before probing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AudioFormat {
    /// MPEG audio (MP1/MP2/MP3), optionally behind an ID3v2 tag
    Mp3,
    /// RIFF WAVE
    Wav,
    /// Native FLAC
    Flac,
    /// Ogg (Vorbis, Opus, FLAC)
    Ogg,
    /// ISO base media (M4A, M4B, MP4)
    Mp4,
    /// Raw ADTS AAC
    Aac,
    /// AIFF / AIFF-C
    Aiff,
    /// Matroska / WebM
    Mkv,
    /// Unknown; the probe decides
    Unknown,
}

impl AudioFormat {
    /// Detect format from file extension
    pub fn from_extension(ext: &str) -> Self {
        match ext.to_lowercase().as_str() {
            "mp3" | "mp2" | "mp1" => Self::Mp3,
            "wav" | "wave" => Self::Wav,
            "flac" => Self::Flac,
            "ogg" | "oga" | "opus" => Self::Ogg,
            "m4a" | "m4b" | "mp4" => Self::Mp4,
            "aac" => Self::Aac,
            "aif" | "aiff" | "aifc" => Self::Aiff,
            "mkv" | "mka" | "webm" => Self::Mkv,
            _ => Self::Unknown,
        }
    }

    /// Get file extension for this format
    pub fn to_extension(&self) -> &'static str {
        match self {
            Self::Mp3 => "mp3",
            Self::Wav => "wav",
            Self::Flac => "flac",
            Self::Ogg => "ogg",
            Self::Mp4 => "m4a",
            Self::Aac => "aac",
            Self::Aiff => "aiff",
            Self::Mkv => "mka",
            Self::Unknown => "bin",
        }
    }

    /// Detect format from byte header
    ///
    /// Magic bytes:
    /// - MP4: "ftyp" at bytes 4-7 (after 4-byte size field)
    /// - MP3: "ID3" (ID3v2 tag) or an MPEG frame sync with a non-zero layer
    /// - AAC: ADTS sync (0xFFF, layer bits 00)
    /// - WAV / AIFF: "RIFF....WAVE" / "FORM....AIFF|AIFC"
    pub fn detect_format_from_bytes(bytes: &[u8]) -> Self {
        if bytes.len() < 4 {
            return Self::Unknown;
        }

        if bytes.len() >= 8 && &bytes[4..8] == b"ftyp" {
            return Self::Mp4;
        }
        if bytes.len() >= 12 && &bytes[0..4] == b"RIFF" && &bytes[8..12] == b"WAVE" {
            return Self::Wav;
        }
        if bytes.len() >= 12
            && &bytes[0..4] == b"FORM"
            && (&bytes[8..12] == b"AIFF" || &bytes[8..12] == b"AIFC")
        {
            return Self::Aiff;
        }
        if &bytes[0..4] == b"fLaC" {
            return Self::Flac;
        }
        if &bytes[0..4] == b"OggS" {
            return Self::Ogg;
        }
        if bytes[0..4] == [0x1A, 0x45, 0xDF, 0xA3] {
            return Self::Mkv;
        }
        if &bytes[0..3] == b"ID3" {
            return Self::Mp3;
        }

        // 11-bit frame sync shared by MPEG audio and ADTS
        if bytes[0] == 0xFF && (bytes[1] & 0xE0) == 0xE0 {
            let layer = (bytes[1] >> 1) & 0x03;
            return if layer == 0 { Self::Aac } else { Self::Mp3 };
        }

        Self::Unknown
    }

    /// Detect format from a file, header first, extension second
    pub fn detect(path: &Path) -> Self {
        let mut header = [0u8; 12];
        let from_header = File::open(path)
            .and_then(|mut f| {
                let n = f.read(&mut header)?;
                Ok(Self::detect_format_from_bytes(&header[..n]))
            })
            .unwrap_or(Self::Unknown);

        if from_header != Self::Unknown {
            return from_header;
        }

        path.extension()
            .map(|ext| Self::from_extension(&ext.to_string_lossy()))
            .unwrap_or(Self::Unknown)
    }
}

/// Parameters of the selected audio track as declared by the container
#[derive(Debug, Clone, Serialize)]
pub struct SourceSpec {
    /// Codec short name (e.g. "pcm_s16le", "mp3", "flac")
    pub codec: String,
    /// Sample rate in Hz
    pub sample_rate: u32,
    /// Channel count, if the container declares it
    pub channels: Option<usize>,
    /// Total frames (samples per channel), if the container declares it
    pub total_frames: Option<u64>,
}

/// One decoded packet's worth of interleaved PCM
#[derive(Debug, Clone)]
pub struct PcmChunk {
    pub samples: Vec<f32>,
    pub channels: usize,
    pub sample_rate: u32,
}

impl PcmChunk {
    /// Frames (samples per channel) in this chunk
    pub fn frames(&self) -> usize {
        if self.channels == 0 {
            0
        } else {
            self.samples.len() / self.channels
        }
    }
}

/// File source that records how far into the file the demuxer has read
struct CountingSource {
    file: File,
    len: u64,
    pos: u64,
    high_water: Arc<AtomicU64>,
}

impl Read for CountingSource {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        let n = self.file.read(buf)?;
        self.pos += n as u64;
        self.high_water.fetch_max(self.pos, Ordering::Relaxed);
        Ok(n)
    }
}

impl Seek for CountingSource {
    fn seek(&mut self, pos: SeekFrom) -> std::io::Result<u64> {
        self.pos = self.file.seek(pos)?;
        Ok(self.pos)
    }
}

impl MediaSource for CountingSource {
    fn is_seekable(&self) -> bool {
        true
    }

    fn byte_len(&self) -> Option<u64> {
        Some(self.len)
    }
}

/// An opened input container, positioned at the start of its audio track
pub struct InputMedia {
    path: PathBuf,
    format: AudioFormat,
    reader: Box<dyn FormatReader>,
    decoder: Box<dyn Decoder>,
    track_id: u32,
    spec: SourceSpec,
    total_bytes: u64,
    bytes_read: Arc<AtomicU64>,
    frames_decoded: u64,
    skip_corrupt_packets: bool,
    skipped_packets: u64,
}

impl std::fmt::Debug for InputMedia {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InputMedia")
            .field("path", &self.path)
            .field("format", &self.format)
            .field("track_id", &self.track_id)
            .field("spec", &self.spec)
            .finish()
    }
}

impl InputMedia {
    /// Open `path`, probe its container and prepare a decoder for the
    /// first audio track
    ///
    /// Fails with `FileNotFound`/`PermissionDenied` when the file cannot be
    /// opened, `InvalidInput` when no container format matches, and
    /// `UnsupportedStream` when there is no decodable audio track.
    pub fn open(path: &Path) -> Result<Self> {
        let file = File::open(path).map_err(|e| Mp3fyError::from_io(path, e))?;
        let total_bytes = file
            .metadata()
            .map_err(|e| Mp3fyError::from_io(path, e))?
            .len();

        let format = AudioFormat::detect(path);
        let bytes_read = Arc::new(AtomicU64::new(0));
        let source = CountingSource {
            file,
            len: total_bytes,
            pos: 0,
            high_water: Arc::clone(&bytes_read),
        };
        let mss = MediaSourceStream::new(Box::new(source), Default::default());

        let mut hint = Hint::new();
        if format != AudioFormat::Unknown {
            hint.with_extension(format.to_extension());
        } else if let Some(ext) = path.extension() {
            hint.with_extension(&ext.to_string_lossy());
        }

        let format_opts = FormatOptions {
            enable_gapless: true,
            ..Default::default()
        };
        let probed = symphonia::default::get_probe()
            .format(&hint, mss, &format_opts, &MetadataOptions::default())
            .map_err(|e| match e {
                SymphoniaError::IoError(io) => Mp3fyError::from_io(path, io),
                other => Mp3fyError::InvalidInput(format!(
                    "{}: unreadable container: {}",
                    path.display(),
                    other
                )),
            })?;
        let reader = probed.format;

        let track = reader
            .tracks()
            .iter()
            .find(|t| t.codec_params.codec != CODEC_TYPE_NULL && t.codec_params.sample_rate.is_some())
            .ok_or_else(|| Mp3fyError::UnsupportedStream(path.display().to_string()))?;

        let track_id = track.id;
        let params = track.codec_params.clone();

        let decoder = symphonia::default::get_codecs()
            .make(&params, &DecoderOptions::default())
            .map_err(|e| {
                Mp3fyError::UnsupportedStream(format!("{}: {}", path.display(), e))
            })?;

        let codec = symphonia::default::get_codecs()
            .get_codec(params.codec)
            .map(|d| d.short_name.to_string())
            .unwrap_or_else(|| "unknown".to_string());

        let spec = SourceSpec {
            codec,
            sample_rate: params.sample_rate.unwrap_or(0),
            channels: params.channels.map(|c| c.count()),
            total_frames: params.n_frames,
        };

        debug!(
            path = %path.display(),
            ?format,
            track_id,
            codec = %spec.codec,
            sample_rate = spec.sample_rate,
            channels = ?spec.channels,
            total_frames = ?spec.total_frames,
            "Opened input"
        );

        Ok(Self {
            path: path.to_path_buf(),
            format,
            reader,
            decoder,
            track_id,
            spec,
            total_bytes,
            bytes_read,
            frames_decoded: 0,
            skip_corrupt_packets: false,
            skipped_packets: 0,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn format(&self) -> AudioFormat {
        self.format
    }

    pub fn spec(&self) -> &SourceSpec {
        &self.spec
    }

    /// Log and skip packets the decoder rejects instead of failing
    pub fn set_skip_corrupt_packets(&mut self, skip: bool) {
        self.skip_corrupt_packets = skip;
    }

    pub fn frames_decoded(&self) -> u64 {
        self.frames_decoded
    }

    pub fn skipped_packets(&self) -> u64 {
        self.skipped_packets
    }

    /// Progress as `(consumed, total)`
    ///
    /// Frames are used when the container declares a frame count, bytes
    /// read otherwise.
    pub fn progress_units(&self) -> (u64, u64) {
        match self.spec.total_frames {
            Some(total) if total > 0 => (self.frames_decoded.min(total), total),
            _ => (self.bytes_read.load(Ordering::Relaxed), self.total_bytes),
        }
    }

    /// Decode the next packet of the selected track
    ///
    /// Returns `Ok(None)` at end of stream. Packets of other tracks are
    /// skipped; empty packets never surface as chunks.
    pub fn next_chunk(&mut self) -> Result<Option<PcmChunk>> {
        loop {
            let packet = match self.reader.next_packet() {
                Ok(packet) => packet,
                Err(SymphoniaError::IoError(e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                    return Ok(None);
                }
                Err(SymphoniaError::ResetRequired) => {
                    // A chained stream changed parameters mid-file.
                    warn!(path = %self.path.display(), "Track parameters changed, stopping at chain boundary");
                    return Ok(None);
                }
                Err(e) => {
                    return Err(Mp3fyError::DecodeFailure(format!(
                        "{}: demux: {}",
                        self.path.display(),
                        e
                    )));
                }
            };

            if packet.track_id() != self.track_id {
                continue;
            }

            match self.decoder.decode(&packet) {
                Ok(decoded) => {
                    let frames = decoded.frames();
                    if frames == 0 {
                        continue;
                    }
                    let spec = *decoded.spec();
                    let mut buf = SampleBuffer::<f32>::new(decoded.capacity() as u64, spec);
                    buf.copy_interleaved_ref(decoded);
                    self.frames_decoded += frames as u64;

                    return Ok(Some(PcmChunk {
                        samples: buf.samples().to_vec(),
                        channels: spec.channels.count(),
                        sample_rate: spec.rate,
                    }));
                }
                Err(e) => self.on_decode_error(e, packet.ts())?,
            }
        }
    }

    /// Skip a corrupt packet when allowed, otherwise fail the stream
    fn on_decode_error(&mut self, err: SymphoniaError, ts: u64) -> Result<()> {
        match err {
            SymphoniaError::DecodeError(msg) if self.skip_corrupt_packets => {
                self.skipped_packets += 1;
                warn!(path = %self.path.display(), ts, "Skipping corrupt packet: {}", msg);
                Ok(())
            }
            e => Err(Mp3fyError::DecodeFailure(format!(
                "{}: {}",
                self.path.display(),
                e
            ))),
        }
    }
}
