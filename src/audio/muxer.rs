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


//! MPEG audio frame writer
//!
//! The encoder hands back arbitrary byte runs. [`Mp3FrameWriter`] cuts them
//! into whole Layer III frames and appends them to the output in order.
//! A leading Info/Xing frame carries no audio and is dropped, so
//! header-based duration readers see audio frames only. LAME writes that
//! frame as a bare header over a zeroed body, to be patched in place by a
//! seeking writer; [`Mp3FrameWriter::expect_lame_placeholder`] also drops
//! that form. Otherwise a blank first frame is audio and kept.

use crate::error::{Mp3fyError, Result};
use std::io::Write;
use tracing::{debug, warn};

const MPEG1_L3_KBPS: [u32; 15] = [0, 32, 40, 48, 56, 64, 80, 96, 112, 128, 160, 192, 224, 256, 320];
const MPEG2_L3_KBPS: [u32; 15] = [0, 8, 16, 24, 32, 40, 48, 56, 64, 80, 96, 112, 128, 144, 160];

/// MPEG version as encoded in the frame header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MpegVersion {
    Mpeg1,
    Mpeg2,
    Mpeg25,
}

/// Decoded Layer III frame header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub version: MpegVersion,
    pub bitrate_kbps: u32,
    pub sample_rate: u32,
    pub padding: bool,
    pub has_crc: bool,
    pub mono: bool,
}

impl FrameHeader {
    /// Parse a Layer III header from the first four bytes of `bytes`
    ///
    /// Free-format and reserved values are rejected.
    pub fn parse(bytes: &[u8]) -> Option<Self> {
        if bytes.len() < 4 || bytes[0] != 0xFF || (bytes[1] & 0xE0) != 0xE0 {
            return None;
        }

        let version = match (bytes[1] >> 3) & 0x03 {
            0 => MpegVersion::Mpeg25,
            2 => MpegVersion::Mpeg2,
            3 => MpegVersion::Mpeg1,
            _ => return None,
        };
        // Layer III only
        if (bytes[1] >> 1) & 0x03 != 1 {
            return None;
        }

        let bitrate_index = (bytes[2] >> 4) as usize;
        let rate_index = ((bytes[2] >> 2) & 0x03) as usize;
        if bitrate_index == 0 || bitrate_index == 15 || rate_index == 3 {
            return None;
        }

        let bitrate_kbps = match version {
            MpegVersion::Mpeg1 => MPEG1_L3_KBPS[bitrate_index],
            _ => MPEG2_L3_KBPS[bitrate_index],
        };
        let sample_rate = match version {
            MpegVersion::Mpeg1 => [44_100, 48_000, 32_000][rate_index],
            MpegVersion::Mpeg2 => [22_050, 24_000, 16_000][rate_index],
            MpegVersion::Mpeg25 => [11_025, 12_000, 8_000][rate_index],
        };

        Some(Self {
            version,
            bitrate_kbps,
            sample_rate,
            padding: (bytes[2] >> 1) & 0x01 == 1,
            has_crc: bytes[1] & 0x01 == 0,
            mono: (bytes[3] >> 6) == 0x03,
        })
    }

    /// PCM frames carried by one MPEG frame
    pub fn samples_per_frame(&self) -> u32 {
        match self.version {
            MpegVersion::Mpeg1 => 1152,
            _ => 576,
        }
    }

    /// Frame length in bytes, header included
    pub fn frame_len(&self) -> usize {
        let coefficient = match self.version {
            MpegVersion::Mpeg1 => 144,
            _ => 72,
        };
        (coefficient * self.bitrate_kbps * 1000 / self.sample_rate) as usize + self.padding as usize
    }

    fn side_info_len(&self) -> usize {
        match (self.version, self.mono) {
            (MpegVersion::Mpeg1, true) => 17,
            (MpegVersion::Mpeg1, false) => 32,
            (_, true) => 9,
            (_, false) => 17,
        }
    }
}

/// True if `frame` carries an Info/Xing header instead of audio
pub fn is_info_frame(header: &FrameHeader, frame: &[u8]) -> bool {
    let tag_at = 4 + if header.has_crc { 2 } else { 0 } + header.side_info_len();
    frame
        .get(tag_at..tag_at + 4)
        .is_some_and(|tag| tag == b"Xing" || tag == b"Info")
}

/// Counters reported once the stream is finished
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MuxStats {
    pub frames: u64,
    pub bytes: u64,
    pub duration_micros: u64,
    pub dropped_info_frame: bool,
}

/// Appends whole MP3 frames to `writer`
pub struct Mp3FrameWriter<W: Write> {
    writer: W,
    pending: Vec<u8>,
    first_frame_seen: bool,
    lame_placeholder: bool,
    samples: u64,
    sample_rate: u32,
    stats: MuxStats,
}

impl<W: Write> Mp3FrameWriter<W> {
    pub fn new(writer: W) -> Self {
        Self {
            writer,
            pending: Vec::with_capacity(16 * 1024),
            first_frame_seen: false,
            lame_placeholder: false,
            samples: 0,
            sample_rate: 0,
            stats: MuxStats::default(),
        }
    }

    /// Treat a first frame with an all-zero body as LAME's tag placeholder
    pub fn expect_lame_placeholder(mut self) -> Self {
        self.lame_placeholder = true;
        self
    }

    /// Queue encoder output and write every complete frame
    pub fn write(&mut self, data: &[u8]) -> Result<()> {
        if data.is_empty() {
            return Ok(());
        }
        self.pending.extend_from_slice(data);
        self.drain_frames()
    }

    /// Write what is left and hand back the underlying writer
    pub fn finish(mut self) -> Result<(W, MuxStats)> {
        self.drain_frames()?;
        if !self.pending.is_empty() {
            warn!(bytes = self.pending.len(), "Trailing bytes after last frame, writing verbatim");
            let tail = std::mem::take(&mut self.pending);
            self.emit(&tail)?;
        }
        self.writer
            .flush()
            .map_err(|e| Mp3fyError::IoFailure(format!("flush output: {}", e)))?;

        if self.sample_rate > 0 {
            self.stats.duration_micros = self.samples * 1_000_000 / self.sample_rate as u64;
        }
        debug!(
            frames = self.stats.frames,
            bytes = self.stats.bytes,
            duration_micros = self.stats.duration_micros,
            "Muxer finished"
        );
        Ok((self.writer, self.stats))
    }

    fn emit(&mut self, bytes: &[u8]) -> Result<()> {
        self.writer
            .write_all(bytes)
            .map_err(|e| Mp3fyError::IoFailure(format!("write output: {}", e)))?;
        self.stats.bytes += bytes.len() as u64;
        Ok(())
    }

    fn drain_frames(&mut self) -> Result<()> {
        let pending = std::mem::take(&mut self.pending);
        let mut pos = 0;

        while pending.len() - pos >= 4 {
            let Some(header) = FrameHeader::parse(&pending[pos..]) else {
                // Lost sync: pass bytes through up to the next candidate.
                let next = pending[pos + 1..]
                    .iter()
                    .position(|&b| b == 0xFF)
                    .map(|i| pos + 1 + i)
                    .unwrap_or(pending.len());
                warn!(bytes = next - pos, "Non-frame bytes in encoder output");
                self.emit(&pending[pos..next])?;
                pos = next;
                continue;
            };

            let len = header.frame_len();
            if pending.len() - pos < len {
                break;
            }
            let frame = &pending[pos..pos + len];

            if !self.first_frame_seen {
                self.first_frame_seen = true;
                let placeholder = self.lame_placeholder && frame[4..].iter().all(|&b| b == 0);
                if placeholder || is_info_frame(&header, frame) {
                    self.stats.dropped_info_frame = true;
                    pos += len;
                    continue;
                }
            }

            self.emit(frame)?;
            self.stats.frames += 1;
            self.samples += header.samples_per_frame() as u64;
            self.sample_rate = header.sample_rate;
            pos += len;
        }

        self.pending = pending[pos..].to_vec();
        Ok(())
    }
}
