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


//! MP3 encoding through LAME

use crate::error::{Mp3fyError, Result};
use mp3lame_encoder::{Builder, Encoder, FlushGap, InterleavedPcm};
use serde::{Deserialize, Serialize};

/// CBR bitrates (kbps) the encoder accepts
pub const MP3_BITRATES_KBPS: [u32; 16] = [
    8, 16, 24, 32, 40, 48, 64, 80, 96, 112, 128, 160, 192, 224, 256, 320,
];

/// Bitrates an MPEG-1 stream (32, 44.1, 48 kHz) can carry
const MPEG1_BITRATES_KBPS: [u32; 13] = [32, 40, 48, 64, 80, 96, 112, 128, 160, 192, 224, 256, 320];

/// Bitrates an MPEG-2/2.5 stream (8 to 24 kHz) can carry
const MPEG2_BITRATES_KBPS: [u32; 12] = [8, 16, 24, 32, 40, 48, 64, 80, 96, 112, 128, 160];

/// Bitrates legal at `sample_rate`
pub fn bitrates_for_rate(sample_rate: u32) -> &'static [u32] {
    if sample_rate >= 32_000 {
        &MPEG1_BITRATES_KBPS
    } else {
        &MPEG2_BITRATES_KBPS
    }
}

/// Closest bitrate legal at `sample_rate`, preferring the lower one
///
/// A requested rate that is already legal comes back unchanged.
pub fn legal_bitrate(sample_rate: u32, kbps: u32) -> u32 {
    let legal = bitrates_for_rate(sample_rate);
    if legal.contains(&kbps) {
        return kbps;
    }
    legal
        .iter()
        .rev()
        .copied()
        .find(|&b| b <= kbps)
        .unwrap_or(legal[0])
}

/// Encoder speed / quality trade-off
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum EncodingQuality {
    /// Slowest, best psychoacoustics
    Best,
    /// LAME's recommended high quality setting
    #[default]
    High,
    /// LAME's default
    Standard,
    /// Fast encoding
    Fast,
}

impl EncodingQuality {
    fn to_lame(self) -> mp3lame_encoder::Quality {
        match self {
            Self::Best => mp3lame_encoder::Quality::Best,
            Self::High => mp3lame_encoder::Quality::NearBest,
            Self::Standard => mp3lame_encoder::Quality::Good,
            Self::Fast => mp3lame_encoder::Quality::Ok,
        }
    }
}

/// Map a kbps value onto LAME's bitrate enum
pub fn lame_bitrate(kbps: u32) -> Option<mp3lame_encoder::Bitrate> {
    use mp3lame_encoder::Bitrate;
    Some(match kbps {
        8 => Bitrate::Kbps8,
        16 => Bitrate::Kbps16,
        24 => Bitrate::Kbps24,
        32 => Bitrate::Kbps32,
        40 => Bitrate::Kbps40,
        48 => Bitrate::Kbps48,
        64 => Bitrate::Kbps64,
        80 => Bitrate::Kbps80,
        96 => Bitrate::Kbps96,
        112 => Bitrate::Kbps112,
        128 => Bitrate::Kbps128,
        160 => Bitrate::Kbps160,
        192 => Bitrate::Kbps192,
        224 => Bitrate::Kbps224,
        256 => Bitrate::Kbps256,
        320 => Bitrate::Kbps320,
        _ => return None,
    })
}

/// Stereo CBR MP3 encoder
///
/// LAME buffers partial frames internally; [`Mp3Encoder::flush`] must be
/// called once at end of stream to get the tail out.
pub struct Mp3Encoder {
    inner: Encoder,
    sample_rate: u32,
    bitrate_kbps: u32,
    frames_in: u64,
}

impl Mp3Encoder {
    pub fn new(sample_rate: u32, bitrate_kbps: u32, quality: EncodingQuality) -> Result<Self> {
        let bitrate = lame_bitrate(bitrate_kbps).ok_or_else(|| {
            Mp3fyError::EncodeFailure(format!("unsupported bitrate {} kbps", bitrate_kbps))
        })?;
        if !bitrates_for_rate(sample_rate).contains(&bitrate_kbps) {
            return Err(Mp3fyError::EncodeFailure(format!(
                "{} kbps cannot be carried at {} Hz",
                bitrate_kbps, sample_rate
            )));
        }

        let mut builder = Builder::new()
            .ok_or_else(|| Mp3fyError::EncodeFailure("LAME failed to allocate".to_string()))?;
        builder
            .set_num_channels(2)
            .map_err(|e| Mp3fyError::EncodeFailure(format!("channels: {:?}", e)))?;
        builder
            .set_sample_rate(sample_rate)
            .map_err(|e| Mp3fyError::EncodeFailure(format!("sample rate {}: {:?}", sample_rate, e)))?;
        builder
            .set_brate(bitrate)
            .map_err(|e| Mp3fyError::EncodeFailure(format!("bitrate: {:?}", e)))?;
        builder
            .set_quality(quality.to_lame())
            .map_err(|e| Mp3fyError::EncodeFailure(format!("quality: {:?}", e)))?;

        let inner = builder
            .build()
            .map_err(|e| Mp3fyError::EncodeFailure(format!("init: {:?}", e)))?;

        Ok(Self {
            inner,
            sample_rate,
            bitrate_kbps,
            frames_in: 0,
        })
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn bitrate_kbps(&self) -> u32 {
        self.bitrate_kbps
    }

    /// Frames (samples per channel) fed so far
    pub fn frames_in(&self) -> u64 {
        self.frames_in
    }

    /// Encode interleaved stereo samples, appending MP3 bytes to `out`
    pub fn encode(&mut self, interleaved: &[f32], out: &mut Vec<u8>) -> Result<usize> {
        if interleaved.is_empty() {
            return Ok(0);
        }
        let frames = interleaved.len() / 2;
        out.reserve(mp3lame_encoder::max_required_buffer_size(frames));
        let written = self
            .inner
            .encode_to_vec(InterleavedPcm(interleaved), out)
            .map_err(|e| Mp3fyError::EncodeFailure(format!("{:?}", e)))?;
        self.frames_in += frames as u64;
        Ok(written)
    }

    /// Flush buffered samples (padding the last frame), appending to `out`
    pub fn flush(&mut self, out: &mut Vec<u8>) -> Result<usize> {
        out.reserve(7200);
        self.inner
            .flush_to_vec::<FlushGap>(out)
            .map_err(|e| Mp3fyError::EncodeFailure(format!("flush: {:?}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_every_listed_bitrate_maps() {
        for kbps in MP3_BITRATES_KBPS {
            assert!(lame_bitrate(kbps).is_some(), "{} kbps", kbps);
        }
        assert!(lame_bitrate(100).is_none());
    }

    #[test]
    fn test_legal_bitrate_follows_mpeg_version() {
        assert_eq!(legal_bitrate(44_100, 192), 192);
        assert_eq!(legal_bitrate(16_000, 192), 160);
        assert_eq!(legal_bitrate(8_000, 320), 160);
        assert_eq!(legal_bitrate(22_050, 64), 64);
        assert_eq!(legal_bitrate(48_000, 8), 32);
        assert_eq!(legal_bitrate(32_000, 24), 32);
        for rate in crate::audio::resampler::MP3_SAMPLE_RATES {
            for kbps in MP3_BITRATES_KBPS {
                let chosen = legal_bitrate(rate, kbps);
                assert!(bitrates_for_rate(rate).contains(&chosen), "{} Hz {} kbps", rate, kbps);
                assert!(lame_bitrate(chosen).is_some());
            }
        }
    }

    #[test]
    fn test_rejects_bitrate_illegal_at_rate() {
        let err = Mp3Encoder::new(16_000, 192, EncodingQuality::Fast).err().unwrap();
        assert!(matches!(err, Mp3fyError::EncodeFailure(_)));
        assert!(Mp3Encoder::new(16_000, 64, EncodingQuality::Fast).is_ok());
    }

    #[test]
    fn test_rejects_unsupported_bitrate() {
        let err = Mp3Encoder::new(44_100, 100, EncodingQuality::High).err().unwrap();
        assert!(matches!(err, Mp3fyError::EncodeFailure(_)));
    }

    #[test]
    fn test_encode_and_flush_produce_frames() {
        let mut encoder = Mp3Encoder::new(44_100, 128, EncodingQuality::Fast).unwrap();
        let samples: Vec<f32> = (0..44_100 * 2)
            .map(|i| ((i / 2) as f32 * 440.0 * std::f32::consts::TAU / 44_100.0).sin() * 0.3)
            .collect();

        let mut out = Vec::new();
        for chunk in samples.chunks(4_096) {
            encoder.encode(chunk, &mut out).unwrap();
        }
        let flushed = encoder.flush(&mut out).unwrap();

        assert!(flushed > 0);
        assert_eq!(encoder.frames_in(), 44_100);
        // Roughly one second at 128 kbps
        assert!(out.len() > 12_000, "got {} bytes", out.len());
    }
}
