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


//! Channel remixing and sample-rate conversion
//!
//! [`FormatConverter`] turns decoded PCM of any layout into the interleaved
//! stereo stream the MP3 encoder expects. When the source already matches
//! the target, chunks pass through untouched.

use crate::error::{Mp3fyError, Result};
use rubato::{
    Resampler, SincFixedIn, SincInterpolationParameters, SincInterpolationType, WindowFunction,
};
use tracing::debug;

/// Sample rates an MPEG-1/2/2.5 Layer III stream can carry
pub const MP3_SAMPLE_RATES: [u32; 9] = [
    8_000, 11_025, 12_000, 16_000, 22_050, 24_000, 32_000, 44_100, 48_000,
];

/// Frames fed to the sinc resampler per call
const RESAMPLER_CHUNK: usize = 1024;

/// Check whether `rate` is legal for MP3 output
pub fn is_mp3_sample_rate(rate: u32) -> bool {
    MP3_SAMPLE_RATES.contains(&rate)
}

/// Choose the output rate for a source rate
///
/// Legal rates are kept. Rates above 48 kHz drop to 44.1 kHz when they are a
/// multiple of it and 48 kHz otherwise; anything else drops to the highest
/// legal rate below it.
pub fn nearest_mp3_sample_rate(rate: u32) -> u32 {
    if is_mp3_sample_rate(rate) {
        return rate;
    }
    if rate > 48_000 {
        return if rate % 44_100 == 0 { 44_100 } else { 48_000 };
    }
    MP3_SAMPLE_RATES
        .iter()
        .rev()
        .copied()
        .find(|&r| r <= rate)
        .unwrap_or(MP3_SAMPLE_RATES[0])
}

/// Sample layout of a PCM stream
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PcmLayout {
    pub sample_rate: u32,
    pub channels: usize,
}

/// Fold an interleaved buffer of `channels` channels into interleaved stereo
///
/// Mono is duplicated. Channels beyond the first two are mixed into both
/// sides at half gain and the result is renormalised.
pub fn remix_to_stereo(interleaved: &[f32], channels: usize, out: &mut Vec<f32>) {
    match channels {
        0 => {}
        1 => {
            out.reserve(interleaved.len() * 2);
            for &s in interleaved {
                out.push(s);
                out.push(s);
            }
        }
        2 => out.extend_from_slice(interleaved),
        n => {
            let norm = 1.0 / (1.0 + 0.5 * (n - 2) as f32);
            out.reserve(interleaved.len() / n * 2);
            for frame in interleaved.chunks_exact(n) {
                let shared: f32 = frame[2..].iter().sum::<f32>() * 0.5;
                out.push((frame[0] + shared) * norm);
                out.push((frame[1] + shared) * norm);
            }
        }
    }
}

/// Streaming sinc resampler over planar stereo buffers
///
/// Input is collected into fixed-size chunks. The resampler's output delay
/// is trimmed from the front, and [`StreamResampler::flush`] pads the tail
/// so the total output is `round(input_frames * ratio)` frames.
struct StreamResampler {
    inner: SincFixedIn<f32>,
    ratio: f64,
    channels: usize,
    pending: Vec<Vec<f32>>,
    delay_remaining: usize,
    frames_in: u64,
    frames_out: u64,
}

impl StreamResampler {
    fn new(from_rate: u32, to_rate: u32, channels: usize) -> Result<Self> {
        let ratio = to_rate as f64 / from_rate as f64;
        let params = SincInterpolationParameters {
            sinc_len: 256,
            f_cutoff: 0.95,
            interpolation: SincInterpolationType::Linear,
            oversampling_factor: 256,
            window: WindowFunction::BlackmanHarris2,
        };
        let inner = SincFixedIn::<f32>::new(ratio, 2.0, params, RESAMPLER_CHUNK, channels)
            .map_err(|e| Mp3fyError::ResampleFailure(e.to_string()))?;
        let delay_remaining = inner.output_delay();

        Ok(Self {
            inner,
            ratio,
            channels,
            pending: vec![Vec::with_capacity(RESAMPLER_CHUNK * 2); channels],
            delay_remaining,
            frames_in: 0,
            frames_out: 0,
        })
    }

    fn expected_output_frames(&self) -> u64 {
        (self.frames_in as f64 * self.ratio).round() as u64
    }

    fn push(&mut self, interleaved: &[f32], out: &mut Vec<f32>) -> Result<()> {
        for frame in interleaved.chunks_exact(self.channels) {
            for (ch, &s) in frame.iter().enumerate() {
                self.pending[ch].push(s);
            }
        }
        self.frames_in += (interleaved.len() / self.channels) as u64;

        while self.pending[0].len() >= RESAMPLER_CHUNK {
            let chunk: Vec<Vec<f32>> = self
                .pending
                .iter_mut()
                .map(|p| p.drain(..RESAMPLER_CHUNK).collect())
                .collect();
            self.process_chunk(&chunk, out, None)?;
        }
        Ok(())
    }

    fn flush(&mut self, out: &mut Vec<f32>) -> Result<()> {
        let expected = self.expected_output_frames();
        // Zero padding pushes the held-back tail through the filter.
        let mut rounds = 0;
        while self.frames_out < expected {
            rounds += 1;
            if rounds > 64 {
                return Err(Mp3fyError::ResampleFailure(format!(
                    "flush stalled at {} of {} frames",
                    self.frames_out, expected
                )));
            }
            let chunk: Vec<Vec<f32>> = self
                .pending
                .iter_mut()
                .map(|p| {
                    let mut c: Vec<f32> = std::mem::take(p);
                    c.resize(RESAMPLER_CHUNK, 0.0);
                    c
                })
                .collect();
            self.process_chunk(&chunk, out, Some(expected))?;
        }
        Ok(())
    }

    fn process_chunk(
        &mut self,
        chunk: &[Vec<f32>],
        out: &mut Vec<f32>,
        limit: Option<u64>,
    ) -> Result<()> {
        let resampled = self
            .inner
            .process(chunk, None)
            .map_err(|e| Mp3fyError::ResampleFailure(e.to_string()))?;

        let produced = resampled.first().map(|c| c.len()).unwrap_or(0);
        let skip = self.delay_remaining.min(produced);
        self.delay_remaining -= skip;

        let mut take = produced - skip;
        if let Some(limit) = limit {
            take = take.min(limit.saturating_sub(self.frames_out) as usize);
        }

        out.reserve(take * self.channels);
        for i in skip..skip + take {
            for channel in resampled.iter() {
                out.push(channel[i]);
            }
        }
        self.frames_out += take as u64;
        Ok(())
    }
}

/// Converts decoded PCM into the encoder's input layout
pub struct FormatConverter {
    source: PcmLayout,
    target: PcmLayout,
    resampler: Option<StreamResampler>,
    scratch: Vec<f32>,
}

impl FormatConverter {
    /// Build a converter from `source` to `target`
    ///
    /// `target.channels` must be 2; the MP3 encoder is always fed stereo.
    pub fn new(source: PcmLayout, target: PcmLayout) -> Result<Self> {
        if source.sample_rate == 0 || source.channels == 0 {
            return Err(Mp3fyError::UnsupportedStream(format!(
                "source layout {} Hz / {} channels",
                source.sample_rate, source.channels
            )));
        }
        if target.channels != 2 {
            return Err(Mp3fyError::internal(format!(
                "encoder input must be stereo, got {} channels",
                target.channels
            )));
        }

        let resampler = if source.sample_rate != target.sample_rate {
            debug!(
                from = source.sample_rate,
                to = target.sample_rate,
                "Resampling enabled"
            );
            Some(StreamResampler::new(source.sample_rate, target.sample_rate, target.channels)?)
        } else {
            None
        };

        Ok(Self {
            source,
            target,
            resampler,
            scratch: Vec::new(),
        })
    }

    pub fn source(&self) -> PcmLayout {
        self.source
    }

    pub fn target(&self) -> PcmLayout {
        self.target
    }

    /// True when chunks are passed through without any work
    pub fn is_passthrough(&self) -> bool {
        self.resampler.is_none() && self.source.channels == self.target.channels
    }

    /// Convert one interleaved chunk, appending the result to `out`
    pub fn process(&mut self, interleaved: &[f32], out: &mut Vec<f32>) -> Result<()> {
        if self.is_passthrough() {
            out.extend_from_slice(interleaved);
            return Ok(());
        }

        match self.resampler.as_mut() {
            Some(resampler) => {
                self.scratch.clear();
                remix_to_stereo(interleaved, self.source.channels, &mut self.scratch);
                resampler.push(&self.scratch, out)
            }
            None => {
                remix_to_stereo(interleaved, self.source.channels, out);
                Ok(())
            }
        }
    }

    /// Drain samples still held by the resampler
    pub fn flush(&mut self, out: &mut Vec<f32>) -> Result<()> {
        match self.resampler.as_mut() {
            Some(resampler) => resampler.flush(out),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_nearest_mp3_sample_rate() {
        assert_eq!(nearest_mp3_sample_rate(44_100), 44_100);
        assert_eq!(nearest_mp3_sample_rate(8_000), 8_000);
        assert_eq!(nearest_mp3_sample_rate(96_000), 48_000);
        assert_eq!(nearest_mp3_sample_rate(88_200), 44_100);
        assert_eq!(nearest_mp3_sample_rate(176_400), 44_100);
        assert_eq!(nearest_mp3_sample_rate(37_800), 32_000);
        assert_eq!(nearest_mp3_sample_rate(4_000), 8_000);
    }

    #[test]
    fn test_remix_mono_duplicates() {
        let mut out = Vec::new();
        remix_to_stereo(&[0.1, 0.2], 1, &mut out);
        assert_eq!(out, vec![0.1, 0.1, 0.2, 0.2]);
    }

    #[test]
    fn test_remix_surround_folds_and_normalises() {
        // Two frames of 4 channels
        let input = [1.0, 0.0, 1.0, 1.0, 0.0, 0.0, 0.0, 0.0];
        let mut out = Vec::new();
        remix_to_stereo(&input, 4, &mut out);

        assert_eq!(out.len(), 4);
        // (1.0 + 1.0) / 2.0 and (0.0 + 1.0) / 2.0
        assert!((out[0] - 1.0).abs() < 1e-6);
        assert!((out[1] - 0.5).abs() < 1e-6);
        assert_eq!(&out[2..], &[0.0, 0.0]);
    }

    #[test]
    fn test_passthrough_when_layout_matches() {
        let layout = PcmLayout { sample_rate: 44_100, channels: 2 };
        let mut converter = FormatConverter::new(layout, layout).unwrap();
        assert!(converter.is_passthrough());

        let mut out = Vec::new();
        converter.process(&[0.5, -0.5, 0.25, -0.25], &mut out).unwrap();
        converter.flush(&mut out).unwrap();
        assert_eq!(out, vec![0.5, -0.5, 0.25, -0.25]);
    }

    #[test]
    fn test_resampled_length_matches_ratio() {
        let source = PcmLayout { sample_rate: 48_000, channels: 1 };
        let target = PcmLayout { sample_rate: 44_100, channels: 2 };
        let mut converter = FormatConverter::new(source, target).unwrap();
        assert!(!converter.is_passthrough());

        // One second of mono audio fed in uneven packets
        let input: Vec<f32> = (0..48_000).map(|i| ((i as f32) * 0.01).sin() * 0.5).collect();
        let mut out = Vec::new();
        for packet in input.chunks(1_152) {
            converter.process(packet, &mut out).unwrap();
        }
        converter.flush(&mut out).unwrap();

        assert_eq!(out.len(), 44_100 * 2);
    }

    #[test]
    fn test_rejects_non_stereo_target() {
        let source = PcmLayout { sample_rate: 44_100, channels: 2 };
        let target = PcmLayout { sample_rate: 44_100, channels: 1 };
        assert!(FormatConverter::new(source, target).is_err());
    }
}
