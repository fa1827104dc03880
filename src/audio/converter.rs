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


//! Transcode pipeline
//!
//! # Stages
//! 1. Open: the session's input was probed when the session was created
//! 2. Decode: packets of the first audio track become interleaved `f32`
//! 3. Resample: channel remix and rate conversion, skipped when the layout
//!    already matches the encoder
//! 4. Encode: LAME CBR stereo
//! 5. Mux: whole MP3 frames appended in order; the encoder flush is kept
//! 6. Progress: recomputed after every chunk, never decreasing
//!
//! Cancellation is checked between chunks. A failed or cancelled run
//! leaves whatever was written so far in place.
//!
//! After the audio is complete the input's tags and cover art are copied
//! onto the output. That step is best effort and never fails a run.

use crate::audio::decoder::PcmChunk;
use crate::audio::encoder::{legal_bitrate, EncodingQuality, Mp3Encoder, MP3_BITRATES_KBPS};
use crate::audio::muxer::{Mp3FrameWriter, MuxStats};
use crate::audio::resampler::{is_mp3_sample_rate, nearest_mp3_sample_rate, FormatConverter, PcmLayout};
use crate::audio::tags::{self, PictureUpdate};
use crate::error::{Mp3fyError, Result};
use crate::session::progress::percentage_of;
use crate::session::Session;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::File;
use std::io::BufWriter;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Receives the new percentage whenever it changes
pub type ProgressCallback = Arc<dyn Fn(i32) + Send + Sync>;

/// Encoder and carry-over settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConversionOptions {
    /// CBR bitrate in kbps
    ///
    /// Moved to the nearest bitrate the output sample rate allows when it
    /// is out of range for that MPEG version (e.g. 192 at 16 kHz becomes 160).
    pub bitrate_kbps: u32,

    pub quality: EncodingQuality,

    /// Output sample rate; the source rate (or the nearest legal one) when unset
    pub target_sample_rate: Option<u32>,

    /// Copy the input's tags to the output
    pub preserve_metadata: bool,

    /// Copy the input's cover art to the output
    pub preserve_album_art: bool,

    /// Skip packets that fail to decode instead of failing the run
    pub skip_corrupt_packets: bool,
}

impl Default for ConversionOptions {
    fn default() -> Self {
        Self {
            bitrate_kbps: 192,
            quality: EncodingQuality::High,
            target_sample_rate: None,
            preserve_metadata: true,
            preserve_album_art: true,
            skip_corrupt_packets: false,
        }
    }
}

impl ConversionOptions {
    pub fn validate(&self) -> Result<()> {
        if !MP3_BITRATES_KBPS.contains(&self.bitrate_kbps) {
            return Err(Mp3fyError::InvalidConfiguration(format!(
                "bitrate {} kbps is not an MP3 bitrate",
                self.bitrate_kbps
            )));
        }
        if let Some(rate) = self.target_sample_rate {
            if !is_mp3_sample_rate(rate) {
                return Err(Mp3fyError::InvalidConfiguration(format!(
                    "sample rate {} Hz is not an MP3 sample rate",
                    rate
                )));
            }
        }
        Ok(())
    }

    fn output_rate(&self, source_rate: u32) -> u32 {
        self.target_sample_rate
            .unwrap_or_else(|| nearest_mp3_sample_rate(source_rate))
    }
}

/// Runs sessions through the pipeline
#[derive(Debug, Clone, Default)]
pub struct AudioConverter {
    options: ConversionOptions,
}

impl AudioConverter {
    pub fn new(options: ConversionOptions) -> Self {
        Self { options }
    }

    pub fn options(&self) -> &ConversionOptions {
        &self.options
    }

    /// Run `session` to completion on the calling thread
    pub fn convert(&self, session: &Session) -> Result<()> {
        self.convert_with_progress(session, Arc::new(|_| {}))
    }

    /// Run `session`, reporting each percentage change
    ///
    /// Fails with `InvalidState` without touching the output when the
    /// session is not in the Created state.
    pub fn convert_with_progress(&self, session: &Session, on_progress: ProgressCallback) -> Result<()> {
        session.begin()?;
        info!(
            handle = %session.handle(),
            input = %session.input_path().display(),
            output = %session.output_path().display(),
            "Conversion started"
        );

        let outcome = self.transcode(session, &on_progress).map(|stats| {
            self.carry_over_tags(session.input_path(), session.output_path());
            stats
        });

        let before = session.progress();
        session.finish(outcome.as_ref().map(|_| ()));
        if session.progress() != before {
            on_progress(session.progress());
        }

        match outcome {
            Ok(stats) => {
                info!(
                    handle = %session.handle(),
                    frames = stats.frames,
                    bytes = stats.bytes,
                    duration_micros = stats.duration_micros,
                    "Conversion succeeded"
                );
                Ok(())
            }
            Err(e) => {
                warn!(handle = %session.handle(), kind = ?e.kind(), error = %e, "Conversion did not complete");
                Err(e)
            }
        }
    }

    fn transcode(&self, session: &Session, on_progress: &ProgressCallback) -> Result<MuxStats> {
        let mut media = session.take_media()?;
        media.set_skip_corrupt_packets(self.options.skip_corrupt_packets);

        let output = session.output_path();
        let file = File::create(output).map_err(|e| Mp3fyError::io_failure("create", output, e))?;
        let mut muxer = Mp3FrameWriter::new(BufWriter::new(file)).expect_lame_placeholder();

        let first = media.next_chunk()?.ok_or_else(|| {
            Mp3fyError::DecodeFailure(format!("{}: no audio frames", media.path().display()))
        })?;
        let (mut converter, mut encoder) = self.build_stages(&first)?;

        let mut pcm = Vec::new();
        let mut mp3 = Vec::new();
        let mut reported = session.progress();
        let mut next = Some(first);

        while let Some(chunk) = next {
            let source = converter.source();
            if chunk.sample_rate != source.sample_rate || chunk.channels != source.channels {
                return Err(Mp3fyError::DecodeFailure(format!(
                    "stream changed from {} Hz/{} ch to {} Hz/{} ch",
                    source.sample_rate, source.channels, chunk.sample_rate, chunk.channels
                )));
            }

            pcm.clear();
            mp3.clear();
            converter.process(&chunk.samples, &mut pcm)?;
            encoder.encode(&pcm, &mut mp3)?;
            muxer.write(&mp3)?;

            let (consumed, total) = media.progress_units();
            let now = session.progress_tracker().advance(percentage_of(consumed, total));
            if now != reported {
                reported = now;
                on_progress(now);
            }

            if session.is_cancel_requested() {
                return Err(Mp3fyError::Cancelled);
            }
            next = media.next_chunk()?;
        }

        pcm.clear();
        mp3.clear();
        converter.flush(&mut pcm)?;
        encoder.encode(&pcm, &mut mp3)?;
        encoder.flush(&mut mp3)?;
        muxer.write(&mp3)?;

        let (writer, stats) = muxer.finish()?;
        let file = writer
            .into_inner()
            .map_err(|e| Mp3fyError::io_failure("flush", output, e.into_error()))?;
        file.sync_all()
            .map_err(|e| Mp3fyError::io_failure("sync", output, e))?;

        if media.skipped_packets() > 0 {
            warn!(skipped = media.skipped_packets(), "Corrupt packets were skipped");
        }
        debug!(
            frames_in = media.frames_decoded(),
            frames_encoded = encoder.frames_in(),
            "Pipeline drained"
        );
        Ok(stats)
    }

    fn build_stages(&self, first: &PcmChunk) -> Result<(FormatConverter, Mp3Encoder)> {
        let source = PcmLayout {
            sample_rate: first.sample_rate,
            channels: first.channels,
        };
        let target = PcmLayout {
            sample_rate: self.options.output_rate(first.sample_rate),
            channels: 2,
        };
        let converter = FormatConverter::new(source, target)?;
        let bitrate_kbps = legal_bitrate(target.sample_rate, self.options.bitrate_kbps);
        if bitrate_kbps != self.options.bitrate_kbps {
            warn!(
                requested_kbps = self.options.bitrate_kbps,
                bitrate_kbps,
                sample_rate = target.sample_rate,
                "Bitrate not available at this sample rate, using nearest"
            );
        }
        let encoder = Mp3Encoder::new(target.sample_rate, bitrate_kbps, self.options.quality)?;
        debug!(
            source_rate = source.sample_rate,
            source_channels = source.channels,
            target_rate = target.sample_rate,
            bitrate_kbps,
            passthrough = converter.is_passthrough(),
            "Pipeline stages ready"
        );
        Ok((converter, encoder))
    }

    fn carry_over_tags(&self, input: &Path, output: &Path) {
        if !self.options.preserve_metadata && !self.options.preserve_album_art {
            return;
        }
        let probed = match tags::read_file(input) {
            Ok(probed) => probed,
            Err(e) => {
                debug!(input = %input.display(), error = %e, "No tags to carry over");
                return;
            }
        };

        let fields = if self.options.preserve_metadata {
            probed.tags.fields.clone()
        } else {
            BTreeMap::new()
        };
        let pictures = match probed.tags.cover() {
            Some(cover) if self.options.preserve_album_art => PictureUpdate::Replace(cover.clone()),
            _ => PictureUpdate::Keep,
        };
        if fields.is_empty() && matches!(pictures, PictureUpdate::Keep) {
            return;
        }

        match tags::write_tags(output, &fields, pictures) {
            Ok(dropped) if !dropped.is_empty() => {
                debug!(?dropped, "Tags without an ID3v2 equivalent were not copied");
            }
            Ok(_) => {}
            Err(e) => warn!(output = %output.display(), error = %e, "Failed to copy tags to output"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::{SessionRegistry, SessionState};
    use crate::test_support::write_sine_wav;
    use std::sync::Mutex;

    #[test]
    fn test_options_validation() {
        assert!(ConversionOptions::default().validate().is_ok());

        let bad_bitrate = ConversionOptions {
            bitrate_kbps: 100,
            ..Default::default()
        };
        assert!(matches!(bad_bitrate.validate(), Err(Mp3fyError::InvalidConfiguration(_))));

        let bad_rate = ConversionOptions {
            target_sample_rate: Some(96_000),
            ..Default::default()
        };
        assert!(bad_rate.validate().is_err());
    }

    #[test]
    fn test_options_deserialize_with_defaults() {
        let options: ConversionOptions = serde_json::from_str(r#"{"bitrate_kbps": 128, "quality": "fast"}"#).unwrap();
        assert_eq!(options.bitrate_kbps, 128);
        assert_eq!(options.quality, EncodingQuality::Fast);
        assert!(options.preserve_metadata);
        assert_eq!(options.target_sample_rate, None);
    }

    #[test]
    fn test_convert_reports_monotonic_progress() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("in.wav");
        let output = dir.path().join("out.mp3");
        write_sine_wav(&input, 48_000, 1, 1.0);

        let registry = SessionRegistry::new();
        let handle = registry.create(&input, &output).unwrap();
        let session = registry.get(handle).unwrap();

        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let converter = AudioConverter::new(ConversionOptions {
            bitrate_kbps: 128,
            quality: EncodingQuality::Fast,
            ..Default::default()
        });
        converter
            .convert_with_progress(&session, Arc::new(move |pct| sink.lock().unwrap().push(pct)))
            .unwrap();

        let seen = seen.lock().unwrap();
        assert!(seen.windows(2).all(|w| w[0] < w[1]), "{:?}", seen);
        assert_eq!(seen.last(), Some(&100));
        assert_eq!(session.state(), SessionState::Succeeded);
        assert!(std::fs::metadata(&output).unwrap().len() > 0);
    }

    #[test]
    fn test_second_convert_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("in.wav");
        let output = dir.path().join("out.mp3");
        write_sine_wav(&input, 44_100, 2, 0.5);

        let registry = SessionRegistry::new();
        let session = registry.get(registry.create(&input, &output).unwrap()).unwrap();
        let converter = AudioConverter::default();

        converter.convert(&session).unwrap();
        let written = std::fs::read(&output).unwrap();

        assert!(matches!(converter.convert(&session), Err(Mp3fyError::InvalidState(_))));
        assert_eq!(session.state(), SessionState::Succeeded);
        assert_eq!(std::fs::read(&output).unwrap(), written);
    }

    #[test]
    fn test_cancel_mid_run_leaves_partial_output() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("in.wav");
        let output = dir.path().join("out.mp3");
        write_sine_wav(&input, 44_100, 2, 5.0);

        let registry = SessionRegistry::new();
        let session = registry.get(registry.create(&input, &output).unwrap()).unwrap();
        let target = Arc::clone(&session);
        let converter = AudioConverter::default();

        let result = converter.convert_with_progress(
            &session,
            Arc::new(move |pct| {
                if pct >= 10 {
                    target.request_cancel();
                }
            }),
        );

        assert!(matches!(result, Err(Mp3fyError::Cancelled)));
        assert_eq!(session.state(), SessionState::Cancelled);
        assert!(session.progress() < 100);
        assert!(output.exists());
    }
}
