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


//! uniffi export for Kotlin and Swift
//!
//! Mirrors the engine's plain operations. Paths cross as strings, tag maps
//! as `HashMap<String, String>`, handles as `i64`.

use crate::audio::metadata::{AlbumArt, AudioFileInfo};
use crate::config::EngineConfig;
use crate::engine::Engine;
use crate::error::Mp3fyError;
use std::collections::HashMap;
use std::sync::Arc;

/// Error surfaced to foreign callers
#[derive(Debug, thiserror::Error, uniffi::Error)]
#[uniffi(flat_error)]
pub enum Mp3fyBindingError {
    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),
    #[error("engine unavailable: {0}")]
    Engine(String),
}

impl From<Mp3fyError> for Mp3fyBindingError {
    fn from(err: Mp3fyError) -> Self {
        match err {
            Mp3fyError::InvalidConfiguration(msg) => Self::InvalidConfiguration(msg),
            other => Self::Engine(other.to_string()),
        }
    }
}

#[derive(Debug, Clone, uniffi::Record)]
pub struct AlbumArtRecord {
    pub width: u32,
    pub height: u32,
    /// MIME type of `data`, absent for raw pixels
    pub mime_type: Option<String>,
    /// Encoded image bytes, empty for raw pixels
    pub data: Vec<u8>,
    /// RGBA8 pixels
    pub pixels: Vec<u8>,
}

impl From<AlbumArt> for AlbumArtRecord {
    fn from(art: AlbumArt) -> Self {
        Self {
            width: art.width,
            height: art.height,
            mime_type: art.encoding.mime_type().map(str::to_string),
            data: art.data,
            pixels: art.pixels,
        }
    }
}

#[derive(Debug, Clone, uniffi::Record)]
pub struct AudioFileInfoRecord {
    pub metadata: HashMap<String, String>,
    pub album_art: Option<AlbumArtRecord>,
    pub duration_micros: u64,
    pub bitrate_bps: u64,
    pub sample_rate: u32,
    pub channels: u8,
}

impl From<AudioFileInfo> for AudioFileInfoRecord {
    fn from(info: AudioFileInfo) -> Self {
        Self {
            metadata: info.metadata.fields.into_iter().collect(),
            album_art: info.metadata.album_art.map(AlbumArtRecord::from),
            duration_micros: info.duration_micros,
            bitrate_bps: info.bitrate_bps,
            sample_rate: info.sample_rate,
            channels: info.channels,
        }
    }
}

/// Completion listener for `convert_async`; exactly one method is called
#[uniffi::export(callback_interface)]
pub trait ConversionListener: Send + Sync {
    fn on_success(&self);
    fn on_failure(&self, reason: String);
}

/// Engine handle for foreign code
#[derive(Debug, uniffi::Object)]
pub struct Mp3fy {
    engine: Engine,
}

#[uniffi::export]
impl Mp3fy {
    #[uniffi::constructor]
    pub fn new() -> Result<Arc<Self>, Mp3fyBindingError> {
        Ok(Arc::new(Self {
            engine: Engine::with_defaults()?,
        }))
    }

    #[uniffi::constructor]
    pub fn with_config_json(json: String) -> Result<Arc<Self>, Mp3fyBindingError> {
        let config = EngineConfig::from_json_str(&json)?;
        Ok(Arc::new(Self {
            engine: Engine::new(config)?,
        }))
    }

    pub fn initialize(&self, input_path: String, output_path: String) -> i64 {
        self.engine.initialize(input_path, output_path)
    }

    pub fn convert(&self, handle: i64) -> bool {
        self.engine.convert(handle)
    }

    pub fn convert_async(&self, handle: i64, listener: Box<dyn ConversionListener>) {
        let listener: Arc<dyn ConversionListener> = Arc::from(listener);
        let on_failure = Arc::clone(&listener);
        self.engine.convert_async(
            handle,
            move || listener.on_success(),
            move |err| on_failure.on_failure(err.user_message()),
        );
    }

    pub fn get_percentage(&self, handle: i64) -> i32 {
        self.engine.get_percentage(handle)
    }

    pub fn cancel(&self, handle: i64) -> bool {
        self.engine.cancel(handle)
    }

    pub fn release(&self, handle: i64) {
        self.engine.release(handle);
    }

    /// Session snapshot as JSON, absent for unknown handles
    pub fn status_json(&self, handle: i64) -> Option<String> {
        let status = self.engine.session_status(handle)?;
        serde_json::to_string(&status).ok()
    }

    pub fn get_all_metadata(&self, path: String) -> HashMap<String, String> {
        self.engine.get_all_metadata(path).into_iter().collect()
    }

    pub fn get_album_art(&self, path: String) -> Option<AlbumArtRecord> {
        self.engine.get_album_art(path).map(AlbumArtRecord::from)
    }

    pub fn get_audio_file_info(&self, path: String) -> Option<AudioFileInfoRecord> {
        self.engine.get_audio_file_info(path).map(AudioFileInfoRecord::from)
    }

    /// `album_art` may be encoded bytes or, with `width`/`height` set, raw
    /// RGBA pixels
    pub fn edit_metadata_information(
        &self,
        input_path: String,
        fields: HashMap<String, String>,
        album_art: Option<Vec<u8>>,
        width: u32,
        height: u32,
        output_path: String,
    ) -> bool {
        let art = match album_art {
            None => None,
            Some(bytes) => {
                let decoded = if width > 0 && height > 0 {
                    AlbumArt::from_rgba(width, height, bytes)
                } else {
                    AlbumArt::from_encoded(bytes)
                };
                match decoded {
                    Ok(art) => Some(art),
                    Err(e) => {
                        tracing::warn!(error = %e, "Rejected album art");
                        return false;
                    }
                }
            }
        };
        self.engine
            .edit_metadata_information(input_path, fields, art, output_path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Counter {
        success: Arc<AtomicUsize>,
        failure: Arc<AtomicUsize>,
    }

    impl ConversionListener for Counter {
        fn on_success(&self) {
            self.success.fetch_add(1, Ordering::SeqCst);
        }
        fn on_failure(&self, _reason: String) {
            self.failure.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_bad_config_json() {
        let err = Mp3fy::with_config_json("{\"worker_threads\": 0}".into()).unwrap_err();
        assert!(matches!(err, Mp3fyBindingError::InvalidConfiguration(_)));
    }

    #[test]
    fn test_async_unknown_handle_calls_failure_once() {
        let mp3fy = Mp3fy::new().unwrap();
        let success = Arc::new(AtomicUsize::new(0));
        let failure = Arc::new(AtomicUsize::new(0));
        mp3fy.convert_async(
            -1,
            Box::new(Counter {
                success: Arc::clone(&success),
                failure: Arc::clone(&failure),
            }),
        );

        let deadline = std::time::Instant::now() + std::time::Duration::from_secs(5);
        while failure.load(Ordering::SeqCst) == 0 && std::time::Instant::now() < deadline {
            std::thread::sleep(std::time::Duration::from_millis(10));
        }
        assert_eq!(failure.load(Ordering::SeqCst), 1);
        assert_eq!(success.load(Ordering::SeqCst), 0);
        assert!(mp3fy.status_json(-1).is_none());
    }
}
