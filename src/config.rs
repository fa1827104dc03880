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


//! Engine configuration
//!
//! Every field has a default, so a JSON document only needs the values it
//! changes:
//!
//! ```json
//! { "worker_threads": 4, "conversion": { "bitrate_kbps": 320 } }
//! ```

use crate::audio::converter::ConversionOptions;
use crate::audio::metadata::DEFAULT_ART_QUALITY;
use crate::error::{Mp3fyError, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Threads driving async conversions
    pub worker_threads: usize,

    /// Upper bound on concurrently running conversions
    pub max_blocking_threads: usize,

    /// JPEG quality (1-100) for cover art written by metadata edits
    pub album_art_quality: u8,

    pub conversion: ConversionOptions,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            worker_threads: 2,
            max_blocking_threads: 8,
            album_art_quality: DEFAULT_ART_QUALITY,
            conversion: ConversionOptions::default(),
        }
    }
}

impl EngineConfig {
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)
            .map_err(|e| Mp3fyError::InvalidConfiguration(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_json_file(path: &Path) -> Result<Self> {
        let json = std::fs::read_to_string(path).map_err(|e| Mp3fyError::from_io(path, e))?;
        Self::from_json_str(&json)
    }

    pub fn validate(&self) -> Result<()> {
        if self.worker_threads == 0 {
            return Err(Mp3fyError::InvalidConfiguration(
                "worker_threads must be at least 1".to_string(),
            ));
        }
        if self.max_blocking_threads == 0 {
            return Err(Mp3fyError::InvalidConfiguration(
                "max_blocking_threads must be at least 1".to_string(),
            ));
        }
        if !(1..=100).contains(&self.album_art_quality) {
            return Err(Mp3fyError::InvalidConfiguration(format!(
                "album_art_quality {} is outside 1-100",
                self.album_art_quality
            )));
        }
        self.conversion.validate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::encoder::EncodingQuality;

    #[test]
    fn test_defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.worker_threads, 2);
        assert_eq!(config.max_blocking_threads, 8);
        assert_eq!(config.album_art_quality, 90);
        assert_eq!(config.conversion.bitrate_kbps, 192);
        assert_eq!(config.conversion.quality, EncodingQuality::High);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_json() {
        let config = EngineConfig::from_json_str(
            r#"{ "worker_threads": 4, "conversion": { "bitrate_kbps": 320 } }"#,
        )
        .unwrap();
        assert_eq!(config.worker_threads, 4);
        assert_eq!(config.conversion.bitrate_kbps, 320);
        assert!(config.conversion.preserve_album_art);
    }

    #[test]
    fn test_invalid_values_rejected() {
        for json in [
            r#"{ "worker_threads": 0 }"#,
            r#"{ "album_art_quality": 0 }"#,
            r#"{ "conversion": { "bitrate_kbps": 300 } }"#,
            r#"{ "conversion": { "target_sample_rate": 44000 } }"#,
            "not json",
        ] {
            let err = EngineConfig::from_json_str(json).unwrap_err();
            assert!(matches!(err, Mp3fyError::InvalidConfiguration(_)), "{}", json);
        }
    }

    #[test]
    fn test_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mp3fy.json");
        std::fs::write(&path, r#"{ "album_art_quality": 75 }"#).unwrap();

        assert_eq!(EngineConfig::from_json_file(&path).unwrap().album_art_quality, 75);
        assert!(matches!(
            EngineConfig::from_json_file(&dir.path().join("missing.json")),
            Err(Mp3fyError::FileNotFound(_))
        ));
    }
}
