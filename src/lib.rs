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


//! MP3fy core
//!
//! Converts audio files to MP3 and reads or rewrites their tags and cover
//! art. Conversions run as sessions addressed by opaque handles; metadata
//! operations work on plain paths.
//!
//! # Layout
//! - [`audio`] - codec adapter, transcode pipeline, metadata store
//! - [`session`] - session lifecycle, progress, handle registry
//! - [`engine`] - the facade used by every caller
//! - [`bindings`] - uniffi export for Kotlin and Swift
//! - `jni_bridge` - Android natives (Android builds only)

uniffi::setup_scaffolding!();

pub mod audio;
pub mod bindings;
pub mod config;
pub mod engine;
pub mod error;
pub mod logging;
pub mod session;

// JNI bridge for Android
#[cfg(target_os = "android")]
mod jni_bridge;

pub use audio::{AlbumArt, AudioFileInfo, ConversionOptions, EncodingQuality, MetadataRecord};
pub use config::EngineConfig;
pub use engine::{ConversionTask, Engine};
pub use error::{ErrorKind, Mp3fyError, Result};
pub use session::{SessionHandle, SessionState, SessionStatus, INVALID_HANDLE};
