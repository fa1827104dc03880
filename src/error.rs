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


//! Error types for MP3fy
//!
//! Every fallible operation in the crate returns [`Result<T>`]. Variants are
//! grouped by the stage that produced them so the boundary layers (the
//! [`crate::engine::Engine`] boolean/sentinel methods, the JNI natives and the
//! uniffi object) can log a precise cause before collapsing it to the
//! public failure signal.
//!
//! ## Taxonomy
//!
//! [`Mp3fyError::kind`] folds the variants onto a small [`ErrorKind`] set:
//! - `InvalidInput` - bad or missing path, unreadable container, bad arguments
//! - `UnsupportedStream` - the container holds no decodable audio track
//! - `DecodeFailure` / `EncodeFailure` - codec rejections
//! - `IoFailure` - write errors, disk full, tag rewrite failures
//! - `NotFound` - unknown or released session handle
//! - `InvalidState`, `Cancelled`, `Internal` - session lifecycle and bugs

use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

/// Result type alias using our Mp3fyError type
pub type Result<T> = std::result::Result<T, Mp3fyError>;

/// Main error type for MP3fy
#[derive(Error, Debug)]
pub enum Mp3fyError {
    // ===== Input / Path Errors =====

    /// Input or output path does not exist
    #[error("File not found: {0}")]
    FileNotFound(String),

    /// Path exists but cannot be read or written
    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    /// Path is malformed or its parent directory is unusable
    #[error("Invalid path: {0}")]
    InvalidPath(String),

    /// Caller supplied an argument the engine cannot work with
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    // ===== Stream Errors =====

    /// Container opened but holds no decodable audio track
    #[error("No decodable audio stream: {0}")]
    UnsupportedStream(String),

    /// Demuxer or decoder rejected the input
    #[error("Decode failed: {0}")]
    DecodeFailure(String),

    /// Sample-rate conversion failed
    #[error("Resample failed: {0}")]
    ResampleFailure(String),

    /// MP3 encoder rejected its configuration or input
    #[error("Encode failed: {0}")]
    EncodeFailure(String),

    // ===== Output Errors =====

    /// Writing the output container failed
    #[error("Output I/O failed: {0}")]
    IoFailure(String),

    // ===== Metadata Errors =====

    /// Tag table could not be read or written
    #[error("Tag error: {0}")]
    TagFailure(String),

    /// Embedded image could not be decoded or re-encoded
    #[error("Image error: {0}")]
    ImageFailure(String),

    // ===== Session Errors =====

    /// Handle is unknown or was released
    #[error("Session not found: {0}")]
    SessionNotFound(i64),

    /// Operation is not allowed in the session's current state
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Conversion was cancelled between chunks
    #[error("Conversion cancelled")]
    Cancelled,

    // ===== General Errors =====

    /// Engine configuration failed validation
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    /// Invariant violated inside the engine
    #[error("Internal error: {0}")]
    InternalError(String),

    // ===== External Library Errors =====

    /// Standard I/O error
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    /// JSON serialization/deserialization error
    #[error("JSON serialization error: {0}")]
    SerdeJsonError(#[from] serde_json::Error),
}

/// Coarse error category reported alongside failed sessions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    InvalidInput,
    UnsupportedStream,
    DecodeFailure,
    EncodeFailure,
    IoFailure,
    NotFound,
    InvalidState,
    Cancelled,
    Internal,
}

impl From<lofty::error::LoftyError> for Mp3fyError {
    fn from(err: lofty::error::LoftyError) -> Self {
        Mp3fyError::TagFailure(err.to_string())
    }
}

impl From<image::ImageError> for Mp3fyError {
    fn from(err: image::ImageError) -> Self {
        Mp3fyError::ImageFailure(err.to_string())
    }
}

// Helper methods for creating common errors
impl Mp3fyError {
    /// Create an InvalidInput error with a message
    pub fn invalid_input<S: Into<String>>(message: S) -> Self {
        Mp3fyError::InvalidInput(message.into())
    }

    /// Create an InternalError with a message
    pub fn internal<S: Into<String>>(message: S) -> Self {
        Mp3fyError::InternalError(message.into())
    }

    /// Create an IoFailure describing which operation failed on which path
    pub fn io_failure(operation: &str, path: &Path, err: std::io::Error) -> Self {
        Mp3fyError::IoFailure(format!("{} {}: {}", operation, path.display(), err))
    }

    /// Map an I/O error raised while opening `path`, keeping the
    /// not-found / permission distinction
    pub fn from_io(path: &Path, err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::NotFound => Mp3fyError::FileNotFound(path.display().to_string()),
            std::io::ErrorKind::PermissionDenied => {
                Mp3fyError::PermissionDenied(path.display().to_string())
            }
            _ => Mp3fyError::io_failure("open", path, err),
        }
    }

    /// Category of this error
    pub fn kind(&self) -> ErrorKind {
        match self {
            Mp3fyError::FileNotFound(_)
            | Mp3fyError::PermissionDenied(_)
            | Mp3fyError::InvalidPath(_)
            | Mp3fyError::InvalidInput(_)
            | Mp3fyError::ImageFailure(_)
            | Mp3fyError::InvalidConfiguration(_)
            | Mp3fyError::SerdeJsonError(_) => ErrorKind::InvalidInput,
            Mp3fyError::UnsupportedStream(_) => ErrorKind::UnsupportedStream,
            Mp3fyError::DecodeFailure(_) => ErrorKind::DecodeFailure,
            Mp3fyError::ResampleFailure(_) | Mp3fyError::EncodeFailure(_) => {
                ErrorKind::EncodeFailure
            }
            Mp3fyError::IoFailure(_) | Mp3fyError::TagFailure(_) | Mp3fyError::IoError(_) => {
                ErrorKind::IoFailure
            }
            Mp3fyError::SessionNotFound(_) => ErrorKind::NotFound,
            Mp3fyError::InvalidState(_) => ErrorKind::InvalidState,
            Mp3fyError::Cancelled => ErrorKind::Cancelled,
            Mp3fyError::InternalError(_) => ErrorKind::Internal,
        }
    }

    /// Nothing in the engine is retried automatically; a fresh session is
    /// needed after any failure. Only a lost race on the filesystem is
    /// worth trying again.
    pub fn is_retryable(&self) -> bool {
        match self {
            Mp3fyError::IoError(e) => matches!(
                e.kind(),
                std::io::ErrorKind::Interrupted | std::io::ErrorKind::WouldBlock
            ),
            _ => false,
        }
    }

    /// Check if error is related to file/disk operations
    pub fn is_file_error(&self) -> bool {
        matches!(
            self,
            Mp3fyError::FileNotFound(_)
                | Mp3fyError::PermissionDenied(_)
                | Mp3fyError::InvalidPath(_)
                | Mp3fyError::IoFailure(_)
                | Mp3fyError::IoError(_)
        )
    }

    /// Get user-friendly error message suitable for display
    pub fn user_message(&self) -> String {
        match self {
            Mp3fyError::FileNotFound(path) => format!("The file '{}' could not be found.", path),
            Mp3fyError::PermissionDenied(path) => {
                format!("MP3fy is not allowed to access '{}'. Check storage permissions.", path)
            }
            Mp3fyError::UnsupportedStream(_) => {
                "This file does not contain an audio track that can be converted.".to_string()
            }
            Mp3fyError::DecodeFailure(_) => {
                "The audio in this file is damaged or uses an unsupported codec.".to_string()
            }
            Mp3fyError::IoFailure(_) | Mp3fyError::IoError(_) => {
                "Writing the output file failed. Check free space and permissions.".to_string()
            }
            Mp3fyError::SessionNotFound(_) => {
                "This conversion is no longer available. Start a new one.".to_string()
            }
            Mp3fyError::InvalidState(_) => {
                "This conversion has already run. Start a new one to convert again.".to_string()
            }
            Mp3fyError::Cancelled => "The conversion was cancelled.".to_string(),
            _ => self.to_string(),
        }
    }
}
