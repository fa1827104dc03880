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


//! Conversion state and progress reporting
//!
//! # Progress Semantics
//! - Percentage is an integer in `0..=100`
//! - Updates within one run never go backwards
//! - A successful run always ends at 100
//!
//! # Session Lifecycle
//! `Created -> Running -> {Succeeded, Failed, Cancelled}`. A Created
//! session may also be cancelled before it ever runs.

use crate::error::ErrorKind;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicI32, Ordering};

/// Lifecycle state of a conversion session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    /// Opened, waiting for convert
    Created,
    /// Pipeline is running
    Running,
    /// Output fully written
    Succeeded,
    /// A stage failed; output may be partial
    Failed,
    /// Stopped on request; output may be partial
    Cancelled,
}

impl SessionState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Cancelled)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Running => "running",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// `round(consumed / total * 100)` clamped to `0..=100`; 0 when the total
/// is unknown
pub fn percentage_of(consumed: u64, total: u64) -> i32 {
    if total == 0 {
        return 0;
    }
    let pct = (consumed as f64 / total as f64 * 100.0).round();
    pct.clamp(0.0, 100.0) as i32
}

/// Monotonic percentage shared between the pipeline and pollers
#[derive(Debug, Default)]
pub struct ConversionProgress {
    percent: AtomicI32,
}

impl ConversionProgress {
    pub fn new() -> Self {
        Self::default()
    }

    /// Raise the percentage to `pct` (clamped); lower values are ignored
    ///
    /// Returns the value now stored.
    pub fn advance(&self, pct: i32) -> i32 {
        let pct = pct.clamp(0, 100);
        let previous = self.percent.fetch_max(pct, Ordering::AcqRel);
        previous.max(pct)
    }

    pub fn complete(&self) {
        self.percent.store(100, Ordering::Release);
    }

    pub fn get(&self) -> i32 {
        self.percent.load(Ordering::Acquire)
    }
}

/// Serialisable snapshot of a session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionStatus {
    pub handle: i64,
    pub input_path: String,
    pub output_path: String,
    pub state: SessionState,
    pub progress: i32,
    /// Present only when `state` is Failed
    pub error_detail: Option<String>,
    pub error_kind: Option<ErrorKind>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl SessionStatus {
    /// Time spent running, up to now for a running session
    pub fn elapsed_ms(&self) -> Option<i64> {
        let started = self.started_at?;
        let end = self.finished_at.unwrap_or_else(Utc::now);
        Some((end - started).num_milliseconds().max(0))
    }

    /// One-line summary for logs and the CLI
    pub fn display_string(&self) -> String {
        match self.state {
            SessionState::Created => format!("{}: waiting", self.input_path),
            SessionState::Running => format!("{}: {}%", self.input_path, self.progress),
            SessionState::Succeeded => format!(
                "{}: done in {} ms",
                self.input_path,
                self.elapsed_ms().unwrap_or(0)
            ),
            SessionState::Failed => format!(
                "{}: failed - {}",
                self.input_path,
                self.error_detail.as_deref().unwrap_or("unknown error")
            ),
            SessionState::Cancelled => format!("{}: cancelled at {}%", self.input_path, self.progress),
        }
    }
}
