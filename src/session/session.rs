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


//! A single conversion job bound to one input and one output path

use crate::audio::decoder::InputMedia;
use crate::error::{ErrorKind, Mp3fyError, Result};
use crate::session::progress::{ConversionProgress, SessionState, SessionStatus};
use crate::session::registry::SessionHandle;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, info, warn};

#[derive(Debug)]
struct Lifecycle {
    state: SessionState,
    error_detail: Option<String>,
    error_kind: Option<ErrorKind>,
    created_at: DateTime<Utc>,
    started_at: Option<DateTime<Utc>>,
    finished_at: Option<DateTime<Utc>>,
}

/// One input/output pair and the state of its conversion
///
/// Only the pipeline thread changes state or progress; any thread may read
/// them.
#[derive(Debug)]
pub struct Session {
    handle: SessionHandle,
    input_path: PathBuf,
    output_path: PathBuf,
    media: Mutex<Option<InputMedia>>,
    lifecycle: Mutex<Lifecycle>,
    progress: ConversionProgress,
    cancel_requested: AtomicBool,
}

impl Session {
    pub(crate) fn new(
        handle: SessionHandle,
        input_path: PathBuf,
        output_path: PathBuf,
        media: InputMedia,
    ) -> Self {
        Self {
            handle,
            input_path,
            output_path,
            media: Mutex::new(Some(media)),
            lifecycle: Mutex::new(Lifecycle {
                state: SessionState::Created,
                error_detail: None,
                error_kind: None,
                created_at: Utc::now(),
                started_at: None,
                finished_at: None,
            }),
            progress: ConversionProgress::new(),
            cancel_requested: AtomicBool::new(false),
        }
    }

    pub fn handle(&self) -> SessionHandle {
        self.handle
    }

    pub fn input_path(&self) -> &Path {
        &self.input_path
    }

    pub fn output_path(&self) -> &Path {
        &self.output_path
    }

    pub fn state(&self) -> SessionState {
        self.lifecycle.lock().state
    }

    /// Current percentage, `0..=100`
    pub fn progress(&self) -> i32 {
        self.progress.get()
    }

    pub(crate) fn progress_tracker(&self) -> &ConversionProgress {
        &self.progress
    }

    /// Failure description; `None` unless the session failed
    pub fn error_detail(&self) -> Option<String> {
        self.lifecycle.lock().error_detail.clone()
    }

    /// Move from Created to Running
    pub fn begin(&self) -> Result<()> {
        let mut lifecycle = self.lifecycle.lock();
        if lifecycle.state != SessionState::Created {
            return Err(Mp3fyError::InvalidState(format!(
                "session {} is {}, expected created",
                self.handle, lifecycle.state
            )));
        }
        lifecycle.state = SessionState::Running;
        lifecycle.started_at = Some(Utc::now());
        debug!(handle = %self.handle, "Session running");
        Ok(())
    }

    /// Hand the opened input to the pipeline; succeeds once
    pub(crate) fn take_media(&self) -> Result<InputMedia> {
        self.media.lock().take().ok_or_else(|| {
            Mp3fyError::InvalidState(format!("session {} input already consumed", self.handle))
        })
    }

    /// Record the outcome of a run
    pub fn finish(&self, outcome: std::result::Result<(), &Mp3fyError>) -> SessionState {
        let mut lifecycle = self.lifecycle.lock();
        if lifecycle.state != SessionState::Running {
            warn!(handle = %self.handle, state = %lifecycle.state, "finish() on a session that is not running");
            return lifecycle.state;
        }

        lifecycle.finished_at = Some(Utc::now());
        lifecycle.state = match outcome {
            Ok(()) => {
                self.progress.complete();
                SessionState::Succeeded
            }
            Err(Mp3fyError::Cancelled) => SessionState::Cancelled,
            Err(e) => {
                lifecycle.error_detail = Some(e.to_string());
                lifecycle.error_kind = Some(e.kind());
                SessionState::Failed
            }
        };
        drop(self.media.lock().take());

        info!(
            handle = %self.handle,
            state = %lifecycle.state,
            progress = self.progress.get(),
            "Session finished"
        );
        lifecycle.state
    }

    /// Ask the session to stop
    ///
    /// A Created session is cancelled at once and will never run. A running
    /// one stops at the next chunk boundary. Returns false for sessions
    /// that already finished.
    pub fn request_cancel(&self) -> bool {
        let mut lifecycle = self.lifecycle.lock();
        match lifecycle.state {
            SessionState::Created => {
                lifecycle.state = SessionState::Cancelled;
                lifecycle.finished_at = Some(Utc::now());
                drop(self.media.lock().take());
                info!(handle = %self.handle, "Session cancelled before start");
                true
            }
            SessionState::Running => {
                self.cancel_requested.store(true, Ordering::Release);
                info!(handle = %self.handle, "Cancellation requested");
                true
            }
            _ => false,
        }
    }

    pub fn is_cancel_requested(&self) -> bool {
        self.cancel_requested.load(Ordering::Acquire)
    }

    pub fn status(&self) -> SessionStatus {
        let lifecycle = self.lifecycle.lock();
        SessionStatus {
            handle: self.handle.to_raw(),
            input_path: self.input_path.display().to_string(),
            output_path: self.output_path.display().to_string(),
            state: lifecycle.state,
            progress: self.progress.get(),
            error_detail: lifecycle.error_detail.clone(),
            error_kind: lifecycle.error_kind,
            created_at: lifecycle.created_at,
            started_at: lifecycle.started_at,
            finished_at: lifecycle.finished_at,
        }
    }
}
