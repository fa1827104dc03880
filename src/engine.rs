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


//! Engine facade
//!
//! [`Engine`] is the one object collaborators talk to. It owns the session
//! registry, the transcode pipeline, the metadata editor, and a thread pool
//! for asynchronous work. Construct it once per process and share it.
//!
//! # Error Surface
//! The plain operations collapse every failure to a boolean, the
//! [`INVALID_HANDLE`] sentinel, `-1`, or an empty/absent value. The typed
//! error is logged first. The `try_*` operations return it instead.
//!
//! # Async Delivery
//! `convert_async` and `get_all_metadata_async` run on the engine's pool
//! and call back on the worker thread. Exactly one callback fires, once.
//! [`Engine::submit`] hands back a [`ConversionTask`] that resolves once.

use crate::audio::converter::{AudioConverter, ProgressCallback};
use crate::audio::metadata::{AlbumArt, AudioFileInfo, MetadataEditor, MetadataRecord};
use crate::config::EngineConfig;
use crate::error::{Mp3fyError, Result};
use crate::session::{SessionHandle, SessionRegistry, SessionState, SessionStatus, INVALID_HANDLE};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::runtime::{Builder, Handle, Runtime};
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

/// Pending result of a submitted conversion
#[derive(Debug)]
pub struct ConversionTask {
    handle: i64,
    receiver: oneshot::Receiver<Result<()>>,
}

impl ConversionTask {
    pub fn handle(&self) -> i64 {
        self.handle
    }

    /// Block until the conversion ends
    ///
    /// Must not be called from inside an async context; use
    /// [`join`](Self::join) there.
    pub fn wait(self) -> Result<()> {
        self.receiver
            .blocking_recv()
            .map_err(|_| Mp3fyError::internal("conversion worker exited without a result"))?
    }

    /// Await the conversion
    pub async fn join(self) -> Result<()> {
        self.receiver
            .await
            .map_err(|_| Mp3fyError::internal("conversion worker exited without a result"))?
    }

    /// Result if the conversion already ended
    pub fn try_result(&mut self) -> Option<Result<()>> {
        match self.receiver.try_recv() {
            Ok(result) => Some(result),
            Err(oneshot::error::TryRecvError::Empty) => None,
            Err(oneshot::error::TryRecvError::Closed) => Some(Err(Mp3fyError::internal(
                "conversion worker exited without a result",
            ))),
        }
    }
}

/// Callback that runs exactly once: with the job's value, or with
/// `fallback()` if the job is dropped before it gets to run
struct Delivery<T, C: FnOnce(T)> {
    callback: Option<C>,
    fallback: fn() -> T,
}

impl<T, C: FnOnce(T)> Delivery<T, C> {
    fn new(callback: C, fallback: fn() -> T) -> Self {
        Self {
            callback: Some(callback),
            fallback,
        }
    }

    fn deliver(mut self, value: T) {
        if let Some(callback) = self.callback.take() {
            callback(value);
        }
    }
}

impl<T, C: FnOnce(T)> Drop for Delivery<T, C> {
    fn drop(&mut self) {
        if let Some(callback) = self.callback.take() {
            callback((self.fallback)());
        }
    }
}

/// Session registry, pipeline, and metadata store behind one API
pub struct Engine {
    config: EngineConfig,
    registry: Arc<SessionRegistry>,
    converter: Arc<AudioConverter>,
    editor: MetadataEditor,
    runtime: Option<Runtime>,
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("config", &self.config)
            .field("sessions", &self.registry.len())
            .finish()
    }
}

impl Engine {
    pub fn new(config: EngineConfig) -> Result<Self> {
        config.validate()?;
        let runtime = Builder::new_multi_thread()
            .worker_threads(config.worker_threads)
            .max_blocking_threads(config.max_blocking_threads)
            .thread_name("mp3fy-worker")
            .build()
            .map_err(|e| Mp3fyError::internal(format!("thread pool: {}", e)))?;

        info!(
            worker_threads = config.worker_threads,
            max_blocking_threads = config.max_blocking_threads,
            bitrate_kbps = config.conversion.bitrate_kbps,
            "Engine ready"
        );
        Ok(Self {
            registry: Arc::new(SessionRegistry::new()),
            converter: Arc::new(AudioConverter::new(config.conversion.clone())),
            editor: MetadataEditor::new(config.album_art_quality),
            runtime: Some(runtime),
            config,
        })
    }

    pub fn with_defaults() -> Result<Self> {
        Self::new(EngineConfig::default())
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn registry(&self) -> &SessionRegistry {
        &self.registry
    }

    fn pool(&self) -> Result<Handle> {
        self.runtime
            .as_ref()
            .map(|rt| rt.handle().clone())
            .ok_or_else(|| Mp3fyError::internal("engine is shut down"))
    }

    fn run_conversion(
        registry: &SessionRegistry,
        converter: &AudioConverter,
        raw: i64,
        on_progress: Option<ProgressCallback>,
    ) -> Result<()> {
        let session = registry
            .get_raw(raw)
            .ok_or(Mp3fyError::SessionNotFound(raw))?;
        match on_progress {
            Some(callback) => converter.convert_with_progress(&session, callback),
            None => converter.convert(&session),
        }
    }

    // ===== Sessions =====

    pub fn try_initialize(&self, input: impl AsRef<Path>, output: impl AsRef<Path>) -> Result<SessionHandle> {
        self.registry.create(input.as_ref(), output.as_ref())
    }

    /// Open a session; [`INVALID_HANDLE`] on failure
    pub fn initialize(&self, input: impl AsRef<Path>, output: impl AsRef<Path>) -> i64 {
        let (input, output) = (input.as_ref(), output.as_ref());
        match self.try_initialize(input, output) {
            Ok(handle) => handle.to_raw(),
            Err(e) => {
                warn!(input = %input.display(), kind = ?e.kind(), error = %e, "initialize failed");
                INVALID_HANDLE
            }
        }
    }

    pub fn try_convert(&self, handle: i64) -> Result<()> {
        Self::run_conversion(&self.registry, &self.converter, handle, None)
    }

    pub fn try_convert_with_progress(&self, handle: i64, on_progress: ProgressCallback) -> Result<()> {
        Self::run_conversion(&self.registry, &self.converter, handle, Some(on_progress))
    }

    /// Convert on the calling thread
    pub fn convert(&self, handle: i64) -> bool {
        match self.try_convert(handle) {
            Ok(()) => true,
            Err(e) => {
                warn!(handle, kind = ?e.kind(), error = %e, "convert failed");
                false
            }
        }
    }

    /// Convert on the pool, resolving the returned task once
    pub fn submit(&self, handle: i64) -> ConversionTask {
        let (sender, receiver) = oneshot::channel();
        let registry = Arc::clone(&self.registry);
        let converter = Arc::clone(&self.converter);

        match self.pool() {
            Ok(pool) => {
                pool.spawn_blocking(move || {
                    let result = Self::run_conversion(&registry, &converter, handle, None);
                    if sender.send(result).is_err() {
                        debug!(handle, "Conversion result dropped, task was discarded");
                    }
                });
            }
            Err(e) => {
                let _ = sender.send(Err(e));
            }
        }
        ConversionTask { handle, receiver }
    }

    /// Convert on the pool and call exactly one of the callbacks once,
    /// on the worker thread
    ///
    /// A job the pool drops before it starts (engine shut down) reports
    /// [`Mp3fyError::Cancelled`].
    pub fn convert_async<S, F>(&self, handle: i64, on_success: S, on_failure: F)
    where
        S: FnOnce() + Send + 'static,
        F: FnOnce(Mp3fyError) + Send + 'static,
    {
        let delivery = Delivery::new(
            move |result: Result<()>| match result {
                Ok(()) => on_success(),
                Err(e) => {
                    warn!(handle, kind = ?e.kind(), error = %e, "async convert failed");
                    on_failure(e)
                }
            },
            || Err(Mp3fyError::Cancelled),
        );

        match self.pool() {
            Ok(pool) => {
                let registry = Arc::clone(&self.registry);
                let converter = Arc::clone(&self.converter);
                pool.spawn_blocking(move || {
                    delivery.deliver(Self::run_conversion(&registry, &converter, handle, None))
                });
            }
            Err(e) => delivery.deliver(Err(e)),
        }
    }

    /// Percentage for `handle`, `-1` if unknown
    pub fn get_percentage(&self, handle: i64) -> i32 {
        self.registry
            .get_raw(handle)
            .map(|session| session.progress())
            .unwrap_or(-1)
    }

    pub fn session_status(&self, handle: i64) -> Option<SessionStatus> {
        self.registry.get_raw(handle).map(|session| session.status())
    }

    /// Stop a session that has not finished
    pub fn cancel(&self, handle: i64) -> bool {
        self.registry
            .get_raw(handle)
            .map(|session| session.request_cancel())
            .unwrap_or(false)
    }

    /// Forget `handle`; unknown handles are ignored
    pub fn release(&self, handle: i64) -> bool {
        match SessionHandle::from_raw(handle) {
            Some(h) => self.registry.release(h),
            None => false,
        }
    }

    /// Handles whose session is Created or Running
    pub fn active_sessions(&self) -> Vec<i64> {
        self.registry
            .handles()
            .into_iter()
            .filter(|h| {
                self.registry
                    .get(*h)
                    .map(|s| !s.state().is_terminal())
                    .unwrap_or(false)
            })
            .map(|h| h.to_raw())
            .collect()
    }

    // ===== Metadata =====

    pub fn try_read_metadata(&self, path: impl AsRef<Path>) -> Result<MetadataRecord> {
        self.editor.try_read(path.as_ref())
    }

    /// Every tag of `path`; empty if none or unreadable
    pub fn get_all_metadata(&self, path: impl AsRef<Path>) -> BTreeMap<String, String> {
        self.editor.read(path.as_ref()).fields
    }

    /// [`get_all_metadata`](Self::get_all_metadata) on the pool
    pub fn get_all_metadata_async<C>(&self, path: impl Into<PathBuf>, callback: C)
    where
        C: FnOnce(BTreeMap<String, String>) + Send + 'static,
    {
        let delivery = Delivery::new(callback, BTreeMap::new);
        match self.pool() {
            Ok(pool) => {
                let path = path.into();
                let editor = self.editor.clone();
                pool.spawn_blocking(move || delivery.deliver(editor.read(&path).fields));
            }
            Err(e) => {
                warn!(error = %e, "get_all_metadata_async rejected");
                delivery.deliver(BTreeMap::new());
            }
        }
    }

    pub fn get_album_art(&self, path: impl AsRef<Path>) -> Option<AlbumArt> {
        self.editor.read_album_art(path.as_ref())
    }

    pub fn try_read_info(&self, path: impl AsRef<Path>) -> Result<AudioFileInfo> {
        self.editor.try_read_info(path.as_ref())
    }

    pub fn get_audio_file_info(&self, path: impl AsRef<Path>) -> Option<AudioFileInfo> {
        self.editor.read_info(path.as_ref())
    }

    /// Write `record` into a copy of `input` at `output`, returning keys
    /// the output's tag format could not hold
    pub fn try_edit_metadata(
        &self,
        input: impl AsRef<Path>,
        record: &MetadataRecord,
        output: impl AsRef<Path>,
    ) -> Result<Vec<String>> {
        self.editor.write(input.as_ref(), record, output.as_ref())
    }

    /// [`try_edit_metadata`](Self::try_edit_metadata), then check the
    /// decoded audio is unchanged
    pub fn try_edit_metadata_verified(
        &self,
        input: impl AsRef<Path>,
        record: &MetadataRecord,
        output: impl AsRef<Path>,
    ) -> Result<Vec<String>> {
        self.editor.write_verified(input.as_ref(), record, output.as_ref())
    }

    pub fn edit_metadata_information<I, K, V>(
        &self,
        input: impl AsRef<Path>,
        fields: I,
        album_art: Option<AlbumArt>,
        output: impl AsRef<Path>,
    ) -> bool
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: Into<String>,
    {
        let mut record = MetadataRecord::from_fields(fields);
        record.album_art = album_art;

        let (input, output) = (input.as_ref(), output.as_ref());
        match self.try_edit_metadata(input, &record, output) {
            Ok(dropped) => {
                if !dropped.is_empty() {
                    info!(?dropped, output = %output.display(), "Some fields are not representable and were dropped");
                }
                true
            }
            Err(e) => {
                warn!(input = %input.display(), kind = ?e.kind(), error = %e, "edit_metadata_information failed");
                false
            }
        }
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        if let Some(runtime) = self.runtime.take() {
            let running = self
                .registry
                .handles()
                .into_iter()
                .filter_map(|h| self.registry.get(h))
                .filter(|s| s.state() == SessionState::Running)
                .count();
            if running > 0 {
                debug!(running, "Engine dropped with conversions still running");
            }
            runtime.shutdown_background();
        }
    }
}
