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


//! Logging setup
//!
//! The library only emits `tracing` events; installing a subscriber is left
//! to the host. The filter is taken from `MP3FY_LOG`, then `RUST_LOG`, then
//! the directive passed in. Desktop hosts log to stderr. On Android stderr
//! is discarded, so [`init_logcat_logging`] writes each line to logcat
//! through liblog instead.

use std::io::{self, Write};
use tracing::{Level, Metadata};
use tracing_subscriber::filter::EnvFilter;
use tracing_subscriber::fmt::{fmt, MakeWriter};
use tracing_subscriber::util::SubscriberInitExt;

/// Environment variable read before `RUST_LOG`
pub const LOG_ENV: &str = "MP3FY_LOG";

/// Log format for [`init_with_format`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    /// Human-readable lines
    #[default]
    Pretty,
    /// One JSON object per event
    Json,
}

fn env_filter(default_directive: &str) -> EnvFilter {
    let from_env = std::env::var(LOG_ENV)
        .ok()
        .or_else(|| std::env::var(EnvFilter::DEFAULT_ENV).ok())
        .and_then(|spec| EnvFilter::try_new(spec).ok());
    from_env.unwrap_or_else(|| EnvFilter::new(default_directive))
}

/// Install the global subscriber
///
/// Returns false when a subscriber was already installed.
pub fn init_with_format(format: LogFormat, default_directive: &str) -> bool {
    let filter = env_filter(default_directive);
    let installed = match format {
        LogFormat::Pretty => fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .with_target(true)
            .finish()
            .try_init(),
        LogFormat::Json => fmt()
            .json()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .with_current_span(false)
            .finish()
            .try_init(),
    };
    installed.is_ok()
}

/// Human-readable logging to stderr
pub fn init_logging(default_directive: &str) -> bool {
    init_with_format(LogFormat::Pretty, default_directive)
}

/// JSON logging to stderr
pub fn init_json_logging(default_directive: &str) -> bool {
    init_with_format(LogFormat::Json, default_directive)
}

/// Logcat tag for every line
pub const LOGCAT_TAG: &str = "MP3Fy";

/// Buffers one formatted event and hands each complete line to `sink`
///
/// tracing-subscriber makes one writer per event, so whatever is left
/// unterminated is emitted on drop.
pub struct LineWriter {
    level: Level,
    buf: Vec<u8>,
    sink: fn(Level, &str),
}

impl LineWriter {
    pub fn new(level: Level, sink: fn(Level, &str)) -> Self {
        Self {
            level,
            buf: Vec::new(),
            sink,
        }
    }

    fn emit(&mut self, line: &[u8]) {
        let text = String::from_utf8_lossy(line);
        let text = text.trim_end_matches('\r');
        if !text.is_empty() {
            (self.sink)(self.level, text);
        }
    }
}

impl Write for LineWriter {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        self.buf.extend_from_slice(data);
        while let Some(end) = self.buf.iter().position(|&b| b == b'\n') {
            let line: Vec<u8> = self.buf.drain(..=end).collect();
            self.emit(&line[..end]);
        }
        Ok(data.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        if !self.buf.is_empty() {
            let rest = std::mem::take(&mut self.buf);
            self.emit(&rest);
        }
        Ok(())
    }
}

impl Drop for LineWriter {
    fn drop(&mut self) {
        let _ = self.flush();
    }
}

/// [`MakeWriter`] producing [`LineWriter`]s that keep the event's level
#[derive(Clone, Copy)]
pub struct LineSinkWriter {
    sink: fn(Level, &str),
}

impl LineSinkWriter {
    pub fn new(sink: fn(Level, &str)) -> Self {
        Self { sink }
    }
}

impl<'a> MakeWriter<'a> for LineSinkWriter {
    type Writer = LineWriter;

    fn make_writer(&'a self) -> Self::Writer {
        LineWriter::new(Level::INFO, self.sink)
    }

    fn make_writer_for(&'a self, meta: &Metadata<'_>) -> Self::Writer {
        LineWriter::new(*meta.level(), self.sink)
    }
}

#[cfg(target_os = "android")]
mod logcat {
    use super::LOGCAT_TAG;
    use std::ffi::CString;
    use std::os::raw::{c_char, c_int};
    use tracing::Level;

    const ANDROID_LOG_VERBOSE: c_int = 2;
    const ANDROID_LOG_DEBUG: c_int = 3;
    const ANDROID_LOG_INFO: c_int = 4;
    const ANDROID_LOG_WARN: c_int = 5;
    const ANDROID_LOG_ERROR: c_int = 6;

    #[link(name = "log")]
    extern "C" {
        fn __android_log_write(prio: c_int, tag: *const c_char, text: *const c_char) -> c_int;
    }

    pub(super) fn write_line(level: Level, line: &str) {
        let priority = match level {
            Level::ERROR => ANDROID_LOG_ERROR,
            Level::WARN => ANDROID_LOG_WARN,
            Level::INFO => ANDROID_LOG_INFO,
            Level::DEBUG => ANDROID_LOG_DEBUG,
            _ => ANDROID_LOG_VERBOSE,
        };
        let (Ok(tag), Ok(text)) = (CString::new(LOGCAT_TAG), CString::new(line.replace('\0', ""))) else {
            return;
        };
        // SAFETY: both pointers are valid NUL-terminated strings for the call.
        unsafe {
            __android_log_write(priority, tag.as_ptr(), text.as_ptr());
        }
    }
}

/// Install a subscriber that writes every event line to `sink`
///
/// Level and timestamp are left to the sink, which receives the level.
pub fn init_with_sink(sink: fn(Level, &str), default_directive: &str) -> bool {
    fmt()
        .with_env_filter(env_filter(default_directive))
        .with_writer(LineSinkWriter::new(sink))
        .with_ansi(false)
        .without_time()
        .with_level(false)
        .with_target(true)
        .finish()
        .try_init()
        .is_ok()
}

/// Logging to logcat under the [`LOGCAT_TAG`] tag
#[cfg(target_os = "android")]
pub fn init_logcat_logging(default_directive: &str) -> bool {
    init_with_sink(logcat::write_line, default_directive)
}
