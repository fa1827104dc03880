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


//! Conversion sessions and the registry that owns them
//!
//! # Module Organization
//! - `progress` - `SessionState`, monotonic `ConversionProgress`, `SessionStatus`
//! - `session` - one input/output pair and its lifecycle
//! - `registry` - generation-checked handle table

pub mod progress;
pub mod registry;
#[allow(clippy::module_inception)]
pub mod session;

pub use progress::{percentage_of, ConversionProgress, SessionState, SessionStatus};
pub use registry::{SessionHandle, SessionRegistry, INVALID_HANDLE};
pub use session::Session;
