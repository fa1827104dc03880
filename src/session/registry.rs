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


//! Handle table for live sessions
//!
//! # Handles
//! A handle packs a slot index and that slot's generation into one
//! non-negative `i64`. Releasing a session bumps the slot's generation, so
//! a stale handle never resolves to a later session that reuses the slot.
//! [`INVALID_HANDLE`] is returned across the foreign boundary when a
//! session could not be created.

use crate::audio::decoder::InputMedia;
use crate::error::{Mp3fyError, Result};
use crate::session::session::Session;
use parking_lot::RwLock;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};

/// Sentinel handed out when `initialize` fails
pub const INVALID_HANDLE: i64 = -1;

/// Generations stay below 2^31 so packed handles are never negative
const MAX_GENERATION: u32 = i32::MAX as u32;

/// Generation-checked reference to a registry slot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionHandle {
    index: u32,
    generation: u32,
}

impl SessionHandle {
    pub(crate) fn new(index: u32, generation: u32) -> Self {
        Self { index, generation }
    }

    pub fn index(&self) -> u32 {
        self.index
    }

    pub fn generation(&self) -> u32 {
        self.generation
    }

    pub fn to_raw(&self) -> i64 {
        ((self.generation as i64) << 32) | self.index as i64
    }

    /// Unpack a raw handle; negative values and generation 0 are rejected
    pub fn from_raw(raw: i64) -> Option<Self> {
        if raw < 0 {
            return None;
        }
        let generation = (raw >> 32) as u32;
        if generation == 0 || generation > MAX_GENERATION {
            return None;
        }
        Some(Self {
            index: raw as u32,
            generation,
        })
    }
}

impl std::fmt::Display for SessionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_raw())
    }
}

#[derive(Debug)]
struct Slot {
    generation: u32,
    session: Option<Arc<Session>>,
}

#[derive(Debug, Default)]
struct Arena {
    slots: Vec<Slot>,
    free: Vec<u32>,
    live: usize,
}

/// Owns every live [`Session`]; callers only ever hold handles
#[derive(Debug, Default)]
pub struct SessionRegistry {
    arena: RwLock<Arena>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Validate the paths, open the input and register a new session
    ///
    /// Nothing is written to `output` here.
    pub fn create(&self, input: &Path, output: &Path) -> Result<SessionHandle> {
        let (input, output) = validate_paths(input, output)?;
        let media = InputMedia::open(&input)?;

        let mut arena = self.arena.write();
        let (index, generation) = match arena.free.pop() {
            Some(index) => {
                let slot = &mut arena.slots[index as usize];
                (index, slot.generation)
            }
            None => {
                let index = u32::try_from(arena.slots.len())
                    .map_err(|_| Mp3fyError::internal("session table full"))?;
                arena.slots.push(Slot {
                    generation: 1,
                    session: None,
                });
                (index, 1)
            }
        };

        let handle = SessionHandle::new(index, generation);
        let session = Session::new(handle, input, output, media);
        arena.slots[index as usize].session = Some(Arc::new(session));
        arena.live += 1;

        info!(handle = %handle, "Session created");
        Ok(handle)
    }

    pub fn get(&self, handle: SessionHandle) -> Option<Arc<Session>> {
        let arena = self.arena.read();
        let slot = arena.slots.get(handle.index as usize)?;
        if slot.generation != handle.generation {
            return None;
        }
        slot.session.clone()
    }

    /// Look up by raw handle
    pub fn get_raw(&self, raw: i64) -> Option<Arc<Session>> {
        SessionHandle::from_raw(raw).and_then(|handle| self.get(handle))
    }

    /// Drop the registry's reference; unknown or stale handles are ignored
    ///
    /// A running conversion keeps its own reference and finishes normally.
    pub fn release(&self, handle: SessionHandle) -> bool {
        let mut arena = self.arena.write();
        let Some(slot) = arena.slots.get_mut(handle.index as usize) else {
            return false;
        };
        if slot.generation != handle.generation || slot.session.is_none() {
            return false;
        }

        slot.session = None;
        let retired = slot.generation >= MAX_GENERATION;
        if !retired {
            slot.generation += 1;
        }
        arena.live -= 1;
        if !retired {
            arena.free.push(handle.index);
        }

        debug!(handle = %handle, retired, "Session released");
        true
    }

    pub fn len(&self) -> usize {
        self.arena.read().live
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Handles of every live session
    pub fn handles(&self) -> Vec<SessionHandle> {
        let arena = self.arena.read();
        arena
            .slots
            .iter()
            .enumerate()
            .filter(|(_, slot)| slot.session.is_some())
            .map(|(index, slot)| SessionHandle::new(index as u32, slot.generation))
            .collect()
    }
}

fn validate_paths(input: &Path, output: &Path) -> Result<(PathBuf, PathBuf)> {
    let input = std::path::absolute(input).map_err(|e| Mp3fyError::from_io(input, e))?;
    let output = std::path::absolute(output).map_err(|e| Mp3fyError::from_io(output, e))?;

    let meta = fs::metadata(&input).map_err(|e| Mp3fyError::from_io(&input, e))?;
    if meta.is_dir() {
        return Err(Mp3fyError::invalid_input(format!(
            "{} is a directory",
            input.display()
        )));
    }

    let parent = output
        .parent()
        .ok_or_else(|| Mp3fyError::InvalidPath(format!("{} has no parent", output.display())))?;
    let parent_meta = fs::metadata(parent).map_err(|_| {
        Mp3fyError::InvalidPath(format!("{}: directory does not exist", parent.display()))
    })?;
    if !parent_meta.is_dir() {
        return Err(Mp3fyError::InvalidPath(format!(
            "{} is not a directory",
            parent.display()
        )));
    }
    ensure_writable(parent)?;

    let same = input == output
        || match (fs::canonicalize(&input), fs::canonicalize(&output)) {
            (Ok(a), Ok(b)) => a == b,
            _ => false,
        };
    if same {
        return Err(Mp3fyError::invalid_input(format!(
            "output {} would overwrite the input",
            output.display()
        )));
    }

    Ok((input, output))
}

/// Create and drop a scratch file in `dir`
///
/// Mode bits alone miss root, ACLs and read-only mounts.
fn ensure_writable(dir: &Path) -> Result<()> {
    tempfile::Builder::new()
        .prefix(".mp3fy-probe")
        .tempfile_in(dir)
        .map(drop)
        .map_err(|e| Mp3fyError::PermissionDenied(format!("{} is not writable: {}", dir.display(), e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::write_sine_wav;

    #[cfg(unix)]
    #[test]
    fn test_output_dir_writability_is_checked_by_creating_a_file() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("in.wav");
        write_sine_wav(&input, 44_100, 2, 0.1);
        let locked = dir.path().join("locked");
        fs::create_dir(&locked).unwrap();
        fs::set_permissions(&locked, fs::Permissions::from_mode(0o555)).unwrap();

        // Root can still write here; the check must agree with the filesystem
        let writable = fs::File::create(locked.join("try")).is_ok();
        let _ = fs::remove_file(locked.join("try"));

        let registry = SessionRegistry::new();
        let result = registry.create(&input, &locked.join("out.mp3"));
        if writable {
            assert!(result.is_ok(), "{:?}", result.err());
        } else {
            assert!(matches!(result, Err(Mp3fyError::PermissionDenied(_))));
        }
        assert!(!locked.join("out.mp3").exists());
        assert_eq!(fs::read_dir(&locked).unwrap().count(), 0);

        fs::set_permissions(&locked, fs::Permissions::from_mode(0o755)).unwrap();
    }

    #[test]
    fn test_handle_packing() {
        let handle = SessionHandle::new(7, 3);
        let raw = handle.to_raw();
        assert!(raw > 0);
        assert_eq!(SessionHandle::from_raw(raw), Some(handle));
        assert_eq!(SessionHandle::from_raw(INVALID_HANDLE), None);
        assert_eq!(SessionHandle::from_raw(5), None);
    }

    #[test]
    fn test_create_get_release() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("in.wav");
        write_sine_wav(&input, 44_100, 2, 0.1);

        let registry = SessionRegistry::new();
        let handle = registry.create(&input, &dir.path().join("out.mp3")).unwrap();
        assert_eq!(registry.len(), 1);
        assert!(registry.get(handle).is_some());
        assert_eq!(registry.handles(), vec![handle]);

        assert!(registry.release(handle));
        assert!(registry.get(handle).is_none());
        assert!(!registry.release(handle));
        assert!(registry.is_empty());
    }

    #[test]
    fn test_stale_handle_does_not_resolve_after_reuse() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("in.wav");
        write_sine_wav(&input, 44_100, 2, 0.1);
        let output = dir.path().join("out.mp3");

        let registry = SessionRegistry::new();
        let first = registry.create(&input, &output).unwrap();
        registry.release(first);
        let second = registry.create(&input, &output).unwrap();

        assert_eq!(first.index(), second.index());
        assert_ne!(first, second);
        assert!(registry.get(first).is_none());
        assert!(registry.get(second).is_some());
    }

    #[test]
    fn test_create_rejects_bad_paths() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("in.wav");
        write_sine_wav(&input, 44_100, 2, 0.1);
        let registry = SessionRegistry::new();

        let missing = registry.create(&dir.path().join("nope.wav"), &dir.path().join("out.mp3"));
        assert!(matches!(missing, Err(Mp3fyError::FileNotFound(_))));

        let no_parent = registry.create(&input, &dir.path().join("missing/out.mp3"));
        assert!(matches!(no_parent, Err(Mp3fyError::InvalidPath(_))));

        let same = registry.create(&input, &input);
        assert!(matches!(same, Err(Mp3fyError::InvalidInput(_))));

        let directory = registry.create(dir.path(), &dir.path().join("out.mp3"));
        assert!(matches!(directory, Err(Mp3fyError::InvalidInput(_))));

        assert!(registry.is_empty());
        assert!(!dir.path().join("out.mp3").exists());
    }

    #[test]
    fn test_create_rejects_non_audio() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("notes.txt");
        fs::write(&input, b"not audio at all").unwrap();

        let registry = SessionRegistry::new();
        let err = registry.create(&input, &dir.path().join("out.mp3")).unwrap_err();
        assert!(matches!(
            err,
            Mp3fyError::InvalidInput(_) | Mp3fyError::UnsupportedStream(_)
        ));
    }

    #[test]
    fn test_concurrent_create_and_release() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("in.wav");
        write_sine_wav(&input, 8_000, 1, 0.05);
        let output = dir.path().join("out.mp3");
        let registry = Arc::new(SessionRegistry::new());

        let workers: Vec<_> = (0..4)
            .map(|_| {
                let registry = Arc::clone(&registry);
                let input = input.clone();
                let output = output.clone();
                std::thread::spawn(move || {
                    let mut seen = Vec::new();
                    for _ in 0..10 {
                        let handle = registry.create(&input, &output).unwrap();
                        seen.push(handle.to_raw());
                        assert!(registry.release(handle));
                    }
                    seen
                })
            })
            .collect();

        let mut all: Vec<i64> = workers.into_iter().flat_map(|w| w.join().unwrap()).collect();
        let total = all.len();
        all.sort_unstable();
        all.dedup();
        assert_eq!(all.len(), total, "a handle was issued twice");
        assert!(registry.is_empty());
    }
}
