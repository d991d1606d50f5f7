//! Where things go on disk.
//!
//! ```text
//! <root>/<device>/channels.json
//! <root>/<device>/channel_01/2024-11-25_08-00-00.mp4
//! <root>/<device>/channel_03_Lobby/2024-11-25_08-00-00.jpg
//! ```

use std::path::{Component, Path, PathBuf};

use crate::identity::placeholder_name;
use crate::time::DeviceClock;
use crate::track::{ChannelId, RecordingDescriptor};
use crate::{FetchError, Result};

const IDENTITY_MAP_FILE: &str = "channels.json";

/// Characters that are invalid in Windows filenames
const INVALID_CHARS: &[char] = &['<', '>', ':', '"', '/', '\\', '|', '?', '*'];

/// Windows reserved filenames (case-insensitive)
const RESERVED_NAMES: &[&str] = &[
    "CON", "PRN", "AUX", "NUL", "COM1", "COM2", "COM3", "COM4", "COM5", "COM6", "COM7", "COM8",
    "COM9", "LPT1", "LPT2", "LPT3", "LPT4", "LPT5", "LPT6", "LPT7", "LPT8", "LPT9",
];

#[derive(Debug, Clone)]
pub struct ArchiveLayout {
    root: PathBuf,
}

impl ArchiveLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory for one recorder, named after its address.
    pub fn device_dir(&self, address: &str) -> PathBuf {
        self.root.join(device_label(address))
    }

    pub fn identity_map_path(&self, address: &str) -> PathBuf {
        self.device_dir(address).join(IDENTITY_MAP_FILE)
    }

    /// `channel_NN` while the channel only has its placeholder name,
    /// `channel_NN_<name>` once it has a real one.
    pub fn channel_dir(&self, address: &str, channel: ChannelId, name: &str) -> PathBuf {
        let base = placeholder_name(channel);
        let dir = if name.is_empty() || name == base {
            base
        } else {
            format!("{base}_{}", sanitize_component(name))
        };
        self.device_dir(address).join(dir)
    }

    /// Final path of a recording inside `channel_dir`, checked against the root.
    pub fn recording_path(
        &self,
        channel_dir: &Path,
        recording: &RecordingDescriptor,
        clock: &DeviceClock,
    ) -> Result<PathBuf> {
        let kind = recording.track.kind().unwrap_or_default();
        let stem = sanitize_component(&clock.filename_stem(recording.start));
        let path = channel_dir.join(format!("{stem}.{}", kind.extension()));
        self.ensure_within_root(&path)?;
        Ok(path)
    }

    /// Refuse any path that is not a plain descendant of the root.
    pub fn ensure_within_root(&self, path: &Path) -> Result<()> {
        let unsafe_path = || FetchError::UnsafePath {
            path: path.to_path_buf(),
        };
        let relative = path.strip_prefix(&self.root).map_err(|_| unsafe_path())?;
        let mut depth = 0;
        for component in relative.components() {
            match component {
                Component::Normal(_) => depth += 1,
                Component::CurDir => {}
                _ => return Err(unsafe_path()),
            }
        }
        if depth == 0 {
            return Err(unsafe_path());
        }
        Ok(())
    }
}

/// Host and port of a device address, without scheme or path, made safe as
/// a directory name.
pub fn device_label(address: &str) -> String {
    let address = address.trim();
    let without_scheme = address
        .split_once("://")
        .map_or(address, |(_, rest)| rest);
    let authority = without_scheme
        .split('/')
        .next()
        .unwrap_or(without_scheme);
    // Drop any user info, credentials never end up on disk.
    let host = authority.rsplit('@').next().unwrap_or(authority);
    sanitize_component(host)
}

/// Make `input` safe as a single path component on every platform.
pub fn sanitize_component(input: &str) -> String {
    let input = input.replace("..", "_");
    let mut result = String::with_capacity(input.len());
    let mut last_was_replacement = false;

    for c in input.chars() {
        if c.is_control() || INVALID_CHARS.contains(&c) {
            if !last_was_replacement {
                result.push('_');
                last_was_replacement = true;
            }
        } else {
            result.push(c);
            last_was_replacement = false;
        }
    }

    let trimmed = result.trim_matches(|c| c == ' ' || c == '.');
    if trimmed.is_empty() {
        return "unnamed".to_string();
    }

    let upper = trimmed.to_uppercase();
    for reserved in RESERVED_NAMES {
        if upper == *reserved || upper.starts_with(&format!("{reserved}.")) {
            return format!("_{trimmed}");
        }
    }

    trimmed.to_string()
}
