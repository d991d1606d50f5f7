//! Persistent channel number to display name mapping.
//!
//! One `channels.json` lives in each device directory. Users may edit it; the
//! engine only ever fills in channels that have no entry yet.

use std::collections::BTreeMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::track::ChannelId;
use crate::{FetchError, Result};

/// Name given to channels nobody has named yet.
pub fn placeholder_name(channel: ChannelId) -> String {
    format!("channel_{channel}")
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChannelIdentityMap {
    names: BTreeMap<u32, String>,
    dirty: bool,
}

impl ChannelIdentityMap {
    /// Load the map at `path`. A missing file gives an empty map; an
    /// unreadable or malformed one is an error, never silently replaced.
    pub async fn load(path: &Path) -> Result<Self> {
        let json = match tokio::fs::read_to_string(path).await {
            Ok(json) => json,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                debug!(path = %path.display(), "No channel identity map yet");
                return Ok(Self::default());
            }
            Err(e) => return Err(FetchError::identity_map(path, e.to_string())),
        };

        let names: BTreeMap<u32, String> = serde_json::from_str(&json)
            .map_err(|e| FetchError::identity_map(path, format!("not a valid map: {e}")))?;
        if names.contains_key(&0) {
            return Err(FetchError::identity_map(path, "channel 0 does not exist"));
        }

        debug!(path = %path.display(), entries = names.len(), "Loaded channel identity map");
        Ok(Self {
            names,
            dirty: false,
        })
    }

    /// Return the display name of `channel`, recording `device_name` (or the
    /// placeholder) first if the channel has no entry.
    pub fn resolve(&mut self, channel: ChannelId, device_name: Option<&str>) -> String {
        let name = self.names.entry(channel.get()).or_insert_with(|| {
            self.dirty = true;
            match device_name.map(str::trim).filter(|n| !n.is_empty()) {
                Some(name) => name.to_string(),
                None => placeholder_name(channel),
            }
        });
        name.clone()
    }

    pub fn name(&self, channel: ChannelId) -> Option<&str> {
        self.names.get(&channel.get()).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    /// Whether this run added entries.
    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// Write the map as pretty JSON through a temp file and rename.
    pub async fn persist(&mut self, path: &Path) -> Result<()> {
        let json = serde_json::to_string_pretty(&self.names)
            .map_err(|e| FetchError::identity_map(path, e.to_string()))?;

        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let temp_path = temp_path_for(path);
        tokio::fs::write(&temp_path, json.as_bytes()).await?;
        tokio::fs::rename(&temp_path, path).await?;

        self.dirty = false;
        debug!(path = %path.display(), entries = self.names.len(), "Persisted channel identity map");
        Ok(())
    }
}

fn temp_path_for(path: &Path) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(".tmp");
    path.with_file_name(name)
}
