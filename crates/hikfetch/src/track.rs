use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A recorder channel number, starting at 1.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChannelId(u32);

impl ChannelId {
    /// Highest channel number accepted.
    pub const MAX: u32 = 9999;

    /// Returns `None` for channel 0, which recorders never use, and for
    /// anything above [`Self::MAX`].
    pub fn new(id: u32) -> Option<Self> {
        (1..=Self::MAX).contains(&id).then_some(Self(id))
    }

    pub fn get(self) -> u32 {
        self.0
    }
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:02}", self.0)
    }
}

/// What kind of media a track carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContentKind {
    #[default]
    Video,
    Photo,
}

impl ContentKind {
    /// Low two digits of the track ID for this kind.
    const fn track_suffix(self) -> u32 {
        match self {
            ContentKind::Video => 1,
            ContentKind::Photo => 3,
        }
    }

    pub const fn extension(self) -> &'static str {
        match self {
            ContentKind::Video => "mp4",
            ContentKind::Photo => "jpg",
        }
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            ContentKind::Video => "video",
            ContentKind::Photo => "photo",
        }
    }
}

impl fmt::Display for ContentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// ISAPI track identifier: `channel * 100 + 1` for video, `channel * 100 + 3` for photos.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TrackId(u32);

impl TrackId {
    pub fn new(channel: ChannelId, kind: ContentKind) -> Self {
        Self(channel.get() * 100 + kind.track_suffix())
    }

    /// Accepts only identifiers that decode to a channel and a known kind.
    pub fn from_raw(raw: u32) -> Option<Self> {
        let track = Self(raw);
        track.channel()?;
        track.kind()?;
        Some(track)
    }

    pub fn get(self) -> u32 {
        self.0
    }

    pub fn channel(self) -> Option<ChannelId> {
        ChannelId::new(self.0 / 100)
    }

    pub fn kind(self) -> Option<ContentKind> {
        match self.0 % 100 {
            1 => Some(ContentKind::Video),
            3 => Some(ContentKind::Photo),
            _ => None,
        }
    }
}

impl fmt::Display for TrackId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One downloadable recording as listed by a search.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordingDescriptor {
    pub track: TrackId,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    /// Opaque playback locator returned by the device.
    pub locator: String,
}

impl RecordingDescriptor {
    /// Identity used to drop repeats across pages.
    pub fn dedup_key(&self) -> (TrackId, DateTime<Utc>) {
        (self.track, self.start)
    }
}
