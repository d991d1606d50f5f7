//! In-memory [`DeviceApi`] used by the engine tests.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, NaiveDate, TimeDelta, Utc};
use futures::StreamExt;
use futures::stream;
use parking_lot::Mutex;
use reqwest::StatusCode;

use crate::isapi::{ByteStream, DeviceApi, SearchPage, SearchQuery};
use crate::time::DeviceClock;
use crate::track::{ChannelId, ContentKind, RecordingDescriptor, TrackId};
use crate::{FetchError, Result};

pub fn ch(id: u32) -> ChannelId {
    ChannelId::new(id).unwrap()
}

/// 2024-11-25 08:00:00 UTC, the start of every scripted recording day.
pub fn day_start() -> DateTime<Utc> {
    NaiveDate::from_ymd_opt(2024, 11, 25)
        .unwrap()
        .and_hms_opt(8, 0, 0)
        .unwrap()
        .and_utc()
}

pub fn hours(h: i64) -> DateTime<Utc> {
    day_start() + TimeDelta::hours(h)
}

#[derive(Default)]
pub struct FakeDevice {
    clock: DeviceClock,
    recordings: HashMap<TrackId, Vec<RecordingDescriptor>>,
    bodies: HashMap<String, Bytes>,
    names: BTreeMap<ChannelId, String>,
    unauthorized: bool,
    unauthorized_downloads: bool,
    names_unsupported: bool,
    failing_searches: HashSet<TrackId>,
    always_more: bool,
    stream_failures: Mutex<HashMap<String, u32>>,
    status_failures: Mutex<HashMap<String, (StatusCode, u32)>>,
    stalled: HashSet<String>,
    download_delay: Duration,

    pub time_calls: AtomicU32,
    pub search_calls: AtomicU32,
    pub download_calls: AtomicU32,
    active_downloads: AtomicUsize,
    pub max_active_downloads: AtomicUsize,
}

impl FakeDevice {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_clock(mut self, clock: DeviceClock) -> Self {
        self.clock = clock;
        self
    }

    /// Script `count` recordings of ten minutes each, one per hour from
    /// [`day_start`].
    pub fn with_recordings(mut self, channel: u32, kind: ContentKind, count: usize) -> Self {
        let track = TrackId::new(ch(channel), kind);
        let recordings = self.recordings.entry(track).or_default();
        for i in 0..count {
            let start = hours(i as i64);
            let locator = match kind {
                ContentKind::Video => format!("rtsp://fake/Streaming/tracks/{track}?starttime={i}"),
                ContentKind::Photo => format!("http://fake/picture?track={track}&name={i}"),
            };
            self.bodies.insert(
                locator.clone(),
                Bytes::from(format!("{kind} {track} #{i}").repeat(8)),
            );
            recordings.push(RecordingDescriptor {
                track,
                start,
                end: start + TimeDelta::minutes(10),
                locator,
            });
        }
        self
    }

    /// Append a descriptor as-is, e.g. a duplicate or a foreign track.
    pub fn with_descriptor(mut self, listed_under: TrackId, descriptor: RecordingDescriptor) -> Self {
        self.bodies
            .entry(descriptor.locator.clone())
            .or_insert_with(|| Bytes::from_static(b"extra"));
        self.recordings
            .entry(listed_under)
            .or_default()
            .push(descriptor);
        self
    }

    /// Replace the body served for `locator`.
    pub fn with_body(mut self, locator: &str, body: Bytes) -> Self {
        self.bodies.insert(locator.to_string(), body);
        self
    }

    pub fn with_name(mut self, channel: u32, name: &str) -> Self {
        self.names.insert(ch(channel), name.to_string());
        self
    }

    pub fn without_channel_list(mut self) -> Self {
        self.names_unsupported = true;
        self
    }

    pub fn unauthorized(mut self) -> Self {
        self.unauthorized = true;
        self
    }

    pub fn unauthorized_downloads(mut self) -> Self {
        self.unauthorized_downloads = true;
        self
    }

    pub fn failing_search(mut self, channel: u32, kind: ContentKind) -> Self {
        self.failing_searches.insert(TrackId::new(ch(channel), kind));
        self
    }

    /// Report `MORE` on every page, including empty ones.
    pub fn always_more(mut self) -> Self {
        self.always_more = true;
        self
    }

    /// Break the body of `locator` after its first chunk, `times` times.
    pub fn failing_stream(self, locator: &str, times: u32) -> Self {
        self.stream_failures.lock().insert(locator.to_string(), times);
        self
    }

    pub fn failing_status(self, locator: &str, status: StatusCode, times: u32) -> Self {
        self.status_failures
            .lock()
            .insert(locator.to_string(), (status, times));
        self
    }

    /// Deliver one chunk of `locator`, then never another.
    pub fn stalled(mut self, locator: &str) -> Self {
        self.stalled.insert(locator.to_string());
        self
    }

    pub fn with_download_delay(mut self, delay: Duration) -> Self {
        self.download_delay = delay;
        self
    }

    pub fn recordings(&self, channel: u32, kind: ContentKind) -> Vec<RecordingDescriptor> {
        self.recordings
            .get(&TrackId::new(ch(channel), kind))
            .cloned()
            .unwrap_or_default()
    }

    pub fn body(&self, locator: &str) -> Bytes {
        self.bodies.get(locator).cloned().unwrap_or_default()
    }

    fn take_failure<T: Clone>(
        map: &Mutex<HashMap<String, T>>,
        locator: &str,
        decrement: impl Fn(&mut T) -> bool,
    ) -> Option<T> {
        let mut map = map.lock();
        let entry = map.get_mut(locator)?;
        let current = entry.clone();
        decrement(entry).then_some(current)
    }
}

#[async_trait]
impl DeviceApi for FakeDevice {
    async fn device_time(&self) -> Result<DeviceClock> {
        self.time_calls.fetch_add(1, Ordering::SeqCst);
        if self.unauthorized {
            return Err(FetchError::Unauthorized);
        }
        Ok(self.clock)
    }

    async fn channel_names(&self) -> Result<BTreeMap<ChannelId, String>> {
        if self.unauthorized {
            return Err(FetchError::Unauthorized);
        }
        if self.names_unsupported {
            return Err(FetchError::http_status(
                StatusCode::NOT_FOUND,
                "http://fake/ISAPI/ContentMgmt/InputProxy/channels",
                "channel list",
            ));
        }
        Ok(self.names.clone())
    }

    async fn search(&self, query: &SearchQuery) -> Result<SearchPage> {
        self.search_calls.fetch_add(1, Ordering::SeqCst);
        if self.unauthorized {
            return Err(FetchError::Unauthorized);
        }
        if self.failing_searches.contains(&query.track) {
            return Err(FetchError::protocol("search rejected by device (status `FAILED`)"));
        }

        let matching: Vec<_> = self
            .recordings
            .get(&query.track)
            .map(|all| {
                all.iter()
                    .filter(|r| query.window.contains(r.start))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();

        let from = (query.position as usize).min(matching.len());
        let to = (from + query.max_results as usize).min(matching.len());
        let recordings = matching[from..to].to_vec();
        let more = self.always_more || to < matching.len();

        Ok(SearchPage { recordings, more })
    }

    async fn download(&self, locator: &str) -> Result<ByteStream> {
        self.download_calls.fetch_add(1, Ordering::SeqCst);
        if self.unauthorized || self.unauthorized_downloads {
            return Err(FetchError::Unauthorized);
        }

        let active = self.active_downloads.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_active_downloads.fetch_max(active, Ordering::SeqCst);
        if !self.download_delay.is_zero() {
            tokio::time::sleep(self.download_delay).await;
        }
        self.active_downloads.fetch_sub(1, Ordering::SeqCst);

        if let Some((status, _)) = Self::take_failure(&self.status_failures, locator, |(_, n)| {
            if *n == 0 {
                return false;
            }
            *n -= 1;
            true
        }) {
            return Err(FetchError::http_status(status, locator, "download"));
        }

        let body = self
            .bodies
            .get(locator)
            .cloned()
            .ok_or_else(|| FetchError::http_status(StatusCode::NOT_FOUND, locator, "download"))?;
        let (head, tail) = body.split_at(body.len() / 2);
        let (head, tail) = (Bytes::copy_from_slice(head), Bytes::copy_from_slice(tail));

        if self.stalled.contains(locator) {
            return Ok(stream::iter([Ok(head)]).chain(stream::pending()).boxed());
        }

        let broken = Self::take_failure(&self.stream_failures, locator, |n| {
            if *n == 0 {
                return false;
            }
            *n -= 1;
            true
        })
        .is_some();
        if broken {
            let reset = std::io::Error::new(std::io::ErrorKind::ConnectionReset, "connection reset by peer");
            return Ok(stream::iter([Ok(head), Err(FetchError::from(reset))]).boxed());
        }

        Ok(stream::iter([Ok(head), Ok(tail)]).boxed())
    }
}
