//! Paginated recording search.
//!
//! [`RecordingSearch`] turns the device's page-at-a-time search endpoint into
//! a lazy sequence of [`RecordingDescriptor`]s for one track and window. A page
//! is only requested once the previous one has been handed out.

use std::collections::VecDeque;
use std::sync::Arc;

use futures::StreamExt;
use futures::stream::{self, BoxStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::isapi::{DeviceApi, SearchPage, SearchQuery};
use crate::retry::{RetryPolicy, retry_with_backoff};
use crate::time::{DeviceClock, TimeWindow};
use crate::track::{RecordingDescriptor, TrackId};
use crate::Result;

/// Resumable position in a search.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SearchCursor {
    /// Index of the next result not yet handed out.
    pub position: u32,
    /// The device has nothing beyond `position`.
    pub exhausted: bool,
}

pub struct RecordingSearch {
    device: Arc<dyn DeviceApi>,
    track: TrackId,
    window: TimeWindow,
    clock: DeviceClock,
    page_size: u32,
    /// Offset of the next page to request.
    next_position: u32,
    exhausted: bool,
    /// Handed-out order, each with its result index.
    buffered: VecDeque<(u32, RecordingDescriptor)>,
    retry: Option<(RetryPolicy, CancellationToken)>,
    requests: u32,
}

impl RecordingSearch {
    pub fn new(
        device: Arc<dyn DeviceApi>,
        track: TrackId,
        window: TimeWindow,
        clock: DeviceClock,
        page_size: u32,
    ) -> Self {
        Self::resume(device, track, window, clock, page_size, SearchCursor::default())
    }

    /// Continue a search from a cursor taken from an earlier instance.
    pub fn resume(
        device: Arc<dyn DeviceApi>,
        track: TrackId,
        window: TimeWindow,
        clock: DeviceClock,
        page_size: u32,
        cursor: SearchCursor,
    ) -> Self {
        Self {
            device,
            track,
            window,
            clock,
            page_size: page_size.max(1),
            next_position: cursor.position,
            exhausted: cursor.exhausted,
            buffered: VecDeque::new(),
            retry: None,
            requests: 0,
        }
    }

    /// Retry transient page failures under `policy`.
    pub fn with_retry(mut self, policy: RetryPolicy, token: CancellationToken) -> Self {
        self.retry = Some((policy, token));
        self
    }

    pub fn track(&self) -> TrackId {
        self.track
    }

    pub fn cursor(&self) -> SearchCursor {
        SearchCursor {
            position: self
                .buffered
                .front()
                .map_or(self.next_position, |(index, _)| *index),
            exhausted: self.exhausted && self.buffered.is_empty(),
        }
    }

    /// Number of page requests issued so far.
    pub fn requests(&self) -> u32 {
        self.requests
    }

    /// Next recording, or `None` once the device has no more.
    pub async fn next(&mut self) -> Result<Option<RecordingDescriptor>> {
        loop {
            if let Some((_, recording)) = self.buffered.pop_front() {
                return Ok(Some(recording));
            }
            if self.exhausted {
                return Ok(None);
            }
            self.fetch_page().await?;
        }
    }

    pub fn into_stream(self) -> BoxStream<'static, Result<RecordingDescriptor>> {
        stream::try_unfold(self, |mut search| async move {
            Ok(search.next().await?.map(|recording| (recording, search)))
        })
        .boxed()
    }

    async fn fetch_page(&mut self) -> Result<()> {
        let query = SearchQuery {
            track: self.track,
            window: self.window,
            clock: self.clock,
            position: self.next_position,
            max_results: self.page_size,
        };
        self.requests += 1;

        let page = match &self.retry {
            Some((policy, token)) => {
                let device = &self.device;
                let query = &query;
                retry_with_backoff(policy, token, move |_| device.search(query)).await?
            }
            None => self.device.search(&query).await?,
        };

        self.accept(page);
        Ok(())
    }

    fn accept(&mut self, page: SearchPage) {
        let first = self.next_position;
        let count = u32::try_from(page.recordings.len()).unwrap_or(u32::MAX);
        debug!(
            track = %self.track,
            position = self.next_position,
            count,
            more = page.more,
            "Search page received"
        );

        self.next_position = self.next_position.saturating_add(count);
        // An empty page ends the search even when the device claims more.
        if count == 0 || !page.more {
            self.exhausted = true;
        }

        for (index, recording) in (first..).zip(page.recordings) {
            if recording.track != self.track {
                warn!(
                    expected = %self.track,
                    got = %recording.track,
                    "Ignoring recording listed under another track"
                );
                continue;
            }
            self.buffered.push_back((index, recording));
        }
    }
}
