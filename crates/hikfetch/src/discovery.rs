use std::collections::BTreeMap;
use std::sync::Arc;

use futures::StreamExt;
use futures::stream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::isapi::{DeviceApi, SearchQuery};
use crate::retry::{RetryPolicy, retry_with_backoff};
use crate::time::{DeviceClock, TimeWindow};
use crate::track::{ChannelId, ContentKind, TrackId};
use crate::{FetchError, Result};

/// Finds the channels that hold recordings in a window.
pub struct ChannelScanner {
    device: Arc<dyn DeviceApi>,
    concurrency: usize,
    probe_page_size: u32,
    retry: RetryPolicy,
}

impl ChannelScanner {
    pub fn new(device: Arc<dyn DeviceApi>, concurrency: usize) -> Self {
        Self {
            device,
            concurrency: concurrency.max(1),
            probe_page_size: 1,
            retry: RetryPolicy::default(),
        }
    }

    pub fn with_probe_page_size(mut self, size: u32) -> Self {
        self.probe_page_size = size.max(1);
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Probe channels `1..=max_channel` and return those with at least one
    /// recording, sorted by ID.
    ///
    /// A failed probe counts as "no recordings". Only fatal errors and
    /// cancellation abort the scan.
    pub async fn scan(
        &self,
        max_channel: u32,
        kind: ContentKind,
        window: TimeWindow,
        clock: DeviceClock,
        token: &CancellationToken,
    ) -> Result<Vec<ChannelId>> {
        let probes = (1..=max_channel).filter_map(ChannelId::new).map(|channel| {
            let query = SearchQuery {
                track: TrackId::new(channel, kind),
                window,
                clock,
                position: 0,
                max_results: self.probe_page_size,
            };
            async move { (channel, self.probe(&query, token).await) }
        });

        let mut results = stream::iter(probes).buffer_unordered(self.concurrency);
        let mut found = Vec::new();

        while let Some((channel, result)) = results.next().await {
            match result {
                Ok(true) => {
                    debug!(channel = channel.get(), "Channel has recordings");
                    found.push(channel);
                }
                Ok(false) => {}
                Err(err @ FetchError::Cancelled) => return Err(err),
                Err(err) if err.is_fatal() => return Err(err),
                Err(err) => warn!(
                    channel = channel.get(),
                    error = %err,
                    "Discovery probe failed, treating channel as empty"
                ),
            }
        }

        found.sort_unstable();
        info!(
            scanned = max_channel,
            found = found.len(),
            %kind,
            "Channel discovery finished"
        );
        Ok(found)
    }

    async fn probe(&self, query: &SearchQuery, token: &CancellationToken) -> Result<bool> {
        let device = &self.device;
        let page = retry_with_backoff(&self.retry, token, move |_| device.search(query)).await?;
        Ok(page.recordings.iter().any(|r| r.track == query.track))
    }

    /// Channel names reported by the recorder. Anything short of an auth
    /// failure just means no names.
    pub async fn fetch_names(&self) -> Result<BTreeMap<ChannelId, String>> {
        match self.device.channel_names().await {
            Ok(names) => {
                debug!(count = names.len(), "Fetched channel names");
                Ok(names)
            }
            Err(err) if err.is_fatal() => Err(err),
            Err(err) => {
                debug!(error = %err, "Device did not provide channel names");
                Ok(BTreeMap::new())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{FakeDevice, ch, day_start, hours};
    use std::sync::atomic::Ordering;

    fn window() -> TimeWindow {
        TimeWindow::new(day_start(), hours(24)).unwrap()
    }

    fn scanner(device: Arc<FakeDevice>) -> ChannelScanner {
        ChannelScanner::new(device, 3).with_retry(RetryPolicy::none())
    }

    #[tokio::test]
    async fn reports_only_channels_within_range() {
        let device = Arc::new(
            FakeDevice::new()
                .with_recordings(5, ContentKind::Video, 1)
                .with_recordings(2, ContentKind::Video, 4)
                .with_recordings(40, ContentKind::Video, 1),
        );

        let found = scanner(device.clone())
            .scan(32, ContentKind::Video, window(), DeviceClock::utc(), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(found, vec![ch(2), ch(5)]);
        assert_eq!(device.search_calls.load(Ordering::SeqCst), 32);
    }

    #[tokio::test]
    async fn probes_the_requested_kind() {
        let device = Arc::new(
            FakeDevice::new()
                .with_recordings(1, ContentKind::Video, 1)
                .with_recordings(3, ContentKind::Photo, 1),
        );

        let found = scanner(device)
            .scan(4, ContentKind::Photo, window(), DeviceClock::utc(), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(found, vec![ch(3)]);
    }

    #[tokio::test]
    async fn failed_probe_counts_as_empty() {
        let device = Arc::new(
            FakeDevice::new()
                .with_recordings(1, ContentKind::Video, 1)
                .with_recordings(2, ContentKind::Video, 1)
                .failing_search(2, ContentKind::Video),
        );

        let found = scanner(device)
            .scan(3, ContentKind::Video, window(), DeviceClock::utc(), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(found, vec![ch(1)]);
    }

    #[tokio::test]
    async fn unauthorized_aborts_the_scan() {
        let device = Arc::new(FakeDevice::new().unauthorized());
        let err = scanner(device)
            .scan(8, ContentKind::Video, window(), DeviceClock::utc(), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, FetchError::Unauthorized));
    }

    #[tokio::test]
    async fn cancelled_scan_returns_cancelled() {
        let device = Arc::new(FakeDevice::new().with_recordings(1, ContentKind::Video, 1));
        let token = CancellationToken::new();
        token.cancel();
        let err = scanner(device)
            .scan(4, ContentKind::Video, window(), DeviceClock::utc(), &token)
            .await
            .unwrap_err();
        assert!(matches!(err, FetchError::Cancelled));
    }

    #[tokio::test]
    async fn missing_channel_list_yields_no_names() {
        let named = Arc::new(FakeDevice::new().with_name(1, "Front door"));
        let names = scanner(named).fetch_names().await.unwrap();
        assert_eq!(names.get(&ch(1)).map(String::as_str), Some("Front door"));

        let camera = Arc::new(FakeDevice::new().without_channel_list());
        assert!(scanner(camera).fetch_names().await.unwrap().is_empty());
    }
}
