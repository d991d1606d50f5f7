//! Run-level coordination.
//!
//! A run probes the device clock, settles the channel list (scan or explicit),
//! merges channel names into the identity map and writes it back once. Then it
//! fans out one worker per channel. Workers are gated by a semaphore so at most
//! `concurrency` channels talk to the device at once; inside a channel
//! everything is sequential.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::NaiveDateTime;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, error, info, info_span, warn};

use crate::config::EngineConfig;
use crate::discovery::ChannelScanner;
use crate::download::{DownloadEngine, DownloadOutcome};
use crate::identity::ChannelIdentityMap;
use crate::isapi::DeviceApi;
use crate::layout::ArchiveLayout;
use crate::report::{ChannelReport, ChannelStatus, RunReport};
use crate::retry::RetryPolicy;
use crate::search::RecordingSearch;
use crate::time::{DeviceClock, TimeBasis, TimeWindow};
use crate::track::{ChannelId, ContentKind, TrackId};
use crate::{FetchError, Result};

/// Which channels a run covers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelSelection {
    /// Probe `1..=max_channel` for recordings.
    Discover { max_channel: u32 },
    Explicit(Vec<ChannelId>),
}

/// Everything a run needs from the caller.
#[derive(Debug, Clone)]
pub struct FetchRequest {
    /// Device address, also used to name the device directory.
    pub device: String,
    pub start: NaiveDateTime,
    pub end: NaiveDateTime,
    pub time_basis: TimeBasis,
    pub kind: ContentKind,
    pub channels: ChannelSelection,
    /// Maximum number of channels downloading at once.
    pub concurrency: usize,
}

impl FetchRequest {
    pub fn validate(&self) -> Result<()> {
        if self.device.trim().is_empty() {
            return Err(FetchError::invalid_request("device address is empty"));
        }
        if self.concurrency == 0 {
            return Err(FetchError::invalid_request("concurrency must be at least 1"));
        }
        match &self.channels {
            ChannelSelection::Discover { max_channel: 0 } => Err(FetchError::invalid_request(
                "maximum channel must be at least 1",
            )),
            ChannelSelection::Discover { max_channel } if *max_channel > ChannelId::MAX => {
                Err(FetchError::invalid_request(format!(
                    "maximum channel must not exceed {}",
                    ChannelId::MAX
                )))
            }
            ChannelSelection::Explicit(list) if list.is_empty() => {
                Err(FetchError::invalid_request("channel list is empty"))
            }
            _ => Ok(()),
        }
    }
}

pub struct Orchestrator {
    device: Arc<dyn DeviceApi>,
    config: EngineConfig,
    layout: ArchiveLayout,
}

impl Orchestrator {
    pub fn new(device: Arc<dyn DeviceApi>, config: EngineConfig, layout: ArchiveLayout) -> Self {
        Self {
            device,
            config,
            layout,
        }
    }

    /// Execute one run.
    ///
    /// Returns `Err` only for run-level failures: bad request, unreachable
    /// device, rejected credentials, unreadable identity map. Everything
    /// scoped to a channel or a recording ends up in the report.
    pub async fn run(&self, request: &FetchRequest, token: CancellationToken) -> Result<RunReport> {
        request.validate()?;
        let token = token.child_token();

        let device_clock = self.device.device_time().await?;
        let clock = match request.time_basis {
            TimeBasis::DeviceLocal => device_clock,
            TimeBasis::Utc => DeviceClock::utc(),
        };
        info!(
            device = %request.device,
            offset_seconds = clock.offset_seconds(),
            "Device reachable"
        );

        let window = TimeWindow::from_local(request.start, request.end, &clock)?;

        let map_path = self.layout.identity_map_path(&request.device);
        let mut identities = ChannelIdentityMap::load(&map_path).await?;

        let scanner = ChannelScanner::new(self.device.clone(), request.concurrency)
            .with_probe_page_size(self.config.probe_page_size)
            .with_retry(self.config.retry.clone());
        let device_names = scanner.fetch_names().await?;

        let channels = match &request.channels {
            ChannelSelection::Discover { max_channel } => {
                scanner
                    .scan(*max_channel, request.kind, window, clock, &token)
                    .await?
            }
            ChannelSelection::Explicit(list) => {
                let mut list = list.clone();
                list.sort_unstable();
                list.dedup();
                list
            }
        };

        let plan: Vec<(ChannelId, String)> = channels
            .into_iter()
            .map(|channel| {
                let device_name = device_names.get(&channel).map(String::as_str);
                (channel, identities.resolve(channel, device_name))
            })
            .collect();

        if identities.is_dirty() {
            identities.persist(&map_path).await?;
        }

        let mut report = RunReport::new(request.device.clone());
        if plan.is_empty() {
            info!(kind = %request.kind, "No channels with recordings in the window");
            return Ok(report);
        }
        info!(
            channels = plan.len(),
            concurrency = request.concurrency,
            "Starting channel downloads"
        );

        let worker = Arc::new(ChannelWorker {
            device: self.device.clone(),
            downloads: DownloadEngine::new(self.device.clone(), &self.config),
            layout: self.layout.clone(),
            device_label: request.device.clone(),
            clock,
            window,
            kind: request.kind,
            page_size: self.config.page_size,
            retry: self.config.retry.clone(),
            delay_between_files: self.config.delay_between_files,
        });

        let semaphore = Arc::new(Semaphore::new(request.concurrency));
        let mut tasks = JoinSet::new();
        let mut task_channels = HashMap::new();

        for (channel, name) in plan {
            let worker = worker.clone();
            let semaphore = semaphore.clone();
            let token = token.clone();
            let span = info_span!("channel", channel = channel.get(), name = %name);
            let task_name = name.clone();

            let handle = tasks.spawn(
                async move {
                    let permit = tokio::select! {
                        _ = token.cancelled() => None,
                        permit = semaphore.acquire_owned() => permit.ok(),
                    };
                    let Some(permit) = permit else {
                        debug!("Cancelled before start");
                        return Ok(ChannelReport::cancelled(channel, task_name));
                    };

                    let result = worker.run(channel, &task_name, &token).await;
                    drop(permit);
                    result
                }
                .instrument(span),
            );
            task_channels.insert(handle.id(), (channel, name));
        }

        let mut fatal = None;
        while let Some(joined) = tasks.join_next_with_id().await {
            match joined {
                Ok((_, Ok(channel_report))) => report.push(channel_report),
                Ok((id, Err(err))) => {
                    if let Some((channel, _)) = task_channels.get(&id) {
                        error!(channel = channel.get(), error = %err, "Fatal error, cancelling run");
                    }
                    token.cancel();
                    fatal.get_or_insert(err);
                }
                Err(join_err) => {
                    let Some((channel, name)) = task_channels.get(&join_err.id()).cloned() else {
                        continue;
                    };
                    error!(channel = channel.get(), error = %join_err, "Channel worker panicked");
                    let mut failed = ChannelReport::new(channel, name);
                    failed.fail(format!("worker aborted: {join_err}"));
                    report.push(failed);
                }
            }
        }

        if let Some(err) = fatal {
            return Err(err);
        }

        let totals = report.totals();
        info!(
            channels = totals.channels,
            failed_channels = totals.failed_channels,
            downloaded = totals.succeeded,
            skipped = totals.skipped,
            failed = totals.failed,
            bytes = totals.bytes,
            "Run finished"
        );
        Ok(report)
    }
}

/// Immutable per-run context shared by every channel task.
struct ChannelWorker {
    device: Arc<dyn DeviceApi>,
    downloads: DownloadEngine,
    layout: ArchiveLayout,
    device_label: String,
    clock: DeviceClock,
    window: TimeWindow,
    kind: ContentKind,
    page_size: u32,
    retry: RetryPolicy,
    delay_between_files: Duration,
}

impl ChannelWorker {
    /// Process one channel. Only fatal errors are returned as `Err`.
    async fn run(
        &self,
        channel: ChannelId,
        name: &str,
        token: &CancellationToken,
    ) -> Result<ChannelReport> {
        let mut report = ChannelReport::new(channel, name);
        let dir = self.layout.channel_dir(&self.device_label, channel, name);
        if let Err(err) = self.layout.ensure_within_root(&dir) {
            warn!(error = %err, "Refusing channel directory");
            report.fail(err.to_string());
            return Ok(report);
        }

        info!(dir = %dir.display(), "Listing recordings");
        let mut search = RecordingSearch::new(
            self.device.clone(),
            TrackId::new(channel, self.kind),
            self.window,
            self.clock,
            self.page_size,
        )
        .with_retry(self.retry.clone(), token.clone());
        let mut seen = HashSet::new();

        loop {
            if token.is_cancelled() {
                report.status = ChannelStatus::Cancelled;
                break;
            }

            let recording = match search.next().await {
                Ok(Some(recording)) => recording,
                Ok(None) => break,
                Err(FetchError::Cancelled) => {
                    report.status = ChannelStatus::Cancelled;
                    break;
                }
                Err(err) if err.is_fatal() => return Err(err),
                Err(err) => {
                    warn!(error = %err, "Search failed");
                    report.fail(format!("search failed: {err}"));
                    break;
                }
            };

            if !seen.insert(recording.dedup_key()) {
                debug!(start = %recording.start, "Dropping duplicate recording");
                continue;
            }

            let target = match self.layout.recording_path(&dir, &recording, &self.clock) {
                Ok(target) => target,
                Err(err) => {
                    warn!(locator = %recording.locator, error = %err, "Refusing recording path");
                    report.record_failure(recording.locator.clone(), &err);
                    continue;
                }
            };
            let file_name = target
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();

            match self.downloads.fetch(&recording, &target, token).await {
                Ok(outcome) => {
                    report.record(&outcome);
                    if matches!(outcome, DownloadOutcome::Downloaded { .. })
                        && !self.delay_between_files.is_zero()
                    {
                        tokio::select! {
                            _ = token.cancelled() => {}
                            _ = tokio::time::sleep(self.delay_between_files) => {}
                        }
                    }
                }
                Err(FetchError::Cancelled) => {
                    report.status = ChannelStatus::Cancelled;
                    break;
                }
                Err(err) if err.is_fatal() => return Err(err),
                Err(err) => {
                    warn!(file = %file_name, error = %err, "Recording failed");
                    report.record_failure(file_name, &err);
                }
            }
        }

        report.finish();
        info!(
            status = %report.status,
            downloaded = report.succeeded,
            skipped = report.skipped,
            failed = report.failed,
            bytes = report.bytes,
            "Channel finished"
        );
        Ok(report)
    }
}
