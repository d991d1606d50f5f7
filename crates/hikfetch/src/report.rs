use std::fmt;

use serde::Serialize;

use crate::download::DownloadOutcome;
use crate::track::ChannelId;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", content = "reason", rename_all = "snake_case")]
pub enum ChannelStatus {
    Completed,
    Failed(String),
    /// The run was cancelled before or while this channel was processed.
    Cancelled,
}

impl fmt::Display for ChannelStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChannelStatus::Completed => f.write_str("completed"),
            ChannelStatus::Failed(reason) => write!(f, "failed: {reason}"),
            ChannelStatus::Cancelled => f.write_str("cancelled"),
        }
    }
}

/// Per-recording failure kept for the summary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RecordingFailure {
    pub recording: String,
    pub error: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChannelReport {
    pub channel: ChannelId,
    pub name: String,
    #[serde(flatten)]
    pub status: ChannelStatus,
    pub attempted: usize,
    pub succeeded: usize,
    pub skipped: usize,
    pub failed: usize,
    pub bytes: u64,
    pub failures: Vec<RecordingFailure>,
}

impl ChannelReport {
    pub fn new(channel: ChannelId, name: impl Into<String>) -> Self {
        Self {
            channel,
            name: name.into(),
            status: ChannelStatus::Completed,
            attempted: 0,
            succeeded: 0,
            skipped: 0,
            failed: 0,
            bytes: 0,
            failures: Vec::new(),
        }
    }

    pub fn cancelled(channel: ChannelId, name: impl Into<String>) -> Self {
        Self {
            status: ChannelStatus::Cancelled,
            ..Self::new(channel, name)
        }
    }

    pub fn record(&mut self, outcome: &DownloadOutcome) {
        self.attempted += 1;
        match outcome {
            DownloadOutcome::Downloaded { bytes, .. } => {
                self.succeeded += 1;
                self.bytes += bytes;
            }
            DownloadOutcome::Skipped { .. } => self.skipped += 1,
        }
    }

    pub fn record_failure(&mut self, recording: impl Into<String>, error: impl fmt::Display) {
        self.attempted += 1;
        self.failed += 1;
        self.failures.push(RecordingFailure {
            recording: recording.into(),
            error: error.to_string(),
        });
    }

    pub fn fail(&mut self, reason: impl Into<String>) {
        self.status = ChannelStatus::Failed(reason.into());
    }

    /// Settle the status once the channel is done. A channel where every
    /// attempted recording failed counts as failed.
    pub fn finish(&mut self) {
        if self.status == ChannelStatus::Completed
            && self.attempted > 0
            && self.failed == self.attempted
        {
            self.status = ChannelStatus::Failed(format!(
                "all {} recordings failed",
                self.attempted
            ));
        }
    }

    pub fn is_failed(&self) -> bool {
        matches!(self.status, ChannelStatus::Failed(_))
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Totals {
    pub channels: usize,
    pub failed_channels: usize,
    pub attempted: usize,
    pub succeeded: usize,
    pub skipped: usize,
    pub failed: usize,
    pub bytes: u64,
}

/// Outcome of a whole run.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RunReport {
    pub device: String,
    pub channels: Vec<ChannelReport>,
}

impl RunReport {
    pub fn new(device: impl Into<String>) -> Self {
        Self {
            device: device.into(),
            channels: Vec::new(),
        }
    }

    pub fn push(&mut self, report: ChannelReport) {
        let at = self
            .channels
            .partition_point(|existing| existing.channel < report.channel);
        self.channels.insert(at, report);
    }

    pub fn channel(&self, channel: ChannelId) -> Option<&ChannelReport> {
        self.channels.iter().find(|r| r.channel == channel)
    }

    pub fn totals(&self) -> Totals {
        self.channels.iter().fold(
            Totals {
                channels: self.channels.len(),
                ..Totals::default()
            },
            |mut totals, report| {
                totals.failed_channels += usize::from(report.is_failed());
                totals.attempted += report.attempted;
                totals.succeeded += report.succeeded;
                totals.skipped += report.skipped;
                totals.failed += report.failed;
                totals.bytes += report.bytes;
                totals
            },
        )
    }

    pub fn has_failures(&self) -> bool {
        self.channels.iter().any(ChannelReport::is_failed)
    }

    /// Some channel was stopped by cancellation before it finished.
    pub fn was_cancelled(&self) -> bool {
        self.channels
            .iter()
            .any(|r| r.status == ChannelStatus::Cancelled)
    }
}

impl fmt::Display for RunReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Summary for {}", self.device)?;
        if self.channels.is_empty() {
            writeln!(f, "  no channels with recordings")?;
        }
        for report in &self.channels {
            writeln!(
                f,
                "  channel {} ({}): {}, {} downloaded, {} skipped, {} failed, {}",
                report.channel,
                report.name,
                report.status,
                report.succeeded,
                report.skipped,
                report.failed,
                format_bytes(report.bytes),
            )?;
            for failure in &report.failures {
                writeln!(f, "    {}: {}", failure.recording, failure.error)?;
            }
        }
        let totals = self.totals();
        write!(
            f,
            "Total: {} channels ({} failed), {} downloaded, {} skipped, {} failed, {}",
            totals.channels,
            totals.failed_channels,
            totals.succeeded,
            totals.skipped,
            totals.failed,
            format_bytes(totals.bytes),
        )
    }
}

fn format_bytes(bytes: u64) -> String {
    const UNITS: [&str; 4] = ["B", "KiB", "MiB", "GiB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{bytes} B")
    } else {
        format!("{value:.1} {}", UNITS[unit])
    }
}
