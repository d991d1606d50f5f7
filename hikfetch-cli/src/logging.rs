//! Log setup for a run.
//!
//! Three sinks share one filter:
//! - the console, with local-time timestamps
//! - `<log dir>/<device>_main.log`, written through a non-blocking appender
//! - `<log dir>/<device>_channel_NN.log`, one per channel, fed by every event
//!   emitted inside that channel's `channel` span through its own
//!   non-blocking appender

use std::collections::{HashMap, HashSet};
use std::fmt::Write as _;
use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Local;
use parking_lot::Mutex;
use tracing::field::{Field, Visit};
use tracing::span::{Attributes, Id};
use tracing::{Event, Subscriber};
use tracing_appender::non_blocking::{NonBlocking, WorkerGuard};
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::layer::Context;
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::{
    EnvFilter, Layer,
    fmt::{self, format::Writer, time::FormatTime},
    layer::SubscriberExt,
    util::SubscriberInitExt,
};

use crate::error::{AppError, Result};

/// Default log filter directive.
pub const DEFAULT_LOG_FILTER: &str = "hikfetch=info,hikfetch_engine=info";

const VERBOSE_LOG_FILTER: &str = "hikfetch=debug,hikfetch_engine=debug";

/// Name of the span every channel worker runs in.
const CHANNEL_SPAN: &str = "channel";

/// Custom timer that uses the local timezone via chrono.
#[derive(Debug, Clone, Copy)]
struct LocalTimer;

impl FormatTime for LocalTimer {
    fn format_time(&self, w: &mut Writer<'_>) -> std::fmt::Result {
        let now = Local::now();
        write!(w, "{}", now.format("%Y-%m-%dT%H:%M:%S%.3f%:z"))
    }
}

/// Flushes the run log and every channel log when dropped.
pub struct LogGuard {
    _main: WorkerGuard,
    _channels: ChannelLogGuard,
}

/// Initialize console, run-log and per-channel logging.
///
/// Keep the returned guard alive until the run is over.
pub fn init_logging(
    log_dir: &Path,
    device_label: &str,
    verbose: bool,
    quiet: bool,
) -> Result<LogGuard> {
    std::fs::create_dir_all(log_dir)?;

    let file_appender =
        tracing_appender::rolling::never(log_dir, format!("{device_label}_main.log"));
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let filter = if quiet {
        EnvFilter::new("error")
    } else if verbose {
        EnvFilter::new(VERBOSE_LOG_FILTER)
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER))
    };

    let channel_layer = ChannelLogLayer::new(log_dir, device_label);
    let channels = channel_layer.guard();

    tracing_subscriber::registry()
        .with(filter)
        .with(
            fmt::layer()
                .with_target(verbose)
                .with_timer(LocalTimer),
        )
        .with(
            fmt::layer()
                .with_writer(non_blocking)
                .with_ansi(false)
                .with_timer(LocalTimer),
        )
        .with(channel_layer)
        .try_init()
        .map_err(|e| AppError::Logging(format!("Failed to set global default subscriber: {e}")))?;

    Ok(LogGuard {
        _main: guard,
        _channels: channels,
    })
}

/// Channel number attached to a `channel` span.
struct ChannelTag(u32);

#[derive(Default)]
struct ChannelWriters {
    writers: HashMap<u32, NonBlocking>,
    guards: Vec<WorkerGuard>,
    /// Channels whose file could not be created.
    unavailable: HashSet<u32>,
    closed: bool,
}

/// Routes events inside a `channel` span to that channel's own log file.
pub struct ChannelLogLayer {
    dir: PathBuf,
    prefix: String,
    state: Arc<Mutex<ChannelWriters>>,
}

impl ChannelLogLayer {
    pub fn new(dir: impl Into<PathBuf>, device_label: &str) -> Self {
        Self {
            dir: dir.into(),
            prefix: device_label.to_string(),
            state: Arc::default(),
        }
    }

    fn file_name(&self, channel: u32) -> String {
        format!("{}_channel_{channel:02}.log", self.prefix)
    }

    pub fn channel_log_path(&self, channel: u32) -> PathBuf {
        self.dir.join(self.file_name(channel))
    }

    /// Flushes and closes every channel file once dropped, even while the
    /// layer itself stays installed.
    pub fn guard(&self) -> ChannelLogGuard {
        ChannelLogGuard(self.state.clone())
    }

    fn writer(&self, channel: u32) -> Option<NonBlocking> {
        let mut state = self.state.lock();
        if state.closed || state.unavailable.contains(&channel) {
            return None;
        }
        if let Some(writer) = state.writers.get(&channel) {
            return Some(writer.clone());
        }

        let appender = RollingFileAppender::builder()
            .rotation(Rotation::NEVER)
            .filename_prefix(self.file_name(channel))
            .build(&self.dir);
        match appender {
            Ok(appender) => {
                let (writer, guard) = tracing_appender::non_blocking(appender);
                state.guards.push(guard);
                state.writers.insert(channel, writer.clone());
                Some(writer)
            }
            Err(e) => {
                // The run log still gets every event.
                eprintln!(
                    "Cannot open {}: {e}",
                    self.channel_log_path(channel).display()
                );
                state.unavailable.insert(channel);
                None
            }
        }
    }

    fn write_line(&self, channel: u32, line: &str) {
        let Some(mut writer) = self.writer(channel) else {
            return;
        };
        if let Err(e) = writer.write_all(line.as_bytes()) {
            eprintln!("Failed to write channel {channel} log: {e}");
        }
    }
}

/// See [`ChannelLogLayer::guard`].
pub struct ChannelLogGuard(Arc<Mutex<ChannelWriters>>);

impl Drop for ChannelLogGuard {
    fn drop(&mut self) {
        let mut state = self.0.lock();
        state.closed = true;
        state.writers.clear();
        // Each guard waits for its worker to drain.
        state.guards.clear();
    }
}

impl<S> Layer<S> for ChannelLogLayer
where
    S: Subscriber + for<'a> LookupSpan<'a>,
{
    fn on_new_span(&self, attrs: &Attributes<'_>, id: &Id, ctx: Context<'_, S>) {
        if attrs.metadata().name() != CHANNEL_SPAN {
            return;
        }
        let mut visitor = ChannelVisitor(None);
        attrs.record(&mut visitor);
        if let (Some(channel), Some(span)) = (visitor.0, ctx.span(id)) {
            span.extensions_mut().insert(ChannelTag(channel));
        }
    }

    fn on_event(&self, event: &Event<'_>, ctx: Context<'_, S>) {
        let channel = ctx.event_scope(event).and_then(|scope| {
            scope
                .from_root()
                .find_map(|span| span.extensions().get::<ChannelTag>().map(|tag| tag.0))
        });
        let Some(channel) = channel else {
            return;
        };

        let mut fields = String::new();
        event.record(&mut FieldVisitor(&mut fields));

        let line = format!(
            "{} {:>5} {}\n",
            Local::now().format("%Y-%m-%dT%H:%M:%S%.3f%:z"),
            event.metadata().level(),
            fields.trim_start()
        );
        self.write_line(channel, &line);
    }
}

/// Extracts the `channel` field of a span.
struct ChannelVisitor(Option<u32>);

impl Visit for ChannelVisitor {
    fn record_u64(&mut self, field: &Field, value: u64) {
        if field.name() == CHANNEL_SPAN {
            self.0 = u32::try_from(value).ok();
        }
    }

    fn record_i64(&mut self, field: &Field, value: i64) {
        if field.name() == CHANNEL_SPAN {
            self.0 = u32::try_from(value).ok();
        }
    }

    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        if field.name() == CHANNEL_SPAN && self.0.is_none() {
            self.0 = format!("{value:?}").parse().ok();
        }
    }
}

/// Renders the message first, then `key=value` pairs.
struct FieldVisitor<'a>(&'a mut String);

impl Visit for FieldVisitor<'_> {
    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name() == "message" {
            self.0.insert_str(0, value);
        } else {
            let _ = write!(self.0, " {}={}", field.name(), value);
        }
    }

    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        if field.name() == "message" {
            self.0.insert_str(0, &format!("{value:?}"));
        } else {
            let _ = write!(self.0, " {}={:?}", field.name(), value);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracing::{info, info_span, warn};

    #[test]
    fn events_inside_channel_spans_get_their_own_file() {
        let dir = tempfile::tempdir().unwrap();
        let layer = ChannelLogLayer::new(dir.path(), "10.19.2.2");
        let subscriber = tracing_subscriber::registry().with(layer);

        // The layer, and with it every writer guard, is dropped on return.
        tracing::subscriber::with_default(subscriber, || {
            info!("Run started");
            let span = info_span!("channel", channel = 3u32, name = "Lobby");
            let _entered = span.enter();
            info!(bytes = 42u64, "Downloaded recording");
            let inner = info_span!("download");
            let _inner = inner.enter();
            warn!("Retrying");
        });

        let log = std::fs::read_to_string(dir.path().join("10.19.2.2_channel_03.log")).unwrap();
        let lines: Vec<_> = log.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].contains(" INFO Downloaded recording bytes=42"));
        assert!(lines[1].contains(" WARN Retrying"));
        assert!(!log.contains("Run started"));
    }

    #[test]
    fn channels_do_not_share_files() {
        let dir = tempfile::tempdir().unwrap();
        let layer = ChannelLogLayer::new(dir.path(), "nvr");
        let subscriber = tracing_subscriber::registry().with(layer);

        tracing::subscriber::with_default(subscriber, || {
            for channel in [1u32, 2] {
                let span = info_span!("channel", channel);
                let _entered = span.enter();
                info!("Listing recordings");
            }
        });

        for channel in ["01", "02"] {
            let log = std::fs::read_to_string(dir.path().join(format!("nvr_channel_{channel}.log")))
                .unwrap();
            assert_eq!(log.lines().count(), 1);
        }
    }

    #[test]
    fn guard_flushes_while_the_layer_is_installed() {
        let dir = tempfile::tempdir().unwrap();
        let layer = ChannelLogLayer::new(dir.path(), "nvr");
        let guard = layer.guard();
        let path = layer.channel_log_path(7);
        let dispatch = tracing::Dispatch::new(tracing_subscriber::registry().with(layer));

        tracing::dispatcher::with_default(&dispatch, || {
            let span = info_span!("channel", channel = 7u32);
            let _entered = span.enter();
            info!("Channel finished");
        });
        drop(guard);

        let log = std::fs::read_to_string(&path).unwrap();
        assert!(log.contains(" INFO Channel finished"));

        // Closed layers drop further events instead of reopening files.
        tracing::dispatcher::with_default(&dispatch, || {
            let span = info_span!("channel", channel = 7u32);
            let _entered = span.enter();
            info!("Late event");
        });
        assert!(!std::fs::read_to_string(&path).unwrap().contains("Late event"));
    }

    #[test]
    fn unwritable_directory_does_not_panic() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("not-a-dir");
        std::fs::write(&blocker, b"").unwrap();
        let layer = ChannelLogLayer::new(&blocker, "nvr");
        let subscriber = tracing_subscriber::registry().with(layer);

        tracing::subscriber::with_default(subscriber, || {
            let span = info_span!("channel", channel = 1u32);
            let _entered = span.enter();
            info!("Listing recordings");
            info!("Still listing");
        });

        assert!(blocker.is_file());
    }
}
