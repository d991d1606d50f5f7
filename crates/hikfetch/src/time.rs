//! Device clock handling.
//!
//! Recorders report and accept timestamps in their own wall-clock time. The
//! engine keeps every instant in UTC and converts at the ISAPI boundary using
//! the offset read from the device at startup.

use chrono::{DateTime, FixedOffset, NaiveDateTime, Offset, TimeDelta, Utc};

use crate::{FetchError, Result};

/// Wire format used by ISAPI bodies. The trailing `Z` is part of the device's
/// convention; the digits are device-local wall time.
const ISAPI_TIME_FORMAT: &str = "%Y-%m-%dT%H:%M:%SZ";

/// Format used for recording filenames.
const FILENAME_TIME_FORMAT: &str = "%Y-%m-%d_%H-%M-%S";

/// Offset between the device's wall clock and UTC (device-local minus UTC).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceClock {
    offset: FixedOffset,
}

impl Default for DeviceClock {
    fn default() -> Self {
        Self::utc()
    }
}

impl DeviceClock {
    pub fn new(offset: FixedOffset) -> Self {
        Self { offset }
    }

    /// A clock whose wall time is UTC.
    pub fn utc() -> Self {
        Self { offset: Utc.fix() }
    }

    /// Offset in seconds east of UTC.
    pub fn offset_seconds(&self) -> i32 {
        self.offset.local_minus_utc()
    }

    /// Derive the clock from the `localTime` element of `/ISAPI/System/time`.
    ///
    /// A timestamp without an offset means the device runs on UTC.
    pub fn from_local_time(text: &str) -> Result<Self> {
        let text = text.trim();
        if let Ok(parsed) = DateTime::parse_from_rfc3339(text) {
            return Ok(Self::new(*parsed.offset()));
        }
        parse_naive(text)
            .map(|_| Self::utc())
            .ok_or_else(|| FetchError::protocol(format!("unrecognised device time `{text}`")))
    }

    pub fn to_local(&self, instant: DateTime<Utc>) -> NaiveDateTime {
        instant.with_timezone(&self.offset).naive_local()
    }

    pub fn to_utc(&self, local: NaiveDateTime) -> DateTime<Utc> {
        (local - TimeDelta::seconds(i64::from(self.offset_seconds()))).and_utc()
    }

    /// Render an instant the way ISAPI request bodies expect it.
    pub fn format_isapi(&self, instant: DateTime<Utc>) -> String {
        self.to_local(instant).format(ISAPI_TIME_FORMAT).to_string()
    }

    /// Parse a timestamp from an ISAPI response body into UTC.
    pub fn parse_isapi(&self, text: &str) -> Result<DateTime<Utc>> {
        let text = text.trim();
        if let Some(naive) = parse_naive(text) {
            return Ok(self.to_utc(naive));
        }
        // Some firmware emits a real offset instead of the bare `Z` convention.
        DateTime::parse_from_rfc3339(text)
            .map(|dt| dt.with_timezone(&Utc))
            .map_err(|_| FetchError::protocol(format!("unrecognised timestamp `{text}`")))
    }

    /// Filename stem for a recording starting at `instant`, in device-local time.
    pub fn filename_stem(&self, instant: DateTime<Utc>) -> String {
        self.to_local(instant).format(FILENAME_TIME_FORMAT).to_string()
    }
}

fn parse_naive(text: &str) -> Option<NaiveDateTime> {
    NaiveDateTime::parse_from_str(text, ISAPI_TIME_FORMAT)
        .or_else(|_| NaiveDateTime::parse_from_str(text, "%Y-%m-%dT%H:%M:%S"))
        .ok()
}

/// How the user-entered window bounds should be interpreted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TimeBasis {
    /// Bounds are device-local wall time.
    #[default]
    DeviceLocal,
    /// Bounds are already UTC.
    Utc,
}

/// A UTC time range, start inclusive and end exclusive. `end >= start` always
/// holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeWindow {
    start: DateTime<Utc>,
    end: DateTime<Utc>,
}

impl TimeWindow {
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> Result<Self> {
        if end < start {
            return Err(FetchError::InvalidWindow {
                start: start.to_rfc3339(),
                end: end.to_rfc3339(),
            });
        }
        Ok(Self { start, end })
    }

    /// Build a window from naive bounds interpreted on `clock`.
    pub fn from_local(start: NaiveDateTime, end: NaiveDateTime, clock: &DeviceClock) -> Result<Self> {
        Self::new(clock.to_utc(start), clock.to_utc(end))
    }

    /// Bounds as device-local wall time.
    pub fn to_device_local(&self, clock: &DeviceClock) -> (NaiveDateTime, NaiveDateTime) {
        (clock.to_local(self.start), clock.to_local(self.end))
    }

    pub fn start(&self) -> DateTime<Utc> {
        self.start
    }

    pub fn end(&self) -> DateTime<Utc> {
        self.end
    }

    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }

    pub fn contains(&self, instant: DateTime<Utc>) -> bool {
        instant >= self.start && instant < self.end
    }
}
