use std::io::Write;

use hikfetch_engine::RunReport;

use crate::error::Result;

/// How the final report is printed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    Pretty,
    Json,
}

impl OutputFormat {
    pub fn from_json_flag(json: bool) -> Self {
        if json { Self::Json } else { Self::Pretty }
    }
}

pub fn format_report(report: &RunReport, format: OutputFormat) -> Result<String> {
    match format {
        OutputFormat::Pretty => Ok(report.to_string()),
        OutputFormat::Json => Ok(serde_json::to_string_pretty(report)?),
    }
}

/// Write the report to `out`, followed by a newline.
pub fn print_report(report: &RunReport, format: OutputFormat, out: &mut impl Write) -> Result<()> {
    let text = format_report(report, format)?;
    writeln!(out, "{text}")?;
    Ok(())
}

/// Exit code of a run that finished normally.
pub const EXIT_OK: i32 = 0;
/// Some channels failed.
pub const EXIT_PARTIAL: i32 = 2;
/// The run was interrupted before every channel finished.
pub const EXIT_INTERRUPTED: i32 = 130;

/// Process exit code for a finished run. An interruption wins over failures.
pub fn exit_code(report: &RunReport) -> i32 {
    if report.was_cancelled() {
        EXIT_INTERRUPTED
    } else if report.has_failures() {
        EXIT_PARTIAL
    } else {
        EXIT_OK
    }
}
