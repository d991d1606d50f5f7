use std::path::PathBuf;

use clap::Parser;
use hikfetch_engine::ChannelId;

use crate::error::AppError;
use crate::utils::parse_channel_list;

/// Download recorded video or photos from every channel of an ISAPI recorder.
///
/// Credentials are read from HIK_USERNAME and HIK_PASSWORD (a `.env` file in
/// the working directory is loaded too).
#[derive(Parser, Debug, Clone)]
#[command(name = "hikfetch", version, about, long_about)]
pub struct Args {
    /// Recorder address, e.g. 10.19.2.2 or nvr.local:8080
    pub device: String,

    /// Window start date (YYYY-MM-DD)
    pub start_date: String,

    /// Window start time (HH:MM:SS)
    pub start_time: String,

    /// Window end date (YYYY-MM-DD)
    pub end_date: String,

    /// Window end time (HH:MM:SS)
    pub end_time: String,

    /// Treat the window as UTC instead of device-local time
    #[arg(short = 'u', long)]
    pub utc: bool,

    /// Download photos instead of video
    #[arg(short = 'p', long)]
    pub photo: bool,

    /// Maximum number of channels downloading at once
    #[arg(
        short = 'c',
        long = "concurrent",
        default_value_t = 3,
        value_parser = clap::value_parser!(u16).range(1..)
    )]
    pub concurrent: u16,

    /// Highest channel number probed during discovery
    #[arg(
        short = 'm',
        long = "max-channel",
        default_value_t = 32,
        value_parser = clap::value_parser!(u32).range(1..=i64::from(ChannelId::MAX))
    )]
    pub max_channel: u32,

    /// Only these channels, e.g. "1,3-6,8" (skips discovery)
    #[arg(long, value_parser = parse_channel_arg)]
    pub channels: Option<ChannelList>,

    /// Config file (default: <config dir>/hikfetch/config.toml)
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Archive root directory
    #[arg(short = 'o', long)]
    pub output_dir: Option<PathBuf>,

    /// Directory for run and per-channel log files
    #[arg(long)]
    pub log_dir: Option<PathBuf>,

    /// Request timeout in seconds
    #[arg(long)]
    pub timeout: Option<u64>,

    /// Retries per search page or recording after the first attempt
    #[arg(long)]
    pub retries: Option<u32>,

    /// Print the final report as JSON
    #[arg(long)]
    pub json: bool,

    /// Enable debug logging
    #[arg(short = 'v', long, conflicts_with = "quiet")]
    pub verbose: bool,

    /// Only log errors
    #[arg(short = 'q', long)]
    pub quiet: bool,
}

/// Parsed `--channels` value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelList(pub Vec<ChannelId>);

fn parse_channel_arg(input: &str) -> Result<ChannelList, AppError> {
    parse_channel_list(input).map(ChannelList)
}
