//! # hikfetch engine
//!
//! Discovery and download of recorded media from ISAPI recorders (NVR/DVR
//! and standalone cameras).
//!
//! A run is driven by [`Orchestrator::run`]: it reads the device clock, finds
//! the channels holding recordings in a window, pages through each channel's
//! search results and streams every recording to disk, with at most a fixed
//! number of channels active at once. Failures stay scoped to the recording or
//! channel they happened in; only authentication and setup errors end a run.
//!
//! ## Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use hikfetch_engine::{
//!     ArchiveLayout, ChannelSelection, ContentKind, Credentials, EngineConfig, FetchRequest,
//!     IsapiClient, Orchestrator, TimeBasis,
//! };
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn example() -> hikfetch_engine::Result<()> {
//! let config = EngineConfig::default();
//! let client = IsapiClient::new("10.19.2.2", Credentials::new("admin", "secret"), &config)?;
//! let orchestrator = Orchestrator::new(Arc::new(client), config, ArchiveLayout::new("./media"));
//!
//! let request = FetchRequest {
//!     device: "10.19.2.2".to_string(),
//!     start: "2024-11-25T08:00:00".parse().unwrap(),
//!     end: "2024-11-25T18:00:00".parse().unwrap(),
//!     time_basis: TimeBasis::DeviceLocal,
//!     kind: ContentKind::Video,
//!     channels: ChannelSelection::Discover { max_channel: 32 },
//!     concurrency: 3,
//! };
//! let report = orchestrator.run(&request, CancellationToken::new()).await?;
//! println!("{report}");
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod discovery;
pub mod download;
pub mod error;
pub mod identity;
pub mod isapi;
pub mod layout;
pub mod orchestrator;
pub mod report;
pub mod retry;
pub mod search;
pub mod time;
pub mod track;

#[cfg(test)]
pub(crate) mod test_utils;

pub use config::{EngineConfig, create_client};
pub use discovery::ChannelScanner;
pub use download::{DownloadEngine, DownloadOutcome};
pub use error::{FetchError, Result};
pub use identity::ChannelIdentityMap;
pub use isapi::{ByteStream, Credentials, DeviceApi, IsapiClient, SearchPage, SearchQuery};
pub use layout::ArchiveLayout;
pub use orchestrator::{ChannelSelection, FetchRequest, Orchestrator};
pub use report::{ChannelReport, ChannelStatus, RunReport, Totals};
pub use retry::RetryPolicy;
pub use search::{RecordingSearch, SearchCursor};
pub use time::{DeviceClock, TimeBasis, TimeWindow};
pub use track::{ChannelId, ContentKind, RecordingDescriptor, TrackId};
