//! The recorder's HTTP+XML API.
//!
//! [`DeviceApi`] is the seam between the engine and the device: the
//! orchestrator, scanner, search cursor and download engine only ever talk to
//! this trait. [`IsapiClient`] is the reqwest implementation.

mod auth;
mod client;
pub(crate) mod xml;

use std::collections::BTreeMap;

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;

use crate::time::{DeviceClock, TimeWindow};
use crate::track::{ChannelId, RecordingDescriptor, TrackId};
use crate::Result;

pub use auth::Credentials;
pub use client::IsapiClient;

/// Body of a recording download.
pub type ByteStream = BoxStream<'static, Result<Bytes>>;

/// One page request of a recording search.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchQuery {
    pub track: TrackId,
    pub window: TimeWindow,
    /// Used to render the window in device-local time and to read results back.
    pub clock: DeviceClock,
    /// Index of the first result to return.
    pub position: u32,
    pub max_results: u32,
}

/// One page of search results, in device order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SearchPage {
    pub recordings: Vec<RecordingDescriptor>,
    /// The device reported further matches beyond this page.
    pub more: bool,
}

#[async_trait]
pub trait DeviceApi: Send + Sync {
    /// Read the device clock. Also serves as the startup reachability probe.
    async fn device_time(&self) -> Result<DeviceClock>;

    /// Channel names configured on the recorder. Devices without a channel
    /// list return an empty map.
    async fn channel_names(&self) -> Result<BTreeMap<ChannelId, String>> {
        Ok(BTreeMap::new())
    }

    async fn search(&self, query: &SearchQuery) -> Result<SearchPage>;

    async fn download(&self, locator: &str) -> Result<ByteStream>;
}
