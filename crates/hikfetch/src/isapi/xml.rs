//! Request and response bodies of the ISAPI endpoints the engine uses.
//!
//! Every response comes from a network-reachable device and is treated as
//! untrusted: documents carrying a DTD or entity declarations are refused
//! before they reach the deserializer.

use std::collections::BTreeMap;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::warn;

use super::{SearchPage, SearchQuery};
use crate::time::DeviceClock;
use crate::track::{ChannelId, RecordingDescriptor, TrackId};
use crate::{FetchError, Result};

const XML_DECLARATION: &str = r#"<?xml version="1.0" encoding="utf-8"?>"#;
const RECORD_METADATA: &str = "//recordType.meta.std-cgi.com";

#[derive(Debug, Serialize, Deserialize)]
struct TimeSpan {
    #[serde(rename = "startTime")]
    start_time: String,
    #[serde(rename = "endTime")]
    end_time: String,
}

#[derive(Debug, Serialize)]
#[serde(rename = "CMSearchDescription")]
struct SearchDescription {
    #[serde(rename = "searchID")]
    search_id: String,
    #[serde(rename = "trackList")]
    track_list: TrackList,
    #[serde(rename = "timeSpanList")]
    time_span_list: TimeSpanList,
    #[serde(rename = "maxResults")]
    max_results: u32,
    // Spelling matches the device schema.
    #[serde(rename = "searchResultPostion")]
    search_result_position: u32,
    #[serde(rename = "metadataList")]
    metadata_list: MetadataList,
}

#[derive(Debug, Serialize)]
struct TrackList {
    #[serde(rename = "trackID")]
    track_id: Vec<u32>,
}

#[derive(Debug, Serialize)]
struct TimeSpanList {
    #[serde(rename = "timeSpan")]
    time_span: Vec<TimeSpan>,
}

#[derive(Debug, Serialize)]
struct MetadataList {
    #[serde(rename = "metadataDescriptor")]
    metadata_descriptor: &'static str,
}

#[derive(Debug, Deserialize)]
struct SearchResult {
    #[serde(rename = "responseStatus", default = "default_true")]
    response_status: bool,
    #[serde(rename = "responseStatusStrg", default)]
    response_status_strg: String,
    #[serde(rename = "matchList", default)]
    match_list: Option<MatchList>,
}

#[derive(Debug, Default, Deserialize)]
struct MatchList {
    #[serde(rename = "searchMatchItem", default)]
    items: Vec<SearchMatchItem>,
}

#[derive(Debug, Deserialize)]
struct SearchMatchItem {
    #[serde(rename = "trackID")]
    track_id: u32,
    #[serde(rename = "timeSpan")]
    time_span: TimeSpan,
    #[serde(rename = "mediaSegmentDescriptor")]
    media: MediaSegmentDescriptor,
}

#[derive(Debug, Deserialize)]
struct MediaSegmentDescriptor {
    #[serde(rename = "playbackURI")]
    playback_uri: String,
}

#[derive(Debug, Deserialize)]
struct DeviceTime {
    #[serde(rename = "localTime")]
    local_time: String,
}

#[derive(Debug, Deserialize)]
struct InputProxyChannelList {
    #[serde(rename = "InputProxyChannel", default)]
    channels: Vec<InputProxyChannel>,
}

#[derive(Debug, Deserialize)]
struct InputProxyChannel {
    id: u32,
    #[serde(default)]
    name: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename = "downloadRequest")]
struct DownloadRequest<'a> {
    #[serde(rename = "playbackURI")]
    playback_uri: &'a str,
}

fn default_true() -> bool {
    true
}

fn ensure_no_dtd(body: &str) -> Result<()> {
    if body.contains("<!DOCTYPE") || body.contains("<!ENTITY") {
        return Err(FetchError::xml("document type declarations are not accepted"));
    }
    Ok(())
}

fn from_untrusted<T: DeserializeOwned>(body: &str) -> Result<T> {
    ensure_no_dtd(body)?;
    quick_xml::de::from_str(body).map_err(|e| FetchError::xml(e.to_string()))
}

fn to_document<T: Serialize>(value: &T) -> Result<String> {
    let body = quick_xml::se::to_string(value).map_err(|e| FetchError::xml(e.to_string()))?;
    Ok(format!("{XML_DECLARATION}{body}"))
}

pub(crate) fn search_request_body(query: &SearchQuery) -> Result<String> {
    let description = SearchDescription {
        search_id: uuid::Uuid::new_v4().to_string().to_uppercase(),
        track_list: TrackList {
            track_id: vec![query.track.get()],
        },
        time_span_list: TimeSpanList {
            time_span: vec![TimeSpan {
                start_time: query.clock.format_isapi(query.window.start()),
                end_time: query.clock.format_isapi(query.window.end()),
            }],
        },
        max_results: query.max_results,
        search_result_position: query.position,
        metadata_list: MetadataList {
            metadata_descriptor: RECORD_METADATA,
        },
    };
    to_document(&description)
}

pub(crate) fn parse_search_result(body: &str, clock: &DeviceClock) -> Result<SearchPage> {
    let result: SearchResult = from_untrusted(body)?;
    let status = result.response_status_strg.trim().to_ascii_uppercase();

    if status.starts_with("NO MATCH") {
        return Ok(SearchPage::default());
    }
    if !result.response_status {
        return Err(FetchError::protocol(format!(
            "search rejected by device (status `{}`)",
            result.response_status_strg
        )));
    }

    let recordings = result
        .match_list
        .unwrap_or_default()
        .items
        .into_iter()
        .map(|item| {
            let track = TrackId::from_raw(item.track_id).ok_or_else(|| {
                FetchError::protocol(format!("unknown track ID {}", item.track_id))
            })?;
            Ok(RecordingDescriptor {
                track,
                start: clock.parse_isapi(&item.time_span.start_time)?,
                end: clock.parse_isapi(&item.time_span.end_time)?,
                locator: item.media.playback_uri.trim().to_string(),
            })
        })
        .collect::<Result<Vec<_>>>()?;

    Ok(SearchPage {
        recordings,
        more: status == "MORE",
    })
}

pub(crate) fn parse_device_time(body: &str) -> Result<DeviceClock> {
    let time: DeviceTime = from_untrusted(body)?;
    DeviceClock::from_local_time(&time.local_time)
}

pub(crate) fn parse_channel_list(body: &str) -> Result<BTreeMap<ChannelId, String>> {
    let list: InputProxyChannelList = from_untrusted(body)?;
    let mut names = BTreeMap::new();
    for channel in list.channels {
        let Some(id) = ChannelId::new(channel.id) else {
            warn!(id = channel.id, "Ignoring channel with invalid id");
            continue;
        };
        if let Some(name) = channel.name.map(|n| n.trim().to_string())
            && !name.is_empty()
        {
            names.insert(id, name);
        }
    }
    Ok(names)
}

pub(crate) fn download_request_body(locator: &str) -> Result<String> {
    to_document(&DownloadRequest {
        playback_uri: locator,
    })
}
