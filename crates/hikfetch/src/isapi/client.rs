use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use parking_lot::RwLock;
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE, WWW_AUTHENTICATE};
use reqwest::{Client, Method, RequestBuilder, Response, StatusCode};
use tracing::{debug, instrument};
use url::{Position, Url};

use super::auth::{Credentials, DigestChallenge};
use super::{ByteStream, DeviceApi, SearchPage, SearchQuery, xml};
use crate::config::{EngineConfig, create_client};
use crate::time::DeviceClock;
use crate::track::ChannelId;
use crate::{FetchError, Result};

const TIME_PATH: &str = "/ISAPI/System/time";
const CHANNELS_PATH: &str = "/ISAPI/ContentMgmt/InputProxy/channels";
const SEARCH_PATH: &str = "/ISAPI/ContentMgmt/search";
const DOWNLOAD_PATH: &str = "/ISAPI/ContentMgmt/download";

/// ISAPI client for one recorder.
pub struct IsapiClient {
    http: Client,
    base_url: Url,
    credentials: Credentials,
    digest: RwLock<Option<DigestChallenge>>,
    nonce_count: AtomicU32,
    request_timeout: Duration,
}

impl IsapiClient {
    /// `address` is a host (`10.19.2.2`, `nvr.local:8080`) or a full base URL.
    pub fn new(address: &str, credentials: Credentials, config: &EngineConfig) -> Result<Self> {
        let address = address.trim();
        let base = if address.contains("://") {
            address.to_string()
        } else {
            format!("http://{address}")
        };
        let base_url = Url::parse(&base).map_err(|e| {
            FetchError::invalid_request(format!("invalid device address `{address}`: {e}"))
        })?;
        if base_url.host_str().is_none() {
            return Err(FetchError::invalid_request(format!(
                "device address `{address}` has no host"
            )));
        }

        Ok(Self {
            http: create_client(config)?,
            base_url,
            credentials,
            digest: RwLock::new(None),
            nonce_count: AtomicU32::new(0),
            request_timeout: config.request_timeout,
        })
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    fn endpoint(&self, path: &str) -> Result<Url> {
        self.base_url
            .join(path)
            .map_err(|e| FetchError::invalid_request(format!("invalid endpoint `{path}`: {e}")))
    }

    fn authorize(&self, builder: RequestBuilder, method: &Method, url: &Url) -> RequestBuilder {
        let challenge = self.digest.read().clone();
        match challenge {
            Some(challenge) => {
                let nonce_count = self.nonce_count.fetch_add(1, Ordering::Relaxed) + 1;
                let cnonce = uuid::Uuid::new_v4().simple().to_string();
                let header = challenge.authorization(
                    &self.credentials,
                    method.as_str(),
                    &url[Position::BeforePath..],
                    nonce_count,
                    &cnonce,
                );
                builder.header(AUTHORIZATION, header)
            }
            None => builder.basic_auth(
                self.credentials.username(),
                Some(self.credentials.password()),
            ),
        }
    }

    /// Send a request, negotiating Digest auth on the first 401.
    async fn send(
        &self,
        method: Method,
        url: Url,
        body: Option<&str>,
        operation: &'static str,
    ) -> Result<Response> {
        for attempt in 0..2 {
            let mut builder = self.http.request(method.clone(), url.clone());
            if let Some(body) = body {
                builder = builder
                    .header(CONTENT_TYPE, "application/xml; charset=\"UTF-8\"")
                    .body(body.to_owned());
            }
            let response = self.authorize(builder, &method, &url).send().await?;
            let status = response.status();

            if status == StatusCode::UNAUTHORIZED {
                let challenge = response
                    .headers()
                    .get_all(WWW_AUTHENTICATE)
                    .iter()
                    .filter_map(|value| value.to_str().ok())
                    .find_map(DigestChallenge::parse);
                match challenge {
                    Some(challenge) if attempt == 0 => {
                        debug!(realm = %challenge.realm, stale = challenge.stale, "Switching to digest authentication");
                        *self.digest.write() = Some(challenge);
                        self.nonce_count.store(0, Ordering::Relaxed);
                        continue;
                    }
                    _ => return Err(FetchError::Unauthorized),
                }
            }

            if !status.is_success() {
                return Err(FetchError::http_status(status, url.as_str(), operation));
            }
            return Ok(response);
        }

        Err(FetchError::Unauthorized)
    }

    /// Send a request and read the whole body, bounded by the request timeout.
    async fn send_for_text(
        &self,
        method: Method,
        url: Url,
        body: Option<&str>,
        operation: &'static str,
    ) -> Result<String> {
        let exchange = async {
            let response = self.send(method, url, body, operation).await?;
            Ok::<_, FetchError>(response.text().await?)
        };
        tokio::time::timeout(self.request_timeout, exchange)
            .await
            .map_err(|_| {
                FetchError::timeout(format!(
                    "{operation} did not complete within {:?}",
                    self.request_timeout
                ))
            })?
    }

    /// Photos are listed with plain HTTP locators pointing at the device's own
    /// address, which may not be reachable from here. Keep path and query,
    /// swap in the address we were given.
    fn rebase_locator(&self, locator: &str) -> Result<Url> {
        let remote = Url::parse(locator)
            .map_err(|e| FetchError::protocol(format!("invalid playback locator `{locator}`: {e}")))?;
        let mut url = self.base_url.clone();
        url.set_path(remote.path());
        url.set_query(remote.query());
        Ok(url)
    }
}

#[async_trait]
impl DeviceApi for IsapiClient {
    #[instrument(skip(self), level = "debug")]
    async fn device_time(&self) -> Result<DeviceClock> {
        let body = self
            .send_for_text(Method::GET, self.endpoint(TIME_PATH)?, None, "time query")
            .await?;
        xml::parse_device_time(&body)
    }

    #[instrument(skip(self), level = "debug")]
    async fn channel_names(&self) -> Result<BTreeMap<ChannelId, String>> {
        let body = self
            .send_for_text(Method::GET, self.endpoint(CHANNELS_PATH)?, None, "channel list")
            .await?;
        xml::parse_channel_list(&body)
    }

    #[instrument(skip(self, query), fields(track = %query.track, position = query.position), level = "debug")]
    async fn search(&self, query: &SearchQuery) -> Result<SearchPage> {
        let request = xml::search_request_body(query)?;
        let body = self
            .send_for_text(
                Method::POST,
                self.endpoint(SEARCH_PATH)?,
                Some(&request),
                "search",
            )
            .await?;
        xml::parse_search_result(&body, &query.clock)
    }

    #[instrument(skip(self), level = "debug")]
    async fn download(&self, locator: &str) -> Result<ByteStream> {
        let request = async {
            if locator.starts_with("http://") || locator.starts_with("https://") {
                self.send(Method::GET, self.rebase_locator(locator)?, None, "download")
                    .await
            } else {
                let body = xml::download_request_body(locator)?;
                self.send(
                    Method::GET,
                    self.endpoint(DOWNLOAD_PATH)?,
                    Some(&body),
                    "download",
                )
                .await
            }
        };

        let response = tokio::time::timeout(self.request_timeout, request)
            .await
            .map_err(|_| {
                FetchError::timeout(format!(
                    "download did not start within {:?}",
                    self.request_timeout
                ))
            })??;

        if let Some(length) = response.content_length() {
            debug!(bytes = length, "Download started");
        }

        Ok(response
            .bytes_stream()
            .map(|chunk| chunk.map_err(FetchError::from))
            .boxed())
    }
}
