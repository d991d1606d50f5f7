use std::time::Duration;

use reqwest::Client;
use reqwest::header::{HeaderMap, HeaderValue};
use tracing::debug;

use crate::{FetchError, retry::RetryPolicy};

pub const DEFAULT_USER_AGENT: &str = concat!("hikfetch/", env!("CARGO_PKG_VERSION"));

/// Configurable options for the engine.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Overall timeout for a single search or time request
    pub request_timeout: Duration,

    /// Connection timeout (time to establish initial connection)
    pub connect_timeout: Duration,

    /// Maximum time between two body chunks of a download
    pub read_timeout: Duration,

    /// Recordings requested per search page
    pub page_size: u32,

    /// Recordings requested per discovery probe
    pub probe_page_size: u32,

    /// Retry budget shared by searches and downloads
    pub retry: RetryPolicy,

    /// Pause after each recording of a channel
    pub delay_between_files: Duration,

    /// User agent string
    pub user_agent: String,

    /// Accept self-signed device certificates
    pub danger_accept_invalid_certs: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(10),
            read_timeout: Duration::from_secs(30),
            page_size: 50,
            probe_page_size: 1,
            retry: RetryPolicy::default(),
            delay_between_files: Duration::ZERO,
            user_agent: DEFAULT_USER_AGENT.to_owned(),
            danger_accept_invalid_certs: false,
        }
    }
}

impl EngineConfig {
    pub fn get_default_headers() -> HeaderMap {
        let mut default_headers = HeaderMap::new();

        default_headers.insert(
            reqwest::header::ACCEPT,
            HeaderValue::from_static("application/xml, text/xml;q=0.9, */*;q=0.8"),
        );

        default_headers.insert(
            reqwest::header::CONNECTION,
            HeaderValue::from_static("keep-alive"),
        );

        default_headers
    }
}

/// Create a reqwest Client with the provided configuration.
///
/// The overall request timeout is applied per request instead of here, since
/// downloads of long recordings may legitimately stream for many minutes.
pub fn create_client(config: &EngineConfig) -> Result<Client, FetchError> {
    let mut client_builder = Client::builder()
        .pool_max_idle_per_host(8)
        .user_agent(&config.user_agent)
        .default_headers(EngineConfig::get_default_headers())
        .redirect(reqwest::redirect::Policy::limited(5));

    if !config.connect_timeout.is_zero() {
        client_builder = client_builder.connect_timeout(config.connect_timeout);
    }

    if config.danger_accept_invalid_certs {
        debug!("Accepting invalid TLS certificates from the device");
        client_builder = client_builder.danger_accept_invalid_certs(true);
    }

    client_builder.build().map_err(FetchError::from)
}
