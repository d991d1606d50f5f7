use std::path::PathBuf;

use reqwest::StatusCode;

#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    #[error("unauthorised: the device rejected the supplied credentials")]
    Unauthorized,

    #[error("operation cancelled")]
    Cancelled,

    #[error("HTTP request failed: {source}")]
    Network {
        #[from]
        source: reqwest::Error,
    },

    #[error("request failed with HTTP {status} during {operation} for {url}")]
    HttpStatus {
        status: StatusCode,
        url: String,
        operation: &'static str,
    },

    #[error("operation timed out: {reason}")]
    Timeout { reason: String },

    #[error("protocol error: {reason}")]
    Protocol { reason: String },

    #[error("malformed XML from device: {reason}")]
    Xml { reason: String },

    #[error("I/O error: {source}")]
    Io {
        #[from]
        source: std::io::Error,
    },

    #[error("invalid time window: end {end} is before start {start}")]
    InvalidWindow { start: String, end: String },

    #[error("invalid request: {reason}")]
    InvalidRequest { reason: String },

    #[error("refusing to write outside the archive root: {}", path.display())]
    UnsafePath { path: PathBuf },

    #[error("channel identity map {}: {reason}", path.display())]
    IdentityMap { path: PathBuf, reason: String },
}

impl FetchError {
    pub fn http_status(
        status: StatusCode,
        url: impl Into<String>,
        operation: &'static str,
    ) -> Self {
        Self::HttpStatus {
            status,
            url: url.into(),
            operation,
        }
    }

    pub fn timeout(reason: impl Into<String>) -> Self {
        Self::Timeout {
            reason: reason.into(),
        }
    }

    pub fn protocol(reason: impl Into<String>) -> Self {
        Self::Protocol {
            reason: reason.into(),
        }
    }

    pub fn xml(reason: impl Into<String>) -> Self {
        Self::Xml {
            reason: reason.into(),
        }
    }

    pub fn invalid_request(reason: impl Into<String>) -> Self {
        Self::InvalidRequest {
            reason: reason.into(),
        }
    }

    pub fn identity_map(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        Self::IdentityMap {
            path: path.into(),
            reason: reason.into(),
        }
    }

    /// Errors that end the whole run rather than a single channel or recording.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::Unauthorized
                | Self::InvalidWindow { .. }
                | Self::InvalidRequest { .. }
                | Self::IdentityMap { .. }
        )
    }

    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Unauthorized
            | Self::Cancelled
            | Self::Protocol { .. }
            | Self::Xml { .. }
            | Self::InvalidWindow { .. }
            | Self::InvalidRequest { .. }
            | Self::UnsafePath { .. }
            | Self::IdentityMap { .. } => false,
            Self::HttpStatus { status, .. } => {
                status.is_server_error() || *status == StatusCode::TOO_MANY_REQUESTS
            }
            Self::Network { source } => {
                source.is_connect()
                    || source.is_timeout()
                    || source.is_request()
                    || source.is_body()
                    || source.is_decode()
            }
            Self::Timeout { .. } | Self::Io { .. } => true,
        }
    }
}

pub type Result<T> = std::result::Result<T, FetchError>;
