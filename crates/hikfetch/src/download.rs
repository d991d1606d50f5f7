use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::config::EngineConfig;
use crate::isapi::DeviceApi;
use crate::retry::{RetryPolicy, retry_with_backoff};
use crate::track::RecordingDescriptor;
use crate::{FetchError, Result};

/// What happened to one recording.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DownloadOutcome {
    Downloaded { path: PathBuf, bytes: u64 },
    /// The final file was already there.
    Skipped { path: PathBuf },
}

impl DownloadOutcome {
    pub fn path(&self) -> &Path {
        match self {
            DownloadOutcome::Downloaded { path, .. } | DownloadOutcome::Skipped { path } => path,
        }
    }

    pub fn bytes(&self) -> u64 {
        match self {
            DownloadOutcome::Downloaded { bytes, .. } => *bytes,
            DownloadOutcome::Skipped { .. } => 0,
        }
    }
}

/// Streams recordings to disk through a `.part` file.
pub struct DownloadEngine {
    device: Arc<dyn DeviceApi>,
    retry: RetryPolicy,
    read_timeout: Duration,
}

impl DownloadEngine {
    pub fn new(device: Arc<dyn DeviceApi>, config: &EngineConfig) -> Self {
        Self {
            device,
            retry: config.retry.clone(),
            read_timeout: config.read_timeout,
        }
    }

    /// Make sure `target` holds the full body of `recording`.
    ///
    /// An existing `target` is left alone. Otherwise the body is written to
    /// `<target>.part` and renamed once complete; a failed attempt starts
    /// over with a fresh `.part` file.
    pub async fn fetch(
        &self,
        recording: &RecordingDescriptor,
        target: &Path,
        token: &CancellationToken,
    ) -> Result<DownloadOutcome> {
        if tokio::fs::try_exists(target).await? {
            debug!(path = %target.display(), "Already downloaded, skipping");
            return Ok(DownloadOutcome::Skipped {
                path: target.to_path_buf(),
            });
        }

        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let part = part_path(target);
        let result = retry_with_backoff(&self.retry, token, |attempt| {
            let part = &part;
            async move {
                if attempt > 0 {
                    debug!(attempt = attempt + 1, path = %target.display(), "Restarting download");
                }
                self.stream_to(recording, part, target, token).await
            }
        })
        .await;

        match result {
            Ok(bytes) => {
                info!(path = %target.display(), bytes, "Downloaded recording");
                Ok(DownloadOutcome::Downloaded {
                    path: target.to_path_buf(),
                    bytes,
                })
            }
            Err(err) => {
                let _ = tokio::fs::remove_file(&part).await;
                Err(err)
            }
        }
    }

    async fn stream_to(
        &self,
        recording: &RecordingDescriptor,
        part: &Path,
        target: &Path,
        token: &CancellationToken,
    ) -> Result<u64> {
        let mut body = self.device.download(&recording.locator).await?;
        let mut file = tokio::fs::File::create(part).await?;
        let mut written = 0u64;

        loop {
            let next = tokio::select! {
                _ = token.cancelled() => return Err(FetchError::Cancelled),
                next = tokio::time::timeout(self.read_timeout, body.next()) => next,
            };
            let chunk = match next {
                Ok(Some(chunk)) => chunk?,
                Ok(None) => break,
                Err(_) => {
                    return Err(FetchError::timeout(format!(
                        "no data received for {:?}",
                        self.read_timeout
                    )));
                }
            };
            file.write_all(&chunk).await?;
            written += chunk.len() as u64;
        }

        if written == 0 {
            // A 2xx with no body is a cut connection, not a bad recording.
            return Err(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "device sent an empty recording",
            )
            .into());
        }

        file.flush().await?;
        file.sync_all().await?;
        drop(file);

        tokio::fs::rename(part, target).await?;
        Ok(written)
    }
}

/// `<name>.part` next to the final file.
pub fn part_path(target: &Path) -> PathBuf {
    let mut name = target.file_name().unwrap_or_default().to_os_string();
    name.push(".part");
    target.with_file_name(name)
}
