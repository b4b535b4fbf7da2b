//! Streaming artifact download into a staged temporary file

use std::path::{Path, PathBuf};
use std::time::Duration;

use futures_util::StreamExt;
use log::{debug, info};
use sha2::{Digest, Sha256};
use tempfile::NamedTempFile;
use tokio::io::AsyncWriteExt;
use tokio::time::timeout;

use super::progress::{ProgressSink, UpdateProgress};
use crate::error::{Result, SupervisorError};

/// Emit progress every 256KB
const PROGRESS_THRESHOLD: u64 = 256 * 1024;

/// One staged download; dropping it deletes the temporary file
#[derive(Debug)]
pub struct DownloadSession {
    temp: NamedTempFile,
    pub total_bytes: Option<u64>,
    pub downloaded_bytes: u64,
    sha256: String,
}

impl DownloadSession {
    pub fn path(&self) -> &Path {
        self.temp.path()
    }

    /// Hex digest of the downloaded bytes
    pub fn sha256(&self) -> &str {
        &self.sha256
    }

    /// Compare against an expected hex digest, case-insensitively
    pub fn verify_sha256(&self, expected: &str) -> Result<()> {
        if self.sha256.eq_ignore_ascii_case(expected.trim()) {
            Ok(())
        } else {
            Err(SupervisorError::DownloadFailure(format!(
                "checksum mismatch: expected {expected}, got {}",
                self.sha256
            )))
        }
    }
}

pub struct ArtifactFetcher {
    client: reqwest::Client,
    url: String,
    staging_dir: PathBuf,
    inactivity_timeout: Duration,
}

impl ArtifactFetcher {
    pub fn new(
        client: reqwest::Client,
        url: String,
        staging_dir: PathBuf,
        inactivity_timeout: Duration,
    ) -> Self {
        Self {
            client,
            url,
            staging_dir,
            inactivity_timeout,
        }
    }

    /// Stream the artifact into a uniquely named file under the staging dir
    pub async fn fetch(&self, version: Option<&str>, progress: &ProgressSink) -> Result<DownloadSession> {
        let response = self
            .client
            .get(&self.url)
            .send()
            .await
            .map_err(|e| SupervisorError::DownloadFailure(format!("{}: {e}", self.url)))?;
        if response.status() != reqwest::StatusCode::OK {
            return Err(SupervisorError::DownloadFailure(format!(
                "HTTP {} from {}",
                response.status(),
                self.url
            )));
        }
        let total_bytes = response.content_length();
        info!(
            "Downloading companion artifact from {} ({})",
            self.url,
            total_bytes.map_or("unknown size".to_string(), |n| format!("{n} bytes"))
        );

        tokio::fs::create_dir_all(&self.staging_dir).await?;
        let temp = tempfile::Builder::new()
            .prefix("companion_artifact_")
            .tempfile_in(&self.staging_dir)?;
        let mut file = tokio::fs::File::from_std(temp.reopen()?);

        let version = version.map(str::to_string);
        let mut hasher = Sha256::new();
        let mut downloaded: u64 = 0;
        let mut last_progress_bytes = 0u64;
        let mut stream = response.bytes_stream();

        loop {
            let chunk = match timeout(self.inactivity_timeout, stream.next()).await {
                Ok(Some(Ok(chunk))) => chunk,
                Ok(Some(Err(e))) => {
                    return Err(SupervisorError::DownloadFailure(format!(
                        "stream interrupted after {downloaded} bytes: {e}"
                    )));
                }
                Ok(None) => break,
                Err(_) => {
                    return Err(SupervisorError::DownloadFailure(format!(
                        "no data received for {} seconds after {downloaded} bytes",
                        self.inactivity_timeout.as_secs()
                    )));
                }
            };

            file.write_all(&chunk).await?;
            hasher.update(&chunk);
            downloaded += chunk.len() as u64;

            if downloaded - last_progress_bytes >= PROGRESS_THRESHOLD {
                debug!("downloaded {downloaded} of {total_bytes:?} bytes");
                progress.send(UpdateProgress::download(downloaded, total_bytes, version.clone()));
                last_progress_bytes = downloaded;
            }
        }
        file.flush().await?;
        file.sync_all().await?;
        progress.send(UpdateProgress::download(downloaded, total_bytes, version));

        if let Some(total) = total_bytes
            && total != downloaded
        {
            return Err(SupervisorError::DownloadFailure(format!(
                "truncated download: {downloaded} of {total} bytes"
            )));
        }

        info!("Download complete: {downloaded} bytes");
        Ok(DownloadSession {
            temp,
            total_bytes,
            downloaded_bytes: downloaded,
            sha256: hex::encode(hasher.finalize()),
        })
    }
}
