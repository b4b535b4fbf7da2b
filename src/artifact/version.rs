//! Installed and remote artifact versions

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};

use crate::error::{Result, SupervisorError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VersionSource {
    Api,
}

/// What is installed now; written only after a successful install
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionRecord {
    pub version: String,
    pub download_time: DateTime<Utc>,
    pub source: VersionSource,
}

impl VersionRecord {
    pub fn from_api(version: impl Into<String>) -> Self {
        Self {
            version: version.into(),
            download_time: Utc::now(),
            source: VersionSource::Api,
        }
    }

    /// `None` when the record is missing or unreadable
    pub async fn load(path: &Path) -> Option<Self> {
        let bytes = match tokio::fs::read(path).await {
            Ok(bytes) => bytes,
            Err(e) => {
                debug!("No version record at {}: {e}", path.display());
                return None;
            }
        };
        match serde_json::from_slice(&bytes) {
            Ok(record) => Some(record),
            Err(e) => {
                warn!("Ignoring corrupt version record {}: {e}", path.display());
                None
            }
        }
    }

    /// Write to a sibling temp file, then rename over the record
    pub async fn store(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_vec_pretty(self)
            .map_err(|e| SupervisorError::Config(format!("version record: {e}")))?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let tmp = sibling_tmp(path);
        tokio::fs::write(&tmp, json).await?;
        if let Err(e) = tokio::fs::rename(&tmp, path).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(e.into());
        }
        Ok(())
    }
}

fn sibling_tmp(path: &Path) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(".tmp");
    path.with_file_name(name)
}

/// Version metadata served by the update server; extra fields are kept verbatim
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteVersionInfo {
    pub version: String,
    /// Hex digest of the artifact, verified before install when present
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sha256: Option<String>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

pub struct VersionResolver {
    client: reqwest::Client,
    version_url: String,
    record_path: PathBuf,
}

impl VersionResolver {
    pub fn new(client: reqwest::Client, base_url: &str, artifact: &str, record_path: PathBuf) -> Self {
        Self {
            client,
            version_url: version_url(base_url, artifact),
            record_path,
        }
    }

    pub async fn current_version(&self) -> Option<String> {
        VersionRecord::load(&self.record_path).await.map(|r| r.version)
    }

    /// Remote version info; `None` on any failure, which is logged
    pub async fn available_version(&self) -> Option<RemoteVersionInfo> {
        let response = match self.client.get(&self.version_url).send().await {
            Ok(response) => response,
            Err(e) => {
                warn!("Failed to reach update server at {}: {e}", self.version_url);
                return None;
            }
        };
        if response.status() != reqwest::StatusCode::OK {
            warn!(
                "Update server returned HTTP {} for {}",
                response.status(),
                self.version_url
            );
            return None;
        }
        match response.json::<RemoteVersionInfo>().await {
            Ok(info) => Some(info),
            Err(e) => {
                warn!("Invalid version metadata from {}: {e}", self.version_url);
                None
            }
        }
    }

    /// Remote info when it differs from the installed version (or nothing is installed)
    pub async fn check_for_update(&self) -> Option<RemoteVersionInfo> {
        let remote = self.available_version().await?;
        let current = self.current_version().await;
        if current.as_deref() == Some(remote.version.as_str()) {
            debug!("Companion artifact is up to date ({})", remote.version);
            return None;
        }
        info!(
            "Update available: {} -> {}",
            current.as_deref().unwrap_or("none"),
            remote.version
        );
        Some(remote)
    }
}

pub fn version_url(base_url: &str, artifact: &str) -> String {
    format!("{}/updates/{artifact}/version", base_url.trim_end_matches('/'))
}

pub fn download_url(base_url: &str, artifact: &str) -> String {
    format!("{}/updates/{artifact}/download", base_url.trim_end_matches('/'))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::artifact::test_server::serve;
    use axum::{Json, Router, http::StatusCode, routing::get};

    async fn resolver_for(router: Router, record: PathBuf) -> VersionResolver {
        let base = serve(router).await;
        VersionResolver::new(reqwest::Client::new(), &base, "flask", record)
    }

    #[tokio::test]
    async fn check_for_update_compares_against_record() {
        let dir = tempfile::tempdir().unwrap();
        let record = dir.path().join("flask-version.json");
        VersionRecord::from_api("1.2.0").store(&record).await.unwrap();

        let same = Router::new().route(
            "/updates/flask/version",
            get(|| async { Json(serde_json::json!({"version": "1.2.0", "git_hash": "abc"})) }),
        );
        let resolver = resolver_for(same, record.clone()).await;
        assert_eq!(resolver.current_version().await.as_deref(), Some("1.2.0"));
        assert!(resolver.check_for_update().await.is_none());

        let newer = Router::new().route(
            "/updates/flask/version",
            get(|| async { Json(serde_json::json!({"version": "1.3.0", "git_hash": "def"})) }),
        );
        let resolver = resolver_for(newer, record).await;
        let info = resolver.check_for_update().await.unwrap();
        assert_eq!(info.version, "1.3.0");
        assert_eq!(info.extra["git_hash"], "def");
    }

    #[tokio::test]
    async fn missing_record_means_update_available() {
        let dir = tempfile::tempdir().unwrap();
        let router = Router::new().route(
            "/updates/flask/version",
            get(|| async { Json(serde_json::json!({"version": "0.1.0"})) }),
        );
        let resolver = resolver_for(router, dir.path().join("none.json")).await;
        assert!(resolver.current_version().await.is_none());
        assert_eq!(resolver.check_for_update().await.unwrap().version, "0.1.0");
    }

    #[tokio::test]
    async fn server_errors_yield_none() {
        let dir = tempfile::tempdir().unwrap();
        let router = Router::new().route(
            "/updates/flask/version",
            get(|| async { (StatusCode::INTERNAL_SERVER_ERROR, "boom") }),
        );
        let resolver = resolver_for(router, dir.path().join("v.json")).await;
        assert!(resolver.available_version().await.is_none());
        assert!(resolver.check_for_update().await.is_none());

        let unreachable = VersionResolver::new(
            reqwest::Client::new(),
            "http://127.0.0.1:1",
            "flask",
            dir.path().join("v.json"),
        );
        assert!(unreachable.available_version().await.is_none());
    }

    #[tokio::test]
    async fn corrupt_record_reads_as_missing() {
        let dir = tempfile::tempdir().unwrap();
        let record = dir.path().join("flask-version.json");
        tokio::fs::write(&record, b"{not json").await.unwrap();
        assert!(VersionRecord::load(&record).await.is_none());
    }

    #[tokio::test]
    async fn record_uses_snake_case_wire_format() {
        let dir = tempfile::tempdir().unwrap();
        let record = dir.path().join("nested").join("flask-version.json");
        VersionRecord::from_api("2.0.0").store(&record).await.unwrap();

        let json: serde_json::Value =
            serde_json::from_slice(&std::fs::read(&record).unwrap()).unwrap();
        assert_eq!(json["version"], "2.0.0");
        assert_eq!(json["source"], "api");
        assert!(json["download_time"].is_string());
        assert!(!sibling_tmp(&record).exists());
    }
}
