//! Versioned companion artifact: resolve, fetch, verify, install

pub mod download;
pub mod extract;
pub mod install;
pub mod progress;
pub mod version;

use std::time::Duration;

use log::{debug, info};

use crate::config::ServiceConfig;
use crate::error::{Result, SupervisorError};
pub use download::ArtifactFetcher;
pub use install::Installer;
pub use progress::{ProgressSink, UpdatePhase, UpdateProgress};
pub use version::{RemoteVersionInfo, VersionResolver};

/// Metadata requests are small; keep them well under the download timeout
const METADATA_TIMEOUT: Duration = Duration::from_secs(30);

/// The update pipeline; callers stop the companion before [`Updater::apply`]
pub struct Updater {
    resolver: VersionResolver,
    fetcher: ArtifactFetcher,
    installer: Installer,
}

impl Updater {
    pub fn from_config(config: &ServiceConfig) -> Result<Self> {
        let layout = config.layout();
        let download = &config.download;
        let connect_timeout = Duration::from_secs(download.connect_timeout_secs);

        let metadata_client = reqwest::Client::builder()
            .connect_timeout(connect_timeout)
            .timeout(METADATA_TIMEOUT)
            .build()?;
        let download_client = reqwest::Client::builder()
            .connect_timeout(connect_timeout)
            .timeout(Duration::from_secs(download.timeout_secs))
            .build()?;

        Ok(Self {
            resolver: VersionResolver::new(
                metadata_client,
                &config.update_server,
                &config.artifact.name,
                layout.version_file.clone(),
            ),
            fetcher: ArtifactFetcher::new(
                download_client,
                version::download_url(&config.update_server, &config.artifact.name),
                layout.staging_dir.clone(),
                Duration::from_secs(download.inactivity_timeout_secs),
            ),
            installer: Installer::new(config.artifact.clone(), layout),
        })
    }

    pub fn resolver(&self) -> &VersionResolver {
        &self.resolver
    }

    pub async fn check_for_update(&self) -> Option<RemoteVersionInfo> {
        self.resolver.check_for_update().await
    }

    /// Resolve the latest version and install it regardless of what is recorded
    pub async fn install_latest(&self, progress: &ProgressSink) -> Result<String> {
        progress.send(UpdateProgress::phase(UpdatePhase::Resolving, None));
        let info = self
            .resolver
            .available_version()
            .await
            .ok_or(SupervisorError::VersionFetchFailure)?;
        self.apply(&info, progress).await?;
        Ok(info.version)
    }

    /// Download, verify and install `info`; the staged file is gone when this returns
    pub async fn apply(&self, info: &RemoteVersionInfo, progress: &ProgressSink) -> Result<()> {
        let version = Some(info.version.clone());
        info!("Updating companion artifact to {}", info.version);

        let session = self.fetcher.fetch(Some(&info.version), progress).await?;
        debug!(
            "Staged {} bytes (expected {:?}) at {}, sha256 {}",
            session.downloaded_bytes,
            session.total_bytes,
            session.path().display(),
            session.sha256()
        );

        if let Some(expected) = &info.sha256 {
            progress.send(UpdateProgress::phase(UpdatePhase::Verifying, version.clone()));
            session.verify_sha256(expected)?;
        }

        progress.send(UpdateProgress::phase(UpdatePhase::Installing, version.clone()));
        self.installer.install(session.path(), &info.version).await?;
        drop(session);

        progress.send(UpdateProgress::phase(UpdatePhase::Complete, version));
        Ok(())
    }
}


#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::artifact::extract::fixtures::write_zip;
    use crate::artifact::version::VersionRecord;
    use crate::config::Layout;
    use axum::{Json, Router, routing::get};
    use sha2::{Digest, Sha256};

    /// Update server offering `version` with a zip holding `app/app.py` and `static/`
    pub(crate) async fn update_server(version: &str, sha256: Option<String>) -> String {
        let dir = tempfile::tempdir().unwrap();
        let archive = dir.path().join("artifact.zip");
        write_zip(
            &archive,
            &[("app/app.py", version.as_bytes()), ("static/index.html", b"<html/>")],
        );
        let bytes = std::fs::read(&archive).unwrap();
        let meta = serde_json::json!({
            "version": version,
            "git_hash": "abc123",
            "package_type": "zip",
            "sha256": sha256.unwrap_or_else(|| hex::encode(Sha256::digest(&bytes))),
        });
        let router = Router::new()
            .route("/updates/flask/version", get(move || async move { Json(meta) }))
            .route("/updates/flask/download", get(move || async move { bytes }));
        test_server::serve(router).await
    }

    pub(crate) fn config_in(dir: &std::path::Path, base: &str) -> (ServiceConfig, Layout) {
        let mut cfg = ServiceConfig::default();
        cfg.data_dir = Some(dir.display().to_string());
        cfg.update_server = base.to_string();
        let layout = cfg.layout();
        (cfg, layout)
    }

    #[tokio::test]
    async fn install_latest_runs_whole_pipeline() {
        let dir = tempfile::tempdir().unwrap();
        let base = update_server("1.3.0", None).await;
        let (cfg, layout) = config_in(dir.path(), &base);
        let updater = Updater::from_config(&cfg).unwrap();

        let (tx, mut rx) = tokio::sync::mpsc::channel(64);
        let version = updater.install_latest(&ProgressSink::new(Some(tx))).await.unwrap();
        assert_eq!(version, "1.3.0");
        assert_eq!(
            std::fs::read(layout.artifact_marker(&cfg.artifact)).unwrap(),
            b"1.3.0"
        );
        assert_eq!(
            updater.resolver().current_version().await.as_deref(),
            Some("1.3.0")
        );
        assert!(updater.check_for_update().await.is_none());

        let mut phases = Vec::new();
        while let Ok(p) = rx.try_recv() {
            if phases.last() != Some(&p.phase) {
                phases.push(p.phase);
            }
        }
        assert_eq!(
            phases,
            vec![
                UpdatePhase::Resolving,
                UpdatePhase::Downloading,
                UpdatePhase::Verifying,
                UpdatePhase::Installing,
                UpdatePhase::Complete
            ]
        );
    }

    #[tokio::test]
    async fn checksum_mismatch_keeps_previous_artifact() {
        let dir = tempfile::tempdir().unwrap();
        let base = update_server("1.3.0", Some("deadbeef".into())).await;
        let (cfg, layout) = config_in(dir.path(), &base);
        VersionRecord::from_api("1.2.0")
            .store(&layout.version_file)
            .await
            .unwrap();

        let updater = Updater::from_config(&cfg).unwrap();
        let info = updater.check_for_update().await.unwrap();
        let err = updater.apply(&info, &ProgressSink::default()).await.unwrap_err();
        assert!(matches!(err, SupervisorError::DownloadFailure(_)), "{err}");
        assert_eq!(
            updater.resolver().current_version().await.as_deref(),
            Some("1.2.0")
        );
        assert!(!layout.install_dir.exists());
    }

    #[tokio::test]
    async fn unreachable_server_is_version_fetch_failure() {
        let dir = tempfile::tempdir().unwrap();
        let (cfg, _) = config_in(dir.path(), "http://127.0.0.1:1");
        let updater = Updater::from_config(&cfg).unwrap();
        let err = updater.install_latest(&ProgressSink::default()).await.unwrap_err();
        assert!(matches!(err, SupervisorError::VersionFetchFailure));
    }
}
