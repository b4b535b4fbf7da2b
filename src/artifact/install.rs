//! Placement of a staged artifact at its canonical location
//!
//! Both install forms keep the previous artifact under a backup name for the
//! duration of the swap, so the canonical path always ends up holding either
//! the new artifact or the original one. The version record is written last.

use std::io;
use std::path::{Path, PathBuf};

use log::{info, warn};

use super::extract::{extract_archive, verify_entries};
use super::version::VersionRecord;
use crate::config::{ArtifactConfig, InstallForm, Layout};
use crate::error::{Result, SupervisorError};

pub struct Installer {
    artifact: ArtifactConfig,
    layout: Layout,
}

impl Installer {
    pub fn new(artifact: ArtifactConfig, layout: Layout) -> Self {
        Self { artifact, layout }
    }

    /// Place the staged file and record `version` as installed
    pub async fn install(&self, staged: &Path, version: &str) -> Result<()> {
        match self.artifact.form {
            InstallForm::Archive => {
                install_archive(staged, &self.layout.install_dir, &self.artifact.required_entries)
                    .await?
            }
            InstallForm::Binary => {
                tokio::fs::create_dir_all(&self.layout.install_dir).await?;
                swap_binary(staged, &self.layout.executable(&self.artifact)).await?
            }
        }
        VersionRecord::from_api(version)
            .store(&self.layout.version_file)
            .await?;
        info!("Installed companion artifact version {version}");
        Ok(())
    }
}

/// `<stem>_backup<.ext>` next to the target
pub fn binary_backup_path(target: &Path) -> PathBuf {
    let stem = target
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    let name = match target.extension() {
        Some(ext) => format!("{stem}_backup.{}", ext.to_string_lossy()),
        None => format!("{stem}_backup"),
    };
    target.with_file_name(name)
}

/// Replace `target` with a copy of `staged`, rolling back to the original on failure
pub async fn swap_binary(staged: &Path, target: &Path) -> Result<()> {
    let backup = binary_backup_path(target);
    let had_original = tokio::fs::try_exists(target).await.unwrap_or(false);

    if had_original {
        if tokio::fs::try_exists(&backup).await.unwrap_or(false) {
            tokio::fs::remove_file(&backup).await.map_err(|source| {
                SupervisorError::AtomicSwapFailure {
                    path: backup.clone(),
                    source,
                }
            })?;
        }
        tokio::fs::rename(target, &backup)
            .await
            .map_err(|source| SupervisorError::AtomicSwapFailure {
                path: target.to_path_buf(),
                source,
            })?;
    }

    match place_executable(staged, target).await {
        Ok(()) => {
            if had_original && let Err(e) = tokio::fs::remove_file(&backup).await {
                warn!("Failed to remove backup {}: {e}", backup.display());
            }
            Ok(())
        }
        Err(source) => {
            let _ = tokio::fs::remove_file(target).await;
            if had_original && let Err(e) = tokio::fs::rename(&backup, target).await {
                warn!(
                    "Failed to restore {} from backup {}: {e}",
                    target.display(),
                    backup.display()
                );
            }
            Err(SupervisorError::AtomicSwapFailure {
                path: target.to_path_buf(),
                source,
            })
        }
    }
}

async fn place_executable(staged: &Path, target: &Path) -> io::Result<()> {
    tokio::fs::copy(staged, target).await?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mut perms = tokio::fs::metadata(target).await?.permissions();
        perms.set_mode(0o755);
        tokio::fs::set_permissions(target, perms).await?;
    }
    Ok(())
}

fn sibling_dir(dir: &Path, suffix: &str) -> PathBuf {
    let mut name = dir.file_name().unwrap_or_default().to_os_string();
    name.push(suffix);
    dir.with_file_name(name)
}

/// Extract into a staging directory, verify it, then swap it in for `install_dir`
pub async fn install_archive(staged: &Path, install_dir: &Path, required: &[String]) -> Result<()> {
    let staging = sibling_dir(install_dir, &format!(".staging-{}", uuid::Uuid::new_v4()));
    let backup = sibling_dir(install_dir, ".backup");

    let unpacked = async {
        extract_archive(staged, &staging).await?;
        verify_entries(&staging, required).await
    }
    .await;
    if let Err(e) = unpacked {
        let _ = tokio::fs::remove_dir_all(&staging).await;
        return Err(e);
    }

    if tokio::fs::try_exists(&backup).await.unwrap_or(false) {
        tokio::fs::remove_dir_all(&backup).await?;
    }
    let had_original = tokio::fs::try_exists(install_dir).await.unwrap_or(false);
    if had_original && let Err(source) = tokio::fs::rename(install_dir, &backup).await {
        let _ = tokio::fs::remove_dir_all(&staging).await;
        return Err(SupervisorError::AtomicSwapFailure {
            path: install_dir.to_path_buf(),
            source,
        });
    }

    if let Err(source) = tokio::fs::rename(&staging, install_dir).await {
        let _ = tokio::fs::remove_dir_all(&staging).await;
        if had_original && let Err(e) = tokio::fs::rename(&backup, install_dir).await {
            warn!("Failed to restore {} from backup: {e}", install_dir.display());
        }
        return Err(SupervisorError::AtomicSwapFailure {
            path: install_dir.to_path_buf(),
            source,
        });
    }

    if had_original && let Err(e) = tokio::fs::remove_dir_all(&backup).await {
        warn!("Failed to remove backup {}: {e}", backup.display());
    }
    Ok(())
}
