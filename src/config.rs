use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Top‑level supervisor configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    /// Root for the installed artifact, version record and staging files
    pub data_dir: Option<String>,
    /// Base URL of the update server (`{base}/updates/<artifact>/...`)
    pub update_server: String,
    /// Local status channel binding (host:port); `None` disables it
    pub status_bind: Option<String>,
    /// How long a fatal startup error stays visible before the process exits
    pub fatal_exit_delay_secs: u64,
    pub artifact: ArtifactConfig,
    pub runtime: RuntimeConfig,
    pub companion: CompanionConfig,
    pub download: DownloadConfig,
}

/// Shape of the artifact delivered by the update server
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstallForm {
    /// Archive unpacked into the installation directory, run by the interpreter
    Archive,
    /// Single self-contained executable
    Binary,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ArtifactConfig {
    /// Artifact name used in update-server paths
    pub name: String,
    pub form: InstallForm,
    /// Executable file name for the binary form
    pub executable: String,
    /// Script run by the interpreter for the archive form, relative to the install dir
    pub entry_point: String,
    /// Entries that must exist after extracting an archive
    pub required_entries: Vec<String>,
    /// Working directory of the companion, relative to the install dir
    pub working_subdir: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Interpreter names probed in priority order
    pub candidates: Vec<String>,
    pub version_flag: String,
    /// Regex with one capture group for the semantic version
    pub version_pattern: String,
    /// Dependency manifest; defaults to `<data_dir>/requirements.txt`
    pub manifest: Option<String>,
    /// Package index mirror passed to the bulk install
    pub package_index: String,
    /// Pause after each dependency classification so the UI can follow along
    pub item_delay_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CompanionConfig {
    pub health_url: String,
    pub probe_timeout_ms: u64,
    pub ready_attempts: u32,
    pub ready_interval_ms: u64,
    pub stop_grace_secs: u64,
    pub kill_timeout_secs: u64,
    pub restart_settle_secs: u64,
    /// Extra environment for the companion process
    pub env: HashMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DownloadConfig {
    pub timeout_secs: u64,
    pub connect_timeout_secs: u64,
    /// Abort when no bytes arrive for this long
    pub inactivity_timeout_secs: u64,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            data_dir: None,
            update_server: "http://127.0.0.1:8000".into(),
            status_bind: Some("127.0.0.1:5099".into()),
            fatal_exit_delay_secs: 3,
            artifact: ArtifactConfig::default(),
            runtime: RuntimeConfig::default(),
            companion: CompanionConfig::default(),
            download: DownloadConfig::default(),
        }
    }
}

impl Default for ArtifactConfig {
    fn default() -> Self {
        Self {
            name: "flask".into(),
            form: InstallForm::Archive,
            executable: default_executable_name(),
            entry_point: "app/app.py".into(),
            required_entries: vec!["app".into(), "static".into()],
            working_subdir: Some("app".into()),
        }
    }
}

fn default_executable_name() -> String {
    if cfg!(windows) {
        "flask_app.exe".into()
    } else {
        "flask_app".into()
    }
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        let mut candidates = vec!["python3".to_string(), "python".to_string()];
        if cfg!(windows) {
            candidates.push("py".into());
        }
        Self {
            candidates,
            version_flag: "--version".into(),
            version_pattern: r"Python (\d+\.\d+\.\d+)".into(),
            manifest: None,
            package_index: "https://pypi.org/simple/".into(),
            item_delay_ms: 100,
        }
    }
}

impl Default for CompanionConfig {
    fn default() -> Self {
        let mut env = HashMap::new();
        env.insert("FLASK_ENV".to_string(), "production".to_string());
        Self {
            health_url: "http://127.0.0.1:5000/readiness".into(),
            probe_timeout_ms: 3000,
            ready_attempts: 60,
            ready_interval_ms: 3000,
            stop_grace_secs: 5,
            kill_timeout_secs: 5,
            restart_settle_secs: 2,
            env,
        }
    }
}

impl Default for DownloadConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 300,
            connect_timeout_secs: 30,
            inactivity_timeout_secs: 60,
        }
    }
}

impl CompanionConfig {
    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }

    pub fn ready_interval(&self) -> Duration {
        Duration::from_millis(self.ready_interval_ms)
    }

    pub fn stop_grace(&self) -> Duration {
        Duration::from_secs(self.stop_grace_secs)
    }

    pub fn kill_timeout(&self) -> Duration {
        Duration::from_secs(self.kill_timeout_secs)
    }

    pub fn restart_settle(&self) -> Duration {
        Duration::from_secs(self.restart_settle_secs)
    }
}

/// Resolved on-disk locations derived from the configuration
#[derive(Debug, Clone)]
pub struct Layout {
    pub data_dir: PathBuf,
    pub install_dir: PathBuf,
    pub version_file: PathBuf,
    pub manifest: PathBuf,
    /// Temporary downloads and staged directories live here, next to the install dir
    pub staging_dir: PathBuf,
}

impl Layout {
    pub fn executable(&self, artifact: &ArtifactConfig) -> PathBuf {
        self.install_dir.join(&artifact.executable)
    }

    pub fn working_dir(&self, artifact: &ArtifactConfig) -> PathBuf {
        match &artifact.working_subdir {
            Some(sub) if artifact.form == InstallForm::Archive => self.install_dir.join(sub),
            _ => self.install_dir.clone(),
        }
    }

    /// Path whose existence means "an artifact is installed"
    pub fn artifact_marker(&self, artifact: &ArtifactConfig) -> PathBuf {
        match artifact.form {
            InstallForm::Archive => self.install_dir.join(&artifact.entry_point),
            InstallForm::Binary => self.executable(artifact),
        }
    }
}

impl ServiceConfig {
    /// Default data directory, per user
    fn default_data_dir() -> PathBuf {
        dirs::data_local_dir()
            .unwrap_or_else(std::env::temp_dir)
            .join("companiond")
    }

    pub fn layout(&self) -> Layout {
        let data_dir = self
            .data_dir
            .as_ref()
            .map(PathBuf::from)
            .unwrap_or_else(Self::default_data_dir);
        self.layout_in(&data_dir)
    }

    fn layout_in(&self, data_dir: &Path) -> Layout {
        let name = &self.artifact.name;
        let manifest = self
            .runtime
            .manifest
            .as_ref()
            .map(PathBuf::from)
            .unwrap_or_else(|| data_dir.join("requirements.txt"));
        Layout {
            data_dir: data_dir.to_path_buf(),
            install_dir: data_dir.join(format!("{name}_app")),
            version_file: data_dir.join(format!("{name}-version.json")),
            manifest,
            staging_dir: data_dir.to_path_buf(),
        }
    }

    /// Default config file location in the user config directory
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("companiond").join("companiond.toml"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_round_trip_through_toml() {
        let text = toml::to_string_pretty(&ServiceConfig::default()).unwrap();
        let parsed: ServiceConfig = toml::from_str(&text).unwrap();
        assert_eq!(parsed.artifact.name, "flask");
        assert_eq!(parsed.companion.ready_attempts, 60);
        assert_eq!(parsed.companion.env.get("FLASK_ENV").unwrap(), "production");
    }

    #[test]
    fn partial_file_falls_back_to_defaults() {
        let parsed: ServiceConfig = toml::from_str(
            r#"
            update_server = "http://updates.internal"

            [artifact]
            form = "binary"
            "#,
        )
        .unwrap();
        assert_eq!(parsed.update_server, "http://updates.internal");
        assert_eq!(parsed.artifact.form, InstallForm::Binary);
        assert_eq!(parsed.artifact.name, "flask");
        assert_eq!(parsed.companion.stop_grace(), Duration::from_secs(5));
    }

    #[test]
    fn layout_places_files_under_data_dir() {
        let mut cfg = ServiceConfig::default();
        cfg.data_dir = Some("/srv/companion".into());
        let layout = cfg.layout();
        assert_eq!(layout.install_dir, PathBuf::from("/srv/companion/flask_app"));
        assert_eq!(
            layout.version_file,
            PathBuf::from("/srv/companion/flask-version.json")
        );
        assert_eq!(
            layout.artifact_marker(&cfg.artifact),
            PathBuf::from("/srv/companion/flask_app/app/app.py")
        );
        assert_eq!(
            layout.working_dir(&cfg.artifact),
            PathBuf::from("/srv/companion/flask_app/app")
        );
    }

    #[test]
    fn binary_form_runs_from_install_dir() {
        let mut cfg = ServiceConfig::default();
        cfg.data_dir = Some("/srv/companion".into());
        cfg.artifact.form = InstallForm::Binary;
        let layout = cfg.layout();
        assert_eq!(layout.working_dir(&cfg.artifact), layout.install_dir);
        assert_eq!(
            layout.artifact_marker(&cfg.artifact),
            layout.install_dir.join(&cfg.artifact.executable)
        );
    }
}
