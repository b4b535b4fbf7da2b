//! Error taxonomy for the supervisor core
//!
//! Every operation that touches the runtime environment, the update server,
//! the artifact on disk or the companion process reports one of these
//! variants. Top-level orchestration wraps them in `anyhow` with context.

use std::path::PathBuf;

/// Errors raised by the supervisor components
#[derive(Debug, thiserror::Error)]
pub enum SupervisorError {
    /// None of the candidate interpreters responded to the version flag
    #[error("no runtime interpreter found (tried: {tried})")]
    EnvironmentMissing { tried: String },

    #[error("dependency manifest unavailable at {path}: {source}")]
    Manifest {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Package manager bulk-install failed
    #[error("dependency installation failed: {0}")]
    DependencyInstallFailure(String),

    #[error("failed to get version information from the update server")]
    VersionFetchFailure,

    #[error("artifact download failed: {0}")]
    DownloadFailure(String),

    /// Archive could not be unpacked or lacks the expected structure
    #[error("artifact extraction failed: {0}")]
    ExtractionFailure(String),

    /// Binary swap failed; the backup has been restored where possible
    #[error("atomic swap of {path} failed: {source}")]
    AtomicSwapFailure {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to spawn companion process {program}: {source}")]
    ProcessSpawnFailure {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("companion process did not exit after forced kill (PID: {pid})")]
    StopFailure { pid: u32 },

    #[error("companion service not ready after {attempts} attempts")]
    ReadinessTimeout { attempts: u32 },

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error(transparent)]
    Http(#[from] reqwest::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T, E = SupervisorError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn spawn_failure_names_program() {
        let err = SupervisorError::ProcessSpawnFailure {
            program: "/opt/flask_app".into(),
            source: std::io::Error::from(std::io::ErrorKind::NotFound),
        };
        assert!(err.to_string().starts_with("failed to spawn companion process /opt/flask_app"));
        assert!(std::error::Error::source(&err).is_some());
    }

    #[test]
    fn install_failure_carries_message() {
        let err = SupervisorError::DependencyInstallFailure("exit status: 1".into());
        assert_eq!(
            err.to_string(),
            "dependency installation failed: exit status: 1"
        );
    }
}
