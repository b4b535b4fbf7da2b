//! Runtime environment verification
//!
//! Runs once at startup, before the companion process is touched:
//! - locate an interpreter from the configured candidates
//! - read its version
//! - diff the dependency manifest against the installed packages
//! - bulk-install whatever is missing
//!
//! Every step mutates a [`CheckStatus`] and publishes it through the
//! configured [`StatusBroadcaster`].

pub mod manifest;
pub mod packages;
pub mod runtime;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use log::{error, info, warn};
use regex::Regex;

use crate::config::RuntimeConfig;
use crate::error::{Result, SupervisorError};
use crate::status::{CheckStatus, OverallStatus, StatusBroadcaster};
pub use runtime::{Interpreter, UNKNOWN_VERSION};

pub struct EnvironmentChecker {
    config: RuntimeConfig,
    manifest: PathBuf,
    version_pattern: Regex,
    status: CheckStatus,
    broadcaster: Arc<dyn StatusBroadcaster>,
}

impl EnvironmentChecker {
    pub fn new(
        config: &RuntimeConfig,
        manifest: PathBuf,
        broadcaster: Arc<dyn StatusBroadcaster>,
    ) -> Result<Self> {
        let version_pattern = Regex::new(&config.version_pattern).map_err(|e| {
            SupervisorError::Config(format!(
                "runtime.version_pattern {:?}: {e}",
                config.version_pattern
            ))
        })?;
        Ok(Self {
            config: config.clone(),
            manifest,
            version_pattern,
            status: CheckStatus::default(),
            broadcaster,
        })
    }

    /// Run the full check; the returned record is `ready` or `error`
    pub async fn check(&mut self) -> CheckStatus {
        let _ = self.run().await;
        self.status.clone()
    }

    /// Same as [`check`](Self::check), for callers that abort on failure
    pub async fn require_ready(&mut self) -> Result<Interpreter> {
        self.run().await
    }

    async fn run(&mut self) -> Result<Interpreter> {
        self.publish_initial();
        self.update(|s| {
            s.advance(OverallStatus::Checking);
        });

        let outcome = match self.run_checks().await {
            Ok(interpreter) => {
                let mut ready = false;
                self.update(|s| ready = s.advance(OverallStatus::Ready));
                if ready {
                    Ok(interpreter)
                } else {
                    let missing = self.status.dependencies.missing.join(", ");
                    Err(SupervisorError::DependencyInstallFailure(format!(
                        "dependencies still missing after install: {missing}"
                    )))
                }
            }
            Err(e) => Err(e),
        };

        match &outcome {
            Ok(interpreter) => info!(
                "Environment ready ({} {}, {} dependencies)",
                interpreter.name,
                self.status.runtime_version,
                self.status.dependencies.installed.len()
            ),
            Err(e) => {
                error!("Environment check failed: {e}");
                let message = e.to_string();
                self.update(|s| {
                    s.fail(message);
                });
            }
        }
        outcome
    }

    fn publish_initial(&mut self) {
        self.status = CheckStatus::default();
        self.broadcaster.publish(&self.status);
    }

    fn update(&mut self, mutate: impl FnOnce(&mut CheckStatus)) {
        mutate(&mut self.status);
        self.broadcaster.publish(&self.status);
    }

    async fn run_checks(&mut self) -> Result<Interpreter> {
        let interpreter = runtime::find_interpreter(&self.config.candidates, &self.config.version_flag)
            .await
            .ok_or_else(|| SupervisorError::EnvironmentMissing {
                tried: self.config.candidates.join(", "),
            })?;
        self.update(|s| s.has_runtime = true);

        let version = match interpreter.version_output(&self.config.version_flag).await {
            Ok(text) => runtime::parse_version(&text, &self.version_pattern),
            Err(e) => {
                warn!("Failed to query {} version: {e}", interpreter.name);
                UNKNOWN_VERSION.to_string()
            }
        };
        self.update(|s| s.runtime_version = version);

        let declared = manifest::load_manifest(&self.manifest).await?;
        self.classify_dependencies(&interpreter, &declared).await;

        if !self.status.dependencies.missing.is_empty() {
            self.update(|s| {
                s.advance(OverallStatus::Installing);
            });
            self.install_missing(&interpreter).await?;
        }
        Ok(interpreter)
    }

    async fn classify_dependencies(&mut self, interpreter: &Interpreter, declared: &[String]) {
        let installed = match packages::list_installed(interpreter).await {
            Ok(installed) => installed,
            Err(e) => {
                warn!("Failed to list installed packages, treating all as missing: {e}");
                self.update(|s| s.dependencies.missing.extend(declared.iter().cloned()));
                return;
            }
        };

        let delay = Duration::from_millis(self.config.item_delay_ms);
        for spec in declared {
            let present = packages::is_installed(spec, &installed);
            self.update(|s| {
                if present {
                    s.dependencies.installed.push(spec.clone());
                } else {
                    s.dependencies.missing.push(spec.clone());
                }
            });
            tokio::task::yield_now().await;
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
        }
    }

    async fn install_missing(&mut self, interpreter: &Interpreter) -> Result<()> {
        self.update(|s| s.dependencies.installing = s.dependencies.missing.clone());

        let manifest = self.manifest.clone();
        let index = self.config.package_index.clone();
        let broadcaster = Arc::clone(&self.broadcaster);
        let snapshot = self.status.clone();
        let result = packages::install_requirements(interpreter, &manifest, &index, |_line| {
            broadcaster.publish(&snapshot);
        })
        .await;

        if let Err(e) = result {
            self.update(|s| {
                let failed = std::mem::take(&mut s.dependencies.installing);
                s.dependencies.failed.extend(failed);
            });
            return Err(e);
        }

        // Confirm against a fresh listing; trust the installer if the listing fails
        let now_installed = packages::list_installed(interpreter).await.ok();
        self.update(|s| {
            s.dependencies.installing.clear();
            let missing = std::mem::take(&mut s.dependencies.missing);
            let (present, still_missing) = match &now_installed {
                Some(set) => packages::classify(&missing, set),
                None => (missing, Vec::new()),
            };
            s.dependencies.installed.extend(present);
            s.dependencies.missing = still_missing;
        });
        Ok(())
    }
}
