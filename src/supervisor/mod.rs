//! Companion process supervision
//!
//! [`ProcessSupervisor`] exclusively owns the single companion process handle.
//! `start`, `stop`, `restart` and `update` serialize on one operation lock so
//! only one lifecycle operation is in flight at a time.

pub mod process;
pub mod readiness;
pub mod state;

use std::ffi::OsString;

use log::{error, info, warn};
use tokio::sync::{Mutex, watch};

use crate::artifact::{ProgressSink, Updater};
use crate::config::{InstallForm, Layout, ServiceConfig};
use crate::environment::Interpreter;
use crate::error::{Result, SupervisorError};
pub use process::{CompanionProcess, SpawnSpec};
pub use readiness::ReadinessProber;
pub use state::{CompanionState, StateCell};

const COMPANION_NAME: &str = "companion";

pub struct ProcessSupervisor {
    config: ServiceConfig,
    layout: Layout,
    interpreter: Option<Interpreter>,
    updater: Updater,
    prober: ReadinessProber,
    state: StateCell,
    op_lock: Mutex<()>,
    process: Mutex<Option<CompanionProcess>>,
}

impl ProcessSupervisor {
    /// `interpreter` runs the entry point of archive-form artifacts
    pub fn new(config: ServiceConfig, interpreter: Option<Interpreter>) -> Result<Self> {
        let layout = config.layout();
        let updater = Updater::from_config(&config)?;
        let prober = ReadinessProber::new(
            config.companion.health_url.clone(),
            config.companion.probe_timeout(),
        )?;
        Ok(Self {
            config,
            layout,
            interpreter,
            updater,
            prober,
            state: StateCell::new(),
            op_lock: Mutex::new(()),
            process: Mutex::new(None),
        })
    }

    pub fn state(&self) -> CompanionState {
        self.state.get()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<CompanionState> {
        self.state.subscribe()
    }

    pub fn updater(&self) -> &Updater {
        &self.updater
    }

    pub fn prober(&self) -> &ReadinessProber {
        &self.prober
    }

    pub async fn pid(&self) -> Option<u32> {
        self.process.lock().await.as_ref().and_then(|p| p.pid())
    }

    /// Exit code of the current or most recent process, once it has exited
    pub async fn exit_code(&self) -> Option<i32> {
        self.process.lock().await.as_ref().and_then(|p| p.exit_code())
    }

    /// Ensure the artifact is present and current, then spawn the companion
    pub async fn start(&self) -> Result<()> {
        let _op = self.op_lock.lock().await;
        self.start_locked().await
    }

    pub async fn stop(&self) -> Result<()> {
        let _op = self.op_lock.lock().await;
        self.stop_locked().await
    }

    /// Stop, let ports and files settle, start again
    pub async fn restart(&self) -> Result<()> {
        let _op = self.op_lock.lock().await;
        info!("Restarting companion service");
        self.stop_locked().await?;
        tokio::time::sleep(self.config.companion.restart_settle()).await;
        self.start_locked().await
    }

    /// Apply an available update, stopping the companion around the swap.
    ///
    /// Returns the installed version, or `None` when already up to date. The
    /// companion is started again afterwards if it was running before, on the
    /// previous artifact when the update fails. A failed update is reported
    /// even when that restart fails too.
    pub async fn update(&self, progress: &ProgressSink) -> Result<Option<String>> {
        let _op = self.op_lock.lock().await;
        let Some(info) = self.updater.check_for_update().await else {
            return Ok(None);
        };

        let was_running = self.process.lock().await.is_some();
        self.stop_locked().await?;

        let applied = self.updater.apply(&info, progress).await;
        if let Err(e) = &applied {
            error!("Update to {} failed: {e}", info.version);
        }
        if was_running && let Err(e) = self.start_locked().await {
            if applied.is_ok() {
                return Err(e);
            }
            error!("Restart after failed update to {} also failed: {e}", info.version);
        }
        applied.map(|()| Some(info.version))
    }

    async fn start_locked(&self) -> Result<()> {
        if self.prober.probe().await {
            info!(
                "Companion service already responding at {}, not spawning",
                self.prober.url()
            );
            return Ok(());
        }

        {
            let mut slot = self.process.lock().await;
            if let Some(process) = slot.as_ref() {
                if !process.has_exited().await {
                    info!("Companion process already running");
                    return Ok(());
                }
                // Exited on its own; release the handle before spawning its replacement
                if let Some(old) = slot.take() {
                    old.terminate(
                        self.config.companion.stop_grace(),
                        self.config.companion.kill_timeout(),
                    )
                    .await?;
                }
            }
        }

        self.ensure_artifact().await?;
        let spec = self.spawn_spec()?;
        let process = process::spawn(COMPANION_NAME, &spec, &self.state)?;
        *self.process.lock().await = Some(process);
        Ok(())
    }

    async fn stop_locked(&self) -> Result<()> {
        let Some(process) = self.process.lock().await.take() else {
            return Ok(());
        };
        info!("Stopping companion service");
        if matches!(
            self.state.get(),
            CompanionState::Starting | CompanionState::Running
        ) {
            self.state.transition(CompanionState::Stopping);
        }
        let result = process
            .terminate(
                self.config.companion.stop_grace(),
                self.config.companion.kill_timeout(),
            )
            .await;
        match &result {
            Ok(code) => {
                info!("Companion stopped (exit code: {code:?})");
                self.state
                    .transition_from(CompanionState::Stopping, CompanionState::Stopped);
            }
            Err(_) => {
                self.state
                    .transition_from(CompanionState::Stopping, CompanionState::Failed);
            }
        }
        result.map(|_| ())
    }

    /// Install the artifact if absent, otherwise apply any available update
    async fn ensure_artifact(&self) -> Result<()> {
        let marker = self.layout.artifact_marker(&self.config.artifact);
        let progress = ProgressSink::default();

        if !tokio::fs::try_exists(&marker).await.unwrap_or(false) {
            info!("No companion artifact at {}, downloading", marker.display());
            self.updater.install_latest(&progress).await?;
            return Ok(());
        }

        if let Some(info) = self.updater.check_for_update().await
            && let Err(e) = self.updater.apply(&info, &progress).await
        {
            warn!("Update to {} failed, keeping installed artifact: {e}", info.version);
        }
        Ok(())
    }

    fn spawn_spec(&self) -> Result<SpawnSpec> {
        let artifact = &self.config.artifact;
        let (program, args) = match artifact.form {
            InstallForm::Binary => (self.layout.executable(artifact), Vec::new()),
            InstallForm::Archive => {
                let interpreter = self.interpreter.as_ref().ok_or_else(|| {
                    SupervisorError::Config(
                        "archive-form artifact requires a runtime interpreter".into(),
                    )
                })?;
                let entry: OsString = self.layout.install_dir.join(&artifact.entry_point).into();
                (interpreter.program.clone(), vec![entry])
            }
        };
        Ok(SpawnSpec {
            program,
            args,
            working_dir: self.layout.working_dir(artifact),
            env: self.config.companion.env.clone(),
        })
    }
}
