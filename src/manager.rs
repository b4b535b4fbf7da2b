use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use log::{error, info, warn};

use crate::config::ServiceConfig;
use crate::environment::EnvironmentChecker;
use crate::error::SupervisorError;
use crate::ipc::{self, ChannelState};
use crate::status::WatchBroadcaster;
use crate::supervisor::{CompanionState, ProcessSupervisor};

/// Signal polling cadence
const SIGNAL_POLL: Duration = Duration::from_millis(200);

/// Top-level run loop: check the environment, start the companion, wait until
/// it is ready, then keep it until SIGINT / SIGTERM.
pub struct Manager {
    config: ServiceConfig,
    status: Arc<WatchBroadcaster>,
    channel: ChannelState,
}

impl Manager {
    pub fn new(config: ServiceConfig) -> Self {
        let status = Arc::new(WatchBroadcaster::new());
        let channel = ChannelState::new(status.clone());
        Self {
            config,
            status,
            channel,
        }
    }

    pub async fn run(self) -> Result<()> {
        if let Some(bind) = &self.config.status_bind {
            ipc::serve(bind, self.channel.clone())
                .await
                .with_context(|| format!("Failed to bind status channel on {bind}"))?;
        }

        let layout = self.config.layout();
        info!("Data directory: {}", layout.data_dir.display());
        let mut checker =
            EnvironmentChecker::new(&self.config.runtime, layout.manifest.clone(), self.status.clone())?;
        let interpreter = match checker.require_ready().await {
            Ok(interpreter) => interpreter,
            Err(e) => return self.fatal(e).await,
        };

        let supervisor = Arc::new(ProcessSupervisor::new(self.config.clone(), Some(interpreter))?);
        self.channel.attach_supervisor(supervisor.clone());

        if let Err(e) = supervisor.start().await {
            return self.fatal(e).await;
        }

        let companion = &self.config.companion;
        tokio::select! {
            ready = supervisor.prober().wait_until_ready(companion.ready_attempts, companion.ready_interval()) => {
                if !ready {
                    if let Err(e) = supervisor.stop().await {
                        warn!("Failed to stop unresponsive companion: {e}");
                    }
                    return self.fatal(SupervisorError::ReadinessTimeout {
                        attempts: companion.ready_attempts,
                    })
                    .await;
                }
            }
            sig = wait_for_signal() => {
                info!("signal {sig} during startup – orderly shutdown");
                return shutdown(&supervisor).await;
            }
        }

        info!("companiond running (pid {})", std::process::id());
        let mut state_rx = supervisor.subscribe_state();
        loop {
            tokio::select! {
                sig = wait_for_signal() => {
                    info!("signal {sig} – orderly shutdown");
                    break;
                }
                changed = state_rx.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    let state = *state_rx.borrow_and_update();
                    if state == CompanionState::Failed {
                        error!(
                            "Companion process failed (exit code: {:?})",
                            supervisor.exit_code().await
                        );
                    }
                }
            }
        }
        shutdown(&supervisor).await
    }

    /// Keep the failure visible on the status channel for a moment, then bail out
    async fn fatal(&self, e: SupervisorError) -> Result<()> {
        error!("Fatal: {e}");
        tokio::time::sleep(Duration::from_secs(self.config.fatal_exit_delay_secs)).await;
        Err(anyhow!(e))
    }
}

async fn shutdown(supervisor: &ProcessSupervisor) -> Result<()> {
    supervisor
        .stop()
        .await
        .context("Failed to stop companion process")?;
    info!("companiond exiting");
    Ok(())
}

async fn wait_for_signal() -> &'static str {
    loop {
        if let Some(sig) = check_signals() {
            return sig;
        }
        tokio::time::sleep(SIGNAL_POLL).await;
    }
}

// Cheap, polling-based signal handling (lock-free).
static RECEIVED_SIGNAL: std::sync::atomic::AtomicUsize = std::sync::atomic::AtomicUsize::new(0);

cfg_if::cfg_if! {
    if #[cfg(unix)] {
        pub fn install_signal_handlers() -> Result<()> {
            use nix::sys::signal::{self, Signal};
            extern "C" fn handler(sig: i32) {
                RECEIVED_SIGNAL.store(sig as usize, std::sync::atomic::Ordering::SeqCst);
            }
            for sig in [Signal::SIGINT, Signal::SIGTERM] {
                let action = signal::SigAction::new(
                    signal::SigHandler::Handler(handler),
                    signal::SaFlags::empty(),
                    signal::SigSet::empty(),
                );
                // SAFETY: the handler only stores to an atomic
                let registered = unsafe { signal::sigaction(sig, &action) };
                registered
                    .map_err(|e| anyhow!("Failed to register {} handler: {e}", sig.as_str()))?;
            }
            Ok(())
        }

        /// Non-blocking check – returns the signal name once.
        fn check_signals() -> Option<&'static str> {
            use nix::sys::signal::Signal;
            let val = RECEIVED_SIGNAL.swap(0, std::sync::atomic::Ordering::AcqRel);
            if val == 0 {
                return None;
            }
            match Signal::try_from(val as i32) {
                Ok(sig) => Some(sig.as_str()),
                Err(e) => {
                    error!("Invalid signal number {val} from signal handler: {e}");
                    None
                }
            }
        }
    } else {
        pub fn install_signal_handlers() -> Result<()> {
            tokio::spawn(async {
                if tokio::signal::ctrl_c().await.is_ok() {
                    RECEIVED_SIGNAL.store(1, std::sync::atomic::Ordering::SeqCst);
                }
            });
            Ok(())
        }

        fn check_signals() -> Option<&'static str> {
            (RECEIVED_SIGNAL.swap(0, std::sync::atomic::Ordering::AcqRel) != 0).then_some("ctrl-c")
        }
    }
}
