//! Spawning, output capture, exit monitoring and termination of the companion

use std::collections::HashMap;
use std::ffi::OsString;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::sync::{Arc, Weak};
use std::time::Duration;

use log::{debug, error, info, warn};
use tokio::io::AsyncBufReadExt;
use tokio::process::{Child, Command};
use tokio::sync::{Mutex, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use super::state::{CompanionState, StateCell};
use crate::error::{Result, SupervisorError};

const POLL_INTERVAL: Duration = Duration::from_millis(100);
const MONITOR_INTERVAL: Duration = Duration::from_millis(500);

/// What to run and where
#[derive(Debug, Clone)]
pub struct SpawnSpec {
    pub program: PathBuf,
    pub args: Vec<OsString>,
    pub working_dir: PathBuf,
    pub env: HashMap<String, String>,
}

/// The single live companion process
pub struct CompanionProcess {
    name: String,
    pid: Option<u32>,
    child: Arc<Mutex<Option<Child>>>,
    exit_code: watch::Receiver<Option<i32>>,
    exit_tx: watch::Sender<Option<i32>>,
    stdout_task: Option<JoinHandle<()>>,
    stderr_task: Option<JoinHandle<()>>,
    monitor: JoinHandle<()>,
}

/// Spawn `spec`, forwarding its output to the log and watching for exit
pub fn spawn(name: &str, spec: &SpawnSpec, state: &StateCell) -> Result<CompanionProcess> {
    info!(
        "Starting {name}: {} (cwd {})",
        spec.program.display(),
        spec.working_dir.display()
    );
    state.transition(CompanionState::Starting);

    let mut cmd = Command::new(&spec.program);
    cmd.args(&spec.args)
        .current_dir(&spec.working_dir)
        .envs(&spec.env)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let mut child = cmd.spawn().map_err(|source| {
        state.transition(CompanionState::Failed);
        SupervisorError::ProcessSpawnFailure {
            program: spec.program.display().to_string(),
            source,
        }
    })?;

    let pid = child.id();
    info!(
        "{name} spawned (PID: {})",
        pid.map_or("unavailable".to_string(), |p| p.to_string())
    );

    let stdout_task = child.stdout.take().map(|stdout| {
        let name = name.to_string();
        tokio::spawn(async move {
            let mut lines = tokio::io::BufReader::new(stdout).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                info!("[{name}] {line}");
            }
        })
    });
    let stderr_task = child.stderr.take().map(|stderr| {
        let name = name.to_string();
        tokio::spawn(async move {
            let mut lines = tokio::io::BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                error!("[{name}] {line}");
            }
        })
    });

    let child = Arc::new(Mutex::new(Some(child)));
    let (exit_tx, exit_code) = watch::channel(None);
    let monitor = tokio::spawn(monitor_exit(
        name.to_string(),
        Arc::downgrade(&child),
        state.clone(),
        exit_tx.clone(),
    ));

    Ok(CompanionProcess {
        name: name.to_string(),
        pid,
        child,
        exit_code,
        exit_tx,
        stdout_task,
        stderr_task,
        monitor,
    })
}

fn exit_code_of(status: ExitStatus) -> i32 {
    status.code().unwrap_or(-1)
}

/// Watch the child until it exits or the handle is dropped.
///
/// An exit seen here is unexpected: `Stopped` for a clean exit, `Failed` otherwise.
async fn monitor_exit(
    name: String,
    child_weak: Weak<Mutex<Option<Child>>>,
    state: StateCell,
    exit_tx: watch::Sender<Option<i32>>,
) {
    let mut first = true;
    loop {
        tokio::time::sleep(if first { POLL_INTERVAL } else { MONITOR_INTERVAL }).await;

        let Some(child_arc) = child_weak.upgrade() else {
            debug!("{name} monitor exiting: handle dropped");
            return;
        };
        let mut guard = child_arc.lock().await;
        let Some(child) = guard.as_mut() else {
            debug!("{name} monitor exiting: child taken");
            return;
        };

        match child.try_wait() {
            Ok(Some(status)) => {
                let code = exit_code_of(status);
                exit_tx.send_replace(Some(code));
                let current = state.get();
                if status.success() {
                    info!("{name} exited cleanly (code: {code})");
                    state.transition_from(current, CompanionState::Stopped);
                } else {
                    error!("{name} exited unexpectedly: {status}");
                    state.transition_from(current, CompanionState::Failed);
                }
                return;
            }
            Ok(None) => {
                if first {
                    state.transition_from(CompanionState::Starting, CompanionState::Running);
                    first = false;
                }
            }
            Err(e) => {
                error!("{name} status check error: {e}");
                state.transition(CompanionState::Failed);
                return;
            }
        }
    }
}

impl CompanionProcess {
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Exit code once the process has been observed to exit; -1 for a signal death
    pub fn exit_code(&self) -> Option<i32> {
        *self.exit_code.borrow()
    }

    pub async fn has_exited(&self) -> bool {
        if self.exit_code().is_some() {
            return true;
        }
        let mut guard = self.child.lock().await;
        match guard.as_mut() {
            Some(child) => !matches!(child.try_wait(), Ok(None)),
            None => true,
        }
    }

    /// Ask the process to exit, escalating to a forced kill after `grace`.
    ///
    /// Returns the exit code; `StopFailure` if the kill is not honoured within `kill_timeout`.
    pub async fn terminate(self, grace: Duration, kill_timeout: Duration) -> Result<Option<i32>> {
        let taken = self.child.lock().await.take();
        self.monitor.abort();

        let result = match taken {
            Some(mut child) => shutdown_graceful(&self.name, &mut child, grace, kill_timeout).await,
            None => Ok(self.exit_code()),
        };
        if let Ok(Some(code)) = result {
            self.exit_tx.send_replace(Some(code));
        }

        // Readers end once the pipes close
        for task in [self.stdout_task, self.stderr_task].into_iter().flatten() {
            if tokio::time::timeout(Duration::from_secs(1), task).await.is_err() {
                debug!("{} output reader still draining", self.name);
            }
        }
        result
    }
}

cfg_if::cfg_if! {
    if #[cfg(unix)] {
        fn request_exit(name: &str, pid: u32) -> bool {
            use nix::sys::signal::{self, Signal};
            use nix::unistd::Pid;

            match signal::kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
                Ok(()) => {
                    info!("Sent SIGTERM to {name} (PID: {pid})");
                    true
                }
                Err(e) => {
                    warn!("Failed SIGTERM to {name}: {e}");
                    false
                }
            }
        }
    } else {
        fn request_exit(name: &str, pid: u32) -> bool {
            debug!("No graceful stop signal for {name} (PID: {pid}) on this platform");
            false
        }
    }
}

/// Poll `try_wait` until exit or `deadline`
async fn wait_until(child: &mut Child, deadline: Instant) -> std::io::Result<Option<ExitStatus>> {
    loop {
        if let Some(status) = child.try_wait()? {
            return Ok(Some(status));
        }
        if Instant::now() >= deadline {
            return Ok(None);
        }
        tokio::time::sleep(POLL_INTERVAL).await;
    }
}

async fn shutdown_graceful(
    name: &str,
    child: &mut Child,
    grace: Duration,
    kill_timeout: Duration,
) -> Result<Option<i32>> {
    if let Some(status) = child.try_wait()? {
        info!("{name} had already exited: {status}");
        return Ok(Some(exit_code_of(status)));
    }
    let Some(pid) = child.id() else {
        return Ok(None);
    };

    let start = Instant::now();
    if request_exit(name, pid) {
        if let Some(status) = wait_until(child, start + grace).await? {
            info!(
                "{name} exited gracefully in {:.2}s: {status}",
                start.elapsed().as_secs_f64()
            );
            return Ok(Some(exit_code_of(status)));
        }
        warn!(
            "{name} graceful shutdown timeout ({}s), escalating to forced kill",
            grace.as_secs()
        );
    }

    child.start_kill()?;
    warn!("Sent forced kill to {name} (PID: {pid})");
    match wait_until(child, Instant::now() + kill_timeout).await? {
        Some(status) => {
            info!("{name} terminated by forced kill: {status}");
            Ok(Some(exit_code_of(status)))
        }
        None => Err(SupervisorError::StopFailure { pid }),
    }
}
