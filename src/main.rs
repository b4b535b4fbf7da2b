mod artifact;
mod cli;
mod config;
mod environment;
mod error;
mod ipc;
mod manager;
mod status;
mod supervisor;

use std::fs;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use clap::Parser;
use indicatif::{ProgressBar, ProgressStyle};
use log::{error, info};
use tokio::sync::mpsc;

use artifact::{ProgressSink, UpdatePhase, UpdateProgress, Updater};
use config::ServiceConfig;
use environment::EnvironmentChecker;
use manager::Manager;
use status::LogBroadcaster;
use supervisor::ReadinessProber;

fn main() {
    // Initialize logger with custom format for daemon
    env_logger::Builder::from_default_env()
        .format(|buf, record| {
            use std::io::Write;
            writeln!(
                buf,
                "[{} {} {}:{}] {}",
                buf.timestamp_millis(),
                record.level(),
                record.file().unwrap_or("unknown"),
                record.line().unwrap_or(0),
                record.args()
            )
        })
        .filter_level(log::LevelFilter::Info)
        .parse_default_env()
        .init();

    let rt = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("FATAL: Failed to create Tokio runtime: {e}");
            std::process::exit(1);
        }
    };
    if let Err(e) = rt.block_on(real_main()) {
        error!("{e:#}");
        std::process::exit(1);
    }
}

async fn real_main() -> Result<()> {
    let args = cli::Args::parse();
    let cfg = load_config(args.config)?;

    match args.sub.unwrap_or(cli::Cmd::Run) {
        cli::Cmd::Run => run_supervisor(cfg).await,
        cli::Cmd::Check => handle_check(&cfg).await,
        cli::Cmd::Update { force } => handle_update(&cfg, force).await,
        cli::Cmd::Version => handle_version(&cfg).await,
    }
}

/// Read the config, writing the defaults first when the file does not exist
fn load_config(config_path: Option<String>) -> Result<ServiceConfig> {
    let cfg_path = match config_path {
        Some(path) => PathBuf::from(path),
        None => ServiceConfig::default_path()
            .ok_or_else(|| anyhow::anyhow!("Could not determine config directory"))?,
    };

    if !cfg_path.exists() {
        info!(
            "Config not found at {}, creating default configuration",
            cfg_path.display()
        );
        if let Some(parent) = cfg_path.parent() {
            fs::create_dir_all(parent).context("Failed to create config directory")?;
        }
        let default_toml = toml::to_string_pretty(&ServiceConfig::default())
            .context("Failed to serialize default config")?;
        fs::write(&cfg_path, default_toml).context("Failed to write config file")?;
        info!("Created default configuration at {}", cfg_path.display());
    }

    let cfg_str = fs::read_to_string(&cfg_path)
        .with_context(|| format!("Failed to read config file {}", cfg_path.display()))?;
    let cfg: ServiceConfig = toml::from_str(&cfg_str).context("Failed to parse config")?;
    info!("Using config from: {}", cfg_path.display());
    Ok(cfg)
}

async fn run_supervisor(cfg: ServiceConfig) -> Result<()> {
    manager::install_signal_handlers()?;
    info!("companiond starting (pid {})", std::process::id());
    Manager::new(cfg).run().await
}

/// Handle check command - environment check only
async fn handle_check(cfg: &ServiceConfig) -> Result<()> {
    let mut checker = EnvironmentChecker::new(
        &cfg.runtime,
        cfg.layout().manifest,
        Arc::new(LogBroadcaster::default()),
    )?;
    let status = checker.check().await;
    println!(
        "{}",
        serde_json::to_string_pretty(&status).context("Failed to serialize status")?
    );
    if !status.is_ready() {
        std::process::exit(1);
    }
    Ok(())
}

/// Handle update command - apply an update with a progress bar
async fn handle_update(cfg: &ServiceConfig, force: bool) -> Result<()> {
    let updater = Updater::from_config(cfg)?;

    let prober = ReadinessProber::new(
        cfg.companion.health_url.clone(),
        cfg.companion.probe_timeout(),
    )?;
    if prober.probe().await {
        bail!(
            "Companion is responding at {}; stop it first or update the running supervisor through POST /updates/apply",
            prober.url()
        );
    }

    let pb = ProgressBar::new(0);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("[{bar:50.green/blue}] {bytes}/{total_bytes}  {msg}")
            .context("Invalid progress bar template")?
            .progress_chars("█▓░"),
    );

    let (tx, mut rx) = mpsc::channel::<UpdateProgress>(100);
    let pb_clone = pb.clone();
    let progress_task = tokio::spawn(async move {
        while let Some(progress) = rx.recv().await {
            let version = progress.version.as_deref().unwrap_or("latest");
            match progress.phase {
                UpdatePhase::Resolving => pb_clone.set_message("Checking update server"),
                UpdatePhase::Downloading => {
                    if let Some(total) = progress.total_bytes {
                        pb_clone.set_length(total);
                    }
                    pb_clone.set_position(progress.bytes_downloaded);
                    pb_clone.set_message(format!("Downloading {version}"));
                }
                UpdatePhase::Verifying => pb_clone.set_message(format!("Verifying {version}")),
                UpdatePhase::Installing => pb_clone.set_message(format!("Installing {version}")),
                UpdatePhase::Complete => pb_clone.set_message(format!("Installed {version}")),
            }
        }
    });

    let sink = ProgressSink::new(Some(tx));
    let result = if force {
        updater.install_latest(&sink).await.map(Some)
    } else {
        match updater.check_for_update().await {
            Some(info) => updater.apply(&info, &sink).await.map(|()| Some(info.version)),
            None => Ok(None),
        }
    };
    drop(sink);
    let _ = progress_task.await;

    match result.context("Update failed")? {
        Some(version) => pb.finish_with_message(format!("Installed {version}")),
        None => {
            pb.finish_and_clear();
            println!("Companion artifact is up to date");
        }
    }
    Ok(())
}

/// Handle version command - installed vs available
async fn handle_version(cfg: &ServiceConfig) -> Result<()> {
    let updater = Updater::from_config(cfg)?;
    let resolver = updater.resolver();
    let current = resolver.current_version().await;
    let available = resolver.available_version().await;

    println!("installed: {}", current.as_deref().unwrap_or("none"));
    match available {
        Some(info) => {
            let marker = if Some(&info.version) != current.as_ref() {
                " (update available)"
            } else {
                ""
            };
            println!("available: {}{marker}", info.version);
        }
        None => println!("available: unknown (update server unreachable)"),
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::artifact::test_server::serve;
    use crate::artifact::tests::{config_in, update_server};
    use crate::artifact::version::VersionRecord;
    use axum::{Router, routing::get};

    #[tokio::test]
    async fn update_refuses_while_companion_responds() {
        let dir = tempfile::tempdir().unwrap();
        let base = update_server("1.3.0", None).await;
        let health = serve(Router::new().route("/readiness", get(|| async { "ok" }))).await;
        let (mut cfg, layout) = config_in(dir.path(), &base);
        cfg.companion.health_url = format!("{health}/readiness");

        let marker = layout.artifact_marker(&cfg.artifact);
        std::fs::create_dir_all(marker.parent().unwrap()).unwrap();
        std::fs::write(&marker, "RUNNING v1.2.0").unwrap();
        VersionRecord::from_api("1.2.0")
            .store(&layout.version_file)
            .await
            .unwrap();

        let err = handle_update(&cfg, false).await.unwrap_err();
        assert!(format!("{err:#}").contains("/updates/apply"), "{err:#}");
        assert_eq!(std::fs::read_to_string(&marker).unwrap(), "RUNNING v1.2.0");
        let record = VersionRecord::load(&layout.version_file).await.unwrap();
        assert_eq!(record.version, "1.2.0");
    }

    #[tokio::test]
    async fn update_installs_when_companion_is_down() {
        let dir = tempfile::tempdir().unwrap();
        let base = update_server("1.3.0", None).await;
        let (mut cfg, layout) = config_in(dir.path(), &base);
        cfg.companion.health_url = "http://127.0.0.1:1/readiness".into();
        cfg.companion.probe_timeout_ms = 200;
        VersionRecord::from_api("1.2.0")
            .store(&layout.version_file)
            .await
            .unwrap();

        handle_update(&cfg, false).await.unwrap();
        assert_eq!(
            std::fs::read(layout.artifact_marker(&cfg.artifact)).unwrap(),
            b"1.3.0"
        );
        let record = VersionRecord::load(&layout.version_file).await.unwrap();
        assert_eq!(record.version, "1.3.0");
    }
}
