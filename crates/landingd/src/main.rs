//! landingd - task finalize and PR reconciliation daemon
//!
//! Main entry point for the daemon binary.

use mimalloc::MiMalloc;

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

use std::path::PathBuf;

use clap::Parser;
use eyre::WrapErr;
use landingd::{Daemon, DaemonConfig};
use tracing::{error, info};
use tracing_subscriber::{fmt, EnvFilter};

#[derive(Parser)]
#[command(name = "landingd", about = "Task finalize and PR reconciliation daemon", version)]
struct Cli {
    /// Port to listen on
    #[arg(short, long, default_value = "7710")]
    port: u16,

    /// SQLite database path
    #[arg(long)]
    db_path: Option<PathBuf>,

    /// Workspace of the default project
    #[arg(short, long)]
    workspace: Option<PathBuf>,

    /// Config file applied after <workspace>/.landing/config
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Keep tasks in memory only
    #[arg(long)]
    ephemeral: bool,

    /// Bearer token required by the HTTP API
    #[arg(long, env = "LANDINGD_AUTH_TOKEN")]
    auth_token: Option<String>,

    /// Additional project as name=path (repeatable)
    #[arg(long = "project", value_parser = parse_pair)]
    projects: Vec<(String, String)>,

    /// Config override as key=value (repeatable)
    #[arg(long = "set", value_parser = parse_pair)]
    overrides: Vec<(String, String)>,
}

fn parse_pair(value: &str) -> Result<(String, String), String> {
    match value.split_once('=') {
        Some((key, val)) if !key.trim().is_empty() => {
            Ok((key.trim().to_string(), val.trim().to_string()))
        }
        _ => Err(format!("expected key=value, got '{value}'")),
    }
}

impl Cli {
    fn into_config(self) -> DaemonConfig {
        let defaults = DaemonConfig::default();
        DaemonConfig {
            port: self.port,
            db_path: self.db_path.unwrap_or(defaults.db_path),
            workspace_root: self.workspace.unwrap_or(defaults.workspace_root),
            config_path: self.config,
            auth_token: self.auth_token,
            ephemeral: self.ephemeral,
            projects: self
                .projects
                .into_iter()
                .map(|(name, path)| (name, PathBuf::from(path)))
                .collect(),
            overrides: self.overrides,
        }
    }
}

fn main() -> eyre::Result<()> {
    let cli = Cli::parse();

    // Initialize tracing.
    fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = cli.into_config();

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .wrap_err("failed to create tokio runtime")?;

    runtime.block_on(async {
        let daemon = Daemon::new(config)
            .await
            .wrap_err("failed to initialize daemon")?;

        let run = daemon.run();
        tokio::pin!(run);

        tokio::select! {
            result = &mut run => return finish(result),
            signal = shutdown_signal() => {
                signal?;
                info!("initiating graceful shutdown");
                daemon.shutdown();
            }
        }
        finish(run.await)
    })
}

fn finish(result: Result<(), landingd::DaemonError>) -> eyre::Result<()> {
    result.map_err(|e| {
        error!("daemon error: {e}");
        eyre::Report::new(e)
    })
}

#[cfg(unix)]
async fn shutdown_signal() -> eyre::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};
    let mut sigterm =
        signal(SignalKind::terminate()).wrap_err("failed to register SIGTERM handler")?;
    let mut sigint =
        signal(SignalKind::interrupt()).wrap_err("failed to register SIGINT handler")?;

    tokio::select! {
        _ = sigint.recv() => info!("received SIGINT"),
        _ = sigterm.recv() => info!("received SIGTERM"),
    }
    Ok(())
}

#[cfg(not(unix))]
async fn shutdown_signal() -> eyre::Result<()> {
    tokio::signal::ctrl_c()
        .await
        .wrap_err("failed to listen for ctrl-c")?;
    info!("received ctrl-c");
    Ok(())
}
