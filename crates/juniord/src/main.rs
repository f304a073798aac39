//! juniord - background daemon that runs coding-agent jobs.
//!
//! Main entry point for the daemon binary.

use mimalloc::MiMalloc;

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

use std::fs::OpenOptions;
use std::os::unix::process::CommandExt;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::time::Duration;

use clap::{Parser, Subcommand};
use eyre::{bail, WrapErr};
use junior_core::Paths;
use juniord::control::{JobControl, StopOutcome};
use juniord::{git, pid, Daemon, DaemonConfig, DaemonError};
use tracing::{error, info};
use tracing_subscriber::{fmt, EnvFilter};

/// Extra time `stop` waits beyond the daemon's own shutdown timeout before
/// escalating to SIGKILL.
const STOP_GRACE: Duration = Duration::from_secs(5);
const START_WAIT: Duration = Duration::from_secs(5);

#[derive(Parser)]
#[command(name = "juniord", about = "Background runner for coding-agent jobs", version)]
struct Cli {
    /// Repository to serve (defaults to the one containing the current directory)
    #[arg(long, env = "JUNIOR_REPO", global = true)]
    repo: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the daemon in the foreground
    Run,
    /// Start the daemon in the background
    Start,
    /// Stop a running daemon
    Stop,
    /// Show daemon liveness and job counts
    Status,
}

fn main() -> eyre::Result<()> {
    let cli = Cli::parse();

    fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let repo = resolve_repo(cli.repo)?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .expect("failed to create tokio runtime");

    match cli.command {
        Commands::Run => runtime.block_on(run(repo)),
        Commands::Start => runtime.block_on(start(&repo)),
        Commands::Stop => runtime.block_on(stop(repo)),
        Commands::Status => runtime.block_on(status(repo)),
    }
}

fn resolve_repo(repo: Option<PathBuf>) -> eyre::Result<PathBuf> {
    let dir = match repo {
        Some(dir) => dir,
        None => std::env::current_dir().wrap_err("cannot read current directory")?,
    };
    git::repo_root(&dir).wrap_err_with(|| format!("{} is not inside a git repository", dir.display()))
}

async fn run(repo: PathBuf) -> eyre::Result<()> {
    let config = DaemonConfig::load(repo)?;
    let daemon = Daemon::new(config);

    let token = daemon.shutdown_token();
    tokio::spawn(async move {
        wait_for_signal().await;
        token.cancel();
    });

    match daemon.run().await {
        Ok(()) => Ok(()),
        Err(DaemonError::AlreadyRunning(pid)) => bail!("daemon already running (pid {pid})"),
        Err(e) => {
            error!(error = %e, "daemon failed");
            Err(e.into())
        }
    }
}

async fn wait_for_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let (mut sigterm, mut sigint) = match (
        signal(SignalKind::terminate()),
        signal(SignalKind::interrupt()),
    ) {
        (Ok(term), Ok(int)) => (term, int),
        (Err(e), _) | (_, Err(e)) => {
            error!(error = %e, "failed to register signal handlers; falling back to ctrl-c");
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };
    tokio::select! {
        _ = sigterm.recv() => info!("received SIGTERM, initiating graceful shutdown"),
        _ = sigint.recv() => info!("received SIGINT, initiating graceful shutdown"),
    }
}

/// Spawn `juniord run` detached from this terminal, logging to
/// `.junior/daemon.log`.
async fn start(repo: &Path) -> eyre::Result<()> {
    let paths = Paths::new(repo);
    paths.ensure()?;
    if let Some(pid) = pid::check_existing(&paths.pid_file) {
        println!("daemon already running (pid {pid})");
        return Ok(());
    }

    let log = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&paths.daemon_log)
        .wrap_err_with(|| format!("cannot open {}", paths.daemon_log.display()))?;
    let exe = std::env::current_exe().wrap_err("cannot locate juniord binary")?;
    let child = Command::new(exe)
        .arg("--repo")
        .arg(repo)
        .arg("run")
        .stdin(Stdio::null())
        .stdout(log.try_clone()?)
        .stderr(log)
        .process_group(0)
        .spawn()
        .wrap_err("failed to spawn daemon")?;

    let deadline = tokio::time::Instant::now() + START_WAIT;
    while tokio::time::Instant::now() < deadline {
        if let Some(pid) = pid::check_existing(&paths.pid_file) {
            println!("daemon started (pid {pid})");
            return Ok(());
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    bail!(
        "daemon (pid {}) did not come up; see {}",
        child.id(),
        paths.daemon_log.display()
    )
}

async fn stop(repo: PathBuf) -> eyre::Result<()> {
    let config = DaemonConfig::load(&repo)?;
    let control = JobControl::open(config.paths).await?;
    let timeout = config.config.shutdown_timeout() + STOP_GRACE;
    match control.stop_daemon(timeout).await? {
        StopOutcome::NotRunning => println!("daemon is not running"),
        StopOutcome::Stopped(pid) => println!("daemon stopped (pid {pid})"),
        StopOutcome::Killed(pid) => println!("daemon killed after {}s (pid {pid})", timeout.as_secs()),
    }
    Ok(())
}

async fn status(repo: PathBuf) -> eyre::Result<()> {
    let control = JobControl::open(Paths::new(repo)).await?;
    let status = control.daemon_status().await?;
    match status.pid {
        Some(pid) => println!("daemon: running (pid {pid})"),
        None => println!("daemon: stopped"),
    }
    if let Some(state) = &status.state {
        if let Some(started) = state.started_at {
            println!("started: {}", started.to_rfc3339());
        }
        if let Some(heartbeat) = state.last_heartbeat {
            println!("last heartbeat: {}", heartbeat.to_rfc3339());
        }
    }
    println!("jobs: {} running, {} queued", status.running_jobs, status.queued_jobs);
    Ok(())
}
