//! juniord - background daemon that runs coding-agent jobs.
//!
//! Library components for the daemon process and its front-ends.

pub mod agent;
pub mod control;
pub mod dispatcher;
pub mod events;
pub mod executor;
pub mod git;
pub mod hook_engine;
pub mod pid;
pub mod predicate;
pub mod recovery;
pub mod scheduler;
pub mod storage;
pub mod supervisor;
pub mod worktree;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use agent::{AgentRunner, ClaudeRunner};
use dispatcher::{Dispatcher, JobExecutor};
use events::{Change, ChangeNotifier};
use executor::Executor;
use hook_engine::HookEngine;
use junior_core::config::ConfigError;
use junior_core::{Config, Paths};
use pid::PidFile;
use scheduler::Scheduler;
use storage::{Storage, StorageError};
use supervisor::{Supervisor, SupervisorConfig};
use thiserror::Error;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

#[derive(Debug, Error)]
pub enum DaemonError {
    #[error("daemon already running (pid {0})")]
    AlreadyRunning(u32),
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
    #[error("config error: {0}")]
    Config(#[from] ConfigError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("not a git repository: {0}")]
    Git(#[from] git::GitError),
}

/// Daemon configuration.
#[derive(Debug, Clone)]
pub struct DaemonConfig {
    /// State directory layout for the repository the daemon serves.
    pub paths: Paths,
    pub config: Config,
}

impl DaemonConfig {
    /// Resolve the state directory of `repo` and load its `config.yaml`.
    pub fn load(repo: impl Into<PathBuf>) -> Result<Self, DaemonError> {
        let paths = Paths::new(repo);
        let config = Config::load(&paths.config)?;
        Ok(Self { paths, config })
    }
}

/// Daemon state.
pub struct Daemon {
    config: DaemonConfig,
    runner: Arc<dyn AgentRunner>,
    shutdown: CancellationToken,
}

impl std::fmt::Debug for Daemon {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Daemon")
            .field("config", &self.config)
            .field("shutdown", &self.shutdown.is_cancelled())
            .finish_non_exhaustive()
    }
}

impl Daemon {
    /// Create a daemon that runs the configured agent binary.
    pub fn new(config: DaemonConfig) -> Self {
        let runner = Arc::new(ClaudeRunner::new(
            config.config.agent_command.clone(),
            config.config.finalize_model.clone(),
        ));
        Self::with_runner(config, runner)
    }

    pub fn with_runner(config: DaemonConfig, runner: Arc<dyn AgentRunner>) -> Self {
        Self {
            config,
            runner,
            shutdown: CancellationToken::new(),
        }
    }

    /// Signal the daemon to shut down.
    pub fn shutdown(&self) {
        info!("shutdown requested");
        self.shutdown.cancel();
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Run until [`Daemon::shutdown`] is called, then stop gracefully.
    pub async fn run(&self) -> Result<(), DaemonError> {
        let paths = &self.config.paths;
        let config = &self.config.config;

        git::current_branch(&paths.repo)?;
        paths.ensure()?;
        if let Some(pid) = pid::check_existing(&paths.pid_file) {
            return Err(DaemonError::AlreadyRunning(pid));
        }
        let pid_file = PidFile::create(&paths.pid_file)?;

        info!(repo = %paths.repo.display(), "juniord starting");
        info!(database = %paths.db.display(), max_concurrency = config.max_concurrency, "configuration loaded");

        let storage = Storage::new(&paths.db).await?;
        storage.migrate_embedded().await?;
        let storage = Arc::new(storage);

        recovery::recover(&storage, paths).await?;
        storage.record_daemon_start(std::process::id()).await?;

        let notifier = ChangeNotifier::new(&paths.events);
        let scheduler = Arc::new(Scheduler::new(
            Arc::clone(&storage),
            notifier.clone(),
            &paths.repo,
        ));
        let hooks = Arc::new(HookEngine::new(
            Arc::clone(&storage),
            notifier.clone(),
            &paths.repo,
            config.hook_poll_interval(),
        ));
        reload_schedules(&scheduler).await;
        reload_hooks(&hooks).await;

        let token = self.shutdown.clone();
        let tasks: Vec<JoinHandle<()>> = vec![
            tokio::spawn(heartbeat(
                Arc::clone(&storage),
                config.heartbeat_interval(),
                token.clone(),
            )),
            tokio::spawn({
                let notifier = notifier.clone();
                let interval = config.poll_interval();
                let token = token.clone();
                async move { notifier.watch_external(interval, token).await }
            }),
            tokio::spawn(reload_on_change(
                notifier.subscribe(),
                Arc::clone(&scheduler),
                Arc::clone(&hooks),
                token.clone(),
            )),
        ];

        let supervisor = Supervisor::new(
            Arc::clone(&storage),
            notifier.clone(),
            SupervisorConfig::from_config(config),
        );
        let executor: Arc<dyn JobExecutor> = Arc::new(Executor::new(
            Arc::clone(&storage),
            Arc::clone(&self.runner),
            supervisor,
            notifier.clone(),
            paths,
        ));
        let dispatcher = Dispatcher::new(
            Arc::clone(&storage),
            executor,
            config.max_concurrency,
            config.poll_interval(),
        );

        dispatcher.run(token).await;

        info!("shutting down");
        for task in tasks {
            if let Err(e) = task.await {
                warn!(error = %e, "background task panicked");
            }
        }
        scheduler.stop_all().await;
        hooks.stop_all().await;

        let remaining = dispatcher.drain(config.shutdown_timeout()).await;
        if remaining > 0 {
            warn!(remaining, "exiting with jobs still running; they will be recovered on next start");
        }

        if let Err(e) = storage.clear_daemon_pid().await {
            warn!(error = %e, "failed to clear daemon pid");
        }
        if let Err(e) = pid_file.remove() {
            warn!(error = %e, "failed to remove pid file");
        }
        info!("juniord stopped");
        Ok(())
    }
}

async fn heartbeat(storage: Arc<Storage>, interval: Duration, token: CancellationToken) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            () = token.cancelled() => break,
            _ = ticker.tick() => {}
        }
        if let Err(e) = storage.record_heartbeat().await {
            warn!(error = %e, "failed to record heartbeat");
        }
    }
}

/// Reload the scheduler and hook engine when their rows change.
async fn reload_on_change(
    mut rx: tokio::sync::broadcast::Receiver<Change>,
    scheduler: Arc<Scheduler>,
    hooks: Arc<HookEngine>,
    token: CancellationToken,
) {
    loop {
        let change = tokio::select! {
            () = token.cancelled() => break,
            change = rx.recv() => change,
        };
        match change {
            Ok(Change::Jobs | Change::HookChecks) => {}
            Ok(Change::Schedules) => reload_schedules(&scheduler).await,
            Ok(Change::Hooks) => reload_hooks(&hooks).await,
            Ok(Change::External) | Err(RecvError::Lagged(_)) => {
                debug!("reloading schedules and hooks");
                reload_schedules(&scheduler).await;
                reload_hooks(&hooks).await;
            }
            Err(RecvError::Closed) => break,
        }
    }
}

async fn reload_schedules(scheduler: &Scheduler) {
    if let Err(e) = scheduler.reload().await {
        error!(error = %e, "failed to load schedules");
    }
}

async fn reload_hooks(hooks: &HookEngine) {
    if let Err(e) = hooks.reload().await {
        error!(error = %e, "failed to load hooks");
    }
}
