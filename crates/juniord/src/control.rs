//! Lifecycle operations for front-ends.
//!
//! Front-ends never talk to the daemon directly; they mutate the store
//! through [`JobControl`], which also bumps the change counter so a running
//! daemon reloads schedules and hooks.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use junior_core::naming::title_from_prompt;
use junior_core::{
    DaemonState, Hook, Job, JobOrigin, JobStatus, NewHook, NewJob, NewSchedule, Paths, Schedule,
};
use thiserror::Error;
use tracing::{info, warn};

use crate::events::{Change, ChangeNotifier};
use crate::git::{self, GitError};
use crate::pid;
use crate::predicate::{HookError, Predicate};
use crate::scheduler::{self, ScheduleError};
use crate::storage::{CancelOutcome, Storage, StorageError};
use crate::worktree;

const STOP_POLL_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Debug, Error)]
pub enum ControlError {
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error(transparent)]
    Schedule(#[from] ScheduleError),
    #[error(transparent)]
    Hook(#[from] HookError),
    #[error(transparent)]
    Git(#[from] GitError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("{0}")]
    InvalidState(String),
}

pub type Result<T> = std::result::Result<T, ControlError>;

/// Liveness snapshot for `status`.
#[derive(Debug, Clone, PartialEq)]
pub struct DaemonStatus {
    pub state: Option<DaemonState>,
    /// PID of a live daemon, from the pid file or the store.
    pub pid: Option<u32>,
    pub running_jobs: usize,
    pub queued_jobs: usize,
}

impl DaemonStatus {
    pub fn is_running(&self) -> bool {
        self.pid.is_some()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
    NotRunning,
    /// Exited after SIGTERM.
    Stopped(u32),
    /// Needed SIGKILL.
    Killed(u32),
}

#[derive(Debug, Clone)]
pub struct JobControl {
    storage: Arc<Storage>,
    notifier: ChangeNotifier,
    paths: Paths,
}

impl JobControl {
    pub fn new(storage: Arc<Storage>, notifier: ChangeNotifier, paths: Paths) -> Self {
        Self {
            storage,
            notifier,
            paths,
        }
    }

    /// Open the store under `paths`, creating and migrating it if needed.
    pub async fn open(paths: Paths) -> Result<Self> {
        paths.ensure()?;
        let storage = Storage::new(&paths.db).await?;
        storage.migrate_embedded().await?;
        let notifier = ChangeNotifier::new(&paths.events);
        Ok(Self::new(Arc::new(storage), notifier, paths))
    }

    pub fn storage(&self) -> &Arc<Storage> {
        &self.storage
    }

    pub fn paths(&self) -> &Paths {
        &self.paths
    }

    // --- Jobs ---

    /// Queue a manual job. `base` defaults to the repository's default
    /// branch.
    pub async fn enqueue(
        &self,
        prompt: &str,
        repo: &Path,
        base: Option<&str>,
        run_at: Option<DateTime<Utc>>,
    ) -> Result<Job> {
        if prompt.trim().is_empty() {
            return Err(ControlError::InvalidState("prompt is empty".to_string()));
        }
        let base_branch = match base {
            Some(base) => base.to_string(),
            None => git::default_branch(repo)?,
        };
        if !git::branch_exists(repo, &base_branch)? {
            return Err(ControlError::InvalidState(format!(
                "base branch {base_branch} does not exist"
            )));
        }
        let job = self
            .storage
            .insert_job(&NewJob {
                title: title_from_prompt(prompt),
                prompt: prompt.to_string(),
                repo_path: repo.to_string_lossy().into_owned(),
                base_branch,
                origin: JobOrigin::Manual,
                run_at,
            })
            .await?;
        info!(job_id = job.id, title = %job.title, "job enqueued");
        self.notifier.notify(Change::Jobs);
        Ok(job)
    }

    pub async fn cancel(&self, job_id: i64) -> Result<CancelOutcome> {
        let outcome = self.storage.request_cancel(job_id).await?;
        info!(job_id, ?outcome, "cancel requested");
        self.notifier.notify(Change::Jobs);
        Ok(outcome)
    }

    pub async fn retry(&self, job_id: i64) -> Result<Job> {
        let job = self.storage.retry_job(job_id).await?;
        info!(job_id, "job re-queued");
        self.notifier.notify(Change::Jobs);
        Ok(job)
    }

    /// Delete a job that is not running, along with its logs, worktree and
    /// branch. Filesystem and git cleanup is best-effort.
    pub async fn delete(&self, job_id: i64) -> Result<()> {
        let job = self.storage.get_job(job_id).await?;
        if job.status == JobStatus::Running {
            return Err(ControlError::InvalidState(format!(
                "job {job_id} is running; cancel it first"
            )));
        }

        for run in self.storage.list_runs(job_id).await? {
            let log = run
                .log_file
                .map_or_else(|| self.paths.log_file_for(job_id, run.id), Into::into);
            match std::fs::remove_file(&log) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => warn!(job_id, log = %log.display(), error = %e, "failed to remove log"),
            }
        }

        let repo = Path::new(&job.repo_path);
        let wt = self.paths.worktree_for(job_id);
        if wt.exists() {
            if let Err(e) = worktree::remove(repo, &wt) {
                warn!(job_id, error = %e, "failed to remove worktree");
            }
        }
        if let Some(branch) = job.branch.as_deref() {
            match git::branch_exists(repo, branch) {
                Ok(true) => {
                    if let Err(e) = git::delete_branch(repo, branch) {
                        warn!(job_id, branch, error = %e, "failed to delete branch");
                    }
                }
                Ok(false) => {}
                Err(e) => warn!(job_id, branch, error = %e, "failed to inspect branch"),
            }
        }
        if let Err(e) = git::prune_worktrees(repo) {
            warn!(job_id, error = %e, "failed to prune worktrees");
        }

        self.storage.delete_job(job_id).await?;
        info!(job_id, "job deleted");
        self.notifier.notify(Change::Jobs);
        Ok(())
    }

    // --- Schedules ---

    pub async fn add_schedule(&self, schedule: &NewSchedule) -> Result<Schedule> {
        let next = scheduler::next_fire_after(&schedule.cron, Utc::now())?;
        let next = if schedule.paused { None } else { next };
        let schedule = self.storage.insert_schedule(schedule, next).await?;
        info!(schedule_id = schedule.id, cron = %schedule.cron, "schedule added");
        self.notifier.notify(Change::Schedules);
        Ok(schedule)
    }

    pub async fn pause_schedule(&self, id: i64) -> Result<Schedule> {
        let schedule = self.storage.set_schedule_paused(id, true, None).await?;
        info!(schedule_id = id, "schedule paused");
        self.notifier.notify(Change::Schedules);
        Ok(schedule)
    }

    /// Resume a schedule and return its recomputed next fire time.
    pub async fn resume_schedule(&self, id: i64) -> Result<Option<DateTime<Utc>>> {
        let schedule = self.storage.get_schedule(id).await?;
        let next = scheduler::next_fire_after(&schedule.cron, Utc::now())?;
        self.storage.set_schedule_paused(id, false, next).await?;
        info!(schedule_id = id, next_run_at = ?next, "schedule resumed");
        self.notifier.notify(Change::Schedules);
        Ok(next)
    }

    // --- Hooks ---

    pub async fn add_hook(&self, hook: &NewHook) -> Result<Hook> {
        Predicate::parse(&hook.check_fn)?;
        let hook = self.storage.insert_hook(hook).await?;
        info!(hook_id = hook.id, name = %hook.name, "hook added");
        self.notifier.notify(Change::Hooks);
        Ok(hook)
    }

    pub async fn pause_hook(&self, id: i64) -> Result<Hook> {
        let hook = self.storage.set_hook_paused(id, true).await?;
        info!(hook_id = id, "hook paused");
        self.notifier.notify(Change::Hooks);
        Ok(hook)
    }

    pub async fn resume_hook(&self, id: i64) -> Result<Hook> {
        let hook = self.storage.set_hook_paused(id, false).await?;
        info!(hook_id = id, "hook resumed");
        self.notifier.notify(Change::Hooks);
        Ok(hook)
    }

    // --- Daemon ---

    pub async fn daemon_status(&self) -> Result<DaemonStatus> {
        let state = self.storage.get_daemon_state().await?;
        let pid = pid::check_existing(&self.paths.pid_file).or_else(|| {
            state
                .as_ref()
                .and_then(|s| s.pid)
                .filter(|&pid| pid::is_process_running(pid))
        });
        Ok(DaemonStatus {
            state,
            pid,
            running_jobs: self.storage.count_jobs(JobStatus::Running).await?,
            queued_jobs: self.storage.count_jobs(JobStatus::Queued).await?,
        })
    }

    /// SIGTERM the daemon, escalating to SIGKILL if it is still alive after
    /// `timeout`.
    pub async fn stop_daemon(&self, timeout: Duration) -> Result<StopOutcome> {
        let Some(pid) = pid::check_existing(&self.paths.pid_file) else {
            return Ok(StopOutcome::NotRunning);
        };
        info!(pid, "stopping daemon");
        pid::send_signal(pid, libc::SIGTERM)?;

        let deadline = tokio::time::Instant::now() + timeout;
        while tokio::time::Instant::now() < deadline {
            if !pid::is_process_running(pid) {
                return Ok(StopOutcome::Stopped(pid));
            }
            tokio::time::sleep(STOP_POLL_INTERVAL).await;
        }

        warn!(pid, "daemon ignored SIGTERM; killing");
        if let Err(e) = pid::send_signal(pid, libc::SIGKILL) {
            if e.raw_os_error() != Some(libc::ESRCH) {
                return Err(e.into());
            }
        }
        // A killed daemon cannot clean up after itself.
        if let Err(e) = std::fs::remove_file(&self.paths.pid_file) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(error = %e, "failed to remove pid file");
            }
        }
        self.storage.clear_daemon_pid().await?;
        Ok(StopOutcome::Killed(pid))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::git::tests::setup_test_repo;
    use crate::pid::PidFile;
    use tempfile::TempDir;

    struct Fixture {
        control: JobControl,
        repo: TempDir,
    }

    async fn fixture() -> Fixture {
        let repo = setup_test_repo();
        let control = JobControl::open(Paths::new(repo.path())).await.unwrap();
        Fixture { control, repo }
    }

    #[tokio::test]
    async fn enqueue_uses_prompt_title_and_default_branch() {
        let f = fixture().await;
        let before = f.control.notifier.counter();
        let job = f
            .control
            .enqueue("Fix the login bug\n\nDetails follow.", f.repo.path(), None, None)
            .await
            .unwrap();
        assert_eq!(job.title, "Fix the login bug");
        assert_eq!(job.base_branch, "main");
        assert_eq!(job.status, JobStatus::Queued);
        assert!(job.schedule_id.is_none() && job.hook_id.is_none());
        assert!(f.control.notifier.counter() > before);
    }

    #[tokio::test]
    async fn enqueue_rejects_bad_input() {
        let f = fixture().await;
        assert!(matches!(
            f.control.enqueue("  \n", f.repo.path(), None, None).await,
            Err(ControlError::InvalidState(_))
        ));
        assert!(matches!(
            f.control.enqueue("work", f.repo.path(), Some("nope"), None).await,
            Err(ControlError::InvalidState(_))
        ));
    }

    #[tokio::test]
    async fn cancel_then_retry() {
        let f = fixture().await;
        let job = f.control.enqueue("task", f.repo.path(), None, None).await.unwrap();
        assert_eq!(f.control.cancel(job.id).await.unwrap(), CancelOutcome::Cancelled);
        assert!(matches!(
            f.control.cancel(job.id).await,
            Err(ControlError::Storage(StorageError::InvalidTransition { .. }))
        ));
        let job = f.control.retry(job.id).await.unwrap();
        assert_eq!(job.status, JobStatus::Queued);
    }

    #[tokio::test]
    async fn delete_removes_artifacts() {
        let f = fixture().await;
        let storage = Arc::clone(f.control.storage());
        let paths = f.control.paths().clone();
        let job = f.control.enqueue("cleanup me", f.repo.path(), None, None).await.unwrap();

        let branch = "junior/cleanup-me-1";
        let (_, run) = storage
            .start_job(job.id, branch, &paths.logs_dir)
            .await
            .unwrap()
            .unwrap();
        let wt = paths.worktree_for(job.id);
        worktree::prepare(f.repo.path(), &wt, branch, "main").unwrap();
        let log = paths.log_file_for(job.id, run.id);
        std::fs::write(&log, "transcript\n").unwrap();

        assert!(matches!(
            f.control.delete(job.id).await,
            Err(ControlError::InvalidState(_))
        ));
        storage.fail_job(job.id, run.id, "boom").await.unwrap();

        f.control.delete(job.id).await.unwrap();
        assert!(!log.exists());
        assert!(!wt.exists());
        assert!(!git::branch_exists(f.repo.path(), branch).unwrap());
        assert!(matches!(
            storage.get_job(job.id).await,
            Err(StorageError::JobNotFound(_))
        ));
        assert!(storage.list_runs(job.id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn schedule_pause_and_resume() {
        let f = fixture().await;
        assert!(matches!(
            f.control
                .add_schedule(&NewSchedule {
                    name: "bad".to_string(),
                    cron: "every day".to_string(),
                    prompt: "p".to_string(),
                    paused: false,
                })
                .await,
            Err(ControlError::Schedule(ScheduleError::InvalidCron { .. }))
        ));

        let schedule = f
            .control
            .add_schedule(&NewSchedule {
                name: "nightly".to_string(),
                cron: "0 3 * * *".to_string(),
                prompt: "tidy up".to_string(),
                paused: false,
            })
            .await
            .unwrap();
        assert!(schedule.next_run_at.is_some_and(|t| t > Utc::now()));

        let paused = f.control.pause_schedule(schedule.id).await.unwrap();
        assert!(paused.paused);
        assert!(paused.next_run_at.is_none());

        let next = f.control.resume_schedule(schedule.id).await.unwrap();
        assert!(next.is_some());
        let resumed = f.control.storage().get_schedule(schedule.id).await.unwrap();
        assert!(!resumed.paused);
        assert_eq!(resumed.next_run_at, next);
    }

    #[tokio::test]
    async fn hooks_validate_predicates() {
        let f = fixture().await;
        let mut hook = NewHook {
            name: "todo".to_string(),
            check_fn: "{".to_string(),
            prompt: "p".to_string(),
            paused: false,
        };
        assert!(matches!(
            f.control.add_hook(&hook).await,
            Err(ControlError::Hook(HookError::InvalidPredicate(_)))
        ));

        hook.check_fn = r#"{"op":"always"}"#.to_string();
        let hook = f.control.add_hook(&hook).await.unwrap();
        assert!(f.control.pause_hook(hook.id).await.unwrap().paused);
        assert!(!f.control.resume_hook(hook.id).await.unwrap().paused);
    }

    #[tokio::test]
    async fn status_counts_jobs_and_reports_liveness() {
        let f = fixture().await;
        let storage = Arc::clone(f.control.storage());
        f.control.enqueue("one", f.repo.path(), None, None).await.unwrap();
        let two = f.control.enqueue("two", f.repo.path(), None, None).await.unwrap();
        storage
            .start_job(two.id, "junior/two-2", &f.control.paths().logs_dir)
            .await
            .unwrap();

        let status = f.control.daemon_status().await.unwrap();
        assert!(!status.is_running());
        assert_eq!(status.queued_jobs, 1);
        assert_eq!(status.running_jobs, 1);

        let _pid_file = PidFile::create(&f.control.paths().pid_file).unwrap();
        storage.record_daemon_start(std::process::id()).await.unwrap();
        let status = f.control.daemon_status().await.unwrap();
        assert_eq!(status.pid, Some(std::process::id()));
        assert_eq!(status.state.and_then(|s| s.pid), Some(std::process::id()));
    }

    #[tokio::test]
    async fn stop_without_daemon_is_noop() {
        let f = fixture().await;
        assert_eq!(
            f.control.stop_daemon(Duration::from_millis(100)).await.unwrap(),
            StopOutcome::NotRunning
        );
    }

    async fn spawn_fake_daemon(script: &str, pid_file: &Path) -> u32 {
        let mut child = tokio::process::Command::new("sh")
            .args(["-c", script])
            .kill_on_drop(true)
            .spawn()
            .unwrap();
        let pid = child.id().unwrap();
        std::fs::write(pid_file, pid.to_string()).unwrap();
        // Reap it so the pid disappears once it exits.
        tokio::spawn(async move {
            let _ = child.wait().await;
        });
        pid
    }

    #[tokio::test]
    async fn stop_sends_sigterm() {
        let f = fixture().await;
        let pid = spawn_fake_daemon("exec sleep 30", &f.control.paths().pid_file).await;
        assert_eq!(
            f.control.stop_daemon(Duration::from_secs(5)).await.unwrap(),
            StopOutcome::Stopped(pid)
        );
    }

    #[tokio::test]
    async fn stop_escalates_to_sigkill() {
        let f = fixture().await;
        let pid_file = f.control.paths().pid_file.clone();
        let pid = spawn_fake_daemon("trap '' TERM; while :; do sleep 0.1; done", &pid_file).await;
        // Let the shell install its trap.
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(
            f.control.stop_daemon(Duration::from_millis(300)).await.unwrap(),
            StopOutcome::Killed(pid)
        );
        assert!(!pid_file.exists());
    }
}
