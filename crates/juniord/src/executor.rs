//! Per-job execution.
//!
//! The executor drives one queued job to a terminal state:
//! start (job running + new run, atomically), worktree, worker agent,
//! result, symlink removal, finalize agent, merge verification, cleanup,
//! terminal transition. Every step's outcome is persisted before the next.
//! Process handling is delegated to `supervisor.rs`.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use junior_core::naming;
use junior_core::paths::{log_file_path, worktree_path};
use junior_core::prompt::{self, FinalizeContext};
use junior_core::stream::parse_result;
use junior_core::{Job, JobStatus, Paths, TokenUsage};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use crate::agent::{self, AgentError, AgentInvocation, AgentRole, AgentRunner};
use crate::dispatcher::JobExecutor;
use crate::events::{Change, ChangeNotifier};
use crate::git::{self, GitError};
use crate::storage::{Storage, StorageError};
use crate::supervisor::{ProcessOutput, SuperviseError, Supervisor};
use crate::worktree::{self, WorktreeError};

#[derive(Debug, Error)]
pub enum JobError {
    #[error("git error: {0}")]
    Git(#[from] GitError),
    #[error("worktree error: {0}")]
    Worktree(#[from] WorktreeError),
    #[error("{0}")]
    Agent(#[from] AgentError),
    #[error("cancelled")]
    Cancelled,
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
}

impl From<SuperviseError> for JobError {
    fn from(err: SuperviseError) -> Self {
        match err {
            SuperviseError::Cancelled => Self::Cancelled,
            SuperviseError::Agent(e) => Self::Agent(e),
        }
    }
}

pub type Result<T> = std::result::Result<T, JobError>;

/// Per-job values threaded through the phases.
struct JobRun<'a> {
    job: &'a Job,
    run_id: i64,
    repo: &'a Path,
    worktree: &'a Path,
    branch: &'a str,
    log_path: &'a Path,
}

#[derive(Clone)]
pub struct Executor {
    storage: Arc<Storage>,
    runner: Arc<dyn AgentRunner>,
    supervisor: Supervisor,
    notifier: ChangeNotifier,
    worktrees_dir: PathBuf,
    logs_dir: PathBuf,
    /// Held from capturing the original branch through merge verification,
    /// so only one finalize touches a shared checkout at a time.
    finalize_lock: Arc<Mutex<()>>,
}

impl std::fmt::Debug for Executor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Executor")
            .field("worktrees_dir", &self.worktrees_dir)
            .field("logs_dir", &self.logs_dir)
            .finish_non_exhaustive()
    }
}

impl Executor {
    pub fn new(
        storage: Arc<Storage>,
        runner: Arc<dyn AgentRunner>,
        supervisor: Supervisor,
        notifier: ChangeNotifier,
        paths: &Paths,
    ) -> Self {
        Self {
            storage,
            runner,
            supervisor,
            notifier,
            worktrees_dir: paths.worktrees_dir.clone(),
            logs_dir: paths.logs_dir.clone(),
            finalize_lock: Arc::new(Mutex::new(())),
        }
    }

    /// Execute a queued job to completion.
    ///
    /// Returns the terminal status, or `None` when the job was no longer
    /// queued by the time it was picked up.
    pub async fn run_job(&self, job: Job) -> std::result::Result<Option<JobStatus>, StorageError> {
        let branch = naming::branch_for_job(&job, Utc::now());
        let Some((job, run)) = self
            .storage
            .start_job(job.id, &branch, &self.logs_dir)
            .await?
        else {
            debug!(job_id = job.id, "job no longer queued; skipping");
            return Ok(None);
        };
        self.notifier.notify(Change::Jobs);
        info!(job_id = job.id, run_id = run.id, attempt = run.attempt, branch = %branch, "job started");

        let repo = PathBuf::from(&job.repo_path);
        let worktree = worktree_path(&self.worktrees_dir, job.id);
        let log_path = run
            .log_file
            .as_ref()
            .map_or_else(|| log_file_path(&self.logs_dir, job.id, run.id), PathBuf::from);
        let ctx = JobRun {
            job: &job,
            run_id: run.id,
            repo: &repo,
            worktree: &worktree,
            branch: &branch,
            log_path: &log_path,
        };

        let outcome = self.drive(&ctx).await;
        worktree::cleanup(&repo, &worktree, Some(&branch));

        let status = match outcome {
            Ok(session_id) => {
                self.storage
                    .complete_job(job.id, run.id, session_id.as_deref())
                    .await?;
                info!(job_id = job.id, run_id = run.id, "job done");
                JobStatus::Done
            }
            Err(JobError::Cancelled) => {
                self.storage.cancel_job(job.id, run.id).await?;
                info!(job_id = job.id, run_id = run.id, "job cancelled");
                JobStatus::Cancelled
            }
            Err(e) => {
                error!(job_id = job.id, run_id = run.id, error = %e, "job failed");
                self.storage.fail_job(job.id, run.id, &e.to_string()).await?;
                JobStatus::Failed
            }
        };
        self.notifier.notify(Change::Jobs);
        Ok(Some(status))
    }

    /// Everything between start and cleanup. Returns the worker's session id.
    async fn drive(&self, ctx: &JobRun<'_>) -> Result<Option<String>> {
        let base = ctx.job.base_branch.as_str();
        worktree::prepare(ctx.repo, ctx.worktree, ctx.branch, base)?;
        let env = agent::job_env(ctx.repo, ctx.worktree, ctx.branch, base);

        let worker = self
            .invoke(
                ctx,
                AgentRole::Worker,
                prompt::worker_prompt(&ctx.job.prompt),
                ctx.worktree,
                env.clone(),
                TokenUsage::default(),
            )
            .await?;
        let mut result = parse_result(&worker.stdout).ok_or(AgentError::MissingResult)?;
        if result.usage == TokenUsage::default() {
            result.usage = worker.usage;
        }
        self.storage.record_run_result(ctx.run_id, &result).await?;
        self.notifier.notify(Change::Jobs);

        match worktree::remove_mirrored(ctx.repo, ctx.worktree) {
            Ok(removed) => debug!(job_id = ctx.job.id, removed, "removed mirrored files"),
            Err(e) => warn!(job_id = ctx.job.id, error = %e, "failed to remove mirrored files"),
        }

        let _guard = self.finalize_lock.lock().await;
        let original = git::current_branch(ctx.repo)?;
        if let Err(e) = self.finalize(ctx, env, result.usage).await {
            warn!(job_id = ctx.job.id, error = %e, "finalize failed; restoring repository");
            restore_repository(ctx.repo, &original, ctx.job.id);
            return Err(e);
        }
        Ok(result.session_id)
    }

    async fn finalize(
        &self,
        ctx: &JobRun<'_>,
        env: Vec<(String, String)>,
        base_usage: TokenUsage,
    ) -> Result<()> {
        let base = ctx.job.base_branch.as_str();
        let prompt = prompt::finalize_prompt(&FinalizeContext {
            repo_path: ctx.repo,
            worktree_path: ctx.worktree,
            branch: ctx.branch,
            base_branch: base,
            title: &ctx.job.title,
        });
        let output = self
            .invoke(ctx, AgentRole::Finalize, prompt, ctx.repo, env, base_usage)
            .await?;

        if let Some(cost) = parse_result(&output.stdout).and_then(|r| r.cost_usd) {
            if let Err(e) = self.storage.add_run_cost(ctx.run_id, cost).await {
                warn!(job_id = ctx.job.id, run_id = ctx.run_id, error = %e, "failed to record finalize cost");
            }
        }

        if !git::has_commits_ahead(ctx.worktree, base)? {
            info!(job_id = ctx.job.id, "no changes to merge");
            return Ok(());
        }
        if !git::is_branch_merged(ctx.repo, ctx.branch, base)? {
            return Err(AgentError::NotMerged {
                branch: ctx.branch.to_string(),
                base: base.to_string(),
            }
            .into());
        }
        Ok(())
    }

    /// Spawn one agent and supervise it to a successful exit.
    async fn invoke(
        &self,
        ctx: &JobRun<'_>,
        role: AgentRole,
        prompt: String,
        cwd: &Path,
        env: Vec<(String, String)>,
        base_usage: TokenUsage,
    ) -> Result<ProcessOutput> {
        let (job_id, run_id) = (ctx.job.id, ctx.run_id);
        if self.storage.is_cancel_requested(job_id).await? {
            return Err(JobError::Cancelled);
        }

        let invocation = AgentInvocation {
            role,
            prompt,
            cwd: cwd.to_path_buf(),
            env,
        };
        let child = self.runner.spawn(&invocation)?;
        let pid = child.id();
        if let Some(pid) = pid {
            if let Err(e) = self.storage.set_run_pid(run_id, pid).await {
                warn!(job_id, run_id, pid, error = %e, "failed to record pid");
            }
        }
        info!(job_id, run_id, role = role.as_str(), pid, "agent spawned");

        let output = self
            .supervisor
            .supervise(child, ctx.log_path, job_id, run_id, base_usage)
            .await?;
        if let Err(e) = self.storage.set_run_exit_code(run_id, output.exit_code).await {
            warn!(job_id, run_id, error = %e, "failed to record exit code");
        }
        if output.exit_code != 0 {
            error!(job_id, run_id, role = role.as_str(), exit_code = output.exit_code, "agent failed");
            return Err(AgentError::ExitCode {
                code: output.exit_code,
                stderr: output.stderr.trim().to_string(),
            }
            .into());
        }
        Ok(output)
    }
}

/// Put the original checkout back the way finalize found it. Each step is
/// best-effort.
fn restore_repository(repo: &Path, original_branch: &str, job_id: i64) {
    match git::is_merge_in_progress(repo) {
        Ok(true) => {
            if let Err(e) = git::abort_merge(repo) {
                warn!(job_id, error = %e, "failed to abort merge");
            }
        }
        Ok(false) => {}
        Err(e) => warn!(job_id, error = %e, "failed to check for merge in progress"),
    }

    match git::current_branch(repo) {
        Ok(current) if current != original_branch => {
            if let Err(e) = git::checkout_branch(repo, original_branch) {
                warn!(job_id, branch = original_branch, error = %e, "failed to restore original branch");
            }
        }
        Ok(_) => {}
        Err(e) => warn!(job_id, error = %e, "failed to read current branch"),
    }

    match git::pop_autostash(repo) {
        Ok(true) => info!(job_id, "restored autostash"),
        Ok(false) => {}
        Err(e) => warn!(job_id, error = %e, "failed to pop autostash"),
    }
}

#[async_trait]
impl JobExecutor for Executor {
    async fn execute(&self, job: Job) {
        let job_id = job.id;
        if let Err(e) = self.run_job(job).await {
            error!(job_id, error = %e, "job bookkeeping failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::git::tests::{run, setup_test_repo};
    use crate::storage::tests::create_test_storage;
    use crate::supervisor::SupervisorConfig;
    use junior_core::{JobOrigin, NewJob, RunStatus};
    use std::time::Duration;
    use tokio::process::Child;

    /// Runs role-specific shell scripts instead of the agent.
    struct ScriptRunner {
        worker: String,
        finalize: String,
    }

    impl AgentRunner for ScriptRunner {
        fn spawn(&self, invocation: &AgentInvocation) -> agent::Result<Child> {
            let script = match invocation.role {
                AgentRole::Worker => &self.worker,
                AgentRole::Finalize => &self.finalize,
            };
            let mut cmd = agent::agent_command("sh", invocation);
            cmd.arg("-c").arg(script);
            cmd.spawn().map_err(AgentError::Spawn)
        }
    }

    const RESULT: &str = r#"echo '{"type":"result","result":"ok","session_id":"sess-1","total_cost_usd":0.25}'"#;

    fn executor(storage: &Storage, paths: &Paths, worker: &str, finalize: &str) -> Executor {
        let storage = Arc::new(storage.clone());
        let notifier = ChangeNotifier::new(paths.events.clone());
        let config = SupervisorConfig {
            cancel_check_interval: Duration::from_millis(50),
            kill_escalation: Duration::from_millis(500),
            ..SupervisorConfig::default()
        };
        let supervisor = Supervisor::new(Arc::clone(&storage), notifier.clone(), config);
        let runner = Arc::new(ScriptRunner {
            worker: worker.to_string(),
            finalize: finalize.to_string(),
        });
        Executor::new(storage, runner, supervisor, notifier, paths)
    }

    fn manual_job(repo: &Path) -> NewJob {
        NewJob {
            title: "Add feature".to_string(),
            prompt: "add a feature".to_string(),
            repo_path: repo.to_string_lossy().into_owned(),
            base_branch: "main".to_string(),
            origin: JobOrigin::Manual,
            run_at: None,
        }
    }

    #[tokio::test]
    async fn worker_without_changes_completes() {
        let repo = setup_test_repo();
        let paths = Paths::new(repo.path());
        paths.ensure().unwrap();
        let ts = create_test_storage().await;
        let job = ts.storage.insert_job(&manual_job(repo.path())).await.unwrap();

        let exec = executor(&ts.storage, &paths, RESULT, RESULT);
        let status = exec.run_job(job.clone()).await.unwrap();
        assert_eq!(status, Some(JobStatus::Done));

        let job = ts.storage.get_job(job.id).await.unwrap();
        assert_eq!(job.status, JobStatus::Done);
        assert_eq!(job.session_id.as_deref(), Some("sess-1"));
        assert_eq!(job.branch.as_deref(), Some("junior/add-feature-1"));

        let runs = ts.storage.list_runs(job.id).await.unwrap();
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].status, RunStatus::Succeeded);
        assert_eq!(runs[0].result.as_deref(), Some("ok"));
        assert_eq!(runs[0].cost_usd, Some(0.5));
        assert_eq!(runs[0].exit_code, Some(0));
        assert!(runs[0].pid.is_some());

        assert!(!paths.worktree_for(job.id).exists());
        assert!(!git::branch_exists(repo.path(), "junior/add-feature-1").unwrap());
    }

    #[tokio::test]
    async fn worker_failure_fails_job_and_cleans_up() {
        let repo = setup_test_repo();
        let paths = Paths::new(repo.path());
        paths.ensure().unwrap();
        let ts = create_test_storage().await;
        let job = ts.storage.insert_job(&manual_job(repo.path())).await.unwrap();

        let exec = executor(&ts.storage, &paths, "echo broken >&2; exit 2", RESULT);
        assert_eq!(
            exec.run_job(job.clone()).await.unwrap(),
            Some(JobStatus::Failed)
        );

        let runs = ts.storage.list_runs(job.id).await.unwrap();
        assert_eq!(runs[0].status, RunStatus::Failed);
        assert_eq!(runs[0].exit_code, Some(2));
        let message = runs[0].error_message.as_deref().unwrap();
        assert!(message.contains("code 2"), "{message}");
        assert!(message.contains("broken"), "{message}");
        assert!(!paths.worktree_for(job.id).exists());

        let log = std::fs::read_to_string(runs[0].log_file.as_deref().unwrap()).unwrap();
        assert!(log.contains("broken"));
    }

    #[tokio::test]
    async fn missing_result_fails_job() {
        let repo = setup_test_repo();
        let paths = Paths::new(repo.path());
        paths.ensure().unwrap();
        let ts = create_test_storage().await;
        let job = ts.storage.insert_job(&manual_job(repo.path())).await.unwrap();

        let exec = executor(&ts.storage, &paths, "echo plain text", RESULT);
        assert_eq!(
            exec.run_job(job.clone()).await.unwrap(),
            Some(JobStatus::Failed)
        );
        let runs = ts.storage.list_runs(job.id).await.unwrap();
        assert!(runs[0]
            .error_message
            .as_deref()
            .unwrap()
            .contains("no result"));
    }

    #[tokio::test]
    async fn unmerged_changes_fail_and_restore() {
        let repo = setup_test_repo();
        let paths = Paths::new(repo.path());
        paths.ensure().unwrap();
        let ts = create_test_storage().await;
        let job = ts.storage.insert_job(&manual_job(repo.path())).await.unwrap();

        let worker = format!(
            "echo change > feature.txt && git add feature.txt && git commit -q -m feature && {RESULT}"
        );
        // Finalize claims success without merging.
        let exec = executor(&ts.storage, &paths, &worker, RESULT);
        assert_eq!(
            exec.run_job(job.clone()).await.unwrap(),
            Some(JobStatus::Failed)
        );
        let runs = ts.storage.list_runs(job.id).await.unwrap();
        assert!(runs[0]
            .error_message
            .as_deref()
            .unwrap()
            .contains("not merged"));
        assert_eq!(git::current_branch(repo.path()).unwrap(), "main");
        assert!(!repo.path().join("feature.txt").exists());
    }

    #[tokio::test]
    async fn cancellation_while_running_ends_cancelled() {
        let repo = setup_test_repo();
        let paths = Paths::new(repo.path());
        paths.ensure().unwrap();
        let ts = create_test_storage().await;
        let job = ts.storage.insert_job(&manual_job(repo.path())).await.unwrap();

        let worker = format!("sleep 0.3; {RESULT}");
        let exec = executor(&ts.storage, &paths, &worker, "exit 1");
        let storage = ts.storage.clone();
        let job_id = job.id;
        let watcher = tokio::spawn(async move {
            loop {
                if let Ok(j) = storage.get_job(job_id).await {
                    if j.status == JobStatus::Running {
                        storage.request_cancel(job_id).await.unwrap();
                        break;
                    }
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        });
        let status = exec.run_job(job.clone()).await.unwrap();
        watcher.await.unwrap();

        assert_eq!(status, Some(JobStatus::Cancelled));
        let job = ts.storage.get_job(job.id).await.unwrap();
        assert!(job.cancel_requested_at.is_none());
        let runs = ts.storage.list_runs(job.id).await.unwrap();
        assert_eq!(runs[0].status, RunStatus::Cancelled);
    }

    #[tokio::test]
    async fn job_no_longer_queued_is_skipped() {
        let repo = setup_test_repo();
        let paths = Paths::new(repo.path());
        paths.ensure().unwrap();
        let ts = create_test_storage().await;
        let job = ts.storage.insert_job(&manual_job(repo.path())).await.unwrap();
        ts.storage.request_cancel(job.id).await.unwrap();

        let exec = executor(&ts.storage, &paths, RESULT, RESULT);
        assert_eq!(exec.run_job(job.clone()).await.unwrap(), None);
        assert!(ts.storage.list_runs(job.id).await.unwrap().is_empty());
    }

    #[test]
    fn restore_aborts_merge_and_returns_to_original_branch() {
        let repo = setup_test_repo();
        let dir = repo.path();
        run(dir, &["checkout", "-q", "-b", "side"]);
        std::fs::write(dir.join("README.md"), "side\n").unwrap();
        run(dir, &["commit", "-q", "-am", "side"]);
        run(dir, &["checkout", "-q", "main"]);
        std::fs::write(dir.join("README.md"), "main\n").unwrap();
        run(dir, &["commit", "-q", "-am", "main"]);
        run(dir, &["checkout", "-q", "-b", "other"]);
        // Conflicting merge leaves MERGE_HEAD behind.
        let _ = std::process::Command::new("git")
            .args(["-C", &dir.to_string_lossy(), "merge", "side"])
            .output()
            .unwrap();
        assert!(git::is_merge_in_progress(dir).unwrap());

        restore_repository(dir, "main", 1);
        assert!(!git::is_merge_in_progress(dir).unwrap());
        assert_eq!(git::current_branch(dir).unwrap(), "main");
    }
}
