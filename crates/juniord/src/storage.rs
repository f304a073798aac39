//! SQLite storage for the junior daemon.
//!
//! The Store is the single source of truth for jobs, runs, schedules, hooks
//! and daemon liveness. Every multi-row transition is committed in one
//! transaction so front-ends reading the same database never observe a
//! half-applied state change.
//! Schema lives in `migrations/`; see `recovery.rs` for the crash-time helpers.

use std::path::Path;
use std::time::Duration;

use chrono::{DateTime, Utc};
use junior_core::paths::log_file_path;
use junior_core::stream::AgentResult;
use junior_core::{
    DaemonState, Hook, Job, JobOrigin, JobStatus, NewHook, NewJob, NewSchedule, Run, RunStatus,
    Schedule, TokenUsage,
};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{Pool, Sqlite, SqliteConnection};
use thiserror::Error;

/// Explicit column lists keep row mapping independent of column order
/// (ALTER TABLE appends columns at the end).
const JOBS_COLUMNS: &str = "id, title, status, prompt, repo_path, base_branch, branch, \
    schedule_id, hook_id, run_at, session_id, cancel_requested_at, created_at, updated_at";

const RUNS_COLUMNS: &str = "id, job_id, attempt, status, session_id, result, pid, log_file, \
    exit_code, error_message, cost_usd, input_tokens, output_tokens, started_at, finished_at, \
    updated_at";

const SCHEDULES_COLUMNS: &str =
    "id, name, cron, paused, prompt, last_run_at, next_run_at, created_at";

const HOOKS_COLUMNS: &str = "id, name, check_fn, prompt, state_json, paused, last_checked_at, \
    last_triggered_at, created_at";

/// Embedded migrations, applied in order and recorded by tag.
const MIGRATIONS: &[(&str, &str)] = &[
    ("0001_init", include_str!("../../../migrations/0001_init.sql")),
    ("0002_hooks", include_str!("../../../migrations/0002_hooks.sql")),
];

/// Error message stored on a run the user cancelled.
pub const CANCELLED_MESSAGE: &str = "cancelled by user";

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("migration {tag} failed: {source}")]
    Migration {
        tag: &'static str,
        source: sqlx::Error,
    },
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("io error: {0}")]
    Io(String),
    #[error("job not found: {0}")]
    JobNotFound(i64),
    #[error("run not found: {0}")]
    RunNotFound(i64),
    #[error("schedule not found: {0}")]
    ScheduleNotFound(i64),
    #[error("hook not found: {0}")]
    HookNotFound(i64),
    #[error("job {job_id} is {status}; cannot {action}")]
    InvalidTransition {
        job_id: i64,
        status: JobStatus,
        action: &'static str,
    },
}

pub type Result<T> = std::result::Result<T, StorageError>;

/// Outcome of a cancel request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelOutcome {
    /// The job was queued and is now cancelled; no run was created.
    Cancelled,
    /// The job is running; the executor will observe the request.
    Requested,
}

fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

fn from_ms(value: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(value).unwrap_or_default()
}

/// Storage backend for the daemon.
#[derive(Debug, Clone)]
pub struct Storage {
    pool: Pool<Sqlite>,
}

impl Storage {
    /// Open (creating if needed) the database at `db_path`.
    pub async fn new(db_path: &Path) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| StorageError::Io(e.to_string()))?;
        }

        let options = SqliteConnectOptions::new()
            .filename(db_path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .foreign_keys(true)
            .busy_timeout(Duration::from_secs(5));
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;

        Ok(Self { pool })
    }

    /// Apply embedded migrations that have not been recorded yet.
    pub async fn migrate_embedded(&self) -> Result<()> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS schema_migrations (\
             tag TEXT PRIMARY KEY, applied_at INTEGER NOT NULL)",
        )
        .execute(&self.pool)
        .await?;

        for &(tag, migration_sql) in MIGRATIONS {
            let applied: Option<(String,)> =
                sqlx::query_as("SELECT tag FROM schema_migrations WHERE tag = ?1")
                    .bind(tag)
                    .fetch_optional(&self.pool)
                    .await?;
            if applied.is_some() {
                continue;
            }

            // Remove comment lines before splitting.
            let cleaned: String = migration_sql
                .lines()
                .filter(|line| !line.trim().starts_with("--"))
                .collect::<Vec<_>>()
                .join("\n");

            for statement in cleaned.split(';') {
                let trimmed = statement.trim();
                if trimmed.is_empty() {
                    continue;
                }
                if let Err(e) = sqlx::query(trimmed).execute(&self.pool).await {
                    let msg = e.to_string();
                    // A half-applied migration from an older build may have
                    // created some objects already.
                    if !msg.contains("duplicate column") && !msg.contains("already exists") {
                        return Err(StorageError::Migration { tag, source: e });
                    }
                }
            }

            sqlx::query("INSERT INTO schema_migrations (tag, applied_at) VALUES (?1, ?2)")
                .bind(tag)
                .bind(now_ms())
                .execute(&self.pool)
                .await?;
        }
        Ok(())
    }

    // --- Job operations ---

    /// Insert a queued job.
    pub async fn insert_job(&self, job: &NewJob) -> Result<Job> {
        let mut conn = self.pool.acquire().await?;
        let id = insert_job_row(&mut *conn, job, now_ms()).await?;
        drop(conn);
        self.get_job(id).await
    }

    pub async fn get_job(&self, id: i64) -> Result<Job> {
        let query = format!("SELECT {JOBS_COLUMNS} FROM jobs WHERE id = ?1");
        let row = sqlx::query_as::<_, JobRow>(&query)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or(StorageError::JobNotFound(id))?;
        Ok(row.into_job())
    }

    /// List jobs oldest first, optionally filtered by status.
    pub async fn list_jobs(&self, status: Option<JobStatus>) -> Result<Vec<Job>> {
        let rows = match status {
            Some(status) => {
                let query = format!(
                    "SELECT {JOBS_COLUMNS} FROM jobs WHERE status = ?1 \
                     ORDER BY created_at ASC, id ASC"
                );
                sqlx::query_as::<_, JobRow>(&query)
                    .bind(status.as_str())
                    .fetch_all(&self.pool)
                    .await?
            }
            None => {
                let query =
                    format!("SELECT {JOBS_COLUMNS} FROM jobs ORDER BY created_at ASC, id ASC");
                sqlx::query_as::<_, JobRow>(&query)
                    .fetch_all(&self.pool)
                    .await?
            }
        };
        Ok(rows.into_iter().map(JobRow::into_job).collect())
    }

    /// Queued jobs whose deferred start has passed, in FIFO order.
    pub async fn list_dispatchable_jobs(&self, now: DateTime<Utc>) -> Result<Vec<Job>> {
        let query = format!(
            "SELECT {JOBS_COLUMNS} FROM jobs \
             WHERE status = 'queued' AND (run_at IS NULL OR run_at <= ?1) \
             ORDER BY created_at ASC, id ASC"
        );
        let rows = sqlx::query_as::<_, JobRow>(&query)
            .bind(now.timestamp_millis())
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.into_iter().map(JobRow::into_job).collect())
    }

    pub async fn count_jobs(&self, status: JobStatus) -> Result<usize> {
        let count: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM jobs WHERE status = ?1")
            .bind(status.as_str())
            .fetch_one(&self.pool)
            .await?;
        Ok(count.0 as usize)
    }

    /// Whether a hook already has work queued or in progress.
    pub async fn has_active_hook_job(&self, hook_id: i64) -> Result<bool> {
        let count: (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM jobs WHERE hook_id = ?1 AND status IN ('queued', 'running')",
        )
        .bind(hook_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(count.0 > 0)
    }

    /// Mark a queued job running with its branch and open a new run.
    ///
    /// Returns `None` when the job is no longer queued (cancelled or picked up
    /// elsewhere). The attempt number continues from the job's previous runs.
    pub async fn start_job(
        &self,
        job_id: i64,
        branch: &str,
        logs_dir: &Path,
    ) -> Result<Option<(Job, Run)>> {
        let now = now_ms();
        let mut tx = self.pool.begin().await?;

        let claimed = sqlx::query(
            "UPDATE jobs SET status = 'running', branch = ?1, cancel_requested_at = NULL, \
             updated_at = ?2 WHERE id = ?3 AND status = 'queued'",
        )
        .bind(branch)
        .bind(now)
        .bind(job_id)
        .execute(&mut *tx)
        .await?;
        if claimed.rows_affected() == 0 {
            tx.rollback().await?;
            return Ok(None);
        }

        let (attempt,): (i64,) =
            sqlx::query_as("SELECT COALESCE(MAX(attempt), 0) + 1 FROM runs WHERE job_id = ?1")
                .bind(job_id)
                .fetch_one(&mut *tx)
                .await?;

        let inserted = sqlx::query(
            "INSERT INTO runs (job_id, attempt, status, started_at, updated_at) \
             VALUES (?1, ?2, 'running', ?3, ?3)",
        )
        .bind(job_id)
        .bind(attempt)
        .bind(now)
        .execute(&mut *tx)
        .await?;
        let run_id = inserted.last_insert_rowid();

        let log_file = log_file_path(logs_dir, job_id, run_id);
        sqlx::query("UPDATE runs SET log_file = ?1 WHERE id = ?2")
            .bind(log_file.to_string_lossy().into_owned())
            .bind(run_id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;

        let job = self.get_job(job_id).await?;
        let run = self.get_run(run_id).await?;
        Ok(Some((job, run)))
    }

    /// Whether cancellation has been requested for a job.
    pub async fn is_cancel_requested(&self, job_id: i64) -> Result<bool> {
        let row: Option<(Option<i64>,)> =
            sqlx::query_as("SELECT cancel_requested_at FROM jobs WHERE id = ?1")
                .bind(job_id)
                .fetch_optional(&self.pool)
                .await?;
        match row {
            Some((requested,)) => Ok(requested.is_some()),
            None => Err(StorageError::JobNotFound(job_id)),
        }
    }

    /// Cancel a queued job outright or flag a running one.
    pub async fn request_cancel(&self, job_id: i64) -> Result<CancelOutcome> {
        let now = now_ms();
        let mut tx = self.pool.begin().await?;

        let cancelled = sqlx::query(
            "UPDATE jobs SET status = 'cancelled', updated_at = ?1 \
             WHERE id = ?2 AND status = 'queued'",
        )
        .bind(now)
        .bind(job_id)
        .execute(&mut *tx)
        .await?;
        if cancelled.rows_affected() > 0 {
            tx.commit().await?;
            return Ok(CancelOutcome::Cancelled);
        }

        let flagged = sqlx::query(
            "UPDATE jobs SET cancel_requested_at = ?1, updated_at = ?1 \
             WHERE id = ?2 AND status = 'running'",
        )
        .bind(now)
        .bind(job_id)
        .execute(&mut *tx)
        .await?;
        if flagged.rows_affected() > 0 {
            tx.commit().await?;
            return Ok(CancelOutcome::Requested);
        }

        let status = job_status(&mut *tx, job_id).await?;
        tx.rollback().await?;
        Err(StorageError::InvalidTransition {
            job_id,
            status,
            action: "cancel",
        })
    }

    /// Re-queue a terminal job. Previous runs are left untouched.
    pub async fn retry_job(&self, job_id: i64) -> Result<Job> {
        let now = now_ms();
        let mut tx = self.pool.begin().await?;
        let result = sqlx::query(
            "UPDATE jobs SET status = 'queued', run_at = NULL, branch = NULL, \
             cancel_requested_at = NULL, updated_at = ?1 \
             WHERE id = ?2 AND status IN ('done', 'failed', 'cancelled')",
        )
        .bind(now)
        .bind(job_id)
        .execute(&mut *tx)
        .await?;

        if result.rows_affected() == 0 {
            let status = job_status(&mut *tx, job_id).await?;
            tx.rollback().await?;
            return Err(StorageError::InvalidTransition {
                job_id,
                status,
                action: "retry",
            });
        }
        tx.commit().await?;
        self.get_job(job_id).await
    }

    /// Delete a job and its runs. Refused while the job is running.
    pub async fn delete_job(&self, job_id: i64) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        let status = job_status(&mut *tx, job_id).await?;
        if status == JobStatus::Running {
            tx.rollback().await?;
            return Err(StorageError::InvalidTransition {
                job_id,
                status,
                action: "delete",
            });
        }
        sqlx::query("DELETE FROM runs WHERE job_id = ?1")
            .bind(job_id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM jobs WHERE id = ?1")
            .bind(job_id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    /// Terminal success: job done, run finished.
    pub async fn complete_job(
        &self,
        job_id: i64,
        run_id: i64,
        session_id: Option<&str>,
    ) -> Result<()> {
        let now = now_ms();
        let mut tx = self.pool.begin().await?;
        sqlx::query(
            "UPDATE runs SET status = 'succeeded', finished_at = ?1, updated_at = ?1 WHERE id = ?2",
        )
        .bind(now)
        .bind(run_id)
        .execute(&mut *tx)
        .await?;
        sqlx::query(
            "UPDATE jobs SET status = 'done', session_id = COALESCE(?1, session_id), \
             cancel_requested_at = NULL, updated_at = ?2 WHERE id = ?3",
        )
        .bind(session_id)
        .bind(now)
        .bind(job_id)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(())
    }

    /// Terminal failure for both the run and the job.
    pub async fn fail_job(&self, job_id: i64, run_id: i64, message: &str) -> Result<()> {
        self.finish_job(job_id, run_id, RunStatus::Failed, JobStatus::Failed, message)
            .await
    }

    /// Terminal cancellation for both the run and the job.
    pub async fn cancel_job(&self, job_id: i64, run_id: i64) -> Result<()> {
        self.finish_job(
            job_id,
            run_id,
            RunStatus::Cancelled,
            JobStatus::Cancelled,
            CANCELLED_MESSAGE,
        )
        .await
    }

    async fn finish_job(
        &self,
        job_id: i64,
        run_id: i64,
        run_status: RunStatus,
        job_status: JobStatus,
        message: &str,
    ) -> Result<()> {
        let now = now_ms();
        let mut tx = self.pool.begin().await?;
        sqlx::query(
            "UPDATE runs SET status = ?1, error_message = ?2, finished_at = ?3, updated_at = ?3 \
             WHERE id = ?4",
        )
        .bind(run_status.as_str())
        .bind(message)
        .bind(now)
        .bind(run_id)
        .execute(&mut *tx)
        .await?;
        sqlx::query(
            "UPDATE jobs SET status = ?1, cancel_requested_at = NULL, updated_at = ?2 \
             WHERE id = ?3",
        )
        .bind(job_status.as_str())
        .bind(now)
        .bind(job_id)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(())
    }

    // --- Run operations ---

    pub async fn get_run(&self, id: i64) -> Result<Run> {
        let query = format!("SELECT {RUNS_COLUMNS} FROM runs WHERE id = ?1");
        let row = sqlx::query_as::<_, RunRow>(&query)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or(StorageError::RunNotFound(id))?;
        Ok(row.into_run())
    }

    /// Runs of a job, oldest attempt first.
    pub async fn list_runs(&self, job_id: i64) -> Result<Vec<Run>> {
        let query =
            format!("SELECT {RUNS_COLUMNS} FROM runs WHERE job_id = ?1 ORDER BY attempt ASC");
        let rows = sqlx::query_as::<_, RunRow>(&query)
            .bind(job_id)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.into_iter().map(RunRow::into_run).collect())
    }

    pub async fn set_run_pid(&self, run_id: i64, pid: u32) -> Result<()> {
        let result = sqlx::query("UPDATE runs SET pid = ?1, updated_at = ?2 WHERE id = ?3")
            .bind(i64::from(pid))
            .bind(now_ms())
            .bind(run_id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(StorageError::RunNotFound(run_id));
        }
        Ok(())
    }

    pub async fn set_run_exit_code(&self, run_id: i64, exit_code: i32) -> Result<()> {
        let result = sqlx::query("UPDATE runs SET exit_code = ?1, updated_at = ?2 WHERE id = ?3")
            .bind(exit_code)
            .bind(now_ms())
            .bind(run_id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(StorageError::RunNotFound(run_id));
        }
        Ok(())
    }

    /// Overwrite the run's token totals.
    pub async fn update_run_usage(&self, run_id: i64, usage: TokenUsage) -> Result<()> {
        let result = sqlx::query(
            "UPDATE runs SET input_tokens = ?1, output_tokens = ?2, updated_at = ?3 WHERE id = ?4",
        )
        .bind(usage.input_tokens as i64)
        .bind(usage.output_tokens as i64)
        .bind(now_ms())
        .bind(run_id)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(StorageError::RunNotFound(run_id));
        }
        Ok(())
    }

    /// Persist the worker's final result and mark the run succeeded.
    pub async fn record_run_result(&self, run_id: i64, result: &AgentResult) -> Result<()> {
        let outcome = sqlx::query(
            "UPDATE runs SET status = 'succeeded', session_id = ?1, result = ?2, cost_usd = ?3, \
             input_tokens = ?4, output_tokens = ?5, updated_at = ?6 WHERE id = ?7",
        )
        .bind(result.session_id.as_deref())
        .bind(&result.result)
        .bind(result.cost_usd)
        .bind(result.usage.input_tokens as i64)
        .bind(result.usage.output_tokens as i64)
        .bind(now_ms())
        .bind(run_id)
        .execute(&self.pool)
        .await?;
        if outcome.rows_affected() == 0 {
            return Err(StorageError::RunNotFound(run_id));
        }
        Ok(())
    }

    /// Add the finalize invocation's cost to the run.
    pub async fn add_run_cost(&self, run_id: i64, cost_usd: f64) -> Result<()> {
        sqlx::query(
            "UPDATE runs SET cost_usd = COALESCE(cost_usd, 0) + ?1, updated_at = ?2 WHERE id = ?3",
        )
        .bind(cost_usd)
        .bind(now_ms())
        .bind(run_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    // --- Recovery ---

    /// Mark an orphaned running job failed. Returns false if it was not running.
    pub async fn fail_orphaned_job(&self, job_id: i64) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE jobs SET status = 'failed', cancel_requested_at = NULL, updated_at = ?1 \
             WHERE id = ?2 AND status = 'running'",
        )
        .bind(now_ms())
        .bind(job_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Fail every run still marked running. Returns how many were touched.
    pub async fn fail_running_runs(&self, message: &str) -> Result<u64> {
        let now = now_ms();
        let result = sqlx::query(
            "UPDATE runs SET status = 'failed', error_message = ?1, finished_at = ?2, \
             updated_at = ?2 WHERE status = 'running'",
        )
        .bind(message)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    // --- Schedule operations ---

    pub async fn insert_schedule(
        &self,
        schedule: &NewSchedule,
        next_run_at: Option<DateTime<Utc>>,
    ) -> Result<Schedule> {
        let result = sqlx::query(
            "INSERT INTO schedules (name, cron, paused, prompt, next_run_at, created_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        )
        .bind(&schedule.name)
        .bind(&schedule.cron)
        .bind(schedule.paused)
        .bind(&schedule.prompt)
        .bind(next_run_at.map(|t| t.timestamp_millis()))
        .bind(now_ms())
        .execute(&self.pool)
        .await?;
        self.get_schedule(result.last_insert_rowid()).await
    }

    pub async fn get_schedule(&self, id: i64) -> Result<Schedule> {
        let query = format!("SELECT {SCHEDULES_COLUMNS} FROM schedules WHERE id = ?1");
        let row = sqlx::query_as::<_, ScheduleRow>(&query)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or(StorageError::ScheduleNotFound(id))?;
        Ok(row.into_schedule())
    }

    pub async fn list_schedules(&self) -> Result<Vec<Schedule>> {
        let query = format!("SELECT {SCHEDULES_COLUMNS} FROM schedules ORDER BY id ASC");
        let rows = sqlx::query_as::<_, ScheduleRow>(&query)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.into_iter().map(ScheduleRow::into_schedule).collect())
    }

    pub async fn list_active_schedules(&self) -> Result<Vec<Schedule>> {
        let query =
            format!("SELECT {SCHEDULES_COLUMNS} FROM schedules WHERE paused = 0 ORDER BY id ASC");
        let rows = sqlx::query_as::<_, ScheduleRow>(&query)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.into_iter().map(ScheduleRow::into_schedule).collect())
    }

    pub async fn set_schedule_paused(
        &self,
        id: i64,
        paused: bool,
        next_run_at: Option<DateTime<Utc>>,
    ) -> Result<Schedule> {
        let result =
            sqlx::query("UPDATE schedules SET paused = ?1, next_run_at = ?2 WHERE id = ?3")
                .bind(paused)
                .bind(next_run_at.map(|t| t.timestamp_millis()))
                .bind(id)
                .execute(&self.pool)
                .await?;
        if result.rows_affected() == 0 {
            return Err(StorageError::ScheduleNotFound(id));
        }
        self.get_schedule(id).await
    }

    pub async fn set_schedule_next_run(
        &self,
        id: i64,
        next_run_at: Option<DateTime<Utc>>,
    ) -> Result<()> {
        let result = sqlx::query("UPDATE schedules SET next_run_at = ?1 WHERE id = ?2")
            .bind(next_run_at.map(|t| t.timestamp_millis()))
            .bind(id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(StorageError::ScheduleNotFound(id));
        }
        Ok(())
    }

    /// Enqueue the job produced by a schedule firing and advance the schedule.
    pub async fn record_schedule_fire(
        &self,
        schedule_id: i64,
        job: &NewJob,
        fired_at: DateTime<Utc>,
        next_run_at: Option<DateTime<Utc>>,
    ) -> Result<Job> {
        let mut tx = self.pool.begin().await?;
        let job_id = insert_job_row(&mut *tx, job, fired_at.timestamp_millis()).await?;
        let result =
            sqlx::query("UPDATE schedules SET last_run_at = ?1, next_run_at = ?2 WHERE id = ?3")
                .bind(fired_at.timestamp_millis())
                .bind(next_run_at.map(|t| t.timestamp_millis()))
                .bind(schedule_id)
                .execute(&mut *tx)
                .await?;
        if result.rows_affected() == 0 {
            tx.rollback().await?;
            return Err(StorageError::ScheduleNotFound(schedule_id));
        }
        tx.commit().await?;
        self.get_job(job_id).await
    }

    // --- Hook operations ---

    pub async fn insert_hook(&self, hook: &NewHook) -> Result<Hook> {
        let result = sqlx::query(
            "INSERT INTO hooks (name, check_fn, prompt, state_json, paused, created_at) \
             VALUES (?1, ?2, ?3, '{}', ?4, ?5)",
        )
        .bind(&hook.name)
        .bind(&hook.check_fn)
        .bind(&hook.prompt)
        .bind(hook.paused)
        .bind(now_ms())
        .execute(&self.pool)
        .await?;
        self.get_hook(result.last_insert_rowid()).await
    }

    pub async fn get_hook(&self, id: i64) -> Result<Hook> {
        let query = format!("SELECT {HOOKS_COLUMNS} FROM hooks WHERE id = ?1");
        let row = sqlx::query_as::<_, HookRow>(&query)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or(StorageError::HookNotFound(id))?;
        Ok(row.into_hook())
    }

    pub async fn list_hooks(&self) -> Result<Vec<Hook>> {
        let query = format!("SELECT {HOOKS_COLUMNS} FROM hooks ORDER BY id ASC");
        let rows = sqlx::query_as::<_, HookRow>(&query)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.into_iter().map(HookRow::into_hook).collect())
    }

    pub async fn list_active_hooks(&self) -> Result<Vec<Hook>> {
        let query = format!("SELECT {HOOKS_COLUMNS} FROM hooks WHERE paused = 0 ORDER BY id ASC");
        let rows = sqlx::query_as::<_, HookRow>(&query)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.into_iter().map(HookRow::into_hook).collect())
    }

    pub async fn set_hook_paused(&self, id: i64, paused: bool) -> Result<Hook> {
        let result = sqlx::query("UPDATE hooks SET paused = ?1 WHERE id = ?2")
            .bind(paused)
            .bind(id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(StorageError::HookNotFound(id));
        }
        self.get_hook(id).await
    }

    /// Persist the outcome of a check that did not fire.
    pub async fn record_hook_check(
        &self,
        hook_id: i64,
        state_json: &str,
        checked_at: DateTime<Utc>,
    ) -> Result<()> {
        let result =
            sqlx::query("UPDATE hooks SET state_json = ?1, last_checked_at = ?2 WHERE id = ?3")
                .bind(state_json)
                .bind(checked_at.timestamp_millis())
                .bind(hook_id)
                .execute(&self.pool)
                .await?;
        if result.rows_affected() == 0 {
            return Err(StorageError::HookNotFound(hook_id));
        }
        Ok(())
    }

    /// Persist a check that fired: hook state plus the new job.
    pub async fn record_hook_trigger(
        &self,
        hook_id: i64,
        state_json: &str,
        job: &NewJob,
        triggered_at: DateTime<Utc>,
    ) -> Result<Job> {
        let at = triggered_at.timestamp_millis();
        let mut tx = self.pool.begin().await?;
        let result = sqlx::query(
            "UPDATE hooks SET state_json = ?1, last_checked_at = ?2, last_triggered_at = ?2 \
             WHERE id = ?3",
        )
        .bind(state_json)
        .bind(at)
        .bind(hook_id)
        .execute(&mut *tx)
        .await?;
        if result.rows_affected() == 0 {
            tx.rollback().await?;
            return Err(StorageError::HookNotFound(hook_id));
        }
        let job_id = insert_job_row(&mut *tx, job, at).await?;
        tx.commit().await?;
        self.get_job(job_id).await
    }

    // --- Daemon state ---

    pub async fn record_daemon_start(&self, pid: u32) -> Result<()> {
        let now = now_ms();
        sqlx::query(
            "INSERT INTO daemon_state (id, pid, started_at, last_heartbeat) VALUES (1, ?1, ?2, ?2) \
             ON CONFLICT(id) DO UPDATE SET pid = excluded.pid, started_at = excluded.started_at, \
             last_heartbeat = excluded.last_heartbeat",
        )
        .bind(i64::from(pid))
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn record_heartbeat(&self) -> Result<()> {
        sqlx::query("UPDATE daemon_state SET last_heartbeat = ?1 WHERE id = 1")
            .bind(now_ms())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn clear_daemon_pid(&self) -> Result<()> {
        sqlx::query("UPDATE daemon_state SET pid = NULL WHERE id = 1")
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn get_daemon_state(&self) -> Result<Option<DaemonState>> {
        let row: Option<(Option<i64>, Option<i64>, Option<i64>)> = sqlx::query_as(
            "SELECT pid, started_at, last_heartbeat FROM daemon_state WHERE id = 1",
        )
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|(pid, started_at, last_heartbeat)| DaemonState {
            pid: pid.map(|p| p as u32),
            started_at: started_at.map(from_ms),
            last_heartbeat: last_heartbeat.map(from_ms),
        }))
    }
}

async fn insert_job_row(conn: &mut SqliteConnection, job: &NewJob, now: i64) -> Result<i64> {
    let (schedule_id, hook_id) = match job.origin {
        JobOrigin::Manual => (None, None),
        JobOrigin::Schedule(id) => (Some(id), None),
        JobOrigin::Hook(id) => (None, Some(id)),
    };
    let result = sqlx::query(
        "INSERT INTO jobs (title, status, prompt, repo_path, base_branch, schedule_id, hook_id, \
         run_at, created_at, updated_at) \
         VALUES (?1, 'queued', ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?8)",
    )
    .bind(&job.title)
    .bind(&job.prompt)
    .bind(&job.repo_path)
    .bind(&job.base_branch)
    .bind(schedule_id)
    .bind(hook_id)
    .bind(job.run_at.map(|t| t.timestamp_millis()))
    .bind(now)
    .execute(&mut *conn)
    .await?;
    Ok(result.last_insert_rowid())
}

async fn job_status(conn: &mut SqliteConnection, job_id: i64) -> Result<JobStatus> {
    let row: Option<(String,)> = sqlx::query_as("SELECT status FROM jobs WHERE id = ?1")
        .bind(job_id)
        .fetch_optional(&mut *conn)
        .await?;
    row.map(|(status,)| JobStatus::parse(&status))
        .ok_or(StorageError::JobNotFound(job_id))
}

// --- Row types for SQLx ---

#[derive(sqlx::FromRow)]
struct JobRow {
    id: i64,
    title: String,
    status: String,
    prompt: String,
    repo_path: String,
    base_branch: String,
    branch: Option<String>,
    schedule_id: Option<i64>,
    hook_id: Option<i64>,
    run_at: Option<i64>,
    session_id: Option<String>,
    cancel_requested_at: Option<i64>,
    created_at: i64,
    updated_at: i64,
}

impl JobRow {
    fn into_job(self) -> Job {
        Job {
            id: self.id,
            title: self.title,
            status: JobStatus::parse(&self.status),
            prompt: self.prompt,
            repo_path: self.repo_path,
            base_branch: self.base_branch,
            branch: self.branch,
            schedule_id: self.schedule_id,
            hook_id: self.hook_id,
            run_at: self.run_at.map(from_ms),
            session_id: self.session_id,
            cancel_requested_at: self.cancel_requested_at.map(from_ms),
            created_at: from_ms(self.created_at),
            updated_at: from_ms(self.updated_at),
        }
    }
}

#[derive(sqlx::FromRow)]
struct RunRow {
    id: i64,
    job_id: i64,
    attempt: i64,
    status: String,
    session_id: Option<String>,
    result: Option<String>,
    pid: Option<i64>,
    log_file: Option<String>,
    exit_code: Option<i32>,
    error_message: Option<String>,
    cost_usd: Option<f64>,
    input_tokens: i64,
    output_tokens: i64,
    started_at: i64,
    finished_at: Option<i64>,
    updated_at: i64,
}

impl RunRow {
    fn into_run(self) -> Run {
        Run {
            id: self.id,
            job_id: self.job_id,
            attempt: self.attempt as u32,
            status: RunStatus::parse(&self.status),
            session_id: self.session_id,
            result: self.result,
            pid: self.pid.map(|p| p as u32),
            log_file: self.log_file,
            exit_code: self.exit_code,
            error_message: self.error_message,
            cost_usd: self.cost_usd,
            input_tokens: self.input_tokens as u64,
            output_tokens: self.output_tokens as u64,
            started_at: from_ms(self.started_at),
            finished_at: self.finished_at.map(from_ms),
            updated_at: from_ms(self.updated_at),
        }
    }
}

#[derive(sqlx::FromRow)]
struct ScheduleRow {
    id: i64,
    name: String,
    cron: String,
    paused: i64,
    prompt: String,
    last_run_at: Option<i64>,
    next_run_at: Option<i64>,
    created_at: i64,
}

impl ScheduleRow {
    fn into_schedule(self) -> Schedule {
        Schedule {
            id: self.id,
            name: self.name,
            cron: self.cron,
            paused: self.paused != 0,
            prompt: self.prompt,
            last_run_at: self.last_run_at.map(from_ms),
            next_run_at: self.next_run_at.map(from_ms),
            created_at: from_ms(self.created_at),
        }
    }
}

#[derive(sqlx::FromRow)]
struct HookRow {
    id: i64,
    name: String,
    check_fn: String,
    prompt: String,
    state_json: String,
    paused: i64,
    last_checked_at: Option<i64>,
    last_triggered_at: Option<i64>,
    created_at: i64,
}

impl HookRow {
    fn into_hook(self) -> Hook {
        Hook {
            id: self.id,
            name: self.name,
            check_fn: self.check_fn,
            prompt: self.prompt,
            state_json: self.state_json,
            paused: self.paused != 0,
            last_checked_at: self.last_checked_at.map(from_ms),
            last_triggered_at: self.last_triggered_at.map(from_ms),
            created_at: from_ms(self.created_at),
        }
    }
}
