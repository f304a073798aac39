//! Core types for the junior daemon.
//!
//! Jobs are units of requested work, Runs are execution attempts of a Job,
//! and Schedules/Hooks are the two automatic Job producers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// --- Enumerations ---

/// Job lifecycle status.
///
/// `queued -> running -> {done, failed, cancelled}`; terminal jobs may be
/// re-queued by an explicit retry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Queued,
    Running,
    Done,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Done => "done",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    /// Parse a stored status. Unknown values are treated as failed.
    pub fn parse(value: &str) -> Self {
        match value {
            "queued" => Self::Queued,
            "running" => Self::Running,
            "done" => Self::Done,
            "cancelled" => Self::Cancelled,
            _ => Self::Failed,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Failed | Self::Cancelled)
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Run (execution attempt) status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn parse(value: &str) -> Self {
        match value {
            "running" => Self::Running,
            "succeeded" => Self::Succeeded,
            "cancelled" => Self::Cancelled,
            _ => Self::Failed,
        }
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What produced a Job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobOrigin {
    Manual,
    Schedule(i64),
    Hook(i64),
}

// --- Entities ---

/// A unit of requested work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: i64,
    pub title: String,
    pub status: JobStatus,
    pub prompt: String,
    pub repo_path: String,
    pub base_branch: String,
    /// Assigned by the executor when the job starts.
    pub branch: Option<String>,
    pub schedule_id: Option<i64>,
    pub hook_id: Option<i64>,
    /// Deferred start; the dispatcher ignores the job until this passes.
    pub run_at: Option<DateTime<Utc>>,
    pub session_id: Option<String>,
    /// Non-null only while running.
    pub cancel_requested_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Job {
    pub fn origin(&self) -> JobOrigin {
        match (self.schedule_id, self.hook_id) {
            (Some(id), _) => JobOrigin::Schedule(id),
            (None, Some(id)) => JobOrigin::Hook(id),
            (None, None) => JobOrigin::Manual,
        }
    }
}

/// Fields needed to enqueue a job.
#[derive(Debug, Clone)]
pub struct NewJob {
    pub title: String,
    pub prompt: String,
    pub repo_path: String,
    pub base_branch: String,
    pub origin: JobOrigin,
    pub run_at: Option<DateTime<Utc>>,
}

/// One execution attempt of a Job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Run {
    pub id: i64,
    pub job_id: i64,
    pub attempt: u32,
    pub status: RunStatus,
    pub session_id: Option<String>,
    /// Final text reported by the worker agent.
    pub result: Option<String>,
    pub pid: Option<u32>,
    pub log_file: Option<String>,
    pub exit_code: Option<i32>,
    pub error_message: Option<String>,
    pub cost_usd: Option<f64>,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

/// A cron-driven recurring trigger.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Schedule {
    pub id: i64,
    pub name: String,
    pub cron: String,
    pub paused: bool,
    pub prompt: String,
    pub last_run_at: Option<DateTime<Utc>>,
    pub next_run_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewSchedule {
    pub name: String,
    pub cron: String,
    pub prompt: String,
    pub paused: bool,
}

/// A reactive trigger polling a predicate against repository state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Hook {
    pub id: i64,
    pub name: String,
    /// Serialized predicate evaluated on every check.
    pub check_fn: String,
    pub prompt: String,
    /// Opaque JSON object the predicate reads and writes across checks.
    pub state_json: String,
    pub paused: bool,
    pub last_checked_at: Option<DateTime<Utc>>,
    pub last_triggered_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewHook {
    pub name: String,
    pub check_fn: String,
    pub prompt: String,
    pub paused: bool,
}

/// Singleton liveness row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DaemonState {
    pub pid: Option<u32>,
    pub started_at: Option<DateTime<Utc>>,
    pub last_heartbeat: Option<DateTime<Utc>>,
}

/// Token totals for one run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
}

impl std::ops::Add for TokenUsage {
    type Output = Self;

    fn add(self, rhs: Self) -> Self {
        Self {
            input_tokens: self.input_tokens + rhs.input_tokens,
            output_tokens: self.output_tokens + rhs.output_tokens,
        }
    }
}
