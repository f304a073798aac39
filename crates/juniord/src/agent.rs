//! Agent process spawning.
//!
//! [`AgentRunner`] is the seam between the executor and the external coding
//! agent: given an invocation it returns a running child with stdin closed
//! and stdout/stderr piped. [`ClaudeRunner`] is the production implementation.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use junior_core::prompt::{self, NESTED_AGENT_ENV};
use thiserror::Error;
use tokio::process::{Child, Command};

#[derive(Debug, Error)]
pub enum AgentError {
    #[error("agent command not found: {0}")]
    NotFound(String),
    #[error("failed to spawn agent: {0}")]
    Spawn(std::io::Error),
    #[error("agent io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("agent exited with code {code}: {stderr}")]
    ExitCode { code: i32, stderr: String },
    #[error("agent produced no output for {0:?}; killed")]
    Inactive(Duration),
    #[error("no result event in agent output")]
    MissingResult,
    #[error("branch {branch} has changes but is not merged into {base}")]
    NotMerged { branch: String, base: String },
}

pub type Result<T> = std::result::Result<T, AgentError>;

/// Which phase of a job an invocation belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentRole {
    /// Performs the task inside the worktree.
    Worker,
    /// Commits, resolves conflicts and merges back into the base branch.
    Finalize,
}

impl AgentRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Worker => "worker",
            Self::Finalize => "finalize",
        }
    }
}

/// Everything needed to start one agent process.
#[derive(Debug, Clone)]
pub struct AgentInvocation {
    pub role: AgentRole,
    pub prompt: String,
    pub cwd: PathBuf,
    /// Extra environment for the child, on top of the daemon's own.
    pub env: Vec<(String, String)>,
}

/// Environment describing the job to the agent (and to test scripts).
pub fn job_env(repo: &Path, worktree: &Path, branch: &str, base: &str) -> Vec<(String, String)> {
    let repo = repo.to_string_lossy().into_owned();
    vec![
        ("JUNIOR_HOME".to_string(), repo.clone()),
        ("JUNIOR_REPO".to_string(), repo),
        (
            "JUNIOR_WORKTREE".to_string(),
            worktree.to_string_lossy().into_owned(),
        ),
        ("JUNIOR_BRANCH".to_string(), branch.to_string()),
        ("JUNIOR_BASE_BRANCH".to_string(), base.to_string()),
    ]
}

/// Spawns agent processes.
pub trait AgentRunner: Send + Sync {
    fn spawn(&self, invocation: &AgentInvocation) -> Result<Child>;
}

/// Build a command with the shared process contract applied: stdin closed,
/// output piped, the nested-agent marker removed, job env added.
pub fn agent_command(program: impl AsRef<std::ffi::OsStr>, invocation: &AgentInvocation) -> Command {
    let mut cmd = Command::new(program);
    cmd.current_dir(&invocation.cwd)
        .env_remove(NESTED_AGENT_ENV)
        .envs(invocation.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    cmd
}

/// Runs the `claude` CLI in stream-json mode.
#[derive(Debug, Clone)]
pub struct ClaudeRunner {
    command: String,
    finalize_model: String,
}

impl ClaudeRunner {
    pub fn new(command: impl Into<String>, finalize_model: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            finalize_model: finalize_model.into(),
        }
    }

    pub fn args(&self, invocation: &AgentInvocation) -> Vec<String> {
        match invocation.role {
            AgentRole::Worker => prompt::worker_args(&invocation.prompt),
            AgentRole::Finalize => prompt::finalize_args(&invocation.prompt, &self.finalize_model),
        }
    }
}

impl AgentRunner for ClaudeRunner {
    fn spawn(&self, invocation: &AgentInvocation) -> Result<Child> {
        let mut cmd = agent_command(&self.command, invocation);
        cmd.args(self.args(invocation));
        cmd.spawn().map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                AgentError::NotFound(self.command.clone())
            } else {
                AgentError::Spawn(e)
            }
        })
    }
}
