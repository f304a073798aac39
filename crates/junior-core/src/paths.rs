//! Layout of the `.junior/` state directory.

use std::path::{Path, PathBuf};

pub const STATE_DIR: &str = ".junior";

/// Resolved locations of everything the daemon persists for one repository.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Paths {
    pub repo: PathBuf,
    pub home: PathBuf,
    pub db: PathBuf,
    pub config: PathBuf,
    pub pid_file: PathBuf,
    pub daemon_log: PathBuf,
    pub events: PathBuf,
    pub logs_dir: PathBuf,
    pub worktrees_dir: PathBuf,
}

impl Paths {
    pub fn new(repo: impl Into<PathBuf>) -> Self {
        let repo = repo.into();
        let home = repo.join(STATE_DIR);
        Self {
            db: home.join("junior.db"),
            config: home.join("config.yaml"),
            pid_file: home.join("daemon.pid"),
            daemon_log: home.join("daemon.log"),
            events: home.join("events"),
            logs_dir: home.join("logs"),
            worktrees_dir: home.join("worktrees"),
            home,
            repo,
        }
    }

    /// Create the state directories. The state directory ignores itself so
    /// worktrees and logs never show up as untracked files in the repository.
    pub fn ensure(&self) -> std::io::Result<()> {
        std::fs::create_dir_all(&self.logs_dir)?;
        std::fs::create_dir_all(&self.worktrees_dir)?;
        let gitignore = self.home.join(".gitignore");
        if !gitignore.exists() {
            std::fs::write(gitignore, "*\n")?;
        }
        Ok(())
    }

    /// Isolated checkout for one job.
    pub fn worktree_for(&self, job_id: i64) -> PathBuf {
        worktree_path(&self.worktrees_dir, job_id)
    }

    /// Transcript for one run.
    pub fn log_file_for(&self, job_id: i64, run_id: i64) -> PathBuf {
        log_file_path(&self.logs_dir, job_id, run_id)
    }
}

pub fn worktree_path(worktrees_dir: &Path, job_id: i64) -> PathBuf {
    worktrees_dir.join(format!("job-{job_id}"))
}

pub fn log_file_path(logs_dir: &Path, job_id: i64, run_id: i64) -> PathBuf {
    logs_dir.join(format!("job-{job_id}-run-{run_id}.log"))
}
