//! Startup recovery of work orphaned by a previous daemon that died.
//!
//! Runs once before anything else is started, so every job still marked
//! running belongs to a dead process. All filesystem and git cleanup here is
//! best-effort; only store failures abort recovery.
//!
//! Key steps:
//! - Abort a merge left in progress in each affected repository
//! - Remove orphaned worktrees and fail their jobs and runs
//! - Sweep worktree directories with no running job

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use junior_core::{JobStatus, Paths};
use tracing::{info, warn};

use crate::git;
use crate::storage::{Result, Storage};
use crate::worktree;

/// Error message stored on runs that were running when the daemon died.
pub const ORPHANED_RUN_MESSAGE: &str = "daemon crashed: orphaned run";

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    /// Jobs moved from running to failed.
    pub failed_jobs: Vec<i64>,
    pub failed_runs: u64,
    /// Repositories whose in-progress merge was aborted.
    pub aborted_merges: Vec<PathBuf>,
    /// Leftover entries deleted from the worktrees directory.
    pub swept_worktrees: usize,
}

impl RecoveryReport {
    pub fn is_empty(&self) -> bool {
        self.failed_jobs.is_empty()
            && self.failed_runs == 0
            && self.aborted_merges.is_empty()
            && self.swept_worktrees == 0
    }
}

pub async fn recover(storage: &Storage, paths: &Paths) -> Result<RecoveryReport> {
    let mut report = RecoveryReport::default();
    let orphans = storage.list_jobs(Some(JobStatus::Running)).await?;

    let repos: BTreeSet<PathBuf> = orphans
        .iter()
        .map(|job| PathBuf::from(&job.repo_path))
        .collect();

    for repo in &repos {
        match git::is_merge_in_progress(repo) {
            Ok(true) => match git::abort_merge(repo) {
                Ok(()) => {
                    info!(repo = %repo.display(), "aborted interrupted merge");
                    report.aborted_merges.push(repo.clone());
                }
                Err(e) => warn!(repo = %repo.display(), error = %e, "failed to abort merge"),
            },
            Ok(false) => {}
            Err(e) => warn!(repo = %repo.display(), error = %e, "failed to inspect merge state"),
        }
    }

    for job in &orphans {
        let repo = Path::new(&job.repo_path);
        worktree::cleanup(repo, &paths.worktree_for(job.id), job.branch.as_deref());
        if storage.fail_orphaned_job(job.id).await? {
            info!(job_id = job.id, "failed orphaned job");
            report.failed_jobs.push(job.id);
        }
    }

    report.failed_runs = storage.fail_running_runs(ORPHANED_RUN_MESSAGE).await?;
    report.swept_worktrees = worktree::sweep(&paths.worktrees_dir);

    for repo in repos.iter().chain(std::iter::once(&paths.repo)) {
        if let Err(e) = git::prune_worktrees(repo) {
            warn!(repo = %repo.display(), error = %e, "failed to prune worktrees");
        }
    }

    if report.is_empty() {
        info!("nothing to recover");
    } else {
        info!(
            failed_jobs = report.failed_jobs.len(),
            failed_runs = report.failed_runs,
            aborted_merges = report.aborted_merges.len(),
            swept_worktrees = report.swept_worktrees,
            "recovery complete"
        );
    }
    Ok(report)
}
