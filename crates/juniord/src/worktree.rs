//! Per-job worktree lifecycle.
//!
//! Each job gets its own worktree and branch. Ignored files the repository
//! has locally (env files, dependency directories) are mirrored into the
//! worktree as symlinks so tooling behaves as it does in the original
//! checkout, and are unlinked again before the finalize agent runs.

use std::path::Path;

use thiserror::Error;
use tracing::{debug, warn};

use crate::git::{self, GitError};

/// Top-level entries never mirrored into a worktree.
const SKIP_ENTRIES: &[&str] = &[".git", junior_core::paths::STATE_DIR];

#[derive(Debug, Error)]
pub enum WorktreeError {
    #[error("git error: {0}")]
    Git(#[from] GitError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, WorktreeError>;

/// Create the worktree and mirror ignored files into it.
///
/// Mirroring is best-effort; only the worktree creation itself can fail.
pub fn prepare(repo: &Path, worktree: &Path, branch: &str, base: &str) -> Result<()> {
    git::create_worktree(repo, worktree, branch, base)?;
    match mirror_ignored(repo, worktree) {
        Ok(linked) if !linked.is_empty() => {
            debug!(worktree = %worktree.display(), ?linked, "mirrored ignored files");
        }
        Ok(_) => {}
        Err(e) => warn!(worktree = %worktree.display(), error = %e, "failed to mirror ignored files"),
    }
    Ok(())
}

/// Symlink ignored top-level entries of `repo` that are missing in `worktree`.
///
/// Returns the names that were linked.
pub fn mirror_ignored(repo: &Path, worktree: &Path) -> Result<Vec<String>> {
    let mut candidates = Vec::new();
    for entry in std::fs::read_dir(repo)? {
        let name = entry?.file_name().to_string_lossy().into_owned();
        if SKIP_ENTRIES.contains(&name.as_str()) || worktree.join(&name).exists() {
            continue;
        }
        candidates.push(name);
    }

    let ignored = git::check_ignored(repo, &candidates)?;
    let mut linked = Vec::with_capacity(ignored.len());
    for name in ignored {
        std::os::unix::fs::symlink(repo.join(&name), worktree.join(&name))?;
        linked.push(name);
    }
    Ok(linked)
}

/// Remove the symlinks created by [`mirror_ignored`].
///
/// Only top-level symlinks pointing back at the same-named repository entry
/// are removed; anything the agent committed is left alone.
pub fn remove_mirrored(repo: &Path, worktree: &Path) -> Result<usize> {
    let mut removed = 0;
    for entry in std::fs::read_dir(worktree)? {
        let entry = entry?;
        if !entry.file_type()?.is_symlink() {
            continue;
        }
        let target = std::fs::read_link(entry.path())?;
        if target == repo.join(entry.file_name()) {
            std::fs::remove_file(entry.path())?;
            removed += 1;
        }
    }
    Ok(removed)
}

/// Remove a worktree, falling back to deleting the directory when git
/// refuses (for example when its metadata is already gone).
pub fn remove(repo: &Path, worktree: &Path) -> Result<()> {
    if let Err(e) = git::remove_worktree(repo, worktree) {
        debug!(worktree = %worktree.display(), error = %e, "git worktree remove failed; deleting directory");
        if worktree.exists() {
            std::fs::remove_dir_all(worktree)?;
        }
    }
    Ok(())
}

/// Best-effort removal of a job's worktree and branch. Failures are logged.
pub fn cleanup(repo: &Path, worktree: &Path, branch: Option<&str>) {
    if worktree.exists() {
        if let Err(e) = remove(repo, worktree) {
            warn!(worktree = %worktree.display(), error = %e, "failed to remove worktree");
        }
    }
    if let Some(branch) = branch {
        if let Err(e) = git::delete_branch(repo, branch) {
            warn!(branch, error = %e, "failed to delete branch");
        }
    }
}

/// Force-delete every entry under the worktrees directory. Returns how many
/// entries were removed.
pub fn sweep(worktrees_dir: &Path) -> usize {
    let Ok(entries) = std::fs::read_dir(worktrees_dir) else {
        return 0;
    };
    let mut removed = 0;
    for entry in entries.flatten() {
        let path = entry.path();
        let result = match entry.file_type() {
            Ok(ft) if ft.is_dir() => std::fs::remove_dir_all(&path),
            _ => std::fs::remove_file(&path),
        };
        match result {
            Ok(()) => removed += 1,
            Err(e) => warn!(path = %path.display(), error = %e, "failed to remove leftover worktree"),
        }
    }
    removed
}
