//! Git operations for the junior daemon.
//!
//! Thin wrappers over the `git` CLI. Every helper takes the directory to run
//! in explicitly; nothing depends on the daemon's own working directory.

use std::path::{Path, PathBuf};
use std::process::{Command, Output, Stdio};

use junior_core::naming::{validate_branch_name, BranchNameError};
use junior_core::prompt::AUTOSTASH_MESSAGE;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum GitError {
    #[error("git command failed: {0}")]
    CommandFailed(String),
    #[error("failed to execute git: {0}")]
    Execution(#[from] std::io::Error),
    #[error("invalid utf-8 in git output")]
    InvalidUtf8,
    #[error(transparent)]
    InvalidBranchName(#[from] BranchNameError),
}

pub type Result<T> = std::result::Result<T, GitError>;

fn output(dir: &Path, args: &[&str]) -> Result<Output> {
    Ok(Command::new("git")
        .arg("-C")
        .arg(dir)
        .args(args)
        .stdin(Stdio::null())
        .output()?)
}

/// Run git and return trimmed stdout, failing on a non-zero exit.
fn git(dir: &Path, args: &[&str]) -> Result<String> {
    let out = output(dir, args)?;
    if !out.status.success() {
        return Err(GitError::CommandFailed(format!(
            "git {}: {}",
            args.join(" "),
            String::from_utf8_lossy(&out.stderr).trim()
        )));
    }
    String::from_utf8(out.stdout)
        .map(|s| s.trim().to_string())
        .map_err(|_| GitError::InvalidUtf8)
}

/// Top-level directory of the working tree containing `dir`.
pub fn repo_root(dir: &Path) -> Result<PathBuf> {
    git(dir, &["rev-parse", "--show-toplevel"]).map(PathBuf::from)
}

/// Name of the branch checked out in `repo`.
pub fn current_branch(repo: &Path) -> Result<String> {
    git(repo, &["rev-parse", "--abbrev-ref", "HEAD"])
}

/// Default branch of a repository.
///
/// Uses `refs/remotes/origin/HEAD` when a remote is configured, otherwise
/// whatever is checked out.
pub fn default_branch(repo: &Path) -> Result<String> {
    if let Ok(full_ref) = git(repo, &["symbolic-ref", "refs/remotes/origin/HEAD"]) {
        if let Some(branch) = full_ref.strip_prefix("refs/remotes/origin/") {
            return Ok(branch.to_string());
        }
    }
    current_branch(repo)
}

/// Check if a branch exists locally.
pub fn branch_exists(repo: &Path, branch: &str) -> Result<bool> {
    let out = output(
        repo,
        &["rev-parse", "--verify", "--quiet", &format!("refs/heads/{branch}")],
    )?;
    Ok(out.status.success())
}

/// Create `branch` from `base` and check it out at `worktree_path`.
///
/// A leftover branch with the same name (from a crashed attempt) is
/// deleted first.
pub fn create_worktree(repo: &Path, worktree_path: &Path, branch: &str, base: &str) -> Result<()> {
    validate_branch_name(branch)?;
    if branch_exists(repo, branch)? {
        delete_branch(repo, branch)?;
    }
    if let Some(parent) = worktree_path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let path = worktree_path.to_string_lossy();
    git(repo, &["worktree", "add", &path, "-b", branch, base])?;
    Ok(())
}

/// Remove a worktree, discarding any uncommitted changes in it.
pub fn remove_worktree(repo: &Path, worktree_path: &Path) -> Result<()> {
    let path = worktree_path.to_string_lossy();
    git(repo, &["worktree", "remove", "--force", &path])?;
    Ok(())
}

/// Force-delete a local branch.
pub fn delete_branch(repo: &Path, branch: &str) -> Result<()> {
    git(repo, &["branch", "-D", branch])?;
    Ok(())
}

/// Drop administrative entries for worktrees whose directories are gone.
pub fn prune_worktrees(repo: &Path) -> Result<()> {
    git(repo, &["worktree", "prune"])?;
    Ok(())
}

/// Whether HEAD in `worktree` has commits that `base` does not.
pub fn has_commits_ahead(worktree: &Path, base: &str) -> Result<bool> {
    let log = git(worktree, &["log", "--oneline", &format!("{base}..HEAD")])?;
    Ok(!log.is_empty())
}

/// Whether `branch` is reachable from `base`, i.e. merged into it.
pub fn is_branch_merged(repo: &Path, branch: &str, base: &str) -> Result<bool> {
    let out = output(repo, &["merge-base", "--is-ancestor", branch, base])?;
    match out.status.code() {
        Some(0) => Ok(true),
        Some(1) => Ok(false),
        _ => Err(GitError::CommandFailed(format!(
            "git merge-base --is-ancestor {branch} {base}: {}",
            String::from_utf8_lossy(&out.stderr).trim()
        ))),
    }
}

fn git_dir(repo: &Path) -> Result<PathBuf> {
    let dir = PathBuf::from(git(repo, &["rev-parse", "--git-dir"])?);
    Ok(if dir.is_absolute() {
        dir
    } else {
        repo.join(dir)
    })
}

/// Whether a merge is stopped half-way in `repo`.
pub fn is_merge_in_progress(repo: &Path) -> Result<bool> {
    Ok(git_dir(repo)?.join("MERGE_HEAD").exists())
}

pub fn abort_merge(repo: &Path) -> Result<()> {
    git(repo, &["merge", "--abort"])?;
    Ok(())
}

pub fn checkout_branch(repo: &Path, branch: &str) -> Result<()> {
    git(repo, &["checkout", branch])?;
    Ok(())
}

/// Pop the newest stash if it is the finalize agent's autostash.
///
/// Returns whether a stash was popped. Stashes made by anyone else are left
/// alone.
pub fn pop_autostash(repo: &Path) -> Result<bool> {
    let list = git(repo, &["stash", "list", "--format=%gs"])?;
    let is_ours = list
        .lines()
        .next()
        .is_some_and(|subject| subject.contains(AUTOSTASH_MESSAGE));
    if !is_ours {
        return Ok(false);
    }
    git(repo, &["stash", "pop"])?;
    Ok(true)
}

/// Filter `names` (relative to `repo`) down to those git ignores.
pub fn check_ignored(repo: &Path, names: &[String]) -> Result<Vec<String>> {
    if names.is_empty() {
        return Ok(Vec::new());
    }
    let mut args = vec!["check-ignore", "--"];
    args.extend(names.iter().map(String::as_str));
    let out = output(repo, &args)?;
    // Exit 1 means nothing matched.
    match out.status.code() {
        Some(0) => {}
        Some(1) => return Ok(Vec::new()),
        _ => {
            return Err(GitError::CommandFailed(format!(
                "git check-ignore: {}",
                String::from_utf8_lossy(&out.stderr).trim()
            )))
        }
    }
    let stdout = String::from_utf8(out.stdout).map_err(|_| GitError::InvalidUtf8)?;
    Ok(stdout
        .lines()
        .map(|l| l.trim().trim_end_matches('/').to_string())
        .filter(|l| !l.is_empty())
        .collect())
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use tempfile::TempDir;

    pub(crate) fn run(dir: &Path, args: &[&str]) {
        let status = Command::new("git")
            .args(args)
            .current_dir(dir)
            .output()
            .unwrap();
        assert!(
            status.status.success(),
            "git {args:?} failed: {}",
            String::from_utf8_lossy(&status.stderr)
        );
    }

    /// Create a test git repository on `main` with one commit.
    pub(crate) fn setup_test_repo() -> TempDir {
        let dir = TempDir::new().unwrap();
        run(dir.path(), &["init", "-q"]);
        run(dir.path(), &["symbolic-ref", "HEAD", "refs/heads/main"]);
        run(dir.path(), &["config", "user.email", "test@test.com"]);
        run(dir.path(), &["config", "user.name", "Test"]);
        std::fs::write(dir.path().join("README.md"), "# Test\n").unwrap();
        run(dir.path(), &["add", "."]);
        run(dir.path(), &["commit", "-q", "-m", "Initial commit"]);
        dir
    }

    #[test]
    fn repo_root_from_subdirectory() {
        let repo = setup_test_repo();
        let sub = repo.path().join("src/nested");
        std::fs::create_dir_all(&sub).unwrap();
        let root = repo_root(&sub).unwrap();
        assert_eq!(
            root.canonicalize().unwrap(),
            repo.path().canonicalize().unwrap()
        );
        assert!(repo_root(&std::env::temp_dir().join("definitely-not-a-repo-junior")).is_err());
    }

    #[test]
    fn current_and_default_branch() {
        let repo = setup_test_repo();
        assert_eq!(current_branch(repo.path()).unwrap(), "main");
        assert_eq!(default_branch(repo.path()).unwrap(), "main");
    }

    #[test]
    fn worktree_lifecycle() {
        let repo = setup_test_repo();
        let wt = repo.path().join(".junior/worktrees/job-1");

        create_worktree(repo.path(), &wt, "junior/test-1", "main").unwrap();
        assert!(wt.join("README.md").exists());
        assert!(branch_exists(repo.path(), "junior/test-1").unwrap());
        assert_eq!(current_branch(&wt).unwrap(), "junior/test-1");
        assert!(!has_commits_ahead(&wt, "main").unwrap());

        std::fs::write(wt.join("new.txt"), "x").unwrap();
        run(&wt, &["add", "."]);
        run(&wt, &["commit", "-q", "-m", "work"]);
        assert!(has_commits_ahead(&wt, "main").unwrap());
        assert!(!is_branch_merged(repo.path(), "junior/test-1", "main").unwrap());

        run(repo.path(), &["merge", "-q", "--no-ff", "-m", "merge", "junior/test-1"]);
        assert!(is_branch_merged(repo.path(), "junior/test-1", "main").unwrap());

        remove_worktree(repo.path(), &wt).unwrap();
        assert!(!wt.exists());
        delete_branch(repo.path(), "junior/test-1").unwrap();
        assert!(!branch_exists(repo.path(), "junior/test-1").unwrap());
        prune_worktrees(repo.path()).unwrap();
    }

    #[test]
    fn create_worktree_replaces_stale_branch() {
        let repo = setup_test_repo();
        run(repo.path(), &["branch", "junior/stale-2"]);
        let wt = repo.path().join(".junior/worktrees/job-2");
        create_worktree(repo.path(), &wt, "junior/stale-2", "main").unwrap();
        assert_eq!(current_branch(&wt).unwrap(), "junior/stale-2");
    }

    #[test]
    fn create_worktree_rejects_invalid_branch() {
        let repo = setup_test_repo();
        let wt = repo.path().join("wt");
        assert!(matches!(
            create_worktree(repo.path(), &wt, "-oops", "main"),
            Err(GitError::InvalidBranchName(_))
        ));
    }

    #[test]
    fn merge_conflict_detected_and_aborted() {
        let repo = setup_test_repo();
        run(repo.path(), &["checkout", "-q", "-b", "other"]);
        std::fs::write(repo.path().join("README.md"), "other\n").unwrap();
        run(repo.path(), &["commit", "-q", "-am", "other"]);
        run(repo.path(), &["checkout", "-q", "main"]);
        std::fs::write(repo.path().join("README.md"), "main\n").unwrap();
        run(repo.path(), &["commit", "-q", "-am", "main"]);

        assert!(!is_merge_in_progress(repo.path()).unwrap());
        let merge = output(repo.path(), &["merge", "other"]).unwrap();
        assert!(!merge.status.success());
        assert!(is_merge_in_progress(repo.path()).unwrap());

        abort_merge(repo.path()).unwrap();
        assert!(!is_merge_in_progress(repo.path()).unwrap());
        assert_eq!(
            std::fs::read_to_string(repo.path().join("README.md")).unwrap(),
            "main\n"
        );
    }

    #[test]
    fn pop_autostash_only_pops_ours() {
        let repo = setup_test_repo();
        std::fs::write(repo.path().join("README.md"), "dirty\n").unwrap();
        run(repo.path(), &["stash", "push", "-m", "someone-else"]);
        assert!(!pop_autostash(repo.path()).unwrap());

        std::fs::write(repo.path().join("README.md"), "mine\n").unwrap();
        run(repo.path(), &["stash", "push", "-m", AUTOSTASH_MESSAGE]);
        assert!(pop_autostash(repo.path()).unwrap());
        assert_eq!(
            std::fs::read_to_string(repo.path().join("README.md")).unwrap(),
            "mine\n"
        );
    }

    #[test]
    fn check_ignored_filters_names() {
        let repo = setup_test_repo();
        std::fs::write(repo.path().join(".gitignore"), ".env\nbuild\n").unwrap();
        std::fs::create_dir(repo.path().join("build")).unwrap();
        std::fs::write(repo.path().join(".env"), "SECRET=1").unwrap();

        let names = vec![
            ".env".to_string(),
            "build".to_string(),
            "README.md".to_string(),
        ];
        let mut ignored = check_ignored(repo.path(), &names).unwrap();
        ignored.sort();
        assert_eq!(ignored, vec![".env".to_string(), "build".to_string()]);
        assert!(check_ignored(repo.path(), &["README.md".to_string()])
            .unwrap()
            .is_empty());
    }

    #[test]
    fn checkout_switches_branch() {
        let repo = setup_test_repo();
        run(repo.path(), &["branch", "feature"]);
        checkout_branch(repo.path(), "feature").unwrap();
        assert_eq!(current_branch(repo.path()).unwrap(), "feature");
    }
}
