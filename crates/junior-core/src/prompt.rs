//! Prompt and argument assembly for agent invocations.

use std::path::Path;

/// Message used when the finalize agent stashes dirty state in the original
/// checkout. Restoration only pops a stash carrying this message.
pub const AUTOSTASH_MESSAGE: &str = "junior-autostash";

/// Environment variable marking a process as running inside an agent.
pub const NESTED_AGENT_ENV: &str = "CLAUDECODE";

const WORKER_PREAMBLE: &str = "You are working autonomously in an isolated git worktree. \
Nobody will answer questions, so make reasonable decisions and finish the task. \
Commit your work on the current branch when you are done.";

/// Everything the finalize agent needs to merge a job back.
#[derive(Debug, Clone, Copy)]
pub struct FinalizeContext<'a> {
    pub repo_path: &'a Path,
    pub worktree_path: &'a Path,
    pub branch: &'a str,
    pub base_branch: &'a str,
    pub title: &'a str,
}

pub fn worker_prompt(task: &str) -> String {
    format!("{WORKER_PREAMBLE}\n\n{task}")
}

pub fn finalize_prompt(ctx: &FinalizeContext<'_>) -> String {
    format!(
        "Merge the finished task \"{title}\" back into {base}.\n\
         Repository: {repo}\n\
         Worktree: {worktree}\n\
         Branch: {branch}\n\n\
         STEP 1: In the worktree, commit any uncommitted changes on {branch}.\n\
         STEP 2: In the worktree, merge {base} into {branch}. Resolve every conflict \
         (check `git diff --name-only --diff-filter=U`) and commit the merge.\n\
         STEP 3: In the repository, if the working tree is dirty run \
         `git stash push -u -m {stash}`. Check out {base}, run \
         `git merge --no-ff {branch}`, then `git stash pop` if you stashed.\n\n\
         Do not delete the branch or the worktree.",
        title = ctx.title,
        base = ctx.base_branch,
        repo = ctx.repo_path.display(),
        worktree = ctx.worktree_path.display(),
        branch = ctx.branch,
        stash = AUTOSTASH_MESSAGE,
    )
}

/// Arguments for the worker invocation.
pub fn worker_args(prompt: &str) -> Vec<String> {
    vec![
        "-p".to_string(),
        prompt.to_string(),
        "--output-format".to_string(),
        "stream-json".to_string(),
        "--verbose".to_string(),
        "--dangerously-skip-permissions".to_string(),
    ]
}

/// Arguments for the finalize invocation.
pub fn finalize_args(prompt: &str, model: &str) -> Vec<String> {
    let mut args = worker_args(prompt);
    args.push("--model".to_string());
    args.push(model.to_string());
    args
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn worker_prompt_keeps_task() {
        let prompt = worker_prompt("Add a README");
        assert!(prompt.ends_with("Add a README"));
        assert!(prompt.contains("worktree"));
    }

    #[test]
    fn finalize_prompt_mentions_everything() {
        let ctx = FinalizeContext {
            repo_path: Path::new("/repo"),
            worktree_path: Path::new("/repo/.junior/worktrees/job-3"),
            branch: "junior/add-readme-3",
            base_branch: "main",
            title: "Add README",
        };
        let prompt = finalize_prompt(&ctx);
        for needle in [
            "/repo",
            "/repo/.junior/worktrees/job-3",
            "junior/add-readme-3",
            "main",
            "Add README",
            "--diff-filter=U",
            "merge --no-ff",
            AUTOSTASH_MESSAGE,
        ] {
            assert!(prompt.contains(needle), "missing {needle}");
        }
    }

    #[test]
    fn finalize_args_select_model() {
        let args = finalize_args("p", "sonnet");
        assert_eq!(args[0], "-p");
        assert_eq!(args[1], "p");
        assert!(args.contains(&"stream-json".to_string()));
        assert_eq!(&args[args.len() - 2..], ["--model", "sonnet"]);
        assert!(!worker_args("p").contains(&"--model".to_string()));
    }
}
