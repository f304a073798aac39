//! Hook predicates.
//!
//! A hook's `check_fn` is a JSON predicate tree. Leaves run a [`Probe`]
//! (a git command, a file read or an arbitrary command) through a
//! [`HookContext`], which is the only way a predicate can touch the
//! repository. Predicates may keep values in the hook's persisted state
//! object between checks.
//!
//! ```json
//! {"op": "changed", "key": "head", "probe": {"kind": "git", "args": ["rev-parse", "origin/main"]}}
//! ```

use std::path::{Component, Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::future::BoxFuture;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;
use tokio::process::Command;

/// Longest a single probe command may run.
const PROBE_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, Error)]
pub enum HookError {
    #[error("invalid predicate: {0}")]
    InvalidPredicate(#[from] serde_json::Error),
    #[error("`{cmd}` failed (exit {code:?}): {stderr}")]
    CommandFailed {
        cmd: String,
        code: Option<i32>,
        stderr: String,
    },
    #[error("`{0}` timed out")]
    Timeout(String),
    #[error("path escapes the repository: {0}")]
    PathOutsideRepo(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid pattern: {0}")]
    InvalidPattern(#[from] regex::Error),
}

pub type Result<T> = std::result::Result<T, HookError>;

/// A source of text evaluated against the repository.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Probe {
    /// `git <args>` in the repository.
    Git { args: Vec<String> },
    /// Contents of a file relative to the repository root.
    ReadFile { path: String },
    /// `<cmd> <args>` with the repository as working directory.
    Exec {
        cmd: String,
        #[serde(default)]
        args: Vec<String>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Predicate {
    /// True when the probe output differs from the value stored under `key`
    /// by the previous check. The first check only records the value.
    Changed { probe: Probe, key: String },
    Contains { probe: Probe, needle: String },
    Matches { probe: Probe, pattern: String },
    /// Trimmed output equals `value`.
    Equals { probe: Probe, value: String },
    NonEmpty { probe: Probe },
    /// The probe ran and exited 0 (for files: the file exists).
    Succeeds { probe: Probe },
    All { of: Vec<Predicate> },
    Any { of: Vec<Predicate> },
    Not { predicate: Box<Predicate> },
    Always,
}

impl Predicate {
    /// Parse and validate a stored predicate.
    pub fn parse(json: &str) -> Result<Self> {
        let predicate: Self = serde_json::from_str(json)?;
        predicate.validate()?;
        Ok(predicate)
    }

    /// Check everything that can be checked without running probes.
    pub fn validate(&self) -> Result<()> {
        match self {
            Self::Matches { pattern, .. } => {
                Regex::new(pattern)?;
                Ok(())
            }
            Self::All { of } | Self::Any { of } => of.iter().try_for_each(Self::validate),
            Self::Not { predicate } => predicate.validate(),
            Self::Changed { probe, .. }
            | Self::Contains { probe, .. }
            | Self::Equals { probe, .. }
            | Self::NonEmpty { probe }
            | Self::Succeeds { probe } => match probe {
                Probe::ReadFile { path } => resolve_repo_path(Path::new("/"), path).map(|_| ()),
                Probe::Git { .. } | Probe::Exec { .. } => Ok(()),
            },
            Self::Always => Ok(()),
        }
    }
}

/// Result of running a probe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeOutput {
    pub success: bool,
    pub code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

/// Capabilities available to a predicate, scoped to one repository.
#[async_trait]
pub trait HookContext: Send + Sync {
    fn repo_path(&self) -> &Path;
    async fn git(&self, args: &[String]) -> Result<ProbeOutput>;
    /// `None` when the file does not exist.
    async fn read_file(&self, path: &str) -> Result<Option<String>>;
    async fn exec(&self, cmd: &str, args: &[String]) -> Result<ProbeOutput>;
}

/// [`HookContext`] backed by real processes and files.
#[derive(Debug, Clone)]
pub struct RepoHookContext {
    repo: PathBuf,
}

impl RepoHookContext {
    pub fn new(repo: impl Into<PathBuf>) -> Self {
        Self { repo: repo.into() }
    }

    async fn run(&self, program: &str, args: &[String]) -> Result<ProbeOutput> {
        let mut cmd = Command::new(program);
        cmd.args(args)
            .current_dir(&self.repo)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        let output = tokio::time::timeout(PROBE_TIMEOUT, cmd.output())
            .await
            .map_err(|_| HookError::Timeout(describe(program, args)))??;
        Ok(ProbeOutput {
            success: output.status.success(),
            code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }
}

#[async_trait]
impl HookContext for RepoHookContext {
    fn repo_path(&self) -> &Path {
        &self.repo
    }

    async fn git(&self, args: &[String]) -> Result<ProbeOutput> {
        self.run("git", args).await
    }

    async fn read_file(&self, path: &str) -> Result<Option<String>> {
        let full = resolve_repo_path(&self.repo, path)?;
        match tokio::fs::canonicalize(&full).await {
            Ok(real) => {
                let root = tokio::fs::canonicalize(&self.repo).await?;
                if !real.starts_with(&root) {
                    return Err(HookError::PathOutsideRepo(path.to_string()));
                }
                Ok(Some(tokio::fs::read_to_string(real).await?))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn exec(&self, cmd: &str, args: &[String]) -> Result<ProbeOutput> {
        self.run(cmd, args).await
    }
}

/// Join a relative path onto `repo`, rejecting absolute paths and `..`.
fn resolve_repo_path(repo: &Path, path: &str) -> Result<PathBuf> {
    let rel = Path::new(path);
    let escapes = rel
        .components()
        .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir));
    if path.is_empty() || escapes {
        return Err(HookError::PathOutsideRepo(path.to_string()));
    }
    Ok(repo.join(rel))
}

fn describe(program: &str, args: &[String]) -> String {
    std::iter::once(program)
        .chain(args.iter().map(String::as_str))
        .collect::<Vec<_>>()
        .join(" ")
}

async fn run_probe(probe: &Probe, ctx: &dyn HookContext) -> Result<ProbeOutput> {
    match probe {
        Probe::Git { args } => ctx.git(args).await,
        Probe::Exec { cmd, args } => ctx.exec(cmd, args).await,
        Probe::ReadFile { path } => Ok(match ctx.read_file(path).await? {
            Some(contents) => ProbeOutput {
                success: true,
                code: Some(0),
                stdout: contents,
                stderr: String::new(),
            },
            None => ProbeOutput {
                success: false,
                code: None,
                stdout: String::new(),
                stderr: format!("{path}: not found"),
            },
        }),
    }
}

/// Run a probe whose output is needed; failure is an error.
async fn probe_text(probe: &Probe, ctx: &dyn HookContext) -> Result<String> {
    let out = run_probe(probe, ctx).await?;
    if !out.success {
        let cmd = match probe {
            Probe::Git { args } => describe("git", args),
            Probe::Exec { cmd, args } => describe(cmd, args),
            Probe::ReadFile { path } => format!("read {path}"),
        };
        return Err(HookError::CommandFailed {
            cmd,
            code: out.code,
            stderr: out.stderr.trim().to_string(),
        });
    }
    Ok(out.stdout)
}

/// Evaluate `predicate`, reading and updating `state`.
///
/// Children of `all` and `any` are all evaluated (no short-circuit) so
/// every `changed` key is refreshed on each check.
pub fn evaluate<'a>(
    predicate: &'a Predicate,
    ctx: &'a dyn HookContext,
    state: &'a mut Map<String, Value>,
) -> BoxFuture<'a, Result<bool>> {
    Box::pin(async move {
        match predicate {
            Predicate::Always => Ok(true),
            Predicate::Changed { probe, key } => {
                let current = probe_text(probe, ctx).await?.trim().to_string();
                let previous = state.insert(key.clone(), Value::String(current.clone()));
                Ok(matches!(previous, Some(Value::String(prev)) if prev != current))
            }
            Predicate::Contains { probe, needle } => {
                Ok(probe_text(probe, ctx).await?.contains(needle.as_str()))
            }
            Predicate::Matches { probe, pattern } => {
                let re = Regex::new(pattern)?;
                Ok(re.is_match(&probe_text(probe, ctx).await?))
            }
            Predicate::Equals { probe, value } => {
                Ok(probe_text(probe, ctx).await?.trim() == value)
            }
            Predicate::NonEmpty { probe } => Ok(!probe_text(probe, ctx).await?.trim().is_empty()),
            Predicate::Succeeds { probe } => Ok(run_probe(probe, ctx).await?.success),
            Predicate::All { of } => {
                let mut all = true;
                for child in of {
                    all &= evaluate(child, ctx, state).await?;
                }
                Ok(all)
            }
            Predicate::Any { of } => {
                let mut any = false;
                for child in of {
                    any |= evaluate(child, ctx, state).await?;
                }
                Ok(any)
            }
            Predicate::Not { predicate } => Ok(!evaluate(predicate, ctx, state).await?),
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::git::tests::{run, setup_test_repo};
    use serde_json::json;

    fn git(args: &[&str]) -> Probe {
        Probe::Git {
            args: args.iter().map(|s| (*s).to_string()).collect(),
        }
    }

    #[test]
    fn parses_nested_predicates() {
        let json = r#"{"op":"all","of":[
            {"op":"changed","key":"head","probe":{"kind":"git","args":["rev-parse","HEAD"]}},
            {"op":"not","predicate":{"op":"matches","pattern":"^WIP","probe":{"kind":"read_file","path":"STATUS"}}},
            {"op":"succeeds","probe":{"kind":"exec","cmd":"true"}}
        ]}"#;
        let predicate = Predicate::parse(json).unwrap();
        let Predicate::All { of } = predicate else {
            panic!("expected all");
        };
        assert_eq!(of.len(), 3);
        assert_eq!(
            of[2],
            Predicate::Succeeds {
                probe: Probe::Exec {
                    cmd: "true".to_string(),
                    args: vec![]
                }
            }
        );
    }

    #[test]
    fn rejects_invalid_predicates() {
        assert!(matches!(
            Predicate::parse(r#"{"op":"sometimes"}"#),
            Err(HookError::InvalidPredicate(_))
        ));
        assert!(matches!(
            Predicate::parse(r#"{"op":"matches","pattern":"(","probe":{"kind":"exec","cmd":"date"}}"#),
            Err(HookError::InvalidPattern(_))
        ));
        assert!(matches!(
            Predicate::parse(r#"{"op":"non_empty","probe":{"kind":"read_file","path":"../secret"}}"#),
            Err(HookError::PathOutsideRepo(_))
        ));
        assert!(matches!(
            Predicate::parse(r#"{"op":"non_empty","probe":{"kind":"read_file","path":"/etc/passwd"}}"#),
            Err(HookError::PathOutsideRepo(_))
        ));
    }

    #[tokio::test]
    async fn changed_fires_only_after_a_baseline() {
        let repo = setup_test_repo();
        let ctx = RepoHookContext::new(repo.path());
        let predicate = Predicate::Changed {
            probe: git(&["rev-parse", "HEAD"]),
            key: "head".to_string(),
        };
        let mut state = Map::new();

        assert!(!evaluate(&predicate, &ctx, &mut state).await.unwrap());
        assert!(state.contains_key("head"));
        assert!(!evaluate(&predicate, &ctx, &mut state).await.unwrap());

        std::fs::write(repo.path().join("new.txt"), "x").unwrap();
        run(repo.path(), &["add", "new.txt"]);
        run(repo.path(), &["commit", "-q", "-m", "new"]);
        assert!(evaluate(&predicate, &ctx, &mut state).await.unwrap());
        assert!(!evaluate(&predicate, &ctx, &mut state).await.unwrap());
    }

    #[tokio::test]
    async fn file_and_command_probes() {
        let repo = setup_test_repo();
        let ctx = RepoHookContext::new(repo.path());
        let mut state = Map::new();
        std::fs::write(repo.path().join("STATUS"), "READY for review\n").unwrap();

        let ready = Predicate::parse(
            r#"{"op":"matches","pattern":"^READY","probe":{"kind":"read_file","path":"STATUS"}}"#,
        )
        .unwrap();
        assert!(evaluate(&ready, &ctx, &mut state).await.unwrap());

        let missing = Predicate::Succeeds {
            probe: Probe::ReadFile {
                path: "MISSING".to_string(),
            },
        };
        assert!(!evaluate(&missing, &ctx, &mut state).await.unwrap());

        let equals = Predicate::Equals {
            probe: Probe::Exec {
                cmd: "sh".to_string(),
                args: vec!["-c".to_string(), "echo 3".to_string()],
            },
            value: "3".to_string(),
        };
        assert!(evaluate(&equals, &ctx, &mut state).await.unwrap());

        let failing = Predicate::NonEmpty {
            probe: Probe::Exec {
                cmd: "sh".to_string(),
                args: vec!["-c".to_string(), "echo out; exit 4".to_string()],
            },
        };
        let err = evaluate(&failing, &ctx, &mut state).await.unwrap_err();
        assert!(matches!(err, HookError::CommandFailed { code: Some(4), .. }));
    }

    #[tokio::test]
    async fn combinators_refresh_every_changed_key() {
        let repo = setup_test_repo();
        let ctx = RepoHookContext::new(repo.path());
        let mut state = Map::new();
        state.insert("a".to_string(), json!("old"));

        let predicate = Predicate::Any {
            of: vec![
                Predicate::Always,
                Predicate::Changed {
                    probe: git(&["rev-parse", "--abbrev-ref", "HEAD"]),
                    key: "a".to_string(),
                },
            ],
        };
        assert!(evaluate(&predicate, &ctx, &mut state).await.unwrap());
        assert_eq!(state["a"], json!("main"));

        let never = Predicate::Not {
            predicate: Box::new(Predicate::Always),
        };
        let all = Predicate::All {
            of: vec![Predicate::Always, never],
        };
        assert!(!evaluate(&all, &ctx, &mut state).await.unwrap());
    }

    #[tokio::test]
    async fn read_file_refuses_symlink_escape() {
        let repo = setup_test_repo();
        let outside = tempfile::TempDir::new().unwrap();
        std::fs::write(outside.path().join("secret"), "s").unwrap();
        std::os::unix::fs::symlink(outside.path().join("secret"), repo.path().join("link")).unwrap();

        let ctx = RepoHookContext::new(repo.path());
        assert!(matches!(
            ctx.read_file("link").await,
            Err(HookError::PathOutsideRepo(_))
        ));
        assert_eq!(ctx.read_file("README.md").await.unwrap().as_deref(), Some("# Test\n"));
        assert_eq!(ctx.read_file("nope").await.unwrap(), None);
    }
}
