//! Hook polling.
//!
//! Every active hook gets its own interval task on the shared hook poll
//! interval. A check is skipped while another check of the same hook is in
//! flight or while the hook's previous job is still queued or running.
//! Predicate evaluation lives in `predicate.rs`.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use junior_core::{Hook, Job, JobOrigin, NewJob};
use serde_json::{Map, Value};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::events::{Change, ChangeNotifier};
use crate::git;
use crate::predicate::{self, HookContext, Predicate, RepoHookContext};
use crate::storage::{Storage, StorageError};

/// Result of one hook check.
#[derive(Debug, Clone, PartialEq)]
pub enum CheckOutcome {
    /// The predicate fired and this job was created.
    Triggered(Job),
    /// Checked; the predicate did not fire (or failed to evaluate).
    Quiet,
    /// Not checked: another check is running, the hook is paused or gone,
    /// or its previous job has not finished.
    Skipped,
}

#[derive(Debug)]
struct Timer {
    token: CancellationToken,
    handle: JoinHandle<()>,
}

/// Shared by the registry and every timer task.
struct Inner {
    storage: Arc<Storage>,
    notifier: ChangeNotifier,
    repo: PathBuf,
    context: Arc<dyn HookContext>,
    in_flight: Mutex<HashSet<i64>>,
}

pub struct HookEngine {
    inner: Arc<Inner>,
    interval: Duration,
    timers: Mutex<HashMap<i64, Timer>>,
}

impl std::fmt::Debug for HookEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HookEngine")
            .field("repo", &self.inner.repo)
            .field("interval", &self.interval)
            .finish_non_exhaustive()
    }
}

impl HookEngine {
    pub fn new(
        storage: Arc<Storage>,
        notifier: ChangeNotifier,
        repo: impl Into<PathBuf>,
        interval: Duration,
    ) -> Self {
        let repo = repo.into();
        let context = Arc::new(RepoHookContext::new(repo.clone()));
        Self::with_context(storage, notifier, repo, interval, context)
    }

    /// Use a custom capability set for predicate evaluation.
    pub fn with_context(
        storage: Arc<Storage>,
        notifier: ChangeNotifier,
        repo: impl Into<PathBuf>,
        interval: Duration,
        context: Arc<dyn HookContext>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                storage,
                notifier,
                repo: repo.into(),
                context,
                in_flight: Mutex::new(HashSet::new()),
            }),
            interval,
            timers: Mutex::new(HashMap::new()),
        }
    }

    /// Reconcile timers with the active hooks in the store.
    pub async fn reload(&self) -> Result<(), StorageError> {
        let active: HashSet<i64> = self
            .inner
            .storage
            .list_active_hooks()
            .await?
            .into_iter()
            .map(|hook| hook.id)
            .collect();
        let mut timers = self.timers.lock().await;

        timers.retain(|id, timer| {
            let keep = active.contains(id);
            if !keep {
                debug!(hook_id = id, "stopping hook timer");
                timer.token.cancel();
            }
            keep
        });

        for hook_id in active {
            if timers.contains_key(&hook_id) {
                continue;
            }
            let token = CancellationToken::new();
            let handle = tokio::spawn(run_timer(
                Arc::clone(&self.inner),
                hook_id,
                self.interval,
                token.clone(),
            ));
            info!(hook_id, "hook armed");
            timers.insert(hook_id, Timer { token, handle });
        }
        Ok(())
    }

    /// Run one check of a hook now.
    pub async fn check(&self, hook_id: i64) -> Result<CheckOutcome, StorageError> {
        self.inner.check(hook_id).await
    }

    pub async fn stop_all(&self) {
        let timers: Vec<Timer> = self.timers.lock().await.drain().map(|(_, t)| t).collect();
        for timer in &timers {
            timer.token.cancel();
        }
        for timer in timers {
            if let Err(e) = timer.handle.await {
                warn!(error = %e, "hook timer panicked");
            }
        }
    }

    pub async fn registered_ids(&self) -> Vec<i64> {
        let mut ids: Vec<i64> = self.timers.lock().await.keys().copied().collect();
        ids.sort_unstable();
        ids
    }
}

impl Inner {
    async fn check(&self, hook_id: i64) -> Result<CheckOutcome, StorageError> {
        if !self.in_flight.lock().await.insert(hook_id) {
            debug!(hook_id, "check already in flight");
            return Ok(CheckOutcome::Skipped);
        }
        let outcome = self.check_unguarded(hook_id).await;
        self.in_flight.lock().await.remove(&hook_id);
        outcome
    }

    async fn check_unguarded(&self, hook_id: i64) -> Result<CheckOutcome, StorageError> {
        let hook = match self.storage.get_hook(hook_id).await {
            Ok(hook) => hook,
            Err(StorageError::HookNotFound(_)) => return Ok(CheckOutcome::Skipped),
            Err(e) => return Err(e),
        };
        if hook.paused {
            return Ok(CheckOutcome::Skipped);
        }
        if self.storage.has_active_hook_job(hook_id).await? {
            debug!(hook_id, "previous job still active");
            return Ok(CheckOutcome::Skipped);
        }

        let mut state = parse_state(&hook);
        let fired = match Predicate::parse(&hook.check_fn) {
            Ok(predicate) => match predicate::evaluate(&predicate, self.context.as_ref(), &mut state).await {
                Ok(fired) => fired,
                Err(e) => {
                    warn!(hook_id, error = %e, "hook predicate failed");
                    false
                }
            },
            Err(e) => {
                warn!(hook_id, error = %e, "hook predicate is invalid");
                false
            }
        };

        let state_json = Value::Object(state).to_string();
        let now = Utc::now();
        if !fired {
            self.storage.record_hook_check(hook_id, &state_json, now).await?;
            if state_json != hook.state_json {
                self.notifier.notify(Change::HookChecks);
            }
            return Ok(CheckOutcome::Quiet);
        }

        let base_branch = match git::default_branch(&self.repo) {
            Ok(branch) => branch,
            Err(e) => {
                warn!(hook_id, error = %e, "cannot resolve base branch; not triggering");
                self.storage.record_hook_check(hook_id, &state_json, now).await?;
                return Ok(CheckOutcome::Quiet);
            }
        };
        let job = NewJob {
            title: hook.name.clone(),
            prompt: hook.prompt.clone(),
            repo_path: self.repo.to_string_lossy().into_owned(),
            base_branch,
            origin: JobOrigin::Hook(hook_id),
            run_at: None,
        };
        let job = self
            .storage
            .record_hook_trigger(hook_id, &state_json, &job, now)
            .await?;
        info!(hook_id, job_id = job.id, "hook triggered");
        self.notifier.notify(Change::Jobs);
        self.notifier.notify(Change::HookChecks);
        Ok(CheckOutcome::Triggered(job))
    }
}

/// Stored state, or an empty object when missing or not an object.
fn parse_state(hook: &Hook) -> Map<String, Value> {
    match serde_json::from_str(&hook.state_json) {
        Ok(Value::Object(map)) => map,
        Ok(_) | Err(_) => {
            if !hook.state_json.trim().is_empty() && hook.state_json.trim() != "{}" {
                warn!(hook_id = hook.id, "hook state is not a JSON object; resetting");
            }
            Map::new()
        }
    }
}

async fn run_timer(inner: Arc<Inner>, hook_id: i64, interval: Duration, token: CancellationToken) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    loop {
        tokio::select! {
            () = token.cancelled() => break,
            _ = ticker.tick() => {}
        }
        if let Err(e) = inner.check(hook_id).await {
            warn!(hook_id, error = %e, "hook check failed");
        }
    }
}
