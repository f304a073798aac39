//! Cron schedules.
//!
//! One timer task per active schedule. A timer sleeps until the next time
//! its cron expression matches, fires, and repeats; it is stopped through
//! its cancellation token when the schedule is paused, deleted or edited.
//! See also `hook_engine.rs`, which keeps the same kind of registry.

use std::collections::HashMap;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;

use chrono::{DateTime, Local, Utc};
use junior_core::{Job, JobOrigin, NewJob};
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::events::{Change, ChangeNotifier};
use crate::git::{self, GitError};
use crate::storage::{Storage, StorageError};

#[derive(Debug, Error)]
pub enum ScheduleError {
    #[error("invalid cron expression '{expr}': {reason}")]
    InvalidCron { expr: String, reason: String },
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
    #[error("git error: {0}")]
    Git(#[from] GitError),
}

pub type Result<T> = std::result::Result<T, ScheduleError>;

/// Day-of-week names in crontab order (`0` and `7` are both Sunday).
const WEEKDAYS: [&str; 7] = ["SUN", "MON", "TUE", "WED", "THU", "FRI", "SAT"];

/// Parse a cron expression.
///
/// Five-field expressions use crontab semantics: a seconds field of `0` is
/// prepended and numeric days of the week (0-7, Sunday is 0 or 7) are
/// rewritten to names, since the `cron` crate numbers them 1-7 from Sunday.
/// Six and seven-field expressions are passed through unchanged.
pub fn parse_cron(expr: &str) -> Result<cron::Schedule> {
    let invalid = |reason: String| ScheduleError::InvalidCron {
        expr: expr.to_string(),
        reason,
    };
    let fields: Vec<&str> = expr.split_whitespace().collect();
    let normalized = if fields.len() == 5 {
        let weekdays = crontab_weekdays(fields[4]).map_err(invalid)?;
        format!("0 {} {}", fields[..4].join(" "), weekdays)
    } else {
        fields.join(" ")
    };
    cron::Schedule::from_str(&normalized).map_err(|e| invalid(e.to_string()))
}

/// Rewrite a crontab day-of-week field into weekday names.
///
/// Numeric items, ranges and steps are expanded into explicit name lists so
/// ranges ending in `7` keep working; `*` and named items pass through.
fn crontab_weekdays(field: &str) -> std::result::Result<String, String> {
    if field == "*" || field == "?" {
        return Ok(field.to_string());
    }
    let mut items = Vec::new();
    for item in field.split(',') {
        let (base, step) = match item.split_once('/') {
            Some((base, step)) => {
                let step: usize = step
                    .parse()
                    .ok()
                    .filter(|s| *s > 0)
                    .ok_or_else(|| format!("invalid day-of-week step '{item}'"))?;
                (base, Some(step))
            }
            None => (item, None),
        };
        let range = match base.split_once('-') {
            _ if base == "*" => Some((0, 6)),
            Some((lo, hi)) => match (weekday_number(lo)?, weekday_number(hi)?) {
                (Some(lo), Some(hi)) if lo <= hi => Some((lo, hi)),
                (Some(_), Some(_)) => return Err(format!("invalid day-of-week range '{item}'")),
                (None, None) => None,
                _ => return Err(format!("cannot mix numbers and names in '{item}'")),
            },
            None => match weekday_number(base)? {
                Some(n) if step.is_some() => Some((n, 6)),
                Some(n) => Some((n, n)),
                None => None,
            },
        };
        let Some((lo, hi)) = range else {
            items.push(item.to_string());
            continue;
        };
        for day in (lo..=hi).step_by(step.unwrap_or(1)) {
            let name = WEEKDAYS[usize::from(day) % 7];
            if !items.iter().any(|i| i == name) {
                items.push(name.to_string());
            }
        }
    }
    Ok(items.join(","))
}

/// `Some(n)` for a numeric day of week, `None` for anything else.
fn weekday_number(s: &str) -> std::result::Result<Option<u8>, String> {
    if !s.bytes().all(|b| b.is_ascii_digit()) || s.is_empty() {
        return Ok(None);
    }
    match s.parse::<u8>() {
        Ok(n) if n <= 7 => Ok(Some(n)),
        _ => Err(format!("day of week '{s}' is out of range (0-7)")),
    }
}

/// Next occurrence strictly after `after`, evaluated in local time.
fn upcoming(schedule: &cron::Schedule, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
    schedule
        .after(&after.with_timezone(&Local))
        .next()
        .map(|t| t.with_timezone(&Utc))
}

/// Next time `expr` matches strictly after `after`. Expressions are read in
/// the host's local time zone.
pub fn next_fire_after(expr: &str, after: DateTime<Utc>) -> Result<Option<DateTime<Utc>>> {
    Ok(upcoming(&parse_cron(expr)?, after))
}

/// What a timer needs to fire.
#[derive(Debug, Clone)]
struct FireContext {
    storage: Arc<Storage>,
    notifier: ChangeNotifier,
    repo: PathBuf,
}

impl FireContext {
    /// Create the job for one firing and advance the schedule.
    ///
    /// The schedule is re-read so a pause or deletion since the timer was
    /// armed wins. Returns `None` when nothing fired.
    async fn fire(&self, schedule_id: i64, fired_at: DateTime<Utc>) -> Result<Option<Job>> {
        let schedule = match self.storage.get_schedule(schedule_id).await {
            Ok(schedule) => schedule,
            Err(StorageError::ScheduleNotFound(_)) => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        if schedule.paused {
            debug!(schedule_id, "schedule paused; not firing");
            return Ok(None);
        }

        let next = next_fire_after(&schedule.cron, fired_at)?;
        let base_branch = git::default_branch(&self.repo)?;
        let job = NewJob {
            title: schedule.name.clone(),
            prompt: schedule.prompt.clone(),
            repo_path: self.repo.to_string_lossy().into_owned(),
            base_branch,
            origin: JobOrigin::Schedule(schedule_id),
            run_at: None,
        };
        let job = self
            .storage
            .record_schedule_fire(schedule_id, &job, fired_at, next)
            .await?;
        info!(schedule_id, job_id = job.id, next_run_at = ?next, "schedule fired");
        self.notifier.notify(Change::Jobs);
        self.notifier.notify(Change::Schedules);
        Ok(Some(job))
    }
}

#[derive(Debug)]
struct Timer {
    cron: String,
    token: CancellationToken,
    handle: JoinHandle<()>,
}

/// Registry of schedule timers.
#[derive(Debug)]
pub struct Scheduler {
    ctx: FireContext,
    timers: Mutex<HashMap<i64, Timer>>,
}

impl Scheduler {
    pub fn new(storage: Arc<Storage>, notifier: ChangeNotifier, repo: impl Into<PathBuf>) -> Self {
        Self {
            ctx: FireContext {
                storage,
                notifier,
                repo: repo.into(),
            },
            timers: Mutex::new(HashMap::new()),
        }
    }

    /// Reconcile timers with the active schedules in the store.
    ///
    /// Timers of paused, deleted or re-timed schedules are stopped; newly
    /// active schedules get a timer and a fresh `next_run_at`.
    pub async fn reload(&self) -> Result<()> {
        let active = self.ctx.storage.list_active_schedules().await?;
        let mut timers = self.timers.lock().await;

        let wanted: HashMap<i64, &str> = active.iter().map(|s| (s.id, s.cron.as_str())).collect();
        timers.retain(|id, timer| {
            let keep = wanted.get(id).is_some_and(|cron| *cron == timer.cron);
            if !keep {
                debug!(schedule_id = id, "stopping schedule timer");
                timer.token.cancel();
            }
            keep
        });

        for schedule in active {
            if timers.contains_key(&schedule.id) {
                continue;
            }
            let parsed = match parse_cron(&schedule.cron) {
                Ok(parsed) => parsed,
                Err(e) => {
                    warn!(schedule_id = schedule.id, error = %e, "skipping schedule");
                    continue;
                }
            };
            let next = upcoming(&parsed, Utc::now());
            if let Err(e) = self.ctx.storage.set_schedule_next_run(schedule.id, next).await {
                warn!(schedule_id = schedule.id, error = %e, "failed to record next run");
            }

            let token = CancellationToken::new();
            let handle = tokio::spawn(run_timer(
                self.ctx.clone(),
                schedule.id,
                parsed,
                token.clone(),
            ));
            info!(schedule_id = schedule.id, cron = %schedule.cron, next_run_at = ?next, "schedule armed");
            timers.insert(
                schedule.id,
                Timer {
                    cron: schedule.cron,
                    token,
                    handle,
                },
            );
        }
        Ok(())
    }

    /// Fire a schedule now, outside its timer.
    pub async fn fire(&self, schedule_id: i64) -> Result<Option<Job>> {
        self.ctx.fire(schedule_id, Utc::now()).await
    }

    /// Stop every timer and wait for the tasks to exit.
    pub async fn stop_all(&self) {
        let timers: Vec<Timer> = self.timers.lock().await.drain().map(|(_, t)| t).collect();
        for timer in &timers {
            timer.token.cancel();
        }
        for timer in timers {
            if let Err(e) = timer.handle.await {
                warn!(error = %e, "schedule timer panicked");
            }
        }
    }

    pub async fn registered_ids(&self) -> Vec<i64> {
        let mut ids: Vec<i64> = self.timers.lock().await.keys().copied().collect();
        ids.sort_unstable();
        ids
    }
}

async fn run_timer(
    ctx: FireContext,
    schedule_id: i64,
    schedule: cron::Schedule,
    token: CancellationToken,
) {
    loop {
        let now = Utc::now();
        let Some(next) = upcoming(&schedule, now) else {
            debug!(schedule_id, "cron expression has no future occurrences");
            break;
        };
        let wait = (next - now).to_std().unwrap_or_default();
        tokio::select! {
            () = token.cancelled() => break,
            () = tokio::time::sleep(wait) => {}
        }
        if let Err(e) = ctx.fire(schedule_id, next).await {
            warn!(schedule_id, error = %e, "schedule fire failed");
        }
    }
}
