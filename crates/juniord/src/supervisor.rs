//! Supervision of one agent process.
//!
//! The supervisor owns a spawned child until it exits. While it runs, stdout
//! and stderr are appended to the run's log file as they arrive, stdout is
//! buffered for result parsing and fed through the usage accumulator, and
//! three timers run alongside the wait:
//!
//! - the activity watchdog kills a child that has been silent too long,
//! - the cancel check polls the job's cancellation flag and sends SIGTERM,
//!   escalating to SIGKILL if the child outlives the escalation window,
//! - the usage flush writes accumulated token totals to the run row, at most
//!   once per flush interval and once more after exit.

use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use junior_core::stream::UsageAccumulator;
use junior_core::{Config, TokenUsage};
use thiserror::Error;
use tokio::fs::File;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader};
use tokio::process::Child;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{timeout, Instant, Interval, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::agent::AgentError;
use crate::events::{Change, ChangeNotifier};
use crate::pid;
use crate::storage::Storage;

/// How long to wait for the output readers after the child exits.
const IO_CAPTURE_TIMEOUT: Duration = Duration::from_secs(5);

/// Maximum stdout kept in memory for result parsing. The log file always
/// receives everything.
const MAX_OUTPUT_BYTES: usize = 50 * 1024 * 1024;

/// Stderr kept for error messages.
const STDERR_TAIL_BYTES: usize = 4 * 1024;

/// Smallest timer period; zero-length intervals are not allowed by tokio.
const MIN_TICK: Duration = Duration::from_millis(10);

#[derive(Debug, Error)]
pub enum SuperviseError {
    /// The job's cancellation flag was observed and the child was terminated.
    #[error("cancelled")]
    Cancelled,
    #[error(transparent)]
    Agent(#[from] AgentError),
}

pub type Result<T> = std::result::Result<T, SuperviseError>;

/// Timer settings for supervision.
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    pub activity_timeout: Duration,
    pub watchdog_interval: Duration,
    pub cancel_check_interval: Duration,
    pub kill_escalation: Duration,
    pub usage_flush_interval: Duration,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

impl SupervisorConfig {
    pub fn from_config(config: &Config) -> Self {
        Self {
            activity_timeout: Duration::from_millis(config.activity_timeout_ms),
            watchdog_interval: Duration::from_millis(config.watchdog_interval_ms),
            cancel_check_interval: Duration::from_millis(config.cancel_check_interval_ms),
            kill_escalation: Duration::from_millis(config.kill_escalation_ms),
            usage_flush_interval: Duration::from_millis(config.usage_flush_interval_ms),
        }
    }
}

/// What a supervised process produced.
#[derive(Debug, Clone)]
pub struct ProcessOutput {
    /// Exit code, or -1 when the process was killed by a signal.
    pub exit_code: i32,
    pub stdout: String,
    /// Last few KiB of stderr.
    pub stderr: String,
    /// Base usage plus everything accumulated from this process.
    pub usage: TokenUsage,
}

/// Milliseconds since supervision started at which output was last seen.
#[derive(Debug)]
struct Activity {
    origin: Instant,
    last_ms: AtomicU64,
}

impl Activity {
    fn new() -> Self {
        Self {
            origin: Instant::now(),
            last_ms: AtomicU64::new(0),
        }
    }

    fn touch(&self) {
        let elapsed = u64::try_from(self.origin.elapsed().as_millis()).unwrap_or(u64::MAX);
        self.last_ms.store(elapsed, Ordering::Relaxed);
    }

    fn idle(&self) -> Duration {
        let last = Duration::from_millis(self.last_ms.load(Ordering::Relaxed));
        self.origin.elapsed().saturating_sub(last)
    }
}

/// State shared between the supervisor loop and the output readers.
#[derive(Debug)]
struct Shared {
    log: Mutex<File>,
    activity: Activity,
    usage: Mutex<UsageAccumulator>,
    dirty: AtomicBool,
}

#[derive(Debug, Clone)]
pub struct Supervisor {
    storage: Arc<Storage>,
    notifier: ChangeNotifier,
    config: SupervisorConfig,
}

impl Supervisor {
    pub fn new(storage: Arc<Storage>, notifier: ChangeNotifier, config: SupervisorConfig) -> Self {
        Self {
            storage,
            notifier,
            config,
        }
    }

    /// Supervise `child` until it exits.
    ///
    /// Returns [`SuperviseError::Cancelled`] instead of an output when the
    /// child was terminated because the job's cancellation flag was set, and
    /// [`AgentError::Inactive`] when the watchdog killed it.
    pub async fn supervise(
        &self,
        mut child: Child,
        log_path: &Path,
        job_id: i64,
        run_id: i64,
        base_usage: TokenUsage,
    ) -> Result<ProcessOutput> {
        let pid = child.id();
        let log = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(log_path)
            .await
            .map_err(AgentError::Io)?;

        let shared = Arc::new(Shared {
            log: Mutex::new(log),
            activity: Activity::new(),
            usage: Mutex::new(UsageAccumulator::new()),
            dirty: AtomicBool::new(false),
        });

        let stdout_task = child.stdout.take().map(|stdout| {
            tokio::spawn(drain_stream(stdout, Arc::clone(&shared), true, MAX_OUTPUT_BYTES))
        });
        let stderr_task = child.stderr.take().map(|stderr| {
            tokio::spawn(drain_stream(stderr, Arc::clone(&shared), false, STDERR_TAIL_BYTES))
        });

        debug!(job_id, run_id, pid, log = %log_path.display(), "supervising agent");

        let mut watchdog = ticker(self.config.watchdog_interval);
        let mut cancel_check = ticker(self.config.cancel_check_interval);
        let mut flush = ticker(self.config.usage_flush_interval);
        let mut cancelled = false;
        let mut inactive = false;
        let mut escalate_at: Option<Instant> = None;

        let status = loop {
            tokio::select! {
                result = child.wait() => break result.map_err(AgentError::Io)?,
                _ = watchdog.tick(), if !inactive && !cancelled => {
                    let idle = shared.activity.idle();
                    if idle >= self.config.activity_timeout {
                        warn!(
                            job_id,
                            run_id,
                            pid,
                            idle_ms = u64::try_from(idle.as_millis()).unwrap_or(u64::MAX),
                            "agent inactive; killing"
                        );
                        inactive = true;
                        if let Err(e) = child.start_kill() {
                            warn!(job_id, run_id, error = %e, "failed to kill inactive agent");
                        }
                    }
                }
                _ = cancel_check.tick(), if !cancelled && !inactive => {
                    match self.storage.is_cancel_requested(job_id).await {
                        Ok(true) => {
                            info!(job_id, run_id, pid, "cancellation requested; terminating agent");
                            cancelled = true;
                            terminate(&mut child, pid);
                            escalate_at = Some(Instant::now() + self.config.kill_escalation);
                        }
                        Ok(false) => {}
                        Err(e) => warn!(job_id, run_id, error = %e, "cancel check failed"),
                    }
                }
                () = tokio::time::sleep_until(escalate_at.unwrap_or_else(Instant::now)), if escalate_at.is_some() => {
                    warn!(job_id, run_id, pid, "agent still running after SIGTERM; killing");
                    escalate_at = None;
                    if let Err(e) = child.start_kill() {
                        warn!(job_id, run_id, error = %e, "failed to kill agent");
                    }
                }
                _ = flush.tick() => {
                    self.flush_usage(&shared, run_id, base_usage).await;
                }
            }
        };

        let stdout = join_capture(stdout_task, job_id, run_id, "stdout").await;
        let stderr = join_capture(stderr_task, job_id, run_id, "stderr").await;
        if let Err(e) = shared.log.lock().await.flush().await {
            warn!(job_id, run_id, error = %e, "failed to flush run log");
        }

        let usage = base_usage + shared.usage.lock().await.usage();
        if let Err(e) = self.storage.update_run_usage(run_id, usage).await {
            warn!(job_id, run_id, error = %e, "final usage flush failed");
        }
        self.notifier.notify(Change::Jobs);

        if cancelled {
            return Err(SuperviseError::Cancelled);
        }
        if inactive {
            return Err(AgentError::Inactive(self.config.activity_timeout).into());
        }

        let exit_code = status.code().unwrap_or(-1);
        debug!(
            job_id,
            run_id,
            exit_code,
            input_tokens = usage.input_tokens,
            output_tokens = usage.output_tokens,
            "agent exited"
        );
        Ok(ProcessOutput {
            exit_code,
            stdout: String::from_utf8_lossy(&stdout).into_owned(),
            stderr: String::from_utf8_lossy(&stderr).into_owned(),
            usage,
        })
    }

    async fn flush_usage(&self, shared: &Shared, run_id: i64, base: TokenUsage) {
        if !shared.dirty.swap(false, Ordering::AcqRel) {
            return;
        }
        let usage = base + shared.usage.lock().await.usage();
        match self.storage.update_run_usage(run_id, usage).await {
            Ok(()) => self.notifier.notify(Change::Jobs),
            Err(e) => {
                warn!(run_id, error = %e, "usage flush failed");
                shared.dirty.store(true, Ordering::Release);
            }
        }
    }
}

fn ticker(period: Duration) -> Interval {
    let period = period.max(MIN_TICK);
    let mut interval = tokio::time::interval_at(Instant::now() + period, period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    interval
}

/// Ask the child to exit. Falls back to SIGKILL when there is no pid to
/// signal.
fn terminate(child: &mut Child, pid: Option<u32>) {
    let signalled = pid.map(|pid| pid::send_signal(pid, libc::SIGTERM));
    match signalled {
        Some(Ok(())) => {}
        Some(Err(e)) => {
            debug!(pid, error = %e, "SIGTERM failed; killing");
            let _ = child.start_kill();
        }
        None => {
            let _ = child.start_kill();
        }
    }
}

/// Copy one output stream into the log, line by line.
///
/// Stdout lines feed the usage accumulator and are kept up to `limit`
/// bytes; for stderr only the last `limit` bytes are kept.
async fn drain_stream<R: AsyncRead + Unpin>(
    reader: R,
    shared: Arc<Shared>,
    is_stdout: bool,
    limit: usize,
) -> std::io::Result<Vec<u8>> {
    let mut reader = BufReader::new(reader);
    let mut line = Vec::with_capacity(4096);
    let mut captured = Vec::with_capacity(8192);
    let mut truncated = false;

    loop {
        line.clear();
        let n = reader.read_until(b'\n', &mut line).await?;
        if n == 0 {
            break;
        }
        shared.activity.touch();
        shared.log.lock().await.write_all(&line).await?;

        if !is_stdout {
            captured.extend_from_slice(&line);
            if captured.len() > limit {
                let excess = captured.len() - limit;
                captured.drain(..excess);
            }
            continue;
        }

        let text = String::from_utf8_lossy(&line);
        if shared.usage.lock().await.process_line(text.trim_end()) {
            shared.dirty.store(true, Ordering::Release);
        }
        if captured.len() + line.len() <= limit {
            captured.extend_from_slice(&line);
        } else if !truncated {
            truncated = true;
            warn!(max_bytes = limit, "agent output exceeded limit; truncating capture");
        }
    }

    Ok(captured)
}

async fn join_capture(
    task: Option<JoinHandle<std::io::Result<Vec<u8>>>>,
    job_id: i64,
    run_id: i64,
    stream: &'static str,
) -> Vec<u8> {
    let Some(mut task) = task else {
        return Vec::new();
    };
    match timeout(IO_CAPTURE_TIMEOUT, &mut task).await {
        Ok(Ok(Ok(buf))) => buf,
        Ok(Ok(Err(e))) => {
            warn!(job_id, run_id, stream, error = %e, "output capture failed");
            Vec::new()
        }
        Ok(Err(e)) => {
            warn!(job_id, run_id, stream, error = %e, "output reader panicked");
            Vec::new()
        }
        Err(_) => {
            warn!(job_id, run_id, stream, "output capture timed out");
            task.abort();
            Vec::new()
        }
    }
}
