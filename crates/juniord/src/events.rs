//! Change notification.
//!
//! In-process subscribers get a broadcast [`Change`]. Other processes (the
//! front-end, a second terminal) are told through a counter in the
//! `.junior/events` file, which the daemon polls and re-broadcasts as
//! [`Change::External`].

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

const CHANNEL_CAPACITY: usize = 64;

/// What kind of state changed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Change {
    Jobs,
    Schedules,
    Hooks,
    /// A hook's check bookkeeping moved (state, trigger time). The set of
    /// active hooks is unchanged.
    HookChecks,
    /// Another process bumped the events file; anything may have changed.
    External,
}

#[derive(Debug, Clone)]
pub struct ChangeNotifier {
    events_file: PathBuf,
    tx: broadcast::Sender<Change>,
    /// Bumps written through this notifier since the watcher last looked.
    /// Held across the counter's read-modify-write.
    local_bumps: Arc<Mutex<u64>>,
}

impl ChangeNotifier {
    pub fn new(events_file: impl Into<PathBuf>) -> Self {
        let (tx, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self {
            events_file: events_file.into(),
            tx,
            local_bumps: Arc::new(Mutex::new(0)),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Change> {
        self.tx.subscribe()
    }

    /// Record a change: bump the on-disk counter and wake local subscribers.
    pub fn notify(&self, change: Change) {
        {
            let mut local = self.local_bumps.lock().unwrap_or_else(PoisonError::into_inner);
            match bump_counter(&self.events_file) {
                Ok(()) => *local += 1,
                Err(e) => {
                    debug!(path = %self.events_file.display(), error = %e, "failed to bump events file");
                }
            }
        }
        // No receivers is fine.
        let _ = self.tx.send(change);
    }

    /// Poll the events file and re-broadcast counter changes made by other
    /// processes until `token` is cancelled.
    ///
    /// Bumps made through this notifier (or its clones) are counted, and only
    /// movement beyond them is treated as external, so a local bump landing
    /// between two polls cannot hide another process's change.
    pub async fn watch_external(&self, interval: Duration, token: CancellationToken) {
        let mut last = self.observe().0;
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                () = token.cancelled() => break,
                _ = ticker.tick() => {}
            }
            let (current, local) = self.observe();
            // A counter that went backwards was reset by someone else.
            let external = current < last || current - last > local;
            last = current;
            if external {
                let _ = self.tx.send(Change::External);
            }
        }
    }

    /// Read the counter and take the local bump count in one step.
    fn observe(&self) -> (u64, u64) {
        let mut local = self.local_bumps.lock().unwrap_or_else(PoisonError::into_inner);
        let current = read_counter(&self.events_file);
        (current, std::mem::take(&mut *local))
    }

    /// Current counter value; mostly useful to the front-end and tests.
    pub fn counter(&self) -> u64 {
        read_counter(&self.events_file)
    }
}

fn read_counter(path: &Path) -> u64 {
    std::fs::read_to_string(path)
        .ok()
        .and_then(|s| s.trim().parse().ok())
        .unwrap_or(0)
}

fn bump_counter(path: &Path) -> std::io::Result<()> {
    let next = read_counter(path).wrapping_add(1);
    // Per-process temp file so concurrent writers never rename each other's.
    let tmp = path.with_extension(format!("{}.tmp", std::process::id()));
    std::fs::write(&tmp, next.to_string())?;
    std::fs::rename(&tmp, path).inspect_err(|e| {
        warn!(path = %path.display(), error = %e, "failed to publish events counter");
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn notify_bumps_counter_and_broadcasts() {
        let dir = TempDir::new().unwrap();
        let notifier = ChangeNotifier::new(dir.path().join("events"));
        let mut rx = notifier.subscribe();

        assert_eq!(notifier.counter(), 0);
        notifier.notify(Change::Jobs);
        notifier.notify(Change::Hooks);
        assert_eq!(notifier.counter(), 2);
        assert_eq!(rx.recv().await.unwrap(), Change::Jobs);
        assert_eq!(rx.recv().await.unwrap(), Change::Hooks);
    }

    #[tokio::test]
    async fn notify_without_state_dir_still_broadcasts() {
        let dir = TempDir::new().unwrap();
        let notifier = ChangeNotifier::new(dir.path().join("missing/events"));
        let mut rx = notifier.subscribe();
        notifier.notify(Change::Schedules);
        assert_eq!(rx.recv().await.unwrap(), Change::Schedules);
    }

    #[tokio::test]
    async fn external_bump_is_rebroadcast() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("events");
        let daemon = ChangeNotifier::new(&path);
        let frontend = ChangeNotifier::new(&path);
        let mut rx = daemon.subscribe();
        let token = CancellationToken::new();

        let watcher = {
            let daemon = daemon.clone();
            let token = token.clone();
            tokio::spawn(async move {
                daemon
                    .watch_external(Duration::from_millis(10), token)
                    .await;
            })
        };
        tokio::time::sleep(Duration::from_millis(30)).await;
        frontend.notify(Change::Jobs);

        let change = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(change, Change::External);

        // Our own bumps stay local.
        daemon.notify(Change::Jobs);
        assert_eq!(rx.recv().await.unwrap(), Change::Jobs);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(rx.try_recv().is_err());

        token.cancel();
        watcher.await.unwrap();
    }

    #[tokio::test]
    async fn external_bump_survives_interleaved_local_bump() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("events");
        let daemon = ChangeNotifier::new(&path);
        let frontend = ChangeNotifier::new(&path);
        let mut rx = daemon.subscribe();
        let token = CancellationToken::new();

        let watcher = {
            let daemon = daemon.clone();
            let token = token.clone();
            tokio::spawn(async move {
                daemon
                    .watch_external(Duration::from_millis(200), token)
                    .await;
            })
        };
        // Let the watcher take its baseline, then bump from both sides
        // before its next poll.
        tokio::time::sleep(Duration::from_millis(50)).await;
        frontend.notify(Change::Schedules);
        daemon.notify(Change::Jobs);
        assert_eq!(rx.recv().await.unwrap(), Change::Jobs);

        let change = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(change, Change::External);

        token.cancel();
        watcher.await.unwrap();
    }

    #[test]
    fn concurrent_bumps_are_not_lost() {
        let dir = TempDir::new().unwrap();
        let notifier = ChangeNotifier::new(dir.path().join("events"));
        let threads: Vec<_> = (0..8)
            .map(|_| {
                let notifier = notifier.clone();
                std::thread::spawn(move || {
                    for _ in 0..25 {
                        notifier.notify(Change::Jobs);
                    }
                })
            })
            .collect();
        for thread in threads {
            thread.join().unwrap();
        }
        assert_eq!(notifier.counter(), 200);
        assert_eq!(notifier.observe(), (200, 200));
    }
}
