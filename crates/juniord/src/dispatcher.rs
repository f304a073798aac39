//! Concurrency-limited poll loop that starts executors for queued jobs.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use junior_core::Job;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::storage::Storage;

/// Drives one job to a terminal state.
#[async_trait]
pub trait JobExecutor: Send + Sync {
    async fn execute(&self, job: Job);
}

pub struct Dispatcher {
    storage: Arc<Storage>,
    executor: Arc<dyn JobExecutor>,
    max_concurrency: usize,
    poll_interval: Duration,
    /// Executor tasks keyed by job id. Advisory only; the queued→running
    /// transition in the store is what actually claims a job.
    active: Mutex<HashMap<i64, JoinHandle<()>>>,
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("max_concurrency", &self.max_concurrency)
            .field("poll_interval", &self.poll_interval)
            .finish_non_exhaustive()
    }
}

impl Dispatcher {
    pub fn new(
        storage: Arc<Storage>,
        executor: Arc<dyn JobExecutor>,
        max_concurrency: usize,
        poll_interval: Duration,
    ) -> Self {
        Self {
            storage,
            executor,
            max_concurrency,
            poll_interval,
            active: Mutex::new(HashMap::new()),
        }
    }

    /// One poll: reap finished executors, then start eligible jobs oldest
    /// first while below the concurrency limit. Returns the started job ids.
    pub async fn tick(&self) -> Vec<i64> {
        let mut active = self.active.lock().await;
        active.retain(|_, handle| !handle.is_finished());
        if active.len() >= self.max_concurrency {
            return Vec::new();
        }

        let candidates = match self.storage.list_dispatchable_jobs(Utc::now()).await {
            Ok(jobs) => jobs,
            Err(e) => {
                error!(error = %e, "failed to list queued jobs");
                return Vec::new();
            }
        };

        let mut started = Vec::new();
        for job in candidates {
            if active.len() >= self.max_concurrency {
                break;
            }
            if active.contains_key(&job.id) {
                continue;
            }
            let job_id = job.id;
            let executor = Arc::clone(&self.executor);
            let handle = tokio::spawn(async move { executor.execute(job).await });
            active.insert(job_id, handle);
            started.push(job_id);
        }
        if !started.is_empty() {
            debug!(?started, active = active.len(), "dispatched jobs");
        }
        started
    }

    /// Poll until `token` is cancelled. In-flight executors keep running;
    /// see [`Dispatcher::drain`].
    pub async fn run(&self, token: CancellationToken) {
        info!(
            max_concurrency = self.max_concurrency,
            poll_interval_ms = u64::try_from(self.poll_interval.as_millis()).unwrap_or(u64::MAX),
            "dispatcher started"
        );
        let mut ticker = tokio::time::interval(self.poll_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                () = token.cancelled() => break,
                _ = ticker.tick() => {
                    self.tick().await;
                }
            }
        }
        info!("dispatcher stopped");
    }

    /// Wait for in-flight executors, giving up after `timeout`. Returns how
    /// many were still running when the wait ended.
    pub async fn drain(&self, timeout: Duration) -> usize {
        let handles: Vec<(i64, JoinHandle<()>)> = self.active.lock().await.drain().collect();
        if handles.is_empty() {
            return 0;
        }
        info!(count = handles.len(), "waiting for running jobs");

        let (ids, handles): (Vec<i64>, Vec<JoinHandle<()>>) = handles.into_iter().unzip();
        let mut handles = handles;
        let wait = futures_util::future::join_all(handles.iter_mut());
        match tokio::time::timeout(timeout, wait).await {
            Ok(results) => {
                for (job_id, result) in ids.iter().zip(results) {
                    if let Err(e) = result {
                        warn!(job_id, error = %e, "executor task panicked");
                    }
                }
                0
            }
            Err(_) => {
                let remaining = handles.iter().filter(|h| !h.is_finished()).count();
                warn!(remaining, "shutdown timeout reached with jobs still running");
                remaining
            }
        }
    }

    pub async fn active_count(&self) -> usize {
        let mut active = self.active.lock().await;
        active.retain(|_, handle| !handle.is_finished());
        active.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::tests::{create_test_storage, new_job};
    use chrono::Duration as ChronoDuration;
    use std::sync::Mutex as StdMutex;
    use tokio::sync::oneshot;

    /// Records job ids and blocks each job until released.
    #[derive(Default)]
    struct FakeExecutor {
        storage: Option<Arc<Storage>>,
        started: StdMutex<Vec<i64>>,
        gates: StdMutex<HashMap<i64, oneshot::Sender<()>>>,
        release: StdMutex<HashMap<i64, oneshot::Receiver<()>>>,
    }

    impl FakeExecutor {
        fn new(storage: Arc<Storage>) -> Self {
            Self {
                storage: Some(storage),
                ..Self::default()
            }
        }

        fn started(&self) -> Vec<i64> {
            self.started.lock().unwrap().clone()
        }

        fn gate(&self, job_id: i64) {
            let (tx, rx) = oneshot::channel();
            self.gates.lock().unwrap().insert(job_id, tx);
            self.release.lock().unwrap().insert(job_id, rx);
        }

        fn finish(&self, job_id: i64) {
            if let Some(tx) = self.gates.lock().unwrap().remove(&job_id) {
                let _ = tx.send(());
            }
        }
    }

    #[async_trait]
    impl JobExecutor for FakeExecutor {
        async fn execute(&self, job: Job) {
            self.started.lock().unwrap().push(job.id);
            let storage = self.storage.clone().unwrap();
            let (_, run) = storage
                .start_job(job.id, "junior/fake", std::path::Path::new("/tmp"))
                .await
                .unwrap()
                .unwrap();
            let rx = self.release.lock().unwrap().remove(&job.id);
            if let Some(rx) = rx {
                let _ = rx.await;
            }
            storage.complete_job(job.id, run.id, None).await.unwrap();
        }
    }

    async fn settle(dispatcher: &Dispatcher, expected: usize) {
        for _ in 0..200 {
            if dispatcher.active_count().await == expected {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("active count never reached {expected}");
    }

    #[tokio::test]
    async fn starts_oldest_first_up_to_limit() {
        let ts = create_test_storage().await;
        let storage = Arc::new(ts.storage.clone());
        let a = storage.insert_job(&new_job("a")).await.unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;
        let b = storage.insert_job(&new_job("b")).await.unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;
        let c = storage.insert_job(&new_job("c")).await.unwrap();

        let executor = Arc::new(FakeExecutor::new(Arc::clone(&storage)));
        for id in [a.id, b.id, c.id] {
            executor.gate(id);
        }
        let dispatcher = Dispatcher::new(
            Arc::clone(&storage),
            Arc::clone(&executor) as Arc<dyn JobExecutor>,
            2,
            Duration::from_millis(10),
        );

        assert_eq!(dispatcher.tick().await, vec![a.id, b.id]);
        // Nothing new while both slots are taken.
        assert!(dispatcher.tick().await.is_empty());

        executor.finish(a.id);
        settle(&dispatcher, 1).await;
        assert_eq!(dispatcher.tick().await, vec![c.id]);
        assert_eq!(executor.started(), vec![a.id, b.id, c.id]);

        executor.finish(b.id);
        executor.finish(c.id);
        assert_eq!(dispatcher.drain(Duration::from_secs(5)).await, 0);
    }

    #[tokio::test]
    async fn deferred_jobs_wait_for_run_at() {
        let ts = create_test_storage().await;
        let storage = Arc::new(ts.storage.clone());
        let mut later = new_job("later");
        later.run_at = Some(Utc::now() + ChronoDuration::hours(1));
        storage.insert_job(&later).await.unwrap();
        let mut due = new_job("due");
        due.run_at = Some(Utc::now() - ChronoDuration::minutes(1));
        let due = storage.insert_job(&due).await.unwrap();

        let executor = Arc::new(FakeExecutor::new(Arc::clone(&storage)));
        let dispatcher = Dispatcher::new(
            Arc::clone(&storage),
            executor as Arc<dyn JobExecutor>,
            4,
            Duration::from_millis(10),
        );
        assert_eq!(dispatcher.tick().await, vec![due.id]);
        assert_eq!(dispatcher.drain(Duration::from_secs(5)).await, 0);
    }

    #[tokio::test]
    async fn drain_times_out_with_remaining_count() {
        let ts = create_test_storage().await;
        let storage = Arc::new(ts.storage.clone());
        let job = storage.insert_job(&new_job("stuck")).await.unwrap();
        let executor = Arc::new(FakeExecutor::new(Arc::clone(&storage)));
        executor.gate(job.id);

        let dispatcher = Dispatcher::new(
            Arc::clone(&storage),
            Arc::clone(&executor) as Arc<dyn JobExecutor>,
            1,
            Duration::from_millis(10),
        );
        assert_eq!(dispatcher.tick().await, vec![job.id]);
        assert_eq!(dispatcher.drain(Duration::from_millis(50)).await, 1);
        executor.finish(job.id);
    }

    #[tokio::test]
    async fn run_stops_on_cancel() {
        let ts = create_test_storage().await;
        let storage = Arc::new(ts.storage.clone());
        let job = storage.insert_job(&new_job("polled")).await.unwrap();
        let executor = Arc::new(FakeExecutor::new(Arc::clone(&storage)));
        let dispatcher = Arc::new(Dispatcher::new(
            Arc::clone(&storage),
            Arc::clone(&executor) as Arc<dyn JobExecutor>,
            1,
            Duration::from_millis(10),
        ));

        let token = CancellationToken::new();
        let task = {
            let dispatcher = Arc::clone(&dispatcher);
            let token = token.clone();
            tokio::spawn(async move { dispatcher.run(token).await })
        };
        for _ in 0..200 {
            if !executor.started().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        token.cancel();
        task.await.unwrap();
        dispatcher.drain(Duration::from_secs(5)).await;
        assert_eq!(executor.started(), vec![job.id]);
    }
}
