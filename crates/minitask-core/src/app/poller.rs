//! RunnablePoller - 実行可能タスクの発見ループ
//!
//! # フロー
//! 1. interval ごと、または watch 通知ごとに TaskStore::list_runnable_tasks() を呼ぶ
//! 2. 空でなければ sender へ送る
//! 3. shutdown 要求、または receiver が drop されたら抜ける
//!
//! watch の通知はトリガーとしてのみ使い、内容は毎回ストアから読み直す。
//! watch をサポートしないストアでも polling だけで動作する。

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use super::service::{ServiceHandle, shutdown_requested};
use crate::domain::{StoreError, Task};
use crate::ports::{TaskStore, with_deadline};

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);

pub struct RunnablePoller {
    store: Arc<dyn TaskStore>,
    worker_id: String,
    interval: Duration,
    op_timeout: Duration,
}

impl RunnablePoller {
    /// An empty `worker_id` discovers due work cluster-wide.
    pub fn new(store: Arc<dyn TaskStore>, worker_id: impl Into<String>) -> Self {
        Self {
            store,
            worker_id: worker_id.into(),
            interval: DEFAULT_POLL_INTERVAL,
            op_timeout: super::elector::DEFAULT_OP_TIMEOUT,
        }
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn with_op_timeout(mut self, op_timeout: Duration) -> Self {
        self.op_timeout = op_timeout;
        self
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    pub async fn poll_once(&self) -> Result<Vec<Task>, StoreError> {
        with_deadline(
            self.op_timeout,
            self.store.list_runnable_tasks(&self.worker_id),
        )
        .await
    }

    pub fn spawn(self: Arc<Self>, tx: mpsc::Sender<Vec<Task>>) -> ServiceHandle {
        ServiceHandle::spawn("runnable-poller", move |rx| async move {
            self.run(tx, rx).await;
        })
    }

    async fn run(&self, tx: mpsc::Sender<Vec<Task>>, mut shutdown_rx: watch::Receiver<bool>) {
        let mut notifications = match with_deadline(
            self.op_timeout,
            self.store.watch_runnable_tasks(&self.worker_id),
        )
        .await
        {
            Ok(rx) => Some(rx),
            Err(e) => {
                warn!(worker_id = %self.worker_id, error = %e, "watch unavailable, polling only");
                None
            }
        };
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(
            worker_id = %self.worker_id,
            interval_ms = self.interval.as_millis() as u64,
            "poller started"
        );

        loop {
            tokio::select! {
                _ = shutdown_requested(&mut shutdown_rx) => break,
                _ = ticker.tick() => {}
                keys = next_notification(&mut notifications) => {
                    let Some(keys) = keys else {
                        debug!(worker_id = %self.worker_id, "watch closed, polling only");
                        notifications = None;
                        continue;
                    };
                    debug!(worker_id = %self.worker_id, count = keys.len(), "watch notified");
                }
            }

            let tasks = match self.poll_once().await {
                Ok(tasks) => tasks,
                Err(e) => {
                    warn!(worker_id = %self.worker_id, error = %e, "poll failed");
                    continue;
                }
            };
            if tasks.is_empty() {
                continue;
            }

            debug!(worker_id = %self.worker_id, count = tasks.len(), "runnable tasks found");
            tokio::select! {
                _ = shutdown_requested(&mut shutdown_rx) => break,
                sent = tx.send(tasks) => {
                    if sent.is_err() {
                        debug!(worker_id = %self.worker_id, "receiver dropped");
                        break;
                    }
                }
            }
        }
        info!(worker_id = %self.worker_id, "poller stopped");
    }
}

async fn next_notification(
    rx: &mut Option<mpsc::Receiver<Vec<String>>>,
) -> Option<Vec<String>> {
    match rx {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::TaskRun;
    use crate::impls::InMemoryTaskStore;
    use crate::ports::FixedClock;
    use chrono::{DateTime, TimeZone, Utc};

    fn start() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap()
    }

    fn setup() -> (Arc<InMemoryTaskStore>, FixedClock) {
        let clock = FixedClock::new(start());
        (Arc::new(InMemoryTaskStore::new(Arc::new(clock.clone()))), clock)
    }

    async fn create(store: &InMemoryTaskStore, key: &str, worker: &str, due: DateTime<Utc>) {
        let task = Task::new(key, "email", "{}").with_worker(worker);
        store
            .create_task(&task, &TaskRun::for_task(&task, Some(due)))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn poll_once_is_scoped_to_worker() {
        let (store, _clock) = setup();
        create(&store, "mine", "w1", start()).await;
        create(&store, "theirs", "w2", start()).await;

        let poller = RunnablePoller::new(store.clone(), "w1");
        let tasks = poller.poll_once().await.unwrap();
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].task_key, "mine");

        let all = RunnablePoller::new(store, "");
        assert_eq!(all.poll_once().await.unwrap().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn watch_notification_triggers_poll() {
        let (store, _clock) = setup();
        let poller = Arc::new(
            RunnablePoller::new(store.clone(), "w1").with_interval(Duration::from_secs(3600)),
        );
        let (tx, mut rx) = mpsc::channel(8);
        let handle = poller.spawn(tx);
        tokio::time::sleep(Duration::from_millis(1)).await;

        create(&store, "T1", "w1", start()).await;
        let batch = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .expect("notification should arrive long before the next tick")
            .unwrap();
        assert_eq!(batch[0].task_key, "T1");

        handle.shutdown_and_join().await;
    }

    #[tokio::test(start_paused = true)]
    async fn polling_finds_tasks_that_become_due() {
        let (store, clock) = setup();
        create(&store, "T1", "w1", start() + chrono::Duration::seconds(30)).await;

        let poller = Arc::new(RunnablePoller::new(store.clone(), "w1"));
        let (tx, mut rx) = mpsc::channel(8);
        let handle = poller.spawn(tx);

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(rx.try_recv().is_err());

        // Becoming due involves no write, so only a poll can see it.
        clock.advance(Duration::from_secs(30));
        let batch = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(batch.len(), 1);

        handle.shutdown_and_join().await;
    }

    #[tokio::test(start_paused = true)]
    async fn stops_when_receiver_is_dropped() {
        let (store, _clock) = setup();
        let poller = Arc::new(RunnablePoller::new(store.clone(), ""));
        let (tx, rx) = mpsc::channel(8);
        let handle = poller.spawn(tx);
        drop(rx);

        create(&store, "T1", "", start()).await;
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(handle.is_finished());
    }
}
