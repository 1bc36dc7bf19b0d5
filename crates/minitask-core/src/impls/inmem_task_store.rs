//! InMemoryTaskStore - 開発・テスト用の正本
//!
//! # 実装詳細
//! - tokio Mutex で全テーブルを排他制御（行ロックの代わり）
//! - 書き込みは copy-on-write のトランザクション：テーブルを複製して変更し、
//!   成功した場合だけ差し替える。途中で失敗しても変更前の状態が残る
//! - watch をネイティブにサポート：コミットのたびに各 watcher へ
//!   実行可能な task_key を送る

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, mpsc};
use tracing::debug;

use crate::domain::{StoreError, Task, TaskFilter, TaskRun, TaskStatus};
use crate::ports::task_store::{
    require_key, validate_create, validate_finish, validate_transition, validate_update,
};
use crate::ports::{Clock, TaskStore};

/// Buffered notifications per watcher; a slow watcher misses intermediate
/// snapshots, never the latest poll.
const WATCH_BUFFER: usize = 16;

#[derive(Debug, Clone, Default)]
struct Tables {
    tasks: HashMap<String, Task>,
    runs: HashMap<String, TaskRun>,
    next_task_id: i64,
}

impl Tables {
    fn runnable(&self, worker_id: &str, now: DateTime<Utc>) -> Vec<&TaskRun> {
        let mut due: Vec<&TaskRun> = self
            .runs
            .values()
            .filter(|run| run.is_assigned_to(worker_id) && run.is_due(now))
            .collect();
        due.sort_by(|a, b| {
            a.next_run_at
                .cmp(&b.next_run_at)
                .then_with(|| a.task_key.cmp(&b.task_key))
        });
        due
    }
}

/// One write transaction over a private copy of the tables.
struct Tx {
    tables: Tables,
    now: DateTime<Utc>,
    #[cfg(test)]
    fail_run_write: bool,
}

impl Tx {
    fn check_run_fault(&self) -> Result<(), StoreError> {
        #[cfg(test)]
        if self.fail_run_write {
            return Err(StoreError::transient("injected task_run write failure"));
        }
        Ok(())
    }

    fn upsert_run(&mut self, run: &TaskRun) -> Result<(), StoreError> {
        self.check_run_fault()?;
        let created_at = self
            .tables
            .runs
            .get(&run.task_key)
            .map_or(self.now, |existing| existing.created_at);
        let mut run = run.clone();
        run.created_at = created_at;
        run.updated_at = self.now;
        self.tables.runs.insert(run.task_key.clone(), run);
        Ok(())
    }

    fn delete_run(&mut self, task_key: &str) -> Result<(), StoreError> {
        self.check_run_fault()?;
        self.tables.runs.remove(task_key);
        Ok(())
    }

    fn stored_task(&mut self, task_key: &str) -> Result<&mut Task, StoreError> {
        self.tables
            .tasks
            .get_mut(task_key)
            .ok_or_else(|| StoreError::task_not_found(task_key))
    }
}

struct Watcher {
    worker_id: String,
    tx: mpsc::Sender<Vec<String>>,
}

struct InMemoryTaskStoreState {
    tables: Tables,
    watchers: Vec<Watcher>,
    #[cfg(test)]
    fail_next_run_write: bool,
}

impl InMemoryTaskStoreState {
    fn notify_watchers(&mut self, now: DateTime<Utc>) {
        let tables = &self.tables;
        self.watchers.retain(|watcher| {
            if watcher.tx.is_closed() {
                return false;
            }
            let keys: Vec<String> = tables
                .runnable(&watcher.worker_id, now)
                .into_iter()
                .map(|run| run.task_key.clone())
                .collect();
            if !keys.is_empty() {
                // Full buffer: the watcher is behind and will re-poll anyway.
                let _ = watcher.tx.try_send(keys);
            }
            true
        });
    }
}

/// In-memory task store.
pub struct InMemoryTaskStore {
    state: Arc<Mutex<InMemoryTaskStoreState>>,
    clock: Arc<dyn Clock>,
}

impl InMemoryTaskStore {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            state: Arc::new(Mutex::new(InMemoryTaskStoreState {
                tables: Tables {
                    next_task_id: 1,
                    ..Tables::default()
                },
                watchers: Vec::new(),
                #[cfg(test)]
                fail_next_run_write: false,
            })),
            clock,
        }
    }

    /// Run `f` against a copy of the tables; commit only if it succeeds.
    async fn transaction<T>(
        &self,
        f: impl FnOnce(&mut Tx) -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        let now = self.clock.now();
        let mut guard = self.state.lock().await;
        let state = &mut *guard;

        let mut tx = Tx {
            tables: state.tables.clone(),
            now,
            #[cfg(test)]
            fail_run_write: std::mem::take(&mut state.fail_next_run_write),
        };
        let out = f(&mut tx)?;

        state.tables = tx.tables;
        state.notify_watchers(now);
        Ok(out)
    }

    /// Make the next transaction fail when it touches `task_run`.
    #[cfg(test)]
    pub async fn inject_run_write_failure(&self) {
        self.state.lock().await.fail_next_run_write = true;
    }

    /// Raw run row (for testing).
    #[cfg(test)]
    pub async fn get_run(&self, task_key: &str) -> Option<TaskRun> {
        self.state.lock().await.tables.runs.get(task_key).cloned()
    }
}

#[async_trait]
impl TaskStore for InMemoryTaskStore {
    async fn create_task(&self, task: &Task, run: &TaskRun) -> Result<Task, StoreError> {
        validate_create(task, run)?;

        let created = self
            .transaction(|tx| {
                if tx.tables.tasks.contains_key(&task.task_key) {
                    return Err(StoreError::task_conflict(&task.task_key));
                }
                let mut row = task.clone();
                row.id = tx.tables.next_task_id;
                row.created_at = tx.now;
                row.updated_at = tx.now;
                tx.tables.next_task_id += 1;
                tx.tables.tasks.insert(row.task_key.clone(), row.clone());

                tx.upsert_run(run)?;
                Ok(row)
            })
            .await?;

        debug!(task_key = %created.task_key, id = created.id, "task created");
        Ok(created)
    }

    async fn update_task(&self, task: &Task, run: Option<&TaskRun>) -> Result<(), StoreError> {
        validate_update(task, run)?;

        self.transaction(|tx| {
            let now = tx.now;
            let stored = tx.stored_task(&task.task_key)?;
            validate_transition(&task.task_key, stored.status, task.status)?;

            if stored.apply_update(task) {
                stored.updated_at = now;
            }

            if task.status.is_final() {
                return tx.delete_run(&task.task_key);
            }
            if let Some(run) = run {
                tx.upsert_run(run)?;
            }
            Ok(())
        })
        .await
    }

    async fn update_task_run(&self, run: &TaskRun) -> Result<(), StoreError> {
        require_key(&run.task_key)?;

        self.transaction(|tx| {
            if !tx.tables.runs.contains_key(&run.task_key) {
                return Err(StoreError::task_not_found(&run.task_key));
            }
            tx.upsert_run(run)
        })
        .await
    }

    async fn finish_task(
        &self,
        task_key: &str,
        status: TaskStatus,
        msg: &str,
        result: Option<&serde_json::Value>,
    ) -> Result<(), StoreError> {
        validate_finish(task_key, status)?;

        self.transaction(|tx| {
            let now = tx.now;
            let stored = tx.stored_task(task_key)?;
            let unchanged = stored.status == status
                && stored.msg == msg
                && stored.result.as_ref() == result;
            if !unchanged {
                stored.status = status;
                stored.msg = msg.to_string();
                stored.result = result.cloned();
                stored.updated_at = now;
            }
            tx.delete_run(task_key)
        })
        .await?;

        debug!(task_key, %status, "task finished");
        Ok(())
    }

    async fn get_task(&self, task_key: &str) -> Result<Task, StoreError> {
        let state = self.state.lock().await;
        state
            .tables
            .tasks
            .get(task_key)
            .cloned()
            .ok_or_else(|| StoreError::task_not_found(task_key))
    }

    async fn batch_get_task(&self, task_keys: &[String]) -> Result<Vec<Task>, StoreError> {
        let state = self.state.lock().await;
        let mut seen = HashSet::new();
        Ok(task_keys
            .iter()
            .filter(|key| seen.insert(key.as_str()))
            .filter_map(|key| state.tables.tasks.get(key).cloned())
            .collect())
    }

    async fn list_task(&self, filter: &TaskFilter) -> Result<Vec<Task>, StoreError> {
        let state = self.state.lock().await;
        let mut tasks: Vec<&Task> = state
            .tables
            .tasks
            .values()
            .filter(|task| filter.matches(task))
            .collect();
        tasks.sort_by_key(|task| task.id);

        let limit = if filter.limit == 0 {
            usize::MAX
        } else {
            filter.limit
        };
        Ok(tasks
            .into_iter()
            .skip(filter.offset)
            .take(limit)
            .cloned()
            .collect())
    }

    async fn list_task_runs(&self) -> Result<Vec<TaskRun>, StoreError> {
        let state = self.state.lock().await;
        let mut runs: Vec<TaskRun> = state.tables.runs.values().cloned().collect();
        runs.sort_by(|a, b| a.task_key.cmp(&b.task_key));
        Ok(runs)
    }

    async fn list_runnable_tasks(&self, worker_id: &str) -> Result<Vec<Task>, StoreError> {
        let now = self.clock.now();
        let state = self.state.lock().await;
        Ok(state
            .tables
            .runnable(worker_id, now)
            .into_iter()
            .filter_map(|run| state.tables.tasks.get(&run.task_key).cloned())
            .collect())
    }

    async fn batch_get_want_task(&self, task_keys: &[String]) -> Result<Vec<Task>, StoreError> {
        let state = self.state.lock().await;
        let mut seen = HashSet::new();
        Ok(task_keys
            .iter()
            .filter(|key| seen.insert(key.as_str()))
            .filter_map(|key| {
                let run = state.tables.runs.get(key)?;
                let mut task = state.tables.tasks.get(key)?.clone();
                task.status = run.want_run_status;
                Some(task)
            })
            .collect())
    }

    async fn watch_runnable_tasks(
        &self,
        worker_id: &str,
    ) -> Result<mpsc::Receiver<Vec<String>>, StoreError> {
        let (tx, rx) = mpsc::channel(WATCH_BUFFER);
        self.state.lock().await.watchers.push(Watcher {
            worker_id: worker_id.to_string(),
            tx,
        });
        Ok(rx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{ErrorKind, Metadata};
    use crate::ports::FixedClock;
    use chrono::TimeZone;
    use serde_json::json;
    use std::time::Duration;

    fn start() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap()
    }

    fn store() -> (InMemoryTaskStore, FixedClock) {
        let clock = FixedClock::new(start());
        (InMemoryTaskStore::new(Arc::new(clock.clone())), clock)
    }

    async fn create(store: &InMemoryTaskStore, key: &str, worker: &str) -> Task {
        let task = Task::new(key, "email", r#"{"to":"a@b.c"}"#).with_worker(worker);
        let run = TaskRun::for_task(&task, Some(start()));
        store.create_task(&task, &run).await.unwrap()
    }

    async fn assert_terminal_invariant(store: &InMemoryTaskStore) {
        let tasks = store.list_task(&TaskFilter::default()).await.unwrap();
        for task in tasks {
            let has_run = store.get_run(&task.task_key).await.is_some();
            assert_eq!(
                task.status.is_final(),
                !has_run,
                "task {} status={} has_run={has_run}",
                task.task_key,
                task.status
            );
        }
    }

    #[tokio::test]
    async fn create_then_finish_scenario() {
        let (store, _clock) = store();
        create(&store, "T1", "").await;

        let runnable = store.list_runnable_tasks("").await.unwrap();
        assert_eq!(runnable.len(), 1);
        assert_eq!(runnable[0].task_key, "T1");

        store
            .finish_task("T1", TaskStatus::Success, "", Some(&json!({})))
            .await
            .unwrap();

        assert!(store.list_runnable_tasks("").await.unwrap().is_empty());
        let task = store.get_task("T1").await.unwrap();
        assert_eq!(task.status, TaskStatus::Success);
        assert_eq!(task.result, Some(json!({})));
        assert!(store.get_run("T1").await.is_none());
        assert_terminal_invariant(&store).await;
    }

    #[tokio::test]
    async fn duplicate_key_conflicts() {
        let (store, _clock) = store();
        create(&store, "T1", "").await;

        let task = Task::new("T1", "email", "{}");
        let err = store
            .create_task(&task, &TaskRun::for_task(&task, None))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Conflict);
    }

    #[tokio::test]
    async fn ids_are_assigned_in_insert_order() {
        let (store, _clock) = store();
        let a = create(&store, "a", "").await;
        let b = create(&store, "b", "").await;
        assert_eq!((a.id, b.id), (1, 2));
    }

    #[tokio::test]
    async fn runnable_respects_worker_and_time() {
        let (store, clock) = store();
        create(&store, "mine", "w1").await;
        create(&store, "theirs", "w2").await;

        let later = Task::new("later", "email", "{}").with_worker("w1");
        let run = TaskRun::for_task(&later, Some(start() + chrono::Duration::seconds(30)));
        store.create_task(&later, &run).await.unwrap();

        let keys = |tasks: Vec<Task>| tasks.into_iter().map(|t| t.task_key).collect::<Vec<_>>();
        assert_eq!(keys(store.list_runnable_tasks("w1").await.unwrap()), ["mine"]);
        assert_eq!(
            keys(store.list_runnable_tasks("").await.unwrap()),
            ["mine", "theirs"]
        );

        clock.advance(Duration::from_secs(30));
        assert_eq!(
            keys(store.list_runnable_tasks("w1").await.unwrap()),
            ["mine", "later"]
        );
    }

    #[tokio::test]
    async fn unscheduled_run_is_never_runnable() {
        let (store, _clock) = store();
        let task = Task::new("idle", "email", "{}");
        store
            .create_task(&task, &TaskRun::for_task(&task, None))
            .await
            .unwrap();
        assert!(store.list_runnable_tasks("").await.unwrap().is_empty());
        assert_eq!(store.list_task_runs().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn update_with_final_status_drops_run() {
        let (store, _clock) = store();
        let mut task = create(&store, "T1", "w1").await;

        task.status = TaskStatus::Failed;
        task.msg = "boom".into();
        // A run passed alongside a final status is ignored.
        let run = TaskRun::for_task(&task, Some(start()));
        store.update_task(&task, Some(&run)).await.unwrap();

        assert!(store.get_run("T1").await.is_none());
        assert_eq!(store.get_task("T1").await.unwrap().msg, "boom");
        assert_terminal_invariant(&store).await;
    }

    #[tokio::test]
    async fn update_reassigns_and_reschedules() {
        let (store, _clock) = store();
        let mut task = create(&store, "T1", "w1").await;

        task.worker_id = "w2".into();
        task.status = TaskStatus::Scheduled;
        let mut labels = Metadata::new();
        labels.insert("zone".into(), "a".into());
        task.labels = Some(labels.clone());
        let later = start() + chrono::Duration::seconds(60);
        let run = TaskRun::new("T1", "w2", Some(later), TaskStatus::Running);
        store.update_task(&task, Some(&run)).await.unwrap();

        let stored = store.get_task("T1").await.unwrap();
        assert_eq!(stored.worker_id, "w2");
        assert_eq!(stored.labels, Some(labels));
        let stored_run = store.get_run("T1").await.unwrap();
        assert_eq!(stored_run.worker_id, "w2");
        assert_eq!(stored_run.next_run_at, Some(later));
        assert_eq!(stored_run.want_run_status, TaskStatus::Running);
    }

    #[tokio::test]
    async fn update_without_run_leaves_schedule_alone() {
        let (store, _clock) = store();
        let mut task = create(&store, "T1", "w1").await;
        let before = store.get_run("T1").await.unwrap();

        task.status = TaskStatus::Running;
        store.update_task(&task, None).await.unwrap();

        assert_eq!(store.get_run("T1").await.unwrap(), before);
    }

    #[tokio::test]
    async fn update_errors() {
        let (store, _clock) = store();
        let missing = Task::new("nope", "email", "{}");
        assert_eq!(
            store.update_task(&missing, None).await.unwrap_err().kind(),
            ErrorKind::NotFound
        );

        let empty = Task::new("", "email", "{}");
        assert_eq!(
            store.update_task(&empty, None).await.unwrap_err().kind(),
            ErrorKind::InvalidArgument
        );

        let mut task = create(&store, "T1", "").await;
        store
            .finish_task("T1", TaskStatus::Success, "", None)
            .await
            .unwrap();
        task.status = TaskStatus::Pending;
        assert_eq!(
            store.update_task(&task, None).await.unwrap_err().kind(),
            ErrorKind::InvalidArgument
        );
        assert_terminal_invariant(&store).await;
    }

    #[tokio::test]
    async fn update_task_run_requires_active_run() {
        let (store, _clock) = store();
        create(&store, "T1", "w1").await;

        let run = TaskRun::new("T1", "w9", Some(start()), TaskStatus::Paused);
        store.update_task_run(&run).await.unwrap();
        assert_eq!(store.get_run("T1").await.unwrap().worker_id, "w9");

        store
            .finish_task("T1", TaskStatus::Success, "", None)
            .await
            .unwrap();
        let err = store.update_task_run(&run).await.unwrap_err();
        assert!(err.is_not_found());
        assert!(store.get_run("T1").await.is_none());
    }

    #[tokio::test]
    async fn finish_is_idempotent() {
        let (store, clock) = store();
        create(&store, "T1", "").await;

        store
            .finish_task("T1", TaskStatus::Success, "done", Some(&json!({"n": 1})))
            .await
            .unwrap();
        let once = store.get_task("T1").await.unwrap();

        clock.advance(Duration::from_secs(5));
        store
            .finish_task("T1", TaskStatus::Success, "done", Some(&json!({"n": 1})))
            .await
            .unwrap();
        let twice = store.get_task("T1").await.unwrap();

        assert_eq!(once, twice);
    }

    #[tokio::test]
    async fn finish_errors() {
        let (store, _clock) = store();
        assert!(
            store
                .finish_task("nope", TaskStatus::Failed, "", None)
                .await
                .unwrap_err()
                .is_not_found()
        );
        assert_eq!(
            store
                .finish_task("", TaskStatus::Failed, "", None)
                .await
                .unwrap_err()
                .kind(),
            ErrorKind::InvalidArgument
        );
        create(&store, "T1", "").await;
        assert_eq!(
            store
                .finish_task("T1", TaskStatus::Running, "", None)
                .await
                .unwrap_err()
                .kind(),
            ErrorKind::InvalidArgument
        );
    }

    #[tokio::test]
    async fn failed_run_write_rolls_back_task_write() {
        let (store, _clock) = store();

        // create: task insert succeeds, run insert fails.
        store.inject_run_write_failure().await;
        let task = Task::new("T1", "email", "{}");
        let err = store
            .create_task(&task, &TaskRun::for_task(&task, Some(start())))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Transient);
        assert!(store.get_task("T1").await.unwrap_err().is_not_found());

        // finish: status write succeeds, run delete fails.
        let before = create(&store, "T2", "").await;
        store.inject_run_write_failure().await;
        assert!(
            store
                .finish_task("T2", TaskStatus::Success, "", None)
                .await
                .is_err()
        );
        assert_eq!(store.get_task("T2").await.unwrap(), before);
        assert!(store.get_run("T2").await.is_some());

        // update: reassignment of task and run.
        let mut moved = before.clone();
        moved.worker_id = "w2".into();
        store.inject_run_write_failure().await;
        let run = TaskRun::new("T2", "w2", Some(start()), TaskStatus::Pending);
        assert!(store.update_task(&moved, Some(&run)).await.is_err());
        assert_eq!(store.get_task("T2").await.unwrap().worker_id, "");
        assert_eq!(store.get_run("T2").await.unwrap().worker_id, "");

        assert_terminal_invariant(&store).await;
    }

    #[tokio::test]
    async fn batch_get_omits_missing_keys() {
        let (store, _clock) = store();
        create(&store, "a", "").await;
        create(&store, "b", "").await;

        let keys = vec!["a".to_string(), "zz".to_string(), "b".to_string()];
        let found = store.batch_get_task(&keys).await.unwrap();
        assert_eq!(found.len(), 2);
        assert!(store.batch_get_task(&[]).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn batch_get_returns_each_key_once() {
        let (store, _clock) = store();
        create(&store, "a", "w1").await;
        create(&store, "b", "w1").await;

        let keys: Vec<String> = ["b", "a", "b", "a"].map(String::from).into();
        let keys_of = |tasks: Vec<Task>| -> Vec<String> {
            tasks.into_iter().map(|task| task.task_key).collect()
        };
        assert_eq!(keys_of(store.batch_get_task(&keys).await.unwrap()), ["b", "a"]);
        assert_eq!(
            keys_of(store.batch_get_want_task(&keys).await.unwrap()),
            ["b", "a"]
        );
    }

    #[tokio::test]
    async fn want_task_reports_desired_status() {
        let (store, _clock) = store();
        create(&store, "active", "w1").await;
        create(&store, "done", "w1").await;
        store
            .finish_task("done", TaskStatus::Success, "", None)
            .await
            .unwrap();

        let pause = TaskRun::new("active", "w1", Some(start()), TaskStatus::Paused);
        store.update_task_run(&pause).await.unwrap();

        let keys = vec!["active".to_string(), "done".to_string(), "missing".to_string()];
        let wanted = store.batch_get_want_task(&keys).await.unwrap();
        assert_eq!(wanted.len(), 1);
        assert_eq!(wanted[0].task_key, "active");
        assert_eq!(wanted[0].status, TaskStatus::Paused);
        assert_eq!(
            store.get_task("active").await.unwrap().status,
            TaskStatus::Pending
        );
    }

    #[tokio::test]
    async fn list_task_filters_and_paginates() {
        let (store, _clock) = store();
        for (key, biz, ty) in [
            ("t1", "b1", "email"),
            ("t2", "b2", "email"),
            ("t3", "b1", "sms"),
            ("t4", "b3", "email"),
        ] {
            let task = Task::new(key, ty, "{}").with_biz(biz, "billing");
            store
                .create_task(&task, &TaskRun::for_task(&task, None))
                .await
                .unwrap();
        }

        let emails = TaskFilter {
            task_type: "email".into(),
            ..Default::default()
        };
        assert_eq!(store.list_task(&emails).await.unwrap().len(), 3);

        let page = TaskFilter {
            limit: 1,
            offset: 1,
            ..emails.clone()
        };
        let page = store.list_task(&page).await.unwrap();
        assert_eq!(page.len(), 1);
        assert_eq!(page[0].task_key, "t2");

        let by_biz = TaskFilter {
            biz_ids: vec!["b1".into(), "b3".into()],
            biz_type: "billing".into(),
            ..Default::default()
        };
        assert_eq!(store.list_task(&by_biz).await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn watch_pushes_runnable_keys_for_worker() {
        let (store, _clock) = store();
        let mut mine = store.watch_runnable_tasks("w1").await.unwrap();
        let mut all = store.watch_runnable_tasks("").await.unwrap();

        create(&store, "T1", "w1").await;
        assert_eq!(mine.recv().await.unwrap(), vec!["T1".to_string()]);
        assert_eq!(all.recv().await.unwrap(), vec!["T1".to_string()]);

        create(&store, "T2", "w2").await;
        assert_eq!(all.recv().await.unwrap().len(), 2);
        // w1's view is unchanged but still re-sent on commit.
        assert_eq!(mine.recv().await.unwrap(), vec!["T1".to_string()]);
    }

    #[tokio::test]
    async fn dropped_watchers_are_pruned() {
        let (store, _clock) = store();
        drop(store.watch_runnable_tasks("w1").await.unwrap());
        create(&store, "T1", "w1").await;
        assert!(store.state.lock().await.watchers.is_empty());
    }
}
