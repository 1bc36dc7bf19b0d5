//! TaskStore port - task と task_run の正本（source of truth）
//!
//! TaskStore は以下を管理します：
//! - task: 実際の状態（worker が報告した status）と結果
//! - task_run: 実行待ちエントリ（担当 worker, next_run_at, want_run_status）
//!
//! # 実装
//! - InMemoryTaskStore（impls）
//! - MysqlTaskStore（`minitask-mysql` クレート）

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::domain::{StoreError, Task, TaskFilter, TaskRun, TaskStatus};

/// TaskStore は task / task_run の二つの行を常に整合させる
///
/// # 設計原則
/// - create / update / finish は同一トランザクション内で両方の行を書く
/// - 終端状態（success / failed）の task は task_run を持たない
/// - list_runnable_tasks は読み取りのみ。発見から claim までの窓は
///   at-least-once として許容する（実行側で冪等にする）
/// - エラーは分類を保ったまま呼び出し側へ返す（内部リトライなし）
#[async_trait]
pub trait TaskStore: Send + Sync {
    /// Insert the task and its run atomically. `Conflict` if the key exists.
    async fn create_task(&self, task: &Task, run: &TaskRun) -> Result<Task, StoreError>;

    /// Update the task's mutable fields. A final status deletes the run in the
    /// same transaction; otherwise `run`, when given, replaces the run entry.
    async fn update_task(&self, task: &Task, run: Option<&TaskRun>) -> Result<(), StoreError>;

    /// Reassign, reschedule or change the desired status of an active run.
    /// `NotFound` when the task has no run (absent or already final).
    async fn update_task_run(&self, run: &TaskRun) -> Result<(), StoreError>;

    /// Set a final status/result and drop the run, atomically.
    async fn finish_task(
        &self,
        task_key: &str,
        status: TaskStatus,
        msg: &str,
        result: Option<&serde_json::Value>,
    ) -> Result<(), StoreError>;

    async fn get_task(&self, task_key: &str) -> Result<Task, StoreError>;

    /// Results follow the order of `task_keys`. Missing keys are omitted,
    /// not errors, and a key repeated in the request is returned once.
    async fn batch_get_task(&self, task_keys: &[String]) -> Result<Vec<Task>, StoreError>;

    async fn list_task(&self, filter: &TaskFilter) -> Result<Vec<Task>, StoreError>;

    async fn list_task_runs(&self) -> Result<Vec<TaskRun>, StoreError>;

    /// Tasks whose run is due for `worker_id` (empty = every worker),
    /// ordered by `next_run_at`.
    async fn list_runnable_tasks(&self, worker_id: &str) -> Result<Vec<Task>, StoreError>;

    /// Tasks with an active run, with `status` replaced by the run's
    /// `want_run_status`. Ordering and duplicate handling match
    /// [`TaskStore::batch_get_task`].
    async fn batch_get_want_task(&self, task_keys: &[String]) -> Result<Vec<Task>, StoreError>;

    /// Push notification of runnable task keys. Stores without change
    /// notification return a receiver that never yields.
    async fn watch_runnable_tasks(
        &self,
        _worker_id: &str,
    ) -> Result<mpsc::Receiver<Vec<String>>, StoreError> {
        Ok(silent_watch())
    }
}

/// A receiver that stays open and never yields. The sender lives in a task
/// that exits once the receiver is dropped.
pub fn silent_watch() -> mpsc::Receiver<Vec<String>> {
    let (tx, rx) = mpsc::channel(1);
    tokio::spawn(async move { tx.closed().await });
    rx
}

/// Bound a store call by a deadline; an elapsed deadline is reported as a
/// transient failure.
pub async fn with_deadline<T, F>(deadline: Duration, fut: F) -> Result<T, StoreError>
where
    F: Future<Output = Result<T, StoreError>>,
{
    match tokio::time::timeout(deadline, fut).await {
        Ok(result) => result,
        Err(elapsed) => Err(StoreError::transient(elapsed)),
    }
}

// ========================================
// 共通の入力検証（I/O 前に行う）
// ========================================

pub fn require_key(task_key: &str) -> Result<(), StoreError> {
    if task_key.is_empty() {
        return Err(StoreError::invalid("task key is empty"));
    }
    Ok(())
}

pub fn validate_create(task: &Task, run: &TaskRun) -> Result<(), StoreError> {
    require_key(&task.task_key)?;
    if run.task_key != task.task_key {
        return Err(StoreError::invalid(format!(
            "run key {:?} does not match task key {:?}",
            run.task_key, task.task_key
        )));
    }
    if task.status.is_final() {
        return Err(StoreError::invalid(format!(
            "cannot create task {} in final status {}",
            task.task_key, task.status
        )));
    }
    Ok(())
}

pub fn validate_update(task: &Task, run: Option<&TaskRun>) -> Result<(), StoreError> {
    require_key(&task.task_key)?;
    if let Some(run) = run
        && run.task_key != task.task_key
    {
        return Err(StoreError::invalid(format!(
            "run key {:?} does not match task key {:?}",
            run.task_key, task.task_key
        )));
    }
    Ok(())
}

/// A final task may move between final statuses but never back to an
/// active one (it has no run to come back to).
pub fn validate_transition(
    task_key: &str,
    stored: TaskStatus,
    next: TaskStatus,
) -> Result<(), StoreError> {
    if stored.is_final() && !next.is_final() {
        return Err(StoreError::invalid(format!(
            "task {task_key} is already {stored}; cannot move to {next}"
        )));
    }
    Ok(())
}

pub fn validate_finish(task_key: &str, status: TaskStatus) -> Result<(), StoreError> {
    require_key(task_key)?;
    if !status.is_final() {
        return Err(StoreError::invalid(format!(
            "finish requires a final status, got {status}"
        )));
    }
    Ok(())
}
