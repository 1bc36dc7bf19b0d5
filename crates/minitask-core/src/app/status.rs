//! ClusterStatus - クラスタ状態のスナップショット
//!
//! 運用時に「誰がリーダーか」「何が実行待ちか」を一度に答えるためのビュー。

use std::time::Duration;

use serde::Serialize;

use crate::domain::{LeaseRecord, StoreError, TaskRun};
use crate::ports::{Clock, LeaseStore, TaskStore, with_deadline};

/// Point-in-time view of the lease and the active runs.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ClusterStatus {
    /// `None` before the first election.
    pub leader: Option<LeaseRecord>,
    pub is_leader: bool,
    pub active_runs: usize,
    /// Active runs whose `next_run_at` has passed.
    pub due_runs: usize,
    /// Runs whose desired status differs from the task's current status.
    pub pending_reconcile: usize,
}

impl ClusterStatus {
    /// Each store read is bounded by `op_timeout`; a store that does not
    /// answer in time surfaces as [`StoreError::Transient`].
    pub async fn collect(
        self_id: &str,
        lease_store: &dyn LeaseStore,
        task_store: &dyn TaskStore,
        clock: &dyn Clock,
        op_timeout: Duration,
    ) -> Result<Self, StoreError> {
        let leader = match with_deadline(op_timeout, lease_store.leader()).await {
            Ok(record) => Some(record),
            Err(e) if e.is_not_found() => None,
            Err(e) => return Err(e),
        };
        let is_leader = leader
            .as_ref()
            .is_some_and(|record| record.held_by(self_id));

        let runs = with_deadline(op_timeout, task_store.list_task_runs()).await?;
        let now = clock.now();
        let due_runs = runs.iter().filter(|run| run.is_due(now)).count();
        let pending_reconcile = count_reconcile(task_store, &runs, op_timeout).await?;

        Ok(Self {
            leader,
            is_leader,
            active_runs: runs.len(),
            due_runs,
            pending_reconcile,
        })
    }
}

async fn count_reconcile(
    task_store: &dyn TaskStore,
    runs: &[TaskRun],
    op_timeout: Duration,
) -> Result<usize, StoreError> {
    if runs.is_empty() {
        return Ok(0);
    }
    let keys: Vec<String> = runs.iter().map(|run| run.task_key.clone()).collect();
    let tasks = with_deadline(op_timeout, task_store.batch_get_task(&keys)).await?;
    Ok(runs
        .iter()
        .filter(|run| {
            tasks
                .iter()
                .find(|task| task.task_key == run.task_key)
                .is_some_and(|task| run.needs_reconcile(task.status))
        })
        .count())
}
