//! Task and TaskRun: the durable task record and its active schedule entry.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::state::TaskStatus;

/// String-keyed metadata attached to a task (labels, taints, extra).
pub type Metadata = BTreeMap<String, String>;

/// One row per task key.
///
/// Design:
/// - `status` is the last actual status reported by the executing worker.
/// - The desired status lives on the paired [`TaskRun`].
/// - `payload` / `extra` are opaque and passed through unchanged.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    /// Store-assigned row id (0 until persisted).
    pub id: i64,
    pub task_key: String,
    pub biz_id: String,
    pub biz_type: String,
    pub task_type: String,
    pub payload: String,
    pub labels: Option<Metadata>,
    pub taints: Option<Metadata>,
    pub extra: Option<Metadata>,
    pub status: TaskStatus,
    /// Empty when unassigned.
    pub worker_id: String,
    pub msg: String,
    pub result: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Task {
    pub fn new(
        task_key: impl Into<String>,
        task_type: impl Into<String>,
        payload: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: 0,
            task_key: task_key.into(),
            biz_id: String::new(),
            biz_type: String::new(),
            task_type: task_type.into(),
            payload: payload.into(),
            labels: None,
            taints: None,
            extra: None,
            status: TaskStatus::Pending,
            worker_id: String::new(),
            msg: String::new(),
            result: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_biz(mut self, biz_id: impl Into<String>, biz_type: impl Into<String>) -> Self {
        self.biz_id = biz_id.into();
        self.biz_type = biz_type.into();
        self
    }

    pub fn with_worker(mut self, worker_id: impl Into<String>) -> Self {
        self.worker_id = worker_id.into();
        self
    }

    pub fn with_status(mut self, status: TaskStatus) -> Self {
        self.status = status;
        self
    }

    pub fn with_labels(mut self, labels: Metadata) -> Self {
        self.labels = Some(labels);
        self
    }

    pub fn with_taints(mut self, taints: Metadata) -> Self {
        self.taints = Some(taints);
        self
    }

    pub fn with_extra(mut self, extra: Metadata) -> Self {
        self.extra = Some(extra);
        self
    }

    pub fn is_final(&self) -> bool {
        self.status.is_final()
    }

    /// Copy the mutable fields of `update` onto this stored row.
    /// Identity and classification (`id`, `task_key`, `biz_*`, `task_type`,
    /// `payload`) never change. Returns whether anything differed; the
    /// caller bumps `updated_at` only then.
    pub fn apply_update(&mut self, update: &Task) -> bool {
        let before = self.clone();
        self.status = update.status;
        self.labels = update.labels.clone();
        self.taints = update.taints.clone();
        self.extra = update.extra.clone();
        self.worker_id = update.worker_id.clone();
        self.msg = update.msg.clone();
        self.result = update.result.clone();
        *self != before
    }
}

/// Zero-or-one row per active task key: the work-queue entry.
///
/// Exists exactly while the task is non-terminal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRun {
    pub task_key: String,
    pub worker_id: String,
    /// `None` means "not scheduled yet"; such a run is never due.
    pub next_run_at: Option<DateTime<Utc>>,
    pub want_run_status: TaskStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TaskRun {
    pub fn new(
        task_key: impl Into<String>,
        worker_id: impl Into<String>,
        next_run_at: Option<DateTime<Utc>>,
        want_run_status: TaskStatus,
    ) -> Self {
        let now = Utc::now();
        Self {
            task_key: task_key.into(),
            worker_id: worker_id.into(),
            next_run_at,
            want_run_status,
            created_at: now,
            updated_at: now,
        }
    }

    /// Initial run for a freshly created task: desired status starts equal to
    /// the actual one.
    pub fn for_task(task: &Task, next_run_at: Option<DateTime<Utc>>) -> Self {
        Self::new(
            task.task_key.clone(),
            task.worker_id.clone(),
            next_run_at,
            task.status,
        )
    }

    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.next_run_at.is_some_and(|at| at <= now)
    }

    /// Runs assigned to `worker_id`; an empty `worker_id` matches every run.
    pub fn is_assigned_to(&self, worker_id: &str) -> bool {
        worker_id.is_empty() || self.worker_id == worker_id
    }

    pub fn needs_reconcile(&self, actual: TaskStatus) -> bool {
        self.want_run_status != actual
    }
}

/// Filter for `list_task`. Empty fields impose no constraint.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TaskFilter {
    pub biz_ids: Vec<String>,
    pub biz_type: String,
    pub task_type: String,
    /// 0 means unbounded.
    pub limit: usize,
    pub offset: usize,
}

impl TaskFilter {
    pub fn matches(&self, task: &Task) -> bool {
        (self.biz_ids.is_empty() || self.biz_ids.contains(&task.biz_id))
            && (self.biz_type.is_empty() || self.biz_type == task.biz_type)
            && (self.task_type.is_empty() || self.task_type == task.task_type)
    }
}
