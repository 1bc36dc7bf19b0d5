//! Row types and the JSON column boundary.
//!
//! Encoded strings never leave this module: stores convert rows into domain
//! types with `into_*` before returning them.

use chrono::{DateTime, Utc};
use minitask_core::domain::{LeaseRecord, Metadata, StoreError, Task, TaskRun, TaskStatus};
use sqlx::FromRow;

/// Column list matching [`TaskRow`], for `SELECT ... FROM task`.
pub const TASK_COLUMNS: &str = "id, task_key, biz_id, biz_type, type, payload, labels, taints, \
     extra, status, worker_id, msg, result, created_at, updated_at";

/// Same as [`TASK_COLUMNS`], qualified for `FROM task t JOIN task_run r`.
pub const TASK_COLUMNS_T: &str = "t.id, t.task_key, t.biz_id, t.biz_type, t.type, t.payload, \
     t.labels, t.taints, t.extra, t.status, t.worker_id, t.msg, t.result, t.created_at, \
     t.updated_at";

pub const TASK_RUN_COLUMNS: &str =
    "task_key, worker_id, next_run_at, want_run_status, created_at, updated_at";

pub const LEASE_COLUMNS: &str = "anchor, master_id, ip, last_seen_active";

#[derive(Debug, Clone, FromRow)]
pub struct TaskRow {
    pub id: i64,
    pub task_key: String,
    pub biz_id: String,
    pub biz_type: String,
    #[sqlx(rename = "type")]
    pub task_type: String,
    pub payload: String,
    pub labels: Option<String>,
    pub taints: Option<String>,
    pub extra: Option<String>,
    pub status: String,
    pub worker_id: String,
    pub msg: String,
    pub result: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TaskRow {
    pub fn into_task(self) -> Result<Task, StoreError> {
        Ok(Task {
            id: self.id,
            status: self.status.parse()?,
            labels: decode_metadata(self.labels.as_deref())?,
            taints: decode_metadata(self.taints.as_deref())?,
            extra: decode_metadata(self.extra.as_deref())?,
            result: decode_result(self.result.as_deref())?,
            task_key: self.task_key,
            biz_id: self.biz_id,
            biz_type: self.biz_type,
            task_type: self.task_type,
            payload: self.payload,
            worker_id: self.worker_id,
            msg: self.msg,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}

/// A task row joined with its run's desired status.
#[derive(Debug, Clone, FromRow)]
pub struct WantTaskRow {
    #[sqlx(flatten)]
    pub task: TaskRow,
    pub want_run_status: String,
}

impl WantTaskRow {
    /// The task as the controller wants it: `status` replaced by the desired one.
    pub fn into_want_task(self) -> Result<Task, StoreError> {
        let want: TaskStatus = self.want_run_status.parse()?;
        let mut task = self.task.into_task()?;
        task.status = want;
        Ok(task)
    }
}

#[derive(Debug, Clone, FromRow)]
pub struct TaskRunRow {
    pub task_key: String,
    pub worker_id: String,
    pub next_run_at: Option<DateTime<Utc>>,
    pub want_run_status: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TaskRunRow {
    pub fn into_run(self) -> Result<TaskRun, StoreError> {
        Ok(TaskRun {
            want_run_status: self.want_run_status.parse()?,
            task_key: self.task_key,
            worker_id: self.worker_id,
            next_run_at: self.next_run_at,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}

#[derive(Debug, Clone, FromRow)]
pub struct LeaseRow {
    pub anchor: i64,
    pub master_id: String,
    pub ip: String,
    pub last_seen_active: DateTime<Utc>,
}

impl From<LeaseRow> for LeaseRecord {
    fn from(row: LeaseRow) -> Self {
        Self {
            anchor: row.anchor,
            master_id: row.master_id,
            ip: row.ip,
            last_seen_active: row.last_seen_active,
        }
    }
}

/// `None` is stored as SQL NULL.
pub fn encode_metadata(map: Option<&Metadata>) -> Result<Option<String>, StoreError> {
    Ok(map.map(serde_json::to_string).transpose()?)
}

/// NULL and the empty string both decode to `None`.
pub fn decode_metadata(raw: Option<&str>) -> Result<Option<Metadata>, StoreError> {
    match raw {
        None | Some("") => Ok(None),
        Some(raw) => Ok(Some(serde_json::from_str(raw)?)),
    }
}

pub fn encode_result(value: Option<&serde_json::Value>) -> Result<Option<String>, StoreError> {
    Ok(value.map(serde_json::to_string).transpose()?)
}

pub fn decode_result(raw: Option<&str>) -> Result<Option<serde_json::Value>, StoreError> {
    match raw {
        None | Some("") => Ok(None),
        Some(raw) => Ok(Some(serde_json::from_str(raw)?)),
    }
}
