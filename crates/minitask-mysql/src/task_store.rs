//! MysqlTaskStore - task / task_run テーブル
//!
//! # 実装詳細
//! - 書き込みはすべて 1 トランザクション。`?` で抜けると Transaction が
//!   drop され rollback されるので、task だけ更新された状態は観測されない
//! - 既存行の更新は `SELECT ... FOR UPDATE` で読んでから比較し、
//!   変化があるときだけ UPDATE する（finish の冪等性）
//! - `now` は注入された Clock から bind する（DB の時計に依存しない）
//! - watch は未サポート：RunnablePoller の polling で発見する

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use minitask_core::domain::{StoreError, Task, TaskFilter, TaskRun, TaskStatus};
use minitask_core::ports::task_store::{
    require_key, validate_create, validate_finish, validate_transition, validate_update,
};
use minitask_core::ports::{Clock, TaskStore};
use sqlx::{MySql, MySqlConnection, MySqlPool, QueryBuilder};
use tracing::debug;

use crate::error::task_error;
use crate::row::{
    TASK_COLUMNS, TASK_COLUMNS_T, TASK_RUN_COLUMNS, TaskRow, TaskRunRow, WantTaskRow,
    encode_metadata, encode_result,
};

/// MySQL requires a LIMIT whenever OFFSET is given.
const NO_LIMIT: u64 = u64::MAX;

#[derive(Clone)]
pub struct MysqlTaskStore {
    pool: MySqlPool,
    clock: Arc<dyn Clock>,
}

impl MysqlTaskStore {
    pub fn new(pool: MySqlPool, clock: Arc<dyn Clock>) -> Self {
        Self { pool, clock }
    }
}

async fn lock_task(conn: &mut MySqlConnection, task_key: &str) -> Result<Task, StoreError> {
    let sql = format!("SELECT {TASK_COLUMNS} FROM task WHERE task_key = ? FOR UPDATE");
    sqlx::query_as::<_, TaskRow>(&sql)
        .bind(task_key)
        .fetch_optional(&mut *conn)
        .await
        .map_err(task_error(task_key))?
        .ok_or_else(|| StoreError::task_not_found(task_key))?
        .into_task()
}

/// Write every mutable column of `task`.
async fn write_task(
    conn: &mut MySqlConnection,
    task: &Task,
    now: DateTime<Utc>,
) -> Result<(), StoreError> {
    sqlx::query(
        r#"
UPDATE task
SET status = ?, labels = ?, taints = ?, extra = ?, worker_id = ?, msg = ?, result = ?,
    updated_at = ?
WHERE task_key = ?
        "#,
    )
    .bind(task.status.as_str())
    .bind(encode_metadata(task.labels.as_ref())?)
    .bind(encode_metadata(task.taints.as_ref())?)
    .bind(encode_metadata(task.extra.as_ref())?)
    .bind(&task.worker_id)
    .bind(&task.msg)
    .bind(encode_result(task.result.as_ref())?)
    .bind(now)
    .bind(&task.task_key)
    .execute(&mut *conn)
    .await
    .map_err(task_error(&task.task_key))?;
    Ok(())
}

/// Insert the run, or overwrite the existing one keeping its `created_at`.
async fn upsert_run(
    conn: &mut MySqlConnection,
    run: &TaskRun,
    now: DateTime<Utc>,
) -> Result<(), StoreError> {
    sqlx::query(
        r#"
INSERT INTO task_run (task_key, worker_id, next_run_at, want_run_status, created_at, updated_at)
VALUES (?, ?, ?, ?, ?, ?)
ON DUPLICATE KEY UPDATE
    worker_id = VALUES(worker_id),
    next_run_at = VALUES(next_run_at),
    want_run_status = VALUES(want_run_status),
    updated_at = VALUES(updated_at)
        "#,
    )
    .bind(&run.task_key)
    .bind(&run.worker_id)
    .bind(run.next_run_at)
    .bind(run.want_run_status.as_str())
    .bind(now)
    .bind(now)
    .execute(&mut *conn)
    .await
    .map_err(task_error(&run.task_key))?;
    Ok(())
}

async fn delete_run(conn: &mut MySqlConnection, task_key: &str) -> Result<(), StoreError> {
    sqlx::query("DELETE FROM task_run WHERE task_key = ?")
        .bind(task_key)
        .execute(&mut *conn)
        .await
        .map_err(task_error(task_key))?;
    Ok(())
}

/// Reorder `tasks` to follow `task_keys`, dropping keys with no row.
/// A repeated key yields its task only at the first position.
fn in_request_order(task_keys: &[String], tasks: Vec<Task>) -> Vec<Task> {
    let mut by_key: HashMap<String, Task> = tasks
        .into_iter()
        .map(|task| (task.task_key.clone(), task))
        .collect();
    task_keys
        .iter()
        .filter_map(|key| by_key.remove(key))
        .collect()
}

#[async_trait]
impl TaskStore for MysqlTaskStore {
    async fn create_task(&self, task: &Task, run: &TaskRun) -> Result<Task, StoreError> {
        validate_create(task, run)?;
        let now = self.clock.now();
        let mut tx = self.pool.begin().await.map_err(StoreError::transient)?;

        let inserted = sqlx::query(
            r#"
INSERT INTO task (task_key, biz_id, biz_type, type, payload, labels, taints, extra, status,
                  worker_id, msg, result, created_at, updated_at)
VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&task.task_key)
        .bind(&task.biz_id)
        .bind(&task.biz_type)
        .bind(&task.task_type)
        .bind(&task.payload)
        .bind(encode_metadata(task.labels.as_ref())?)
        .bind(encode_metadata(task.taints.as_ref())?)
        .bind(encode_metadata(task.extra.as_ref())?)
        .bind(task.status.as_str())
        .bind(&task.worker_id)
        .bind(&task.msg)
        .bind(encode_result(task.result.as_ref())?)
        .bind(now)
        .bind(now)
        .execute(&mut *tx)
        .await
        .map_err(task_error(&task.task_key))?;

        upsert_run(&mut *tx, run, now).await?;
        tx.commit().await.map_err(task_error(&task.task_key))?;

        let mut created = task.clone();
        created.id = inserted.last_insert_id() as i64;
        created.created_at = now;
        created.updated_at = now;
        debug!(task_key = %created.task_key, id = created.id, "task created");
        Ok(created)
    }

    async fn update_task(&self, task: &Task, run: Option<&TaskRun>) -> Result<(), StoreError> {
        validate_update(task, run)?;
        let now = self.clock.now();
        let mut tx = self.pool.begin().await.map_err(StoreError::transient)?;

        let mut stored = lock_task(&mut *tx, &task.task_key).await?;
        validate_transition(&task.task_key, stored.status, task.status)?;
        if stored.apply_update(task) {
            write_task(&mut *tx, &stored, now).await?;
        }

        if task.status.is_final() {
            delete_run(&mut *tx, &task.task_key).await?;
        } else if let Some(run) = run {
            upsert_run(&mut *tx, run, now).await?;
        }
        tx.commit().await.map_err(task_error(&task.task_key))?;
        Ok(())
    }

    async fn update_task_run(&self, run: &TaskRun) -> Result<(), StoreError> {
        require_key(&run.task_key)?;
        let now = self.clock.now();
        let mut tx = self.pool.begin().await.map_err(StoreError::transient)?;

        let exists = sqlx::query("SELECT task_key FROM task_run WHERE task_key = ? FOR UPDATE")
            .bind(&run.task_key)
            .fetch_optional(&mut *tx)
            .await
            .map_err(task_error(&run.task_key))?;
        if exists.is_none() {
            return Err(StoreError::task_not_found(&run.task_key));
        }
        upsert_run(&mut *tx, run, now).await?;
        tx.commit().await.map_err(task_error(&run.task_key))?;
        Ok(())
    }

    async fn finish_task(
        &self,
        task_key: &str,
        status: TaskStatus,
        msg: &str,
        result: Option<&serde_json::Value>,
    ) -> Result<(), StoreError> {
        validate_finish(task_key, status)?;
        let now = self.clock.now();
        let mut tx = self.pool.begin().await.map_err(StoreError::transient)?;

        let mut stored = lock_task(&mut *tx, task_key).await?;
        let unchanged =
            stored.status == status && stored.msg == msg && stored.result.as_ref() == result;
        if !unchanged {
            stored.status = status;
            stored.msg = msg.to_string();
            stored.result = result.cloned();
            write_task(&mut *tx, &stored, now).await?;
        }
        delete_run(&mut *tx, task_key).await?;
        tx.commit().await.map_err(task_error(task_key))?;

        debug!(task_key, %status, "task finished");
        Ok(())
    }

    async fn get_task(&self, task_key: &str) -> Result<Task, StoreError> {
        let sql = format!("SELECT {TASK_COLUMNS} FROM task WHERE task_key = ?");
        sqlx::query_as::<_, TaskRow>(&sql)
            .bind(task_key)
            .fetch_optional(&self.pool)
            .await
            .map_err(task_error(task_key))?
            .ok_or_else(|| StoreError::task_not_found(task_key))?
            .into_task()
    }

    async fn batch_get_task(&self, task_keys: &[String]) -> Result<Vec<Task>, StoreError> {
        if task_keys.is_empty() {
            return Ok(Vec::new());
        }
        let mut query = QueryBuilder::<MySql>::new(format!(
            "SELECT {TASK_COLUMNS} FROM task WHERE task_key IN ("
        ));
        let mut keys = query.separated(", ");
        for key in task_keys {
            keys.push_bind(key);
        }
        query.push(")");

        let rows = query
            .build_query_as::<TaskRow>()
            .fetch_all(&self.pool)
            .await
            .map_err(StoreError::transient)?;
        let tasks = rows
            .into_iter()
            .map(TaskRow::into_task)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(in_request_order(task_keys, tasks))
    }

    async fn list_task(&self, filter: &TaskFilter) -> Result<Vec<Task>, StoreError> {
        let mut query =
            QueryBuilder::<MySql>::new(format!("SELECT {TASK_COLUMNS} FROM task WHERE 1 = 1"));
        if !filter.biz_ids.is_empty() {
            query.push(" AND biz_id IN (");
            let mut ids = query.separated(", ");
            for id in &filter.biz_ids {
                ids.push_bind(id);
            }
            query.push(")");
        }
        if !filter.biz_type.is_empty() {
            query.push(" AND biz_type = ").push_bind(&filter.biz_type);
        }
        if !filter.task_type.is_empty() {
            query.push(" AND type = ").push_bind(&filter.task_type);
        }
        query.push(" ORDER BY id");
        if filter.limit > 0 || filter.offset > 0 {
            let limit = if filter.limit == 0 {
                NO_LIMIT
            } else {
                filter.limit as u64
            };
            query
                .push(" LIMIT ")
                .push_bind(limit)
                .push(" OFFSET ")
                .push_bind(filter.offset as u64);
        }

        query
            .build_query_as::<TaskRow>()
            .fetch_all(&self.pool)
            .await
            .map_err(StoreError::transient)?
            .into_iter()
            .map(TaskRow::into_task)
            .collect()
    }

    async fn list_task_runs(&self) -> Result<Vec<TaskRun>, StoreError> {
        let sql = format!("SELECT {TASK_RUN_COLUMNS} FROM task_run ORDER BY task_key");
        sqlx::query_as::<_, TaskRunRow>(&sql)
            .fetch_all(&self.pool)
            .await
            .map_err(StoreError::transient)?
            .into_iter()
            .map(TaskRunRow::into_run)
            .collect()
    }

    async fn list_runnable_tasks(&self, worker_id: &str) -> Result<Vec<Task>, StoreError> {
        let now = self.clock.now();
        let mut query = QueryBuilder::<MySql>::new(format!(
            "SELECT {TASK_COLUMNS_T} FROM task t JOIN task_run r ON r.task_key = t.task_key \
             WHERE r.next_run_at IS NOT NULL AND r.next_run_at <= "
        ));
        query.push_bind(now);
        if !worker_id.is_empty() {
            query.push(" AND r.worker_id = ").push_bind(worker_id);
        }
        query.push(" ORDER BY r.next_run_at, r.task_key");

        query
            .build_query_as::<TaskRow>()
            .fetch_all(&self.pool)
            .await
            .map_err(StoreError::transient)?
            .into_iter()
            .map(TaskRow::into_task)
            .collect()
    }

    async fn batch_get_want_task(&self, task_keys: &[String]) -> Result<Vec<Task>, StoreError> {
        if task_keys.is_empty() {
            return Ok(Vec::new());
        }
        let mut query = QueryBuilder::<MySql>::new(format!(
            "SELECT {TASK_COLUMNS_T}, r.want_run_status FROM task t \
             JOIN task_run r ON r.task_key = t.task_key WHERE t.task_key IN ("
        ));
        let mut keys = query.separated(", ");
        for key in task_keys {
            keys.push_bind(key);
        }
        query.push(")");

        let tasks = query
            .build_query_as::<WantTaskRow>()
            .fetch_all(&self.pool)
            .await
            .map_err(StoreError::transient)?
            .into_iter()
            .map(WantTaskRow::into_want_task)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(in_request_order(task_keys, tasks))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_order_drops_missing_keys() {
        let tasks = vec![Task::new("b", "email", "{}"), Task::new("a", "email", "{}")];
        let keys = vec!["a".to_string(), "missing".to_string(), "b".to_string()];
        let ordered: Vec<String> = in_request_order(&keys, tasks)
            .into_iter()
            .map(|task| task.task_key)
            .collect();
        assert_eq!(ordered, vec!["a", "b"]);
    }

    #[test]
    fn request_order_keeps_first_of_repeated_keys() {
        let tasks = vec![Task::new("a", "email", "{}"), Task::new("b", "email", "{}")];
        let keys = vec!["b".to_string(), "a".to_string(), "b".to_string()];
        let ordered: Vec<String> = in_request_order(&keys, tasks)
            .into_iter()
            .map(|task| task.task_key)
            .collect();
        assert_eq!(ordered, vec!["b", "a"]);
    }
}
