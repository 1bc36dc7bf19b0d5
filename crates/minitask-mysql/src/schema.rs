//! Schema bootstrap.
//!
//! Map columns (labels/taints/extra/result) are stored as JSON-encoded TEXT
//! and decoded in [`crate::row`].

use minitask_core::domain::StoreError;
use sqlx::MySqlPool;
use tracing::info;

pub const CREATE_LEADER_ELECTION: &str = r#"
CREATE TABLE IF NOT EXISTS leader_election (
    anchor           BIGINT       NOT NULL PRIMARY KEY,
    master_id        VARCHAR(128) NOT NULL DEFAULT '',
    ip               VARCHAR(64)  NOT NULL DEFAULT '',
    last_seen_active DATETIME(6)  NOT NULL
)
"#;

pub const CREATE_TASK: &str = r#"
CREATE TABLE IF NOT EXISTS task (
    id         BIGINT       NOT NULL AUTO_INCREMENT PRIMARY KEY,
    task_key   VARCHAR(191) NOT NULL,
    biz_id     VARCHAR(191) NOT NULL DEFAULT '',
    biz_type   VARCHAR(64)  NOT NULL DEFAULT '',
    type       VARCHAR(64)  NOT NULL,
    payload    LONGTEXT     NOT NULL,
    labels     TEXT         NULL,
    taints     TEXT         NULL,
    extra      TEXT         NULL,
    status     VARCHAR(16)  NOT NULL,
    worker_id  VARCHAR(128) NOT NULL DEFAULT '',
    msg        TEXT         NOT NULL,
    result     TEXT         NULL,
    created_at DATETIME(6)  NOT NULL,
    updated_at DATETIME(6)  NOT NULL,
    UNIQUE KEY uk_task_key (task_key),
    KEY idx_biz (biz_type, biz_id)
)
"#;

pub const CREATE_TASK_RUN: &str = r#"
CREATE TABLE IF NOT EXISTS task_run (
    id              BIGINT       NOT NULL AUTO_INCREMENT PRIMARY KEY,
    task_key        VARCHAR(191) NOT NULL,
    worker_id       VARCHAR(128) NOT NULL DEFAULT '',
    next_run_at     DATETIME(6)  NULL,
    want_run_status VARCHAR(16)  NOT NULL,
    created_at      DATETIME(6)  NOT NULL,
    updated_at      DATETIME(6)  NOT NULL,
    UNIQUE KEY uk_task_key (task_key),
    KEY idx_worker_next_run (worker_id, next_run_at)
)
"#;

/// Create the three tables if they do not exist yet. Safe to run on every
/// start.
pub async fn migrate(pool: &MySqlPool) -> Result<(), StoreError> {
    for ddl in [CREATE_LEADER_ELECTION, CREATE_TASK, CREATE_TASK_RUN] {
        sqlx::query(ddl)
            .execute(pool)
            .await
            .map_err(StoreError::transient)?;
    }
    info!("schema ready");
    Ok(())
}
