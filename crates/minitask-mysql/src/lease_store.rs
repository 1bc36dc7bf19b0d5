//! MysqlLeaseStore - leader_election 行による分散ミューテックス
//!
//! # contend のフロー
//! 1. BEGIN
//! 2. `SELECT ... FOR UPDATE` で anchor 行をロック
//! 3. `resolve()` で action を決める
//! 4. INSERT（初回）または UPDATE（renew / take over）
//! 5. COMMIT
//!
//! 行ロックを取ってから判断するので、stale な lease を二つのプロセスが
//! 同時に奪うことはない。

use async_trait::async_trait;
use minitask_core::domain::{
    LEASE_ANCHOR, LeaseAction, LeaseClaim, LeaseOutcome, LeaseRecord, StoreError, resolve,
};
use minitask_core::ports::LeaseStore;
use sqlx::{MySqlConnection, MySqlPool};
use tracing::debug;

use crate::error::{classify, is_duplicate_key};
use crate::row::{LEASE_COLUMNS, LeaseRow};

const ENTITY: &str = "leader_election";

#[derive(Clone)]
pub struct MysqlLeaseStore {
    pool: MySqlPool,
}

impl MysqlLeaseStore {
    pub fn new(pool: MySqlPool) -> Self {
        Self { pool }
    }
}

fn lease_error(err: sqlx::Error) -> StoreError {
    classify(err, ENTITY, &LEASE_ANCHOR.to_string())
}

async fn insert(conn: &mut MySqlConnection, record: &LeaseRecord) -> Result<(), sqlx::Error> {
    sqlx::query(
        "INSERT INTO leader_election (anchor, master_id, ip, last_seen_active) VALUES (?, ?, ?, ?)",
    )
    .bind(record.anchor)
    .bind(&record.master_id)
    .bind(&record.ip)
    .bind(record.last_seen_active)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

async fn update(conn: &mut MySqlConnection, record: &LeaseRecord) -> Result<(), sqlx::Error> {
    sqlx::query(
        "UPDATE leader_election SET master_id = ?, ip = ?, last_seen_active = ? WHERE anchor = ?",
    )
    .bind(&record.master_id)
    .bind(&record.ip)
    .bind(record.last_seen_active)
    .bind(record.anchor)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

#[async_trait]
impl LeaseStore for MysqlLeaseStore {
    async fn leader(&self) -> Result<LeaseRecord, StoreError> {
        let sql = format!("SELECT {LEASE_COLUMNS} FROM leader_election WHERE anchor = ?");
        sqlx::query_as::<_, LeaseRow>(&sql)
            .bind(LEASE_ANCHOR)
            .fetch_optional(&self.pool)
            .await
            .map_err(lease_error)?
            .map(LeaseRecord::from)
            .ok_or_else(StoreError::lease_not_found)
    }

    async fn contend(&self, claim: &LeaseClaim) -> Result<LeaseOutcome, StoreError> {
        let mut tx = self.pool.begin().await.map_err(lease_error)?;

        let sql =
            format!("SELECT {LEASE_COLUMNS} FROM leader_election WHERE anchor = ? FOR UPDATE");
        let existing = sqlx::query_as::<_, LeaseRow>(&sql)
            .bind(LEASE_ANCHOR)
            .fetch_optional(&mut *tx)
            .await
            .map_err(lease_error)?
            .map(LeaseRecord::from);

        let outcome = resolve(existing, claim);
        match &outcome.action {
            LeaseAction::Acquire(record) => {
                if let Err(err) = insert(&mut *tx, record).await {
                    if let sqlx::Error::Database(db) = &err
                        && is_duplicate_key(db.as_ref())
                    {
                        // Another contender created the row first.
                        drop(tx);
                        debug!(candidate = %claim.candidate_id, "lease row created concurrently");
                        let record = self.leader().await?;
                        return Ok(LeaseOutcome {
                            action: LeaseAction::Observe,
                            record,
                        });
                    }
                    return Err(lease_error(err));
                }
            }
            LeaseAction::TakeOver(record) | LeaseAction::Renew(record) => {
                update(&mut *tx, record).await.map_err(lease_error)?;
            }
            LeaseAction::Observe => {}
        }
        tx.commit().await.map_err(lease_error)?;

        debug!(
            candidate = %claim.candidate_id,
            action = outcome.action.name(),
            master_id = %outcome.record.master_id,
            "lease contended"
        );
        Ok(outcome)
    }

    async fn release(&self, candidate_id: &str) -> Result<bool, StoreError> {
        if candidate_id.is_empty() {
            return Ok(false);
        }
        let result = sqlx::query(
            "UPDATE leader_election SET master_id = '' WHERE anchor = ? AND master_id = ?",
        )
        .bind(LEASE_ANCHOR)
        .bind(candidate_id)
        .execute(&self.pool)
        .await
        .map_err(lease_error)?;
        Ok(result.rows_affected() > 0)
    }
}
