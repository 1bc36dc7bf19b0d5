//! InMemoryLeaseStore - 単一プロセス・テスト用の lease 行
//!
//! tokio Mutex が `SELECT ... FOR UPDATE` の行ロックに相当します。
//! 複数の LeaderElector が同じインスタンスを Arc で共有すると、
//! 別プロセスの競合をシミュレートできます。

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::debug;

use crate::domain::{LeaseClaim, LeaseOutcome, LeaseRecord, StoreError, resolve};
use crate::ports::LeaseStore;

#[derive(Default)]
pub struct InMemoryLeaseStore {
    row: Mutex<Option<LeaseRecord>>,
}

impl InMemoryLeaseStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl LeaseStore for InMemoryLeaseStore {
    async fn leader(&self) -> Result<LeaseRecord, StoreError> {
        self.row
            .lock()
            .await
            .clone()
            .ok_or_else(StoreError::lease_not_found)
    }

    async fn contend(&self, claim: &LeaseClaim) -> Result<LeaseOutcome, StoreError> {
        let mut row = self.row.lock().await;
        let outcome = resolve(row.clone(), claim);
        if outcome.action.record().is_some() {
            *row = Some(outcome.record.clone());
        }
        debug!(
            candidate = %claim.candidate_id,
            action = outcome.action.name(),
            master_id = %outcome.record.master_id,
            "lease contended"
        );
        Ok(outcome)
    }

    async fn release(&self, candidate_id: &str) -> Result<bool, StoreError> {
        let mut row = self.row.lock().await;
        match row.as_mut() {
            Some(record) if record.held_by(candidate_id) => {
                record.master_id.clear();
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::LeaseAction;
    use chrono::{DateTime, TimeZone, Utc};
    use std::time::Duration;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    fn claim(candidate: &str, now: i64) -> LeaseClaim {
        LeaseClaim {
            candidate_id: candidate.into(),
            ip: "127.0.0.1".into(),
            now: at(now),
            stale_after: Duration::from_secs(15),
        }
    }

    #[tokio::test]
    async fn leader_is_not_found_before_any_contention() {
        let store = InMemoryLeaseStore::new();
        assert!(store.leader().await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn contention_sequence() {
        let store = InMemoryLeaseStore::new();

        let first = store.contend(&claim("a", 0)).await.unwrap();
        assert!(matches!(first.action, LeaseAction::Acquire(_)));

        let blocked = store.contend(&claim("b", 10)).await.unwrap();
        assert_eq!(blocked.action, LeaseAction::Observe);
        assert_eq!(blocked.record.master_id, "a");

        let renewed = store.contend(&claim("a", 12)).await.unwrap();
        assert!(matches!(renewed.action, LeaseAction::Renew(_)));

        // a stops renewing at t=12; b takes over once t > 27.
        let still_blocked = store.contend(&claim("b", 27)).await.unwrap();
        assert_eq!(still_blocked.action, LeaseAction::Observe);
        let took_over = store.contend(&claim("b", 28)).await.unwrap();
        assert!(took_over.is_leader("b"));

        let stored = store.leader().await.unwrap();
        assert_eq!(stored.master_id, "b");
        assert_eq!(stored.last_seen_active, at(28));
    }

    #[tokio::test]
    async fn release_vacates_only_own_seat() {
        let store = InMemoryLeaseStore::new();
        store.contend(&claim("a", 0)).await.unwrap();

        assert!(!store.release("b").await.unwrap());
        assert!(store.release("a").await.unwrap());
        assert!(store.leader().await.unwrap().is_unheld());

        // The empty seat is taken without waiting for staleness.
        let outcome = store.contend(&claim("b", 1)).await.unwrap();
        assert!(outcome.is_leader("b"));
    }
}
