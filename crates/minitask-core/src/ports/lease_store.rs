//! LeaseStore port - leader_election の単一行を扱う分散ミューテックス
//!
//! # 実装
//! - InMemoryLeaseStore（impls、テスト・単一プロセス用）
//! - MysqlLeaseStore（`minitask-mysql` クレート）

use async_trait::async_trait;

use crate::domain::{LeaseClaim, LeaseOutcome, LeaseRecord, StoreError};

/// LeaseStore は lease 行の読み取りと奪取を提供
///
/// # 設計原則
/// - `contend` は「排他読み取り（行ロック）→ decide → 書き込み」を一つのトランザクションで行う
/// - ロックなしの read-then-write は二重当選を起こすので禁止
/// - キャッシュしない（毎回ストアを読む）
#[async_trait]
pub trait LeaseStore: Send + Sync {
    /// Current lease row; `NotFound` if nobody has ever contended.
    async fn leader(&self) -> Result<LeaseRecord, StoreError>;

    /// One atomic contention attempt.
    async fn contend(&self, claim: &LeaseClaim) -> Result<LeaseOutcome, StoreError>;

    /// Vacate the seat if `candidate_id` holds it. Returns whether it did.
    async fn release(&self, candidate_id: &str) -> Result<bool, StoreError>;
}
