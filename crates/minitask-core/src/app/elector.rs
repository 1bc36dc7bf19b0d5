//! LeaderElector - lease ベースのリーダー選出
//!
//! # フロー（interval ごとに 1 回）
//! 1. LeaseStore::contend() で行ロック付きの奪取を試みる
//! 2. 失敗はログに出して次の tick を待つ（ループは止めない）
//! 3. shutdown 要求で抜け、保持していれば release() で席を空ける

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, info, warn};

use super::identity::Identity;
use super::service::{ServiceHandle, shutdown_requested};
use crate::domain::{LeaseClaim, LeaseOutcome, LeaseRecord, StoreError};
use crate::ports::{Clock, LeaseStore, with_deadline};

pub const DEFAULT_ELECTION_INTERVAL: Duration = Duration::from_secs(3);
pub const DEFAULT_STALE_AFTER: Duration = Duration::from_secs(15);
pub const DEFAULT_OP_TIMEOUT: Duration = Duration::from_secs(5);

pub struct LeaderElector {
    identity: Identity,
    store: Arc<dyn LeaseStore>,
    clock: Arc<dyn Clock>,
    interval: Duration,
    stale_after: Duration,
    op_timeout: Duration,
}

impl LeaderElector {
    pub fn new(identity: Identity, store: Arc<dyn LeaseStore>, clock: Arc<dyn Clock>) -> Self {
        Self {
            identity,
            store,
            clock,
            interval: DEFAULT_ELECTION_INTERVAL,
            stale_after: DEFAULT_STALE_AFTER,
            op_timeout: DEFAULT_OP_TIMEOUT,
        }
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn with_stale_after(mut self, stale_after: Duration) -> Self {
        self.stale_after = stale_after;
        self
    }

    pub fn with_op_timeout(mut self, op_timeout: Duration) -> Self {
        self.op_timeout = op_timeout;
        self
    }

    pub fn id(&self) -> &str {
        &self.identity.id
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn stale_after(&self) -> Duration {
        self.stale_after
    }

    /// Current lease row, read from the store on every call.
    pub async fn leader(&self) -> Result<LeaseRecord, StoreError> {
        with_deadline(self.op_timeout, self.store.leader()).await
    }

    pub fn am_i_leader(&self, lease: Option<&LeaseRecord>) -> bool {
        lease.is_some_and(|lease| lease.held_by(&self.identity.id))
    }

    /// `leader()` + `am_i_leader()`; no lease row yet means "not leader".
    pub async fn is_leader(&self) -> Result<bool, StoreError> {
        match self.leader().await {
            Ok(lease) => Ok(self.am_i_leader(Some(&lease))),
            Err(e) if e.is_not_found() => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// One contention attempt.
    pub async fn attempt_once(&self) -> Result<LeaseOutcome, StoreError> {
        let claim = LeaseClaim {
            candidate_id: self.identity.id.clone(),
            ip: self.identity.ip.clone(),
            now: self.clock.now(),
            stale_after: self.stale_after,
        };
        with_deadline(self.op_timeout, self.store.contend(&claim)).await
    }

    /// Run the contention loop on a background task.
    pub fn spawn(self: Arc<Self>) -> ServiceHandle {
        ServiceHandle::spawn("leader-elector", move |rx| async move {
            self.run(rx).await;
        })
    }

    async fn run(&self, mut shutdown_rx: watch::Receiver<bool>) {
        info!(
            id = %self.identity.id,
            interval_ms = self.interval.as_millis() as u64,
            stale_after_ms = self.stale_after.as_millis() as u64,
            "leader election started"
        );
        let mut leading = false;

        loop {
            if *shutdown_rx.borrow() {
                break;
            }

            match self.attempt_once().await {
                Ok(outcome) => {
                    let now_leading = outcome.is_leader(&self.identity.id);
                    if now_leading != leading {
                        if now_leading {
                            info!(
                                id = %self.identity.id,
                                action = outcome.action.name(),
                                "became leader"
                            );
                        } else {
                            warn!(
                                id = %self.identity.id,
                                leader = %outcome.record.master_id,
                                "lost leadership"
                            );
                        }
                    }
                    debug!(
                        action = outcome.action.name(),
                        master_id = %outcome.record.master_id,
                        "election tick"
                    );
                    leading = now_leading;
                }
                Err(e) => {
                    // Next tick retries; a store outage only delays convergence.
                    warn!(id = %self.identity.id, error = %e, "election attempt failed");
                }
            }

            tokio::select! {
                _ = shutdown_requested(&mut shutdown_rx) => break,
                _ = tokio::time::sleep(self.interval) => {}
            }
        }

        match with_deadline(self.op_timeout, self.store.release(&self.identity.id)).await {
            Ok(true) => info!(id = %self.identity.id, "leadership released"),
            Ok(false) => {}
            Err(e) => warn!(id = %self.identity.id, error = %e, "failed to release leadership"),
        }
        info!(id = %self.identity.id, "leader election stopped");
    }
}
