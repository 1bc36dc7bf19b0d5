//! CoordinatorBuilder - コーディネータの構築とワイヤリング
//!
//! # Fail-fast 設計
//! - ストアが揃っていなければ build() で BuildError
//! - 設定値の矛盾も build() 時に検出（起動後に気づかない）

use std::sync::Arc;

use crate::config::{ConfigError, CoordinatorConfig};
use crate::domain::StoreError;
use crate::ports::{Clock, LeaseStore, SystemClock, TaskStore};

use super::elector::LeaderElector;
use super::identity::Identity;
use super::poller::RunnablePoller;
use super::service::ServiceHandle;
use super::status::ClusterStatus;

/// # 使用例
/// ```ignore
/// let coordinator = CoordinatorBuilder::new()
///     .task_store(task_store)
///     .lease_store(lease_store)
///     .config(config)
///     .build()?;
/// let election = coordinator.start_election();
/// ```
pub struct CoordinatorBuilder {
    task_store: Option<Arc<dyn TaskStore>>,
    lease_store: Option<Arc<dyn LeaseStore>>,
    clock: Option<Arc<dyn Clock>>,
    identity: Option<Identity>,
    config: CoordinatorConfig,
}

#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    #[error("task store was not configured")]
    MissingTaskStore,

    #[error("lease store was not configured")]
    MissingLeaseStore,

    #[error(transparent)]
    InvalidConfig(#[from] ConfigError),
}

impl CoordinatorBuilder {
    pub fn new() -> Self {
        Self {
            task_store: None,
            lease_store: None,
            clock: None,
            identity: None,
            config: CoordinatorConfig::default(),
        }
    }

    pub fn task_store(mut self, store: Arc<dyn TaskStore>) -> Self {
        self.task_store = Some(store);
        self
    }

    pub fn lease_store(mut self, store: Arc<dyn LeaseStore>) -> Self {
        self.lease_store = Some(store);
        self
    }

    /// Defaults to [`SystemClock`].
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Overrides the identity otherwise resolved from `config.instance_id`.
    pub fn identity(mut self, identity: Identity) -> Self {
        self.identity = Some(identity);
        self
    }

    pub fn config(mut self, config: CoordinatorConfig) -> Self {
        self.config = config;
        self
    }

    pub fn build(self) -> Result<Coordinator, BuildError> {
        let task_store = self.task_store.ok_or(BuildError::MissingTaskStore)?;
        let lease_store = self.lease_store.ok_or(BuildError::MissingLeaseStore)?;
        self.config.validate()?;

        let clock = self.clock.unwrap_or_else(|| Arc::new(SystemClock));
        let identity = self
            .identity
            .unwrap_or_else(|| Identity::resolve(self.config.instance_id.as_deref()));
        let elector = Arc::new(
            LeaderElector::new(identity, lease_store.clone(), clock.clone())
                .with_interval(self.config.election.interval())
                .with_stale_after(self.config.election.stale_after())
                .with_op_timeout(self.config.store.op_timeout()),
        );

        Ok(Coordinator {
            task_store,
            lease_store,
            clock,
            elector,
            config: self.config,
        })
    }
}

impl Default for CoordinatorBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Wired coordination core: one elector per process, pollers on demand.
pub struct Coordinator {
    task_store: Arc<dyn TaskStore>,
    lease_store: Arc<dyn LeaseStore>,
    clock: Arc<dyn Clock>,
    elector: Arc<LeaderElector>,
    config: CoordinatorConfig,
}

impl Coordinator {
    pub fn id(&self) -> &str {
        self.elector.id()
    }

    pub fn task_store(&self) -> &Arc<dyn TaskStore> {
        &self.task_store
    }

    pub fn elector(&self) -> &Arc<LeaderElector> {
        &self.elector
    }

    pub fn config(&self) -> &CoordinatorConfig {
        &self.config
    }

    pub fn start_election(&self) -> ServiceHandle {
        self.elector.clone().spawn()
    }

    /// Poller configured from `[poll]` and `[store]`. Pass `""` to discover
    /// due work for every worker.
    pub fn poller(&self, worker_id: impl Into<String>) -> Arc<RunnablePoller> {
        Arc::new(
            RunnablePoller::new(self.task_store.clone(), worker_id)
                .with_interval(self.config.poll.interval())
                .with_op_timeout(self.config.store.op_timeout()),
        )
    }

    pub async fn status(&self) -> Result<ClusterStatus, StoreError> {
        ClusterStatus::collect(
            self.elector.id(),
            self.lease_store.as_ref(),
            self.task_store.as_ref(),
            self.clock.as_ref(),
            self.config.store.op_timeout(),
        )
        .await
    }
}
