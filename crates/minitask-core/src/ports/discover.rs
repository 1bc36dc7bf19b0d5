//! Discover port - worker インスタンスの登録と発見
//!
//! このクレートは registry 自体を実装しません。スケジューラ側が
//! 「健全なインスタンス一覧」と「自インスタンスの登録/更新/解除」を
//! 使うための境界だけを定義します。

use async_trait::async_trait;
use thiserror::Error;

use crate::domain::Instance;

#[derive(Debug, Error)]
pub enum DiscoverError {
    #[error("instance not registered: {0}")]
    NotRegistered(String),

    #[error("registry unavailable: {0}")]
    Unavailable(String),
}

/// Callback invoked with the full healthy-instance list on every change.
pub type SubscribeCallback =
    Box<dyn Fn(Result<Vec<Instance>, DiscoverError>) + Send + Sync + 'static>;

#[async_trait]
pub trait Discover: Send + Sync {
    async fn list_healthy_instances(&self) -> Result<Vec<Instance>, DiscoverError>;

    async fn register(&self, instance: &Instance) -> Result<bool, DiscoverError>;

    async fn deregister(&self, instance: &Instance) -> Result<bool, DiscoverError>;

    async fn update(&self, instance: &Instance) -> Result<(), DiscoverError>;

    async fn subscribe(&self, callback: SubscribeCallback) -> Result<(), DiscoverError>;
}
