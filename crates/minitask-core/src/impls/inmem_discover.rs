//! InMemoryDiscover - プロセス内のインスタンスレジストリ
//!
//! 外部レジストリを使わない単一ノード構成・テスト用。
//! 変更のたびに subscriber へ健全なインスタンス一覧を通知します。

use std::collections::BTreeMap;
use std::sync::Mutex;

use async_trait::async_trait;

use crate::domain::Instance;
use crate::ports::{Discover, DiscoverError, SubscribeCallback};

#[derive(Default)]
pub struct InMemoryDiscover {
    /// Keyed by `ip:port`.
    instances: Mutex<BTreeMap<String, Instance>>,
    subscribers: Mutex<Vec<SubscribeCallback>>,
}

impl InMemoryDiscover {
    pub fn new() -> Self {
        Self::default()
    }

    fn healthy(&self) -> Vec<Instance> {
        self.instances
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .filter(|i| i.is_available())
            .cloned()
            .collect()
    }

    /// Callbacks run under the subscriber lock; they must not subscribe.
    fn publish(&self) {
        let snapshot = self.healthy();
        let subscribers = self.subscribers.lock().unwrap_or_else(|e| e.into_inner());
        for callback in subscribers.iter() {
            callback(Ok(snapshot.clone()));
        }
    }
}

#[async_trait]
impl Discover for InMemoryDiscover {
    async fn list_healthy_instances(&self) -> Result<Vec<Instance>, DiscoverError> {
        Ok(self.healthy())
    }

    async fn register(&self, instance: &Instance) -> Result<bool, DiscoverError> {
        self.instances
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(instance.address(), instance.clone());
        self.publish();
        Ok(true)
    }

    async fn deregister(&self, instance: &Instance) -> Result<bool, DiscoverError> {
        let removed = self
            .instances
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&instance.address())
            .is_some();
        if removed {
            self.publish();
        }
        Ok(removed)
    }

    async fn update(&self, instance: &Instance) -> Result<(), DiscoverError> {
        {
            let mut instances = self.instances.lock().unwrap_or_else(|e| e.into_inner());
            let Some(slot) = instances.get_mut(&instance.address()) else {
                return Err(DiscoverError::NotRegistered(instance.address()));
            };
            *slot = instance.clone();
        }
        self.publish();
        Ok(())
    }

    async fn subscribe(&self, callback: SubscribeCallback) -> Result<(), DiscoverError> {
        callback(Ok(self.healthy()));
        self.subscribers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(callback);
        Ok(())
    }
}
