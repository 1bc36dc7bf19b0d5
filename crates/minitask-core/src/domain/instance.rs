use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// A worker instance as seen by the discovery registry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Instance {
    pub instance_id: String,
    pub ip: String,
    pub port: u16,
    pub enable: bool,
    pub healthy: bool,
    pub metadata: BTreeMap<String, String>,
}

impl Instance {
    pub fn new(instance_id: impl Into<String>, ip: impl Into<String>, port: u16) -> Self {
        Self {
            instance_id: instance_id.into(),
            ip: ip.into(),
            port,
            enable: true,
            healthy: true,
            metadata: BTreeMap::new(),
        }
    }

    /// Registry identity: address and port, independent of the instance id.
    pub fn address(&self) -> String {
        format!("{}:{}", self.ip, self.port)
    }

    pub fn is_available(&self) -> bool {
        self.enable && self.healthy
    }
}
