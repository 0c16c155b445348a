//! TOML configuration with HFS_ environment overrides.

use serde::{Deserialize, Serialize};
use std::path::Path;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeRole {
    Global,
    Domain,
    Local,
}

impl std::fmt::Display for NodeRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let role = match self {
            NodeRole::Global => "global",
            NodeRole::Domain => "domain",
            NodeRole::Local => "local",
        };
        f.write_str(role)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    pub role: NodeRole,
    pub node_id: String,
    pub address: String,
    pub global_address: String,
    /// Listen address of the health endpoint.
    pub health_listen: String,
    pub meta_prefix: String,
    pub business_id: String,
    pub az: String,
    /// TTL of the bus-proxy lease in seconds.
    pub service_ttl_secs: i64,
    pub heartbeat_interval_ms: u64,
    pub heartbeat_max_times: u32,
    pub dispatch_timeout_ms: u64,
    pub relaxed_affinity: bool,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            role: NodeRole::Local,
            node_id: "node-1".into(),
            address: "inproc://node-1".into(),
            global_address: "inproc://global".into(),
            health_listen: "127.0.0.1:8320".into(),
            meta_prefix: "hfs".into(),
            business_id: "default".into(),
            az: "az0".into(),
            service_ttl_secs: 8,
            heartbeat_interval_ms: 1000,
            heartbeat_max_times: 3,
            dispatch_timeout_ms: 20_000,
            relaxed_affinity: false,
        }
    }
}

impl NodeConfig {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        let mut config: NodeConfig = toml::from_str(&raw)?;
        config.apply_env_overrides();
        Ok(config)
    }

    /// `HFS_NODE_ID` and friends override the file.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(value) = std::env::var("HFS_NODE_ID") {
            self.node_id = value;
        }
        if let Ok(value) = std::env::var("HFS_ADDRESS") {
            self.address = value;
        }
        if let Ok(value) = std::env::var("HFS_GLOBAL_ADDRESS") {
            self.global_address = value;
        }
        if let Ok(value) = std::env::var("HFS_HEALTH_LISTEN") {
            self.health_listen = value;
        }
    }
}
