//! The agents hosted on this node.

use async_trait::async_trait;
use hfs_types::{Resources, Status, StatusCode};
use parking_lot::Mutex;
use std::collections::HashMap;

/// Contract towards the function-agent runtime on this node: the
/// scheduler only ever lists agents and asks for evictions; process
/// and container handling live elsewhere.
#[async_trait]
pub trait AgentManager: Send + Sync {
    /// Agents currently available, with their capacity.
    fn agents(&self) -> HashMap<String, Resources>;

    /// Evict (or pre-empt) instances by id; best-effort.
    async fn evict_instances(&self, instance_ids: &[String], is_preempt: bool) -> Status;

    /// Forward a kill to the instance's runtime.
    async fn kill_instance(&self, instance_id: &str) -> Status;
}

/// Fixed agent set; production wires the real agent runtime, tests
/// and single-node deployments use this.
#[derive(Default)]
pub struct StaticAgentManager {
    agents: Mutex<HashMap<String, Resources>>,
    evicted: Mutex<Vec<String>>,
}

impl StaticAgentManager {
    pub fn new(agents: HashMap<String, Resources>) -> Self {
        Self { agents: Mutex::new(agents), evicted: Mutex::new(Vec::new()) }
    }

    pub fn evicted(&self) -> Vec<String> {
        self.evicted.lock().clone()
    }
}

#[async_trait]
impl AgentManager for StaticAgentManager {
    fn agents(&self) -> HashMap<String, Resources> {
        self.agents.lock().clone()
    }

    async fn evict_instances(&self, instance_ids: &[String], _is_preempt: bool) -> Status {
        self.evicted.lock().extend(instance_ids.iter().cloned());
        Status::ok()
    }

    async fn kill_instance(&self, instance_id: &str) -> Status {
        if self.agents.lock().is_empty() {
            return Status::new(StatusCode::ErrInstanceExited, instance_id);
        }
        Status::ok()
    }
}
