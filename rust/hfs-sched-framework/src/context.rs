//! Per-attempt preallocation context.

use hfs_types::plugin::{affinity_context, PluginContextMap};
use hfs_types::resource::LabelMap;
use hfs_types::{BucketInfo, Resources};
use std::collections::{HashMap, HashSet};

/// The (proportion, memory) key of a bucket.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PodSpec {
    pub proportion: String,
    pub mem: String,
}

impl PodSpec {
    pub fn new(proportion: impl Into<String>, mem: impl Into<String>) -> Self {
        Self { proportion: proportion.into(), mem: mem.into() }
    }
}

/// Monopoly/shared slot counts of one pod spec.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PodInfo {
    pub mono_num: i32,
    pub shared_num: i32,
}

impl From<&BucketInfo> for PodInfo {
    fn from(info: &BucketInfo) -> Self {
        Self { mono_num: info.monopoly_num, shared_num: info.shared_num }
    }
}

/// Mutable state of one scheduling attempt. Constructed fresh per
/// attempt and never mutated after the attempt commits.
#[derive(Debug, Default)]
pub struct PreAllocatedContext {
    /// unit id -> tentative resource delta consumed by this attempt.
    pub allocated: HashMap<String, Resources>,
    /// Units shown infeasible by earlier stages.
    pub conflict_nodes: HashSet<String>,
    /// instance id -> feasible pod specs.
    pub instance_feasible_pod_spec: HashMap<String, Vec<PodSpec>>,
    /// instance id -> agent selected during preallocation.
    pub selected_agent_map: HashMap<String, String>,
    /// Agents already claimed by a monopoly preallocation.
    pub selected_agent_set: HashSet<String>,
    /// Cross-tier plugin state (copied from the request, copied back
    /// on completion).
    pub plugin_context: PluginContextMap,
    /// unit id -> labels of instances tentatively reserved there.
    pub allocated_labels: HashMap<String, LabelMap>,
    /// local id -> labels aggregated over all children of that node.
    pub all_local_labels: HashMap<String, LabelMap>,
    /// request id -> unit id -> default-plugin score.
    pub request_default_scores: HashMap<String, HashMap<String, i64>>,
}

impl PreAllocatedContext {
    pub fn new(plugin_context: PluginContextMap) -> Self {
        Self { plugin_context, ..Default::default() }
    }

    /// False once the node was tagged infeasible by an earlier stage.
    pub fn check_node_feasible(&self, owner_id: &str) -> bool {
        owner_id.is_empty() || !self.conflict_nodes.contains(owner_id)
    }

    pub fn tag_node_unfeasible(&mut self, owner_id: impl Into<String>) {
        self.conflict_nodes.insert(owner_id.into());
    }

    pub fn clear_unfeasible(&mut self) {
        self.conflict_nodes.clear();
    }

    /// Tentative free amounts of a unit: its allocatable minus what
    /// this attempt already reserved on it.
    pub fn available_of(&self, unit: &hfs_types::ResourceUnit) -> Resources {
        let mut available = unit.allocatable.clone();
        if let Some(reserved) = self.allocated.get(&unit.id) {
            available.sub(reserved);
        }
        available
    }

    /// Record a tentative reservation on `unit_id`.
    pub fn reserve(&mut self, unit_id: &str, amount: &Resources, labels: &LabelMap) {
        self.allocated.entry(unit_id.to_string()).or_default().add(amount);
        hfs_types::resource::merge_labels(
            self.allocated_labels.entry(unit_id.to_string()).or_default(),
            labels,
        );
    }

    pub fn is_top_down_scheduling(&mut self) -> bool {
        affinity_context(&mut self.plugin_context).is_top_down_scheduling
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hfs_types::ResourceUnit;

    #[test]
    fn available_subtracts_tentative_reservations() {
        let unit =
            ResourceUnit::new("agent-1").with_capacity(Resources::cpu_mem(1000.0, 1024.0));
        let mut ctx = PreAllocatedContext::default();
        ctx.reserve("agent-1", &Resources::cpu_mem(300.0, 256.0), &LabelMap::new());
        let available = ctx.available_of(&unit);
        assert_eq!(available.cpu(), Some(700.0));
        assert_eq!(available.mem(), Some(768.0));
    }

    #[test]
    fn unfeasible_tagging() {
        let mut ctx = PreAllocatedContext::default();
        assert!(ctx.check_node_feasible("local-1"));
        ctx.tag_node_unfeasible("local-1");
        assert!(!ctx.check_node_feasible("local-1"));
        ctx.clear_unfeasible();
        assert!(ctx.check_node_feasible("local-1"));
    }
}
