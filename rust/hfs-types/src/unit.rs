//! Resource units: the tree nodes of the cluster capacity view.

use crate::resource::{LabelMap, Resources};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Which view a unit tree belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ResourceType {
    /// Physical capacity.
    Primary,
    /// Overlay views, e.g. heterogeneous accelerators.
    Virtual,
}

/// Counts of agents able to host a monopoly or shared slot of one
/// exact (proportion, memory) footprint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct BucketInfo {
    pub monopoly_num: i32,
    pub shared_num: i32,
}

impl BucketInfo {
    pub fn new(monopoly_num: i32, shared_num: i32) -> Self {
        Self { monopoly_num, shared_num }
    }
}

/// One (proportion, memory) bucket: the aggregate count plus the
/// per-agent breakdown still allocatable.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Bucket {
    pub total: BucketInfo,
    /// agent id -> what that agent can still host.
    pub allocatable: BTreeMap<String, BucketInfo>,
}

/// Buckets of one proportion, keyed by memory string.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct BucketIndex {
    pub buckets: BTreeMap<String, Bucket>,
}

/// Render a memory/cpu proportion the way bucket keys expect it.
/// Fixed six decimal places keeps keys stable across producers.
pub fn proportion_key(mem: f64, cpu: f64) -> String {
    format!("{:.6}", mem / cpu)
}

/// Render a memory amount as a bucket key.
pub fn memory_key(mem: f64) -> String {
    format!("{:.6}", mem)
}

/// A node of the capacity tree: cluster root, domain, local node or a
/// single agent. Invariants: the sum of fragment capacities equals
/// `capacity`; `allocatable <= capacity` elementwise; label counters
/// stay non-negative.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ResourceUnit {
    pub id: String,
    pub owner_id: String,
    pub capacity: Resources,
    pub allocatable: Resources,
    pub node_labels: LabelMap,
    /// child id -> child unit.
    pub fragment: BTreeMap<String, ResourceUnit>,
    /// proportion key -> memory key -> bucket. Precise-match
    /// acceleration for monopoly scheduling.
    pub bucket_indexes: BTreeMap<String, BucketIndex>,
    /// Revision of the last delta applied to this unit.
    pub mod_revision: i64,
}

impl ResourceUnit {
    pub fn new(id: impl Into<String>) -> Self {
        Self { id: id.into(), ..Default::default() }
    }

    pub fn with_capacity(mut self, capacity: Resources) -> Self {
        self.allocatable = capacity.clone();
        self.capacity = capacity;
        self
    }

    pub fn with_owner(mut self, owner_id: impl Into<String>) -> Self {
        self.owner_id = owner_id.into();
        self
    }

    pub fn with_labels(mut self, node_labels: LabelMap) -> Self {
        self.node_labels = node_labels;
        self
    }

    /// Insert a child and roll its capacity/allocatable into this unit.
    pub fn add_fragment(&mut self, mut child: ResourceUnit) {
        child.owner_id = self.id.clone();
        self.capacity.add(&child.capacity);
        self.allocatable.add(&child.allocatable);
        self.fragment.insert(child.id.clone(), child);
    }

    /// Remove a child and roll its aggregates back out. Returns the
    /// removed subtree when present.
    pub fn remove_fragment(&mut self, child_id: &str) -> Option<ResourceUnit> {
        let child = self.fragment.remove(child_id)?;
        self.capacity.sub(&child.capacity);
        self.allocatable.sub(&child.allocatable);
        Some(child)
    }

    /// Look up the bucket for an exact (cpu, mem) footprint.
    pub fn bucket(&self, cpu: f64, mem: f64) -> Option<&Bucket> {
        self.bucket_indexes
            .get(&proportion_key(mem, cpu))
            .and_then(|index| index.buckets.get(&memory_key(mem)))
    }

    /// Depth-first search for a unit id anywhere in this subtree.
    pub fn find(&self, unit_id: &str) -> Option<&ResourceUnit> {
        if self.id == unit_id {
            return Some(self);
        }
        self.fragment.values().find_map(|child| child.find(unit_id))
    }

    pub fn find_mut(&mut self, unit_id: &str) -> Option<&mut ResourceUnit> {
        if self.id == unit_id {
            return Some(self);
        }
        self.fragment.values_mut().find_map(|child| child.find_mut(unit_id))
    }
}

/// One element of a delta batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum UnitChange {
    /// Insert or replace a child subtree under the root.
    Upsert(ResourceUnit),
    /// Remove a child subtree.
    Remove { unit_id: String },
    /// Adjust allocatable amounts and labels of one unit in place.
    /// Negative amounts in `allocatable_delta` release capacity held
    /// back, positive amounts consume it.
    Adjust {
        unit_id: String,
        allocatable_delta: Resources,
        label_delta: LabelMap,
    },
}

/// A batch of additions, removals and adjustments carried between
/// tiers. Deltas apply in order and are rejected wholesale when the
/// revision is not newer than the last one applied.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceUnitChanges {
    pub resource_type: ResourceType,
    pub mod_revision: i64,
    pub changes: Vec<UnitChange>,
}

impl ResourceUnitChanges {
    pub fn new(resource_type: ResourceType, mod_revision: i64) -> Self {
        Self { resource_type, mod_revision, changes: Vec::new() }
    }

    pub fn with_change(mut self, change: UnitChange) -> Self {
        self.changes.push(change);
        self
    }

    /// The inverse batch: upserts cannot be inverted structurally and
    /// are skipped; adjustments negate. Used to roll a Reserve back.
    pub fn inverted(&self) -> ResourceUnitChanges {
        let changes = self
            .changes
            .iter()
            .filter_map(|change| match change {
                UnitChange::Adjust { unit_id, allocatable_delta, label_delta } => {
                    Some(UnitChange::Adjust {
                        unit_id: unit_id.clone(),
                        allocatable_delta: allocatable_delta.negated(),
                        label_delta: crate::resource::negated_labels(label_delta),
                    })
                }
                _ => None,
            })
            .collect();
        ResourceUnitChanges {
            resource_type: self.resource_type,
            mod_revision: self.mod_revision,
            changes,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fragment_aggregation_keeps_sums() {
        let mut local = ResourceUnit::new("local-1");
        local.add_fragment(
            ResourceUnit::new("agent-1").with_capacity(Resources::cpu_mem(1000.0, 1024.0)),
        );
        local.add_fragment(
            ResourceUnit::new("agent-2").with_capacity(Resources::cpu_mem(500.0, 512.0)),
        );
        assert_eq!(local.capacity.cpu(), Some(1500.0));
        assert_eq!(local.allocatable.mem(), Some(1536.0));

        local.remove_fragment("agent-2");
        assert_eq!(local.capacity.cpu(), Some(1000.0));
        assert_eq!(local.fragment.len(), 1);
    }

    #[test]
    fn bucket_lookup_uses_proportion_and_memory_keys() {
        let mut unit = ResourceUnit::new("agent-1");
        let mut index = BucketIndex::default();
        index.buckets.insert(
            memory_key(512.0),
            Bucket { total: BucketInfo::new(1, 0), allocatable: BTreeMap::new() },
        );
        unit.bucket_indexes.insert(proportion_key(512.0, 500.0), index);
        assert!(unit.bucket(500.0, 512.0).is_some());
        assert!(unit.bucket(500.0, 1024.0).is_none());
    }

    #[test]
    fn inverted_changes_negate_adjustments() {
        let delta = ResourceUnitChanges::new(ResourceType::Primary, 7).with_change(
            UnitChange::Adjust {
                unit_id: "agent-1".into(),
                allocatable_delta: Resources::cpu_mem(-500.0, -512.0),
                label_delta: LabelMap::new(),
            },
        );
        let inverse = delta.inverted();
        match &inverse.changes[0] {
            UnitChange::Adjust { allocatable_delta, .. } => {
                assert_eq!(allocatable_delta.cpu(), Some(500.0));
            }
            other => panic!("unexpected change: {other:?}"),
        }
    }
}
