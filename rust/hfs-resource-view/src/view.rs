//! One unit tree plus its change log.

use hfs_types::resource::merge_labels;
use hfs_types::unit::{memory_key, proportion_key, Bucket, BucketIndex, BucketInfo};
use hfs_types::{ResourceType, ResourceUnit, ResourceUnitChanges, UnitChange};
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ResourceViewError {
    #[error("unit {0} not found in view")]
    UnitNotFound(String),
    #[error("stale delta: revision {got} <= applied {applied}")]
    StaleRevision { got: i64, applied: i64 },
    #[error("unknown resource type")]
    UnknownResourceType,
    #[error("resource view actor closed")]
    ViewClosed,
}

pub type ResourceViewResult<T> = Result<T, ResourceViewError>;

/// A single unit tree (one ResourceType) with pending-change
/// accounting. Aggregation is eventually consistent under reordered
/// deltas: any batch whose revision is not newer than the last applied
/// one is rejected.
pub struct ResourceView {
    root: ResourceUnit,
    applied_revision: i64,
    next_revision: i64,
    pending: Vec<UnitChange>,
    resource_type: ResourceType,
}

impl ResourceView {
    pub fn new(root_id: impl Into<String>, resource_type: ResourceType) -> Self {
        Self {
            root: ResourceUnit::new(root_id),
            applied_revision: 0,
            next_revision: 1,
            pending: Vec::new(),
            resource_type,
        }
    }

    pub fn root(&self) -> &ResourceUnit {
        &self.root
    }

    pub fn snapshot(&self) -> ResourceUnit {
        self.root.clone()
    }

    /// Insert or replace the subtree advertised by an underlayer.
    pub fn register(
        &mut self,
        mut unit: ResourceUnit,
        name: &str,
        url: &str,
    ) -> ResourceViewResult<()> {
        debug!(unit_id = %unit.id, name, url, "register resource unit");
        if unit.id.is_empty() {
            unit.id = name.to_string();
        }
        self.root.remove_fragment(&unit.id);
        self.root.add_fragment(unit.clone());
        self.rebuild_buckets();
        self.record(UnitChange::Upsert(unit));
        Ok(())
    }

    pub fn unregister(&mut self, unit_id: &str) -> ResourceViewResult<()> {
        if self.root.remove_fragment(unit_id).is_none() {
            return Err(ResourceViewError::UnitNotFound(unit_id.to_string()));
        }
        self.rebuild_buckets();
        self.record(UnitChange::Remove { unit_id: unit_id.to_string() });
        Ok(())
    }

    /// Apply a delta batch in order. The whole batch is rejected when
    /// its revision is not newer than the last applied one.
    pub fn apply_delta(&mut self, changes: ResourceUnitChanges) -> ResourceViewResult<()> {
        if changes.mod_revision != 0 && changes.mod_revision <= self.applied_revision {
            warn!(
                got = changes.mod_revision,
                applied = self.applied_revision,
                "rejecting stale resource delta"
            );
            return Err(ResourceViewError::StaleRevision {
                got: changes.mod_revision,
                applied: self.applied_revision,
            });
        }
        for change in changes.changes {
            self.apply_change(change)?;
        }
        if changes.mod_revision != 0 {
            self.applied_revision = changes.mod_revision;
        }
        Ok(())
    }

    fn apply_change(&mut self, change: UnitChange) -> ResourceViewResult<()> {
        match change {
            UnitChange::Upsert(unit) => {
                self.root.remove_fragment(&unit.id);
                self.root.add_fragment(unit.clone());
                self.rebuild_buckets();
                self.record(UnitChange::Upsert(unit));
            }
            UnitChange::Remove { unit_id } => {
                self.root.remove_fragment(&unit_id);
                self.rebuild_buckets();
                self.record(UnitChange::Remove { unit_id });
            }
            UnitChange::Adjust { unit_id, allocatable_delta, label_delta } => {
                self.adjust(&unit_id, &allocatable_delta, &label_delta)?;
                self.record(UnitChange::Adjust { unit_id, allocatable_delta, label_delta });
            }
        }
        Ok(())
    }

    /// Consume (positive delta) or release (negative delta)
    /// allocatable amounts on one unit, rolling the adjustment through
    /// every ancestor so aggregate sums stay consistent.
    fn adjust(
        &mut self,
        unit_id: &str,
        allocatable_delta: &hfs_types::Resources,
        label_delta: &hfs_types::resource::LabelMap,
    ) -> ResourceViewResult<()> {
        let path = path_to(&self.root, unit_id)
            .ok_or_else(|| ResourceViewError::UnitNotFound(unit_id.to_string()))?;
        let mut node = &mut self.root;
        node.allocatable.sub(allocatable_delta);
        for hop in path {
            node = node.fragment.get_mut(&hop).expect("path hop resolved during lookup");
            node.allocatable.sub(allocatable_delta);
        }
        merge_labels(&mut node.node_labels, label_delta);
        self.rebuild_buckets();
        Ok(())
    }

    fn record(&mut self, change: UnitChange) {
        self.pending.push(change);
    }

    /// Hand out everything recorded since the last drain, stamped with
    /// a fresh revision. None when nothing changed.
    pub fn drain_changes(&mut self) -> Option<ResourceUnitChanges> {
        if self.pending.is_empty() {
            return None;
        }
        let revision = self.next_revision;
        self.next_revision += 1;
        Some(ResourceUnitChanges {
            resource_type: self.resource_type,
            mod_revision: revision,
            changes: std::mem::take(&mut self.pending),
        })
    }

    /// Recompute the precise-match bucket indexes of the root and of
    /// every direct child from the agent leaves below them. An agent
    /// counts as monopoly-capable while untouched, and as a shared
    /// host while its free amounts still cover its own footprint.
    fn rebuild_buckets(&mut self) {
        for child in self.root.fragment.values_mut() {
            rebuild_unit_buckets(child);
        }
        rebuild_unit_buckets(&mut self.root);
    }
}

fn path_to(root: &ResourceUnit, unit_id: &str) -> Option<Vec<String>> {
    if root.id == unit_id {
        return Some(Vec::new());
    }
    for (child_id, child) in &root.fragment {
        if let Some(mut path) = path_to(child, unit_id) {
            path.insert(0, child_id.clone());
            return Some(path);
        }
    }
    None
}

fn agent_leaves(unit: &ResourceUnit) -> Vec<&ResourceUnit> {
    if unit.fragment.is_empty() {
        return vec![unit];
    }
    unit.fragment.values().flat_map(agent_leaves).collect()
}

fn rebuild_unit_buckets(unit: &mut ResourceUnit) {
    let mut indexes: std::collections::BTreeMap<String, BucketIndex> = Default::default();
    for agent in agent_leaves(unit) {
        let (Some(cpu), Some(mem)) = (agent.capacity.cpu(), agent.capacity.mem()) else {
            continue;
        };
        if cpu.abs() < hfs_types::resource::EPSILON {
            continue;
        }
        let monopoly = agent.allocatable == agent.capacity;
        let shared = agent.allocatable.covers(&agent.capacity);
        let info = BucketInfo::new(monopoly as i32, (!monopoly && shared) as i32);
        let bucket = indexes
            .entry(proportion_key(mem, cpu))
            .or_default()
            .buckets
            .entry(memory_key(mem))
            .or_insert_with(Bucket::default);
        bucket.total.monopoly_num += info.monopoly_num;
        bucket.total.shared_num += info.shared_num;
        bucket.allocatable.insert(agent.id.clone(), info);
    }
    unit.bucket_indexes = indexes;
}
