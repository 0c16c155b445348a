//! Default prefilter: candidate generation.

use crate::context::{PodSpec, PreAllocatedContext};
use crate::framework::{PreFilterPlugin, PreFilterResult};
use crate::names;
use hfs_types::resource::EPSILON;
use hfs_types::unit::{memory_key, proportion_key};
use hfs_types::{InstanceInfo, ResourceUnit, StatusCode};
use tracing::{debug, warn};

/// Two paths: the precise bucket lookup for monopoly requests and the
/// common all-fragments path for everything else.
pub struct DefaultPreFilter;

impl PreFilterPlugin for DefaultPreFilter {
    fn name(&self) -> &'static str {
        names::DEFAULT_PREFILTER
    }

    fn pre_filter(
        &self,
        ctx: &mut PreAllocatedContext,
        instance: &InstanceInfo,
        unit: &ResourceUnit,
    ) -> PreFilterResult {
        if !instance.resources.is_valid() {
            warn!(request_id = %instance.request_id, "invalid resource value in request");
            return PreFilterResult::fail(
                StatusCode::InvalidResourceParameter,
                "Invalid Instance Resource Value",
            );
        }
        let cpu = instance.resources.cpu().unwrap_or(0.0);
        let mem = instance.resources.mem().unwrap_or(0.0);
        debug!(
            request_id = %instance.request_id,
            instance_id = %instance.instance_id,
            cpu, mem, "prefilter"
        );

        if instance.is_monopoly() {
            self.precise(ctx, instance, unit, cpu, mem)
        } else {
            self.common(instance, unit)
        }
    }
}

impl DefaultPreFilter {
    /// Monopoly path: select only agents whose footprint matches the
    /// request exactly, via the bucket indexes.
    fn precise(
        &self,
        ctx: &mut PreAllocatedContext,
        instance: &InstanceInfo,
        unit: &ResourceUnit,
        cpu: f64,
        mem: f64,
    ) -> PreFilterResult {
        if unit.bucket_indexes.is_empty() {
            warn!(request_id = %instance.request_id, "bucket indexes are empty");
            return PreFilterResult::fail(
                StatusCode::ResourceNotEnough,
                "No Resource In Cluster",
            );
        }
        if cpu.abs() < EPSILON {
            return PreFilterResult::fail(
                StatusCode::InvalidResourceParameter,
                format!("Invalid CPU: {cpu:.6}"),
            );
        }
        let proportion = proportion_key(mem, cpu);
        let Some(index) = unit.bucket_indexes.get(&proportion) else {
            warn!(
                request_id = %instance.request_id,
                proportion, "no bucket for requested proportion"
            );
            return PreFilterResult::fail(
                StatusCode::ResourceNotEnough,
                format!("({}, {}) Not Found", cpu as i64, mem as i64),
            );
        };
        let Some(bucket) = index.buckets.get(&memory_key(mem)) else {
            return PreFilterResult::fail(
                StatusCode::ResourceNotEnough,
                format!("({}, {}) Not Found", cpu as i64, mem as i64),
            );
        };
        if bucket.total.monopoly_num == 0 {
            warn!(
                request_id = %instance.request_id,
                instance_id = %instance.instance_id,
                cpu, mem, "no monopoly-capable pod left for the footprint"
            );
            return PreFilterResult::fail(
                StatusCode::ResourceNotEnough,
                format!("({}, {}) Not Enough", cpu as i64, mem as i64),
            );
        }
        ctx.instance_feasible_pod_spec
            .entry(instance.instance_id.clone())
            .or_default()
            .push(PodSpec::new(proportion, memory_key(mem)));
        PreFilterResult::ok(bucket.allocatable.keys().cloned().collect())
    }

    /// Common path: every direct fragment is a candidate.
    fn common(&self, instance: &InstanceInfo, unit: &ResourceUnit) -> PreFilterResult {
        if unit.fragment.is_empty() {
            warn!(request_id = %instance.request_id, "fragment in resource unit is empty");
            return PreFilterResult::fail(
                StatusCode::ResourceNotEnough,
                "No Resource In Cluster",
            );
        }
        PreFilterResult::ok(unit.fragment.keys().cloned().collect())
    }
}
