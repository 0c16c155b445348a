//! Default feasibility filter: the monopoly and shared paths.

use super::{format_required, is_heterogeneous_name};
use crate::context::PreAllocatedContext;
use crate::framework::{FilterPlugin, Filtered};
use crate::names;
use hfs_types::resource::EPSILON;
use hfs_types::{InstanceInfo, ResourceUnit, StatusCode};
use tracing::debug;

pub struct DefaultFilter;

impl FilterPlugin for DefaultFilter {
    fn name(&self) -> &'static str {
        names::DEFAULT_FILTER
    }

    fn filter(
        &self,
        ctx: &mut PreAllocatedContext,
        instance: &InstanceInfo,
        unit: &ResourceUnit,
    ) -> Filtered {
        if instance.is_monopoly() {
            self.monopoly(ctx, instance, unit)
        } else {
            self.shared(ctx, instance, unit)
        }
    }
}

impl DefaultFilter {
    /// Monopoly: the agent must match the request footprint exactly,
    /// still host a monopoly slot, and not be claimed by an earlier
    /// candidate of the same attempt.
    fn monopoly(
        &self,
        ctx: &mut PreAllocatedContext,
        instance: &InstanceInfo,
        unit: &ResourceUnit,
    ) -> Filtered {
        let cpu = instance.resources.cpu().unwrap_or(0.0);
        let mem = instance.resources.mem().unwrap_or(0.0);
        let footprint = format!("({}, {})", cpu as i64, mem as i64);

        if ctx.selected_agent_set.contains(&unit.id) {
            return Filtered::fail(
                StatusCode::ResourceNotEnough,
                format!("[{footprint} Already Allocated To Other]"),
            );
        }
        if cpu.abs() < EPSILON {
            return Filtered::fail(
                StatusCode::InvalidResourceParameter,
                format!("[Invalid CPU: {cpu:.6}]"),
            );
        }
        let capacity_matches = unit.capacity.cpu().is_some_and(|c| (c - cpu).abs() < EPSILON)
            && unit.capacity.mem().is_some_and(|m| (m - mem).abs() < EPSILON);
        if !capacity_matches {
            return Filtered::fail(
                StatusCode::ResourceNotEnough,
                format!("[{footprint} Don't Match Precisely]"),
            );
        }
        let monopoly_available = unit
            .bucket(cpu, mem)
            .map(|bucket| bucket.total.monopoly_num)
            .unwrap_or_else(|| (unit.allocatable == unit.capacity) as i32);
        if monopoly_available == 0 {
            return Filtered::fail(
                StatusCode::ResourceNotEnough,
                format!("[{footprint} Not Enough]"),
            );
        }

        ctx.selected_agent_set.insert(unit.id.clone());
        ctx.selected_agent_map.insert(instance.instance_id.clone(), unit.id.clone());
        debug!(
            request_id = %instance.request_id,
            agent_id = %unit.id,
            "monopoly agent preallocated"
        );
        Filtered::ok_with_available(1)
    }

    /// Shared: every requested kind must fit inside
    /// allocatable − tentative; the result counts how many identical
    /// requests would still fit.
    fn shared(
        &self,
        ctx: &mut PreAllocatedContext,
        instance: &InstanceInfo,
        unit: &ResourceUnit,
    ) -> Filtered {
        if unit.capacity.is_empty() {
            return Filtered::fail(StatusCode::ResourceNotEnough, "[No Resources Available]");
        }
        let available = ctx.available_of(unit);
        let mut slots = i64::MAX;
        for (name, requested) in &instance.resources.resources {
            if is_heterogeneous_name(name) {
                continue;
            }
            let Some(requested) = requested.scalar() else {
                continue;
            };
            if requested.abs() < EPSILON {
                continue;
            }
            let Some(capacity) = unit.capacity.get_scalar(name) else {
                return Filtered::fail(StatusCode::ParameterError, format!("[{name}: Not Found]"))
                    .with_required(format_required(name, requested));
            };
            if requested > capacity + EPSILON {
                return Filtered::fail(
                    StatusCode::ResourceNotEnough,
                    format!("[{name}: Out Of Capacity]"),
                )
                .with_required(format_required(name, requested));
            }
            let free = available.get_scalar(name).unwrap_or(0.0);
            if requested > free + EPSILON {
                return Filtered::fail(
                    StatusCode::ResourceNotEnough,
                    format!("[{name}: Not Enough]"),
                )
                .with_required(format_required(name, requested));
            }
            slots = slots.min((free / requested).floor() as i64);
        }
        if slots == i64::MAX {
            // Nothing scalar was requested; the unit trivially fits.
            return Filtered::ok();
        }
        Filtered::ok_with_available(slots)
    }
}
