//! Label affinity filter, in the relaxed/strict × root/non-root
//! variants.
//!
//! Required selectors are hard constraints; preferred selectors only
//! influence scoring — except in strict mode once the request flows
//! top-down, where a unit must also reach the optimal preferred score
//! to pass. At the root of the tree, required selectors carrying
//! `order_priority` are deferred preferences: child tiers have finer
//! label information and will rank them.

use crate::context::PreAllocatedContext;
use crate::framework::{FilterPlugin, Filtered};
use crate::names;
use crate::selector::{
    describe, is_affinity_priority, meets_optimal, required_affinity_pass,
    required_anti_affinity_pass,
};
use hfs_types::plugin::affinity_context;
use hfs_types::resource::{merged_labels, LabelMap};
use hfs_types::{
    AffinityScope, AffinityTree, InstanceInfo, ResourceUnit, ScopedSelectors, StatusCode,
};
use tracing::{debug, warn};

pub struct LabelAffinityFilter {
    relaxed: bool,
    root_level: bool,
}

impl LabelAffinityFilter {
    pub fn new(relaxed: bool, root_level: bool) -> Self {
        Self { relaxed, root_level }
    }

    fn affinity_of(instance: &InstanceInfo) -> Option<&AffinityTree> {
        instance.schedule_option.affinity.as_ref()
    }

    /// Does the instance carry any hard constraint worth filtering on?
    fn needs_label_filter(affinity: &AffinityTree) -> bool {
        let scoped_required = |selectors: &ScopedSelectors| selectors.has_required();
        affinity.instance.as_ref().is_some_and(|a| scoped_required(&a.selectors))
            || affinity.resource.as_ref().is_some_and(|a| scoped_required(&a.selectors))
            || affinity.inner.as_ref().is_some_and(|inner| {
                !inner.pending.is_empty()
                    || inner
                        .rgroup
                        .as_ref()
                        .is_some_and(|selectors| selectors.required_affinity.is_some())
                    || inner
                        .grouplb
                        .as_ref()
                        .is_some_and(|selectors| selectors.required_anti_affinity.is_some())
            })
    }

    /// Does the instance carry anything the scorer would rank?
    fn needs_affinity_scorer(affinity: &AffinityTree) -> bool {
        let scored = |selectors: &ScopedSelectors| {
            selectors.has_preferred()
                || selectors.required_affinity.as_ref().is_some_and(is_affinity_priority)
                || selectors.required_anti_affinity.as_ref().is_some_and(is_affinity_priority)
        };
        affinity.instance.as_ref().is_some_and(|a| scored(&a.selectors))
            || affinity.resource.as_ref().is_some_and(|a| scored(&a.selectors))
            || affinity.inner.as_ref().is_some_and(|inner| {
                inner.preempt.as_ref().is_some_and(|s| s.has_preferred())
                    || inner.data.as_ref().is_some_and(|s| s.has_preferred())
                    || inner.grouplb.as_ref().is_some_and(|s| s.has_preferred())
            })
    }

    /// Required selectors with order-priority defer at the root.
    fn enforce_required(&self, selector: &hfs_types::Selector) -> bool {
        !(self.root_level && is_affinity_priority(selector))
    }

    fn check_agent_available(
        &self,
        ctx: &PreAllocatedContext,
        instance: &InstanceInfo,
        unit: &ResourceUnit,
    ) -> bool {
        if !ctx.check_node_feasible(&unit.owner_id) {
            debug!(
                request_id = %instance.request_id,
                unit_id = %unit.id,
                owner_id = %unit.owner_id,
                "agent filtered: node already unfeasible"
            );
            return false;
        }
        let affinity = ctx
            .plugin_context
            .get(hfs_types::LABEL_AFFINITY_PLUGIN)
            .and_then(|slot| slot.affinity.as_ref());
        if let Some(affinity) = affinity {
            if affinity.scheduled_result.get(&unit.id)
                == Some(&StatusCode::AffinityScheduleFailed)
            {
                debug!(
                    request_id = %instance.request_id,
                    unit_id = %unit.id,
                    "agent filtered: already infeasible on an underlayer"
                );
                return false;
            }
        }
        true
    }

    /// The hard-constraint pass. Returns false (and possibly tags the
    /// node) when the unit is out.
    fn perform_label_filter(
        &self,
        ctx: &mut PreAllocatedContext,
        instance: &InstanceInfo,
        affinity: &AffinityTree,
        unit: &ResourceUnit,
    ) -> bool {
        let unit_labels = merged_labels(
            &unit.node_labels,
            ctx.allocated_labels.get(&unit.id).unwrap_or(&LabelMap::new()),
        );

        if let Some(instance_affinity) = &affinity.instance {
            let node_scope = instance_affinity.scope == AffinityScope::Node;
            let labels: LabelMap = if node_scope {
                ctx.all_local_labels.get(&unit.owner_id).cloned().unwrap_or_default()
            } else {
                unit_labels.clone()
            };
            if !self.required_pass(&instance_affinity.selectors, &labels) {
                debug!(
                    request_id = %instance.request_id,
                    unit_id = %unit.id,
                    "instance affinity filtering failed"
                );
                if node_scope {
                    ctx.tag_node_unfeasible(unit.owner_id.clone());
                }
                return false;
            }
        }

        if let Some(resource_affinity) = &affinity.resource {
            if !self.required_pass(&resource_affinity.selectors, &unit.node_labels) {
                debug!(
                    request_id = %instance.request_id,
                    unit_id = %unit.id,
                    "resource affinity filtering failed"
                );
                return false;
            }
        }

        let Some(inner) = &affinity.inner else {
            return true;
        };

        // Pending: a unit satisfying the required selectors of a
        // pending resource is held back for that later instance.
        for pending in &inner.pending {
            let mut held = true;
            if let Some(selector) = &pending.required_affinity {
                held = held && required_affinity_pass(selector, &unit.node_labels);
            }
            if let Some(selector) = &pending.required_anti_affinity {
                held = held && required_anti_affinity_pass(selector, &unit.node_labels);
            }
            if held {
                debug!(
                    request_id = %instance.request_id,
                    unit_id = %unit.id,
                    "unit reserved for a pending instance"
                );
                return false;
            }
        }

        if let Some(rgroup) = &inner.rgroup {
            if let Some(selector) = &rgroup.required_affinity {
                if self.enforce_required(selector)
                    && !required_affinity_pass(selector, &unit.node_labels)
                {
                    return false;
                }
            }
        }

        if let Some(grouplb) = &inner.grouplb {
            if let Some(selector) = &grouplb.required_anti_affinity {
                if !required_anti_affinity_pass(selector, &unit_labels) {
                    debug!(
                        request_id = %instance.request_id,
                        unit_id = %unit.id,
                        "group spread anti-affinity rejected unit"
                    );
                    return false;
                }
            }
        }

        true
    }

    fn required_pass(&self, selectors: &ScopedSelectors, labels: &LabelMap) -> bool {
        if let Some(selector) = &selectors.required_affinity {
            if self.enforce_required(selector) && !required_affinity_pass(selector, labels) {
                return false;
            }
        }
        if let Some(selector) = &selectors.required_anti_affinity {
            if self.enforce_required(selector) && !required_anti_affinity_pass(selector, labels)
            {
                return false;
            }
        }
        true
    }

    /// Strict top-down mode: the unit must reach every selector's
    /// optimal score.
    fn score_is_optimal(
        &self,
        ctx: &PreAllocatedContext,
        affinity: &AffinityTree,
        unit: &ResourceUnit,
    ) -> bool {
        let unit_labels = merged_labels(
            &unit.node_labels,
            ctx.allocated_labels.get(&unit.id).unwrap_or(&LabelMap::new()),
        );
        let owner_labels =
            ctx.all_local_labels.get(&unit.owner_id).cloned().unwrap_or_default();

        if let Some(instance_affinity) = &affinity.instance {
            let labels = if instance_affinity.scope == AffinityScope::Node {
                &owner_labels
            } else {
                &unit_labels
            };
            if !selectors_optimal(&instance_affinity.selectors, labels) {
                return false;
            }
        }
        if let Some(resource_affinity) = &affinity.resource {
            if !selectors_optimal(&resource_affinity.selectors, &unit.node_labels) {
                return false;
            }
        }
        if let Some(inner) = &affinity.inner {
            if let Some(preempt) = &inner.preempt {
                if !preferred_optimal(preempt, &owner_labels) {
                    return false;
                }
            }
            if let Some(data) = &inner.data {
                if let Some(selector) = &data.preferred_affinity {
                    if !meets_optimal(selector, &unit.node_labels, false) {
                        return false;
                    }
                }
            }
            if let Some(grouplb) = &inner.grouplb {
                if !preferred_optimal(grouplb, &unit_labels) {
                    return false;
                }
            }
        }
        true
    }

    fn required_summary(affinity: &AffinityTree) -> String {
        let mut parts = Vec::new();
        if let Some(resource) = &affinity.resource {
            if let Some(selector) = &resource.selectors.required_affinity {
                parts.push(format!("resource aff {}", describe(selector)));
            }
            if let Some(selector) = &resource.selectors.required_anti_affinity {
                parts.push(format!("resource antiAff {}", describe(selector)));
            }
        }
        if let Some(instance) = &affinity.instance {
            if let Some(selector) = &instance.selectors.required_affinity {
                parts.push(format!("instance aff {}", describe(selector)));
            }
            if let Some(selector) = &instance.selectors.required_anti_affinity {
                parts.push(format!("instance antiAff {}", describe(selector)));
            }
        }
        parts.join(" ")
    }
}

fn selectors_optimal(selectors: &ScopedSelectors, labels: &LabelMap) -> bool {
    if let Some(selector) = &selectors.preferred_affinity {
        if !meets_optimal(selector, labels, false) {
            return false;
        }
    }
    if let Some(selector) = &selectors.preferred_anti_affinity {
        if !meets_optimal(selector, labels, true) {
            return false;
        }
    }
    if let Some(selector) = &selectors.required_affinity {
        if is_affinity_priority(selector) && !meets_optimal(selector, labels, false) {
            return false;
        }
    }
    if let Some(selector) = &selectors.required_anti_affinity {
        if is_affinity_priority(selector) && !meets_optimal(selector, labels, true) {
            return false;
        }
    }
    true
}

fn preferred_optimal(selectors: &ScopedSelectors, labels: &LabelMap) -> bool {
    if let Some(selector) = &selectors.preferred_affinity {
        if !meets_optimal(selector, labels, false) {
            return false;
        }
    }
    if let Some(selector) = &selectors.preferred_anti_affinity {
        if !meets_optimal(selector, labels, true) {
            return false;
        }
    }
    true
}

impl FilterPlugin for LabelAffinityFilter {
    fn name(&self) -> &'static str {
        match (self.relaxed, self.root_level) {
            (true, true) => names::RELAXED_ROOT_LABEL_AFFINITY_FILTER,
            (true, false) => names::RELAXED_NON_ROOT_LABEL_AFFINITY_FILTER,
            (false, true) => names::STRICT_ROOT_LABEL_AFFINITY_FILTER,
            (false, false) => names::STRICT_NON_ROOT_LABEL_AFFINITY_FILTER,
        }
    }

    fn filter(
        &self,
        ctx: &mut PreAllocatedContext,
        instance: &InstanceInfo,
        unit: &ResourceUnit,
    ) -> Filtered {
        let Some(affinity) = Self::affinity_of(instance).cloned() else {
            return Filtered::ok();
        };

        if !self.check_agent_available(ctx, instance, unit) {
            return Filtered::fail(
                StatusCode::AffinityScheduleFailed,
                "Affinity can't be Satisfied",
            )
            .with_required(Self::required_summary(&affinity));
        }

        if Self::needs_label_filter(&affinity)
            && !self.perform_label_filter(ctx, instance, &affinity, unit)
        {
            warn!(
                request_id = %instance.request_id,
                unit_id = %unit.id,
                "unit failed required affinity filter"
            );
            affinity_context(&mut ctx.plugin_context)
                .scheduled_result
                .insert(unit.id.clone(), StatusCode::AffinityScheduleFailed);
            return Filtered::fail(
                StatusCode::AffinityScheduleFailed,
                "Affinity can't be Satisfied",
            )
            .with_required(Self::required_summary(&affinity));
        }

        let top_down = ctx.is_top_down_scheduling();
        if !self.relaxed
            && top_down
            && Self::needs_affinity_scorer(&affinity)
            && !self.score_is_optimal(ctx, &affinity, unit)
        {
            warn!(
                request_id = %instance.request_id,
                unit_id = %unit.id,
                "unit misses the optimal preferred-affinity score"
            );
            return Filtered::fail(
                StatusCode::AffinityScheduleFailed,
                "Affinity can't be Satisfied",
            )
            .with_required(Self::required_summary(&affinity));
        }

        Filtered::ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hfs_types::plugin::affinity_context;
    use hfs_types::resource::ValueCounter;
    use hfs_types::{
        InstanceAffinity, LabelExpression, Resources, Selector, SubCondition,
    };

    fn unit(id: &str, labels: &[(&str, &str)]) -> ResourceUnit {
        let labels: LabelMap = labels
            .iter()
            .map(|(key, value)| (key.to_string(), ValueCounter::single(*value)))
            .collect();
        ResourceUnit::new(id)
            .with_capacity(Resources::cpu_mem(1000.0, 1024.0))
            .with_labels(labels)
            .with_owner("local-1")
    }

    fn exist_selector(priority: bool, keys: &[&str]) -> Selector {
        Selector::new(
            priority,
            keys.iter()
                .map(|key| SubCondition::new(vec![LabelExpression::exist(*key)]))
                .collect(),
        )
    }

    fn instance_with_required(priority: bool, keys: &[&str]) -> InstanceInfo {
        let mut instance = InstanceInfo {
            request_id: "req-1".into(),
            instance_id: "ins-1".into(),
            resources: Resources::cpu_mem(100.0, 128.0),
            ..Default::default()
        };
        instance.schedule_option.affinity = Some(AffinityTree {
            instance: Some(InstanceAffinity {
                scope: AffinityScope::Pod,
                selectors: ScopedSelectors {
                    required_affinity: Some(exist_selector(priority, keys)),
                    ..Default::default()
                },
            }),
            ..Default::default()
        });
        instance
    }

    fn agents() -> (ResourceUnit, ResourceUnit, ResourceUnit) {
        (
            unit("agent-1", &[("key1", "value1")]),
            unit("agent-2", &[("key2", "value2")]),
            unit("agent-3", &[("key3", "value3")]),
        )
    }

    #[test]
    fn strict_non_root_before_top_down_only_filters_required() {
        let filter = LabelAffinityFilter::new(false, false);
        let (agent1, agent2, agent3) = agents();
        let instance = instance_with_required(true, &["key1", "key2"]);
        let mut ctx = PreAllocatedContext::default();

        assert!(filter.filter(&mut ctx, &instance, &agent1).is_ok());
        assert!(filter.filter(&mut ctx, &instance, &agent2).is_ok());
        assert!(!filter.filter(&mut ctx, &instance, &agent3).is_ok());
    }

    #[test]
    fn strict_root_defers_priority_required() {
        let filter = LabelAffinityFilter::new(false, true);
        let (agent1, agent2, agent3) = agents();
        let instance = instance_with_required(true, &["key1", "key2"]);
        let mut ctx = PreAllocatedContext::default();

        assert!(filter.filter(&mut ctx, &instance, &agent1).is_ok());
        assert!(filter.filter(&mut ctx, &instance, &agent2).is_ok());
        assert!(filter.filter(&mut ctx, &instance, &agent3).is_ok());
    }

    #[test]
    fn strict_top_down_enforces_optimal_ranking() {
        let filter = LabelAffinityFilter::new(false, false);
        let (agent1, agent2, agent3) = agents();
        let instance = instance_with_required(true, &["key1", "key2"]);
        let mut ctx = PreAllocatedContext::default();
        affinity_context(&mut ctx.plugin_context).is_top_down_scheduling = true;

        assert!(filter.filter(&mut ctx, &instance, &agent1).is_ok());
        assert!(!filter.filter(&mut ctx, &instance, &agent2).is_ok());
        assert!(!filter.filter(&mut ctx, &instance, &agent3).is_ok());
    }

    #[test]
    fn relaxed_ignores_preferred_optimality() {
        let filter = LabelAffinityFilter::new(true, false);
        let (agent1, agent2, agent3) = agents();
        let mut instance = instance_with_required(true, &["key1", "key2"]);
        // add a preferred selector nobody satisfies optimally
        if let Some(affinity) = instance.schedule_option.affinity.as_mut() {
            affinity.instance.as_mut().unwrap().selectors.preferred_affinity =
                Some(exist_selector(true, &["key9"]));
        }
        let mut ctx = PreAllocatedContext::default();
        affinity_context(&mut ctx.plugin_context).is_top_down_scheduling = true;

        assert!(filter.filter(&mut ctx, &instance, &agent1).is_ok());
        assert!(filter.filter(&mut ctx, &instance, &agent2).is_ok());
        assert!(!filter.filter(&mut ctx, &instance, &agent3).is_ok());
    }

    #[test]
    fn failed_units_are_recorded_in_context() {
        let filter = LabelAffinityFilter::new(false, false);
        let (_, _, agent3) = agents();
        let instance = instance_with_required(false, &["key1", "key2"]);
        let mut ctx = PreAllocatedContext::default();

        let res = filter.filter(&mut ctx, &instance, &agent3);
        assert_eq!(res.status.code, StatusCode::AffinityScheduleFailed);
        assert!(!res.required.is_empty());
        assert_eq!(
            affinity_context(&mut ctx.plugin_context).scheduled_result["agent-3"],
            StatusCode::AffinityScheduleFailed
        );

        // and the verdict short-circuits the next pass
        let (agent1, _, _) = agents();
        assert!(filter.filter(&mut ctx, &instance, &agent1).is_ok());
        let res = filter.filter(&mut ctx, &instance, &agent3);
        assert!(!res.is_ok());
    }

    #[test]
    fn node_scope_uses_aggregated_local_labels() {
        let filter = LabelAffinityFilter::new(false, false);
        let mut instance = instance_with_required(false, &["key1"]);
        if let Some(affinity) = instance.schedule_option.affinity.as_mut() {
            affinity.instance.as_mut().unwrap().scope = AffinityScope::Node;
        }
        let agent = unit("agent-9", &[]);
        let mut ctx = PreAllocatedContext::default();
        ctx.all_local_labels.insert(
            "local-1".into(),
            [("other".to_string(), ValueCounter::single("v"))].into_iter().collect(),
        );

        let res = filter.filter(&mut ctx, &instance, &agent);
        assert!(!res.is_ok());
        // the whole node is now unfeasible
        assert!(!ctx.check_node_feasible("local-1"));
    }

    #[test]
    fn no_affinity_passes_untouched() {
        let filter = LabelAffinityFilter::new(false, false);
        let (agent1, _, _) = agents();
        let instance = InstanceInfo {
            resources: Resources::cpu_mem(100.0, 128.0),
            ..Default::default()
        };
        let mut ctx = PreAllocatedContext::default();
        let res = filter.filter(&mut ctx, &instance, &agent1);
        assert!(res.is_ok());
        assert_eq!(res.available_for_request, -1);
    }
}
